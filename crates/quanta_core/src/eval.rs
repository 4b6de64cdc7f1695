//! Reference evaluator: plain double-precision semantics, the ground truth
//! the fixed-point path is measured against.

use nalgebra::{DMatrix, Rotation3, Unit as Axis, Vector3};

use crate::error::{Error, Result};
use crate::holders::Disc;
use crate::instance::{DelayBuffer, Instance};
use crate::model::EquationSet;
use crate::node::{BinaryOp, Function, NodeId, Op, UnaryOp};
use crate::value::{bool_f64, truth, Matrix, Value};

impl EquationSet {
    /// Evaluates the subtree at `id`. Never touches analysis state; may
    /// consume per-instance state (random stream, delay history, holders).
    pub fn eval(&self, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let node = self.arena.node(id);
        match &node.op {
            Op::Constant(v) => Ok(v.clone()),
            Op::Variable(v) => Ok(instance.value(*v)),
            Op::Unary(op) => {
                let a = self.eval(node.operands[0], instance)?;
                match op {
                    UnaryOp::Negate => a.negate(),
                    UnaryOp::Not => a.map("!", |v| bool_f64(v == 0.0)),
                    UnaryOp::Transpose => a.transpose(),
                }
            }
            Op::Binary(op) => self.eval_binary(*op, node.operands[0], node.operands[1], instance),
            Op::Function(f) => self.eval_function(*f, id, instance),
        }
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        left: NodeId,
        right: NodeId,
        instance: &mut Instance,
    ) -> Result<Value> {
        let a = self.eval(left, instance)?;
        match op {
            BinaryOp::And if !a.is_true() => return Ok(truth(false)),
            BinaryOp::Or if a.is_true() => return Ok(truth(true)),
            _ => {}
        }
        let b = self.eval(right, instance)?;
        match op {
            BinaryOp::Add => a.add(&b),
            BinaryOp::Subtract => a.subtract(&b),
            BinaryOp::Multiply => a.multiply(&b),
            BinaryOp::MultiplyElementwise => a.multiply_elementwise(&b),
            BinaryOp::Divide => a.divide(&b),
            BinaryOp::Modulo => a.modulo(&b),
            BinaryOp::Power => a.power(&b),
            BinaryOp::And | BinaryOp::Or => Ok(truth(b.is_true())),
            BinaryOp::Equal => a.equal(&b),
            BinaryOp::NotEqual => a.not_equal(&b),
            BinaryOp::Less => a.zip(&b, "<", |x, y| bool_f64(x < y)),
            BinaryOp::LessEqual => a.zip(&b, "<=", |x, y| bool_f64(x <= y)),
            BinaryOp::Greater => a.zip(&b, ">", |x, y| bool_f64(x > y)),
            BinaryOp::GreaterEqual => a.zip(&b, ">=", |x, y| bool_f64(x >= y)),
        }
    }

    fn eval_operands(&self, id: NodeId, instance: &mut Instance) -> Result<Vec<Value>> {
        self.arena
            .operands(id)
            .iter()
            .map(|o| self.eval(*o, instance))
            .collect()
    }

    fn eval_keyword(
        &self,
        id: NodeId,
        key: &str,
        instance: &mut Instance,
    ) -> Result<Option<Value>> {
        match self.arena.keyword(id, key) {
            Some(k) => Ok(Some(self.eval(k, instance)?)),
            None => Ok(None),
        }
    }

    fn eval_function(&self, f: Function, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let name = f.name();
        match f {
            Function::Abs => self.unary(id, instance, name, f64::abs),
            Function::Signum => self.unary(id, instance, name, |v| {
                if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }),
            Function::Round => self.unary(id, instance, name, f64::round),
            Function::Floor => self.unary(id, instance, name, f64::floor),
            Function::Ceil => self.unary(id, instance, name, f64::ceil),
            Function::Sin => self.unary(id, instance, name, f64::sin),
            Function::Cos => self.unary(id, instance, name, f64::cos),
            Function::Tan => self.unary(id, instance, name, f64::tan),
            Function::Tanh => self.unary(id, instance, name, f64::tanh),
            Function::Exp => self.unary(id, instance, name, f64::exp),
            Function::Log => self.unary(id, instance, name, f64::ln),
            Function::Sqrt => self.unary(id, instance, name, f64::sqrt),
            Function::Atan => {
                let args = self.eval_operands(id, instance)?;
                match args.as_slice() {
                    [y] => y.map(name, f64::atan),
                    [y, x] => y.zip(x, name, f64::atan2),
                    _ => Err(arity(name, "1 to 2", args.len())),
                }
            }
            Function::Max | Function::Min => {
                let args = self.eval_operands(id, instance)?;
                let pick: fn(f64, f64) -> f64 = if f == Function::Max {
                    f64::max
                } else {
                    f64::min
                };
                let mut iter = args.into_iter();
                let first = iter.next().ok_or_else(|| arity(name, "at least 1", 0))?;
                iter.try_fold(first, |acc, v| acc.zip(&v, name, pick))
            }
            Function::Clamp => {
                let args = self.eval_operands(id, instance)?;
                let (v, lo, hi) = match args.as_slice() {
                    [v] => (v.clone(), Value::Scalar(-1.0), Value::Scalar(1.0)),
                    [v, m] => (v.clone(), m.negate()?, m.clone()),
                    [v, lo, hi] => (v.clone(), lo.clone(), hi.clone()),
                    _ => return Err(arity(name, "1 to 3", args.len())),
                };
                v.zip(&lo, name, f64::max)?.zip(&hi, name, f64::min)
            }
            Function::Norm => {
                let args = self.eval_operands(id, instance)?;
                let n = match args.get(1) {
                    Some(n) => n.scalar(name)?,
                    None => 2.0,
                };
                match &args[0] {
                    Value::Scalar(v) => Ok(Value::Scalar(v.abs())),
                    Value::Matrix(m) => Ok(Value::Scalar(m.norm(n))),
                    other => Err(Error::type_mismatch(name, other.kind_name())),
                }
            }
            Function::Rows | Function::Columns => {
                let a = self.eval(self.arena.operands(id)[0], instance)?;
                match a {
                    Value::Scalar(_) => Ok(Value::Scalar(1.0)),
                    Value::Matrix(m) => {
                        let n = if f == Function::Rows { m.rows() } else { m.columns() };
                        Ok(Value::Scalar(n as f64))
                    }
                    other => Err(Error::type_mismatch(name, other.kind_name())),
                }
            }
            Function::Rotate => {
                let args = self.eval_operands(id, instance)?;
                let angle = args[0].scalar(name)?;
                let axis = Vector3::new(
                    args[1].scalar(name)?,
                    args[2].scalar(name)?,
                    args[3].scalar(name)?,
                );
                Ok(Value::Matrix(Matrix::Dense(rotation(angle, axis))))
            }
            Function::Uniform => {
                let args = self.eval_operands(id, instance)?;
                match args.as_slice() {
                    [] => Ok(Value::Scalar(instance.uniform())),
                    [hi] => draw_each(hi, name, instance, |inst, h| h * inst.uniform()),
                    [lo, hi] => {
                        let lo = lo.scalar(name)?;
                        let hi = hi.scalar(name)?;
                        Ok(Value::Scalar(lo + (hi - lo) * instance.uniform()))
                    }
                    _ => Err(arity(name, "0 to 2", args.len())),
                }
            }
            Function::Gaussian => {
                let args = self.eval_operands(id, instance)?;
                match args.first() {
                    None => Ok(Value::Scalar(instance.gaussian())),
                    Some(sigma) => draw_each(sigma, name, instance, |inst, s| s * inst.gaussian()),
                }
            }
            Function::Delay => self.eval_delay(id, instance),
            Function::Input => self.eval_input(id, instance),
            Function::Output => self.eval_output(id, instance),
            Function::ReadMatrix => self.eval_read_matrix(id, instance),
            Function::Draw => self.eval_draw(id, instance),
        }
    }

    fn unary(
        &self,
        id: NodeId,
        instance: &mut Instance,
        name: &str,
        f: impl Fn(f64) -> f64,
    ) -> Result<Value> {
        let a = self.eval(self.arena.operands(id)[0], instance)?;
        a.map(name, f)
    }

    fn eval_delay(&self, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let operands = self.arena.operands(id);
        let value = self.eval(operands[0], instance)?;
        let step = instance.step_size();
        let lag = match operands.get(1) {
            Some(d) => self.eval(*d, instance)?.scalar("delay")?,
            None => step,
        };
        let default = match operands.get(2) {
            Some(d) => self.eval(*d, instance)?,
            None => Value::Scalar(0.0),
        };
        let time = instance.time();
        let buffer = instance.delays.entry(id).or_insert_with(DelayBuffer::default);
        Ok(buffer
            .exchange(time, lag, value, step.abs() * 1e-6)
            .unwrap_or(default))
    }

    fn eval_input(&self, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let args = self.eval_operands(id, instance)?;
        let path = text_operand(&args[0], "input")?;
        let by_time = self
            .eval_keyword(id, "time", instance)?
            .map(|v| v.is_true())
            .unwrap_or(false);
        let holder = instance.holders.input(path)?;

        let position = args[1].scalar("input")?;
        let row = if by_time {
            holder.row_at_time(position)
        } else {
            holder.row(position.max(0.0).floor() as usize)
        };
        let offset = usize::from(by_time);
        let column = match &args[2] {
            Value::Text(name) => holder.column_index(name),
            Value::Scalar(c) if c.is_finite() => (c.max(0.0).floor() as usize).checked_add(offset),
            // Missing column.
            Value::Scalar(_) => None,
            other => return Err(Error::type_mismatch("input", other.kind_name())),
        };
        let value = match (row, column) {
            (Some(row), Some(c)) => row.get(c).copied().unwrap_or(0.0),
            _ => 0.0,
        };
        Ok(Value::Scalar(value))
    }

    fn eval_output(&self, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let args = self.eval_operands(id, instance)?;
        let path = text_operand(&args[0], "output")?;
        let column = match args.get(2) {
            Some(Value::Text(c)) => c.clone(),
            Some(other) => other.to_string(),
            None => format!("column{}", id.0),
        };
        let time = instance.time();
        let holder = instance.holders.output(path)?;
        let mut holder = holder.borrow_mut();
        match &args[1] {
            Value::Scalar(v) => holder.trace(time, &column, *v),
            Value::Matrix(m) => {
                for r in 0..m.rows() {
                    for c in 0..m.columns() {
                        holder.trace(time, &format!("{column}({r},{c})"), m.get(r, c));
                    }
                }
            }
            other => return Err(Error::type_mismatch("output", other.kind_name())),
        }
        Ok(args[1].clone())
    }

    fn eval_read_matrix(&self, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let args = self.eval_operands(id, instance)?;
        let path = text_operand(&args[0], "matrix")?;
        let matrix = instance.holders.matrix(path)?;
        match args.as_slice() {
            [_] => Ok(Value::Matrix((*matrix).clone())),
            [_, row, column] => {
                let r = row.scalar("matrix")?.max(0.0).floor() as usize;
                let c = column.scalar("matrix")?.max(0.0).floor() as usize;
                Ok(Value::Scalar(matrix.get(r, c)))
            }
            _ => Err(arity("matrix", "1 or 3", args.len())),
        }
    }

    fn eval_draw(&self, id: NodeId, instance: &mut Instance) -> Result<Value> {
        let args = self.eval_operands(id, instance)?;
        let path = text_operand(&args[0], "draw")?;
        let mut options = Vec::new();
        for key in ["width", "height", "clear", "hold", "raw"] {
            if let Some(v) = self.eval_keyword(id, key, instance)? {
                options.push((key, v));
            }
        }
        let time = instance.time();
        let canvas = instance.holders.canvas(path)?;
        let mut canvas = canvas.borrow_mut();
        for (key, v) in options {
            match key {
                "width" => canvas.width = v.scalar("draw")?.max(1.0) as usize,
                "height" => canvas.height = v.scalar("draw")?.max(1.0) as usize,
                "clear" => canvas.clear = v.scalar("draw")?.max(0.0) as u32,
                "hold" => canvas.hold = v.is_true(),
                _ => canvas.raw = v.is_true(),
            }
        }
        let radius = match args.get(3) {
            Some(r) => r.scalar("draw")?,
            None if canvas.raw => 1.0,
            None => 1.0 / canvas.width as f64,
        };
        let disc = Disc {
            x: args[1].scalar("draw")?,
            y: args[2].scalar("draw")?,
            radius,
        };
        canvas.draw_disc(time, disc);
        Ok(Value::Scalar(0.0))
    }
}

fn arity(name: &str, expected: &str, found: usize) -> Error {
    Error::Arity {
        name: name.to_string(),
        expected: expected.to_string(),
        found,
    }
}

fn text_operand<'a>(value: &'a Value, op: &str) -> Result<&'a str> {
    value
        .as_text()
        .ok_or_else(|| Error::type_mismatch(op, value.kind_name()))
}

/// Independent draw per element of `scale`.
fn draw_each(
    scale: &Value,
    op: &str,
    instance: &mut Instance,
    mut draw: impl FnMut(&mut Instance, f64) -> f64,
) -> Result<Value> {
    match scale {
        Value::Scalar(s) => Ok(Value::Scalar(draw(instance, *s))),
        Value::Matrix(m) => Ok(Value::Matrix(Matrix::Dense(DMatrix::from_fn(
            m.rows(),
            m.columns(),
            |r, c| draw(instance, m.get(r, c)),
        )))),
        Value::Text(_) => Err(Error::type_mismatch(op, "text")),
    }
}

/// 4x4 homogeneous rotation of `angle` radians about `axis`.
pub(crate) fn rotation(angle: f64, axis: Vector3<f64>) -> DMatrix<f64> {
    if axis.norm() == 0.0 {
        return DMatrix::identity(4, 4);
    }
    let r = Rotation3::from_axis_angle(&Axis::new_normalize(axis), angle).to_homogeneous();
    DMatrix::from_column_slice(4, 4, r.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_into;
    use std::f64::consts::FRAC_PI_4;
    use std::fs;

    fn eval_text(text: &str) -> Result<Value> {
        let mut set = EquationSet::new("m");
        let root = parse_into(&mut set, text)?;
        let mut instance = Instance::new(&set, 1);
        set.eval(root, &mut instance)
    }

    fn scalar(text: &str) -> f64 {
        eval_text(text)
            .expect("evaluation should succeed")
            .as_scalar()
            .expect("scalar result")
    }

    #[test]
    fn atan_one_and_two_operand_forms() {
        assert!((scalar("atan(1, 1)") - FRAC_PI_4).abs() < 1e-15);
        assert!((scalar("atan(1)") - FRAC_PI_4).abs() < 1e-15);
        assert!((scalar("atan(1, -1)") - 3.0 * FRAC_PI_4).abs() < 1e-15);
    }

    #[test]
    fn arithmetic_and_logic() {
        assert_eq!(scalar("1 + 2 * 3"), 7.0);
        assert_eq!(scalar("7 % 3"), 1.0);
        assert_eq!(scalar("-7 % 3"), 2.0);
        assert_eq!(scalar("2 < 3 && 3 <= 3"), 1.0);
        assert_eq!(scalar("!(1 > 2) || 0"), 1.0);
        assert_eq!(scalar("max(1, 5, 3)"), 5.0);
        assert_eq!(scalar("min(4, -2)"), -2.0);
        assert_eq!(scalar("sgn(-3)"), -1.0);
        assert_eq!(scalar("sgn(0)"), 0.0);
    }

    #[test]
    fn clamp_forms() {
        assert_eq!(scalar("clamp(3)"), 1.0);
        assert_eq!(scalar("clamp(-3, 2)"), -2.0);
        assert_eq!(scalar("clamp(5, 0, 4)"), 4.0);
    }

    #[test]
    fn matrix_functions_operate_elementwise() {
        let v = eval_text("abs([-1, 2; -3, 4])").expect("abs");
        assert_eq!(v.as_matrix().map(|m| m.get(1, 0)), Some(3.0));
        assert_eq!(scalar("rows([1,2;3,4;5,6])"), 3.0);
        assert_eq!(scalar("columns([1,2;3,4;5,6])"), 2.0);
        assert!((scalar("norm([3, 4])") - 5.0).abs() < 1e-12);
        let t = eval_text("[1,2]'").expect("transpose");
        assert_eq!(t.as_matrix().map(|m| m.shape()), Some((2, 1)));
    }

    #[test]
    fn unsupported_operand_kinds_are_type_mismatches() {
        let err = eval_text("tanh(\"x\")").expect_err("text operand");
        assert!(matches!(err, Error::TypeMismatch { .. }));
        let err = eval_text("rows(\"x\")").expect_err("text operand");
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn rotate_builds_homogeneous_matrix() {
        let v = eval_text("rotate(1.5707963267948966, 0, 0, 1)").expect("rotate");
        let m = v.as_matrix().expect("matrix");
        assert_eq!(m.shape(), (4, 4));
        assert!((m.get(1, 0) - 1.0).abs() < 1e-12);
        assert!((m.get(3, 3) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn random_draws_are_seeded_and_scaled() {
        let u = scalar("uniform(2, 3)");
        assert!((2.0..3.0).contains(&u));
        assert_eq!(scalar("gaussian(0)"), 0.0);
        let a = eval_text("gaussian()").expect("draw");
        let b = eval_text("gaussian()").expect("draw");
        assert_eq!(a, b);
    }

    #[test]
    fn timed_delay_uses_history() {
        let mut set = EquationSet::new("m");
        let y = set.add_equation("y", "delay($t, 2, -1)").expect("parse");
        let mut instance = Instance::new(&set, 0);
        let mut seen = Vec::new();
        for _ in 0..4 {
            instance.step(&set).expect("step");
            seen.push(instance.value(y).as_scalar().expect("scalar"));
        }
        assert_eq!(seen, vec![-1.0, -1.0, 0.0, 1.0]);
    }

    #[test]
    fn io_functions_share_holders_by_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.csv");
        fs::write(&input, "time, a\n0, 10\n1, 20\n").expect("write");
        let output = dir.path().join("out.tsv");

        let mut set = EquationSet::new("m");
        let expr = format!(
            "output(\"{}\", input(\"{}\", $t, \"a\", time=1), \"a\")",
            output.display(),
            input.display()
        );
        let y = set.add_equation("y", &expr).expect("parse");
        let mut instance = Instance::new(&set, 0);
        instance.step(&set).expect("step");
        instance.step(&set).expect("step");
        assert_eq!(instance.value(y), Value::Scalar(20.0));
        instance.close().expect("flush");

        let written = fs::read_to_string(&output).expect("output written");
        assert_eq!(written, "$t\ta\n0\t10\n1\t20\n");

        let conflict = format!("matrix(\"{}\")", output.display());
        let root = parse_into(&mut set, &conflict).expect("parse");
        let err = set.eval(root, &mut instance).expect_err("kind conflict");
        assert!(matches!(err, Error::ResourceConflict { .. }));
    }

    #[test]
    fn out_of_range_input_columns_read_as_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.csv");
        fs::write(&input, "0, 10\n1, 20\n").expect("write");
        let path = input.display();

        assert_eq!(scalar(&format!("input(\"{path}\", 0, 1e300, time=1)")), 0.0);
        assert_eq!(scalar(&format!("input(\"{path}\", 0, 1e300)")), 0.0);
        assert_eq!(scalar(&format!("input(\"{path}\", 1, -5)")), 1.0);
        assert_eq!(scalar(&format!("input(\"{path}\", 1, 0, time=1)")), 20.0);
    }

    #[test]
    fn draw_records_discs_with_keywords() {
        let mut set = EquationSet::new("m");
        set.add_equation("d", "draw(\"frames\", 10, 20, 2, raw=1, width=64)")
            .expect("parse");
        let mut instance = Instance::new(&set, 0);
        instance.step(&set).expect("step");
        let canvas = instance.holders.canvas("frames").expect("canvas");
        let canvas = canvas.borrow();
        assert_eq!(canvas.width, 64);
        assert_eq!(canvas.frames.len(), 1);
        assert_eq!(canvas.frames[0].discs[0].x, 10.0);
    }
}

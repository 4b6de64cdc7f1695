//! Physical dimensions and the bottom-up unit propagation pass.
//!
//! Unit tracking is advisory: conflicts only abort when the caller asks for
//! strict checking, otherwise they are logged and the offending node falls
//! back to dimensionless.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Div, Mul};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::EquationSet;
use crate::node::{BinaryOp, Function, NodeId, Op, UnaryOp};

/// Product of base dimensions raised to integer powers. The empty map is
/// dimensionless.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    dims: BTreeMap<String, i32>,
}

impl Unit {
    pub fn dimensionless() -> Self {
        Self::default()
    }

    pub fn base(name: &str) -> Self {
        let mut dims = BTreeMap::new();
        dims.insert(name.to_string(), 1);
        Self { dims }
    }

    /// Parses `kg*m^2/s^2` style text. `1` (or empty text) is dimensionless.
    pub fn parse(text: &str) -> Result<Self> {
        let mut unit = Unit::dimensionless();
        let mut sign = 1;
        let mut factor = String::new();
        let flush = |factor: &mut String, sign: i32, unit: &mut Unit| -> Result<()> {
            let f = factor.trim();
            if !f.is_empty() && f != "1" {
                let (name, power) = match f.split_once('^') {
                    Some((name, power)) => {
                        let power: i32 = power
                            .trim()
                            .parse()
                            .map_err(|_| Error::Parse(format!("bad unit power in {f}")))?;
                        (name.trim(), power)
                    }
                    None => (f, 1),
                };
                if !name.chars().all(|c| c.is_alphabetic() || c == '_') || name.is_empty() {
                    return Err(Error::Parse(format!("bad unit name {name:?}")));
                }
                *unit = &*unit * &Unit::base(name).powi(power * sign);
            }
            factor.clear();
            Ok(())
        };
        for c in text.chars() {
            match c {
                '*' => {
                    flush(&mut factor, sign, &mut unit)?;
                    sign = 1;
                }
                '/' => {
                    flush(&mut factor, sign, &mut unit)?;
                    sign = -1;
                }
                _ => factor.push(c),
            }
        }
        flush(&mut factor, sign, &mut unit)?;
        Ok(unit)
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn powi(&self, n: i32) -> Unit {
        let dims = self
            .dims
            .iter()
            .map(|(k, v)| (k.clone(), v * n))
            .filter(|(_, v)| *v != 0)
            .collect();
        Unit { dims }
    }

    /// Square root, defined only when every power is even.
    pub fn sqrt(&self) -> Option<Unit> {
        if self.dims.values().any(|v| v % 2 != 0) {
            return None;
        }
        Some(Unit {
            dims: self.dims.iter().map(|(k, v)| (k.clone(), v / 2)).collect(),
        })
    }

    fn combine(&self, other: &Unit, sign: i32) -> Unit {
        let mut dims = self.dims.clone();
        for (k, v) in &other.dims {
            *dims.entry(k.clone()).or_insert(0) += v * sign;
        }
        dims.retain(|_, v| *v != 0);
        Unit { dims }
    }
}

impl Mul for &Unit {
    type Output = Unit;
    fn mul(self, rhs: &Unit) -> Unit {
        self.combine(rhs, 1)
    }
}

impl Div for &Unit {
    type Output = Unit;
    fn div(self, rhs: &Unit) -> Unit {
        self.combine(rhs, -1)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "1");
        }
        let mut first = true;
        for (name, power) in &self.dims {
            if !first {
                write!(f, "*")?;
            }
            first = false;
            if *power == 1 {
                write!(f, "{name}")?;
            } else {
                write!(f, "{name}^{power}")?;
            }
        }
        Ok(())
    }
}

/// Joins two operand units of a unit-sensitive operator. Unknown and
/// dimensionless operands are compatible with anything.
fn reconcile(op: &str, a: Option<Unit>, b: Option<Unit>, fatal: bool) -> Result<Option<Unit>> {
    match (a, b) {
        (None, other) | (other, None) => Ok(other),
        (Some(a), Some(b)) => {
            if a.is_dimensionless() {
                Ok(Some(b))
            } else if b.is_dimensionless() || a == b {
                Ok(Some(a))
            } else if fatal {
                Err(Error::UnitMismatch {
                    op: op.to_string(),
                    left: a.to_string(),
                    right: b.to_string(),
                })
            } else {
                warn!(op, left = %a, right = %b, "incompatible units; assuming dimensionless");
                Ok(Some(Unit::dimensionless()))
            }
        }
    }
}

impl EquationSet {
    pub fn set_unit(&mut self, id: NodeId, unit: Option<Unit>) {
        self.arena.node_mut(id).unit = unit;
    }

    /// Bottom-up unit propagation for the subtree at `id`.
    pub fn determine_unit(&mut self, id: NodeId, fatal: bool) -> Result<()> {
        for child in self.arena.children(id) {
            self.determine_unit(child, fatal)?;
        }

        let operand_units: Vec<Option<Unit>> = self
            .arena
            .operands(id)
            .iter()
            .map(|o| self.arena.node(*o).unit.clone())
            .collect();
        let first = operand_units.first().cloned().flatten();
        let op = self.arena.node(id).op.clone();

        let unit = match op {
            Op::Constant(_) => self
                .arena
                .node(id)
                .unit
                .clone()
                .or_else(|| Some(Unit::dimensionless())),
            Op::Variable(v) => self.variable(v).unit.clone(),
            Op::Unary(UnaryOp::Not) => Some(Unit::dimensionless()),
            Op::Unary(UnaryOp::Negate) | Op::Unary(UnaryOp::Transpose) => first,
            Op::Binary(b) => {
                let left = operand_units[0].clone();
                let right = operand_units[1].clone();
                match b {
                    BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Modulo => {
                        reconcile(b.symbol(), left, right, fatal)?
                    }
                    BinaryOp::Multiply | BinaryOp::MultiplyElementwise => match (left, right) {
                        (Some(l), Some(r)) => Some(&l * &r),
                        _ => None,
                    },
                    BinaryOp::Divide => match (left, right) {
                        (Some(l), Some(r)) => Some(&l / &r),
                        _ => None,
                    },
                    BinaryOp::Power => {
                        let exponent = self.arena.scalar_constant(self.arena.operands(id)[1]);
                        power_unit(left, exponent)
                    }
                    _ => {
                        if let (Some(l), Some(r)) = (&left, &right) {
                            if !l.is_dimensionless() && !r.is_dimensionless() && l != r {
                                debug!(op = b.symbol(), left = %l, right = %r, "comparing mixed units");
                            }
                        }
                        Some(Unit::dimensionless())
                    }
                }
            }
            Op::Function(f) => match f {
                Function::Sin
                | Function::Cos
                | Function::Tan
                | Function::Tanh
                | Function::Atan
                | Function::Exp
                | Function::Log
                | Function::Signum
                | Function::Rows
                | Function::Columns
                | Function::Rotate
                | Function::Uniform
                | Function::Gaussian
                | Function::Draw => Some(Unit::dimensionless()),
                Function::Abs
                | Function::Round
                | Function::Floor
                | Function::Ceil
                | Function::Delay
                | Function::Norm => first,
                Function::Output => operand_units[1].clone(),
                Function::Input | Function::ReadMatrix => None,
                Function::Sqrt => match first {
                    Some(u) => match u.sqrt() {
                        Some(root) => Some(root),
                        None => {
                            warn!(unit = %u, "square root of odd unit power; assuming dimensionless");
                            Some(Unit::dimensionless())
                        }
                    },
                    None => None,
                },
                Function::Max | Function::Min | Function::Clamp => {
                    let mut acc = None;
                    for u in operand_units {
                        acc = reconcile(f.name(), acc, u, fatal)?;
                    }
                    acc
                }
            },
        };

        self.arena.node_mut(id).unit = unit;
        Ok(())
    }

    /// Runs unit propagation over every equation. Variables without a
    /// declared unit adopt the unit of their expressions; declared units are
    /// checked against them.
    pub fn determine_units(&mut self, fatal: bool) -> Result<()> {
        let mut passes = 0;
        loop {
            let mut inferred = false;
            for index in 0..self.variables.len() {
                let equations = self.variables[index].equations.clone();
                for equation in equations {
                    if let Some(condition) = equation.condition {
                        self.determine_unit(condition, fatal)?;
                    }
                    self.determine_unit(equation.expression, fatal)?;
                    let found = self.arena.node(equation.expression).unit.clone();
                    let declared = self.variables[index].unit.clone();
                    let name = self.variables[index].name.clone();
                    match (declared, found) {
                        (None, Some(found)) => {
                            self.variables[index].unit = Some(found);
                            inferred = true;
                        }
                        (Some(declared), found) => {
                            reconcile(&name, Some(declared), found, fatal)?;
                        }
                        (None, None) => {}
                    }
                }
            }
            passes += 1;
            if !inferred || passes > self.variables.len() {
                break;
            }
        }
        Ok(())
    }
}

fn power_unit(base: Option<Unit>, exponent: Option<f64>) -> Option<Unit> {
    let base = base?;
    if base.is_dimensionless() {
        return Some(base);
    }
    match exponent {
        Some(e) if e.fract() == 0.0 => Some(base.powi(e as i32)),
        _ => {
            warn!(unit = %base, "non-integer power of a dimensioned value; assuming dimensionless");
            Some(Unit::dimensionless())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_into;

    fn unit(text: &str) -> Unit {
        Unit::parse(text).expect("unit should parse")
    }

    #[test]
    fn parses_and_combines_units() {
        let force = unit("kg*m/s^2");
        assert_eq!(force.to_string(), "kg*m*s^-2");
        let energy = &force * &unit("m");
        assert_eq!(energy, unit("kg*m^2/s^2"));
        assert!((&energy / &energy).is_dimensionless());
        assert!(unit("1").is_dimensionless());
        assert!(Unit::parse("m^x").is_err());
    }

    #[test]
    fn addition_requires_matching_units() {
        let mut set = EquationSet::new("m");
        let root = parse_into(&mut set, "a + b").expect("parse");
        let a = set.find("a").expect("a");
        let b = set.find("b").expect("b");
        set.variable_mut(a).unit = Some(unit("m"));
        set.variable_mut(b).unit = Some(unit("s"));

        let err = set.determine_unit(root, true).expect_err("strict mismatch");
        assert!(matches!(err, Error::UnitMismatch { .. }));

        set.determine_unit(root, false).expect("lenient mismatch");
        assert_eq!(set.arena.node(root).unit(), Some(&Unit::dimensionless()));
    }

    #[test]
    fn products_and_powers_track_dimensions() {
        let mut set = EquationSet::new("m");
        let root = parse_into(&mut set, "sqrt(a^2 * b / b)").expect("parse");
        let a = set.find("a").expect("a");
        let b = set.find("b").expect("b");
        set.variable_mut(a).unit = Some(unit("m"));
        set.variable_mut(b).unit = Some(unit("s"));
        set.determine_unit(root, true).expect("units");
        assert_eq!(set.arena.node(root).unit(), Some(&unit("m")));
    }

    #[test]
    fn unit_erasing_functions_never_raise() {
        for text in [
            "sin(a)", "cos(a)", "tan(a)", "tanh(a)", "atan(a, b)", "exp(a)", "log(a)",
            "a == b", "a < b", "a >= b", "a != b",
        ] {
            let mut set = EquationSet::new("m");
            let root = parse_into(&mut set, text).expect("parse");
            let a = set.find("a").expect("a");
            set.variable_mut(a).unit = Some(unit("m"));
            if let Some(b) = set.find("b") {
                set.variable_mut(b).unit = Some(unit("kg"));
            }
            set.determine_unit(root, true)
                .unwrap_or_else(|e| panic!("{text} raised {e}"));
            assert_eq!(set.arena.node(root).unit(), Some(&Unit::dimensionless()), "{text}");
        }
    }

    #[test]
    fn variables_adopt_inferred_units() {
        let mut set = EquationSet::new("m");
        let x = set.add_equation("x", "d / t").expect("parse");
        let y = set.add_equation("y", "x * t").expect("parse");
        let d = set.find("d").expect("d");
        let t = set.find("t").expect("t");
        set.variable_mut(d).unit = Some(unit("m"));
        set.variable_mut(t).unit = Some(unit("s"));
        set.determine_units(true).expect("units");
        assert_eq!(set.variable(x).unit, Some(unit("m/s")));
        assert_eq!(set.variable(y).unit, Some(unit("m")));
    }

    #[test]
    fn declared_units_are_checked() {
        let mut set = EquationSet::new("m");
        let x = set.add_equation("x", "d").expect("parse");
        let d = set.find("d").expect("d");
        set.variable_mut(d).unit = Some(unit("m"));
        set.variable_mut(x).unit = Some(unit("s"));
        assert!(set.determine_units(true).is_err());
        assert!(set.determine_units(false).is_ok());
    }
}

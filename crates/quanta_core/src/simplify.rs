//! Algebraic simplification: constant folding, identity elimination,
//! canonical forms for `max`/`min`/`clamp`, and lowering of one-cycle delays
//! into state variables.

use tracing::debug;

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::model::{Equation, EquationSet, VariableId};
use crate::node::{BinaryOp, Function, NodeId, Op, UnaryOp};
use crate::value::Value;

impl EquationSet {
    /// Simplifies the subtree at `id` on behalf of variable `from` and returns
    /// the node that should take its place (possibly `id` itself). Children
    /// are rewritten in place; storing the returned root is up to the caller.
    ///
    /// With `eval_only` set, rewrites that change the topology seen by code
    /// generation (delay lowering, clamp normalization) are skipped.
    pub fn simplify(&mut self, id: NodeId, from: VariableId, eval_only: bool) -> Result<NodeId> {
        for child in self.arena.children(id) {
            let replacement = self.simplify(child, from, eval_only)?;
            if replacement != child {
                self.arena.replace(child, replacement);
            }
        }

        if let Some(folded) = self.fold_constant(id, from)? {
            return Ok(folded);
        }
        if let Some(operand) = self.eliminate_identity(id, from)? {
            return Ok(operand);
        }

        match self.arena.node(id).function() {
            Some(Function::Max | Function::Min) => self.flatten(id, from)?,
            Some(Function::Clamp) if !eval_only => self.normalize_clamp(id, from)?,
            Some(Function::Delay) if !eval_only && self.arena.operands(id).len() == 1 => {
                return self.lower_delay(id, from);
            }
            _ => {}
        }
        Ok(id)
    }

    /// Simplifies every equation and condition of every variable.
    pub fn simplify_all(&mut self, eval_only: bool) -> Result<()> {
        let count = self.variables.len();
        for index in 0..count {
            let from = VariableId(index);
            for slot in 0..self.variables[index].equations.len() {
                let Equation {
                    condition,
                    expression,
                } = self.variables[index].equations[slot];
                if let Some(condition) = condition {
                    let simplified = self.simplify(condition, from, eval_only)?;
                    self.arena.replace(condition, simplified);
                    self.variables[index].equations[slot].condition = Some(simplified);
                }
                let simplified = self.simplify(expression, from, eval_only)?;
                self.arena.replace(expression, simplified);
                self.variables[index].equations[slot].expression = simplified;
            }
        }
        let changed = self.variables.iter().filter(|v| v.changed).count();
        debug!(set = %self.name, changed, hidden = self.variables.len() - count, "simplified");
        Ok(())
    }

    fn rewrite(&mut self, from: VariableId) -> Result<()> {
        if self.frozen {
            return Err(Error::Frozen);
        }
        self.variables[from.0].changed = true;
        Ok(())
    }

    fn fold_constant(&mut self, id: NodeId, from: VariableId) -> Result<Option<NodeId>> {
        let node = self.arena.node(id);
        let pure = match &node.op {
            Op::Constant(_) | Op::Variable(_) => false,
            Op::Unary(_) | Op::Binary(_) => true,
            Op::Function(f) => !f.has_side_effects(),
        };
        if !pure || !self.arena.children(id).iter().all(|c| self.arena.is_constant(*c)) {
            return Ok(None);
        }
        let value = self.eval(id, &mut Instance::scratch())?;
        self.rewrite(from)?;
        Ok(Some(self.arena.constant(value)))
    }

    fn eliminate_identity(&mut self, id: NodeId, from: VariableId) -> Result<Option<NodeId>> {
        let node = self.arena.node(id);
        let operands = &node.operands;
        let is = |operand: NodeId, value: f64| self.arena.scalar_constant(operand) == Some(value);

        let zero_draw = node.function() == Some(Function::Gaussian)
            && operands.len() == 1
            && is(operands[0], 0.0);
        let operand = match &node.op {
            Op::Binary(op) => {
                let (a, b) = (operands[0], operands[1]);
                let kept = match op {
                    BinaryOp::Power | BinaryOp::Divide if is(b, 1.0) => Some(a),
                    BinaryOp::Multiply if is(b, 1.0) => Some(a),
                    BinaryOp::Multiply if is(a, 1.0) => Some(b),
                    BinaryOp::Add | BinaryOp::Subtract if is(b, 0.0) => Some(a),
                    BinaryOp::Add if is(a, 0.0) => Some(b),
                    _ => None,
                };
                // Text concatenates with `+` and fails every other operator.
                kept.filter(|k| !self.may_be_text(*k, &mut Vec::new()))
            }
            Op::Unary(UnaryOp::Negate) => {
                let inner = self.arena.node(operands[0]);
                match inner.op {
                    Op::Unary(UnaryOp::Negate) => Some(inner.operands[0]),
                    _ => None,
                }
            }
            _ => None,
        };

        if zero_draw {
            self.rewrite(from)?;
            return Ok(Some(self.arena.constant(0.0)));
        }
        if operand.is_some() {
            self.rewrite(from)?;
        }
        Ok(operand)
    }

    /// Whether the subtree at `id` can evaluate to text. Variables without
    /// equations start at zero.
    fn may_be_text(&self, id: NodeId, visited: &mut Vec<VariableId>) -> bool {
        let node = self.arena.node(id);
        match &node.op {
            Op::Constant(v) => matches!(v, Value::Text(_)),
            Op::Variable(v) => {
                if visited.contains(v) {
                    return false;
                }
                visited.push(*v);
                self.variable(*v)
                    .equations
                    .iter()
                    .any(|e| self.may_be_text(e.expression, visited))
            }
            Op::Binary(BinaryOp::Add) => {
                node.operands.iter().any(|o| self.may_be_text(*o, visited))
            }
            Op::Unary(_) | Op::Binary(_) => false,
            Op::Function(Function::Delay) => node
                .operands
                .iter()
                .enumerate()
                .any(|(index, o)| index != 1 && self.may_be_text(*o, visited)),
            Op::Function(Function::Output) => node
                .operands
                .get(1)
                .is_some_and(|o| self.may_be_text(*o, visited)),
            Op::Function(_) => false,
        }
    }

    /// `max(a, max(b, c))` becomes `max(a, b, c)`.
    fn flatten(&mut self, id: NodeId, from: VariableId) -> Result<()> {
        let function = self.arena.node(id).op.clone();
        let operands = self.arena.operands(id).to_vec();
        let nested = |child: &NodeId| {
            let node = self.arena.node(*child);
            node.op == function && node.keywords.is_empty()
        };
        if !operands.iter().any(nested) {
            return Ok(());
        }
        self.rewrite(from)?;

        let mut flat = Vec::with_capacity(operands.len());
        for child in operands {
            let node = self.arena.node(child);
            if node.op == function && node.keywords.is_empty() {
                flat.extend_from_slice(&node.operands);
            } else {
                flat.push(child);
            }
        }
        for child in &flat {
            self.arena.node_mut(*child).parent = Some(id);
        }
        self.arena.node_mut(id).operands = flat;
        Ok(())
    }

    /// Rewrites `clamp(v)` and `clamp(v, m)` into the explicit
    /// `clamp(v, lower, upper)` form.
    fn normalize_clamp(&mut self, id: NodeId, from: VariableId) -> Result<()> {
        let operands = self.arena.operands(id).to_vec();
        let (lower, upper) = match operands.as_slice() {
            [_] => {
                self.rewrite(from)?;
                (self.arena.constant(-1.0), self.arena.constant(1.0))
            }
            [_, m] => {
                self.rewrite(from)?;
                let lower = match self.arena.scalar_constant(*m) {
                    Some(v) => self.arena.constant(-v),
                    None => {
                        let copy = self.arena.clone_subtree(*m);
                        self.arena.unary(UnaryOp::Negate, copy)
                    }
                };
                (lower, *m)
            }
            _ => return Ok(()),
        };
        self.arena.node_mut(lower).parent = Some(id);
        self.arena.node_mut(upper).parent = Some(id);
        self.arena.node_mut(id).operands = vec![operands[0], lower, upper];
        Ok(())
    }

    /// Lowers `delay(v)`. When the delay is all there is to `from`, `from`
    /// itself becomes a state variable holding `v`; otherwise a hidden state
    /// variable takes `v` and the call site reads it.
    fn lower_delay(&mut self, id: NodeId, from: VariableId) -> Result<NodeId> {
        let operand = self.arena.operands(id)[0];
        self.rewrite(from)?;

        let variable = &self.variables[from.0];
        let sole = matches!(
            variable.equations.as_slice(),
            [Equation { condition: None, expression }] if *expression == id
        );
        if sole {
            let variable = &mut self.variables[from.0];
            variable.remove_attribute("temporary");
            variable.add_attribute("state");
            debug!(variable = %variable.name, "delay lowered to state");
            return Ok(operand);
        }

        let hidden = self.add_hidden_variable("delay");
        self.arena.node_mut(operand).parent = None;
        let variable = &mut self.variables[hidden.0];
        variable.add_attribute("state");
        variable.equations.push(Equation {
            condition: None,
            expression: operand,
        });
        debug!(variable = %variable.name, "delay lowered to hidden state variable");
        Ok(self.arena.variable(hidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_into;

    fn simplified(text: &str) -> (EquationSet, NodeId) {
        let mut set = EquationSet::new("m");
        let y = set.add_equation("y", text).expect("parse");
        set.simplify_all(false).expect("simplify");
        let root = set.default_expression(y).expect("equation");
        (set, root)
    }

    fn describe(set: &EquationSet, id: NodeId) -> String {
        let node = set.arena.node(id);
        let children: Vec<String> = node.operands.iter().map(|c| describe(set, *c)).collect();
        let head = match &node.op {
            Op::Constant(v) => v.to_string(),
            Op::Variable(v) => set.variable(*v).name.clone(),
            Op::Unary(op) => format!("{op:?}"),
            Op::Binary(op) => op.symbol().to_string(),
            Op::Function(f) => f.name().to_string(),
        };
        if children.is_empty() {
            head
        } else {
            format!("{head}({})", children.join(", "))
        }
    }

    #[test]
    fn folding_preserves_value() {
        let text = "2 * 3 + sin(0.5) - max(1, 4) / 2";
        let mut reference = EquationSet::new("m");
        let root = parse_into(&mut reference, text).expect("parse");
        let expected = reference
            .eval(root, &mut Instance::scratch())
            .expect("eval");

        let (set, root) = simplified(text);
        assert_eq!(set.arena.node(root).constant(), Some(&expected));
        assert!(set.variable(set.find("y").expect("y")).changed);
    }

    #[test]
    fn folding_matches_unsimplified_evaluation() {
        let cases = [
            "(7 % 3) ^ 2 - -4 / 8",
            "1 < 2 && !(3 >= 4) || 0",
            "atan(1, 2) + tanh(0.3) * exp(1) - log(10)",
            "clamp(5, 0, 4) + min(2, max(1, 3)) + abs(-2.5) + sgn(-3)",
            "floor(2.7) + ceil(-1.2) + round(0.5) + sqrt(9)",
            "norm([3, 4]) + rows([1, 2; 3, 4]) * columns([1, 2])",
            "[1, 2; 3, 4] * [1; 1] & [2; 3]",
            "[1, 2]' + 1",
            "\"v=\" + 2",
        ];
        for text in cases {
            let mut reference = EquationSet::new("m");
            let root = parse_into(&mut reference, text).expect("parse");
            let expected = reference
                .eval(root, &mut Instance::scratch())
                .expect("eval");

            let (set, root) = simplified(text);
            assert!(set.arena.is_constant(root), "{text} should fold");
            let actual = set.eval(root, &mut Instance::scratch()).expect("eval");
            assert_eq!(actual, expected, "{text}");
        }
    }

    #[test]
    fn additive_identities_keep_text_operands() {
        let mut set = EquationSet::new("m");
        set.add_equation("x", "\"abc\"").expect("parse");
        let y = set.add_equation("y", "x + 0").expect("parse");
        let z = set.add_equation("z", "0 + w").expect("parse");
        set.simplify_all(false).expect("simplify");

        let root = set.default_expression(y).expect("equation");
        assert_eq!(describe(&set, root), "+(x, 0)");
        let root = set.default_expression(z).expect("equation");
        assert_eq!(describe(&set, root), "w");

        let mut instance = Instance::new(&set, 0);
        instance.step(&set).expect("step");
        assert_eq!(instance.value(y), Value::Text("abc0".to_string()));
    }

    #[test]
    fn power_of_one_is_removed_but_power_of_zero_stays() {
        let (set, root) = simplified("pow(x, 1)");
        assert_eq!(describe(&set, root), "x");

        let (set, root) = simplified("x ^ 0");
        assert_eq!(describe(&set, root), "^(x, 0)");
    }

    #[test]
    fn identities_collapse() {
        let (set, root) = simplified("(0 + x) * 1 - 0 + --y / 1");
        assert_eq!(describe(&set, root), "+(x, y)");
        let (set, root) = simplified("gaussian(0) + x");
        assert_eq!(describe(&set, root), "x");
    }

    #[test]
    fn side_effects_are_not_folded() {
        let (set, root) = simplified("uniform() * 1");
        assert_eq!(describe(&set, root), "uniform");
    }

    #[test]
    fn clamp_gets_explicit_bounds() {
        let (set, root) = simplified("clamp(v)");
        assert_eq!(describe(&set, root), "clamp(v, -1, 1)");

        let (set, root) = simplified("clamp(v, 2)");
        assert_eq!(describe(&set, root), "clamp(v, -2, 2)");

        let (set, root) = simplified("sat(v, m)");
        assert_eq!(describe(&set, root), "clamp(v, Negate(m), m)");
        let operands = set.arena.operands(root);
        let negated = set.arena.operands(operands[1])[0];
        assert_ne!(negated, operands[2]);
        assert_eq!(set.arena.node(negated).parent, Some(operands[1]));
    }

    #[test]
    fn nested_max_is_flattened() {
        let (set, root) = simplified("max(a, max(b, max(c, d)))");
        assert_eq!(describe(&set, root), "max(a, b, c, d)");
        for operand in set.arena.operands(root) {
            assert_eq!(set.arena.node(*operand).parent, Some(root));
        }
        let (set, root) = simplified("min(a, max(b, c))");
        assert_eq!(describe(&set, root), "min(a, max(b, c))");
    }

    #[test]
    fn sole_delay_becomes_state() {
        let mut set = EquationSet::new("m");
        let y = set.add_equation("y", "delay(x + 1)").expect("parse");
        set.variable_mut(y).add_attribute("temporary");
        set.simplify_all(false).expect("simplify");

        let variable = set.variable(y);
        assert!(variable.is_state());
        assert!(!variable.has_attribute("temporary"));
        let root = set.default_expression(y).expect("equation");
        assert_eq!(describe(&set, root), "+(x, 1)");
        assert_eq!(set.arena.node(root).parent, None);

        set.variable_mut(y).changed = false;
        let count = set.variables.len();
        set.simplify_all(false).expect("simplify again");
        assert_eq!(set.default_expression(y), Some(root));
        assert!(!set.variable(y).changed);
        assert_eq!(set.variables.len(), count);
    }

    #[test]
    fn embedded_delay_gets_hidden_state_variable() {
        let mut set = EquationSet::new("m");
        set.add_equation("x", "$t").expect("parse");
        let y = set.add_equation("y", "10 * delay(x)").expect("parse");
        let reference = set.clone();
        set.simplify_all(false).expect("simplify");

        let hidden = set.find("delay0").expect("hidden variable");
        let variable = set.variable(hidden);
        assert!(variable.is_state());
        assert!(variable.has_attribute("hidden"));
        let expression = set.default_expression(hidden).expect("equation");
        assert_eq!(describe(&set, expression), "x");
        let root = set.default_expression(y).expect("equation");
        assert_eq!(describe(&set, root), "*(10, delay0)");

        let mut lowered = Instance::new(&set, 0);
        let mut original = Instance::new(&reference, 0);
        for _ in 0..5 {
            lowered.step(&set).expect("step");
            original.step(&reference).expect("step");
            assert_eq!(lowered.value(y), original.value(y));
        }
        assert_eq!(lowered.value(y), Value::Scalar(30.0));
    }

    #[test]
    fn eval_only_keeps_topology() {
        let mut set = EquationSet::new("m");
        let y = set
            .add_equation("y", "clamp(v) + delay(v) + (1 + 2)")
            .expect("parse");
        set.simplify_all(true).expect("simplify");
        let root = set.default_expression(y).expect("equation");
        assert_eq!(describe(&set, root), "+(+(clamp(v), delay(v)), 3)");
        assert!(!set.variable(y).is_state());
    }

    #[test]
    fn frozen_sets_reject_rewrites() {
        let mut set = EquationSet::new("m");
        let y = set.add_equation("y", "x + 0").expect("parse");
        set.frozen = true;
        let root = set.default_expression(y).expect("equation");
        let err = set.simplify(root, y, false).expect_err("frozen");
        assert!(matches!(err, Error::Frozen));

        let mut set = EquationSet::new("m");
        let y = set.add_equation("y", "x + z").expect("parse");
        set.frozen = true;
        let root = set.default_expression(y).expect("equation");
        assert_eq!(set.simplify(root, y, false).expect("no rewrite"), root);
    }
}

//! Expression tree storage.
//!
//! Every node of an equation set lives in one `Arena` and is addressed by
//! `NodeId`. Operands are owned exclusively by their parent; the parent link
//! is a plain index and carries no ownership.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::VariableId;
use crate::units::Unit;
use crate::value::Value;

/// Sentinel for an exponent or center that is not yet determinable.
pub const UNKNOWN: i32 = i32::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Not,
    Transpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    MultiplyElementwise,
    Divide,
    Modulo,
    Power,
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::MultiplyElementwise => "&",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "^",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Named built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Function {
    Abs,
    Signum,
    Round,
    Floor,
    Ceil,
    Sin,
    Cos,
    Tan,
    Tanh,
    Atan,
    Exp,
    Log,
    Sqrt,
    Max,
    Min,
    Clamp,
    Norm,
    Rows,
    Columns,
    Rotate,
    Uniform,
    Gaussian,
    Delay,
    Input,
    Output,
    ReadMatrix,
    Draw,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "abs" => Function::Abs,
            "sgn" | "signum" => Function::Signum,
            "round" => Function::Round,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "tanh" => Function::Tanh,
            "atan" => Function::Atan,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "sqrt" => Function::Sqrt,
            "max" => Function::Max,
            "min" => Function::Min,
            "clamp" | "sat" => Function::Clamp,
            "norm" => Function::Norm,
            "rows" => Function::Rows,
            "columns" => Function::Columns,
            "rotate" => Function::Rotate,
            "uniform" => Function::Uniform,
            "gaussian" => Function::Gaussian,
            "delay" => Function::Delay,
            "input" => Function::Input,
            "output" => Function::Output,
            "matrix" => Function::ReadMatrix,
            "draw" => Function::Draw,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Signum => "sgn",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Tanh => "tanh",
            Function::Atan => "atan",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sqrt => "sqrt",
            Function::Max => "max",
            Function::Min => "min",
            Function::Clamp => "clamp",
            Function::Norm => "norm",
            Function::Rows => "rows",
            Function::Columns => "columns",
            Function::Rotate => "rotate",
            Function::Uniform => "uniform",
            Function::Gaussian => "gaussian",
            Function::Delay => "delay",
            Function::Input => "input",
            Function::Output => "output",
            Function::ReadMatrix => "matrix",
            Function::Draw => "draw",
        }
    }

    /// Inclusive bounds on the positional operand count.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Function::Abs
            | Function::Signum
            | Function::Round
            | Function::Floor
            | Function::Ceil
            | Function::Sin
            | Function::Cos
            | Function::Tan
            | Function::Tanh
            | Function::Log
            | Function::Sqrt
            | Function::Rows
            | Function::Columns => (1, 1),
            Function::Atan | Function::Exp | Function::Norm => (1, 2),
            Function::Max | Function::Min => (1, usize::MAX),
            Function::Clamp => (1, 3),
            Function::Rotate => (4, 4),
            Function::Uniform => (0, 2),
            Function::Gaussian => (0, 1),
            Function::Delay => (1, 3),
            Function::Input => (3, 3),
            Function::Output => (2, 3),
            Function::ReadMatrix => (1, 3),
            Function::Draw => (3, 4),
        }
    }

    /// Functions whose value depends on more than their operands: random
    /// streams, per-instance buffers or external resources.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Function::Uniform
                | Function::Gaussian
                | Function::Delay
                | Function::Input
                | Function::Output
                | Function::ReadMatrix
                | Function::Draw
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Constant(Value),
    Variable(VariableId),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Function(Function),
}

/// Lifecycle marker for the fixed-point annotations of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Parsed,
    Discovered,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub operands: Vec<NodeId>,
    pub keywords: BTreeMap<String, NodeId>,
    pub parent: Option<NodeId>,
    pub(crate) unit: Option<Unit>,
    pub(crate) exponent: i32,
    pub(crate) center: i32,
    pub(crate) exponent_next: i32,
    /// Shared scale imposed on all operands of a reconciling node
    /// (comparisons, two-argument atan).
    pub(crate) operand_exponent: i32,
    pub(crate) phase: Phase,
}

impl Node {
    fn new(op: Op, operands: Vec<NodeId>) -> Self {
        Self {
            op,
            operands,
            keywords: BTreeMap::new(),
            parent: None,
            unit: None,
            exponent: UNKNOWN,
            center: UNKNOWN,
            exponent_next: UNKNOWN,
            operand_exponent: UNKNOWN,
            phase: Phase::Parsed,
        }
    }

    pub fn unit(&self) -> Option<&Unit> {
        self.unit.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn function(&self) -> Option<Function> {
        match self.op {
            Op::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn constant(&self) -> Option<&Value> {
        match &self.op {
            Op::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn variable(&self) -> Option<VariableId> {
        match self.op {
            Op::Variable(v) => Some(v),
            _ => None,
        }
    }
}

/// Owner of every node in one equation set.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Adds a node and adopts `operands` as its children.
    pub fn add(&mut self, op: Op, operands: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        for &child in &operands {
            self.nodes[child.0].parent = Some(id);
        }
        self.nodes.push(Node::new(op, operands));
        id
    }

    pub fn constant(&mut self, value: impl Into<Value>) -> NodeId {
        self.add(Op::Constant(value.into()), Vec::new())
    }

    pub fn variable(&mut self, variable: VariableId) -> NodeId {
        self.add(Op::Variable(variable), Vec::new())
    }

    pub fn unary(&mut self, op: UnaryOp, operand: NodeId) -> NodeId {
        self.add(Op::Unary(op), vec![operand])
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        self.add(Op::Binary(op), vec![left, right])
    }

    pub fn call(&mut self, function: Function, operands: Vec<NodeId>) -> NodeId {
        self.add(Op::Function(function), operands)
    }

    pub fn set_keyword(&mut self, id: NodeId, key: impl Into<String>, value: NodeId) {
        self.nodes[value.0].parent = Some(id);
        self.nodes[id.0].keywords.insert(key.into(), value);
    }

    pub fn keyword(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.nodes[id.0].keywords.get(key).copied()
    }

    pub fn operands(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].operands
    }

    /// Children in evaluation order: positional operands, then keyword
    /// values in key order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id.0];
        node.operands
            .iter()
            .chain(node.keywords.values())
            .copied()
            .collect()
    }

    pub fn is_constant(&self, id: NodeId) -> bool {
        matches!(self.nodes[id.0].op, Op::Constant(_))
    }

    pub fn scalar_constant(&self, id: NodeId) -> Option<f64> {
        self.nodes[id.0].constant().and_then(Value::as_scalar)
    }

    /// Puts `replacement` where `old` hangs in its parent, handing over the
    /// parent link. `old` stays in the arena detached.
    pub fn replace(&mut self, old: NodeId, replacement: NodeId) {
        if old == replacement {
            return;
        }
        let parent = self.nodes[old.0].parent.take();
        self.nodes[replacement.0].parent = parent;
        if let Some(p) = parent {
            let node = &mut self.nodes[p.0];
            for slot in node.operands.iter_mut().chain(node.keywords.values_mut()) {
                if *slot == old {
                    *slot = replacement;
                }
            }
        }
    }

    /// Deep copy of a subtree. The copy has no parent and fresh analysis
    /// state.
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let op = self.nodes[id.0].op.clone();
        let unit = self.nodes[id.0].unit.clone();
        let operands: Vec<NodeId> = self.nodes[id.0].operands.clone();
        let keywords: Vec<(String, NodeId)> = self.nodes[id.0]
            .keywords
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let operands = operands
            .into_iter()
            .map(|child| self.clone_subtree(child))
            .collect();
        let copy = self.add(op, operands);
        self.nodes[copy.0].unit = unit;
        for (key, value) in keywords {
            let value = self.clone_subtree(value);
            self.set_keyword(copy, key, value);
        }
        copy
    }

    /// All nodes reachable from `root`, parents before children.
    pub fn preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let mut children = self.children(id);
            children.reverse();
            stack.extend(children);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_adopts_operands() {
        let mut arena = Arena::new();
        let a = arena.constant(1.0);
        let b = arena.constant(2.0);
        let sum = arena.binary(BinaryOp::Add, a, b);
        assert_eq!(arena.node(a).parent, Some(sum));
        assert_eq!(arena.node(b).parent, Some(sum));
        assert_eq!(arena.node(sum).parent, None);
        assert_eq!(arena.node(sum).exponent, UNKNOWN);
        assert_eq!(arena.node(sum).phase(), Phase::Parsed);
    }

    #[test]
    fn replace_hands_over_parent_link() {
        let mut arena = Arena::new();
        let a = arena.constant(1.0);
        let b = arena.constant(2.0);
        let sum = arena.binary(BinaryOp::Add, a, b);
        let c = arena.constant(3.0);
        arena.replace(b, c);
        assert_eq!(arena.operands(sum), &[a, c]);
        assert_eq!(arena.node(c).parent, Some(sum));
        assert_eq!(arena.node(b).parent, None);
    }

    #[test]
    fn clone_subtree_does_not_alias() {
        let mut arena = Arena::new();
        let a = arena.constant(1.0);
        let neg = arena.unary(UnaryOp::Negate, a);
        let width = arena.constant(4.0);
        arena.set_keyword(neg, "width", width);

        let copy = arena.clone_subtree(neg);
        assert_ne!(copy, neg);
        let copied_operand = arena.operands(copy)[0];
        assert_ne!(copied_operand, a);
        assert_eq!(arena.node(copied_operand).parent, Some(copy));
        let copied_kw = arena.keyword(copy, "width").expect("keyword copied");
        assert_ne!(copied_kw, width);
        assert_eq!(arena.scalar_constant(copied_kw), Some(4.0));
    }

    #[test]
    fn function_names_round_trip() {
        for name in ["atan", "exp", "clamp", "delay", "matrix", "draw", "sgn"] {
            let f = Function::from_name(name).expect("known function");
            assert_eq!(f.name(), name);
        }
        assert_eq!(Function::from_name("sat"), Some(Function::Clamp));
        assert_eq!(Function::from_name("nope"), None);
    }
}

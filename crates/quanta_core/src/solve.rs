use tracing::debug;

use crate::model::EquationSet;
use crate::node::{BinaryOp, Function, NodeId, Op};

/// `lhs = rhs`, both sides owned by the same arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equality {
    pub lhs: NodeId,
    pub rhs: NodeId,
}

impl Equality {
    pub fn new(lhs: NodeId, rhs: NodeId) -> Self {
        Self { lhs, rhs }
    }
}

/// What replaces `rhs` once a function is peeled off `lhs`.
enum Inverse {
    Call(Function),
    Square,
    Identity,
}

fn inverse(function: Function) -> Option<Inverse> {
    let inverse = match function {
        Function::Atan => Inverse::Call(Function::Tan),
        Function::Tan => Inverse::Call(Function::Atan),
        Function::Exp => Inverse::Call(Function::Log),
        Function::Log => Inverse::Call(Function::Exp),
        Function::Sqrt => Inverse::Square,
        Function::Round | Function::Floor | Function::Ceil => Inverse::Identity,
        _ => return None,
    };
    Some(inverse)
}

impl EquationSet {
    /// Moves a single-argument function from the left side onto the right
    /// side as its inverse: `f(x) = y` becomes `x = f⁻¹(y)`. Returns false
    /// and leaves `equality` untouched when no inverse is known.
    pub fn solve(&mut self, equality: &mut Equality) -> bool {
        let node = self.arena.node(equality.lhs);
        let Op::Function(function) = node.op else {
            return false;
        };
        if node.operands.len() != 1 || !node.keywords.is_empty() || self.frozen {
            return false;
        }
        let Some(inverse) = inverse(function) else {
            return false;
        };
        let argument = node.operands[0];

        let rhs = match inverse {
            Inverse::Call(f) => self.arena.call(f, vec![equality.rhs]),
            Inverse::Square => {
                let two = self.arena.constant(2.0);
                self.arena.binary(BinaryOp::Power, equality.rhs, two)
            }
            Inverse::Identity => equality.rhs,
        };
        self.arena.node_mut(argument).parent = None;
        self.arena.node_mut(rhs).parent = None;
        debug!(function = function.name(), "inverted");
        equality.lhs = argument;
        equality.rhs = rhs;
        true
    }
}

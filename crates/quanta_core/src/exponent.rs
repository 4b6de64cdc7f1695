//! Fixed-point exponent inference.
//!
//! A fixed-point value is `raw * 2^exponent`, where the raw integer carries
//! `msb + 1` magnitude bits. `center` is the bit where the expected magnitude
//! sits, so `exponent + center` (the *power*) is the base-2 logarithm of that
//! magnitude and the bits above `center` are headroom.
//!
//! Discovery (`determine_exponent`) runs bottom-up and decides what each
//! node naturally produces. Propagation (`determine_exponent_next`) runs
//! top-down and records what each consumer wants, from which code
//! generation derives the shift to apply. A node that hands its demand on to
//! its operands receives them at that scale, so its own exponent is moved
//! there (keeping its power) and it needs no further shift.

use std::f64::consts::LN_2;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::EquationSet;
use crate::node::{BinaryOp, Function, Node, NodeId, Op, Phase, UnaryOp, UNKNOWN};
use crate::settings::CompileSettings;
use crate::value::Value;

/// Parameters threaded through one inference run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentContext {
    pub msb: i32,
    /// Set whenever discovery alters an exponent, a center or a bound.
    pub changed: bool,
}

impl ExponentContext {
    pub fn new(msb: i32) -> Self {
        Self {
            msb,
            changed: false,
        }
    }

    /// Default center for values with no better-known range.
    pub fn middle(&self) -> i32 {
        self.msb / 2
    }

    fn clamp(&self, exponent: i32) -> i32 {
        if exponent == UNKNOWN {
            UNKNOWN
        } else {
            exponent.clamp(-self.msb, self.msb)
        }
    }
}

/// Fixed-point annotation of one finalized node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPoint {
    pub exponent: i32,
    pub center: i32,
    pub exponent_next: i32,
}

impl FixedPoint {
    pub fn is_known(&self) -> bool {
        self.exponent != UNKNOWN
    }

    pub fn power(&self) -> Option<i32> {
        self.is_known().then(|| self.exponent + self.center)
    }

    /// Left shift that converts this node's raw value into the scale its
    /// consumer expects (negative for a right shift). Zero when either side
    /// is unknown, and for nodes whose operands already arrive at that scale.
    pub fn shift(&self) -> i32 {
        if self.exponent == UNKNOWN || self.exponent_next == UNKNOWN {
            0
        } else {
            self.exponent - self.exponent_next
        }
    }
}

/// `floor(log2 |v|)`, 0 for zero.
fn magnitude_power(v: f64) -> Option<i32> {
    if v == 0.0 {
        Some(0)
    } else if v.is_finite() {
        Some(v.abs().log2().floor() as i32)
    } else {
        None
    }
}

fn value_power(value: &Value) -> Option<i32> {
    match value {
        Value::Scalar(v) => magnitude_power(*v),
        Value::Matrix(m) => magnitude_power(m.norm(f64::INFINITY)),
        Value::Text(_) => None,
    }
}

/// Outputs whose range is fixed regardless of their operands.
fn is_bounded(node: &Node) -> bool {
    match &node.op {
        Op::Unary(UnaryOp::Not) => true,
        Op::Binary(b) => b.is_comparison() || b.is_logical(),
        Op::Function(f) => matches!(
            f,
            Function::Tanh
                | Function::Sin
                | Function::Cos
                | Function::Atan
                | Function::Rotate
                | Function::Signum
                | Function::Draw
        ) || (*f == Function::Uniform && node.operands.is_empty()),
        _ => false,
    }
}

impl EquationSet {
    fn power(&self, id: NodeId) -> Option<i32> {
        let node = self.arena.node(id);
        if node.exponent == UNKNOWN {
            None
        } else {
            Some(node.exponent + node.center)
        }
    }

    /// Numeric literal at `id`, looking through negation.
    fn literal(&self, id: NodeId) -> Option<f64> {
        let node = self.arena.node(id);
        match &node.op {
            Op::Constant(v) => v.as_scalar(),
            Op::Unary(UnaryOp::Negate) => self.literal(node.operands[0]).map(|v| -v),
            _ => None,
        }
    }

    fn set_fixed_point(
        &mut self,
        ctx: &mut ExponentContext,
        id: NodeId,
        exponent: i32,
        center: i32,
    ) {
        let exponent = ctx.clamp(exponent);
        let node = self.arena.node_mut(id);
        if node.exponent != exponent || node.center != center {
            node.exponent = exponent;
            node.center = center;
            ctx.changed = true;
        }
        if node.phase == Phase::Parsed {
            node.phase = Phase::Discovered;
        }
    }

    /// Records `power` at the default center. An unknown power leaves the
    /// node as it is.
    fn set_power(&mut self, ctx: &mut ExponentContext, id: NodeId, power: Option<i32>) {
        match power {
            Some(power) => {
                let center = ctx.middle();
                self.set_fixed_point(ctx, id, power.saturating_sub(center), center);
            }
            None => {
                let node = self.arena.node_mut(id);
                if node.phase == Phase::Parsed {
                    node.phase = Phase::Discovered;
                }
            }
        }
    }

    fn copy_fixed_point(&mut self, ctx: &mut ExponentContext, id: NodeId, from: NodeId) {
        let source = self.arena.node(from);
        let (exponent, center) = (source.exponent, source.center);
        if exponent == UNKNOWN {
            self.set_power(ctx, id, None);
        } else {
            self.set_fixed_point(ctx, id, exponent, center);
        }
    }

    /// Power given by a `median` or `exponent` keyword, or for `exp` by a
    /// trailing text operand.
    fn hint_power(&self, id: NodeId) -> Option<i32> {
        if let Some(v) = self.arena.keyword(id, "exponent").and_then(|k| self.literal(k)) {
            return Some(v.floor() as i32);
        }
        if let Some(v) = self.arena.keyword(id, "median").and_then(|k| self.literal(k)) {
            return magnitude_power(v);
        }
        let node = self.arena.node(id);
        if node.function() == Some(Function::Exp) {
            let hint = node
                .operands
                .get(1)
                .and_then(|o| self.arena.node(*o).constant());
            if let Some(Value::Text(text)) = hint {
                return text.trim().parse::<f64>().ok().map(|v| v.floor() as i32);
            }
        }
        None
    }

    /// Largest power among `operands`, unknown as soon as one of them is.
    fn widest(&self, operands: &[NodeId]) -> Option<i32> {
        let mut widest = None;
        for operand in operands {
            let power = self.power(*operand)?;
            widest = Some(widest.map_or(power, |w: i32| w.max(power)));
        }
        widest
    }

    /// Discovery for the subtree at `id`.
    pub fn determine_exponent(&mut self, ctx: &mut ExponentContext, id: NodeId) {
        for child in self.arena.children(id) {
            self.determine_exponent(ctx, child);
        }

        let node = self.arena.node(id);
        let op = node.op.clone();
        let operands = node.operands.clone();
        let first = operands.first().copied();
        let msb = ctx.msb;
        let middle = ctx.middle();

        match op {
            Op::Constant(value) => {
                let power = value_power(&value);
                self.set_power(ctx, id, power);
            }
            Op::Variable(v) => {
                let variable = self.variable(v);
                match (variable.fixed_point(), variable.bound) {
                    (Some((exponent, center)), _) => {
                        self.set_fixed_point(ctx, id, exponent, center)
                    }
                    (None, Some(bound)) => {
                        let power = magnitude_power(bound);
                        self.set_power(ctx, id, power);
                    }
                    (None, None) => self.set_power(ctx, id, None),
                }
            }
            Op::Unary(UnaryOp::Not) => self.set_fixed_point(ctx, id, 0, 0),
            Op::Unary(_) => self.copy_fixed_point(ctx, id, operands[0]),
            Op::Binary(b) => {
                let (a, c) = (operands[0], operands[1]);
                match b {
                    BinaryOp::Add | BinaryOp::Subtract => {
                        let power = self.widest(&operands);
                        self.set_power(ctx, id, power);
                    }
                    BinaryOp::Modulo => {
                        let power = self.power(c);
                        self.set_power(ctx, id, power);
                    }
                    BinaryOp::Multiply | BinaryOp::MultiplyElementwise => {
                        let power = self.power(a).zip(self.power(c)).map(|(x, y)| x + y);
                        self.set_power(ctx, id, power);
                    }
                    BinaryOp::Divide => {
                        let power = self.power(a).zip(self.power(c)).map(|(x, y)| x - y);
                        self.set_power(ctx, id, power);
                    }
                    BinaryOp::Power => {
                        let power = match self.literal(c) {
                            Some(k) => self.power(a).map(|p| (p as f64 * k).floor() as i32),
                            None => {
                                if self.arena.node(id).phase == Phase::Parsed {
                                    warn!(node = id.0, "non-constant exponent; using the base's power");
                                }
                                self.power(a)
                            }
                        };
                        self.set_power(ctx, id, power);
                    }
                    BinaryOp::And | BinaryOp::Or => self.set_fixed_point(ctx, id, 0, 0),
                    _ => {
                        self.record_bound(ctx, a, c);
                        self.reconcile_operands(ctx, id);
                        self.set_fixed_point(ctx, id, 0, 0);
                    }
                }
            }
            Op::Function(f) => match f {
                Function::Abs => self.copy_fixed_point(ctx, id, operands[0]),
                Function::Delay => self.copy_fixed_point(ctx, id, operands[0]),
                Function::Output => self.copy_fixed_point(ctx, id, operands[1]),
                Function::Signum | Function::Draw => self.set_fixed_point(ctx, id, 0, 0),
                Function::Tanh | Function::Sin | Function::Cos | Function::Rotate => {
                    self.set_fixed_point(ctx, id, -msb, msb - 1)
                }
                Function::Atan => {
                    if operands.len() == 2 {
                        self.reconcile_operands(ctx, id);
                    }
                    self.set_fixed_point(ctx, id, 1 - msb, msb - 1);
                }
                Function::Tan => self.set_power(ctx, id, Some(0)),
                Function::Round | Function::Floor | Function::Ceil => {
                    let power = first.and_then(|o| self.power(o)).map(|p| p.max(0));
                    self.set_power(ctx, id, power);
                }
                Function::Max | Function::Min | Function::Clamp | Function::Norm => {
                    let power = self.widest(&operands);
                    self.set_power(ctx, id, power);
                }
                Function::Rows | Function::Columns => self.set_fixed_point(ctx, id, 0, middle),
                Function::Exp => {
                    let power = self.hint_power(id).or_else(|| {
                        self.power(operands[0])
                            .map(|p| (2f64.powi(p) / LN_2).floor().min(f64::from(msb)) as i32)
                    });
                    self.set_power(ctx, id, power);
                }
                Function::Log => {
                    let power = self.power(operands[0]).map(|p| {
                        (f64::from(p.abs()) * LN_2).max(1.0).log2().floor() as i32
                    });
                    self.set_power(ctx, id, power);
                }
                Function::Sqrt => {
                    let power = self.power(operands[0]).map(|p| p.div_euclid(2));
                    self.set_power(ctx, id, power);
                }
                Function::Uniform => {
                    if operands.is_empty() {
                        self.set_fixed_point(ctx, id, -msb, msb - 1);
                    } else {
                        let power = self.widest(&operands);
                        self.set_power(ctx, id, power);
                    }
                }
                Function::Gaussian => {
                    let sigma = match first {
                        Some(o) => self.power(o),
                        None => Some(0),
                    };
                    self.set_power(ctx, id, sigma.map(|p| p + 2));
                }
                Function::Input | Function::ReadMatrix => {
                    let power = self.hint_power(id);
                    self.set_power(ctx, id, power);
                }
            },
        }
    }

    /// A comparison of a variable against a numeric constant widens the
    /// variable's bound to the constant's magnitude.
    fn record_bound(&mut self, ctx: &mut ExponentContext, a: NodeId, b: NodeId) {
        let (variable, constant) = match (
            self.arena.node(a).variable(),
            self.arena.node(b).variable(),
        ) {
            (Some(v), None) => (v, self.literal(b)),
            (None, Some(v)) => (v, self.literal(a)),
            _ => return,
        };
        let Some(constant) = constant else {
            return;
        };
        let variable = self.variable_mut(variable);
        let bound = variable.bound.map_or(0.0, f64::abs).max(constant.abs());
        if variable.bound != Some(bound) {
            debug!(variable = %variable.name, bound, "bound widened");
            variable.bound = Some(bound);
            ctx.changed = true;
        }
    }

    /// Chooses the exponent shared by both operands of a comparison or a
    /// two-argument `atan`.
    fn reconcile_operands(&mut self, ctx: &mut ExponentContext, id: NodeId) {
        let operands = self.arena.operands(id);
        let (a, b) = (operands[0], operands[1]);
        let (ea, eb) = (self.arena.node(a).exponent, self.arena.node(b).exponent);
        let shared = match (ea == UNKNOWN, eb == UNKNOWN) {
            (true, true) => UNKNOWN,
            (false, true) => ea,
            (true, false) => eb,
            (false, false) => {
                let a_is_variable = self.arena.node(a).variable().is_some();
                let b_is_variable = self.arena.node(b).variable().is_some();
                // Off by one bit: a bare variable keeps its own scale so it
                // can be compared without a shift.
                if (ea - eb).abs() == 1 && a_is_variable != b_is_variable {
                    if a_is_variable {
                        ea
                    } else {
                        eb
                    }
                } else {
                    (ea + eb).div_euclid(2)
                }
            }
        };
        let node = self.arena.node_mut(id);
        if node.operand_exponent != shared {
            node.operand_exponent = shared;
            ctx.changed = true;
        }
    }

    /// Propagation for the subtree at `id`, given the exponent its consumer
    /// wants (`UNKNOWN` for no preference).
    pub fn determine_exponent_next(&mut self, ctx: &ExponentContext, id: NodeId, demand: i32) {
        let node = self.arena.node(id);
        let bounded = is_bounded(node);
        let op = node.op.clone();
        let exponent = node.exponent;
        let operand_exponent = node.operand_exponent;
        let operands = node.operands.clone();
        let keywords: Vec<NodeId> = node.keywords.values().copied().collect();

        let next = if demand == UNKNOWN {
            exponent
        } else {
            ctx.clamp(demand)
        };
        self.arena.node_mut(id).exponent_next = next;

        let own = |set: &Self, child: NodeId| set.arena.node(child).exponent;
        let imposed = if next == UNKNOWN { exponent } else { next };

        // Scale handed to the pass-through operands, which the node then
        // produces itself.
        let passed = match &op {
            _ if bounded => None,
            Op::Binary(BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Modulo)
            | Op::Unary(UnaryOp::Negate | UnaryOp::Transpose)
            | Op::Function(
                Function::Max
                | Function::Min
                | Function::Clamp
                | Function::Abs
                | Function::Delay
                | Function::Output,
            ) => Some(imposed),
            Op::Function(Function::Round | Function::Floor | Function::Ceil) => {
                Some(if imposed == UNKNOWN {
                    UNKNOWN
                } else {
                    imposed.max(1 - ctx.msb)
                })
            }
            _ => None,
        };

        for (index, child) in operands.iter().copied().enumerate() {
            let child_demand = match &op {
                Op::Binary(b) if b.is_comparison() => operand_exponent,
                Op::Function(Function::Atan) if operands.len() == 2 => operand_exponent,
                Op::Function(Function::Delay) if index != 0 => UNKNOWN,
                Op::Function(Function::Output) if index != 1 => UNKNOWN,
                _ => passed.unwrap_or(UNKNOWN),
            };
            let child_demand = if child_demand == UNKNOWN {
                own(self, child)
            } else {
                child_demand
            };
            self.determine_exponent_next(ctx, child, child_demand);
        }
        for child in keywords {
            let natural = own(self, child);
            self.determine_exponent_next(ctx, child, natural);
        }

        if let Some(scale) = passed.filter(|s| *s != UNKNOWN && exponent != UNKNOWN) {
            let node = self.arena.node_mut(id);
            node.center = node.center + node.exponent - scale;
            node.exponent = scale;
        }
    }

    /// Assigns fixed-point annotations to every node and variable, then
    /// freezes the set. Discovery repeats until nothing changes or
    /// `max_passes` is reached.
    pub fn determine_exponents(&mut self, settings: &CompileSettings) -> Result<()> {
        settings.validate()?;
        self.frozen = true;
        let mut ctx = ExponentContext::new(settings.msb);

        let mut passes = 0;
        loop {
            ctx.changed = false;
            for root in self.roots() {
                self.determine_exponent(&mut ctx, root);
            }
            for index in 0..self.variables.len() {
                self.assign_variable(&mut ctx, index);
            }
            passes += 1;
            if !ctx.changed {
                break;
            }
            if passes >= settings.max_passes {
                warn!(set = %self.name, passes, "exponents still changing after the last pass");
                break;
            }
        }

        for index in 0..self.variables.len() {
            let demand = self.variables[index].exponent;
            for equation in self.variables[index].equations.clone() {
                if let Some(condition) = equation.condition {
                    self.determine_exponent_next(&ctx, condition, UNKNOWN);
                }
                self.determine_exponent_next(&ctx, equation.expression, demand);
            }
        }

        for index in 0..self.arena.len() {
            self.arena.node_mut(NodeId(index)).phase = Phase::Finalized;
        }
        debug!(set = %self.name, passes, "exponents finalized");
        Ok(())
    }

    /// Widest power over the variable's equations, never narrower than what
    /// an earlier pass assigned.
    fn assign_variable(&mut self, ctx: &mut ExponentContext, index: usize) {
        let widest = self.variables[index]
            .equations
            .iter()
            .filter_map(|e| self.power(e.expression))
            .max();
        let variable = &self.variables[index];
        let previous = variable.fixed_point().map(|(e, c)| e + c);
        let power = match (widest, previous) {
            (Some(w), Some(p)) => Some(w.max(p)),
            (w, p) => w.or(p),
        };
        let Some(power) = power else {
            return;
        };
        let center = ctx.middle();
        let exponent = ctx.clamp(power - center);
        let variable = &mut self.variables[index];
        if variable.exponent != exponent || variable.center != center {
            variable.exponent = exponent;
            variable.center = center;
            ctx.changed = true;
        }
    }

    /// Fixed-point annotation of `id`. Only available once the driver has
    /// finalized the set.
    pub fn fixed_point(&self, id: NodeId) -> Result<FixedPoint> {
        let node = self.arena.node(id);
        if node.phase != Phase::Finalized {
            return Err(Error::NotFinalized);
        }
        Ok(FixedPoint {
            exponent: node.exponent,
            center: node.center,
            exponent_next: node.exponent_next,
        })
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{Arena, NodeId, UNKNOWN};
use crate::parse::parse_into;
use crate::units::Unit;

/// Simulation time, always variable 0 of every set.
pub const TIME: VariableId = VariableId(0);
/// Integration step, always variable 1 of every set.
pub const STEP: VariableId = VariableId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariableId(pub usize);

/// One equation of a variable. An unconditional equation is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equation {
    pub condition: Option<NodeId>,
    pub expression: NodeId,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub equations: Vec<Equation>,
    pub attributes: BTreeSet<String>,
    pub unit: Option<Unit>,
    /// Largest magnitude this variable was compared against. Seeds the
    /// exponent of references to a variable whose own exponent is not yet
    /// known.
    pub bound: Option<f64>,
    pub(crate) exponent: i32,
    pub(crate) center: i32,
    /// Set by the simplifier whenever one of the equations was rewritten.
    pub changed: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            equations: Vec::new(),
            attributes: BTreeSet::new(),
            unit: None,
            bound: None,
            exponent: UNKNOWN,
            center: UNKNOWN,
            changed: false,
        }
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }

    pub fn add_attribute(&mut self, attribute: &str) {
        self.attributes.insert(attribute.to_string());
    }

    pub fn remove_attribute(&mut self, attribute: &str) {
        self.attributes.remove(attribute);
    }

    pub fn is_state(&self) -> bool {
        self.has_attribute("state")
    }

    /// `(exponent, center)` assigned by the fixed-point driver, if any.
    pub fn fixed_point(&self) -> Option<(i32, i32)> {
        if self.exponent == UNKNOWN {
            None
        } else {
            Some((self.exponent, self.center))
        }
    }
}

/// A set of variables and the arena holding all of their expression trees.
#[derive(Debug, Clone)]
pub struct EquationSet {
    pub name: String,
    pub arena: Arena,
    pub variables: Vec<Variable>,
    pub(crate) frozen: bool,
}

impl EquationSet {
    pub fn new(name: impl Into<String>) -> Self {
        let mut time = Variable::new("$t");
        time.add_attribute("reserved");
        let mut step = Variable::new("$dt");
        step.add_attribute("reserved");
        Self {
            name: name.into(),
            arena: Arena::new(),
            variables: vec![time, step],
            frozen: false,
        }
    }

    pub fn find(&self, name: &str) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .map(VariableId)
    }

    /// Returns the existing variable of that name or creates it.
    pub fn add_variable(&mut self, name: &str) -> VariableId {
        if let Some(id) = self.find(name) {
            return id;
        }
        self.variables.push(Variable::new(name));
        VariableId(self.variables.len() - 1)
    }

    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn variable_mut(&mut self, id: VariableId) -> &mut Variable {
        &mut self.variables[id.0]
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Parses `expression` and appends it as an unconditional equation of
    /// `name`, creating the variable when needed.
    pub fn add_equation(&mut self, name: &str, expression: &str) -> Result<VariableId> {
        self.add_conditional(name, expression, None)
    }

    pub fn add_conditional(
        &mut self,
        name: &str,
        expression: &str,
        condition: Option<&str>,
    ) -> Result<VariableId> {
        if self.frozen {
            return Err(Error::Frozen);
        }
        let id = self.add_variable(name);
        let expression = parse_into(self, expression)?;
        let condition = match condition {
            Some(text) => Some(parse_into(self, text)?),
            None => None,
        };
        self.variables[id.0].equations.push(Equation {
            condition,
            expression,
        });
        Ok(id)
    }

    /// Expression of the unconditional equation of `id`, if it has one.
    pub fn default_expression(&self, id: VariableId) -> Option<NodeId> {
        self.variables[id.0]
            .equations
            .iter()
            .find(|e| e.condition.is_none())
            .map(|e| e.expression)
    }

    /// Roots of every equation tree, conditions included.
    pub fn roots(&self) -> Vec<NodeId> {
        self.variables
            .iter()
            .flat_map(|v| v.equations.iter())
            .flat_map(|e| e.condition.into_iter().chain(std::iter::once(e.expression)))
            .collect()
    }

    /// Creates a variable whose name does not collide with any existing one.
    pub(crate) fn add_hidden_variable(&mut self, prefix: &str) -> VariableId {
        let mut index = 0usize;
        loop {
            let name = format!("{prefix}{index}");
            if self.find(&name).is_none() {
                let id = self.add_variable(&name);
                self.variables[id.0].add_attribute("hidden");
                return id;
            }
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_variables_come_first() {
        let set = EquationSet::new("m");
        assert_eq!(set.find("$t"), Some(TIME));
        assert_eq!(set.find("$dt"), Some(STEP));
    }

    #[test]
    fn add_equation_creates_referenced_variables() {
        let mut set = EquationSet::new("m");
        let y = set.add_equation("y", "x + 1").expect("parse");
        assert!(set.find("x").is_some());
        assert_eq!(set.variable(y).equations.len(), 1);
        assert!(set.default_expression(y).is_some());
    }

    #[test]
    fn conditional_equations_are_not_default() {
        let mut set = EquationSet::new("m");
        let y = set
            .add_conditional("y", "1", Some("$t > 2"))
            .expect("parse");
        assert_eq!(set.default_expression(y), None);
        assert_eq!(set.roots().len(), 2);
    }

    #[test]
    fn frozen_sets_reject_new_equations() {
        let mut set = EquationSet::new("m");
        set.frozen = true;
        let err = set.add_equation("y", "1").expect_err("frozen");
        assert!(matches!(err, Error::Frozen));
    }

    #[test]
    fn hidden_variables_get_unique_names() {
        let mut set = EquationSet::new("m");
        set.add_variable("delay0");
        let id = set.add_hidden_variable("delay");
        assert_eq!(set.variable(id).name, "delay1");
        assert!(set.variable(id).has_attribute("hidden"));
    }
}

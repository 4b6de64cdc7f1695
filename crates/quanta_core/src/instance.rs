use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::Result;
use crate::holders::Holders;
use crate::model::{EquationSet, VariableId, STEP, TIME};
use crate::node::NodeId;
use crate::value::Value;

/// Time-stamped history of one delay call site.
#[derive(Debug, Default, Clone)]
pub struct DelayBuffer {
    samples: VecDeque<(f64, Value)>,
}

impl DelayBuffer {
    /// Records `value` at `time` and returns the newest sample taken at or
    /// before `time - delay`, discarding anything older than it.
    pub fn exchange(
        &mut self,
        time: f64,
        delay: f64,
        value: Value,
        tolerance: f64,
    ) -> Option<Value> {
        let target = time - delay + tolerance;
        let mut found = None;
        for (i, (t, _)) in self.samples.iter().enumerate() {
            if *t <= target {
                found = Some(i);
            } else {
                break;
            }
        }
        let result = found.map(|i| {
            self.samples.drain(..i);
            self.samples[0].1.clone()
        });
        self.samples.push_back((time, value));
        result
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Execution context for one simulated instance of an equation set: current
/// variable values, the clock, and every piece of per-instance state the
/// evaluator needs (random stream, delay buffers, resource holders).
#[derive(Debug)]
pub struct Instance {
    values: Vec<Value>,
    pub(crate) delays: HashMap<NodeId, DelayBuffer>,
    pub holders: Holders,
    pub(crate) rng: StdRng,
}

impl Instance {
    pub fn new(set: &EquationSet, seed: u64) -> Self {
        let mut instance = Self {
            values: vec![Value::Scalar(0.0); set.variables.len()],
            delays: HashMap::new(),
            holders: Holders::new(),
            rng: StdRng::seed_from_u64(seed),
        };
        instance.values[STEP.0] = Value::Scalar(1.0);
        instance
    }

    /// Detached context for constant folding: no variables, no history.
    pub fn scratch() -> Self {
        Self {
            values: vec![Value::Scalar(0.0), Value::Scalar(1.0)],
            delays: HashMap::new(),
            holders: Holders::new(),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn time(&self) -> f64 {
        self.values[TIME.0].as_scalar().unwrap_or(0.0)
    }

    pub fn step_size(&self) -> f64 {
        self.values[STEP.0].as_scalar().unwrap_or(1.0)
    }

    pub fn set_time(&mut self, t: f64) {
        self.values[TIME.0] = Value::Scalar(t);
    }

    pub fn set_step_size(&mut self, dt: f64) {
        self.values[STEP.0] = Value::Scalar(dt);
    }

    pub fn value(&self, id: VariableId) -> Value {
        self.values
            .get(id.0)
            .cloned()
            .unwrap_or(Value::Scalar(0.0))
    }

    pub fn set_value(&mut self, id: VariableId, value: Value) {
        if self.values.len() <= id.0 {
            self.values.resize(id.0 + 1, Value::Scalar(0.0));
        }
        self.values[id.0] = value;
    }

    pub(crate) fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Standard normal draw (Box-Muller).
    pub(crate) fn gaussian(&mut self) -> f64 {
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    /// Runs one cycle: evaluates every variable in declaration order, then
    /// commits the buffered values of state variables and advances time.
    pub fn step(&mut self, set: &EquationSet) -> Result<()> {
        if self.values.len() < set.variables.len() {
            self.values.resize(set.variables.len(), Value::Scalar(0.0));
        }

        let mut pending = Vec::new();
        for (index, variable) in set.variables.iter().enumerate() {
            let mut default = None;
            let mut chosen = None;
            for equation in &variable.equations {
                match equation.condition {
                    None => default = Some(equation.expression),
                    Some(condition) => {
                        if set.eval(condition, self)?.is_true() {
                            chosen = Some(equation.expression);
                            break;
                        }
                    }
                }
            }
            if let Some(expression) = chosen.or(default) {
                let value = set.eval(expression, self)?;
                if variable.is_state() {
                    pending.push((index, value));
                } else {
                    self.values[index] = value;
                }
            }
        }
        for (index, value) in pending {
            self.values[index] = value;
        }

        let t = self.time() + self.step_size();
        self.set_time(t);
        debug!(set = %set.name, t, "step complete");
        Ok(())
    }

    /// Flushes output holders.
    pub fn close(&mut self) -> Result<()> {
        self.holders.flush()
    }
}

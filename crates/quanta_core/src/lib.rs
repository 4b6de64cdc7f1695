//! The `quanta_core` crate is the analysis engine behind the quanta modeling
//! tools. It holds equation sets as arenas of expression nodes and runs the
//! passes that prepare them for execution on a double-precision interpreter
//! or as generated fixed-point integer code.
//!
//! Key components:
//! - **Model**: `EquationSet`, `Variable` and the node `Arena` (`model`, `node`), built with the infix `parse`r.
//! - **Values**: scalars, dense and sparse matrices, and text (`value`).
//! - **Evaluation**: the reference evaluator and the per-instance stepping loop (`eval`, `instance`, `holders`).
//! - **Passes**: simplification, unit propagation and fixed-point exponent inference (`simplify`, `units`, `exponent`).
//! - **Solver**: inversion of single-argument functions in equalities (`solve`).
pub mod error;
pub mod eval;
pub mod exponent;
pub mod holders;
pub mod instance;
pub mod model;
pub mod node;
pub mod parse;
pub mod settings;
pub mod simplify;
pub mod solve;
pub mod units;
pub mod value;

pub use error::{Error, Result};
pub use exponent::{ExponentContext, FixedPoint};
pub use instance::Instance;
pub use model::{Equation, EquationSet, Variable, VariableId};
pub use node::{NodeId, Phase, UNKNOWN};
pub use settings::CompileSettings;
pub use solve::Equality;
pub use units::Unit;
pub use value::{Matrix, Value};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::model::EquationSet;

/// Per-compilation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileSettings {
    /// Highest magnitude bit of the raw fixed-point integer (sign excluded).
    pub msb: i32,
    /// Unit conflicts abort the compilation instead of being logged.
    pub fatal_units: bool,
    /// Upper bound on exponent discovery passes.
    pub max_passes: usize,
    pub seed: u64,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            msb: 30,
            fatal_units: false,
            max_passes: 8,
            seed: 0,
        }
    }
}

impl CompileSettings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=62).contains(&self.msb) {
            return Err(Error::Settings(format!(
                "msb must be between 1 and 62, got {}",
                self.msb
            )));
        }
        if self.max_passes == 0 {
            return Err(Error::Settings("max_passes must be positive".to_string()));
        }
        Ok(())
    }
}

impl EquationSet {
    /// Full analysis pipeline: simplification, unit propagation, then
    /// fixed-point exponent assignment. Leaves the set frozen and finalized.
    pub fn compile(&mut self, settings: &CompileSettings) -> Result<()> {
        settings.validate()?;
        self.simplify_all(false)?;
        self.determine_units(settings.fatal_units)?;
        self.determine_exponents(settings)?;
        debug!(
            set = %self.name,
            variables = self.variables.len(),
            nodes = self.arena.len(),
            "compiled"
        );
        Ok(())
    }
}

impl Instance {
    /// Instance whose random stream is seeded from `settings`.
    pub fn with_settings(set: &EquationSet, settings: &CompileSettings) -> Self {
        Self::new(set, settings.seed)
    }
}

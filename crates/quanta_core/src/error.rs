use thiserror::Error;

use crate::holders::HolderKind;

/// Errors produced by the expression core.
///
/// `TypeMismatch` and `ResourceConflict` indicate a malformed model and abort
/// the run that raised them. Unit conflicts only surface here when strict
/// checking was requested.
#[derive(Debug, Error)]
pub enum Error {
    #[error("type mismatch in {op}: {found} operand not supported")]
    TypeMismatch { op: String, found: &'static str },

    #[error("dimension mismatch in {op}: {left:?} vs {right:?}")]
    DimensionMismatch {
        op: String,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("incompatible units in {op}: {left} vs {right}")]
    UnitMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("resource \"{key}\" already open as {existing:?}, requested as {requested:?}")]
    ResourceConflict {
        key: String,
        existing: HolderKind,
        requested: HolderKind,
    },

    #[error("{name} expects {expected} operands, got {found}")]
    Arity {
        name: String,
        expected: String,
        found: usize,
    },

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("fixed-point annotation read before inference finished")]
    NotFinalized,

    #[error("equation set is frozen; structural rewrites are no longer allowed")]
    Frozen,

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn type_mismatch(op: impl Into<String>, found: &'static str) -> Self {
        Error::TypeMismatch {
            op: op.into(),
            found,
        }
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Versioned configuration (Product / Fee / Rule) sharing one safe-edit
//! state machine.
//!
//! The three artifact types each own their locked-field list and usage
//! query, but delegate the "can this locked field change right now"
//! decision to [`safe_edit::ensure_editable`] so the invariant that an
//! ACTIVE config with nonzero usage has immutable locked fields has
//! exactly one implementation rather than three copies that could
//! drift apart.

pub mod fee;
pub mod product;
pub mod rule;
mod safe_edit;

pub use fee::Fee;
pub use fee::FeeFrequency;
pub use fee::FeeMethod;
pub use product::Product;
pub use rule::Rule;
pub use safe_edit::ConfigStatus;

use thiserror::Error;
use uuid::Uuid;

pub type ArtifactId = Uuid;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} {1} not found")]
    NotFound(&'static str, ArtifactId),
    #[error("cannot change {field} on an ACTIVE artifact with active usage")]
    InUseLocked { field: &'static str },
    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConfigStatus,
        to: ConfigStatus,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store unavailable: {0}")]
    Transient(#[from] sqlx::Error),
}

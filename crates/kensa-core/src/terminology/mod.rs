//! Terminology binding validation
//!
//! The harness validates coded elements through a [`TerminologyValidator`].
//! One validator is shared per process through [`registry`], which tests can
//! reset between runs.

mod bindings;
mod memory;

pub use bindings::{BindingReport, check_bindings};
pub use memory::InMemoryTerminology;

use thiserror::Error;

/// Failures to answer a membership question
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminologyError {
    #[error("Unknown ValueSet: {0}")]
    UnknownValueSet(String),

    #[error("Unknown CodeSystem: {0}")]
    UnknownCodeSystem(String),
}

/// ValueSet membership checks
pub trait TerminologyValidator: Send + Sync {
    /// Is `code` (optionally qualified by `system`) a member of `value_set`?
    ///
    /// With no code, answers whether `value_set` draws on `system` at all.
    fn validate_code(
        &self,
        value_set: &str,
        code: Option<&str>,
        system: Option<&str>,
    ) -> std::result::Result<bool, TerminologyError>;
}

/// Process-wide validator
///
/// `init` replaces the current validator, `reset` removes it. Readers that
/// find no validator skip binding checks with a warning.
pub mod registry {
    use super::TerminologyValidator;
    use once_cell::sync::Lazy;
    use std::sync::{Arc, RwLock};

    static VALIDATOR: Lazy<RwLock<Option<Arc<dyn TerminologyValidator>>>> =
        Lazy::new(|| RwLock::new(None));

    pub fn init(validator: Arc<dyn TerminologyValidator>) {
        let mut slot = VALIDATOR.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(validator);
    }

    pub fn get() -> Option<Arc<dyn TerminologyValidator>> {
        VALIDATOR.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset() {
        let mut slot = VALIDATOR.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    pub fn is_initialized() -> bool {
        get().is_some()
    }
}

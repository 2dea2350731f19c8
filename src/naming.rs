//! Derivation of external resource names from a job identifier.
//!
//! Every cloud resource created for a job (SSH key, machine) carries the same
//! derived name so later stages can find it by name alone. The prefix is an
//! explicit value threaded through the stages rather than process-global
//! state; it is validated once, on construction, against a dummy job id.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Maximum length of a derived resource name.
const MAX_NAME_LEN: usize = 50;

/// Dummy job id appended to a candidate prefix during validation.
const VALIDATION_JOB_ID: &str = "123456";

static NAME_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .expect("resource name grammar must compile")
});

/// Errors raised while validating a resource name or prefix.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NamingError {
    /// The derived name would exceed the provider's length cap.
    #[error("resource name is too long: {0}")]
    TooLong(String),
    /// The derived name does not match the naming grammar.
    #[error("resource name is invalid: {0}")]
    Invalid(String),
}

/// Derives resource names from a validated prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceNamer {
    prefix: String,
}

impl ResourceNamer {
    /// Creates a namer, rejecting prefixes that would make every derived name
    /// invalid.
    ///
    /// # Errors
    ///
    /// Returns [`NamingError`] when `prefix` plus a dummy job id fails the
    /// naming grammar or exceeds the length cap.
    pub fn new(prefix: impl Into<String>) -> Result<Self, NamingError> {
        let prefix = prefix.into();
        validate_name(&format!("{prefix}{VALIDATION_JOB_ID}"))?;
        Ok(Self { prefix })
    }

    /// Derives the resource name for `job_id`. Derivation itself never fails;
    /// the grammar was checked when the prefix was accepted.
    #[must_use]
    pub fn name(&self, job_id: &str) -> String {
        format!("{}{job_id}", self.prefix)
    }

    /// Returns the active prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn validate_name(name: &str) -> Result<(), NamingError> {
    if name.len() > MAX_NAME_LEN {
        return Err(NamingError::TooLong(name.to_owned()));
    }
    if !NAME_GRAMMAR.is_match(name) {
        return Err(NamingError::Invalid(name.to_owned()));
    }
    Ok(())
}

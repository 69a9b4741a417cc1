//! Error types shared by the evaluation path and snapshot publishing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced to evaluation callers.
///
/// Every variant maps to an OFREP error code; none of them is ever turned
/// into a silent default value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("{0}")]
    FlagNotFound(String),

    #[error("configuration has not been loaded yet")]
    ProviderNotReady,

    #[error("{0}")]
    General(String),
}

impl EvalError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidContext(_) => ErrorCode::InvalidContext,
            Self::FlagNotFound(_) => ErrorCode::FlagNotFound,
            Self::ProviderNotReady => ErrorCode::ProviderNotReady,
            Self::General(_) => ErrorCode::General,
        }
    }
}

/// OFREP `errorCode` discriminator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FlagNotFound,
    InvalidContext,
    ProviderNotReady,
    General,
}

/// Reasons a configuration cannot be published as a snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("feature '{feature}' depends on unknown feature '{dependency}'")]
    UnknownDependency { feature: String, dependency: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_as_ofrep_discriminators() {
        let json = serde_json::to_string(&EvalError::ProviderNotReady.code()).unwrap();
        assert_eq!(json, "\"PROVIDER_NOT_READY\"");

        let json = serde_json::to_string(&EvalError::InvalidContext("x".into()).code()).unwrap();
        assert_eq!(json, "\"INVALID_CONTEXT\"");
    }

    #[test]
    fn cycle_message_lists_the_path() {
        let err = PublishError::DependencyCycle {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: A -> B -> A");
    }
}

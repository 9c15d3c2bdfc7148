//! Error types for director operations
//!
//! Configuration problems, module resolution failures and lifecycle failures
//! raised by controllers or agents are kept apart so callers can decide what is
//! fatal and what is only worth a log line.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for director operations
pub type Result<T> = std::result::Result<T, DirectorError>;

/// Lifecycle method that was running when a controller or agent failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SetUp,
    Start,
    IsStarted,
    Stop,
    IsStopped,
    TearDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::SetUp => "setUp",
            Phase::Start => "start",
            Phase::IsStarted => "isStarted",
            Phase::Stop => "stop",
            Phase::IsStopped => "isStopped",
            Phase::TearDown => "tearDown",
        };
        f.write_str(name)
    }
}

/// Error types for the director
#[derive(Debug, Error)]
pub enum DirectorError {
    /// `get_cfg` was called before any configuration was set
    #[error("No configuration has been setup.")]
    ConfigNotSetup,

    /// Structural problem with the configuration text
    #[error("Error in director configuration - {0}")]
    Config(String),

    /// A record is missing a required field or holds an invalid value
    #[error("{0}")]
    Section(String),

    #[error("{0}")]
    ControllerReload(String),

    /// Agent manager misuse
    #[error("{0}")]
    Manager(String),

    /// The import path named by a record could not be resolved
    #[error("The {role} '{path}' from '{record}' could not be imported! {reason}")]
    Import {
        role: String,
        path: String,
        record: String,
        reason: String,
    },

    /// A controller or agent raised an error from one of its lifecycle methods
    #[error("{record} {phase} error: {message}")]
    Lifecycle {
        record: String,
        phase: Phase,
        message: String,
    },

    #[error("Director communication timeout ({0:?})! Is it running?")]
    SignalTimeout(Duration),

    #[error("Message bus error: {0}")]
    Bus(String),

    /// The director handled a remote command and replied with an error
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DirectorError {
    /// Wrap an implementation error raised during `phase` of `record`
    pub fn lifecycle(record: impl fmt::Display, phase: Phase, err: anyhow::Error) -> Self {
        DirectorError::Lifecycle {
            record: record.to_string(),
            phase,
            message: format!("{:#}", err),
        }
    }

    /// True for errors raised while parsing or validating configuration
    pub fn is_config_error(&self) -> bool {
        matches!(self, DirectorError::Config(_) | DirectorError::Section(_))
    }
}

/// How a sweep over many controllers or agents reacts to one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure and stop the sweep, returning the error
    #[default]
    Abort,
    /// Log the failure and carry on with the remaining items
    KeepGoing,
}

impl FailurePolicy {
    pub fn from_keep_going(keep_going: bool) -> Self {
        if keep_going {
            FailurePolicy::KeepGoing
        } else {
            FailurePolicy::Abort
        }
    }

    pub fn keep_going(&self) -> bool {
        matches!(self, FailurePolicy::KeepGoing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_error_message() {
        let err = DirectorError::lifecycle(
            "<Controller: order:4 name:x disabled:no>",
            Phase::Start,
            anyhow::anyhow!("boom"),
        );
        assert_eq!(
            err.to_string(),
            "<Controller: order:4 name:x disabled:no> start error: boom"
        );
    }

    #[test]
    fn test_config_error_classification() {
        assert!(DirectorError::Config("x".into()).is_config_error());
        assert!(DirectorError::Section("x".into()).is_config_error());
        assert!(!DirectorError::ConfigNotSetup.is_config_error());
    }

    #[test]
    fn test_failure_policy_from_flag() {
        assert_eq!(FailurePolicy::from_keep_going(true), FailurePolicy::KeepGoing);
        assert_eq!(FailurePolicy::from_keep_going(false), FailurePolicy::Abort);
        assert!(!FailurePolicy::default().keep_going());
    }
}

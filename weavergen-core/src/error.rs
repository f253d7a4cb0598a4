use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Classification of a failure, used by retry policies (`retry_on`) and
/// carried on error span events. Deliberately small and wire-friendly:
/// handlers declare the kind, the policy matches on it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient failure worth retrying (network hiccup, busy resource).
    Transient,
    /// Permanent handler failure; retrying cannot help.
    Permanent,
    /// Task or run deadline exceeded.
    Timeout,
    /// Cooperative cancellation observed.
    Cancelled,
    /// Input or output failed a declared validation.
    Validation,
    /// Filesystem or subprocess I/O failure.
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "permanent" => Ok(ErrorKind::Permanent),
            "timeout" => Ok(ErrorKind::Timeout),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "validation" => Ok(ErrorKind::Validation),
            "io" => Ok(ErrorKind::Io),
            other => Err(format!("unknown error kind '{other}'")),
        }
    }
}

/// Engine error taxonomy. One variant per kind in the failure-semantics
/// table; tasks-local failures are offered to the retry policy first and
/// only escaped errors surface through these.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("process parse error at '{element}': {message}")]
    ParseProcess { element: String, message: String },

    #[error("unsupported BPMN constructs: {}", .0.join(", "))]
    UnsupportedConstructs(Vec<String>),

    #[error("process verification failed:\n{}", .0.join("\n"))]
    InvalidProcess(Vec<String>),

    #[error("duplicate task id '{0}'")]
    DuplicateTaskId(String),

    #[error("service task '{element}' references unknown registry key '{task_ref}'")]
    UnknownTaskRef { element: String, task_ref: String },

    #[error("invalid task definition '{id}': {message}")]
    InvalidDefinition { id: String, message: String },

    #[error("task '{task}' failed: {message}")]
    HandlerFailed {
        task: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("task '{0}' timed out")]
    Timeout(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("exclusive gateway '{0}': no condition matched and no default flow declared")]
    GatewayNoMatch(String),

    #[error("parallel branch {branch} failed")]
    BranchFailed {
        branch: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("context merge conflict on key '{key}' at join '{join}'")]
    ContextMergeConflict { key: String, join: String },

    #[error("span lifecycle imbalance: {0} span(s) started but never ended")]
    SpanLifecycle(usize),

    #[error("contradicted claim: {0}")]
    ValidationClaim(String),

    #[error("unrecognized configuration option '{key}': {message}")]
    Config { key: String, message: String },

    #[error("artefact i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("condition expression '{text}': {message}")]
    Expression { text: String, message: String },

    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// The retry-relevant classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::HandlerFailed { kind, .. } => *kind,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::ValidationClaim(_) => ErrorKind::Validation,
            _ => ErrorKind::Permanent,
        }
    }

    /// Stable name for the report's error list and span events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ParseProcess { .. }
            | EngineError::UnsupportedConstructs(_)
            | EngineError::InvalidProcess(_) => "ErrParseProcess",
            EngineError::DuplicateTaskId(_) => "ErrDuplicateTaskId",
            EngineError::UnknownTaskRef { .. } => "ErrUnknownTaskRef",
            EngineError::InvalidDefinition { .. } => "ErrInvalidDefinition",
            EngineError::HandlerFailed { .. } => "ErrHandlerFailed",
            EngineError::Timeout(_) => "ErrTimeout",
            EngineError::Cancelled => "ErrCancelled",
            EngineError::GatewayNoMatch(_) => "ErrGatewayNoMatch",
            EngineError::BranchFailed { .. } => "ErrBranchFailed",
            EngineError::ContextMergeConflict { .. } => "ErrContextMergeConflict",
            EngineError::SpanLifecycle(_) => "ErrSpanLifecycle",
            EngineError::ValidationClaim(_) => "ErrValidationClaim",
            EngineError::Config { .. } => "ErrConfig",
            EngineError::Io(_) => "ErrIo",
            EngineError::Expression { .. } => "ErrExpression",
            EngineError::Internal(_) => "ErrInternal",
        }
    }

    /// True for errors that are fatal before any node fires.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            EngineError::ParseProcess { .. }
                | EngineError::UnsupportedConstructs(_)
                | EngineError::InvalidProcess(_)
                | EngineError::DuplicateTaskId(_)
                | EngineError::UnknownTaskRef { .. }
                | EngineError::InvalidDefinition { .. }
                | EngineError::Config { .. }
                | EngineError::Expression { .. }
        )
    }
}

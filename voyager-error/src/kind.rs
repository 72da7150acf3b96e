//! Error kinds for voyager operations

use std::fmt;

/// The kind of error that occurred.
///
/// Kinds are grouped by the component that raises them. Callers match on the
/// kind to decide whether a failure ends the attempt or the whole episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// An unexpected error occurred - catch-all for unhandled cases
    Unexpected,

    /// The requested feature or operation is not supported
    Unsupported,

    /// Invalid configuration or parameters
    ConfigInvalid,

    /// Invalid argument passed to function
    InvalidArgument,

    // =========================================================================
    // Validator errors
    // =========================================================================
    /// Validator binary missing or could not be spawned
    LaunchFailed,

    /// Validator did not print its ready marker in time
    LaunchTimeout,

    /// Validator exited before becoming ready
    PrematureExit,

    /// Validator could not be shut down cleanly
    ShutdownFailed,

    // =========================================================================
    // Skill execution errors
    // =========================================================================
    /// Skill code threw, failed to compile, or exited non-zero
    ExecutionFailed,

    /// Skill runner exceeded its wall-clock budget
    ExecutionTimeout,

    /// Skill runner output did not contain exactly one transaction
    MalformedOutput,

    /// Skill runtime (interpreter) is not installed
    RuntimeUnavailable,

    // =========================================================================
    // Submission errors
    // =========================================================================
    /// Agent keypair was not funded before submission
    NotFunded,

    /// Transaction could not be decoded or signed
    SigningFailed,

    /// Transaction submission failed
    SubmissionFailed,

    /// Transaction was not confirmed within the bound
    ConfirmationTimeout,

    /// Confirmed transaction could not be fetched
    TransactionNotFound,

    /// Submission response was malformed in the known validator way;
    /// the transaction may have landed
    PossiblySucceeded,

    /// JSON-RPC endpoint returned an error object
    RpcFailed,

    // =========================================================================
    // Discovery errors
    // =========================================================================
    /// Failed to parse input (transaction record, runner output, CSV row)
    ParseFailed,

    // =========================================================================
    // Registry / storage errors
    // =========================================================================
    /// Skill id or name not found
    SkillNotFound,

    /// Known-program registry missing, empty or malformed
    RegistryInvalid,

    /// Storage operation failed
    StorageFailed,

    /// Serialization/deserialization failed
    SerializationFailed,

    // =========================================================================
    // Planner errors
    // =========================================================================
    /// LLM inference failed
    InferenceFailed,

    /// Rate limit exceeded
    RateLimited,

    /// Provider not available
    ProviderUnavailable,

    // =========================================================================
    // IO errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    /// Network error
    NetworkFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            // General
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::InvalidArgument => "InvalidArgument",

            // Validator
            ErrorKind::LaunchFailed => "LaunchFailed",
            ErrorKind::LaunchTimeout => "LaunchTimeout",
            ErrorKind::PrematureExit => "PrematureExit",
            ErrorKind::ShutdownFailed => "ShutdownFailed",

            // Execution
            ErrorKind::ExecutionFailed => "ExecutionFailed",
            ErrorKind::ExecutionTimeout => "ExecutionTimeout",
            ErrorKind::MalformedOutput => "MalformedOutput",
            ErrorKind::RuntimeUnavailable => "RuntimeUnavailable",

            // Submission
            ErrorKind::NotFunded => "NotFunded",
            ErrorKind::SigningFailed => "SigningFailed",
            ErrorKind::SubmissionFailed => "SubmissionFailed",
            ErrorKind::ConfirmationTimeout => "ConfirmationTimeout",
            ErrorKind::TransactionNotFound => "TransactionNotFound",
            ErrorKind::PossiblySucceeded => "PossiblySucceeded",
            ErrorKind::RpcFailed => "RpcFailed",

            // Discovery
            ErrorKind::ParseFailed => "ParseFailed",

            // Registry / storage
            ErrorKind::SkillNotFound => "SkillNotFound",
            ErrorKind::RegistryInvalid => "RegistryInvalid",
            ErrorKind::StorageFailed => "StorageFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",

            // Planner
            ErrorKind::InferenceFailed => "InferenceFailed",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::ProviderUnavailable => "ProviderUnavailable",

            // IO
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::NetworkFailed => "NetworkFailed",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::InferenceFailed
                | ErrorKind::NetworkFailed
                | ErrorKind::RateLimited
                | ErrorKind::ExecutionTimeout
                | ErrorKind::ConfirmationTimeout
                | ErrorKind::ProviderUnavailable
        )
    }

    /// Check if this error ends the whole episode rather than one attempt.
    ///
    /// Only launch failures (the validator never became usable) and an
    /// unfunded agent qualify; everything else is contained to the attempt.
    pub fn is_episode_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::LaunchFailed
                | ErrorKind::LaunchTimeout
                | ErrorKind::PrematureExit
                | ErrorKind::NotFunded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Environment error types
//!
//! Re-exports voyager-error and provides component-specific constructors.

pub use voyager_error::{Error, ErrorKind, ErrorStatus, Result};

// =============================================================================
// Validator
// =============================================================================

/// Create a LaunchFailed error
pub fn launch_failed(binary: impl Into<String>, reason: impl Into<String>) -> Error {
    let binary = binary.into();
    Error::new(ErrorKind::LaunchFailed, reason)
        .with_operation("validator::start")
        .with_context("binary", binary)
}

/// Create a LaunchTimeout error
pub fn launch_timeout(binary: impl Into<String>, secs: u64) -> Error {
    Error::new(
        ErrorKind::LaunchTimeout,
        format!("validator not ready after {}s", secs),
    )
    .with_operation("validator::start")
    .with_context("binary", binary.into())
    .with_context("timeout_secs", secs.to_string())
}

/// Create a PrematureExit error
pub fn premature_exit(binary: impl Into<String>) -> Error {
    Error::new(ErrorKind::PrematureExit, "validator exited before becoming ready")
        .with_operation("validator::start")
        .with_context("binary", binary.into())
}

/// Create a ShutdownFailed error
pub fn shutdown_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::ShutdownFailed, reason).with_operation("validator::stop")
}

// =============================================================================
// Skill execution
// =============================================================================

/// Create an ExecutionFailed error
pub fn execution_failed(detail: impl Into<String>) -> Error {
    Error::new(ErrorKind::ExecutionFailed, detail)
}

/// Create an ExecutionTimeout error
pub fn execution_timeout(timeout_ms: u64) -> Error {
    Error::new(
        ErrorKind::ExecutionTimeout,
        format!("skill did not finish within {}ms", timeout_ms),
    )
    .with_context("timeout_ms", timeout_ms.to_string())
}

/// Create a MalformedOutput error
pub fn malformed_output(detail: impl Into<String>) -> Error {
    Error::new(ErrorKind::MalformedOutput, detail)
}

/// Create a RuntimeUnavailable error
pub fn runtime_unavailable(runtime: impl Into<String>) -> Error {
    let runtime = runtime.into();
    Error::new(
        ErrorKind::RuntimeUnavailable,
        format!("skill runtime '{}' could not be started", runtime),
    )
    .with_context("runtime", runtime)
}

// =============================================================================
// Submission
// =============================================================================

/// Create a NotFunded error
pub fn not_funded() -> Error {
    Error::new(ErrorKind::NotFunded, "agent keypair has not been funded")
        .with_operation("submission::submit")
}

/// Create a SigningFailed error
pub fn signing_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::SigningFailed, reason).with_operation("submission::sign")
}

/// Create a SubmissionFailed error
pub fn submission_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::SubmissionFailed, reason).with_operation("submission::submit")
}

/// Create a ConfirmationTimeout error
pub fn confirmation_timeout(signature: impl Into<String>, secs: u64) -> Error {
    Error::new(
        ErrorKind::ConfirmationTimeout,
        format!("transaction not confirmed within {}s", secs),
    )
    .with_operation("rpc::confirm_transaction")
    .with_context("signature", signature.into())
}

/// Create a TransactionNotFound error
pub fn transaction_not_found(signature: impl Into<String>) -> Error {
    let signature = signature.into();
    Error::new(
        ErrorKind::TransactionNotFound,
        format!("transaction {} not found", signature),
    )
    .with_operation("rpc::get_transaction")
    .with_context("signature", signature)
}

/// Create a PossiblySucceeded error
pub fn possibly_succeeded(detail: impl Into<String>) -> Error {
    Error::possibly_succeeded(detail).with_operation("rpc::send_transaction")
}

/// Create an RpcFailed error from a JSON-RPC error object
pub fn rpc_failed(method: &'static str, code: i64, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::RpcFailed, message)
        .with_operation("rpc::call")
        .with_context("method", method)
        .with_context("code", code.to_string())
}

// =============================================================================
// Parsing, registry and storage
// =============================================================================

/// Create a ParseFailed error
pub fn parse_error(message: impl Into<String>) -> Error {
    Error::parse_failed(message)
}

/// Create a SkillNotFound error
pub fn skill_not_found(skill: impl Into<String>) -> Error {
    Error::skill_not_found(skill)
}

/// Create a RegistryInvalid error
pub fn registry_invalid(path: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::RegistryInvalid, reason)
        .with_operation("programs::load_csv")
        .with_context("path", path.into())
}

/// Create a StorageFailed error
pub fn storage_failed(reason: impl Into<String>) -> Error {
    Error::new(ErrorKind::StorageFailed, reason)
}

/// Create an IoFailed error
pub fn io_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::IoFailed, message)
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SerializationFailed, message)
}

// =============================================================================
// General
// =============================================================================

/// Create an InvalidArgument error
pub fn invalid_argument(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidArgument, message)
}

/// Create a ConfigInvalid error
pub fn config_invalid(message: impl Into<String>) -> Error {
    Error::config_invalid(message)
}

/// Create a NetworkFailed error
pub fn network_error(message: impl Into<String>) -> Error {
    Error::network_failed(message)
}

/// Create an InferenceFailed error
pub fn inference_failed(reason: impl Into<String>) -> Error {
    Error::inference_failed(reason)
}

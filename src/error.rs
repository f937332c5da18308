use std::process::ExitStatus;

/// Failure classes of the rig. Everything else travels as a plain
/// `anyhow::Error` with context attached.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no compatible device found: {0}")]
    DeviceNotFound(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    ToolchainMissing(String),
    #[error("`{command}` exited with {status}: {stderr}")]
    Toolchain {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

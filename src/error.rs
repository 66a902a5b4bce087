use crate::state::SupervisorState;
use std::io;
use std::time::Duration;

/// 启动失败的原因
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("supervisor cannot start from state {0}")]
    InvalidState(SupervisorState),

    #[error("insufficient system memory ({0} KB available)")]
    InsufficientMemory(u64),

    #[error("{0} not found, please install it first")]
    BinaryNotFound(String),

    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{name} failed to start (port {port} not available after {timeout:?})")]
    PortTimeout {
        name: String,
        port: u16,
        timeout: Duration,
    },

    #[error("{name} exited unexpectedly: {detail}")]
    EarlyExit { name: String, detail: String },
}

impl StartError {
    /// 失败发生在哪个启动阶段
    pub fn phase(&self) -> &'static str {
        match self {
            StartError::InvalidState(_) | StartError::InsufficientMemory(_) => "preflight",
            StartError::BinaryNotFound(_) => "locating binaries",
            StartError::Spawn { .. } => "starting processes",
            StartError::PortTimeout { .. } => "confirming port",
            StartError::EarlyExit { .. } => "starting capture",
        }
    }
}

use thiserror::Error;

use crate::app::subscription::SyncError;
use crate::app::supervisor::SupervisorError;
use crate::builder::ConfigValidationError;
use crate::store::{RegistryError, StoreError};

/// 控制面对外暴露的统一错误
#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("TUN mode switch already in progress")]
    TunBusy,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ControlError {
    /// Whether the failed operation may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether this error needs user action before retrying makes sense.
    pub fn is_permanent(&self) -> bool {
        self.kind().is_permanent()
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Config(ConfigValidationError::ChainCycle { .. }) => ErrorKind::ChainCycle,
            ControlError::Config(_) => ErrorKind::ConfigValidation,
            ControlError::Supervisor(e) => match e {
                SupervisorError::Launch(_) => ErrorKind::CoreLaunch,
                SupervisorError::CrashLoop => ErrorKind::CrashLoop,
                SupervisorError::InvalidState { .. } => ErrorKind::InvalidState,
                SupervisorError::Stage(_) => ErrorKind::Io,
            },
            ControlError::Sync(e) => match e {
                SyncError::InProgress { .. } => ErrorKind::SyncInProgress,
                SyncError::Fetch { .. } => ErrorKind::SyncFetch,
                SyncError::Parse { .. } => ErrorKind::SyncParse,
                SyncError::Cancelled { .. } => ErrorKind::Cancelled,
                SyncError::NotSubscription { .. } => ErrorKind::InvalidState,
                SyncError::Registry(_) => ErrorKind::Registry,
            },
            ControlError::Registry(RegistryError::Store(_)) | ControlError::Store(_) => {
                ErrorKind::Io
            }
            ControlError::Registry(_) => ErrorKind::Registry,
            ControlError::TunBusy => ErrorKind::TunBusy,
            ControlError::Other(_) => ErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigValidation,
    ChainCycle,
    CoreLaunch,
    CrashLoop,
    InvalidState,
    SyncInProgress,
    SyncFetch,
    SyncParse,
    TunBusy,
    Registry,
    Cancelled,
    Io,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigValidation => "CONFIG_VALIDATION",
            ErrorKind::ChainCycle => "CHAIN_CYCLE",
            ErrorKind::CoreLaunch => "CORE_LAUNCH",
            ErrorKind::CrashLoop => "CRASH_LOOP",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::SyncInProgress => "SYNC_IN_PROGRESS",
            ErrorKind::SyncFetch => "SYNC_FETCH",
            ErrorKind::SyncParse => "SYNC_PARSE",
            ErrorKind::TunBusy => "TUN_BUSY",
            ErrorKind::Registry => "REGISTRY",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Io => "IO",
            ErrorKind::Other => "OTHER",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::SyncFetch | ErrorKind::SyncInProgress | ErrorKind::TunBusy | ErrorKind::Io
        )
    }

    /// 校验失败、崩溃循环等不会自行恢复
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigValidation
                | ErrorKind::ChainCycle
                | ErrorKind::CrashLoop
                | ErrorKind::SyncParse
                | ErrorKind::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

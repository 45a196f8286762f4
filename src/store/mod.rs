//! Profile / Route 注册表
//!
//! 两个注册表都是写时复制：读者拿到 `Arc` 快照，写者在闭包里修改一份副本，
//! 闭包成功且落盘成功后才发布。写操作之间由一把写锁串行化，
//! 读者永远看不到改了一半的实体。

pub mod persist;
pub mod profiles;
pub mod routes;

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;

pub use persist::{JsonFile, StoreError};
pub use profiles::{ProfileData, ProfileRegistry};
pub use routes::{RouteData, RouteRegistry};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("{entity}: {reason}")]
    Rejected { entity: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub(crate) fn not_found(entity: impl Into<String>) -> Self {
        RegistryError::NotFound {
            entity: entity.into(),
        }
    }

    pub(crate) fn rejected(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::Rejected {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// 写时复制单元
pub(crate) struct SnapshotCell<T> {
    current: RwLock<Arc<T>>,
    writer: Mutex<()>,
}

impl<T: Clone> SnapshotCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
            writer: Mutex::new(()),
        }
    }

    pub(crate) fn load(&self) -> Arc<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `mutate` 或 `commit` 任一失败都不会发布新值
    pub(crate) fn update<R, E>(
        &self,
        mutate: impl FnOnce(&mut T) -> Result<R, E>,
        commit: impl FnOnce(&T) -> Result<(), E>,
    ) -> Result<R, E> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.load()).clone();
        let out = mutate(&mut next)?;
        commit(&next)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(out)
    }
}

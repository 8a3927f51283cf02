//! Async access to the SQLite store.
//!
//! `rusqlite::Connection` is blocking, so every call runs on the blocking
//! thread pool behind a mutex. Closures receive `&mut Database` so callers can
//! read, validate and write inside one critical section.

use std::sync::{Arc, Mutex, PoisonError};

use whisper_store::Database;

use crate::error::{Result, ServerError};

#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut db)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("database task failed: {e}")))?
    }
}

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;

use super::models::{EnhancementRequest, RequestStatus};
use crate::errors::QueueError;

/// Async-safe handle to the queue file.
///
/// Runs every access on tokio's blocking pool via `spawn_blocking` so file I/O
/// and lock waits never tie up async worker threads.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<QueueStore>,
}

impl QueueHandle {
    pub fn new(store: QueueStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Run a closure against the store on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&QueueStore) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))?
    }

    pub async fn load(&self) -> Result<Vec<EnhancementRequest>, QueueError> {
        self.call(|store| store.load()).await
    }

    pub async fn list(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<EnhancementRequest>, QueueError> {
        let all = self.load().await?;
        Ok(match status {
            Some(status) => all.into_iter().filter(|r| r.status == status).collect(),
            None => all,
        })
    }

    pub async fn append(
        &self,
        request: EnhancementRequest,
    ) -> Result<EnhancementRequest, QueueError> {
        self.call(move |store| store.append(request)).await
    }

    pub async fn requeue(&self, id: String) -> Result<EnhancementRequest, QueueError> {
        self.call(move |store| store.requeue(&id)).await
    }

    pub async fn apply_updates(
        &self,
        updates: Vec<EnhancementRequest>,
    ) -> Result<usize, QueueError> {
        self.call(move |store| store.apply_updates(&updates)).await
    }
}

/// JSON-file queue: an ordered array of requests, read and rewritten whole.
///
/// Mutations hold an exclusive lock on a sidecar `.lock` file so an intake
/// append cannot interleave with a cycle writing its results back.
pub struct QueueStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl QueueStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, path: &Path) -> impl FnOnce(std::io::Error) -> QueueError {
        let path = path.to_path_buf();
        move |source| QueueError::Io { path, source }
    }

    fn lock(&self) -> Result<File, QueueError> {
        if let Some(parent) = self.lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(self.io_err(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(self.io_err(&self.lock_path))?;
        file.lock_exclusive().map_err(self.io_err(&self.lock_path))?;
        Ok(file)
    }

    fn read_unlocked(&self) -> Result<Vec<EnhancementRequest>, QueueError> {
        if !self.path.exists() {
            self.write_unlocked(&[])?;
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(self.io_err(&self.path))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let storage_err = |e: serde_json::Error| QueueError::Storage {
            path: self.path.clone(),
            message: e.to_string(),
        };
        let raw: Vec<serde_json::Value> = serde_json::from_str(&content).map_err(storage_err)?;
        let missing_ids = raw.iter().any(|v| v.get("id").is_none());
        let requests: Vec<EnhancementRequest> =
            serde_json::from_value(serde_json::Value::Array(raw)).map_err(storage_err)?;

        // Hand-written entries get an id on first read; persist it so later
        // write-backs can match by id.
        if missing_ids {
            self.write_unlocked(&requests)?;
        }
        Ok(requests)
    }

    /// Write to a temp file in the same directory, then rename over the queue.
    fn write_unlocked(&self, requests: &[EnhancementRequest]) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(self.io_err(parent))?;
        }
        let json = serde_json::to_string_pretty(requests).map_err(|e| QueueError::Storage {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let mut file = File::create(&tmp_path).map_err(self.io_err(&tmp_path))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(self.io_err(&tmp_path))?;
        std::fs::rename(&tmp_path, &self.path).map_err(self.io_err(&self.path))?;
        Ok(())
    }

    /// Lock, read, let `f` mutate, write back. Nothing is written if `f` fails.
    pub fn update<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut Vec<EnhancementRequest>) -> Result<R, QueueError>,
    {
        let lock = self.lock()?;
        let mut requests = self.read_unlocked()?;
        let result = f(&mut requests)?;
        self.write_unlocked(&requests)?;
        drop(lock);
        Ok(result)
    }

    /// Read the whole queue. A missing file is initialized to `[]`.
    pub fn load(&self) -> Result<Vec<EnhancementRequest>, QueueError> {
        let _lock = self.lock()?;
        self.read_unlocked()
    }

    /// Replace the whole queue.
    pub fn save(&self, requests: &[EnhancementRequest]) -> Result<(), QueueError> {
        let _lock = self.lock()?;
        self.write_unlocked(requests)
    }

    /// Validate and append a request, persisting immediately.
    pub fn append(&self, request: EnhancementRequest) -> Result<EnhancementRequest, QueueError> {
        request.validate()?;
        self.update(move |requests| {
            requests.push(request.clone());
            Ok(request)
        })
    }

    /// Reset a request to `new`, clearing its previous outcome.
    pub fn requeue(&self, id: &str) -> Result<EnhancementRequest, QueueError> {
        self.update(|requests| {
            let request = requests
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| QueueError::NotFound { id: id.to_string() })?;
            request.requeue();
            Ok(request.clone())
        })
    }

    /// Write back processed requests by id, leaving every other entry
    /// (including ones appended since the caller loaded) untouched.
    /// Returns how many entries were updated.
    pub fn apply_updates(&self, updates: &[EnhancementRequest]) -> Result<usize, QueueError> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.update(|requests| {
            let mut applied = 0;
            for update in updates {
                if let Some(slot) = requests.iter_mut().find(|r| r.id == update.id) {
                    *slot = update.clone();
                    applied += 1;
                }
            }
            Ok(applied)
        })
    }
}

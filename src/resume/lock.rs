//! Exclusive process lock next to the progress store.
//!
//! fd-lock guards borrow the lock they came from, so the guard lives on a
//! small holder thread that releases it when [`CrawlLock`] is dropped.

use fd_lock::RwLock;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock file could not be created or opened
    #[error("failed to open lock file {path}: {source}")]
    Open {
        /// Lock file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Another process holds the lock
    #[error("another crawler is already using {0}")]
    Held(PathBuf),

    /// Holder thread could not be started
    #[error("lock holder thread failed: {0}")]
    Thread(String),
}

/// Held for the lifetime of a crawl; released on drop.
pub struct CrawlLock {
    path: PathBuf,
    release: Option<mpsc::Sender<()>>,
    holder: Option<JoinHandle<()>>,
}

impl CrawlLock {
    /// Lock `<database>.lock`, failing immediately if it is taken.
    pub fn try_acquire(database_path: &Path) -> Result<Self, LockError> {
        let path = database_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        let (ready_tx, ready_rx) = mpsc::channel::<bool>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = thread::Builder::new()
            .name("crawl-lock".into())
            .spawn(move || {
                let mut lock = RwLock::new(file);
                match lock.try_write() {
                    Ok(_guard) => {
                        if ready_tx.send(true).is_ok() {
                            // Blocks until the sender is dropped.
                            let _ = release_rx.recv();
                        }
                    }
                    Err(_) => {
                        let _ = ready_tx.send(false);
                    }
                };
            })
            .map_err(|e| LockError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(true) => {
                debug!(path = %path.display(), "Crawl lock acquired");
                Ok(Self {
                    path,
                    release: Some(release_tx),
                    holder: Some(holder),
                })
            }
            Ok(false) => {
                let _ = holder.join();
                Err(LockError::Held(path))
            }
            Err(_) => Err(LockError::Thread("holder exited early".into())),
        }
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CrawlLock {
    fn drop(&mut self) {
        drop(self.release.take());
        if let Some(holder) = self.holder.take() {
            let _ = holder.join();
        }
    }
}

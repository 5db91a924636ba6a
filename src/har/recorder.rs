//! In-memory HAR log with rewrite-on-append persistence.
//!
//! Appends are serialised behind a mutex; when a file path is configured the
//! whole log is rewritten as pretty-printed JSON after every entry
//! (last-writer-wins, not crash-safe). Flush failures are logged and never
//! affect the response that produced the entry.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

use super::model::{Har, HarEntry, HarLog};

pub struct HarRecorder {
    log: Mutex<HarLog>,
    path: Option<PathBuf>,
}

impl HarRecorder {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            log: Mutex::new(HarLog::new(
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            )),
            path,
        }
    }

    /// Append one entry and flush the whole log to disk if configured.
    pub fn append(&self, entry: HarEntry) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        info!(url = %entry.request.url, status = entry.response.status, "added HAR entry");
        log.entries.push(entry);

        let Some(path) = &self.path else {
            return;
        };
        match serde_json::to_string_pretty(&Har { log: &log }) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "failed writing HAR file");
                }
            }
            Err(e) => warn!(error = %e, "failed serialising HAR log"),
        }
    }

    pub fn len(&self) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the accumulated entries, mostly for inspection in tests.
    pub fn entries(&self) -> Vec<HarEntry> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clone()
    }
}

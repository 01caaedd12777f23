use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tracing::info;

/// Append-only, human-readable record of what the server did.
///
/// Every entry is also emitted through `tracing` so operators see it live.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl AsRef<str>) {
        let event = event.as_ref();
        info!("{event}");
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), event);
        self.entries().push(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries().clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    // Entries are plain strings, so a panic mid-push cannot leave them torn.
    fn entries(&self) -> MutexGuard<'_, Vec<String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

use std::collections::HashSet;
use std::sync::Mutex;

/// Receives per-job lifecycle events from the download pipeline.
///
/// Implementations must tolerate out-of-order calls for a job; the aggregate
/// view is recomputed from the live active set on every call rather than
/// derived from the event itself.
pub trait NotificationPresenter: Send + Sync {
    fn on_created(&self, job_id: &str, title: &str);
    fn on_progress(&self, job_id: &str, title: &str, percent: u8, indeterminate: bool);
    fn on_completed(&self, job_id: &str, title: &str);
    fn on_failed(&self, job_id: &str, title: &str);
    fn on_canceled(&self, job_id: &str);
}

/// Log-backed presenter: one line per lifecycle event plus an aggregate
/// "downloads in progress" line that clears once the active set empties.
pub struct LogPresenter {
    active: Mutex<HashSet<String>>,
}

impl LogPresenter {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    fn summary(&self) {
        let count = match self.active.lock() {
            Ok(active) => active.len(),
            Err(_) => return,
        };
        if count == 0 {
            log::info!("All downloads finished");
        } else {
            log::info!("{} download(s) in progress", count);
        }
    }

    fn track(&self, job_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(job_id.to_string());
        }
    }

    fn untrack(&self, job_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(job_id);
        }
    }
}

impl Default for LogPresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationPresenter for LogPresenter {
    fn on_created(&self, job_id: &str, title: &str) {
        self.track(job_id);
        log::info!("⬇️ Queued: {}", title);
        self.summary();
    }

    fn on_progress(&self, job_id: &str, title: &str, percent: u8, indeterminate: bool) {
        self.track(job_id);
        if indeterminate {
            log::debug!("Working on {} ...", title);
        } else {
            log::debug!("{}: {}%", title, percent);
        }
    }

    fn on_completed(&self, job_id: &str, title: &str) {
        self.untrack(job_id);
        log::info!("✅ Completed: {}", title);
        self.summary();
    }

    fn on_failed(&self, job_id: &str, title: &str) {
        self.untrack(job_id);
        log::error!("❌ Failed: {}", title);
        self.summary();
    }

    fn on_canceled(&self, job_id: &str) {
        self.untrack(job_id);
        log::info!("🚫 Canceled download {}", job_id);
        self.summary();
    }
}

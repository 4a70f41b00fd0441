// ! Per-plugin request metrics
// !
// ! Counters live on the loaded instance and survive a reload of the same
// ! plugin; uptime is measured from the current instance's load.

use crate::core::error::PluginError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Number of recent errors kept per plugin
pub const ERROR_HISTORY: usize = 10;

/// One recorded plugin failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Live counters of one plugin
#[derive(Debug, Default)]
pub struct PluginMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    recent: Mutex<VecDeque<ErrorEntry>>,
}

impl PluginMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error and keep it in the bounded history
    pub fn record_error(&self, error: &PluginError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == ERROR_HISTORY {
            recent.pop_front();
        }
        recent.push_back(ErrorEntry {
            kind: error.kind().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Oldest first
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self, loaded_at: DateTime<Utc>) -> PluginStats {
        PluginStats {
            request_count: self.request_count(),
            error_count: self.error_count(),
            uptime_secs: (Utc::now() - loaded_at).num_seconds().max(0) as u64,
            recent_errors: self.recent_errors(),
        }
    }
}

/// Snapshot of [`PluginMetrics`] for API responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    pub request_count: u64,
    pub error_count: u64,
    pub uptime_secs: u64,
    pub recent_errors: Vec<ErrorEntry>,
}

/// Totals across every loaded plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub total_plugins: usize,
    pub active_plugins: usize,
    pub disabled_plugins: usize,
    pub faulted_plugins: usize,
    pub total_routes: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

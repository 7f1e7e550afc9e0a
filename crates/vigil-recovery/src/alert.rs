//! Alert channel seam plus a bounded in-memory record of what was sent.
//!
//! Transport is opaque: the core only needs fire-and-forget delivery to a
//! named recipient. The production sink (configured command) lives in the
//! binary crate; tests use a recording sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Write-only alert delivery. Implementations must complete within the
/// 30-second alert budget; a slow transport should enforce its own deadline.
pub trait AlertSink: Send + Sync {
    /// Deliver `message` to `to`. Returns whether delivery succeeded.
    fn send(&self, to: &str, message: &str) -> bool;
}

/// Fallback sink that only logs. Used when no alert command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, to: &str, message: &str) -> bool {
        warn!(to, message, "alert (log-only sink)");
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One dispatched alert, as remembered by [`AlertLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub severity: AlertSeverity,
    pub to: String,
    pub message: String,
    pub delivered: bool,
    pub sent_at: DateTime<Utc>,
}

/// Bounded ring of recently dispatched alerts.
#[derive(Debug, Default)]
pub struct AlertLog {
    records: Vec<AlertRecord>,
    cap: usize,
}

impl AlertLog {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            cap: 1000,
        }
    }

    pub fn record(&mut self, severity: AlertSeverity, to: &str, message: &str, delivered: bool) {
        let record = AlertRecord {
            severity,
            to: to.to_string(),
            message: message.to_string(),
            delivered,
            sent_at: Utc::now(),
        };

        match severity {
            AlertSeverity::Info => info!(to, delivered, "{message}"),
            AlertSeverity::Warning => warn!(to, delivered, "{message}"),
            AlertSeverity::Critical => error!(to, delivered, "{message}"),
        }

        self.records.push(record);
        if self.records.len() > self.cap {
            let excess = self.records.len() - self.cap;
            self.records.drain(..excess);
        }
    }

    /// Alerts dispatched within the last `hours`.
    pub fn recent(&self, hours: i64) -> Vec<&AlertRecord> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        self.records
            .iter()
            .filter(|r| r.sent_at >= cutoff)
            .collect()
    }

    /// Counts per severity over the last 24 hours.
    pub fn summary(&self) -> AlertSummary {
        let mut summary = AlertSummary::default();
        for record in self.recent(24) {
            match record.severity {
                AlertSeverity::Info => summary.info += 1,
                AlertSeverity::Warning => summary.warning += 1,
                AlertSeverity::Critical => summary.critical += 1,
            }
            if !record.delivered {
                summary.undelivered += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
    pub undelivered: usize,
}

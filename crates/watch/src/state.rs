use derive_more::Display;
use ferry_sync::SyncResult;
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    #[display("stopped")]
    Stopped,
    #[display("watching")]
    Watching,
    #[display("syncing")]
    Syncing,
}

/// Live, observable state of one watch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WatchState {
    pub phase: Phase,
    /// The pipeline is running (watching or syncing).
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
    pub files_synced_total: u64,
    pub bytes_synced_total: u64,
    /// Sync cycles that failed outright or finished with path errors.
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl WatchState {
    /// The pipeline (re)started. Totals carry over a restart.
    pub(crate) fn resume(&mut self, now: OffsetDateTime) {
        self.phase = Phase::Watching;
        self.active = true;
        self.started_at = Some(now);
    }

    pub(crate) fn syncing(&mut self) {
        self.phase = Phase::Syncing;
    }

    pub(crate) fn stopped(&mut self, error: Option<String>) {
        self.phase = Phase::Stopped;
        self.active = false;
        if error.is_some() {
            self.last_error = error;
        }
    }

    pub(crate) fn record(&mut self, record: &SyncRecord) {
        self.last_sync_at = Some(record.at);
        self.files_synced_total += record.files_transferred as u64;
        self.bytes_synced_total += record.bytes;
        if record.errors > 0 || record.first_error.is_some() {
            self.error_count += 1;
            self.last_error.clone_from(&record.first_error);
        }
        if self.phase == Phase::Syncing {
            self.phase = Phase::Watching;
        }
    }
}

/// What started a sync cycle.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// The full sync a watch runs when it starts.
    #[display("startup")]
    Startup,
    /// A debounced batch of changes.
    #[display("changes")]
    Changes,
    /// An explicit request through the manager.
    #[display("manual")]
    Manual,
}

/// One finished sync cycle of a watch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub trigger: Trigger,
    /// Paths in the batch; zero for full syncs.
    pub batch: usize,
    pub files_transferred: usize,
    pub files_deleted: usize,
    pub bytes: u64,
    pub errors: usize,
    pub duration: Duration,
    pub first_error: Option<String>,
}

impl SyncRecord {
    pub(crate) fn completed(at: OffsetDateTime, trigger: Trigger, batch: usize, result: &SyncResult) -> Self {
        Self {
            at,
            trigger,
            batch,
            files_transferred: result.files_transferred(),
            files_deleted: result.files_deleted(),
            bytes: result.bytes_transferred,
            errors: result.errors.len(),
            duration: result.duration,
            first_error: result.errors.first().map(ToString::to_string),
        }
    }

    /// A sync that never got as far as transferring anything.
    pub(crate) fn failed(at: OffsetDateTime, trigger: Trigger, batch: usize, duration: Duration, error: String) -> Self {
        Self {
            at,
            trigger,
            batch,
            files_transferred: 0,
            files_deleted: 0,
            bytes: 0,
            errors: 1,
            duration,
            first_error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_sync::{FailureKind, PathError};
    use std::path::PathBuf;

    #[test]
    fn test_state_accumulates_records() {
        let now = OffsetDateTime::now_utc();
        let mut state = WatchState::default();
        state.resume(now);
        state.syncing();
        assert_eq!(state.phase, Phase::Syncing);

        let clean = SyncResult {
            transferred: vec![PathBuf::from("a"), PathBuf::from("b")],
            bytes_transferred: 30,
            ..SyncResult::default()
        };
        state.record(&SyncRecord::completed(now, Trigger::Changes, 2, &clean));
        assert_eq!(state.phase, Phase::Watching);
        assert_eq!(state.files_synced_total, 2);
        assert_eq!(state.bytes_synced_total, 30);
        assert_eq!(state.error_count, 0);
        assert_eq!(state.last_sync_at, Some(now));

        let partial = SyncResult {
            transferred: vec![PathBuf::from("c")],
            bytes_transferred: 5,
            errors: vec![PathError::new("d", FailureKind::Unavailable, "backend down")],
            ..SyncResult::default()
        };
        state.record(&SyncRecord::completed(now, Trigger::Changes, 2, &partial));
        assert_eq!(state.files_synced_total, 3);
        assert_eq!(state.error_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("d: unavailable: backend down"));

        state.record(&SyncRecord::failed(now, Trigger::Manual, 0, Duration::ZERO, "listing failed".to_string()));
        assert_eq!(state.error_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("listing failed"));
        assert!(state.active);
    }

    #[test]
    fn test_stopped_keeps_previous_error_unless_replaced() {
        let mut state = WatchState::default();
        state.resume(OffsetDateTime::now_utc());
        state.last_error = Some("earlier".to_string());
        state.stopped(None);
        assert_eq!(state.phase, Phase::Stopped);
        assert!(!state.active);
        assert_eq!(state.last_error.as_deref(), Some("earlier"));
        state.stopped(Some("root removed".to_string()));
        assert_eq!(state.last_error.as_deref(), Some("root removed"));
    }

    #[test]
    fn test_record_serializes_rfc3339() {
        let at = OffsetDateTime::UNIX_EPOCH;
        let record = SyncRecord::completed(at, Trigger::Startup, 0, &SyncResult::default());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["at"], "1970-01-01T00:00:00Z");
        assert_eq!(json["trigger"], "startup");
    }
}

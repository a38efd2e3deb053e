//! Preference gate: per-user delivery policy checks.
//!
//! Preferences live in an external store behind a read-only trait. The
//! gate caches them briefly and fails open when the store is down, since
//! dropping notifications on an outage is worse than over-delivering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::notification::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestMode {
    Immediate,
    Hourly,
    Daily,
    Weekly,
}

/// One weekly do-not-disturb window. `day_of_week` uses 0 = Sunday.
/// A window whose start is after its end wraps past midnight into the
/// following day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DndWindow {
    pub day_of_week: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Legacy daily quiet-hours range, kept for users who have not migrated
/// to weekly windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreferences {
    pub batching_enabled: bool,
    pub max_batch_size: usize,
    pub batch_window_minutes: u32,
    pub digest: DigestMode,
    pub minimum_priority: Priority,
    pub dnd_enabled: bool,
    pub dnd_windows: Vec<DndWindow>,
    pub quiet_hours: Option<QuietHours>,
    /// User's offset from UTC, for evaluating DND in their local time
    pub utc_offset_minutes: i32,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            batching_enabled: true,
            max_batch_size: 10,
            batch_window_minutes: 15,
            digest: DigestMode::Immediate,
            minimum_priority: Priority::Low,
            dnd_enabled: false,
            dnd_windows: Vec::new(),
            quiet_hours: None,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("Preference store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to externally managed user preferences
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Load a user's preferences. `None` means the user has never set
    /// any and defaults apply.
    async fn load(&self, user_id: &str) -> Result<Option<UserPreferences>, PreferenceError>;
}

/// Store that always reports defaults. Used when no external store is
/// configured.
pub struct StaticPreferenceStore;

#[async_trait]
impl PreferenceStore for StaticPreferenceStore {
    async fn load(&self, _user_id: &str) -> Result<Option<UserPreferences>, PreferenceError> {
        Ok(None)
    }
}

pub struct PreferenceGate {
    store: Arc<dyn PreferenceStore>,
    cache: DashMap<String, (UserPreferences, Instant)>,
    cache_ttl: Duration,
}

impl PreferenceGate {
    pub fn new(store: Arc<dyn PreferenceStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Fetch a user's preferences, serving from the short-TTL cache and
    /// failing open to defaults when the store is unreachable.
    pub async fn preferences(&self, user_id: &str) -> UserPreferences {
        if let Some(entry) = self.cache.get(user_id) {
            let (prefs, cached_at) = entry.value();
            if cached_at.elapsed() < self.cache_ttl {
                return prefs.clone();
            }
        }

        let prefs = match self.store.load(user_id).await {
            Ok(Some(prefs)) => prefs,
            Ok(None) => UserPreferences::default(),
            Err(err) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %err,
                    "Preference store unreachable, admitting in degraded mode"
                );
                UserPreferences::default()
            }
        };

        self.cache
            .insert(user_id.to_string(), (prefs.clone(), Instant::now()));
        prefs
    }

    /// Decide whether a notification at `priority` may be delivered to
    /// this user right now. Critical always passes.
    pub async fn admit(&self, user_id: &str, priority: Priority) -> bool {
        self.admit_at(user_id, priority, Utc::now()).await
    }

    pub async fn admit_at(&self, user_id: &str, priority: Priority, now: DateTime<Utc>) -> bool {
        if priority == Priority::Critical {
            return true;
        }

        let prefs = self.preferences(user_id).await;

        if priority < prefs.minimum_priority {
            metrics::NOTIFICATIONS_SUPPRESSED
                .with_label_values(&["below_minimum_priority"])
                .inc();
            return false;
        }

        let local = now + chrono::Duration::minutes(prefs.utc_offset_minutes as i64);
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
            .unwrap_or_default();
        let weekday = local.weekday().num_days_from_sunday() as u8;

        if prefs.dnd_enabled && in_dnd_window(&prefs.dnd_windows, weekday, time) {
            metrics::NOTIFICATIONS_SUPPRESSED
                .with_label_values(&["dnd"])
                .inc();
            return false;
        }

        if let Some(quiet) = &prefs.quiet_hours {
            if in_quiet_hours(quiet, time) {
                metrics::NOTIFICATIONS_SUPPRESSED
                    .with_label_values(&["quiet_hours"])
                    .inc();
                return false;
            }
        }

        true
    }
}

fn in_dnd_window(windows: &[DndWindow], weekday: u8, time: NaiveTime) -> bool {
    windows.iter().any(|w| {
        if w.start <= w.end {
            weekday == w.day_of_week && time >= w.start && time < w.end
        } else {
            // Overnight window: the tail spills into the next day.
            (weekday == w.day_of_week && time >= w.start)
                || (weekday == (w.day_of_week + 1) % 7 && time < w.end)
        }
    })
}

fn in_quiet_hours(quiet: &QuietHours, time: NaiveTime) -> bool {
    if quiet.start <= quiet.end {
        time >= quiet.start && time < quiet.end
    } else {
        time >= quiet.start || time < quiet.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedStore(UserPreferences);

    #[async_trait]
    impl PreferenceStore for FixedStore {
        async fn load(&self, _: &str) -> Result<Option<UserPreferences>, PreferenceError> {
            Ok(Some(self.0.clone()))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl PreferenceStore for FailingStore {
        async fn load(&self, _: &str) -> Result<Option<UserPreferences>, PreferenceError> {
            Err(PreferenceError::Unavailable("connection refused".into()))
        }
    }

    fn gate(prefs: UserPreferences) -> PreferenceGate {
        PreferenceGate::new(Arc::new(FixedStore(prefs)), Duration::from_secs(60))
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2026-01-07 is a Wednesday.
    fn wednesday_at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 7, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_admit_everything() {
        let gate = gate(UserPreferences::default());
        assert!(gate.admit("u1", Priority::Low).await);
    }

    #[tokio::test]
    async fn test_minimum_priority_filters() {
        let gate = gate(UserPreferences {
            minimum_priority: Priority::High,
            ..UserPreferences::default()
        });
        assert!(!gate.admit("u1", Priority::Normal).await);
        assert!(gate.admit("u1", Priority::High).await);
    }

    #[tokio::test]
    async fn test_critical_always_admitted() {
        let gate = gate(UserPreferences {
            minimum_priority: Priority::High,
            dnd_enabled: true,
            dnd_windows: vec![DndWindow {
                day_of_week: 3,
                start: t(0, 0),
                end: t(23, 59),
            }],
            ..UserPreferences::default()
        });
        assert!(
            gate.admit_at("u1", Priority::Critical, wednesday_at(12))
                .await
        );
    }

    #[tokio::test]
    async fn test_dnd_window_blocks() {
        let gate = gate(UserPreferences {
            dnd_enabled: true,
            dnd_windows: vec![DndWindow {
                day_of_week: 3, // Wednesday
                start: t(9, 0),
                end: t(17, 0),
            }],
            ..UserPreferences::default()
        });
        assert!(!gate.admit_at("u1", Priority::Normal, wednesday_at(12)).await);
        assert!(gate.admit_at("u1", Priority::Normal, wednesday_at(18)).await);
    }

    #[tokio::test]
    async fn test_overnight_dnd_wraps_into_next_day() {
        let windows = vec![DndWindow {
            day_of_week: 2, // Tuesday 22:00 through Wednesday 06:00
            start: t(22, 0),
            end: t(6, 0),
        }];
        assert!(in_dnd_window(&windows, 2, t(23, 0)));
        assert!(in_dnd_window(&windows, 3, t(5, 0)));
        assert!(!in_dnd_window(&windows, 3, t(7, 0)));
        assert!(!in_dnd_window(&windows, 2, t(12, 0)));
    }

    #[tokio::test]
    async fn test_dnd_disabled_ignores_windows() {
        let gate = gate(UserPreferences {
            dnd_enabled: false,
            dnd_windows: vec![DndWindow {
                day_of_week: 3,
                start: t(0, 0),
                end: t(23, 59),
            }],
            ..UserPreferences::default()
        });
        assert!(gate.admit_at("u1", Priority::Normal, wednesday_at(12)).await);
    }

    #[tokio::test]
    async fn test_quiet_hours_overnight() {
        let quiet = QuietHours {
            start: t(22, 0),
            end: t(7, 0),
        };
        assert!(in_quiet_hours(&quiet, t(23, 30)));
        assert!(in_quiet_hours(&quiet, t(3, 0)));
        assert!(!in_quiet_hours(&quiet, t(12, 0)));
    }

    #[tokio::test]
    async fn test_utc_offset_shifts_local_time() {
        let gate = gate(UserPreferences {
            dnd_enabled: true,
            dnd_windows: vec![DndWindow {
                day_of_week: 3,
                start: t(9, 0),
                end: t(17, 0),
            }],
            utc_offset_minutes: 300, // UTC+5
            ..UserPreferences::default()
        });
        // 06:00 UTC is 11:00 local, inside the window.
        assert!(!gate.admit_at("u1", Priority::Normal, wednesday_at(6)).await);
        // 14:00 UTC is 19:00 local, outside it.
        assert!(gate.admit_at("u1", Priority::Normal, wednesday_at(14)).await);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let gate = PreferenceGate::new(Arc::new(FailingStore), Duration::from_secs(60));
        assert!(gate.admit("u1", Priority::Low).await);
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingStore(AtomicU32);

        #[async_trait]
        impl PreferenceStore for CountingStore {
            async fn load(&self, _: &str) -> Result<Option<UserPreferences>, PreferenceError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }

        let store = Arc::new(CountingStore(AtomicU32::new(0)));
        let gate = PreferenceGate::new(store.clone(), Duration::from_secs(60));
        gate.preferences("u1").await;
        gate.preferences("u1").await;
        gate.preferences("u1").await;
        assert_eq!(store.0.load(Ordering::SeqCst), 1);
    }
}

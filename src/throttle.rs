//! Upload throttling for the sync engine.
//!
//! Rapid rewrites of the same file would otherwise start an upload per save.
//! Each file identity carries an upload counter; once it passes the
//! configured limit, further uploads are appended to a delayed FIFO instead
//! of starting immediately. The engine loop calls
//! [`UploadThrottlingManager::process_delayed_uploads`] on its cadence, which
//! releases at most one upload per dynamic interval — the configured rate
//! shortened by `√queue_size` so a growing backlog drains faster while the
//! start-rate stays strictly bounded.

use std::collections::{HashMap, VecDeque};
use std::rc::Weak;
use std::time::{Duration, Instant};

use crate::node::Handle;

/// How an upload interacts with existing versions of the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersioningOption {
    #[default]
    Standard,
    Replace,
    NoVersioning,
}

/// An upload record owned by the sync engine. The throttle holds only weak
/// references: cancelled uploads simply expire out of the queue.
#[derive(Debug)]
pub struct SyncUpload {
    pub file_id: u64,
    pub name: String,
}

/// Queue entry for a throttled upload.
pub struct DelayedUpload {
    pub upload: Weak<SyncUpload>,
    pub versioning: VersioningOption,
    /// Hint to enqueue at the front of the transfer queue once released.
    pub queue_first: bool,
    /// Override-target handle when the upload shortcuts to an existing node.
    pub ov_handle: Handle,
}

/// Published configuration limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleValueLimits {
    pub update_rate_lower: Duration,
    pub update_rate_upper: Duration,
    pub max_uploads_lower: u32,
    pub max_uploads_upper: u32,
}

/// Timeout after which per-file upload counters reset due to inactivity.
const UPLOAD_COUNTER_EXPIRY: Duration = Duration::from_secs(86_400);
const UPDATE_RATE_LOWER: Duration = Duration::from_secs(60);
const UPDATE_RATE_UPPER: Duration = Duration::from_secs(86_399);
const MAX_UPLOADS_LOWER: u32 = 2;
const MAX_UPLOADS_UPPER: u32 = 5;
const DEFAULT_UPDATE_RATE: Duration = Duration::from_secs(180);
const DEFAULT_MAX_UPLOADS: u32 = MAX_UPLOADS_LOWER;

#[derive(Debug, Clone, Copy)]
struct UploadCounter {
    count: u32,
    last_touched: Instant,
}

/// Bounded-rate scheduler for sync uploads.
pub struct UploadThrottlingManager {
    delayed_queue: VecDeque<DelayedUpload>,
    last_processed: Instant,
    throttle_update_rate: Duration,
    max_uploads_before_throttle: u32,
    counters: HashMap<u64, UploadCounter>,
}

impl Default for UploadThrottlingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadThrottlingManager {
    pub fn new() -> Self {
        Self {
            delayed_queue: VecDeque::new(),
            last_processed: Instant::now(),
            throttle_update_rate: DEFAULT_UPDATE_RATE,
            max_uploads_before_throttle: DEFAULT_MAX_UPLOADS,
            counters: HashMap::new(),
        }
    }

    /// Appends a throttled upload to the FIFO.
    pub fn add_to_delayed_uploads(&mut self, delayed: DelayedUpload) {
        self.delayed_queue.push_back(delayed);
    }

    pub fn any_delayed_uploads(&self) -> bool {
        !self.delayed_queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.delayed_queue.len()
    }

    /// Records one sync upload of a file and reports whether the next upload
    /// of it must go through the delayed queue. Counters idle longer than the
    /// expiry window restart from zero.
    pub fn track_upload(&mut self, file_id: u64) -> bool {
        let now = Instant::now();
        let counter = self
            .counters
            .entry(file_id)
            .and_modify(|c| {
                if now.duration_since(c.last_touched) >= UPLOAD_COUNTER_EXPIRY {
                    c.count = 0;
                }
                c.count += 1;
                c.last_touched = now;
            })
            .or_insert(UploadCounter {
                count: 1,
                last_touched: now,
            });
        counter.count > self.max_uploads_before_throttle
    }

    /// Drops counters idle past the expiry window.
    pub fn expire_upload_counters(&mut self) {
        let now = Instant::now();
        self.counters
            .retain(|_, c| now.duration_since(c.last_touched) < UPLOAD_COUNTER_EXPIRY);
    }

    /// Sets the base interval between released uploads. Out-of-range values
    /// are rejected.
    pub fn set_throttle_update_rate(&mut self, interval: Duration) -> bool {
        if !(UPDATE_RATE_LOWER..=UPDATE_RATE_UPPER).contains(&interval) {
            tracing::warn!(
                secs = interval.as_secs(),
                "invalid throttle update rate, must lie within [{}, {}] s",
                UPDATE_RATE_LOWER.as_secs(),
                UPDATE_RATE_UPPER.as_secs()
            );
            return false;
        }
        tracing::debug!(secs = interval.as_secs(), "throttle update rate set");
        self.throttle_update_rate = interval;
        true
    }

    /// Sets how many uploads of one file start unthrottled. Out-of-range
    /// values are rejected.
    pub fn set_max_uploads_before_throttle(&mut self, max_uploads: u32) -> bool {
        if !(MAX_UPLOADS_LOWER..=MAX_UPLOADS_UPPER).contains(&max_uploads) {
            tracing::warn!(
                max_uploads,
                "invalid max uploads value, must lie within [{MAX_UPLOADS_LOWER}, {MAX_UPLOADS_UPPER}]"
            );
            return false;
        }
        tracing::debug!(max_uploads, "uploads before throttle set");
        self.max_uploads_before_throttle = max_uploads;
        true
    }

    pub fn throttle_update_rate(&self) -> Duration {
        self.throttle_update_rate
    }

    pub fn max_uploads_before_throttle(&self) -> u32 {
        self.max_uploads_before_throttle
    }

    pub fn upload_counter_inactivity_expiration_time(&self) -> Duration {
        UPLOAD_COUNTER_EXPIRY
    }

    pub fn throttle_value_limits(&self) -> ThrottleValueLimits {
        ThrottleValueLimits {
            update_rate_lower: UPDATE_RATE_LOWER,
            update_rate_upper: UPDATE_RATE_UPPER,
            max_uploads_lower: MAX_UPLOADS_LOWER,
            max_uploads_upper: MAX_UPLOADS_UPPER,
        }
    }

    pub fn time_since_last_processed_upload(&self) -> Duration {
        self.last_processed.elapsed()
    }

    /// The configured rate shortened by the square root of the backlog, never
    /// below the published lower limit.
    fn dynamic_rate(&self) -> Duration {
        let shortened = self
            .throttle_update_rate
            .div_f64((self.delayed_queue.len().max(1) as f64).sqrt());
        shortened.max(UPDATE_RATE_LOWER)
    }

    /// True when the head of the queue is due.
    fn check_process_delayed_uploads(&self) -> bool {
        if self.delayed_queue.is_empty() {
            return false;
        }

        let rate = self.dynamic_rate();
        let lapsed = self.last_processed.elapsed();
        if lapsed < rate {
            tracing::trace!(
                every_secs = rate.as_secs(),
                lapsed_secs = lapsed.as_secs(),
                queued = self.delayed_queue.len(),
                "waiting to process delayed uploads"
            );
            return false;
        }
        true
    }

    /// Releases at most one due upload to `completion`. Entries whose upload
    /// was cancelled in the meantime are skipped without consuming the slot.
    pub fn process_delayed_uploads<F>(&mut self, mut completion: F)
    where
        F: FnMut(Weak<SyncUpload>, VersioningOption, bool, Handle),
    {
        if !self.check_process_delayed_uploads() {
            return;
        }

        tracing::trace!(queued = self.delayed_queue.len(), "processing delayed uploads");

        while let Some(delayed) = self.delayed_queue.pop_front() {
            if delayed.upload.upgrade().is_none() {
                tracing::warn!("delayed upload no longer valid, skipping");
                continue;
            }

            self.last_processed = Instant::now();
            completion(
                delayed.upload,
                delayed.versioning,
                delayed.queue_first,
                delayed.ov_handle,
            );
            break;
        }
    }

    /// Test hook aligning the processing window. Not part of the public
    /// surface: production code never needs to touch the clock.
    #[cfg(test)]
    pub(crate) fn reset_last_processed_time_to(&mut self, instant: Instant) {
        self.last_processed = instant;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn delayed(upload: &Rc<SyncUpload>) -> DelayedUpload {
        DelayedUpload {
            upload: Rc::downgrade(upload),
            versioning: VersioningOption::Standard,
            queue_first: false,
            ov_handle: crate::node::UNDEF,
        }
    }

    #[test]
    fn setters_validate_limits() {
        let mut manager = UploadThrottlingManager::new();
        assert!(!manager.set_throttle_update_rate(Duration::from_secs(59)));
        assert!(!manager.set_throttle_update_rate(Duration::from_secs(86_400)));
        assert!(manager.set_throttle_update_rate(Duration::from_secs(60)));
        assert_eq!(manager.throttle_update_rate(), Duration::from_secs(60));

        assert!(!manager.set_max_uploads_before_throttle(1));
        assert!(!manager.set_max_uploads_before_throttle(6));
        assert!(manager.set_max_uploads_before_throttle(5));
        assert_eq!(manager.max_uploads_before_throttle(), 5);
    }

    #[test]
    fn counter_gates_after_limit() {
        let mut manager = UploadThrottlingManager::new();
        // default limit of 2: the third upload of a file throttles
        assert!(!manager.track_upload(7));
        assert!(!manager.track_upload(7));
        assert!(manager.track_upload(7));
        // other files are unaffected
        assert!(!manager.track_upload(8));
    }

    #[test]
    fn empty_queue_is_a_noop() {
        let mut manager = UploadThrottlingManager::new();
        let mut called = false;
        manager.process_delayed_uploads(|_, _, _, _| called = true);
        assert!(!called);
    }

    #[test]
    fn waits_for_dynamic_rate() {
        let mut manager = UploadThrottlingManager::new();
        assert!(manager.set_throttle_update_rate(Duration::from_secs(60)));
        let upload = Rc::new(SyncUpload {
            file_id: 1,
            name: "f".into(),
        });
        manager.add_to_delayed_uploads(delayed(&upload));

        // last processed just now: nothing is due yet
        manager.reset_last_processed_time_to(Instant::now());
        let mut called = false;
        manager.process_delayed_uploads(|_, _, _, _| called = true);
        assert!(!called);
        assert_eq!(manager.queue_len(), 1);

        // age the window past the rate and the head releases
        manager.reset_last_processed_time_to(Instant::now() - Duration::from_secs(61));
        manager.process_delayed_uploads(|_, _, _, _| called = true);
        assert!(called);
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn backlog_shortens_the_interval() {
        let mut manager = UploadThrottlingManager::new();
        assert!(manager.set_throttle_update_rate(Duration::from_secs(600)));
        let uploads: Vec<_> = (0..100)
            .map(|i| {
                Rc::new(SyncUpload {
                    file_id: i,
                    name: format!("f{i}"),
                })
            })
            .collect();
        for upload in &uploads {
            manager.add_to_delayed_uploads(delayed(upload));
        }

        // 600 / √100 = 60 s: a 61-second-old window is due, a 59 s one not
        manager.reset_last_processed_time_to(Instant::now() - Duration::from_secs(59));
        let mut called = 0;
        manager.process_delayed_uploads(|_, _, _, _| called += 1);
        assert_eq!(called, 0);

        manager.reset_last_processed_time_to(Instant::now() - Duration::from_secs(61));
        manager.process_delayed_uploads(|_, _, _, _| called += 1);
        assert_eq!(called, 1);
    }

    #[test]
    fn expired_uploads_are_skipped() {
        let mut manager = UploadThrottlingManager::new();
        let dead = Rc::new(SyncUpload {
            file_id: 1,
            name: "dead".into(),
        });
        let alive = Rc::new(SyncUpload {
            file_id: 2,
            name: "alive".into(),
        });
        manager.add_to_delayed_uploads(delayed(&dead));
        manager.add_to_delayed_uploads(delayed(&alive));
        drop(dead);

        manager.reset_last_processed_time_to(Instant::now() - Duration::from_secs(3600));
        let mut released = Vec::new();
        manager.process_delayed_uploads(|upload, _, _, _| {
            released.push(upload.upgrade().unwrap().file_id);
        });
        // the dead entry was discarded, the live one released, one slot used
        assert_eq!(released, vec![2]);
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn only_one_release_per_window() {
        let mut manager = UploadThrottlingManager::new();
        let uploads: Vec<_> = (0..3)
            .map(|i| {
                Rc::new(SyncUpload {
                    file_id: i,
                    name: format!("f{i}"),
                })
            })
            .collect();
        for upload in &uploads {
            manager.add_to_delayed_uploads(delayed(upload));
        }

        manager.reset_last_processed_time_to(Instant::now() - Duration::from_secs(86_000));
        let mut called = 0;
        manager.process_delayed_uploads(|_, _, _, _| called += 1);
        // the slot was consumed; the rest of the queue waits for its window
        manager.process_delayed_uploads(|_, _, _, _| called += 1);
        assert_eq!(called, 1);
        assert_eq!(manager.queue_len(), 2);
    }
}

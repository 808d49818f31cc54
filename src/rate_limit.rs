//! Fixed-window rate limiting keyed by consumer and plan
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitingConfig;
use crate::error::Window;
use crate::model::PricingPlan;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Time until the offending window resets (denials only)
    pub retry_after_ms: Option<u64>,
    /// Window that caused the denial; the day window wins when both deny
    pub denied_by: Option<Window>,
    /// Requests left in the minute window after this one
    pub remaining_minute: u64,
}

/// Live counters of one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub minute_count: u64,
    pub day_count: u64,
}

/// Counter for one window granularity
#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    window_start: Instant,
    count: u64,
}

impl RateLimitWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn is_expired(&self, now: Instant, size: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= size
    }

    /// Reset if expired, count the request, and return the wait until reset if over `limit`
    fn hit(&mut self, now: Instant, size: Duration, limit: u64) -> Option<Duration> {
        if self.is_expired(now, size) {
            self.window_start = now;
            self.count = 0;
        }
        // Denied requests still consume a slot
        self.count += 1;
        if self.count > limit {
            Some(size.saturating_sub(now.saturating_duration_since(self.window_start)))
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct ConsumerWindows {
    minute: RateLimitWindow,
    day: RateLimitWindow,
}

impl ConsumerWindows {
    fn new(now: Instant) -> Self {
        Self {
            minute: RateLimitWindow::new(now),
            day: RateLimitWindow::new(now),
        }
    }
}

/// Per-consumer minute and day counters.
///
/// Each consumer's read-reset-increment runs under its map shard lock, so two
/// concurrent requests never both observe a stale pre-reset count.
///
/// At most `max_tracked_consumers` consumers get their own windows. Idle
/// windows are swept at most once per minute window; new consumers arriving
/// while the table is full share one overflow window per plan until a later
/// sweep frees room.
pub struct RateLimiter {
    windows: DashMap<String, ConsumerWindows>,
    overflow: DashMap<String, ConsumerWindows>,
    free_plan: PricingPlan,
    max_tracked_consumers: usize,
    minute: Duration,
    day: Duration,
    last_sweep: Mutex<Option<Instant>>,
    denied_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self::with_window_sizes(config, MINUTE, DAY)
    }

    pub(crate) fn with_window_sizes(
        config: &RateLimitingConfig,
        minute: Duration,
        day: Duration,
    ) -> Self {
        Self {
            windows: DashMap::new(),
            overflow: DashMap::new(),
            free_plan: config.free_plan.clone(),
            max_tracked_consumers: config.max_tracked_consumers,
            minute,
            day,
            last_sweep: Mutex::new(None),
            denied_total: AtomicU64::new(0),
        }
    }

    /// Limits applied to unknown plan slugs
    pub fn free_plan(&self) -> &PricingPlan {
        &self.free_plan
    }

    /// Count one request for `consumer_id` against `plan`
    pub fn admit(&self, consumer_id: &str, plan: &PricingPlan) -> Admission {
        let now = Instant::now();
        let (minute, day, minute_count) =
            if self.windows.contains_key(consumer_id) || self.has_room(now) {
                let mut windows = self
                    .windows
                    .entry(consumer_id.to_string())
                    .or_insert_with(|| ConsumerWindows::new(now));
                self.hit(&mut windows, now, plan)
            } else {
                debug!(
                    "Counting consumer {} in the {} overflow window",
                    consumer_id, plan.slug
                );
                let mut windows = self
                    .overflow
                    .entry(plan.slug.clone())
                    .or_insert_with(|| ConsumerWindows::new(now));
                self.hit(&mut windows, now, plan)
            };

        let remaining_minute = plan.requests_per_minute.saturating_sub(minute_count);
        let (retry_after, denied_by) = match (minute, day) {
            (None, None) => {
                return Admission {
                    allowed: true,
                    retry_after_ms: None,
                    denied_by: None,
                    remaining_minute,
                }
            }
            (Some(wait), None) => (wait, Window::Minute),
            (None, Some(wait)) => (wait, Window::Day),
            (Some(minute_wait), Some(day_wait)) => (minute_wait.max(day_wait), Window::Day),
        };

        self.denied_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Denied consumer {} on plan {} ({:?} window, retry in {:?})",
            consumer_id, plan.slug, denied_by, retry_after
        );
        Admission {
            allowed: false,
            retry_after_ms: Some(retry_after.as_millis() as u64),
            denied_by: Some(denied_by),
            remaining_minute,
        }
    }

    /// Current counters for a consumer, if it has its own windows
    pub fn usage(&self, consumer_id: &str) -> Option<UsageSnapshot> {
        let now = Instant::now();
        self.windows.get(consumer_id).map(|windows| UsageSnapshot {
            minute_count: if windows.minute.is_expired(now, self.minute) {
                0
            } else {
                windows.minute.count
            },
            day_count: if windows.day.is_expired(now, self.day) {
                0
            } else {
                windows.day.count
            },
        })
    }

    pub fn tracked_consumers(&self) -> usize {
        self.windows.len()
    }

    pub fn denied_total(&self) -> u64 {
        self.denied_total.load(Ordering::Relaxed)
    }

    fn hit(
        &self,
        windows: &mut ConsumerWindows,
        now: Instant,
        plan: &PricingPlan,
    ) -> (Option<Duration>, Option<Duration>, u64) {
        let minute = windows
            .minute
            .hit(now, self.minute, plan.requests_per_minute);
        let day = windows.day.hit(now, self.day, plan.requests_per_day);
        (minute, day, windows.minute.count)
    }

    fn is_idle(&self, windows: &ConsumerWindows, now: Instant) -> bool {
        windows.minute.is_expired(now, self.minute) && windows.day.is_expired(now, self.day)
    }

    /// Whether a new consumer may get its own windows, sweeping if one is due
    fn has_room(&self, now: Instant) -> bool {
        if self.windows.len() < self.max_tracked_consumers {
            return true;
        }
        {
            let mut last_sweep = self.last_sweep.lock();
            match *last_sweep {
                Some(at) if now.saturating_duration_since(at) < self.minute => return false,
                _ => *last_sweep = Some(now),
            }
        }
        self.evict_idle(now);
        self.windows.len() < self.max_tracked_consumers
    }

    fn evict_idle(&self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|_, windows| !self.is_idle(windows, now));
        self.overflow.retain(|_, windows| !self.is_idle(windows, now));
        let evicted = before.saturating_sub(self.windows.len());
        if evicted == 0 {
            warn!(
                "Rate limiter tracks {} consumers and none are idle; new consumers share overflow windows",
                before
            );
        } else {
            debug!("Evicted {} idle rate limit entries", evicted);
        }
    }
}

//! Per-model usage ledger: rolling request/token counters and the soft
//! blacklist.
//!
//! All bookkeeping for every model sits behind one mutex, so the
//! check-then-increment done during selection is atomic: two concurrent
//! requests can never both take the last request slot of a minute window.
//! Counters live for the lifetime of the process only.
//!
//! Every mutating method has an `*_at(now)` twin taking an explicit clock
//! reading; the plain variants use `Utc::now()`.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::ModelDescriptor;

/// Length of the per-minute window.
const MINUTE_WINDOW_SECS: i64 = 60;

/// Exponential blacklist schedule for repeated rate-limit violations.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            multiplier: 2.0,
            max: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Blacklist duration for the `violations`-th consecutive violation
    /// (1-based). Always within `[initial, max]`.
    pub fn delay(&self, violations: u32) -> Duration {
        let exp = violations.saturating_sub(1).min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = secs.min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped).max(self.initial.min(self.max))
    }
}

/// Live usage of one model.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub model_id: String,
    pub req_this_minute: u32,
    pub tok_this_minute: u64,
    pub req_today: u32,
    pub window_start: DateTime<Utc>,
    pub day: NaiveDate,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub consecutive_violations: u32,
}

/// Why a model could not take another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    Blacklisted,
    RequestsPerMinute,
    TokensPerMinute,
    RequestsPerDay,
}

impl UsageRecord {
    fn new(model_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            model_id: model_id.to_string(),
            req_this_minute: 0,
            tok_this_minute: 0,
            req_today: 0,
            window_start: now,
            day: now.date_naive(),
            blacklisted_until: None,
            consecutive_violations: 0,
        }
    }

    /// Lazily reset counters whose window has elapsed.
    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.window_start >= ChronoDuration::seconds(MINUTE_WINDOW_SECS) {
            self.req_this_minute = 0;
            self.tok_this_minute = 0;
            self.window_start = now;
        }
        if now.date_naive() != self.day {
            self.req_today = 0;
            self.day = now.date_naive();
        }
        if self.blacklisted_until.is_some_and(|until| until <= now) {
            self.blacklisted_until = None;
        }
    }

    fn check(&self, model: &ModelDescriptor, now: DateTime<Utc>) -> Result<(), Ineligible> {
        if self.is_blacklisted(now) {
            return Err(Ineligible::Blacklisted);
        }
        self.check_limits(model)
    }

    fn is_blacklisted(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }

    /// The numeric rpm/tpm/rpd limits alone.
    fn check_limits(&self, model: &ModelDescriptor) -> Result<(), Ineligible> {
        if self.req_this_minute >= model.rpm {
            return Err(Ineligible::RequestsPerMinute);
        }
        if self.tok_this_minute >= model.tpm {
            return Err(Ineligible::TokensPerMinute);
        }
        if self.req_today >= model.rpd {
            return Err(Ineligible::RequestsPerDay);
        }
        Ok(())
    }

    /// Earliest instant at which the model becomes eligible again.
    fn available_at(&self, model: &ModelDescriptor, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut at = now;
        if let Some(until) = self.blacklisted_until {
            at = at.max(until);
        }
        if self.req_this_minute >= model.rpm || self.tok_this_minute >= model.tpm {
            at = at.max(self.window_start + ChronoDuration::seconds(MINUTE_WINDOW_SECS));
        }
        if self.req_today >= model.rpd {
            let next_day = self
                .day
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .unwrap_or(now);
            at = at.max(next_day);
        }
        at
    }

    fn take_request(&mut self) {
        self.req_this_minute += 1;
        self.req_today += 1;
    }
}

/// Result of a degraded reservation: which candidate, and how long until it
/// would have been eligible.
#[derive(Debug, Clone, Copy)]
pub struct Degraded {
    pub index: usize,
    pub wait: Duration,
}

/// Lock-protected usage bookkeeping shared by all concurrent requests.
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Mutex<HashMap<String, UsageRecord>>,
    backoff: BackoffPolicy,
}

impl UsageLedger {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            backoff,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UsageRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry<'a>(
        records: &'a mut HashMap<String, UsageRecord>,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> &'a mut UsageRecord {
        let record = records
            .entry(model_id.to_string())
            .or_insert_with(|| UsageRecord::new(model_id, now));
        record.roll(now);
        record
    }

    /// Reserve a request slot on the first eligible candidate, in order.
    ///
    /// Returns the index of the chosen candidate. The eligibility check and
    /// the counter increment happen under the same lock.
    pub fn reserve_first_at(
        &self,
        candidates: &[&ModelDescriptor],
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let mut records = self.lock();
        for (i, model) in candidates.iter().enumerate() {
            let record = Self::entry(&mut records, &model.id, now);
            match record.check(model, now) {
                Ok(()) => {
                    record.take_request();
                    return Some(i);
                }
                Err(reason) => {
                    debug!(model = %model.id, ?reason, "Model not eligible");
                }
            }
        }
        None
    }

    /// Reserve a slot on the blacklisted candidate whose blacklist ends
    /// soonest, among those still within their numeric limits. Among equals
    /// the earlier candidate wins.
    ///
    /// A model over its rpm/tpm/rpd limit is never reserved. When every
    /// candidate is over a limit, returns how long until the first one
    /// frees up.
    pub fn reserve_degraded_at(
        &self,
        candidates: &[&ModelDescriptor],
        now: DateTime<Utc>,
    ) -> Result<Degraded, Duration> {
        let mut records = self.lock();
        let mut best: Option<(usize, DateTime<Utc>)> = None;
        let mut soonest: Option<DateTime<Utc>> = None;

        for (i, model) in candidates.iter().enumerate() {
            let record = Self::entry(&mut records, &model.id, now);
            let at = record.available_at(model, now);
            soonest = Some(soonest.map_or(at, |s| s.min(at)));

            if record.check_limits(model).is_err() {
                continue;
            }
            if best.map_or(true, |(_, best_at)| at < best_at) {
                best = Some((i, at));
            }
        }

        let to_wait = |at: DateTime<Utc>| (at - now).to_std().unwrap_or(Duration::ZERO);
        match best {
            Some((index, at)) => {
                Self::entry(&mut records, &candidates[index].id, now).take_request();
                Ok(Degraded {
                    index,
                    wait: to_wait(at),
                })
            }
            None => Err(soonest.map_or(Duration::ZERO, to_wait)),
        }
    }

    /// Whether the model could take a request right now (no reservation).
    pub fn is_available_at(&self, model: &ModelDescriptor, now: DateTime<Utc>) -> bool {
        let mut records = self.lock();
        Self::entry(&mut records, &model.id, now)
            .check(model, now)
            .is_ok()
    }

    /// Add tokens consumed by a call. A successful call also ends any
    /// streak of rate-limit violations.
    pub fn record_tokens_at(&self, model_id: &str, tokens: u64, success: bool, now: DateTime<Utc>) {
        let mut records = self.lock();
        let record = Self::entry(&mut records, model_id, now);
        record.tok_this_minute = record.tok_this_minute.saturating_add(tokens);
        if success {
            record.consecutive_violations = 0;
        }
    }

    /// Register a rate-limit violation and soft-blacklist the model.
    ///
    /// The blacklist lasts for the backoff delay of the current violation
    /// streak, or the provider's `retry_after` when that is longer.
    pub fn record_violation_at(
        &self,
        model_id: &str,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Duration {
        let mut records = self.lock();
        let record = Self::entry(&mut records, model_id, now);
        record.consecutive_violations = record.consecutive_violations.saturating_add(1);
        let delay = self
            .backoff
            .delay(record.consecutive_violations)
            .max(retry_after.unwrap_or(Duration::ZERO));
        Self::extend_blacklist(record, delay, now);
        warn!(
            model = model_id,
            violations = record.consecutive_violations,
            blacklist_secs = delay.as_secs(),
            "Model rate limited, blacklisting"
        );
        delay
    }

    /// Blacklist a model for a fixed duration without touching its
    /// violation streak.
    pub fn blacklist_for_at(&self, model_id: &str, duration: Duration, now: DateTime<Utc>) {
        let mut records = self.lock();
        let record = Self::entry(&mut records, model_id, now);
        Self::extend_blacklist(record, duration, now);
        warn!(model = model_id, blacklist_secs = duration.as_secs(), "Model blacklisted");
    }

    fn extend_blacklist(record: &mut UsageRecord, duration: Duration, now: DateTime<Utc>) {
        let until = now
            + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0));
        record.blacklisted_until = Some(record.blacklisted_until.map_or(until, |u| u.max(until)));
    }

    /// Copy of one model's record, rolled to `now`.
    pub fn record_at(&self, model_id: &str, now: DateTime<Utc>) -> UsageRecord {
        let mut records = self.lock();
        Self::entry(&mut records, model_id, now).clone()
    }

    // ── Wall-clock convenience wrappers ─────────────────────────────

    pub fn is_available(&self, model: &ModelDescriptor) -> bool {
        self.is_available_at(model, Utc::now())
    }

    pub fn record_tokens(&self, model_id: &str, tokens: u64, success: bool) {
        self.record_tokens_at(model_id, tokens, success, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn model(id: &str, rpm: u32, tpm: u64, rpd: u32) -> ModelDescriptor {
        ModelDescriptor::new(id, "test", rpm, tpm, rpd, 0)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(60));
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.delay(20), Duration::from_secs(1_800));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1_800));
    }

    #[test]
    fn test_rpm_limit_and_window_reset() {
        let ledger = UsageLedger::default();
        let m = model("m", 2, 1_000_000, 1_000);
        let now = t0();

        assert_eq!(ledger.reserve_first_at(&[&m], now), Some(0));
        assert_eq!(ledger.reserve_first_at(&[&m], now), Some(0));
        assert_eq!(ledger.reserve_first_at(&[&m], now), None);

        // Still inside the window.
        let later = now + ChronoDuration::seconds(59);
        assert_eq!(ledger.reserve_first_at(&[&m], later), None);

        // Exactly at the boundary the window resets.
        let rolled = now + ChronoDuration::seconds(60);
        assert_eq!(ledger.reserve_first_at(&[&m], rolled), Some(0));
        assert_eq!(ledger.record_at("m", rolled).req_this_minute, 1);
        assert_eq!(ledger.record_at("m", rolled).req_today, 3);
    }

    #[test]
    fn test_tpm_limit() {
        let ledger = UsageLedger::default();
        let m = model("m", 100, 500, 1_000);
        let now = t0();

        assert_eq!(ledger.reserve_first_at(&[&m], now), Some(0));
        ledger.record_tokens_at("m", 500, true, now);
        assert!(!ledger.is_available_at(&m, now));
        assert!(ledger.is_available_at(&m, now + ChronoDuration::seconds(61)));
    }

    #[test]
    fn test_daily_reset_on_utc_rollover() {
        let ledger = UsageLedger::default();
        let m = model("m", 100, 1_000_000, 1);
        let late = Utc.with_ymd_and_hms(2025, 3, 10, 23, 59, 30).unwrap();

        assert_eq!(ledger.reserve_first_at(&[&m], late), Some(0));
        assert_eq!(
            ledger.reserve_first_at(&[&m], late + ChronoDuration::seconds(20)),
            None
        );
        let next_day = Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 1).unwrap();
        assert_eq!(ledger.reserve_first_at(&[&m], next_day), Some(0));
    }

    #[test]
    fn test_blacklist_overrides_counters() {
        let ledger = UsageLedger::default();
        let m = model("m", 1_000, 1_000_000, 1_000);
        let now = t0();

        let delay = ledger.record_violation_at("m", None, now);
        assert_eq!(delay, Duration::from_secs(30));
        assert!(!ledger.is_available_at(&m, now + ChronoDuration::seconds(29)));
        assert!(ledger.is_available_at(&m, now + ChronoDuration::seconds(30)));
    }

    #[test]
    fn test_violation_streak_escalates_and_resets() {
        let ledger = UsageLedger::default();
        let now = t0();

        assert_eq!(ledger.record_violation_at("m", None, now), Duration::from_secs(30));
        assert_eq!(ledger.record_violation_at("m", None, now), Duration::from_secs(60));
        ledger.record_tokens_at("m", 10, true, now);
        assert_eq!(ledger.record_violation_at("m", None, now), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_extends_blacklist() {
        let ledger = UsageLedger::default();
        let now = t0();
        let delay = ledger.record_violation_at("m", Some(Duration::from_secs(90)), now);
        assert_eq!(delay, Duration::from_secs(90));
    }

    #[test]
    fn test_reserve_skips_ineligible_candidates() {
        let ledger = UsageLedger::default();
        let a = model("a", 10, 1_000_000, 1_000);
        let b = model("b", 10, 1_000_000, 1_000);
        let now = t0();

        ledger.record_violation_at("a", None, now);
        assert_eq!(ledger.reserve_first_at(&[&a, &b], now), Some(1));
    }

    #[test]
    fn test_degraded_prefers_soonest_expiry() {
        let ledger = UsageLedger::default();
        let a = model("a", 10, 1_000_000, 1_000);
        let b = model("b", 10, 1_000_000, 1_000);
        let now = t0();

        ledger.blacklist_for_at("a", Duration::from_secs(600), now);
        ledger.blacklist_for_at("b", Duration::from_secs(60), now);
        assert_eq!(ledger.reserve_first_at(&[&a, &b], now), None);

        let degraded = ledger.reserve_degraded_at(&[&a, &b], now).unwrap();
        assert_eq!(degraded.index, 1);
        assert_eq!(degraded.wait, Duration::from_secs(60));
    }

    #[test]
    fn test_degraded_never_takes_an_over_limit_model() {
        let ledger = UsageLedger::default();
        let a = model("a", 1, 1_000_000, 1_000);
        let b = model("b", 10, 1_000_000, 1_000);
        let now = t0();

        assert_eq!(ledger.reserve_first_at(&[&a], now), Some(0));
        ledger.blacklist_for_at("b", Duration::from_secs(120), now);

        // "a" frees up sooner but is over rpm; the blacklisted "b" is used.
        let degraded = ledger.reserve_degraded_at(&[&a, &b], now).unwrap();
        assert_eq!(degraded.index, 1);
        assert_eq!(ledger.record_at("a", now).req_this_minute, 1);
    }

    #[test]
    fn test_degraded_refuses_when_all_over_limit() {
        let ledger = UsageLedger::default();
        let a = model("a", 1, 1_000_000, 1_000);
        let now = t0();

        assert_eq!(ledger.reserve_first_at(&[&a], now), Some(0));
        let later = now + ChronoDuration::seconds(20);
        let wait = ledger.reserve_degraded_at(&[&a], later).unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));
        assert_eq!(ledger.record_at("a", later).req_this_minute, 1);
    }

    #[test]
    fn test_concurrent_reservations_respect_rpm() {
        let ledger = Arc::new(UsageLedger::default());
        let m = Arc::new(model("m", 7, 1_000_000, 1_000));
        let now = t0();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let m = Arc::clone(&m);
                std::thread::spawn(move || ledger.reserve_first_at(&[m.as_ref()], now).is_some())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 7);
    }
}

//! Sliding-window rate limiting.

use segwire_protocol::{MethodRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// At most `count` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub count: u32,
    #[serde(rename = "window_ms", with = "millis")]
    pub window: Duration,
}

impl RateLimit {
    pub fn new(count: u32, window: Duration) -> Self {
        Self { count, window }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Log of admitted calls within the current window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: RateLimit,
    log: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            log: VecDeque::with_capacity(limit.count as usize),
        }
    }

    /// Admits a call at `now` if fewer than `count` calls were admitted in
    /// the preceding window. Only admitted calls are recorded.
    pub fn admit(&mut self, now: Instant) -> bool {
        self.expire(now);
        if self.log.len() < self.limit.count as usize {
            self.log.push_back(now);
            true
        } else {
            false
        }
    }

    /// Number of admitted calls still inside the window at `now`.
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.log.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.log.front() {
            if now.saturating_duration_since(*oldest) >= self.limit.window {
                self.log.pop_front();
            } else {
                break;
            }
        }
    }
}

/// What a limit is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateScope {
    /// The whole session; global and static methods.
    Session,
    /// One entity instance; dynamic methods.
    Instance(Value),
}

impl RateScope {
    pub fn for_call(method: MethodRef, entity_id: Option<&Value>) -> Self {
        match (method.is_dynamic(), entity_id) {
            (true, Some(id)) => RateScope::Instance(id.clone()),
            _ => RateScope::Session,
        }
    }
}

/// Admissions between two sweeps of empty windows.
const PRUNE_EVERY: u64 = 64;

/// All sliding windows of one session. Windows left empty are swept every
/// `PRUNE_EVERY` admission checks, so per-instance windows live no longer
/// than their window after the last call.
#[derive(Debug, Default)]
pub struct RateLimiters {
    windows: HashMap<(MethodRef, RateScope), SlidingWindow>,
    checks: u64,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(
        &mut self,
        method: MethodRef,
        scope: RateScope,
        limit: RateLimit,
        now: Instant,
    ) -> bool {
        self.checks += 1;
        if self.checks % PRUNE_EVERY == 0 {
            self.prune(now);
        }
        self.windows
            .entry((method, scope))
            .or_insert_with(|| SlidingWindow::new(limit))
            .admit(now)
    }

    /// Drops windows with nothing left in them.
    pub fn prune(&mut self, now: Instant) {
        self.windows.retain(|_, window| window.in_window(now) > 0);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_admits_exactly_count_per_window() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(RateLimit::new(3, Duration::from_secs(1)));

        assert!(window.admit(start));
        assert!(window.admit(start + Duration::from_millis(100)));
        assert!(window.admit(start + Duration::from_millis(200)));
        assert!(!window.admit(start + Duration::from_millis(300)));
        assert!(!window.admit(start + Duration::from_millis(400)));
        assert_eq!(window.in_window(start + Duration::from_millis(400)), 3);

        // The first admission has expired; the rejected attempts left no trace.
        assert!(window.admit(start + Duration::from_millis(1000)));
        assert!(!window.admit(start + Duration::from_millis(1050)));
        assert!(window.admit(start + Duration::from_millis(1100)));
    }

    #[test]
    fn test_zero_count_rejects_everything() {
        let mut window = SlidingWindow::new(RateLimit::new(0, Duration::from_secs(1)));
        assert!(!window.admit(Instant::now()));
    }

    #[test]
    fn test_scopes_are_independent() {
        let now = Instant::now();
        let limit = RateLimit::new(1, Duration::from_secs(10));
        let rename = MethodRef::dynamic_method(0, 2);
        let mut limiters = RateLimiters::new();

        let a = RateScope::for_call(rename, Some(&Value::Int(1)));
        let b = RateScope::for_call(rename, Some(&Value::Int(2)));
        assert!(limiters.admit(rename, a.clone(), limit, now));
        assert!(!limiters.admit(rename, a, limit, now));
        assert!(limiters.admit(rename, b, limit, now));

        let login = MethodRef::global(1);
        assert_eq!(RateScope::for_call(login, None), RateScope::Session);
        assert!(limiters.admit(login, RateScope::Session, limit, now));
        assert_eq!(limiters.len(), 3);

        limiters.prune(now + Duration::from_secs(10));
        assert!(limiters.is_empty());
    }

    #[test]
    fn test_expired_instance_windows_are_swept() {
        let start = Instant::now();
        let limit = RateLimit::new(2, Duration::from_secs(1));
        let rename = MethodRef::dynamic_method(0, 0);
        let mut limiters = RateLimiters::new();

        for id in 0..PRUNE_EVERY - 1 {
            let scope = RateScope::Instance(Value::Int(id));
            assert!(limiters.admit(rename, scope, limit, start));
        }
        assert_eq!(limiters.len(), (PRUNE_EVERY - 1) as usize);

        let later = start + Duration::from_secs(2);
        let scope = RateScope::Instance(Value::Int(PRUNE_EVERY));
        assert!(limiters.admit(rename, scope, limit, later));
        assert_eq!(limiters.len(), 1);
    }

    #[test]
    fn test_window_deserializes_from_millis() {
        let limit: RateLimit = serde_json::from_str(r#"{"count": 5, "window_ms": 1500}"#).unwrap();
        assert_eq!(limit, RateLimit::new(5, Duration::from_millis(1500)));
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_count_in_any_window(
            count in 1u32..6,
            window_ms in 10u64..200,
            gaps in proptest::collection::vec(0u64..60, 1..80),
        ) {
            let start = Instant::now();
            let window = Duration::from_millis(window_ms);
            let mut limiter = SlidingWindow::new(RateLimit::new(count, window));

            let mut admitted = Vec::new();
            let mut t = start;
            for gap in gaps {
                t += Duration::from_millis(gap);
                if limiter.admit(t) {
                    admitted.push(t);
                }
            }

            for (i, first) in admitted.iter().enumerate() {
                let within = admitted[i..]
                    .iter()
                    .take_while(|at| at.duration_since(*first) < window)
                    .count();
                prop_assert!(within <= count as usize);
            }
        }
    }
}

#![forbid(unsafe_code)]

//! Declarative retry policies shared by the search client, the visibility
//! probe and the media downloader.
//!
//! A [`RetryPolicy`] is plain data: an optional overall attempt budget plus one
//! [`RetryRule`] per [`FailureKind`] that may be retried. Failure kinds without a
//! rule end the unit of work immediately. [`RetryPolicy::run`] applies the
//! policy to any fallible operation whose error implements [`Classify`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tracing::warn;

/// Coarse failure classes used to pick a retry rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// HTTP 401/429: credentials rejected or quota hit.
    RateLimited,
    /// HTTP 500/503.
    ServerUnavailable,
    /// HTTP 504.
    GatewayTimeout,
    /// Truncated body, reset or refused connection.
    Connection,
    /// Read/connect timeout on a single request.
    Timeout,
    /// The item was removed or is otherwise gone for good.
    Unavailable,
    Unexpected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::RateLimited => "rate limited",
            FailureKind::ServerUnavailable => "server unavailable",
            FailureKind::GatewayTimeout => "gateway timeout",
            FailureKind::Connection => "connection error",
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "item unavailable",
            FailureKind::Unexpected => "unexpected error",
        };
        f.write_str(label)
    }
}

/// Implemented by error types that can be mapped onto a [`FailureKind`].
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// Delay applied before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `unit * 2^n` where `n` is the number of failures of this kind so far.
    Exponential { unit: Duration },
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { unit } => {
                let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
                unit.saturating_mul(factor)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRule {
    pub backoff: Backoff,
    /// Number of failures of this kind after which we give up. `None` keeps
    /// retrying as long as the overall budget allows.
    pub max_failures: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    rules: HashMap<FailureKind, RetryRule>,
}

/// Failure counters carried across calls to [`RetryPolicy::run`], so one budget
/// can span several requests (e.g. every page of a day-range query).
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    total: u32,
    by_kind: HashMap<FailureKind, u32>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.total
    }

    pub fn failures_of(&self, kind: FailureKind) -> u32 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }

    fn record(&mut self, kind: FailureKind) -> u32 {
        self.total += 1;
        let count = self.by_kind.entry(kind).or_insert(0);
        *count += 1;
        *count
    }
}

/// Why [`RetryPolicy::run`] stopped without a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The failure kind has no retry rule.
    Abandoned { error: E, kind: FailureKind },
    /// A retry rule or the overall attempt budget ran out.
    Exhausted {
        error: E,
        kind: FailureKind,
        failures: u32,
    },
}

impl<E> RetryError<E> {
    pub fn kind(&self) -> FailureKind {
        match self {
            RetryError::Abandoned { kind, .. } | RetryError::Exhausted { kind, .. } => *kind,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Abandoned { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Abandoned { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Abandoned { error, kind } => write!(f, "{kind}: {error}"),
            RetryError::Exhausted {
                error,
                kind,
                failures,
            } => write!(f, "gave up after {failures} failure(s), last {kind}: {error}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of failed attempts across all kinds.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn retry_on(mut self, kind: FailureKind, backoff: Backoff, max_failures: Option<u32>) -> Self {
        self.rules.insert(
            kind,
            RetryRule {
                backoff,
                max_failures,
            },
        );
        self
    }

    pub fn rule(&self, kind: FailureKind) -> Option<&RetryRule> {
        self.rules.get(&kind)
    }

    /// Search API policy: 500/503 wait 100 s, 504 waits 200 s, connection
    /// errors back off exponentially for at most 3 attempts. Everything else,
    /// 401/429 included, ends the query.
    pub fn search_api(server_retry_cap: Option<u32>) -> Self {
        Self::new()
            .retry_on(
                FailureKind::ServerUnavailable,
                Backoff::Fixed(Duration::from_secs(100)),
                server_retry_cap,
            )
            .retry_on(
                FailureKind::GatewayTimeout,
                Backoff::Fixed(Duration::from_secs(200)),
                server_retry_cap,
            )
            .retry_on(
                FailureKind::Connection,
                Backoff::Exponential {
                    unit: Duration::from_secs(1),
                },
                Some(3),
            )
    }

    /// Detail-page policy: four attempts, 100 s between them, removed items
    /// are final.
    pub fn visibility() -> Self {
        Self::item_probe(4)
    }

    /// Media download policy: three attempts, 100 s between them.
    pub fn download() -> Self {
        Self::item_probe(3)
    }

    fn item_probe(attempts: u32) -> Self {
        let pause = Backoff::Fixed(Duration::from_secs(100));
        Self::new()
            .max_attempts(attempts)
            .retry_on(FailureKind::Timeout, pause, None)
            .retry_on(FailureKind::Connection, pause, None)
            .retry_on(FailureKind::ServerUnavailable, pause, None)
            .retry_on(FailureKind::GatewayTimeout, pause, None)
            .retry_on(FailureKind::RateLimited, pause, None)
            .retry_on(FailureKind::Unexpected, pause, None)
    }

    /// Runs `op` until it succeeds or the policy says stop. `op` receives the
    /// 1-based attempt number within this call.
    pub fn run<T, E, F>(
        &self,
        state: &mut RetryState,
        sleeper: &dyn Sleeper,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let kind = error.failure_kind();
            let Some(rule) = self.rules.get(&kind) else {
                state.record(kind);
                return Err(RetryError::Abandoned { error, kind });
            };

            let kind_failures = state.record(kind);
            let over_rule = rule.max_failures.is_some_and(|max| kind_failures >= max);
            let over_budget = self.max_attempts.is_some_and(|max| state.total >= max);
            if over_rule || over_budget {
                return Err(RetryError::Exhausted {
                    error,
                    kind,
                    failures: state.total,
                });
            }

            let delay = rule.backoff.delay(kind_failures);
            warn!(
                %kind,
                attempt,
                delay_secs = delay.as_secs(),
                "{error}; retrying"
            );
            sleeper.sleep(delay);
        }
    }
}

/// Abstraction over `thread::sleep` so retry loops can be tested instantly.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSleeper;
    use super::*;

    #[derive(Debug)]
    struct Failure(FailureKind);

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "simulated {}", self.0)
        }
    }

    impl Classify for Failure {
        fn failure_kind(&self) -> FailureKind {
            self.0
        }
    }

    fn scripted(
        script: Vec<Result<u32, FailureKind>>,
    ) -> impl FnMut(u32) -> Result<u32, Failure> {
        let mut steps = script.into_iter();
        move |_| match steps.next().expect("script exhausted") {
            Ok(value) => Ok(value),
            Err(kind) => Err(Failure(kind)),
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_failure() {
        let backoff = Backoff::Exponential {
            unit: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn server_errors_wait_fixed_delays_then_succeed() {
        let policy = RetryPolicy::search_api(None);
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        let value = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![
                    Err(FailureKind::ServerUnavailable),
                    Err(FailureKind::GatewayTimeout),
                    Ok(7),
                ]),
            )
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(sleeper.secs(), vec![100, 200]);
    }

    #[test]
    fn connection_errors_stop_on_third_failure() {
        let policy = RetryPolicy::search_api(None);
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        let err = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![
                    Err(FailureKind::Connection),
                    Err(FailureKind::Connection),
                    Err(FailureKind::Connection),
                ]),
            )
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.kind(), FailureKind::Connection);
        assert_eq!(sleeper.secs(), vec![2, 4]);
    }

    #[test]
    fn unruled_kinds_are_abandoned_without_sleeping() {
        let policy = RetryPolicy::search_api(None);
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        let err = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![Err(FailureKind::RateLimited)]),
            )
            .unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(err.kind(), FailureKind::RateLimited);
        assert!(sleeper.secs().is_empty());
    }

    #[test]
    fn server_retry_cap_bounds_5xx_loops() {
        let policy = RetryPolicy::search_api(Some(2));
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        let err = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![
                    Err(FailureKind::ServerUnavailable),
                    Err(FailureKind::ServerUnavailable),
                ]),
            )
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(sleeper.secs(), vec![100]);
    }

    #[test]
    fn state_carries_connection_budget_across_calls() {
        let policy = RetryPolicy::search_api(None);
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![Err(FailureKind::Connection), Ok(1)]),
            )
            .unwrap();
        policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![Err(FailureKind::Connection), Ok(2)]),
            )
            .unwrap();
        let err = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![Err(FailureKind::Connection)]),
            )
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(state.failures_of(FailureKind::Connection), 3);
    }

    #[test]
    fn item_probe_budget_counts_every_kind() {
        let policy = RetryPolicy::visibility();
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        let err = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![
                    Err(FailureKind::Timeout),
                    Err(FailureKind::Unexpected),
                    Err(FailureKind::Timeout),
                    Err(FailureKind::Unexpected),
                ]),
            )
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(state.failures(), 4);
        assert_eq!(sleeper.secs(), vec![100, 100, 100]);
    }

    #[test]
    fn unavailable_items_are_final() {
        let policy = RetryPolicy::download();
        let sleeper = RecordingSleeper::default();
        let mut state = RetryState::new();
        let err = policy
            .run(
                &mut state,
                &sleeper,
                scripted(vec![Err(FailureKind::Unavailable)]),
            )
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unavailable);
        assert!(sleeper.secs().is_empty());
    }
}

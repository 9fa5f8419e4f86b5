use log::{error, info, warn};
use std::fmt::Display;
use std::future::Future;
use tokio::time::{Duration, Instant, sleep};

use crate::shutdown::Interrupt;

/// First wait after a failed attempt, in units.
pub const INITIAL_DELAY_UNITS: u32 = 2;

/// Upper bound for a single wait, in units.
pub const MAX_DELAY_UNITS: u32 = 64;

/// Exponential backoff state for one connect-attempt sequence.
///
/// Delays go 2, 4, 8, ... units and stay at 64 once reached.
/// `reset()` is called on success and the state is discarded.
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    delay_units: u32,
    last_attempt: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Backoff with a one second unit.
    pub fn new() -> Self {
        Self::with_unit(Duration::from_secs(1))
    }

    pub fn with_unit(unit: Duration) -> Self {
        Self {
            unit,
            delay_units: INITIAL_DELAY_UNITS,
            last_attempt: None,
        }
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Marks the start of an attempt.
    pub fn attempted(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// Returns the number of units to wait after the current failure and
    /// advances the state for the next one.
    pub fn next_delay_units(&mut self) -> u32 {
        let units = self.delay_units;
        self.delay_units = (self.delay_units.saturating_mul(2)).min(MAX_DELAY_UNITS);
        units
    }

    pub fn next_delay(&mut self) -> Duration {
        self.unit * self.next_delay_units()
    }

    pub fn reset(&mut self) {
        self.delay_units = INITIAL_DELAY_UNITS;
        self.last_attempt = None;
    }
}

/// The interrupt fired before the operation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Runs `op` until it succeeds, waiting per `backoff` between failures.
///
/// The interrupt is checked before every attempt and once per unit while
/// waiting, so cancellation latency is bounded by one unit plus the
/// duration of an in-flight attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    mut op: F,
    interrupt: &Interrupt,
    mut backoff: Backoff,
) -> Result<T, Cancelled>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    loop {
        if interrupt.is_triggered() {
            return Err(Cancelled);
        }

        backoff.attempted();
        match op().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(e) => {
                let units = backoff.next_delay_units();
                warn!(
                    "{} connect failed: {} - retry in {:?}",
                    what,
                    e,
                    backoff.unit() * units
                );

                for _ in 0..units {
                    sleep(backoff.unit()).await;
                    if interrupt.is_triggered() {
                        return Err(Cancelled);
                    }
                }
            }
        }
    }
}

/// Fail-fast connect: retries like `retry_with_backoff` and terminates the
/// process with status 1 if the interrupt fires first.
pub async fn connect_or_exit<T, E, F, Fut>(what: &str, op: F, interrupt: &Interrupt) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    match retry_with_backoff(what, op, interrupt, Backoff::new()).await {
        Ok(value) => {
            info!("{} connected", what);
            value
        }
        Err(Cancelled) => {
            error!("interrupted while connecting {}; exiting", what);
            std::process::exit(1);
        }
    }
}

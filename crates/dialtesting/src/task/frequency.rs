use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval};

use crate::error::{DialError, Result};

/// Parse a duration string in the `1h30m`, `10s`, `250ms`, `1.5s` format.
///
/// Accepted units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. Several
/// components may be chained; a bare `0` is the zero duration.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DialError::config("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(DialError::config(format!("invalid duration {input:?}")));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| DialError::config(format!("invalid duration {input:?}")))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(DialError::config(format!("missing unit in duration {input:?}"))),
            unit => {
                return Err(DialError::config(format!("unknown unit {unit:?} in duration {input:?}")));
            }
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Parse a task frequency. Unlike [`parse_duration`] a zero period is rejected,
/// since it cannot drive a recurring timer.
pub fn parse_frequency(frequency: &str) -> Result<Duration> {
    let period = parse_duration(frequency)
        .map_err(|err| DialError::config(format!("invalid frequency: {err}")))?;
    if period.is_zero() {
        return Err(DialError::config(format!("frequency {frequency:?} must be positive")));
    }
    Ok(period)
}

/// Recurring timer owned by a task.
///
/// The underlying tokio interval is created on the first tick so that tasks can
/// be checked outside of a runtime.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    interval: Option<Interval>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self { period, interval: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next scheduled run. The first tick completes immediately.
    pub async fn tick(&mut self) -> Instant {
        let period = self.period;
        let timer = self.interval.get_or_insert_with(|| {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });
        timer.tick().await
    }
}

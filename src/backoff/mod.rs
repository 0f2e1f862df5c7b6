//! Back-off pattern and retry timer.
//!
//! Every retry in the library is driven from here: a [`BackoffPattern`]
//! encodes the schedule, a [`BackoffTimer`] walks it.  The two clocks
//! are independent: an "attempt timeout" caps how long a single attempt
//! waits for a reply, a "retry after failure" duration is the delay
//! before the next attempt begins.

pub mod timer;

pub use self::timer::{BackoffState, BackoffTimer};

use serde::{Deserialize, Serialize};

use std::{str::FromStr, time::Duration};

/// The default retransmission schedule, milliseconds.
pub const DEFAULT_PATTERN: &str = "/500,1000,1500,2000,2500///";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternError {
    Malformed,
    InvalidNumber,
    /// multipliers below one would make the schedule shrink.
    MultiplierTooSmall,
    /// a multiplier with neither a cap nor a maximum attempt count never
    /// converges.
    Unbounded,
}

impl std::error::Error for PatternError {}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A retry schedule.
///
/// The compact textual form is
/// `/a1,a2,..,*m:cap/r1,r2,..,*m:cap/N/` where the first segment holds
/// the attempt timeouts, the second the retry-after-failure durations
/// and the third an optional maximum attempt count, all values in
/// milliseconds.  A trailing `*m` entry in either segment means: after
/// the enumerated values are exhausted, keep multiplying the last value
/// by `m`, bounded by `cap` when given.
///
/// `/` is the canonical separator; newlines are tolerated on parse and
/// normalized away.  The JSON form (serde) and the builder setters
/// produce identical schedules.
///
/// ```
/// use std::time::Duration;
/// use peerlink::backoff::BackoffPattern;
///
/// let pattern: BackoffPattern = "/100,200/1000/3/".parse().unwrap();
/// assert_eq!(pattern.attempt_timeout(0), Some(Duration::from_millis(100)));
/// assert_eq!(pattern.attempt_timeout(1), Some(Duration::from_millis(200)));
/// assert_eq!(pattern.retry_duration(0), Some(Duration::from_millis(1000)));
/// assert_eq!(pattern.max_attempts(), Some(3));
/// assert_eq!(pattern.save(), "/100,200/1000/3/");
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "PatternRepr", into = "PatternRepr")]
pub struct BackoffPattern {
    attempt_timeouts: Vec<Duration>,
    attempt_multiplier: Option<f64>,
    max_attempt_timeout: Option<Duration>,
    retry_durations: Vec<Duration>,
    retry_multiplier: Option<f64>,
    max_retry_duration: Option<Duration>,
    max_attempts: Option<usize>,
}

impl BackoffPattern {
    /// Parse the compact textual form.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        // newline call sites are tolerated, the slash form is canonical.
        let normalized = pattern.replace(['\n', '\r'], "/");
        let trimmed = normalized
            .strip_prefix('/')
            .ok_or(PatternError::Malformed)?;

        let mut segments = trimmed.split('/');
        let attempts = segments.next().ok_or(PatternError::Malformed)?;
        let retries = segments.next().ok_or(PatternError::Malformed)?;
        let max = segments.next().ok_or(PatternError::Malformed)?;

        let mut this = Self::default();
        (this.attempt_timeouts, this.attempt_multiplier, this.max_attempt_timeout) =
            parse_segment(attempts)?;
        (this.retry_durations, this.retry_multiplier, this.max_retry_duration) =
            parse_segment(retries)?;

        if !max.is_empty() {
            this.max_attempts = Some(max.parse().map_err(|_| PatternError::InvalidNumber)?);
        }

        this.validate()?;
        Ok(this)
    }

    /// Emit the canonical textual form; `parse(pattern.save())` yields
    /// an equal pattern.
    pub fn save(&self) -> String {
        let mut out = String::from("/");
        save_segment(
            &mut out,
            &self.attempt_timeouts,
            self.attempt_multiplier,
            self.max_attempt_timeout,
        );
        out.push('/');
        save_segment(
            &mut out,
            &self.retry_durations,
            self.retry_multiplier,
            self.max_retry_duration,
        );
        out.push('/');
        if let Some(max) = self.max_attempts {
            out.push_str(&max.to_string());
        }
        out.push('/');
        out
    }

    pub fn add_attempt_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.attempt_timeouts.push(timeout);
        self
    }

    pub fn set_attempt_multiplier(&mut self, multiplier: f64) -> Result<&mut Self, PatternError> {
        if multiplier < 1.0 {
            return Err(PatternError::MultiplierTooSmall);
        }

        self.attempt_multiplier = Some(multiplier);
        Ok(self)
    }

    pub fn set_max_attempt_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.max_attempt_timeout = Some(timeout);
        self
    }

    pub fn add_retry_duration(&mut self, duration: Duration) -> &mut Self {
        self.retry_durations.push(duration);
        self
    }

    pub fn set_retry_multiplier(&mut self, multiplier: f64) -> Result<&mut Self, PatternError> {
        if multiplier < 1.0 {
            return Err(PatternError::MultiplierTooSmall);
        }

        self.retry_multiplier = Some(multiplier);
        Ok(self)
    }

    pub fn set_max_retry_duration(&mut self, duration: Duration) -> &mut Self {
        self.max_retry_duration = Some(duration);
        self
    }

    pub fn set_max_attempts(&mut self, max: usize) -> &mut Self {
        self.max_attempts = Some(max);
        self
    }

    /// The timeout of attempt `index`, or `None` when the attempt should
    /// wait for a reply indefinitely.
    ///
    /// Deterministic given (pattern, index).
    pub fn attempt_timeout(&self, index: usize) -> Option<Duration> {
        extend_schedule(
            &self.attempt_timeouts,
            self.attempt_multiplier,
            self.max_attempt_timeout,
            index,
        )
    }

    /// The delay before attempt `index + 1` starts after attempt `index`
    /// failed, or `None` for an immediate retry.
    ///
    /// Unlike the attempt timeouts, an exhausted retry vector does not
    /// stop the schedule: without a multiplier the last enumerated
    /// delay keeps holding, so every failure past the end still waits.
    pub fn retry_duration(&self, index: usize) -> Option<Duration> {
        extend_schedule(
            &self.retry_durations,
            self.retry_multiplier,
            self.max_retry_duration,
            index,
        )
        .or_else(|| self.retry_durations.last().copied())
    }

    /// The number of attempts after which the schedule gives up, or
    /// `None` when it retries forever (capped multiplier).
    pub fn max_attempts(&self) -> Option<usize> {
        if let Some(max) = self.max_attempts {
            return Some(max);
        }

        // fully enumerated attempt vector without a multiplier is finite
        // by construction.
        if self.attempt_multiplier.is_none() && !self.attempt_timeouts.is_empty() {
            return Some(self.attempt_timeouts.len());
        }

        None
    }

    fn validate(&self) -> Result<(), PatternError> {
        for multiplier in [self.attempt_multiplier, self.retry_multiplier].into_iter().flatten() {
            if multiplier < 1.0 {
                return Err(PatternError::MultiplierTooSmall);
            }
        }

        if self.max_attempts.is_none() {
            if self.attempt_multiplier.is_some() && self.max_attempt_timeout.is_none() {
                return Err(PatternError::Unbounded);
            }

            if self.retry_multiplier.is_some() && self.max_retry_duration.is_none() {
                return Err(PatternError::Unbounded);
            }
        }

        Ok(())
    }
}

impl FromStr for BackoffPattern {
    type Err = PatternError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        Self::parse(pattern)
    }
}

fn extend_schedule(
    values: &[Duration],
    multiplier: Option<f64>,
    cap: Option<Duration>,
    index: usize,
) -> Option<Duration> {
    if let Some(value) = values.get(index) {
        return Some(*value);
    }

    let (last, multiplier) = (values.last()?, multiplier?);
    let steps = (index - values.len() + 1) as i32;
    let mut value = Duration::from_secs_f64(last.as_secs_f64() * multiplier.powi(steps));
    if let Some(cap) = cap {
        value = value.min(cap);
    }

    Some(value)
}

fn parse_segment(
    segment: &str,
) -> Result<(Vec<Duration>, Option<f64>, Option<Duration>), PatternError> {
    let mut values = Vec::new();
    let mut multiplier = None;
    let mut cap = None;

    if segment.is_empty() {
        return Ok((values, multiplier, cap));
    }

    let mut entries = segment.split(',').peekable();
    while let Some(entry) = entries.next() {
        if let Some(rest) = entry.strip_prefix('*') {
            // the multiplier continuation must be the last entry.
            if entries.peek().is_some() {
                return Err(PatternError::Malformed);
            }

            let (m, c) = match rest.split_once(':') {
                Some((m, c)) => (m, Some(c)),
                None => (rest, None),
            };

            multiplier = Some(m.parse::<f64>().map_err(|_| PatternError::InvalidNumber)?);
            if let Some(c) = c {
                cap = Some(Duration::from_millis(
                    c.parse().map_err(|_| PatternError::InvalidNumber)?,
                ));
            }
        } else {
            values.push(Duration::from_millis(
                entry.parse().map_err(|_| PatternError::InvalidNumber)?,
            ));
        }
    }

    Ok((values, multiplier, cap))
}

fn save_segment(
    out: &mut String,
    values: &[Duration],
    multiplier: Option<f64>,
    cap: Option<Duration>,
) {
    let mut first = true;
    for value in values {
        if !first {
            out.push(',');
        }

        out.push_str(&value.as_millis().to_string());
        first = false;
    }

    if let Some(multiplier) = multiplier {
        if !first {
            out.push(',');
        }

        out.push('*');
        out.push_str(&multiplier.to_string());
        if let Some(cap) = cap {
            out.push(':');
            out.push_str(&cap.as_millis().to_string());
        }
    }
}

/// serde mirror of the pattern, durations in milliseconds.
#[derive(Serialize, Deserialize, Clone)]
struct PatternRepr {
    #[serde(default)]
    attempt_timeouts: Vec<u64>,
    #[serde(default)]
    attempt_multiplier: Option<f64>,
    #[serde(default)]
    max_attempt_timeout: Option<u64>,
    #[serde(default)]
    retry_durations: Vec<u64>,
    #[serde(default)]
    retry_multiplier: Option<f64>,
    #[serde(default)]
    max_retry_duration: Option<u64>,
    #[serde(default)]
    max_attempts: Option<usize>,
}

impl From<PatternRepr> for BackoffPattern {
    fn from(repr: PatternRepr) -> Self {
        Self {
            attempt_timeouts: repr
                .attempt_timeouts
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            attempt_multiplier: repr.attempt_multiplier,
            max_attempt_timeout: repr.max_attempt_timeout.map(Duration::from_millis),
            retry_durations: repr
                .retry_durations
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            retry_multiplier: repr.retry_multiplier,
            max_retry_duration: repr.max_retry_duration.map(Duration::from_millis),
            max_attempts: repr.max_attempts,
        }
    }
}

impl From<BackoffPattern> for PatternRepr {
    fn from(pattern: BackoffPattern) -> Self {
        Self {
            attempt_timeouts: pattern
                .attempt_timeouts
                .iter()
                .map(|it| it.as_millis() as u64)
                .collect(),
            attempt_multiplier: pattern.attempt_multiplier,
            max_attempt_timeout: pattern.max_attempt_timeout.map(|it| it.as_millis() as u64),
            retry_durations: pattern
                .retry_durations
                .iter()
                .map(|it| it.as_millis() as u64)
                .collect(),
            retry_multiplier: pattern.retry_multiplier,
            max_retry_duration: pattern.max_retry_duration.map(|it| it.as_millis() as u64),
            max_attempts: pattern.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pattern_parses() {
        let pattern = BackoffPattern::parse(DEFAULT_PATTERN).unwrap();
        assert_eq!(pattern.max_attempts(), Some(5));
        assert_eq!(pattern.attempt_timeout(0), Some(Duration::from_millis(500)));
        assert_eq!(pattern.attempt_timeout(4), Some(Duration::from_millis(2500)));
        assert_eq!(pattern.attempt_timeout(5), None);
        assert_eq!(pattern.retry_duration(0), None);
    }

    #[test]
    fn exhausted_retry_vector_holds_the_last_delay() {
        let pattern = BackoffPattern::parse("/100,200/1000/3/").unwrap();
        assert_eq!(pattern.retry_duration(0), Some(Duration::from_millis(1000)));
        assert_eq!(pattern.retry_duration(1), Some(Duration::from_millis(1000)));
        assert_eq!(pattern.retry_duration(9), Some(Duration::from_millis(1000)));

        // the attempt side stays finite so max_attempts() can cap the
        // walk from the enumerated vector alone.
        assert_eq!(pattern.attempt_timeout(2), None);
    }

    #[test]
    fn multiplier_extends_the_schedule() {
        let pattern = BackoffPattern::parse("/1,*2:600/60/20/").unwrap();
        assert_eq!(pattern.attempt_timeout(0), Some(Duration::from_millis(1)));
        assert_eq!(pattern.attempt_timeout(1), Some(Duration::from_millis(2)));
        assert_eq!(pattern.attempt_timeout(2), Some(Duration::from_millis(4)));
        assert_eq!(pattern.attempt_timeout(12), Some(Duration::from_millis(600)));
        assert_eq!(pattern.max_attempts(), Some(20));
    }

    #[test]
    fn save_round_trips() {
        for text in ["/100,200/1000/3/", "/2,4,8,16,32,64/10//", "/1,*2:600/60/20/", "////"] {
            let pattern = BackoffPattern::parse(text).unwrap();
            assert_eq!(BackoffPattern::parse(&pattern.save()).unwrap(), pattern);
            assert_eq!(pattern.save(), *text);
        }
    }

    #[test]
    fn json_form_matches_parsed_form() {
        let pattern = BackoffPattern::parse("/100,200/1000/3/").unwrap();
        let json = serde_json5::to_string(&pattern).unwrap();
        let back: BackoffPattern = serde_json5::from_str(&json).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn builder_matches_parser() {
        let mut built = BackoffPattern::default();
        built
            .add_attempt_timeout(Duration::from_millis(100))
            .add_attempt_timeout(Duration::from_millis(200))
            .add_retry_duration(Duration::from_millis(1000))
            .set_max_attempts(3);

        assert_eq!(built, BackoffPattern::parse("/100,200/1000/3/").unwrap());
    }

    #[test]
    fn newline_separators_are_tolerated() {
        let canonical = BackoffPattern::parse("/100,200/1000/3/").unwrap();
        assert_eq!(BackoffPattern::parse("\n100,200\n1000\n3\n").unwrap(), canonical);
    }

    #[test]
    fn small_multiplier_is_rejected() {
        assert_eq!(
            BackoffPattern::parse("/100,*0.5:600//3/"),
            Err(PatternError::MultiplierTooSmall)
        );

        let mut pattern = BackoffPattern::default();
        assert!(pattern.set_retry_multiplier(0.9).is_err());
    }

    #[test]
    fn unbounded_multiplier_is_rejected() {
        assert_eq!(
            BackoffPattern::parse("/100,*2///"),
            Err(PatternError::Unbounded)
        );
    }
}

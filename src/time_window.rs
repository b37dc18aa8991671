// Time window module - parses human-readable durations such as "24h"
//
// Windows are written as a non-negative integer followed by a unit:
// 'd' (days), 'h' (hours) or 'm' (minutes). They bound look-back
// windows for queries and the collection interval.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;

/// Errors produced while parsing a time window string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("Time window string cannot be empty")]
    Empty,

    #[error(
        "Invalid time window format '{0}'. Use NUMBER followed by 'd' (days), \
         'h' (hours), or 'm' (minutes), e.g. '30d', '24h', '30m'"
    )]
    InvalidFormat(String),

    #[error("Time window '{0}' is too large")]
    Overflow(String),
}

/// A parsed time window with a canonical seconds representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TimeWindow {
    seconds: u64,
}

impl TimeWindow {
    /// Parses a window string like "30d", "24h" or "15m"
    ///
    /// # Returns
    /// * `Ok(TimeWindow)` - The parsed window
    /// * `Err(TimeWindowError)` - Empty input, wrong grammar, or a value that
    ///   does not fit in 64 bits of seconds
    ///
    /// # Example
    /// ```
    /// let window = TimeWindow::parse("24h")?;
    /// assert_eq!(window.as_secs(), 86_400);
    /// ```
    pub fn parse(text: &str) -> Result<Self, TimeWindowError> {
        if text.is_empty() {
            return Err(TimeWindowError::Empty);
        }

        let invalid = || TimeWindowError::InvalidFormat(text.to_string());

        // Split off the unit; the remainder must be ASCII digits only
        let unit = text.chars().last().ok_or_else(invalid)?;
        let digits = &text[..text.len() - unit.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let multiplier = match unit {
            'd' => SECONDS_PER_DAY,
            'h' => SECONDS_PER_HOUR,
            'm' => SECONDS_PER_MINUTE,
            _ => return Err(invalid()),
        };

        let value: u64 = digits
            .parse()
            .map_err(|_| TimeWindowError::Overflow(text.to_string()))?;
        let seconds = value
            .checked_mul(multiplier)
            .ok_or_else(|| TimeWindowError::Overflow(text.to_string()))?;

        Ok(TimeWindow { seconds })
    }

    /// Builds a window directly from a number of seconds
    pub fn from_secs(seconds: u64) -> Self {
        TimeWindow { seconds }
    }

    /// Total length of the window in seconds
    pub fn as_secs(&self) -> u64 {
        self.seconds
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

impl FromStr for TimeWindow {
    type Err = TimeWindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeWindow::parse(s)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.seconds)
    }
}

/// Parses an interval that may be either a window string or raw seconds
///
/// "15m" and "900" both yield 900 seconds. The window grammar is tried
/// first; only when it fails is the text read as a plain integer.
///
/// # Returns
/// * `Ok(TimeWindow)` - Parsed interval
/// * `Err(TimeWindowError)` - The window error when neither form applies
pub fn parse_interval(text: &str) -> Result<TimeWindow, TimeWindowError> {
    match TimeWindow::parse(text) {
        Ok(window) => Ok(window),
        Err(window_err) => text
            .parse::<u64>()
            .map(TimeWindow::from_secs)
            .map_err(|_| window_err),
    }
}

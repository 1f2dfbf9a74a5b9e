//! Watermark secrets and their configuration surface.
//!
//! One optional secret per patcher kind, sourced from the environment or
//! built programmatically. An absent, empty or length-mismatched pair
//! disables its kind entirely: every candidate site is rejected and the
//! subroutine comes back untouched.

use serde::{Deserialize, Serialize};

/// An immutable key/value pair of equal symbol length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPair {
    pub key: String,
    pub value: String,
}

impl SecretPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Both halves present and of equal length.
    pub fn is_usable(&self) -> bool {
        !self.key.is_empty() && self.key.len() == self.value.len()
    }
}

/// Secret for the time-query kind: the key is an epoch instant, not a
/// string, so only an empty value disables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSecret {
    /// Seconds since the epoch that should trigger the disclosure.
    pub key_epoch: i64,
    pub value: String,
}

impl TimeSecret {
    pub fn new(key_epoch: i64, value: impl Into<String>) -> Self {
        Self {
            key_epoch,
            value: value.into(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.value.is_empty()
    }
}

/// Per-kind secrets for one embedding run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Numeric-parse kind (`atoi` family).
    pub parse: Option<SecretPair>,
    /// String-read kind (`gets` family).
    pub read: Option<SecretPair>,
    /// Time-query kind (`time` family).
    pub time: Option<TimeSecret>,
    /// Buffer-allocation kind (stack arrays and `malloc`).
    pub buffer: Option<SecretPair>,
}

impl WatermarkConfig {
    /// Reads all four kinds from the environment. Variable names follow the
    /// functions each kind hooks: `ATOI_KEY`/`ATOI_VAL`, `GETS_KEY`/
    /// `GETS_VAL`, `TIME_KEY`/`TIME_VAL`, `SIDEDATA_KEY`/`SIDEDATA_VAL`.
    pub fn from_env() -> Self {
        let pair = |key_var: &str, val_var: &str| -> Option<SecretPair> {
            match (std::env::var(key_var), std::env::var(val_var)) {
                (Ok(key), Ok(value)) => Some(SecretPair::new(key, value)),
                _ => None,
            }
        };
        let time = match (std::env::var("TIME_KEY"), std::env::var("TIME_VAL")) {
            (Ok(key), Ok(value)) => key
                .trim()
                .parse::<i64>()
                .ok()
                .map(|epoch| TimeSecret::new(epoch, value)),
            _ => None,
        };
        Self {
            parse: pair("ATOI_KEY", "ATOI_VAL"),
            read: pair("GETS_KEY", "GETS_VAL"),
            time,
            buffer: pair("SIDEDATA_KEY", "SIDEDATA_VAL"),
        }
        .sanitize()
    }

    /// Drops unusable secrets, warning once per disabled kind.
    pub fn sanitize(mut self) -> Self {
        let mut drop_pair = |slot: &mut Option<SecretPair>, kind: &str| {
            if let Some(pair) = slot {
                if !pair.is_usable() {
                    tracing::warn!(
                        "{} watermark disabled: key is not as long as value",
                        kind
                    );
                    *slot = None;
                }
            }
        };
        drop_pair(&mut self.parse, "numeric-parse");
        drop_pair(&mut self.read, "string-read");
        drop_pair(&mut self.buffer, "buffer-allocation");
        if let Some(time) = &self.time {
            if !time.is_usable() {
                tracing::warn!("time-query watermark disabled: empty value");
                self.time = None;
            }
        }
        self
    }
}

//! Rate limit policies.
//!
//! A policy is a positive request budget paired with a positive window
//! length. Invalid policies cannot be constructed, so everything downstream
//! of configuration can assume `max_requests > 0` and `window > 0`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// The `(max_requests, window)` pair governing one key's admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct Policy {
    max_requests: u64,
    window: Duration,
}

impl Policy {
    /// Create a policy, rejecting a zero budget or a zero-length window.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(Error::Config(
                "max_requests must be a positive integer".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(Error::Config("window must be a positive duration".to_string()));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Maximum number of admitted requests per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// 10 requests per 5 minutes.
impl Default for Policy {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(300),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {:?}", self.max_requests, self.window)
    }
}

/// Parses the compact `<max_requests>:<window_secs>` form used in
/// environment variables, e.g. `100:300`.
impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (max, window) = s.split_once(':').ok_or_else(|| {
            Error::Config(format!(
                "invalid policy '{}', expected <max_requests>:<window_secs>",
                s
            ))
        })?;

        let max_requests = max
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::Config(format!("invalid max_requests '{}': {}", max, e)))?;
        let window_secs = window
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::Config(format!("invalid window_secs '{}': {}", window, e)))?;

        Policy::new(max_requests, Duration::from_secs(window_secs))
    }
}

/// Time unit shorthand for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Serialized form of a [`Policy`].
///
/// The window is given either as `window_secs` or as a `unit`; exactly one
/// of the two must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPolicy {
    max_requests: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<TimeUnit>,
}

impl TryFrom<RawPolicy> for Policy {
    type Error = Error;

    fn try_from(raw: RawPolicy) -> Result<Self> {
        let window = match (raw.window_secs, raw.unit) {
            (Some(secs), None) => Duration::from_secs(secs),
            (None, Some(unit)) => unit.duration(),
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "policy must set either window_secs or unit, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "policy is missing window_secs".to_string(),
                ))
            }
        };
        Policy::new(raw.max_requests, window)
    }
}

impl From<Policy> for RawPolicy {
    fn from(policy: Policy) -> Self {
        Self {
            max_requests: policy.max_requests,
            window_secs: Some(policy.window.as_secs()),
            unit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_rejects_zero_budget() {
        let err = Policy::new(0, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_policy_rejects_zero_window() {
        let err = Policy::new(5, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_compact_form() {
        let policy: Policy = "100:300".parse().unwrap();
        assert_eq!(policy.max_requests(), 100);
        assert_eq!(policy.window(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_compact_form_errors() {
        assert!("100".parse::<Policy>().is_err());
        assert!("abc:300".parse::<Policy>().is_err());
        assert!("100:-1".parse::<Policy>().is_err());
        assert!("0:300".parse::<Policy>().is_err());
    }

    #[test]
    fn test_deserialize_with_window_secs() {
        let yaml = "max_requests: 5\nwindow_secs: 60\n";
        let policy: Policy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy, Policy::new(5, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_deserialize_with_unit() {
        let yaml = "max_requests: 1000\nunit: minute\n";
        let policy: Policy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_deserialize_rejects_invalid() {
        assert!(serde_yaml::from_str::<Policy>("max_requests: 0\nwindow_secs: 60\n").is_err());
        assert!(serde_yaml::from_str::<Policy>("max_requests: 5\n").is_err());
        assert!(
            serde_yaml::from_str::<Policy>("max_requests: 5\nwindow_secs: 1\nunit: hour\n")
                .is_err()
        );
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}

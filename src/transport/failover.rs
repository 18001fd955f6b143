//! Failover connection strings and bounded connect retry
//!
//! Format: `failover:(url1,url2)?initialReconnectDelay=100&startupMaxReconnectAttempts=10&maxReconnectAttempts=20`.
//! A bare address is treated as a single-url list with the default policy.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const FAILOVER_SCHEME: &str = "failover:";

/// Upper bound on the wait between connect rounds
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Reconnect parameters carried on a failover URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPolicy {
    /// Wait before the second round; doubles each round after that
    pub initial_reconnect_delay: Duration,
    /// Extra rounds allowed when opening a new connection
    pub startup_max_reconnect_attempts: u32,
    /// Extra rounds allowed when an established connection drops
    pub max_reconnect_attempts: u32,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(100),
            startup_max_reconnect_attempts: 10,
            max_reconnect_attempts: 20,
        }
    }
}

/// Ordered list of broker urls plus the reconnect policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverUri {
    pub urls: Vec<String>,
    pub policy: FailoverPolicy,
}

impl FailoverUri {
    /// Wrap a broker address. Addresses already in failover form keep
    /// their own url list; their parameters override `policy`.
    pub fn from_address(address: &str, policy: &FailoverPolicy) -> Result<Self> {
        let address = address.trim();
        if address.starts_with(FAILOVER_SCHEME) {
            return Self::parse_with(address, policy.clone());
        }
        if address.is_empty() {
            return Err(Error::config_field_invalid("broker.address", "address is empty"));
        }
        Ok(Self {
            urls: vec![address.to_string()],
            policy: policy.clone(),
        })
    }

    /// Parse a `failover:` string with default parameters
    pub fn parse(uri: &str) -> Result<Self> {
        Self::parse_with(uri.trim(), FailoverPolicy::default())
    }

    fn parse_with(uri: &str, mut policy: FailoverPolicy) -> Result<Self> {
        let rest = uri.strip_prefix(FAILOVER_SCHEME).ok_or_else(|| {
            Error::config_field_invalid("broker.address", format!("'{}' is not a failover uri", uri))
        })?;

        let (list, query) = if let Some(inner) = rest.strip_prefix('(') {
            let close = inner.find(')').ok_or_else(|| {
                Error::config_field_invalid("broker.address", "unbalanced parenthesis in failover uri")
            })?;
            let after = &inner[close + 1..];
            let query = match after.strip_prefix('?') {
                Some(q) => q,
                None if after.is_empty() => "",
                None => {
                    return Err(Error::config_field_invalid(
                        "broker.address",
                        format!("unexpected '{}' after url list", after),
                    ))
                }
            };
            (&inner[..close], query)
        } else {
            match rest.split_once('?') {
                Some((list, query)) => (list, query),
                None => (rest, ""),
            }
        };

        let urls: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();
        if urls.is_empty() {
            return Err(Error::config_field_invalid("broker.address", "failover uri lists no urls"));
        }

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "initialReconnectDelay" => {
                    policy.initial_reconnect_delay = Duration::from_millis(parse_number(key, value)?);
                }
                "startupMaxReconnectAttempts" => {
                    policy.startup_max_reconnect_attempts = parse_number(key, value)?;
                }
                "maxReconnectAttempts" => {
                    policy.max_reconnect_attempts = parse_number(key, value)?;
                }
                other => debug!(option = other, "Ignoring unknown failover option"),
            }
        }

        Ok(Self { urls, policy })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::config_field_invalid("broker.address", format!("{} must be a number, got '{}'", key, value))
    })
}

impl fmt::Display for FailoverUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})?initialReconnectDelay={}&startupMaxReconnectAttempts={}&maxReconnectAttempts={}",
            FAILOVER_SCHEME,
            self.urls.join(","),
            self.policy.initial_reconnect_delay.as_millis(),
            self.policy.startup_max_reconnect_attempts,
            self.policy.max_reconnect_attempts,
        )
    }
}

/// Try every url in order, for up to `1 + max_attempts` rounds, waiting
/// with exponential backoff between rounds. Returns the first success or
/// the last error.
pub async fn connect_with_retry<T, F, Fut>(
    uri: &FailoverUri,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff {
        current_interval: uri.policy.initial_reconnect_delay,
        initial_interval: uri.policy.initial_reconnect_delay,
        multiplier: 2.0,
        max_interval: MAX_RECONNECT_DELAY,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut last_error = None;
    for round in 0..=max_attempts {
        for url in &uri.urls {
            match attempt(url.clone()).await {
                Ok(connected) => {
                    if round > 0 {
                        debug!(url = %url, round, "Connected after retry");
                    }
                    return Ok(connected);
                }
                Err(e) => {
                    debug!(url = %url, round, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        if round < max_attempts {
            let delay = backoff.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
            tokio::time::sleep(delay).await;
        }
    }

    warn!(uri = %uri, rounds = max_attempts + 1, "Giving up on broker connection");
    Err(last_error.unwrap_or_else(|| Error::connection_failed(uri.to_string(), "no broker urls")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bare_address_gets_default_policy() {
        let uri = FailoverUri::from_address("ws://10.0.0.5:61616", &FailoverPolicy::default()).unwrap();
        assert_eq!(uri.urls, vec!["ws://10.0.0.5:61616"]);
        assert_eq!(
            uri.to_string(),
            "failover:(ws://10.0.0.5:61616)?initialReconnectDelay=100&startupMaxReconnectAttempts=10&maxReconnectAttempts=20"
        );
    }

    #[test]
    fn test_parse_full_form() {
        let uri = FailoverUri::parse(
            "failover:(ws://a:1, ws://b:2)?initialReconnectDelay=250&maxReconnectAttempts=3&randomize=false",
        )
        .unwrap();
        assert_eq!(uri.urls, vec!["ws://a:1", "ws://b:2"]);
        assert_eq!(uri.policy.initial_reconnect_delay, Duration::from_millis(250));
        assert_eq!(uri.policy.startup_max_reconnect_attempts, 10);
        assert_eq!(uri.policy.max_reconnect_attempts, 3);
        assert_eq!(FailoverUri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn test_parse_without_parentheses() {
        let uri = FailoverUri::parse("failover:ws://a:1,ws://b:2").unwrap();
        assert_eq!(uri.urls.len(), 2);
        assert_eq!(uri.policy, FailoverPolicy::default());
    }

    #[test]
    fn test_parse_errors() {
        assert!(FailoverUri::parse("failover:()").is_err());
        assert!(FailoverUri::parse("failover:(ws://a").is_err());
        assert!(FailoverUri::parse("failover:(ws://a)?maxReconnectAttempts=lots").is_err());
        assert!(FailoverUri::parse("ws://a").is_err());
        assert!(FailoverUri::from_address("  ", &FailoverPolicy::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded() {
        let uri = FailoverUri::parse("failover:(ws://a,ws://b)?startupMaxReconnectAttempts=2").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = connect_with_retry(&uri, uri.policy.startup_max_reconnect_attempts, move |url| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::connection_failed(url, "refused"))
            }
        })
        .await;

        assert!(result.is_err());
        // 3 rounds over 2 urls
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_moves_to_next_url() {
        let uri = FailoverUri::parse("failover:(ws://down,ws://up)").unwrap();
        let connected = connect_with_retry(&uri, 0, |url| async move {
            if url == "ws://up" {
                Ok(url)
            } else {
                Err(Error::connection_failed(url, "refused"))
            }
        })
        .await
        .unwrap();
        assert_eq!(connected, "ws://up");
    }
}

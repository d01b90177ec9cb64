use std::time::Duration;

use crate::error::CoreError;

/// Client configuration loaded from environment variables.
///
/// All fields have defaults pointing at a local development backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// HTTP base URL of the backend (default: `http://localhost:8000`).
    pub api_base_url: String,
    /// WebSocket base URL for job status push channels
    /// (default: `ws://localhost:8000`).
    pub ws_base_url: String,
    /// Delay between status polls when the push channel is unavailable.
    pub poll_interval: Duration,
    /// Timeout applied to every HTTP request.
    pub request_timeout: Duration,
}

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
/// Extraction and indexing requests can take minutes to be accepted.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            ws_base_url: DEFAULT_WS_BASE_URL.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `LUMINA_API_BASE_URL`         | `http://localhost:8000` |
    /// | `LUMINA_WS_BASE_URL`          | `ws://localhost:8000`   |
    /// | `LUMINA_POLL_INTERVAL_MS`     | `2000`                  |
    /// | `LUMINA_REQUEST_TIMEOUT_SECS` | `120`                   |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let api_base_url = lookup("LUMINA_API_BASE_URL")
            .map(|url| trim_base_url(&url))
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.into());

        let ws_base_url = lookup("LUMINA_WS_BASE_URL")
            .map(|url| trim_base_url(&url))
            .unwrap_or_else(|| DEFAULT_WS_BASE_URL.into());

        let poll_interval_ms =
            parse_u64(&lookup, "LUMINA_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let request_timeout_secs = parse_u64(
            &lookup,
            "LUMINA_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;

        Ok(Self {
            api_base_url,
            ws_base_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

fn trim_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_u64<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, CoreError>
where
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| CoreError::Config { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn overrides_and_trims_trailing_slash() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("LUMINA_API_BASE_URL", "https://api.example.com/"),
            ("LUMINA_WS_BASE_URL", "wss://api.example.com//"),
            ("LUMINA_POLL_INTERVAL_MS", "500"),
            ("LUMINA_REQUEST_TIMEOUT_SECS", " 30 "),
        ]))
        .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.ws_base_url, "wss://api.example.com");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_number_is_an_error() {
        let result =
            ClientConfig::from_lookup(lookup_from(&[("LUMINA_POLL_INTERVAL_MS", "soon")]));
        assert_matches!(
            result,
            Err(CoreError::Config { var: "LUMINA_POLL_INTERVAL_MS", value }) if value == "soon"
        );
    }
}

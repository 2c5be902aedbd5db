//! Configuration for the optimization agent

use std::time::Duration;

use core_config::{env_or_default, env_parse_or, env_required, ConfigError, FromEnv};

fn default_region() -> String {
    "ap-south-1".to_string()
}

/// Agent configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the controller (required)
    pub central_server_url: String,
    /// Bearer token identifying the client account (required)
    pub client_token: String,
    /// Cloud region the node runs in
    pub region: String,
    /// Liveness reporting period
    pub heartbeat_interval: Duration,
    /// Reclaimable-price probe period
    pub spot_price_interval: Duration,
    /// Fixed-price probe period; doubles as the price-cache freshness window
    pub ondemand_price_interval: Duration,
    /// Pending-command drain period
    pub command_check_interval: Duration,
}

impl FromEnv for AgentConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            central_server_url: env_required("CENTRAL_SERVER_URL")?,
            client_token: env_required("CLIENT_TOKEN")?,
            region: env_or_default("AWS_REGION", &default_region()),
            heartbeat_interval: Duration::from_secs(env_parse_or("HEARTBEAT_INTERVAL", 60)?),
            spot_price_interval: Duration::from_secs(env_parse_or("SPOT_PRICE_INTERVAL", 600)?),
            ondemand_price_interval: Duration::from_secs(env_parse_or(
                "ONDEMAND_PRICE_INTERVAL",
                3600,
            )?),
            command_check_interval: Duration::from_secs(env_parse_or(
                "COMMAND_CHECK_INTERVAL",
                30,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [(&str, Option<&str>); 2] = [
        ("CENTRAL_SERVER_URL", Some("https://controller.example.com")),
        ("CLIENT_TOKEN", Some("token-123")),
    ];

    #[test]
    fn test_missing_server_url_is_an_error() {
        temp_env::with_vars(
            [
                ("CENTRAL_SERVER_URL", None),
                ("CLIENT_TOKEN", Some("token-123")),
            ],
            || {
                let err = AgentConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("CENTRAL_SERVER_URL"));
            },
        );
    }

    #[test]
    fn test_missing_client_token_is_an_error() {
        temp_env::with_vars(
            [
                ("CENTRAL_SERVER_URL", Some("https://controller.example.com")),
                ("CLIENT_TOKEN", None),
            ],
            || {
                let err = AgentConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("CLIENT_TOKEN"));
            },
        );
    }

    #[test]
    fn test_defaults_apply_when_only_required_vars_set() {
        temp_env::with_vars(
            REQUIRED
                .into_iter()
                .chain([
                    ("AWS_REGION", None),
                    ("HEARTBEAT_INTERVAL", None),
                    ("SPOT_PRICE_INTERVAL", None),
                    ("ONDEMAND_PRICE_INTERVAL", None),
                    ("COMMAND_CHECK_INTERVAL", None),
                ])
                .collect::<Vec<_>>(),
            || {
                let config = AgentConfig::from_env().unwrap();
                assert_eq!(config.region, "ap-south-1");
                assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
                assert_eq!(config.spot_price_interval, Duration::from_secs(600));
                assert_eq!(config.ondemand_price_interval, Duration::from_secs(3600));
                assert_eq!(config.command_check_interval, Duration::from_secs(30));
            },
        );
    }

    #[test]
    fn test_intervals_read_from_env() {
        temp_env::with_vars(
            REQUIRED
                .into_iter()
                .chain([
                    ("HEARTBEAT_INTERVAL", Some("15")),
                    ("COMMAND_CHECK_INTERVAL", Some("5")),
                ])
                .collect::<Vec<_>>(),
            || {
                let config = AgentConfig::from_env().unwrap();
                assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
                assert_eq!(config.command_check_interval, Duration::from_secs(5));
            },
        );
    }

    #[test]
    fn test_unparsable_interval_is_an_error() {
        temp_env::with_vars(
            REQUIRED
                .into_iter()
                .chain([("HEARTBEAT_INTERVAL", Some("every-minute"))])
                .collect::<Vec<_>>(),
            || {
                let err = AgentConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("HEARTBEAT_INTERVAL"));
            },
        );
    }
}

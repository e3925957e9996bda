use std::net::IpAddr;
use std::time::Duration;

use tracing::warn;

use crate::gateway;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the relay listens on
    pub port: u16,
    /// Host every sandbox shell is reached on. Resolved once at start-up.
    pub upstream_host: IpAddr,
    /// How long to wait for a sandbox shell to accept the upstream channel
    pub upstream_connect_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let upstream_host = match std::env::var("RELAY_UPSTREAM_HOST") {
            Ok(raw) => raw
                .parse::<IpAddr>()
                .map_err(|e| anyhow::anyhow!("Failed to parse env var RELAY_UPSTREAM_HOST={raw}: {e}"))?,
            Err(_) => match gateway::default_gateway() {
                Some(ip) => IpAddr::V4(ip),
                None => {
                    warn!("no default route found; relaying to sandboxes on 127.0.0.1");
                    IpAddr::from([127, 0, 0, 1])
                }
            },
        };

        Ok(Self {
            port: env_parse("RELAY_PORT", 10412)?,
            upstream_host,
            upstream_connect_timeout: Duration::from_millis(env_parse(
                "RELAY_UPSTREAM_CONNECT_TIMEOUT_MS",
                5000,
            )?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_uses_default_when_unset() {
        let value: u16 = env_parse("RELAY_TEST_UNSET_VARIABLE_FOR_DEFAULT", 10412).unwrap();
        assert_eq!(value, 10412);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("RELAY_TEST_GARBAGE_PORT", "not-a-port");
        let err = env_parse::<u16>("RELAY_TEST_GARBAGE_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("RELAY_TEST_GARBAGE_PORT"));
        std::env::remove_var("RELAY_TEST_GARBAGE_PORT");
    }
}

use std::net::IpAddr;
use std::time::Duration;

use crate::config::Config;

/// Read-only relay settings shared by every connection. Channel pairs keep
/// their own state inside the task that bridges them.
#[derive(Debug, Clone)]
pub struct RelayState {
    pub upstream_host: IpAddr,
    pub upstream_connect_timeout: Duration,
}

impl From<&Config> for RelayState {
    fn from(config: &Config) -> Self {
        Self {
            upstream_host: config.upstream_host,
            upstream_connect_timeout: config.upstream_connect_timeout,
        }
    }
}

//! CLI surface and startup-time resolution. Everything here is either
//! fatal-on-failure (bad flags, unresolvable hostnames) or produces the
//! fully-resolved [`ResolvedConfig`] the rest of the proxy runs on.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::Parser;
use raknet_wire::AddressTemplate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not resolve server hostname \"{hostname}\": {source}")]
    ServerResolution {
        hostname: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not resolve proxy hostname \"{hostname}\": {source}")]
    ProxyResolution {
        hostname: String,
        #[source]
        source: std::io::Error,
    },
    #[error("hostname \"{0}\" resolved to no usable IPv4 address")]
    NoIpv4Address(String),
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// A transparent bidirectional UDP relay for the RakNet protocol.
#[derive(Parser, Debug)]
#[command(name = "raknet-proxy", version, about)]
pub struct Args {
    /// Port on which to listen for RakNet packets from clients.
    #[arg(long)]
    pub listen_port: u16,
    /// Hostname/IP of the upstream RakNet server.
    #[arg(long)]
    pub server_hostname: String,
    /// Upstream server RakNet port.
    #[arg(long)]
    pub server_port: u16,
    /// Public hostname/IP at which clients reach the proxy. Falls back
    /// to 0.0.0.0 if unset - most deployments should set this.
    #[arg(long)]
    pub proxy_hostname: Option<String>,
    /// Log level.
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
    /// Seconds of silence in both directions before a flow is torn down.
    #[arg(long, default_value_t = 60)]
    pub idle_timeout_secs: u64,
}

/// Configuration after hostname resolution, ready to hand to the
/// [`crate::dispatcher::Dispatcher`].
pub struct ResolvedConfig {
    pub listen_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub proxy_as_server_template: AddressTemplate,
    pub idle_timeout: Duration,
    pub gc_interval: Duration,
}

impl Args {
    pub async fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let listen_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.listen_port);

        let server_addr = resolve_ipv4(&self.server_hostname, self.server_port)
            .await
            .map_err(|source| ConfigError::ServerResolution {
                hostname: self.server_hostname.clone(),
                source,
            })?
            .ok_or_else(|| ConfigError::NoIpv4Address(self.server_hostname.clone()))?;

        let proxy_public_ip = match &self.proxy_hostname {
            Some(hostname) => {
                let resolved = resolve_ipv4(hostname, self.listen_port)
                    .await
                    .map_err(|source| ConfigError::ProxyResolution {
                        hostname: hostname.clone(),
                        source,
                    })?
                    .ok_or_else(|| ConfigError::NoIpv4Address(hostname.clone()))?;
                match resolved.ip() {
                    std::net::IpAddr::V4(ip) => ip,
                    std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                }
            }
            // No public hostname given: this proxy can't learn its own
            // public IP from binding 0.0.0.0, so it falls back to the
            // unspecified address. Deployments behind NAT need
            // --proxy-hostname to get a correct OpenConnectionReply2.
            None => Ipv4Addr::UNSPECIFIED,
        };

        let proxy_as_server_template = AddressTemplate::encode(proxy_public_ip, self.listen_port);

        Ok(ResolvedConfig {
            listen_addr,
            server_addr,
            proxy_as_server_template,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            gc_interval: Duration::from_secs((self.idle_timeout_secs / 2).max(1)),
        })
    }
}

async fn resolve_ipv4(hostname: &str, port: u16) -> std::io::Result<Option<SocketAddr>> {
    let addrs = tokio::net::lookup_host((hostname, port)).await?;
    Ok(addrs.into_iter().find(|addr| addr.is_ipv4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(proxy_hostname: Option<&str>) -> Args {
        Args {
            listen_port: 19132,
            server_hostname: "127.0.0.1".into(),
            server_port: 40001,
            proxy_hostname: proxy_hostname.map(String::from),
            log_level: log::LevelFilter::Info,
            log_format: LogFormat::Json,
            idle_timeout_secs: 60,
        }
    }

    #[tokio::test]
    async fn resolves_loopback_server_and_proxy() {
        let resolved = args(Some("10.0.0.1")).resolve().await.unwrap();
        assert_eq!(resolved.server_addr, "127.0.0.1:40001".parse().unwrap());
        assert_eq!(
            resolved.proxy_as_server_template,
            AddressTemplate::encode(Ipv4Addr::new(10, 0, 0, 1), 19132)
        );
    }

    #[tokio::test]
    async fn missing_proxy_hostname_falls_back_to_unspecified() {
        let resolved = args(None).resolve().await.unwrap();
        assert_eq!(
            resolved.proxy_as_server_template,
            AddressTemplate::encode(Ipv4Addr::UNSPECIFIED, 19132)
        );
    }

    #[tokio::test]
    async fn unresolvable_hostname_is_a_config_error() {
        let mut cfg = args(None);
        cfg.server_hostname = "this-host-does-not-resolve.invalid".into();
        assert!(cfg.resolve().await.is_err());
    }
}

//! DNS resolution.
//!
//! Resolution order: static host overrides, then a custom DNS server when
//! one is configured (via `hickory-resolver`), then the system resolver.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use once_cell::sync::OnceCell;

use crate::error::Error;

/// Which address families a lookup may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// Resolver configuration: a custom DNS server and static host overrides
/// resembling `/etc/hosts`.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub custom_server: Option<SocketAddr>,
    pub static_hosts: HashMap<String, IpAddr>,
    pub family: AddressFamily,
}

pub(crate) struct Resolver {
    config: ResolverConfig,
    hickory: OnceCell<hickory_resolver::TokioAsyncResolver>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").field("config", &self.config).finish()
    }
}

impl Resolver {
    pub(crate) fn new(config: ResolverConfig) -> Resolver {
        Resolver {
            config,
            hickory: OnceCell::new(),
        }
    }

    pub(crate) async fn resolve(&self, host: &str, port: u16) -> crate::Result<Vec<SocketAddr>> {
        // literal addresses skip resolution entirely
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(self.filter(vec![SocketAddr::new(ip, port)], host)?);
        }

        if let Some(ip) = self.config.static_hosts.get(host) {
            return Ok(self.filter(vec![SocketAddr::new(*ip, port)], host)?);
        }

        let addrs = match self.config.custom_server {
            Some(server) => self.resolve_custom(server, host, port).await?,
            None => tokio::net::lookup_host((host, port))
                .await
                .map_err(Error::resolve)?
                .collect(),
        };
        self.filter(addrs, host)
    }

    async fn resolve_custom(
        &self,
        server: SocketAddr,
        host: &str,
        port: u16,
    ) -> crate::Result<Vec<SocketAddr>> {
        use hickory_resolver::config::{
            NameServerConfigGroup, ResolverConfig as HickoryConfig, ResolverOpts,
        };
        use hickory_resolver::TokioAsyncResolver;

        let resolver = self.hickory.get_or_init(|| {
            let group =
                NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
            let config = HickoryConfig::from_parts(None, vec![], group);
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        });

        let lookup = resolver.lookup_ip(host).await.map_err(Error::resolve)?;
        Ok(lookup
            .iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect())
    }

    fn filter(&self, addrs: Vec<SocketAddr>, host: &str) -> crate::Result<Vec<SocketAddr>> {
        let keep = |addr: &SocketAddr| match self.config.family {
            AddressFamily::Any => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        };
        let filtered: Vec<SocketAddr> = addrs.into_iter().filter(keep).collect();
        if filtered.is_empty() {
            return Err(Error::resolve(format!("no usable addresses for {host}")));
        }
        Ok(filtered)
    }
}

//! Host selection across the configured brokers.

use {
    crate::{
        caller::Caller,
        config::Configuration,
        error::{Result, ServiceBusError},
        message::{PING, PONG},
    },
    log::{debug, info, warn},
    serde::Deserialize,
};

/// How a sender picks the broker host to talk through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategy {
    /// First host in order, no probing.
    Simple,
    /// First host through which the target node answers `PING`.
    #[default]
    Smart,
}

/// Chooses a host for reaching one node.  `reverse` walks the host list
/// back to front, which spreads co-located senders (pings use it) away from
/// the hosts regular traffic prefers.
pub struct FailoverRouter<'a> {
    config: &'a Configuration,
    strategy: RoutingStrategy,
    reverse: bool,
}

impl<'a> FailoverRouter<'a> {
    pub fn new(config: &'a Configuration, strategy: RoutingStrategy, reverse: bool) -> Self {
        Self {
            config,
            strategy,
            reverse,
        }
    }

    /// Hosts in probing order.
    pub fn ordered_hosts(&self) -> Vec<&'a str> {
        let mut hosts: Vec<&str> = self.config.hosts.iter().map(String::as_str).collect();
        if self.reverse {
            hosts.reverse();
        }
        hosts
    }

    /// Pick a caller for `node`.
    ///
    /// Simple routing connects to the first host and fails if it cannot.
    /// Smart routing returns a connected caller on the first host where
    /// `node` answers `PONG`; when none does it falls back to an unconnected
    /// caller on the first host rather than failing.
    pub fn select(&self, node: &str) -> Result<Caller> {
        let hosts = self.ordered_hosts();
        let Some(first) = hosts.first().copied() else {
            return Err(ServiceBusError::Validation("no broker hosts configured".into()));
        };

        match self.strategy {
            RoutingStrategy::Simple => {
                let mut caller = self.config.create_host_caller(first);
                caller.ensure_connection()?;
                Ok(caller)
            }
            RoutingStrategy::Smart => {
                for host in &hosts {
                    let mut caller = self.config.create_host_caller(host);
                    match caller.call(node, PING, self.config.ping_timeout()) {
                        Ok(reply) if reply == PONG => {
                            debug!("{node} answers through {host}");
                            return Ok(caller);
                        }
                        Ok(reply) => warn!("{node} via {host} answered {reply:?} to PING"),
                        Err(e) => debug!("{node} not reachable via {host}: {e}"),
                    }
                    caller.close();
                }
                info!("{node} answered on no host, falling back to {first}");
                Ok(self.config.create_host_caller(first))
            }
        }
    }
}

//! Process-wide registry of live broker links.
//!
//! Every [`ConnectionDriver`](crate::connection::ConnectionDriver) registers
//! its [`LinkState`] after a successful connect and deregisters it on close.
//! [`ConnectionRegistry::close_all`] is the last-resort teardown used during
//! shutdown: it marks every registered link down, which makes the consume
//! loops and pending calls bound to those links give up at their next tick.

use {
    crate::connection::LinkState,
    log::{debug, info},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{Arc, OnceLock},
    },
};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    links: Mutex<HashMap<u64, Arc<LinkState>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, link: &Arc<LinkState>) {
        self.links.lock().insert(link.id(), Arc::clone(link));
        debug!("registered link #{} to {}", link.id(), link.host());
    }

    pub fn deregister(&self, id: u64) {
        if self.links.lock().remove(&id).is_some() {
            debug!("deregistered link #{id}");
        }
    }

    /// Number of registered (open) links.
    pub fn count(&self) -> usize {
        self.links.lock().len()
    }

    /// Mark every registered link down and forget them.  Returns how many
    /// links were affected.
    pub fn close_all(&self) -> usize {
        let links: Vec<Arc<LinkState>> = self.links.lock().drain().map(|(_, link)| link).collect();
        for link in &links {
            link.mark_disconnected();
        }
        if !links.is_empty() {
            info!("force-closed {} broker link(s)", links.len());
        }
        links.len()
    }
}

/// The registry shared by every configuration that does not bring its own.
pub fn global() -> Arc<ConnectionRegistry> {
    static GLOBAL: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(ConnectionRegistry::new())))
}

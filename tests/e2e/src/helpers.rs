//! Shared test utilities for service bus end-to-end tests.
//!
//! A [`Cluster`] is a set of in-memory broker hosts plus one reachability
//! probe shared by every node built on it, so a test can take a broker down
//! or make the watchdog see a dead peer.

use {
    serde::Deserialize,
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
    trv1_servicebus::{
        broker::memory::{MemoryBroker, MemoryConnector},
        probe::ManualProbe,
        Configuration, Request, RoutingStrategy, RpcResponse, Sender, ServiceBus,
        ServiceBusHandle,
    },
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Node name of the service host under test.
pub const NODE: &str = "NODE1";

/// Second service host, for tests that route to more than one node.
pub const NODE2: &str = "NODE2";

/// Node name used by client configurations.
pub const CLIENT: &str = "CLIENT";

/// Token seed shared by nodes and well-behaved clients.
pub const SECRET: &str = "e2e-secret";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Timeout for ordinary RPC calls.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// Cluster
// ─────────────────────────────────────────────────────────────────────────────

pub struct Cluster {
    pub connector: MemoryConnector,
    pub probe: ManualProbe,
}

impl Cluster {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            connector: MemoryConnector::with_hosts(hosts),
            probe: ManualProbe::new(true),
        }
    }

    pub fn broker(&self, host: &str) -> MemoryBroker {
        self.connector
            .broker(host)
            .unwrap_or_else(|| panic!("no broker {host}"))
    }

    /// Configuration for [`NODE`] serving on `hosts`.
    pub fn node_config(&self, hosts: &[&str]) -> Configuration {
        self.named_node_config(NODE, hosts)
    }

    pub fn named_node_config(&self, node: &str, hosts: &[&str]) -> Configuration {
        self.config(hosts, SECRET).with_node_name(node)
    }

    /// A Smart-routing client over `hosts`.
    pub fn client(&self, hosts: &[&str]) -> Sender {
        self.client_with(hosts, SECRET, RoutingStrategy::Smart)
    }

    pub fn client_with(&self, hosts: &[&str], secret: &str, strategy: RoutingStrategy) -> Sender {
        let config = self.config(hosts, secret).with_node_name(CLIENT);
        Sender::new(Arc::new(config)).with_strategy(strategy)
    }

    fn config(&self, hosts: &[&str], secret: &str) -> Configuration {
        let hosts = hosts.iter().map(|host| host.to_string()).collect();
        Configuration::dev_default(hosts, secret)
            .with_connector(Arc::new(self.connector.clone()))
            .with_probe(Arc::new(self.probe.clone()))
    }

    /// Run `bus` as [`NODE`] and wait until it consumes on every host in
    /// `hosts`.
    pub fn start(&self, bus: ServiceBus, hosts: &[&str]) -> ServiceBusHandle {
        self.start_node(bus, NODE, hosts)
    }

    pub fn start_node(&self, bus: ServiceBus, node: &str, hosts: &[&str]) -> ServiceBusHandle {
        let handle = bus.run().expect("service bus should start");
        let ready = wait_for(|| {
            handle.connection_count() >= hosts.len()
                && hosts
                    .iter()
                    .all(|host| self.broker(host).queue_exists(node))
        });
        assert!(ready, "service bus did not bind {node} on {hosts:?}");
        handle
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Services
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AddParams {
    pub a: i64,
    pub b: i64,
}

/// Register `math.add`, which answers `a + b`.
pub fn add_math_service(bus: &mut ServiceBus) {
    bus.add_rpc_service("math", "add", || {
        |request: &mut Request, response: RpcResponse| -> anyhow::Result<()> {
            let params: AddParams = request.params_as()?;
            response.send(params.a.saturating_add(params.b))?;
            Ok(())
        }
    });
}

/// Call `NODE1.math.add` with 2 and 3 and return the reply text.
pub fn call_add(sender: &mut Sender) -> trv1_servicebus::Result<String> {
    call_add_on(sender, NODE)
}

pub fn call_add_on(sender: &mut Sender, node: &str) -> trv1_servicebus::Result<String> {
    let target = format!("{node}.math.add");
    let reply = sender.call(&target, &serde_json::json!({"a": 2, "b": 3}), CALL_TIMEOUT)?;
    Ok(reply.message)
}

// ─────────────────────────────────────────────────────────────────────────────
// Waiting
// ─────────────────────────────────────────────────────────────────────────────

/// Poll `done` until it holds or [`WAIT`] passes.
pub fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now()
        .checked_add(WAIT)
        .unwrap_or_else(Instant::now);
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

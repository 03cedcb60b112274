//! Service bus configuration and the factories built on it.

use {
    crate::{
        broker::{amqp::AmqpConnector, ConnectParams, Connector},
        caller::Caller,
        connection::ConnectionDriver,
        error::{Result, ServiceBusError},
        probe::{CommandProbe, ReachabilityProbe, TcpProbe},
        receiver::MessageBusReceiver,
        registry::{self, ConnectionRegistry},
        router::{FailoverRouter, RoutingStrategy},
    },
    log::{info, warn},
    serde::Deserialize,
    std::{fmt, sync::Arc, thread, time::Duration},
};

/// Exchange used when none is configured; existing nodes publish to it.
pub const DEFAULT_EXCHANGE_NAME: &str = "py-servicebus";

/// Plain AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// AMQP-over-TLS port.
pub const DEFAULT_SSL_PORT: u16 = 5671;

// ── Watchdog tuning ─────────────────────────────────────────────────────────

/// How the watchdog decides that a broker host is still there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// One ICMP echo through the system `ping`.
    #[default]
    Ping,
    /// A TCP connect to the broker port, for networks that drop ICMP.
    Tcp,
}

/// Tuning for the liveness watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// How often the watchdog wakes to check for stop requests (ms).
    pub jiffy_ms: u64,
    /// Interval between reachability probes (ms).
    pub probe_interval_ms: u64,
    /// Probe attempts before the peer is declared dead.
    pub probe_attempts: u32,
    /// Pause between failed probe attempts (ms).
    pub probe_pause_ms: u64,
    pub method: ProbeMethod,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            jiffy_ms: 5_000,
            probe_interval_ms: 60_000,
            probe_attempts: 3,
            probe_pause_ms: 1_000,
            method: ProbeMethod::Ping,
        }
    }
}

impl WatcherConfig {
    pub fn jiffy(&self) -> Duration {
        Duration::from_millis(self.jiffy_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_pause(&self) -> Duration {
        Duration::from_millis(self.probe_pause_ms)
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Broker hosts, credentials, naming and timing for one node.
///
/// Shared read-only (`Arc<Configuration>`) by every sender and receiver it
/// creates.  The broker connector, reachability probe and connection
/// registry are injected collaborators and are never deserialized.
#[derive(Clone, Deserialize)]
pub struct Configuration {
    /// Broker hosts in preference order.
    pub hosts: Vec<String>,
    /// Seed for message tokens.
    pub secret_token: String,

    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ssl_port")]
    pub ssl_port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Node name, which is also the inbound queue name and routing key.
    /// Defaults to the first label of the local hostname.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,

    /// Socket connect timeout (ms).
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// AMQP heartbeat (seconds, 0 disables).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Capacity of each service runner's queue.
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
    /// Pause before a host loop rebuilds a lost connection (ms).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Default RPC timeout (ms).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Timeout of a liveness `PING` (ms).
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Consume-loop tick used to observe shutdown, liveness and timers (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Host selection attempts before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Pause between host selection attempts (ms).
    #[serde(default = "default_connect_retry_pause_ms")]
    pub connect_retry_pause_ms: u64,
    #[serde(default)]
    pub routing: RoutingStrategy,
    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(skip, default = "default_connector")]
    pub connector: Arc<dyn Connector>,
    /// Overrides the probe `watcher.method` would build.
    #[serde(skip)]
    pub probe: Option<Arc<dyn ReachabilityProbe>>,
    #[serde(skip, default = "registry::global")]
    pub registry: Arc<ConnectionRegistry>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ssl_port() -> u16 {
    DEFAULT_SSL_PORT
}

fn default_exchange_name() -> String {
    DEFAULT_EXCHANGE_NAME.to_string()
}

/// First label of the local hostname.
pub fn default_node_name() -> String {
    let host = gethostname::gethostname();
    let host = host.to_string_lossy();
    host.split('.').next().unwrap_or_default().to_string()
}

fn default_socket_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_queue_len() -> usize {
    100
}

fn default_reconnect_delay_ms() -> u64 {
    10_000
}

fn default_call_timeout_ms() -> u64 {
    300_000
}

fn default_ping_timeout_ms() -> u64 {
    3_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_retry_pause_ms() -> u64 {
    1_000
}

fn default_connector() -> Arc<dyn Connector> {
    Arc::new(AmqpConnector)
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("hosts", &self.hosts)
            .field("port", &self.port())
            .field("use_ssl", &self.use_ssl)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("node_name", &self.node_name)
            .field("exchange_name", &self.exchange_name)
            .field("routing", &self.routing)
            .field("connector", &self.connector)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// Production defaults for `hosts` with token seed `secret_token`.
    pub fn new(hosts: Vec<String>, secret_token: &str) -> Self {
        Self {
            hosts,
            secret_token: secret_token.to_string(),
            port: DEFAULT_PORT,
            ssl_port: DEFAULT_SSL_PORT,
            use_ssl: false,
            user: None,
            password: None,
            node_name: default_node_name(),
            exchange_name: default_exchange_name(),
            socket_timeout_ms: default_socket_timeout_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            queue_len: default_queue_len(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_attempts: default_connect_attempts(),
            connect_retry_pause_ms: default_connect_retry_pause_ms(),
            routing: RoutingStrategy::default(),
            watcher: WatcherConfig::default(),
            connector: default_connector(),
            probe: None,
            registry: registry::global(),
        }
    }

    /// Short timings for local testing.  Collaborators keep their production
    /// defaults; tests normally swap in an in-memory connector.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default(hosts: Vec<String>, secret_token: &str) -> Self {
        Self {
            socket_timeout_ms: 1_000,
            heartbeat_secs: 0,
            queue_len: 16,
            reconnect_delay_ms: 100,
            call_timeout_ms: 2_000,
            ping_timeout_ms: 300,
            poll_interval_ms: 10,
            connect_retry_pause_ms: 20,
            watcher: WatcherConfig {
                jiffy_ms: 10,
                probe_interval_ms: 50,
                probe_attempts: 2,
                probe_pause_ms: 10,
                method: ProbeMethod::Ping,
            },
            registry: Arc::new(ConnectionRegistry::new()),
            ..Self::new(hosts, secret_token)
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_node_name(mut self, node_name: &str) -> Self {
        self.node_name = node_name.to_string();
        self
    }

    /// Reject configurations no host loop or sender could work with.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ServiceBusError::Validation("no broker hosts configured".into()));
        }
        if self.hosts.iter().any(|host| host.trim().is_empty()) {
            return Err(ServiceBusError::Validation("empty broker host".into()));
        }
        if self.secret_token.is_empty() {
            return Err(ServiceBusError::Validation("secret_token must not be empty".into()));
        }
        if self.node_name.is_empty() || self.node_name.contains('.') {
            return Err(ServiceBusError::Validation(format!(
                "node_name {:?} must be non-empty and contain no '.'",
                self.node_name
            )));
        }
        if self.exchange_name.is_empty() {
            return Err(ServiceBusError::Validation("exchange_name must not be empty".into()));
        }
        if self.queue_len == 0 || self.connect_attempts == 0 || self.poll_interval_ms == 0 {
            return Err(ServiceBusError::Validation(
                "queue_len, connect_attempts and poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Effective broker port given the TLS flag.
    pub fn port(&self) -> u16 {
        if self.use_ssl {
            self.ssl_port
        } else {
            self.port
        }
    }

    /// Name of this node's inbound queue.
    pub fn queue_name(&self) -> &str {
        &self.node_name
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// The probe the watchdog runs against broker hosts: the injected one
    /// if any, else the one `watcher.method` names.
    pub fn reachability_probe(&self) -> Arc<dyn ReachabilityProbe> {
        if let Some(probe) = &self.probe {
            return Arc::clone(probe);
        }
        match self.watcher.method {
            ProbeMethod::Ping => Arc::new(CommandProbe),
            ProbeMethod::Tcp => Arc::new(TcpProbe {
                port: self.port(),
                timeout: self.socket_timeout(),
            }),
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_params(&self, host: &str) -> ConnectParams {
        ConnectParams {
            host: host.to_string(),
            port: self.port(),
            use_ssl: self.use_ssl,
            user: self.user.clone(),
            password: self.password.clone(),
            connection_timeout: self.socket_timeout(),
            heartbeat: Duration::from_secs(self.heartbeat_secs),
        }
    }

    /// A fresh, unconnected driver for `host`.
    pub fn create_driver(&self, host: &str) -> ConnectionDriver {
        ConnectionDriver::new(
            self.connect_params(host),
            Arc::clone(&self.connector),
            Arc::clone(&self.registry),
        )
    }

    /// A receiver for this node's queue on `host`.
    pub fn create_receiver(self: &Arc<Self>, host: &str) -> MessageBusReceiver {
        MessageBusReceiver::new(Arc::clone(self), self.create_driver(host))
    }

    /// An unconnected caller bound to `host`.
    pub fn create_host_caller(&self, host: &str) -> Caller {
        Caller::new(
            self.create_driver(host),
            &self.exchange_name,
            self.poll_interval(),
        )
    }

    /// A caller on a live host for reaching `node`, retrying host selection
    /// up to `connect_attempts` times.
    pub fn create_caller(
        &self,
        node: &str,
        strategy: RoutingStrategy,
        reverse: bool,
    ) -> Result<Caller> {
        let router = FailoverRouter::new(self, strategy, reverse);
        for attempt in 1..=self.connect_attempts {
            match router.select(node) {
                Ok(caller) => return Ok(caller),
                Err(e) => {
                    warn!(
                        "host selection for {node} failed (attempt {attempt}/{}): {e}",
                        self.connect_attempts
                    );
                }
            }
            if attempt < self.connect_attempts {
                thread::sleep(Duration::from_millis(self.connect_retry_pause_ms));
            }
        }
        Err(ServiceBusError::Connection(
            "Cannot Connect to Message Queue".to_string(),
        ))
    }

    /// One connected caller per host; hosts that fail to connect are logged
    /// and left out.
    pub fn create_senders(&self) -> Vec<Caller> {
        self.hosts
            .iter()
            .filter_map(|host| {
                let mut caller = self.create_host_caller(host);
                match caller.ensure_connection() {
                    Ok(()) => Some(caller),
                    Err(e) => {
                        info!("skipping broker {host}: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

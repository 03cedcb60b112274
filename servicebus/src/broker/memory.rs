//! In-process broker.
//!
//! Each host name maps to an independent [`MemoryBroker`] with its own
//! exchanges, bindings and queues.  Brokers can be taken offline and brought
//! back to simulate outages: going offline severs every open channel, drops
//! non-durable queues and refuses new connections until the host is back.

use {
    super::{
        AckMode, BrokerChannel, ConnectParams, ConsumeEvent, ConsumeOptions, Connector, Delivery,
        Flow, MessageProperties, Publication, QueueOptions, DEFAULT_EXCHANGE,
    },
    crate::error::{Result, ServiceBusError},
    crossbeam_channel::{never, select, unbounded, Receiver, Sender},
    log::{debug, trace},
    parking_lot::Mutex,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
};

// ── Connector ───────────────────────────────────────────────────────────────

/// Hands out channels to named in-memory brokers.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    hosts: Arc<Mutex<HashMap<String, MemoryBroker>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector with one online broker per host name.
    pub fn with_hosts(hosts: &[&str]) -> Self {
        let connector = Self::new();
        for host in hosts {
            connector.add_host(host);
        }
        connector
    }

    /// Register `host`, returning its broker (existing or new).
    pub fn add_host(&self, host: &str) -> MemoryBroker {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| MemoryBroker::new(host))
            .clone()
    }

    pub fn broker(&self, host: &str) -> Option<MemoryBroker> {
        self.hosts.lock().get(host).cloned()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn BrokerChannel>> {
        let broker = self.broker(&params.host).ok_or_else(|| {
            ServiceBusError::Connection(format!("{}: no such host", params.host))
        })?;
        let channel = broker.open_channel()?;
        Ok(Box::new(channel))
    }
}

// ── Broker ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
}

#[derive(Debug)]
struct StoredQueue {
    tx: Sender<StoredMessage>,
    rx: Receiver<StoredMessage>,
    durable: bool,
    /// Channel that declared an exclusive queue.
    owner: Option<u64>,
}

#[derive(Debug)]
struct BrokerState {
    online: bool,
    /// Bumped on every outage; channels opened in an older epoch are dead.
    epoch: u64,
    exchanges: HashSet<String>,
    /// exchange -> (routing key, queue)
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, StoredQueue>,
    open_channels: HashSet<u64>,
    next_channel: u64,
    next_queue: u64,
    next_tag: u64,
    acks: u64,
    published: u64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            online: true,
            epoch: 0,
            exchanges: HashSet::new(),
            bindings: HashMap::new(),
            queues: HashMap::new(),
            open_channels: HashSet::new(),
            next_channel: 0,
            next_queue: 0,
            next_tag: 0,
            acks: 0,
            published: 0,
        }
    }

    fn route(&mut self, publication: &Publication) -> Result<()> {
        let targets: Vec<String> = if publication.exchange == DEFAULT_EXCHANGE {
            vec![publication.routing_key.clone()]
        } else if self.exchanges.contains(&publication.exchange) {
            self.bindings
                .get(&publication.exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(key, _)| *key == publication.routing_key)
                        .map(|(_, queue)| queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            return Err(ServiceBusError::Broker(format!(
                "NOT_FOUND - no exchange '{}'",
                publication.exchange
            )));
        };

        self.published = self.published.saturating_add(1);
        for name in targets {
            match self.queues.get(&name) {
                Some(queue) => {
                    // both ends live in `self.queues`, so this cannot fail
                    let _ = queue.tx.send(StoredMessage {
                        body: publication.body.clone(),
                        properties: publication.properties.clone(),
                    });
                }
                None => trace!("unroutable message for {name:?} dropped"),
            }
        }
        Ok(())
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for bindings in self.bindings.values_mut() {
            bindings.retain(|(_, queue)| queue != name);
        }
    }
}

/// One simulated broker host.  Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    host: String,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Take the broker down or bring it back.  Going down severs every open
    /// channel and loses non-durable queues.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        if state.online == online {
            return;
        }
        state.online = online;
        if !online {
            state.epoch = state.epoch.saturating_add(1);
            state.open_channels.clear();
            let transient: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, queue)| !queue.durable)
                .map(|(name, _)| name.clone())
                .collect();
            for name in transient {
                state.remove_queue(&name);
            }
        }
        debug!("memory broker {} online={online}", self.host);
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains(name)
    }

    /// Messages waiting in `name`, or `None` if the queue does not exist.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|queue| queue.rx.len())
    }

    /// Channels currently open against this broker.
    pub fn connection_count(&self) -> usize {
        self.state.lock().open_channels.len()
    }

    pub fn ack_count(&self) -> u64 {
        self.state.lock().acks
    }

    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    /// Publish from outside any channel, e.g. to inject raw bodies in tests.
    pub fn inject(&self, publication: &Publication) -> Result<()> {
        self.state.lock().route(publication)
    }

    fn open_channel(&self) -> Result<MemoryChannel> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(ServiceBusError::Connection(format!(
                "{}: connection refused",
                self.host
            )));
        }
        state.next_channel = state.next_channel.saturating_add(1);
        let id = state.next_channel;
        state.open_channels.insert(id);
        Ok(MemoryChannel {
            broker: self.clone(),
            id,
            epoch: state.epoch,
            open: true,
        })
    }
}

// ── Channel ─────────────────────────────────────────────────────────────────

/// A channel on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    epoch: u64,
    open: bool,
}

impl MemoryChannel {
    /// Lock the broker state, failing if this channel is no longer usable.
    fn live_state(&self) -> Result<parking_lot::MutexGuard<'_, BrokerState>> {
        let state = self.broker.state.lock();
        if !self.open {
            return Err(ServiceBusError::Broker("channel closed".to_string()));
        }
        if !state.online || state.epoch != self.epoch {
            return Err(ServiceBusError::Broker(format!(
                "{}: connection reset",
                self.broker.host
            )));
        }
        Ok(state)
    }
}

impl BrokerChannel for MemoryChannel {
    fn declare_exchange(&mut self, name: &str) -> Result<()> {
        self.live_state()?.exchanges.insert(name.to_string());
        Ok(())
    }

    fn declare_queue(&mut self, name: &str, options: &QueueOptions) -> Result<String> {
        let mut state = self.live_state()?;
        let name = if name.is_empty() {
            state.next_queue = state.next_queue.saturating_add(1);
            format!("amq.gen-{}", state.next_queue)
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.id) {
                return Err(ServiceBusError::Broker(format!(
                    "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = unbounded();
        state.queues.insert(
            name.clone(),
            StoredQueue {
                tx,
                rx,
                durable: options.durable,
                owner: options.exclusive.then_some(self.id),
            },
        );
        Ok(name)
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(ServiceBusError::Broker(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(ServiceBusError::Broker(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        let bindings = state.bindings.entry(exchange.to_string()).or_default();
        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    fn delete_queue(&mut self, name: &str) -> Result<()> {
        self.live_state()?.remove_queue(name);
        Ok(())
    }

    fn publish(&mut self, publication: &Publication) -> Result<()> {
        self.live_state()?.route(publication)
    }

    fn consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
        outbox: Option<&Receiver<Publication>>,
        on_event: &mut dyn FnMut(ConsumeEvent) -> Result<Flow>,
    ) -> Result<()> {
        let deliveries = self
            .live_state()?
            .queues
            .get(queue)
            .map(|stored| stored.rx.clone())
            .ok_or_else(|| ServiceBusError::Broker(format!("NOT_FOUND - no queue '{queue}'")))?;
        let mut outbox = outbox.cloned().unwrap_or_else(never);

        loop {
            drop(self.live_state()?);

            let flow = select! {
                recv(deliveries) -> message => {
                    let Ok(message) = message else {
                        return Err(ServiceBusError::Broker(format!("queue '{queue}' deleted")));
                    };
                    let delivery_tag = {
                        let mut state = self.live_state()?;
                        state.next_tag = state.next_tag.saturating_add(1);
                        if options.ack == AckMode::OnReceipt {
                            state.acks = state.acks.saturating_add(1);
                        }
                        state.next_tag
                    };
                    on_event(ConsumeEvent::Delivery(Delivery {
                        delivery_tag,
                        body: message.body,
                        properties: message.properties,
                    }))?
                }
                recv(outbox) -> publication => {
                    match publication {
                        Ok(publication) => self.publish(&publication)?,
                        Err(_) => outbox = never(),
                    }
                    Flow::Continue
                }
                default(options.tick) => on_event(ConsumeEvent::Idle)?,
            };

            if flow == Flow::Stop {
                return Ok(());
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let mut state = self.broker.state.lock();
        state.open_channels.remove(&self.id);
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.remove_queue(&name);
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

//! One broker connection and its liveness flag.
//!
//! A [`ConnectionDriver`] owns a single connection+channel pair obtained from
//! a [`Connector`].  Its [`LinkState`] is shared with the watchdog and the
//! connection registry: `connected` turns true only after a fresh successful
//! connect and false on any broker failure, watchdog verdict or close.

use {
    crate::{
        broker::{
            BrokerChannel, ConnectParams, ConsumeEvent, ConsumeOptions, Connector, Flow,
            Publication, QueueOptions,
        },
        error::{Result, ServiceBusError},
        registry::ConnectionRegistry,
    },
    crossbeam_channel::Receiver,
    log::{debug, info, warn},
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

// ── LinkState ───────────────────────────────────────────────────────────────

/// Shared liveness of one broker link.
#[derive(Debug)]
pub struct LinkState {
    id: u64,
    host: String,
    connected: AtomicBool,
}

impl LinkState {
    pub fn new(host: &str) -> Self {
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            host: host.to_string(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Returns whether the link was connected before the call.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }
}

// ── ConnectionDriver ────────────────────────────────────────────────────────

pub struct ConnectionDriver {
    params: ConnectParams,
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    channel: Option<Box<dyn BrokerChannel>>,
    link: Arc<LinkState>,
}

impl ConnectionDriver {
    pub fn new(
        params: ConnectParams,
        connector: Arc<dyn Connector>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let link = Arc::new(LinkState::new(&params.host));
        Self {
            params,
            connector,
            registry,
            channel: None,
            link,
        }
    }

    pub fn host(&self) -> &str {
        &self.params.host
    }

    /// Handle on this driver's liveness flag.
    pub fn link(&self) -> Arc<LinkState> {
        Arc::clone(&self.link)
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some() && self.link.is_connected()
    }

    /// Open a fresh connection, replacing any previous one.
    pub fn connect(&mut self) -> Result<()> {
        self.drop_channel();
        match self.connector.connect(&self.params) {
            Ok(channel) => {
                self.channel = Some(channel);
                self.link.mark_connected();
                self.registry.register(&self.link);
                info!("connected to {}:{}", self.params.host, self.params.port);
                Ok(())
            }
            Err(e) => {
                self.link.mark_disconnected();
                warn!("connect to {} failed: {e}", self.params.host);
                Err(e)
            }
        }
    }

    /// Connect unless already connected.
    pub fn ensure_connection(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect()
    }

    pub fn declare_exchange(&mut self, name: &str) -> Result<()> {
        self.with_channel(|channel| channel.declare_exchange(name))
    }

    /// Declare the direct exchange and a durable queue named `queue`, then
    /// bind them with the queue name as routing key.
    pub fn bind_queue_to_exchange(&mut self, queue: &str, exchange: &str) -> Result<String> {
        self.with_channel(|channel| {
            channel.declare_exchange(exchange)?;
            let queue = channel.declare_queue(queue, &QueueOptions::durable())?;
            channel.bind_queue(&queue, exchange, &queue)?;
            Ok(queue)
        })
    }

    pub fn declare_queue(&mut self, name: &str, options: &QueueOptions) -> Result<String> {
        self.with_channel(|channel| channel.declare_queue(name, options))
    }

    pub fn delete_queue(&mut self, name: &str) -> Result<()> {
        self.with_channel(|channel| channel.delete_queue(name))
    }

    pub fn publish(&mut self, publication: &Publication) -> Result<()> {
        self.with_channel(|channel| channel.publish(publication))
    }

    /// Consume `queue` until `on_event` stops the loop or the link goes down.
    /// The link flag is checked before every event, so flipping it from
    /// another thread ends the loop within one tick.
    pub fn consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
        outbox: Option<&Receiver<Publication>>,
        on_event: &mut dyn FnMut(ConsumeEvent) -> Result<Flow>,
    ) -> Result<()> {
        let link = Arc::clone(&self.link);
        let mut guarded = |event: ConsumeEvent| {
            if !link.is_connected() {
                return Err(ServiceBusError::Connection(format!(
                    "link to {} marked down",
                    link.host()
                )));
            }
            on_event(event)
        };
        self.with_channel(|channel| channel.consume(queue, options, outbox, &mut guarded))
    }

    /// Close the connection.  Safe to call repeatedly or when never connected.
    pub fn close(&mut self) {
        if self.channel.is_some() {
            debug!("closing connection to {}", self.params.host);
        }
        self.drop_channel();
    }

    fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                debug!("close of {} reported: {e}", self.params.host);
            }
        }
        self.link.mark_disconnected();
        self.registry.deregister(self.link.id());
    }

    fn with_channel<T>(
        &mut self,
        op: impl FnOnce(&mut dyn BrokerChannel) -> Result<T>,
    ) -> Result<T> {
        if !self.link.is_connected() {
            return Err(ServiceBusError::Connection(format!(
                "not connected to {}",
                self.params.host
            )));
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(ServiceBusError::Connection(format!(
                "no channel to {}",
                self.params.host
            )));
        };
        let result = op(&mut **channel);
        if let Err(e) = &result {
            if e.is_connection() && self.link.mark_disconnected() {
                warn!("link to {} lost: {e}", self.params.host);
            }
        }
        result
    }
}

impl Drop for ConnectionDriver {
    fn drop(&mut self) {
        self.close();
    }
}

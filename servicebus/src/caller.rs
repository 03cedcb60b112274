//! Per-host sender: one-way publish and correlated RPC.
//!
//! An RPC call runs entirely on the calling thread:
//!
//! 1. ensure the connection (declaring the exchange after each connect);
//! 2. declare an exclusive, server-named reply queue;
//! 3. publish with `reply_to` and a fresh UUID correlation id;
//! 4. consume the reply queue (no-ack) with a [`CallTimer`] armed;
//! 5. stop on the first delivery carrying our correlation id, or fail with
//!    [`ServiceBusError::Timeout`] once the timer expires.
//!
//! The reply queue is deleted and the timer cancelled on every exit path.
//! Deliveries with any other correlation id are discarded.

use {
    crate::{
        broker::{AckMode, ConsumeEvent, ConsumeOptions, Flow, Publication, QueueOptions},
        connection::ConnectionDriver,
        error::{Result, ServiceBusError},
    },
    log::{debug, trace},
    std::{
        fmt,
        time::{Duration, Instant},
    },
    uuid::Uuid,
};

// ── CallTimer ───────────────────────────────────────────────────────────────

/// Single countdown for one RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimer {
    /// `None` when the timeout is too large to represent.
    deadline: Option<Instant>,
    armed: bool,
}

impl CallTimer {
    pub fn arm(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            armed: true,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn expired(&self) -> bool {
        self.armed && self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn remaining(&self) -> Option<Duration> {
        if !self.armed {
            return None;
        }
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&mut self) {
        self.armed = false;
    }
}

// ── PendingCall ─────────────────────────────────────────────────────────────

/// Correlation context of the call in flight.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub corr_id: String,
    pub callback_queue: String,
    pub timer: CallTimer,
}

// ── Caller ──────────────────────────────────────────────────────────────────

pub struct Caller {
    driver: ConnectionDriver,
    exchange_name: String,
    poll_interval: Duration,
    pending: Option<PendingCall>,
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("host", &self.host())
            .field("connected", &self.is_connected())
            .field("exchange_name", &self.exchange_name)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Caller {
    pub fn new(driver: ConnectionDriver, exchange_name: &str, poll_interval: Duration) -> Self {
        Self {
            driver,
            exchange_name: exchange_name.to_string(),
            poll_interval,
            pending: None,
        }
    }

    pub fn host(&self) -> &str {
        self.driver.host()
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// The call currently in flight, if any.
    pub fn pending_call(&self) -> Option<&PendingCall> {
        self.pending.as_ref()
    }

    /// Connect if needed; the exchange is declared after every fresh connect.
    pub fn ensure_connection(&mut self) -> Result<()> {
        if self.driver.is_connected() {
            return Ok(());
        }
        self.driver.connect()?;
        self.driver.declare_exchange(&self.exchange_name)
    }

    /// Publish `body` to `node` and close the connection afterwards.
    pub fn send(&mut self, node: &str, body: &str) -> Result<()> {
        let result = match self.ensure_connection() {
            Ok(()) => self
                .driver
                .publish(&Publication::new(&self.exchange_name, node, body)),
            Err(e) => Err(e),
        };
        self.driver.close();
        result.map_err(|e| ServiceBusError::Send(format!("{node}@{}: {e}", self.host())))
    }

    /// Synchronous RPC to `node`.  Returns the raw reply body.
    pub fn call(&mut self, node: &str, body: &str, timeout: Duration) -> Result<String> {
        self.ensure_connection()?;
        let callback_queue = self.driver.declare_queue("", &QueueOptions::exclusive())?;
        self.pending = Some(PendingCall {
            corr_id: Uuid::new_v4().to_string(),
            callback_queue,
            timer: CallTimer::arm(timeout),
        });

        let result = self.await_reply(node, body, timeout);
        self.finish_call();
        result
    }

    pub fn close(&mut self) {
        self.driver.close();
    }

    fn await_reply(&mut self, node: &str, body: &str, timeout: Duration) -> Result<String> {
        let (corr_id, callback_queue, timer) = match &self.pending {
            Some(pending) => (
                pending.corr_id.clone(),
                pending.callback_queue.clone(),
                pending.timer,
            ),
            None => return Err(ServiceBusError::ChannelClosed),
        };

        self.driver.publish(
            &Publication::new(&self.exchange_name, node, body)
                .with_reply_to(&callback_queue)
                .with_correlation_id(&corr_id),
        )?;

        let options = ConsumeOptions {
            ack: AckMode::Auto,
            tick: timer
                .remaining()
                .map_or(self.poll_interval, |left| left.min(self.poll_interval)),
        };
        let mut response = None;
        self.driver
            .consume(&callback_queue, &options, None, &mut |event| {
                if let ConsumeEvent::Delivery(delivery) = event {
                    if delivery.properties.correlation_id.as_deref() == Some(corr_id.as_str()) {
                        response = Some(delivery.body_text().into_owned());
                        return Ok(Flow::Stop);
                    }
                    trace!(
                        "discarding reply with correlation id {:?}",
                        delivery.properties.correlation_id
                    );
                }
                Ok(if timer.expired() {
                    Flow::Stop
                } else {
                    Flow::Continue
                })
            })?;

        match response {
            Some(response) => Ok(response),
            None => {
                debug!("call to {node} via {} timed out after {timeout:?}", self.host());
                Err(ServiceBusError::Timeout(timeout))
            }
        }
    }

    fn finish_call(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        pending.timer.cancel();
        if self.driver.is_connected() {
            if let Err(e) = self.driver.delete_queue(&pending.callback_queue) {
                debug!("reply queue {} not deleted: {e}", pending.callback_queue);
            }
        }
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        self.close();
    }
}

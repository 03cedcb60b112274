//! Consumes a node's inbound queue and dispatches each delivery.
//!
//! Every delivery is acknowledged on receipt, then classified:
//!
//! 1. `PING` with a reply queue is answered `PONG` straight away.
//! 2. The envelope is decoded and its token checked against the date window.
//! 3. Deliveries with a reply queue are RPC calls, the rest one-way messages.
//! 4. The matching [`ServiceRunner`](crate::runner::ServiceRunner) gets the job,
//!    blocking the consume loop while its queue is full.
//!
//! RPC failures along the way are answered with a text response so the
//! caller does not wait out its timeout.  One-way failures are logged and
//! dropped.  All replies go through the receiver's outbox and are published
//! by the consume loop, the only thread that touches the channel.

use {
    crate::{
        broker::{AckMode, ConsumeEvent, ConsumeOptions, Delivery, Flow, Publication},
        config::Configuration,
        connection::{ConnectionDriver, LinkState},
        error::Result,
        message::{decode_request, encode_response, Event, PING, PONG},
        request::{Request, RpcResponse},
        runner::{Job, RunnerSet},
        service::ServiceKind,
        signal::StopSignal,
        token::validate_token,
    },
    crossbeam_channel::{unbounded, Receiver, Sender},
    log::{debug, error, info, warn},
    std::sync::Arc,
};

pub const MESSAGE_NOT_VALID: &str = "Message not valid!";
pub const TOKEN_NOT_VALID: &str = "Token not valid!";

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Liveness probe answered.
    Pong,
    /// Handed to a service runner.
    Dispatched,
    /// RPC call answered with an error message.
    Rejected(String),
    /// One-way message discarded.
    Dropped,
}

/// Why the consume loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Shutdown,
    Disconnected,
}

pub struct MessageBusReceiver {
    driver: ConnectionDriver,
    dispatcher: Dispatcher,
    outbox_rx: Receiver<Publication>,
}

struct Dispatcher {
    config: Arc<Configuration>,
    outbox: Sender<Publication>,
}

impl MessageBusReceiver {
    pub fn new(config: Arc<Configuration>, driver: ConnectionDriver) -> Self {
        let (outbox, outbox_rx) = unbounded();
        Self {
            driver,
            dispatcher: Dispatcher { config, outbox },
            outbox_rx,
        }
    }

    pub fn host(&self) -> &str {
        self.driver.host()
    }

    /// The liveness flag the watchdog flips.
    pub fn link(&self) -> Arc<LinkState> {
        self.driver.link()
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    pub fn connect(&mut self) -> Result<()> {
        self.driver.connect()
    }

    pub fn ensure_connection(&mut self) -> Result<()> {
        self.driver.ensure_connection()
    }

    /// Declare the exchange and this node's durable queue and bind them.
    pub fn bind_queue_to_exchange(&mut self) -> Result<String> {
        let config = &self.dispatcher.config;
        self.driver
            .bind_queue_to_exchange(config.queue_name(), &config.exchange_name)
    }

    /// Classify and dispatch one delivery.
    pub fn handle_delivery(&self, delivery: &Delivery, runners: &RunnerSet) -> DeliveryOutcome {
        self.dispatcher.handle(delivery, runners)
    }

    /// Consume until `shutdown` fires or the link goes down.
    pub fn start_receive(&mut self, runners: &RunnerSet, shutdown: &StopSignal) -> ReceiveOutcome {
        let queue = self.dispatcher.config.queue_name().to_string();
        let options = ConsumeOptions {
            ack: AckMode::OnReceipt,
            tick: self.dispatcher.config.poll_interval(),
        };
        let dispatcher = &self.dispatcher;
        let result = self.driver.consume(
            &queue,
            &options,
            Some(&self.outbox_rx),
            &mut |event| {
                if let ConsumeEvent::Delivery(delivery) = event {
                    let outcome = dispatcher.handle(&delivery, runners);
                    debug!("delivery {} on {queue}: {outcome:?}", delivery.delivery_tag);
                }
                if shutdown.is_triggered() {
                    Ok(Flow::Stop)
                } else {
                    Ok(Flow::Continue)
                }
            },
        );

        match result {
            Ok(()) => ReceiveOutcome::Shutdown,
            Err(e) => {
                warn!("consume on {} ended: {e}", self.driver.host());
                ReceiveOutcome::Disconnected
            }
        }
    }

    /// Publish replies still queued after the consume loop ended.  Returns
    /// how many went out.
    pub fn flush_outbox(&mut self) -> usize {
        let mut sent = 0usize;
        for publication in self.outbox_rx.try_iter() {
            if let Err(e) = self.driver.publish(&publication) {
                let lost = self.outbox_rx.len().saturating_add(1);
                warn!("dropping {lost} queued repl(ies) on {}: {e}", self.driver.host());
                return sent;
            }
            sent = sent.saturating_add(1);
        }
        sent
    }

    pub fn close(&mut self) {
        self.driver.close();
    }
}

impl Dispatcher {
    fn handle(&self, delivery: &Delivery, runners: &RunnerSet) -> DeliveryOutcome {
        let reply_to = delivery
            .properties
            .reply_to
            .as_deref()
            .filter(|reply_to| !reply_to.is_empty());
        let correlation_id = delivery.properties.correlation_id.clone();
        let body = delivery.body_text();

        if let Some(reply_to) = reply_to {
            if body == PING {
                self.push(Publication::reply(reply_to, correlation_id, PONG));
                return DeliveryOutcome::Pong;
            }
        }

        let event = match decode_request(&body) {
            Ok(event) => event,
            Err(e) => {
                warn!("undecodable delivery: {e}");
                return self.reject(reply_to, correlation_id, "", MESSAGE_NOT_VALID);
            }
        };

        if !validate_token(&event.token, &self.config.secret_token) {
            warn!("bad token on {} ({})", event.service_key(), event.id);
            return self.reject(reply_to, correlation_id, &event.id, TOKEN_NOT_VALID);
        }

        let key = event.service_key();
        match reply_to {
            Some(reply_to) => {
                let Some(runner) = runners.get(ServiceKind::Rpc, &key) else {
                    info!("Cannot Find RPC Service: {key}");
                    let message = format!("Cannot Find RPC Service: {key}");
                    return self.reject(Some(reply_to), correlation_id, &event.id, &message);
                };
                let response =
                    RpcResponse::new(&event.id, reply_to, correlation_id, self.outbox.clone());
                self.enqueue(runner.dispatch(Job::Call(self.request(event), response)), &key)
            }
            None => {
                let Some(runner) = runners.get(ServiceKind::Message, &key) else {
                    info!("Cannot Find Message Service: {key}");
                    return DeliveryOutcome::Dropped;
                };
                self.enqueue(runner.dispatch(Job::Message(self.request(event))), &key)
            }
        }
    }

    fn request(&self, event: Event) -> Request {
        Request::new(event, Arc::clone(&self.config))
    }

    fn enqueue(&self, dispatched: Result<()>, key: &str) -> DeliveryOutcome {
        match dispatched {
            Ok(()) => DeliveryOutcome::Dispatched,
            Err(e) => {
                error!("runner for {key} is gone: {e}");
                DeliveryOutcome::Dropped
            }
        }
    }

    fn reject(
        &self,
        reply_to: Option<&str>,
        correlation_id: Option<String>,
        id: &str,
        message: &str,
    ) -> DeliveryOutcome {
        match reply_to {
            Some(reply_to) => {
                let body = encode_response(id, message);
                self.push(Publication::reply(reply_to, correlation_id, body));
                DeliveryOutcome::Rejected(message.to_string())
            }
            None => DeliveryOutcome::Dropped,
        }
    }

    fn push(&self, publication: Publication) {
        // the receiver holds the other end for as long as `self` exists
        let _ = self.outbox.send(publication);
    }
}

//! What a handler receives for one delivery.

use {
    crate::{
        broker::Publication,
        config::Configuration,
        error::{Result, ServiceBusError},
        message::{encode_response, Event},
        sender::Sender,
    },
    crossbeam_channel::Sender as OutboxSender,
    serde::{de::DeserializeOwned, Serialize},
    serde_json::Value,
    std::{fmt, sync::Arc},
};

/// One decoded request plus a lazily opened [`Sender`] for follow-up calls.
pub struct Request {
    event: Event,
    config: Arc<Configuration>,
    sender: Option<Sender>,
}

impl Request {
    pub fn new(event: Event, config: Arc<Configuration>) -> Self {
        Self {
            event,
            config,
            sender: None,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn params(&self) -> &Value {
        &self.event.params
    }

    /// Params deserialized into `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.event.params)?)
    }

    /// Sender bound to this node's configuration, opened on first use and
    /// closed once the handler returns.
    pub fn sender(&mut self) -> &mut Sender {
        let config = &self.config;
        self.sender
            .get_or_insert_with(|| Sender::new(Arc::clone(config)))
    }

    pub fn close(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            sender.close();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("event", &self.event)
            .field("sender_open", &self.sender.is_some())
            .finish()
    }
}

/// The reply handle for one RPC request.  Sending consumes it, so a handler
/// can answer at most once.
#[derive(Debug)]
pub struct RpcResponse {
    event_id: String,
    reply_to: String,
    correlation_id: Option<String>,
    outbox: OutboxSender<Publication>,
}

impl RpcResponse {
    pub fn new(
        event_id: &str,
        reply_to: &str,
        correlation_id: Option<String>,
        outbox: OutboxSender<Publication>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            reply_to: reply_to.to_string(),
            correlation_id,
            outbox,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Reply with `message` as text.
    pub fn send(self, message: impl fmt::Display) -> Result<()> {
        let body = encode_response(&self.event_id, &message.to_string());
        self.outbox
            .send(Publication::reply(&self.reply_to, self.correlation_id, body))
            .map_err(|_| ServiceBusError::ChannelClosed)
    }

    /// Reply with `value` serialized as JSON.
    pub fn send_json<T: Serialize + ?Sized>(self, value: &T) -> Result<()> {
        let message = serde_json::to_string(value)?;
        self.send(message)
    }
}

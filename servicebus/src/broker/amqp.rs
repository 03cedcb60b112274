//! RabbitMQ backend built on `amiquip`.

use {
    super::{
        AckMode, BrokerChannel, ConnectParams, ConsumeEvent, ConsumeOptions, Connector, Delivery,
        Flow, MessageProperties, Publication, QueueOptions,
    },
    crate::error::{Result, ServiceBusError},
    amiquip::{
        AmqpProperties, Channel, Connection, ConsumerMessage, ConsumerOptions,
        ExchangeDeclareOptions, ExchangeType, FieldTable, Publish, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    crossbeam_channel::{never, select, Receiver},
    log::{debug, warn},
};

fn broker_error(e: amiquip::Error) -> ServiceBusError {
    ServiceBusError::Broker(e.to_string())
}

/// Opens AMQP connections with one channel each.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl Connector for AmqpConnector {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn BrokerChannel>> {
        let url = params.amqp_url()?;
        let mut connection = Connection::open(&url)
            .map_err(|e| ServiceBusError::Connection(format!("{}: {e}", params.host)))?;
        let channel = match connection.open_channel(None) {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close();
                return Err(ServiceBusError::Connection(format!("{}: {e}", params.host)));
            }
        };
        debug!("amqp connection to {}:{} open", params.host, params.port);
        Ok(Box::new(AmqpChannel {
            connection: Some(connection),
            channel: Some(channel),
        }))
    }
}

/// One AMQP connection and the single channel opened on it.
pub struct AmqpChannel {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpChannel {
    fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| ServiceBusError::Broker("channel closed".to_string()))
    }
}

fn to_amqp_properties(properties: &MessageProperties) -> AmqpProperties {
    let mut amqp = AmqpProperties::default();
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.clone().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.clone().into());
    }
    amqp
}

fn publish_on(channel: &Channel, publication: &Publication) -> Result<()> {
    channel
        .basic_publish(
            publication.exchange.as_str(),
            Publish::with_properties(
                &publication.body,
                publication.routing_key.as_str(),
                to_amqp_properties(&publication.properties),
            ),
        )
        .map_err(broker_error)
}

fn from_amqp_properties(properties: &AmqpProperties) -> MessageProperties {
    MessageProperties {
        reply_to: properties.reply_to().as_ref().map(ToString::to_string),
        correlation_id: properties.correlation_id().as_ref().map(ToString::to_string),
    }
}

impl BrokerChannel for AmqpChannel {
    fn declare_exchange(&mut self, name: &str) -> Result<()> {
        self.channel()?
            .exchange_declare(
                ExchangeType::Direct,
                name,
                ExchangeDeclareOptions::default(),
            )
            .map(drop)
            .map_err(broker_error)
    }

    fn declare_queue(&mut self, name: &str, options: &QueueOptions) -> Result<String> {
        let queue = self
            .channel()?
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
            )
            .map_err(broker_error)?;
        Ok(queue.name().to_string())
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel()?
            .queue_bind(queue, exchange, routing_key, FieldTable::default())
            .map_err(broker_error)
    }

    fn delete_queue(&mut self, name: &str) -> Result<()> {
        self.channel()?
            .queue_delete(name, QueueDeleteOptions::default())
            .map(drop)
            .map_err(broker_error)
    }

    fn publish(&mut self, publication: &Publication) -> Result<()> {
        publish_on(self.channel()?, publication)
    }

    fn consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
        outbox: Option<&Receiver<Publication>>,
        on_event: &mut dyn FnMut(ConsumeEvent) -> Result<Flow>,
    ) -> Result<()> {
        let channel = self.channel()?;
        let consumer = channel
            .basic_consume(
                queue,
                ConsumerOptions {
                    no_ack: options.ack == AckMode::Auto,
                    ..ConsumerOptions::default()
                },
            )
            .map_err(broker_error)?;

        let deliveries = consumer.receiver();
        let mut outbox = outbox.cloned().unwrap_or_else(never);

        loop {
            let event = select! {
                recv(deliveries) -> message => match message {
                    Ok(ConsumerMessage::Delivery(mut delivery)) => {
                        let ours = Delivery {
                            delivery_tag: delivery.delivery_tag(),
                            body: std::mem::take(&mut delivery.body),
                            properties: from_amqp_properties(&delivery.properties),
                        };
                        if options.ack == AckMode::OnReceipt {
                            consumer.ack(delivery).map_err(broker_error)?;
                        }
                        Some(ConsumeEvent::Delivery(ours))
                    }
                    Ok(_) => {
                        warn!("consumer on {queue:?} cancelled or its channel closed");
                        return Err(ServiceBusError::Broker(format!(
                            "consumer on '{queue}' terminated"
                        )));
                    }
                    Err(_) => {
                        return Err(ServiceBusError::Broker(format!(
                            "consumer on '{queue}' disconnected"
                        )))
                    }
                },
                // replies queued by handler threads go out on this thread
                recv(outbox) -> publication => {
                    match publication {
                        Ok(publication) => publish_on(channel, &publication)?,
                        Err(_) => outbox = never(),
                    }
                    None
                }
                default(options.tick) => Some(ConsumeEvent::Idle),
            };
            let Some(event) = event else {
                continue;
            };

            if on_event(event)? == Flow::Stop {
                for publication in outbox.try_iter() {
                    publish_on(channel, &publication)?;
                }
                let _ = consumer.cancel();
                return Ok(());
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close();
        }
        match self.connection.take() {
            Some(connection) => connection.close().map_err(broker_error),
            None => Ok(()),
        }
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

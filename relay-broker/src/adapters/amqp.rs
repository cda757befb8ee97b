use crate::{BrokerError, Channel, Delivery, DeliveryStream, DeliveryTag, Transport};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use log::{debug, error};
use std::sync::Arc;
use tokio::sync::watch;

/// AMQP delivery mode that asks the broker to write the message to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;
const ACCESS_REFUSED: u16 = 403;

/// Connects to a RabbitMQ (AMQP 0-9-1) broker.
pub struct AmqpTransport {
    uri: String,
}

impl AmqpTransport {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(map_connect_error)?;
        let channel = connection.create_channel().await.map_err(map_error)?;

        let (lost_tx, lost_rx) = watch::channel(None);
        connection.on_error(move |err| {
            error!("RabbitMQ connection error: {}", err);
            lost_tx.send_replace(Some(err.to_string()));
        });

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            lost: lost_rx,
        }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
    lost: watch::Receiver<Option<String>>,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn declare_fanout(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let deliveries = consumer.map(|item| {
            item.map(|delivery| Delivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
            })
            .map_err(map_error)
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn requeue(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        // The returned confirm is dropped: publisher confirms are not enabled on this channel.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn closed(&self) -> BrokerError {
        let mut lost = self.lost.clone();
        let reason = match lost.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection handle dropped".to_string(),
        };
        BrokerError::Network(reason)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
            debug!("Closing RabbitMQ channel: {}", err);
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(map_error)
    }
}

fn map_connect_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp) if amqp.get_id() == ACCESS_REFUSED => {
            BrokerError::Auth(err.to_string())
        }
        _ => BrokerError::Network(err.to_string()),
    }
}

fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => BrokerError::Network(err.to_string()),
        other => BrokerError::Internal(other.to_string()),
    }
}

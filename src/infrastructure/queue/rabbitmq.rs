use super::{Delivery, Disposition, QueueError, Settle, Subscription, TaskMessage, TaskQueue};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*, publisher_confirm::Confirmation, types::{AMQPValue, FieldTable}, BasicProperties,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

fn broker_err(context: &str, e: lapin::Error) -> QueueError {
    QueueError::Broker(format!("{}: {}", context, e))
}

/// A nacked publish was not stored by the broker and must not count as enqueued.
fn check_confirmation(confirmation: &Confirmation) -> Result<(), QueueError> {
    if confirmation.is_nack() {
        return Err(QueueError::Broker("message nacked by broker".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct RabbitMqService {
    url: String,
    queue: String,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
}

impl RabbitMqService {
    async fn connect(url: &str) -> Result<(Connection, Channel), QueueError> {
        info!("Connecting to RabbitMQ at {}", url);
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| broker_err("Failed to connect to RabbitMQ", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| broker_err("Failed to create channel", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_err("Failed to enable publisher confirms", e))?;

        info!("Connected to RabbitMQ");
        Ok((conn, channel))
    }

    pub async fn new(url: &str, queue: &str) -> Result<Self, QueueError> {
        let (conn, channel) = Self::connect(url).await?;
        declare_queues(&channel, queue).await?;

        Ok(Self {
            url: url.to_string(),
            queue: queue.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url).await?;
        declare_queues(&channel, &self.queue).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        Ok(())
    }

    async fn publish_internal(&self, payload: &[u8]) -> Result<(), QueueError> {
        let channel = self.channel.lock().await;

        let confirmation = channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| broker_err("Failed to publish message", e))?
            .await
            .map_err(|e| broker_err("Failed to confirm publication", e))?;

        check_confirmation(&confirmation)
    }
}

/// Declares the work queue and its dead-letter queue. Rejected messages are
/// routed to `<queue>.dead` through the default exchange.
async fn declare_queues(channel: &Channel, queue: &str) -> Result<(), QueueError> {
    let dead_letter = format!("{}.dead", queue);

    channel
        .queue_declare(
            &dead_letter,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_err("Failed to declare dead-letter queue", e))?;

    let mut arguments = FieldTable::default();
    arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dead_letter.as_str().into()),
    );

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            arguments,
        )
        .await
        .map_err(|e| broker_err("Failed to declare queue", e))?;

    Ok(())
}

struct AmqpSettler {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Settle for AmqpSettler {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), QueueError> {
        match disposition {
            Disposition::Ack => self
                .delivery
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(|e| broker_err("Failed to ack message", e)),
            Disposition::Requeue => self
                .delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await
                .map(|_| ())
                .map_err(|e| broker_err("Failed to nack message", e)),
            Disposition::Reject => self
                .delivery
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map(|_| ())
                .map_err(|e| broker_err("Failed to reject message", e)),
        }
    }
}

#[async_trait]
impl TaskQueue for RabbitMqService {
    async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let payload = message.to_bytes()?;

        if let Err(e) = self.publish_internal(&payload).await {
            warn!("RabbitMQ publish failed: {}. Retrying after reconnect.", e);
            self.reconnect().await?;
            self.publish_internal(&payload).await?;
        }

        Ok(())
    }

    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, QueueError> {
        // One channel per consumer so prefetch=1 bounds each pool slot separately.
        let channel = self
            .conn
            .lock()
            .await
            .create_channel()
            .await
            .map_err(|e| broker_err("Failed to create consumer channel", e))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| broker_err("Failed to set prefetch", e))?;

        declare_queues(&channel, &self.queue).await?;

        let consumer = channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_err("Failed to create consumer", e))?;

        info!("🎥 Consumer '{}' listening on '{}'", consumer_tag, self.queue);

        let stream = consumer.map(move |delivery| {
            // The stream owns the channel handle for as long as it is consumed.
            let _channel = &channel;
            delivery
                .map(|delivery| {
                    let body = delivery.data.clone();
                    let redelivered = delivery.redelivered;
                    Delivery::new(body, redelivered, Box::new(AmqpSettler { delivery }))
                })
                .map_err(|e| broker_err("Consumer stream error", e))
        });

        Ok(stream.boxed())
    }
}

use anyhow::{Context, Result};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
};

use crate::{broadcast::Envelope, config::AmqpConfig};

/// Forwards broadcast envelopes to a topic exchange, routed by channel name.
pub struct AmqpRelay {
    _connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpRelay {
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to AMQP broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;

        channel
            .exchange_declare(
                config.exchange.as_str().into(),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {}", config.exchange))?;

        Ok(Self {
            _connection: connection,
            channel,
            exchange: config.exchange.clone(),
        })
    }

    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope).context("Failed to encode envelope")?;
        self.channel
            .basic_publish(
                self.exchange.as_str().into(),
                envelope.channel.as_str().into(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .context("Failed to publish envelope")?;
        Ok(())
    }
}

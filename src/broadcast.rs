//! In-process fan-out of consultation events.
//!
//! Every channel name owns a `tokio::sync::broadcast` sender created on first
//! subscription. Publishing is fire-and-forget: nobody listening is not an
//! error, and a slow subscriber skips what it missed. When an AMQP relay is
//! attached, each event is also forwarded to the exchange in the background.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures::Stream;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{amqp::AmqpRelay, resources::MessageRes};

const DEFAULT_CAPACITY: usize = 64;
const PRIVATE_PREFIX: &str = "private-";

/// A real-time channel scoped to one consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `consultation.{id}`: new and updated messages.
    Consultation(i64),
    /// `typing.consultation.{id}`: typing indicators.
    Typing(i64),
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::Consultation(id) => format!("consultation.{id}"),
            Channel::Typing(id) => format!("typing.consultation.{id}"),
        }
    }

    /// Parses a channel name as sent by clients, with or without the
    /// `private-` prefix.
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.strip_prefix(PRIVATE_PREFIX).unwrap_or(raw);
        if let Some(id) = name.strip_prefix("typing.consultation.") {
            return id.parse().ok().map(Channel::Typing);
        }
        name.strip_prefix("consultation.")
            .and_then(|id| id.parse().ok())
            .map(Channel::Consultation)
    }

    pub fn consultation_id(&self) -> i64 {
        match *self {
            Channel::Consultation(id) | Channel::Typing(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConsultationEvent {
    NewConsultationMessage { message: MessageRes },
    TypingIndicator { consultation_id: i64, user_id: i64 },
}

impl ConsultationEvent {
    pub fn channel(&self) -> Channel {
        match self {
            ConsultationEvent::NewConsultationMessage { message } => {
                Channel::Consultation(message.consultation_id)
            }
            ConsultationEvent::TypingIndicator {
                consultation_id, ..
            } => Channel::Typing(*consultation_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsultationEvent::NewConsultationMessage { .. } => "NewConsultationMessage",
            ConsultationEvent::TypingIndicator { .. } => "TypingIndicator",
        }
    }

    fn into_envelope(self) -> Envelope {
        let channel = self.channel().name();
        let event = self.name().to_string();
        let data = match self {
            ConsultationEvent::NewConsultationMessage { message } => json!({ "message": message }),
            ConsultationEvent::TypingIndicator {
                consultation_id,
                user_id,
            } => json!({ "consultation_id": consultation_id, "user_id": user_id }),
        };
        Envelope {
            channel,
            event,
            data,
        }
    }
}

/// What subscribers and the relay receive.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

pub struct Broadcaster {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<Envelope>>>>,
    relay: Option<Arc<AmqpRelay>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            relay: None,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_relay(mut self, relay: AmqpRelay) -> Self {
        self.relay = Some(Arc::new(relay));
        self
    }

    pub fn publish(&self, event: ConsultationEvent) {
        let envelope = Arc::new(event.into_envelope());

        {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(sender) = channels.get(&envelope.channel) {
                match sender.send(envelope.clone()) {
                    Ok(receivers) => tracing::debug!(
                        "Delivered {} on {} to {} subscriber(s)",
                        envelope.event,
                        envelope.channel,
                        receivers
                    ),
                    Err(_) => {
                        channels.remove(&envelope.channel);
                    }
                }
            }
        }

        if let Some(relay) = self.relay.clone() {
            tokio::spawn(async move {
                if let Err(err) = relay.publish(&envelope).await {
                    tracing::warn!(
                        "Failed to relay {} on {}: {:?}",
                        envelope.event,
                        envelope.channel,
                        err
                    );
                }
            });
        }
    }

    /// Subscribes to `channel`. Channels whose subscribers have all gone are
    /// dropped first.
    pub fn subscribe(&self, channel: &Channel) -> broadcast::Receiver<Arc<Envelope>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(channel.name())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(&channel.name())
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// Turns a subscription into a stream, skipping over events a lagging
/// receiver has lost.
pub fn envelope_stream(
    receiver: broadcast::Receiver<Arc<Envelope>>,
) -> impl Stream<Item = Arc<Envelope>> + Send + 'static {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => return Some((envelope, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged behind, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;

    use crate::enums::SenderType;

    fn message(consultation_id: i64) -> MessageRes {
        MessageRes {
            id: 10,
            consultation_id,
            sender_id: 1,
            sender_type: SenderType::Patient,
            subject: None,
            message: Some("hello".into()),
            read_by_patient: true,
            read_by_doctor: false,
            deleted_at: None,
            created_at: Utc::now(),
            sender: None,
            attachments: vec![],
        }
    }

    #[test]
    fn channel_names_parse_back() {
        assert_eq!(Channel::Consultation(7).name(), "consultation.7");
        assert_eq!(Channel::Typing(7).name(), "typing.consultation.7");
        assert_eq!(Channel::parse("consultation.7"), Some(Channel::Consultation(7)));
        assert_eq!(Channel::parse("private-typing.consultation.9"), Some(Channel::Typing(9)));
        assert_eq!(Channel::parse("consultation.x"), None);
        assert_eq!(Channel::parse("orders.7"), None);
        assert_eq!(Channel::Typing(3).consultation_id(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = Broadcaster::new();
        let mut rx = hub.subscribe(&Channel::Consultation(5));
        hub.publish(ConsultationEvent::NewConsultationMessage { message: message(5) });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.channel, "consultation.5");
        assert_eq!(envelope.event, "NewConsultationMessage");
        assert_eq!(envelope.data["message"]["message"], "hello");
    }

    #[tokio::test]
    async fn typing_goes_to_its_own_channel() {
        let hub = Broadcaster::new();
        let mut messages = hub.subscribe(&Channel::Consultation(5));
        let mut typing = hub.subscribe(&Channel::Typing(5));
        hub.publish(ConsultationEvent::TypingIndicator {
            consultation_id: 5,
            user_id: 2,
        });

        let envelope = typing.recv().await.unwrap();
        assert_eq!(envelope.event, "TypingIndicator");
        assert_eq!(envelope.data, json!({ "consultation_id": 5, "user_id": 2 }));
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let hub = Broadcaster::new();
        hub.publish(ConsultationEvent::NewConsultationMessage { message: message(1) });
        assert_eq!(hub.subscriber_count(&Channel::Consultation(1)), 0);

        let rx = hub.subscribe(&Channel::Consultation(1));
        drop(rx);
        hub.publish(ConsultationEvent::NewConsultationMessage { message: message(1) });
        assert_eq!(hub.subscriber_count(&Channel::Consultation(1)), 0);
    }

    #[test]
    fn abandoned_channels_are_dropped_on_next_subscribe() {
        let hub = Broadcaster::new();
        drop(hub.subscribe(&Channel::Consultation(1)));
        let _typing = hub.subscribe(&Channel::Typing(2));
        let _live = hub.subscribe(&Channel::Consultation(3));

        let channels = hub.channels.lock().unwrap();
        assert!(!channels.contains_key("consultation.1"));
        assert!(channels.contains_key("typing.consultation.2"));
        assert_eq!(channels.len(), 2);
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let hub = Broadcaster::new();
        let _early = hub.subscribe(&Channel::Consultation(4));
        hub.publish(ConsultationEvent::NewConsultationMessage { message: message(4) });
        let mut late = hub.subscribe(&Channel::Consultation(4));
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagging_stream_skips_to_newest() {
        let hub = Broadcaster {
            capacity: 2,
            ..Broadcaster::new()
        };
        let rx = hub.subscribe(&Channel::Typing(1));
        for user_id in 1..=5 {
            hub.publish(ConsultationEvent::TypingIndicator {
                consultation_id: 1,
                user_id,
            });
        }
        let mut stream = Box::pin(envelope_stream(rx));
        let first = stream.next().await.unwrap();
        assert_eq!(first.data["user_id"], 4);
    }
}

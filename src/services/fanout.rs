use async_trait::async_trait;
use futures_util::{stream::select_all, Stream};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};

use crate::{
    constants::{TOPIC_MATCH_SETTLED, TOPIC_STAKE_CONFIRMED},
    error::Result,
};

pub const ALL_TOPICS: [&str; 2] = [TOPIC_MATCH_SETTLED, TOPIC_STAKE_CONFIRMED];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    MatchSettled {
        match_id: String,
        winner: Option<String>,
    },
    StakeConfirmed {
        match_id: String,
        staker: String,
        amount: i64,
    },
}

impl DomainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::MatchSettled { .. } => TOPIC_MATCH_SETTLED,
            Self::StakeConfirmed { .. } => TOPIC_STAKE_CONFIRMED,
        }
    }

    pub fn match_id(&self) -> &str {
        match self {
            Self::MatchSettled { match_id, .. } | Self::StakeConfirmed { match_id, .. } => match_id,
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = DomainEvent> + Send>>;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns how many live subscribers received the event.
    async fn publish(&self, event: DomainEvent) -> Result<usize>;
}

/// In-process topic broadcaster. Delivery is best-effort: no persistence, no
/// replay, and a subscriber that falls behind skips the events it missed.
#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    topics: Arc<RwLock<HashMap<&'static str, broadcast::Sender<DomainEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn sender(&self, topic: &'static str) -> broadcast::Sender<DomainEvent> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Events published on `topic` from now on.
    pub async fn subscribe(&self, topic: &'static str) -> EventStream {
        let rx = self.sender(topic).await.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!("Subscriber on {} lagged, skipped {} events", topic, skipped);
                None
            }
        }))
    }

    pub async fn subscribe_all(&self) -> EventStream {
        let mut streams = Vec::with_capacity(ALL_TOPICS.len());
        for topic in ALL_TOPICS {
            streams.push(self.subscribe(topic).await);
        }
        Box::pin(select_all(streams))
    }

    pub async fn subscriber_count(&self, topic: &'static str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: DomainEvent) -> Result<usize> {
        let topic = event.topic();
        let sender = self.sender(topic).await;
        // Sending with no subscribers is not an error, the event just has no audience.
        let delivered = sender.send(event).unwrap_or(0);
        tracing::debug!("Published {} to {} subscribers", topic, delivered);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settled(match_id: &str) -> DomainEvent {
        DomainEvent::MatchSettled {
            match_id: match_id.to_string(),
            winner: Some("p1".to_string()),
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_their_topic() {
        let bus = EventBus::new(8);
        let mut settled_rx = bus.subscribe(TOPIC_MATCH_SETTLED).await;
        let mut stake_rx = bus.subscribe(TOPIC_STAKE_CONFIRMED).await;

        bus.publish(settled("m1")).await.unwrap();
        bus.publish(DomainEvent::StakeConfirmed {
            match_id: "m1".to_string(),
            staker: "p2".to_string(),
            amount: 10,
        })
        .await
        .unwrap();

        assert_eq!(settled_rx.next().await, Some(settled("m1")));
        let stake = stake_rx.next().await.unwrap();
        assert_eq!(stake.topic(), TOPIC_STAKE_CONFIRMED);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(settled("m1")).await.unwrap(), 0);

        let mut rx = bus.subscribe(TOPIC_MATCH_SETTLED).await;
        bus.publish(settled("m2")).await.unwrap();
        assert_eq!(rx.next().await.map(|e| e.match_id().to_string()), Some("m2".to_string()));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe(TOPIC_MATCH_SETTLED).await;
        for id in ["m1", "m2", "m3", "m4"] {
            bus.publish(settled(id)).await.unwrap();
        }
        let first = rx.next().await.unwrap();
        assert_eq!(first.match_id(), "m3");
    }

    #[tokio::test]
    async fn subscribe_all_merges_topics() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_all().await;
        assert_eq!(bus.subscriber_count(TOPIC_MATCH_SETTLED).await, 1);
        bus.publish(settled("m1")).await.unwrap();
        assert_eq!(rx.next().await, Some(settled("m1")));
    }

    #[test]
    fn event_json_is_tagged() {
        let json = serde_json::to_value(settled("m1")).unwrap();
        assert_eq!(json["type"], "match_settled");
        assert_eq!(json["match_id"], "m1");
    }
}

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, timeout, Duration};

use crate::{
    api::AppState,
    constants::{WS_CLIENT_TIMEOUT_SECS, WS_HEARTBEAT_INTERVAL_SECS},
    services::fanout::{DomainEvent, EventBus, ALL_TOPICS},
};

/// Optional narrowing of the event stream, from the query string.
#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub topic: Option<String>,
    pub match_id: Option<String>,
}

impl EventFilter {
    fn topic(&self) -> Option<&'static str> {
        let requested = self.topic.as_deref()?;
        ALL_TOPICS.into_iter().find(|topic| *topic == requested)
    }

    fn wants(&self, event: &DomainEvent) -> bool {
        self.match_id
            .as_deref()
            .map_or(true, |match_id| event.match_id() == match_id)
    }
}

fn connected_payload(filter: &EventFilter) -> String {
    serde_json::json!({
        "type": "connected",
        "topics": match filter.topic() {
            Some(topic) => vec![topic],
            None => ALL_TOPICS.to_vec(),
        },
        "match_id": filter.match_id,
    })
    .to_string()
}

/// WebSocket handler streaming settlement events
pub async fn handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<EventFilter>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state, filter))
}

async fn handle_socket(socket: WebSocket, state: AppState, filter: EventFilter) {
    let (sender, receiver) = socket.split();
    serve_events(sender, receiver, &state.events, filter).await;
}

async fn serve_events<S, R, E>(mut sender: S, mut receiver: R, bus: &EventBus, filter: EventFilter)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let mut events = match filter.topic() {
        Some(topic) => bus.subscribe(topic).await,
        None => bus.subscribe_all().await,
    };

    if sender
        .send(Message::Text(connected_payload(&filter).into()))
        .await
        .is_err()
    {
        tracing::debug!("WebSocket client left before the connected message");
        return;
    }

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                next = events.next() => {
                    let Some(event) = next else { break };
                    if !filter.wants(&event) {
                        continue;
                    }
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to encode {}: {}", event.topic(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        loop {
            let next_msg =
                timeout(Duration::from_secs(WS_CLIENT_TIMEOUT_SECS), receiver.next()).await;
            let msg = match next_msg {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    tracing::info!("Event stream client timed out");
                    break;
                }
            };

            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("Event stream connection closed");
}

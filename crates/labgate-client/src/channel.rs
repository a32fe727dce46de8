//! Push event channel over the Pusher protocol (as spoken by Laravel Reverb).

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use labgate_core::events::{PushEventKind, canonical_event_name};

use crate::config::ChannelConfig;

/// Pusher protocol revision spoken by this client.
pub const PROTOCOL_VERSION: u8 = 7;

/// What the channel delivers to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// A session is established and subscribed. Sent again after every
    /// reconnect; pushes missed while disconnected are not replayed.
    Connected { socket_id: String },
    /// A subscribed event. `name` is as broadcast, namespace included.
    Event { name: String, payload: Value },
    Disconnected { reason: String },
}

/// Source of push events.
pub trait EventChannel {
    /// Subscribe to `events` on `channel`. An empty `events` list forwards
    /// every event. The subscription ends when the receiver is dropped.
    fn subscribe(&self, channel: &str, events: &[String])
    -> mpsc::UnboundedReceiver<ChannelMessage>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("no pong within the keepalive window")]
    KeepaliveTimeout,

    #[error("server error {code:?}: {message}")]
    Server { code: Option<u64>, message: String },
}

impl From<tungstenite::Error> for ChannelError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    ConnectionEstablished {
        socket_id: String,
        activity_timeout: Option<u64>,
    },
    SubscriptionSucceeded {
        channel: String,
    },
    Ping,
    Pong,
    Error {
        code: Option<u64>,
        message: String,
    },
    Event {
        channel: Option<String>,
        name: String,
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame. `data` may arrive JSON-encoded inside a string or
/// as a plain object; both decode to the same value.
pub(crate) fn decode_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let data = match raw.data {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    };

    Ok(match raw.event.as_str() {
        "pusher:connection_established" => Frame::ConnectionEstablished {
            socket_id: data
                .get("socket_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            activity_timeout: data.get("activity_timeout").and_then(Value::as_u64),
        },
        "pusher_internal:subscription_succeeded" => Frame::SubscriptionSucceeded {
            channel: raw.channel.unwrap_or_default(),
        },
        "pusher:ping" => Frame::Ping,
        "pusher:pong" => Frame::Pong,
        "pusher:error" => Frame::Error {
            code: data.get("code").and_then(Value::as_u64),
            message: data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        },
        _ => Frame::Event {
            channel: raw.channel,
            name: raw.event,
            data,
        },
    })
}

fn encode(event: &str, data: Value) -> Message {
    Message::Text(json!({ "event": event, "data": data }).to_string().into())
}

/// [`EventChannel`] over a Reverb / Pusher websocket with automatic
/// reconnect.
#[derive(Debug, Clone)]
pub struct ReverbChannel {
    config: ChannelConfig,
}

impl ReverbChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }

    /// Connection URL for the configured app key.
    pub fn connect_url(&self) -> String {
        format!(
            "{}/app/{}?protocol={PROTOCOL_VERSION}&client=labgate&version={}&flash=false",
            self.config.url.trim_end_matches('/'),
            self.config.app_key,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

impl EventChannel for ReverbChannel {
    /// Spawns the connection task on the current runtime.
    fn subscribe(
        &self,
        channel: &str,
        events: &[String],
    ) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            url: self.connect_url(),
            channel: channel.to_string(),
            events: events
                .iter()
                .map(|e| canonical_event_name(e).to_string())
                .collect(),
            ping_interval: Duration::from_secs(self.config.ping_interval_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.config.reconnect_delay_secs),
        };
        tokio::spawn(session.run(tx));
        rx
    }
}

enum SessionEnd {
    /// The subscriber dropped its receiver.
    ReceiverGone,
    Closed,
}

struct Session {
    url: String,
    channel: String,
    events: Vec<String>,
    ping_interval: Duration,
    reconnect_delay: Duration,
}

impl Session {
    async fn run(self, tx: mpsc::UnboundedSender<ChannelMessage>) {
        loop {
            let reason = match self.connect_once(&tx).await {
                Ok(SessionEnd::ReceiverGone) => {
                    tracing::debug!(channel = %self.channel, "Event channel subscriber gone");
                    return;
                },
                Ok(SessionEnd::Closed) => "closed by server".to_string(),
                Err(e) => {
                    tracing::warn!(channel = %self.channel, error = %e, "Event channel session failed");
                    e.to_string()
                },
            };
            if tx.send(ChannelMessage::Disconnected { reason }).is_err() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {},
                _ = tx.closed() => return,
            }
            tracing::info!(url = %self.url, "Reconnecting event channel");
        }
    }

    /// Configured names match by canonical name, or by event kind so that
    /// `ComputerLocked` and `computer.locked` are the same event.
    fn wants(&self, name: &str) -> bool {
        if self.events.is_empty() {
            return true;
        }
        let name = canonical_event_name(name);
        let kind = PushEventKind::from_event_name(name);
        self.events
            .iter()
            .any(|e| e == name || kind.is_some_and(|k| PushEventKind::from_event_name(e) == Some(k)))
    }

    async fn connect_once(
        &self,
        tx: &mpsc::UnboundedSender<ChannelMessage>,
    ) -> Result<SessionEnd, ChannelError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let mut period = self.ping_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let text = match msg {
                        None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                    };
                    // Any traffic counts as liveness
                    awaiting_pong = false;

                    let frame = match decode_frame(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "Undecodable event channel frame");
                            continue;
                        },
                    };
                    match frame {
                        Frame::ConnectionEstablished { socket_id, activity_timeout } => {
                            if let Some(secs) = activity_timeout.filter(|s| *s > 0) {
                                period = Duration::from_secs(secs).min(self.ping_interval);
                                keepalive = tokio::time::interval_at(Instant::now() + period, period);
                                keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            }
                            sink.send(encode("pusher:subscribe", json!({ "channel": self.channel })))
                                .await?;
                            tracing::info!(%socket_id, channel = %self.channel, "Event channel connected");
                            if tx.send(ChannelMessage::Connected { socket_id }).is_err() {
                                return Ok(SessionEnd::ReceiverGone);
                            }
                        },
                        Frame::SubscriptionSucceeded { channel } => {
                            tracing::debug!(%channel, "Subscription confirmed");
                        },
                        Frame::Ping => {
                            sink.send(encode("pusher:pong", json!({}))).await?;
                        },
                        Frame::Pong => {},
                        Frame::Error { code, message } => {
                            // 4000-4099 close the session
                            tracing::warn!(?code, %message, "Event channel server error");
                            if code.is_some_and(|c| (4000..4100).contains(&c)) {
                                return Err(ChannelError::Server { code, message });
                            }
                        },
                        Frame::Event { channel, name, data } => {
                            if channel.as_deref().is_some_and(|c| c != self.channel) || !self.wants(&name) {
                                continue;
                            }
                            let msg = ChannelMessage::Event { name, payload: data };
                            if tx.send(msg).is_err() {
                                return Ok(SessionEnd::ReceiverGone);
                            }
                        },
                    }
                },
                _ = keepalive.tick() => {
                    if awaiting_pong {
                        return Err(ChannelError::KeepaliveTimeout);
                    }
                    sink.send(encode("pusher:ping", json!({}))).await?;
                    awaiting_pong = true;
                },
                _ = tx.closed() => return Ok(SessionEnd::ReceiverGone),
            }
        }
    }
}

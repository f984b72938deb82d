//! Ledger event subscription over websocket with auto-reconnection
//!
//! Subscribes to the node's position event feed filtered by owner. The
//! connection task reconnects with exponential backoff and re-subscribes
//! after every reconnect; consumers only see a broadcast stream of
//! [`LedgerEvent`]s.

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::types::normalize_owner;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("listener is shut down")]
    ChannelSend,
}

/// Event classes emitted by the auction contract, filtered by owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    PositionCreated { owner: String, position_id: u64 },
    PositionClosed { owner: String, position_id: u64 },
}

impl LedgerEvent {
    pub fn owner(&self) -> &str {
        match self {
            LedgerEvent::PositionCreated { owner, .. } => owner,
            LedgerEvent::PositionClosed { owner, .. } => owner,
        }
    }

    pub fn position_id(&self) -> u64 {
        match self {
            LedgerEvent::PositionCreated { position_id, .. } => *position_id,
            LedgerEvent::PositionClosed { position_id, .. } => *position_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    action: &'static str,
    owner: &'a str,
}

#[derive(Debug)]
enum ListenerCommand {
    Disconnect,
}

/// Websocket subscription to one owner's position events.
pub struct EventListener {
    command_tx: mpsc::UnboundedSender<ListenerCommand>,
    event_tx: broadcast::Sender<LedgerEvent>,
}

impl EventListener {
    /// Connect to `ws_url` and stream events for `owner`.
    ///
    /// The connection task runs until [`EventListener::disconnect`] is
    /// called or every receiver (and the listener) is dropped.
    pub fn start(ws_url: String, owner: &str) -> Result<Self, EventError> {
        url::Url::parse(&ws_url)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let owner = normalize_owner(owner);

        let task_tx = event_tx.clone();
        tokio::spawn(async move {
            Self::connection_task(ws_url, owner, command_rx, task_tx).await;
        });

        Ok(Self {
            command_tx,
            event_tx,
        })
    }

    /// New receiver on the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the connection task deterministically.
    pub fn disconnect(&self) -> Result<(), EventError> {
        self.command_tx
            .send(ListenerCommand::Disconnect)
            .map_err(|_| EventError::ChannelSend)
    }

    async fn connection_task(
        url: String,
        owner: String,
        mut command_rx: mpsc::UnboundedReceiver<ListenerCommand>,
        event_tx: broadcast::Sender<LedgerEvent>,
    ) {
        let mut backoff = reconnect_backoff();

        loop {
            match connect_async(&url).await {
                Ok((mut stream, _)) => {
                    info!("event feed connected for {}", owner);
                    backoff.reset();

                    let subscribe = SubscribeMessage {
                        action: "subscribe",
                        owner: &owner,
                    };
                    let payload = match serde_json::to_string(&subscribe) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("failed to encode subscribe message: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = stream.send(Message::Text(payload.into())).await {
                        warn!("failed to send subscription: {}", e);
                        continue;
                    }

                    loop {
                        tokio::select! {
                            command = command_rx.recv() => {
                                match command {
                                    Some(ListenerCommand::Disconnect) | None => {
                                        debug!("event listener for {} disconnecting", owner);
                                        let _ = stream.close(None).await;
                                        return;
                                    }
                                }
                            }
                            message = stream.next() => {
                                match message {
                                    Some(Ok(Message::Text(text))) => {
                                        Self::handle_text(&text, &owner, &event_tx);
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        let _ = stream.send(Message::Pong(data)).await;
                                    }
                                    Some(Ok(Message::Close(_))) | None => {
                                        warn!("event feed closed, reconnecting");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!("event feed error: {}, reconnecting", e);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("event feed connect failed: {}", e);
                }
            }

            // Drain a disconnect that raced the drop of the connection.
            if let Ok(ListenerCommand::Disconnect) = command_rx.try_recv() {
                return;
            }
            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
            debug!("reconnecting event feed in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    fn handle_text(text: &str, owner: &str, event_tx: &broadcast::Sender<LedgerEvent>) {
        match serde_json::from_str::<LedgerEvent>(text) {
            Ok(event) => {
                // The feed is owner-filtered server side, but never trust
                // the filter across reconnects.
                if normalize_owner(event.owner()) != owner {
                    debug!("dropping event for foreign owner {}", event.owner());
                    return;
                }
                debug!("ledger event: {:?}", event);
                let _ = event_tx.send(event);
            }
            Err(e) => {
                debug!("ignoring unparseable event frame: {} ({})", text, e);
            }
        }
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None, // retry forever
        ..Default::default()
    }
}

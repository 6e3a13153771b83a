//! Realtime push channel
//!
//! Keeps a websocket to the push endpoint open for as long as the engine
//! runs. The connection moves through `Connecting -> Connected ->
//! Disconnected` and reconnects with exponential backoff; it only stops on
//! shutdown. Server `PING`s are answered here, everything else is handed
//! to the owner as [`ChannelEvent::Message`].

use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::message::{Envelope, RealtimeEvent};
use crate::config::Config;

/// Give up on a connection attempt after this long
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands sent to the channel task
#[derive(Debug, Clone)]
pub enum ChannelCommand {
    /// Send an envelope to the server
    Send(Envelope),
    /// Close the connection and stop reconnecting
    Shutdown,
}

/// Events emitted by the channel task
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StatusChanged(ConnectionStatus),
    /// A push envelope from the server
    Message(Envelope),
    Error(String),
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Handle to control the channel task
pub struct ChannelHandle {
    pub command_tx: mpsc::Sender<ChannelCommand>,
    pub event_rx: mpsc::Receiver<ChannelEvent>,
    pub status_rx: watch::Receiver<ConnectionStatus>,
}

/// Configuration for the channel task
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    /// Channel settings from the app config, if a realtime URL is set
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.realtime_url.as_ref()?;
        Some(Self {
            url: url.clone(),
            initial_reconnect_delay: config.reconnect_initial(),
            max_reconnect_delay: config.reconnect_max(),
        })
    }
}

/// Next reconnect delay: doubled, capped at `max`
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Spawn the channel task
pub fn spawn_channel(config: ChannelConfig) -> ChannelHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

    tokio::spawn(channel_loop(config, command_rx, event_tx, status_tx));

    ChannelHandle {
        command_tx,
        event_rx,
        status_rx,
    }
}

async fn set_status(
    status: ConnectionStatus,
    event_tx: &mpsc::Sender<ChannelEvent>,
    status_tx: &watch::Sender<ConnectionStatus>,
) {
    let _ = status_tx.send(status);
    let _ = event_tx.send(ChannelEvent::StatusChanged(status)).await;
}

/// Main loop with reconnection
async fn channel_loop(
    config: ChannelConfig,
    mut command_rx: mpsc::Receiver<ChannelCommand>,
    event_tx: mpsc::Sender<ChannelEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        set_status(ConnectionStatus::Connecting, &event_tx, &status_tx).await;

        match connect_and_listen(&config, &mut command_rx, &event_tx, &status_tx).await {
            Ok(true) => {
                set_status(ConnectionStatus::Disconnected, &event_tx, &status_tx).await;
                break;
            }
            Ok(false) => {
                // Connection was up; start the backoff over
                reconnect_delay = config.initial_reconnect_delay;
            }
            Err(e) => {
                debug!("Realtime connection error: {}", e);
                let _ = event_tx
                    .send(ChannelEvent::Error(format!("Connection error: {}", e)))
                    .await;
            }
        }

        set_status(ConnectionStatus::Disconnected, &event_tx, &status_tx).await;

        if wait_for_reconnect(reconnect_delay, &mut command_rx).await {
            break;
        }
        reconnect_delay = next_delay(reconnect_delay, config.max_reconnect_delay);
    }

    info!("Realtime channel stopped");
}

/// Sleep out the backoff; returns true if shutdown was requested meanwhile
///
/// Replies only make sense on the connection that prompted them, so
/// outgoing messages that arrive now are dropped.
async fn wait_for_reconnect(
    delay: Duration,
    command_rx: &mut mpsc::Receiver<ChannelCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = command_rx.recv() => match cmd {
                Some(ChannelCommand::Shutdown) | None => return true,
                Some(ChannelCommand::Send(envelope)) => {
                    warn!(kind = %envelope.kind, "Dropping outgoing message while disconnected");
                }
            },
        }
    }
}

/// Connect and relay messages until disconnection (false) or shutdown (true)
async fn connect_and_listen(
    config: &ChannelConfig,
    command_rx: &mut mpsc::Receiver<ChannelCommand>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    status_tx: &watch::Sender<ConnectionStatus>,
) -> Result<bool> {
    let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&config.url))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", config.url))??;
    let (mut write, mut read) = ws_stream.split();

    info!(url = %config.url, "Realtime channel connected");
    set_status(ConnectionStatus::Connected, event_tx, status_tx).await;

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(ChannelCommand::Send(envelope)) => {
                        write.send(Message::Text(envelope.encode())).await?;
                    }
                    Some(ChannelCommand::Shutdown) | None => {
                        write.close().await.ok();
                        return Ok(true);
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match Envelope::decode(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("Dropping realtime message: {}", e);
                                continue;
                            }
                        };
                        if matches!(envelope.event(), Ok(RealtimeEvent::Ping)) {
                            write.send(Message::Text(Envelope::pong().encode())).await?;
                            continue;
                        }
                        let _ = event_tx.send(ChannelEvent::Message(envelope)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(false);
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
        }
    }
}

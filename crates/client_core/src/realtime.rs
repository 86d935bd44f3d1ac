//! Per-conversation realtime channel.
//!
//! The channel runs as a background task driving a small state machine:
//! `Connecting -> Open -> Closed { retryable: true } -> Connecting ...` until
//! its owner tears it down, which leaves it in `Closed { retryable: false }`.
//! Inbound frames go straight into the [`SyncEngine`]; channel failures never
//! surface as errors, only as state transitions.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, Credential},
    protocol::{ClientFrame, NewAttachment, ServerFrame},
};
use storage::CredentialStore;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
    sync::SyncEngine,
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// `retryable: false` is terminal and only reached through teardown.
    Closed { retryable: bool },
}

/// Reconnect delay schedule: `min(base * 2^retries, cap)`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    retries: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            retries: 0,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.reconnect_base_ms),
            Duration::from_millis(settings.reconnect_cap_ms),
        )
    }

    /// Delay before the next attempt; bumps the retry counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.retries).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.retries = self.retries.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retry_count(&self) -> u32 {
        self.retries
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Closed,
}

/// A live connection: a stream of inbound frames and a sender for outbound
/// text frames. Dropping the sender closes the write half.
pub struct ChannelConnection {
    pub inbound: BoxStream<'static, ClientResult<InboundFrame>>,
    pub outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> ClientResult<ChannelConnection>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl ChannelConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> ClientResult<ChannelConnection> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Channel(format!("failed to connect websocket: {err}")))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(WsMessage::Text(text)).await {
                    debug!("realtime: write half closed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let inbound = ws_reader
            .filter_map(|msg| async move {
                match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                    Ok(WsMessage::Close(_)) => Some(Ok(InboundFrame::Closed)),
                    Ok(_) => None,
                    Err(err) => Some(Err(ClientError::Channel(err.to_string()))),
                }
            })
            .boxed();

        Ok(ChannelConnection { inbound, outbound })
    }
}

/// `<ws_url>/conversation/<id>?token=<access token>`
pub fn stream_url(
    ws_url: &str,
    conversation_id: ConversationId,
    credential: &Credential,
) -> ClientResult<Url> {
    let mut url = Url::parse(&format!(
        "{}/conversation/{conversation_id}",
        ws_url.trim_end_matches('/')
    ))?;
    url.query_pairs_mut()
        .append_pair("token", &credential.access_token);
    Ok(url)
}

pub struct ChannelDeps {
    pub ws_url: String,
    pub connector: Arc<dyn ChannelConnector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub sync: Arc<SyncEngine>,
    pub backoff: ReconnectBackoff,
    pub events: broadcast::Sender<ClientEvent>,
}

type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

pub struct RealtimeChannel {
    conversation_id: ConversationId,
    state: watch::Receiver<ChannelState>,
    outbound: OutboundSlot,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    /// Starts connecting immediately. Must be called inside a tokio runtime.
    pub fn open(conversation_id: ConversationId, deps: ChannelDeps) -> Self {
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let outbound: OutboundSlot = Arc::new(Mutex::new(None));

        let driver = ChannelDriver {
            conversation_id,
            deps,
            state: state_tx,
            outbound: Arc::clone(&outbound),
            shutdown: shutdown_rx,
        };
        let _ = driver.deps.events.send(ClientEvent::ChannelStateChanged {
            conversation_id,
            state: ChannelState::Connecting,
        });
        let task = tokio::spawn(driver.run());

        Self {
            conversation_id,
            state,
            outbound,
            shutdown,
            task: Some(task),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Best effort. Returns `false` without queueing anything when the
    /// channel is not open.
    pub fn send_message(&self, content: &str, attachments: Vec<NewAttachment>) -> bool {
        if self.state() != ChannelState::Open {
            debug!(
                conversation_id = %self.conversation_id,
                "realtime: send ignored; channel not open"
            );
            return false;
        }
        let frame = ClientFrame::SendMessage {
            content: content.to_string(),
            attachments,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!("realtime: failed to encode outbound frame: {err}");
                return false;
            }
        };
        let slot = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    /// Explicit teardown. Cancels any pending reconnect timer and waits for
    /// the driver to settle in `Closed { retryable: false }`.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(
                    conversation_id = %self.conversation_id,
                    "realtime: channel task ended abnormally: {err}"
                );
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

struct ChannelDriver {
    conversation_id: ConversationId,
    deps: ChannelDeps,
    state: watch::Sender<ChannelState>,
    outbound: OutboundSlot,
    shutdown: watch::Receiver<bool>,
}

impl ChannelDriver {
    async fn run(mut self) {
        let conversation_id = self.conversation_id;
        loop {
            let stopping = *self.shutdown.borrow();
            if stopping {
                break;
            }
            self.set_state(ChannelState::Connecting);

            let Some(credential) = self.deps.credentials.current() else {
                info!(%conversation_id, "realtime: no credential; channel stays closed");
                break;
            };
            let url = match stream_url(&self.deps.ws_url, conversation_id, &credential) {
                Ok(url) => url,
                Err(err) => {
                    warn!(%conversation_id, "realtime: cannot build stream url: {err}");
                    break;
                }
            };

            let connector = Arc::clone(&self.deps.connector);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                result = connector.connect(&url) => result,
            };

            match connected {
                Ok(connection) => {
                    self.deps.backoff.reset();
                    self.set_outbound(Some(connection.outbound));
                    self.set_state(ChannelState::Open);
                    info!(%conversation_id, "realtime: channel open");

                    let end = self.pump(connection.inbound).await;
                    self.set_outbound(None);
                    if matches!(end, SessionEnd::Shutdown) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%conversation_id, "realtime: connect failed: {err}");
                }
            }

            self.set_state(ChannelState::Closed { retryable: true });
            let delay = self.deps.backoff.next_delay();
            info!(
                %conversation_id,
                retry = self.deps.backoff.retry_count(),
                delay_ms = delay.as_millis() as u64,
                "realtime: reconnect scheduled"
            );
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_outbound(None);
        self.set_state(ChannelState::Closed { retryable: false });
        debug!(%conversation_id, "realtime: channel closed");
    }

    async fn pump(
        &mut self,
        mut inbound: BoxStream<'static, ClientResult<InboundFrame>>,
    ) -> SessionEnd {
        let conversation_id = self.conversation_id;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return SessionEnd::Shutdown,
                next = inbound.next() => next,
            };
            match next {
                Some(Ok(InboundFrame::Text(text))) => {
                    let frame = ServerFrame::decode(&text);
                    match &frame {
                        ServerFrame::Unknown => {
                            debug!(%conversation_id, "realtime: ignoring unrecognized frame");
                        }
                        ServerFrame::Connected { user_id, .. } => {
                            debug!(%conversation_id, %user_id, "realtime: server acknowledged");
                        }
                        _ => {}
                    }
                    self.deps.sync.apply_frame(conversation_id, frame).await;
                }
                Some(Ok(InboundFrame::Closed)) | None => {
                    info!(%conversation_id, "realtime: channel dropped by peer");
                    return SessionEnd::Dropped;
                }
                Some(Err(err)) => {
                    warn!(%conversation_id, "realtime: channel error: {err}");
                    return SessionEnd::Dropped;
                }
            }
        }
    }

    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            let _ = self.deps.events.send(ClientEvent::ChannelStateChanged {
                conversation_id: self.conversation_id,
                state: next,
            });
        }
    }

    fn set_outbound(&self, sender: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;

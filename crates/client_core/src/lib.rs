use std::sync::{Arc, Weak};

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, Credential, MessageId, UserId},
    protocol::{
        AuthResponse, BulkDeleteRequest, BulkDeleteResult, Conversation,
        CreateConversationRequest, CurrentUser, EditMessageRequest, Message, NewAttachment,
        RegisterRequest, UploadMeta,
    },
};
use storage::CredentialStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod cache;
pub mod config;
pub mod cookies;
pub mod error;
pub mod realtime;
pub mod sync;
pub mod transport;

pub use cache::{MergeOutcome, PageCursor, PageMerge};
pub use config::{load_settings, ClientSettings};
pub use cookies::SessionCookieJar;
pub use error::{ClientError, ClientResult};
pub use realtime::{
    ChannelConnector, ChannelState, RealtimeChannel, ReconnectBackoff, TungsteniteConnector,
};
pub use sync::SyncEngine;
pub use transport::{
    ApiRequest, ApiResponse, AuthenticatedClient, HttpExchange, ReqwestExchange, UploadFile,
};

use realtime::ChannelDeps;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The cached timeline of a conversation changed.
    HistoryChanged { conversation_id: ConversationId },
    ChannelStateChanged {
        conversation_id: ConversationId,
        state: ChannelState,
    },
    /// Credential refresh failed; the owner should tear the session down.
    /// Fired once per failed refresh, not once per suspended request.
    SessionExpired,
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> ClientResult<Credential>;
    async fn register(&self, request: RegisterRequest) -> ClientResult<Credential>;
    async fn logout(&self) -> ClientResult<()>;
    async fn me(&self) -> ClientResult<CurrentUser>;
    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>>;
    async fn create_conversation(&self, partner_id: UserId) -> ClientResult<Conversation>;
    async fn open_conversation(&self, conversation_id: ConversationId) -> ClientResult<()>;
    async fn close_conversation(&self);
    async fn active_conversation(&self) -> Option<(ConversationId, ChannelState)>;
    async fn load_latest(&self, conversation_id: ConversationId) -> ClientResult<PageMerge>;
    async fn load_older(&self, conversation_id: ConversationId) -> ClientResult<PageMerge>;
    async fn load_newer(&self, conversation_id: ConversationId) -> ClientResult<PageMerge>;
    async fn edit_message(&self, message_id: MessageId, content: &str) -> ClientResult<Message>;
    async fn delete_messages(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> ClientResult<BulkDeleteResult>;
    async fn upload_files(
        &self,
        conversation_id: Option<ConversationId>,
        files: Vec<UploadFile>,
    ) -> ClientResult<Vec<UploadMeta>>;
    async fn send_message(&self, content: &str, attachments: Vec<NewAttachment>) -> bool;
    async fn timeline(&self, conversation_id: ConversationId) -> Vec<Message>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct ChatClient {
    settings: ClientSettings,
    transport: AuthenticatedClient,
    credentials: Arc<dyn CredentialStore>,
    sync: Arc<SyncEngine>,
    connector: Arc<dyn ChannelConnector>,
    active_channel: Mutex<Option<RealtimeChannel>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        settings: ClientSettings,
        credentials: Arc<dyn CredentialStore>,
    ) -> ClientResult<Arc<Self>> {
        let exchange = Arc::new(ReqwestExchange::new(
            settings.api_url.clone(),
            Arc::clone(&credentials),
        )?);
        Ok(Self::new_with_dependencies(
            settings,
            credentials,
            exchange,
            Arc::new(TungsteniteConnector),
        ))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        credentials: Arc<dyn CredentialStore>,
        exchange: Arc<dyn HttpExchange>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            transport: AuthenticatedClient::new(exchange, Arc::clone(&credentials), events.clone()),
            sync: Arc::new(SyncEngine::new(events.clone())),
            settings,
            credentials,
            connector,
            active_channel: Mutex::new(None),
            events,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn transport(&self) -> &AuthenticatedClient {
        &self.transport
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credentials.current()
    }

    /// Coordinated teardown for logout and session expiry: stop the live
    /// channel first so it cannot reconnect with a stale credential, then
    /// drop every cached conversation and the credential itself.
    pub async fn teardown_session(&self) {
        let channel = self.active_channel.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.sync.clear_all().await;
        if let Err(err) = self.credentials.clear().await {
            warn!("client: failed to clear stored credential: {err:#}");
        }
        info!("client: session torn down");
    }

    async fn store_credential(&self, credential: AuthResponse) -> ClientResult<Credential> {
        if credential.access_token.trim().is_empty() {
            return Err(ClientError::Http {
                status: reqwest::StatusCode::BAD_GATEWAY,
                detail: "auth response carried no access_token".into(),
            });
        }
        self.credentials
            .save(&credential)
            .await
            .map_err(ClientError::Storage)?;
        Ok(credential)
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        cursor: PageCursor,
    ) -> ClientResult<PageMerge> {
        let (before_id, after_id) = match cursor {
            PageCursor::Latest => (None, None),
            PageCursor::Before(id) => (Some(id), None),
            PageCursor::After(id) => (None, Some(id)),
        };
        let request = ApiRequest::get(format!("/conversations/{conversation_id}/messages"))
            .query("limit", self.settings.clamped_page_size())
            .query_opt("before_id", before_id)
            .query_opt("after_id", after_id);
        let page: Vec<Message> = self.transport.send_json(request).await?;
        Ok(self.sync.merge_page(conversation_id, cursor, page).await)
    }

    /// Pages forward from the newest held message until the server returns a
    /// short page. Returns how many messages were inserted.
    pub async fn catch_up(&self, conversation_id: ConversationId) -> ClientResult<usize> {
        let page_size = self.settings.clamped_page_size() as usize;
        let mut inserted = 0;
        while let Some(newest) = self.sync.newest_id(conversation_id).await {
            let merge = self
                .fetch_page(conversation_id, PageCursor::After(newest))
                .await?;
            inserted += merge.inserted;
            if merge.inserted == 0 || merge.received < page_size {
                break;
            }
        }
        Ok(inserted)
    }

    fn check_upload_sizes(&self, files: &[UploadFile]) -> ClientResult<()> {
        let limit_bytes = self.settings.max_upload_bytes;
        match files.iter().find(|file| file.size_bytes() > limit_bytes) {
            Some(file) => Err(ClientError::UploadTooLarge {
                file_name: file.file_name.clone(),
                size_bytes: file.size_bytes(),
                limit_bytes,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn login(&self, username: &str, password: &str) -> ClientResult<Credential> {
        let request =
            ApiRequest::post("/auth/login").form(&[("username", username), ("password", password)]);
        let credential: AuthResponse = self.transport.send_unauthenticated(request).await?.json()?;
        let credential = self.store_credential(credential).await?;
        info!(username, "client: logged in");
        Ok(credential)
    }

    async fn register(&self, request: RegisterRequest) -> ClientResult<Credential> {
        let username = request.username.clone();
        let request = ApiRequest::post("/auth/register").json(&request)?;
        let credential: AuthResponse = self.transport.send_unauthenticated(request).await?.json()?;
        let credential = self.store_credential(credential).await?;
        info!(username = %username, "client: registered");
        Ok(credential)
    }

    async fn logout(&self) -> ClientResult<()> {
        let result = self
            .transport
            .send_unauthenticated(ApiRequest::post("/auth/logout"))
            .await;
        if let Err(err) = &result {
            warn!("client: server-side logout failed: {err}");
        }
        self.teardown_session().await;
        result.map(|_| ())
    }

    async fn me(&self) -> ClientResult<CurrentUser> {
        self.transport.send_json(ApiRequest::get("/auth/me")).await
    }

    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        self.transport
            .send_json(ApiRequest::get("/conversations"))
            .await
    }

    async fn create_conversation(&self, partner_id: UserId) -> ClientResult<Conversation> {
        let request =
            ApiRequest::post("/conversations").json(&CreateConversationRequest { partner_id })?;
        self.transport.send_json(request).await
    }

    async fn open_conversation(&self, conversation_id: ConversationId) -> ClientResult<()> {
        if self.credentials.current().is_none() {
            return Err(ClientError::NotLoggedIn);
        }

        {
            let mut active = self.active_channel.lock().await;
            let reusable = active.as_ref().is_some_and(|channel| {
                channel.conversation_id() == conversation_id
                    && channel.state() != ChannelState::Closed { retryable: false }
            });
            if !reusable {
                if let Some(previous) = active.take() {
                    info!(
                        from = %previous.conversation_id(),
                        to = %conversation_id,
                        "client: switching conversation"
                    );
                    previous.close().await;
                }
                tokio::spawn(catch_up_on_reconnect(
                    Arc::downgrade(self),
                    conversation_id,
                    self.events.subscribe(),
                ));
                *active = Some(RealtimeChannel::open(
                    conversation_id,
                    ChannelDeps {
                        ws_url: self.settings.ws_url.clone(),
                        connector: Arc::clone(&self.connector),
                        credentials: Arc::clone(&self.credentials),
                        sync: Arc::clone(&self.sync),
                        backoff: ReconnectBackoff::from_settings(&self.settings),
                        events: self.events.clone(),
                    },
                ));
            }
        }

        if self.sync.has_history(conversation_id).await {
            self.catch_up(conversation_id).await?;
        } else {
            self.load_latest(conversation_id).await?;
        }
        Ok(())
    }

    async fn close_conversation(&self) {
        let channel = self.active_channel.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    async fn active_conversation(&self) -> Option<(ConversationId, ChannelState)> {
        self.active_channel
            .lock()
            .await
            .as_ref()
            .map(|channel| (channel.conversation_id(), channel.state()))
    }

    async fn load_latest(&self, conversation_id: ConversationId) -> ClientResult<PageMerge> {
        self.fetch_page(conversation_id, PageCursor::Latest).await
    }

    async fn load_older(&self, conversation_id: ConversationId) -> ClientResult<PageMerge> {
        if self.sync.is_fully_loaded(conversation_id).await {
            return Ok(PageMerge {
                received: 0,
                inserted: 0,
                reached_end: true,
            });
        }
        match self.sync.oldest_id(conversation_id).await {
            Some(oldest) => {
                self.fetch_page(conversation_id, PageCursor::Before(oldest))
                    .await
            }
            None => self.load_latest(conversation_id).await,
        }
    }

    async fn load_newer(&self, conversation_id: ConversationId) -> ClientResult<PageMerge> {
        match self.sync.newest_id(conversation_id).await {
            Some(newest) => {
                self.fetch_page(conversation_id, PageCursor::After(newest))
                    .await
            }
            None => self.load_latest(conversation_id).await,
        }
    }

    async fn edit_message(&self, message_id: MessageId, content: &str) -> ClientResult<Message> {
        let request = ApiRequest::patch(format!("/messages/{message_id}")).json(
            &EditMessageRequest {
                content: content.to_string(),
            },
        )?;
        let message: Message = self.transport.send_json(request).await?;
        self.sync
            .patch(message.conversation_id, message.clone())
            .await;
        Ok(message)
    }

    async fn delete_messages(
        &self,
        conversation_id: ConversationId,
        ids: &[MessageId],
    ) -> ClientResult<BulkDeleteResult> {
        let request = ApiRequest::delete("/messages/bulk").json(&BulkDeleteRequest {
            ids: ids.to_vec(),
        })?;
        let result: BulkDeleteResult = self.transport.send_json(request).await?;
        self.sync.apply_bulk_delete(conversation_id, &result).await;
        if result.is_partial() {
            warn!(
                %conversation_id,
                deleted = result.deleted.len(),
                forbidden = ?result.forbidden,
                not_found = ?result.not_found,
                "client: bulk delete partially applied"
            );
        }
        Ok(result)
    }

    async fn upload_files(
        &self,
        conversation_id: Option<ConversationId>,
        files: Vec<UploadFile>,
    ) -> ClientResult<Vec<UploadMeta>> {
        self.check_upload_sizes(&files)?;
        let request = ApiRequest::post("/upload")
            .query_opt("conversation_id", conversation_id)
            .multipart(files);
        self.transport.send_json(request).await
    }

    async fn send_message(&self, content: &str, attachments: Vec<NewAttachment>) -> bool {
        let active = self.active_channel.lock().await;
        match active.as_ref() {
            Some(channel) => channel.send_message(content, attachments),
            None => false,
        }
    }

    async fn timeline(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.sync.timeline(conversation_id).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// Fills the gap left by an outage each time the channel for
/// `conversation_id` comes back after a retryable close. Ends with the
/// channel or the client.
async fn catch_up_on_reconnect(
    client: Weak<ChatClient>,
    conversation_id: ConversationId,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    let mut dropped = false;
    loop {
        let state = match events.recv().await {
            Ok(ClientEvent::ChannelStateChanged {
                conversation_id: id,
                state,
            }) if id == conversation_id => state,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match state {
            ChannelState::Closed { retryable: false } => break,
            ChannelState::Closed { retryable: true } => dropped = true,
            ChannelState::Open if dropped => {
                dropped = false;
                let Some(client) = client.upgrade() else {
                    break;
                };
                match client.catch_up(conversation_id).await {
                    Ok(inserted) => {
                        debug!(%conversation_id, inserted, "client: caught up after reconnect");
                    }
                    Err(err) => {
                        warn!(%conversation_id, "client: catch-up after reconnect failed: {err}");
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

//! Authenticated request channel.
//!
//! Every outbound call carries the current bearer credential. A 401 triggers
//! at most one refresh at a time: the first failing request performs it,
//! later ones are parked in a FIFO queue and replayed with the refreshed
//! credential once it lands. Each request is retried at most once.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::future::{join, join_all};
use reqwest::{
    header::AUTHORIZATION,
    multipart::{Form, Part},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::{domain::Credential, error::ApiError, protocol::AuthResponse};
use storage::CredentialStore;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::{
    cookies::SessionCookieJar,
    error::{ClientError, ClientResult},
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Request bodies are kept in replayable form so a suspended request can be
/// resubmitted unchanged after a refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<UploadFile>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> ClientResult<Self> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = RequestBody::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn multipart(mut self, files: Vec<UploadFile>) -> Self {
        self.body = RequestBody::Multipart(files);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> ClientResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Maps non-success statuses onto the error taxonomy.
    pub fn into_result(self) -> ClientResult<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        if self.status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        Err(ClientError::Http {
            status: self.status,
            detail: ApiError::from_body(&self.body).message(),
        })
    }
}

/// One raw HTTP round trip. Status codes are not interpreted here.
#[async_trait]
pub trait HttpExchange: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> ClientResult<ApiResponse>;

    /// `POST /auth/refresh` using the ambient session cookie, never the bearer.
    async fn refresh(&self) -> ClientResult<ApiResponse>;
}

pub struct ReqwestExchange {
    http: Client,
    base_url: String,
    cookies: Option<Arc<SessionCookieJar>>,
}

impl ReqwestExchange {
    /// Client whose refresh cookie is kept in `credentials`, so a session
    /// started by one process can be refreshed by the next.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> ClientResult<Self> {
        let cookies = Arc::new(SessionCookieJar::new(credentials));
        let http = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .build()?;
        Ok(Self {
            cookies: Some(cookies),
            ..Self::with_client(http, base_url)
        })
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cookies: None,
        }
    }

    async fn read(&self, response: reqwest::Response) -> ClientResult<ApiResponse> {
        if let Some(cookies) = &self.cookies {
            cookies.flush().await?;
        }
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse { status, body })
    }

    fn build_form(files: &[UploadFile]) -> ClientResult<Form> {
        let mut form = Form::new();
        for file in files {
            let mut part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
            if let Some(mime) = &file.mime_type {
                part = part.mime_str(mime)?;
            }
            form = form.part("files", part);
        }
        Ok(form)
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn execute(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> ClientResult<ApiResponse> {
        let mut builder = self
            .http
            .request(
                request.method.clone(),
                format!("{}{}", self.base_url, request.path),
            )
            .query(&request.query);
        if let Some(credential) = credential {
            builder = builder.header(AUTHORIZATION, credential.authorization_header());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Multipart(files) => builder.multipart(Self::build_form(files)?),
        };

        let response = builder.send().await?;
        self.read(response).await
    }

    async fn refresh(&self) -> ClientResult<ApiResponse> {
        let response = self
            .http
            .post(format!("{}/auth/refresh", self.base_url))
            .send()
            .await?;
        self.read(response).await
    }
}

struct PendingReplay {
    request: ApiRequest,
    reply: oneshot::Sender<ClientResult<ApiResponse>>,
}

/// What a request that hit a 401 does next.
enum RefreshRole {
    Retry(Credential),
    Wait(oneshot::Receiver<ClientResult<ApiResponse>>),
    Lead,
}

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    pending: VecDeque<PendingReplay>,
}

pub struct AuthenticatedClient {
    exchange: Arc<dyn HttpExchange>,
    credentials: Arc<dyn CredentialStore>,
    refresh: Mutex<RefreshState>,
    events: broadcast::Sender<ClientEvent>,
}

impl AuthenticatedClient {
    pub fn new(
        exchange: Arc<dyn HttpExchange>,
        credentials: Arc<dyn CredentialStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            exchange,
            credentials,
            refresh: Mutex::new(RefreshState::default()),
            events,
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Sends without a bearer and without the refresh protocol. Used by the
    /// endpoints that mint credentials.
    pub async fn send_unauthenticated(&self, request: ApiRequest) -> ClientResult<ApiResponse> {
        self.exchange.execute(&request, None).await?.into_result()
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> ClientResult<T> {
        self.send(request).await?.json()
    }

    pub async fn send(&self, request: ApiRequest) -> ClientResult<ApiResponse> {
        let used = self.credentials.current();
        let response = self.exchange.execute(&request, used.as_ref()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return response.into_result();
        }

        let role = {
            let mut state = self.lock_refresh();
            // Checked under the lock so a refresh that lands between the
            // response and this point is reused instead of repeated.
            match self.credentials.current() {
                Some(current) if used.as_ref() != Some(&current) => RefreshRole::Retry(current),
                _ if state.in_progress => {
                    let (reply, rx) = oneshot::channel();
                    state.pending.push_back(PendingReplay {
                        request: request.clone(),
                        reply,
                    });
                    debug!(
                        path = %request.path,
                        queued = state.pending.len(),
                        "transport: 401 while refresh in flight; request suspended"
                    );
                    RefreshRole::Wait(rx)
                }
                _ => {
                    state.in_progress = true;
                    RefreshRole::Lead
                }
            }
        };

        match role {
            RefreshRole::Retry(current) => {
                debug!(path = %request.path, "transport: retrying with rotated credential");
                return self.attempt(&request, Some(&current)).await;
            }
            RefreshRole::Wait(rx) => {
                return rx.await.unwrap_or_else(|_| {
                    Err(ClientError::RefreshFailed(
                        "refresh abandoned before completion".into(),
                    ))
                });
            }
            RefreshRole::Lead => {}
        }

        let gate = RefreshGate {
            client: self,
            armed: true,
        };
        info!(path = %request.path, "transport: 401 received; refreshing credential");
        match self.refresh_credential().await {
            Ok(credential) => {
                let queued = gate.release();
                info!(replayed = queued.len(), "transport: credential refreshed");
                self.replay(queued, &credential, request).await
            }
            Err(err) => {
                let queued = gate.release();
                let reason = match err {
                    ClientError::RefreshFailed(reason) => reason,
                    other => other.to_string(),
                };
                warn!(
                    rejected = queued.len(),
                    "transport: credential refresh failed: {reason}"
                );
                for entry in queued {
                    let _ = entry
                        .reply
                        .send(Err(ClientError::RefreshFailed(reason.clone())));
                }
                if let Err(err) = self.credentials.clear().await {
                    warn!("transport: failed to clear credential after refresh failure: {err:#}");
                }
                let _ = self.events.send(ClientEvent::SessionExpired);
                Err(ClientError::RefreshFailed(reason))
            }
        }
    }

    /// Replays suspended requests in arrival order, then the triggering one.
    /// Futures are polled in list order, so submissions start FIFO.
    async fn replay(
        &self,
        queued: Vec<PendingReplay>,
        credential: &Credential,
        original: ApiRequest,
    ) -> ClientResult<ApiResponse> {
        let replays = join_all(queued.into_iter().map(|entry| async move {
            let result = self.attempt(&entry.request, Some(credential)).await;
            let _ = entry.reply.send(result);
        }));
        let (_, result) = join(replays, self.attempt(&original, Some(credential))).await;
        result
    }

    /// The single retry. A 401 here is final.
    async fn attempt(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> ClientResult<ApiResponse> {
        self.exchange
            .execute(request, credential)
            .await?
            .into_result()
    }

    async fn refresh_credential(&self) -> ClientResult<Credential> {
        let response = self.exchange.refresh().await?;
        let response = match response.into_result() {
            Ok(response) => response,
            Err(ClientError::Unauthorized) => {
                return Err(ClientError::RefreshFailed("refresh rejected (401)".into()))
            }
            Err(err) => return Err(err),
        };
        let credential: AuthResponse = response
            .json()
            .map_err(|_| ClientError::RefreshFailed("no access_token in refresh response".into()))?;
        if credential.access_token.trim().is_empty() {
            return Err(ClientError::RefreshFailed(
                "no access_token in refresh response".into(),
            ));
        }
        self.credentials
            .save(&credential)
            .await
            .map_err(ClientError::Storage)?;
        Ok(credential)
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_refresh().in_progress
    }

    pub fn suspended_requests(&self) -> usize {
        self.lock_refresh().pending.len()
    }
}

/// Owns the in-progress flag for the duration of a refresh. Releasing or
/// dropping it clears the flag; a drop without release (the refreshing
/// future was cancelled) also rejects whatever was queued.
struct RefreshGate<'a> {
    client: &'a AuthenticatedClient,
    armed: bool,
}

impl RefreshGate<'_> {
    fn release(mut self) -> Vec<PendingReplay> {
        self.armed = false;
        let mut state = self.client.lock_refresh();
        state.in_progress = false;
        state.pending.drain(..).collect()
    }
}

impl Drop for RefreshGate<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let queued: Vec<PendingReplay> = {
            let mut state = self.client.lock_refresh();
            state.in_progress = false;
            state.pending.drain(..).collect()
        };
        for entry in queued {
            let _ = entry.reply.send(Err(ClientError::RefreshFailed(
                "refresh cancelled".into(),
            )));
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;

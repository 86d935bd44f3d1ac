use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{future::join4, poll};
use storage::MemoryCredentialStore;
use tokio::sync::Mutex as AsyncMutex;

enum RefreshOutcome {
    Rotate(&'static str),
    Reject,
    IssueRejected(&'static str),
    NetworkFailure,
    MissingToken,
}

/// In-memory server: accepts exactly one bearer token and records every call.
struct ScriptedExchange {
    accepted_token: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    refresh_calls: AtomicUsize,
    refresh_gate: AsyncMutex<Option<oneshot::Receiver<()>>>,
    rotate_on_reject: Mutex<Option<Arc<MemoryCredentialStore>>>,
    outcome: RefreshOutcome,
}

impl ScriptedExchange {
    fn new(accepted_token: Option<&str>, outcome: RefreshOutcome) -> Self {
        Self {
            accepted_token: Mutex::new(accepted_token.map(str::to_string)),
            calls: Mutex::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            refresh_gate: AsyncMutex::new(None),
            rotate_on_reject: Mutex::new(None),
            outcome,
        }
    }

    fn gated(self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let this = Self {
            refresh_gate: AsyncMutex::new(Some(rx)),
            ..self
        };
        (this, tx)
    }

    fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().expect("calls").clone()
    }
}

async fn connection_refused() -> ClientError {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let err = Client::new()
        .post(format!("http://{addr}/auth/refresh"))
        .send()
        .await
        .expect_err("nothing listens on a dropped port");
    ClientError::Transport(err)
}

#[async_trait]
impl HttpExchange for ScriptedExchange {
    async fn execute(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> ClientResult<ApiResponse> {
        let bearer = credential.map(|c| c.access_token.clone());
        self.calls
            .lock()
            .expect("calls")
            .push((request.path.clone(), bearer.clone()));

        if request.path == "/boom" {
            return Ok(ApiResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"detail":"kaboom"}"#.to_vec(),
            ));
        }
        let accepted = self.accepted_token.lock().expect("token").clone();
        if bearer.is_some() && bearer == accepted {
            Ok(ApiResponse::new(StatusCode::OK, request.path.clone().into_bytes()))
        } else {
            let rotate = self.rotate_on_reject.lock().expect("rotate").take();
            if let (Some(store), Some(token)) = (rotate, accepted) {
                store.save(&Credential::bearer(token)).await.expect("save");
            }
            Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                br#"{"detail":"Could not validate credentials"}"#.to_vec(),
            ))
        }
    }

    async fn refresh(&self) -> ClientResult<ApiResponse> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.refresh_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        match self.outcome {
            RefreshOutcome::Rotate(token) => {
                *self.accepted_token.lock().expect("token") = Some(token.to_string());
                Ok(ApiResponse::new(
                    StatusCode::OK,
                    format!(r#"{{"access_token":"{token}","token_type":"bearer"}}"#).into_bytes(),
                ))
            }
            RefreshOutcome::Reject => Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                br#"{"detail":"Invalid refresh token"}"#.to_vec(),
            )),
            RefreshOutcome::IssueRejected(token) => Ok(ApiResponse::new(
                StatusCode::OK,
                format!(r#"{{"access_token":"{token}"}}"#).into_bytes(),
            )),
            RefreshOutcome::NetworkFailure => Err(connection_refused().await),
            RefreshOutcome::MissingToken => Ok(ApiResponse::new(StatusCode::OK, b"{}".to_vec())),
        }
    }
}

/// Store whose reads walk through a fixed sequence of credentials, the last
/// one sticking. Models a refresh finishing in another task between two reads.
struct SequencedStore {
    reads: Mutex<VecDeque<Credential>>,
    last: Mutex<Option<Credential>>,
    tx: tokio::sync::watch::Sender<Option<Credential>>,
}

impl SequencedStore {
    fn new(tokens: &[&str]) -> Self {
        let (tx, _) = tokio::sync::watch::channel(None);
        Self {
            reads: Mutex::new(tokens.iter().map(|t| Credential::bearer(*t)).collect()),
            last: Mutex::new(None),
            tx,
        }
    }
}

#[async_trait]
impl CredentialStore for SequencedStore {
    fn current(&self) -> Option<Credential> {
        let mut last = self.last.lock().expect("last");
        if let Some(next) = self.reads.lock().expect("reads").pop_front() {
            *last = Some(next);
        }
        last.clone()
    }

    async fn save(&self, credential: &Credential) -> anyhow::Result<()> {
        self.reads.lock().expect("reads").clear();
        *self.last.lock().expect("last") = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.reads.lock().expect("reads").clear();
        *self.last.lock().expect("last") = None;
        Ok(())
    }

    fn subscribe(&self) -> tokio::sync::watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }

    fn refresh_cookie(&self) -> Option<String> {
        None
    }

    fn save_refresh_cookie(
        &self,
        _value: Option<String>,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

struct Harness {
    exchange: Arc<ScriptedExchange>,
    store: Arc<MemoryCredentialStore>,
    client: AuthenticatedClient,
    events: broadcast::Receiver<ClientEvent>,
}

fn harness(exchange: ScriptedExchange, token: Option<&str>) -> Harness {
    let exchange = Arc::new(exchange);
    let store = Arc::new(MemoryCredentialStore::with_credential(
        token.map(|t| Credential::bearer(t)),
    ));
    let (tx, events) = broadcast::channel(16);
    let client = AuthenticatedClient::new(exchange.clone(), store.clone(), tx);
    Harness {
        exchange,
        store,
        client,
        events,
    }
}

fn body_text(result: &ClientResult<ApiResponse>) -> String {
    match result {
        Ok(response) => String::from_utf8_lossy(&response.body).to_string(),
        Err(err) => panic!("expected success, got {err}"),
    }
}

#[tokio::test]
async fn attaches_bearer_when_credential_exists() {
    let h = harness(
        ScriptedExchange::new(Some("good"), RefreshOutcome::MissingToken),
        Some("good"),
    );
    let result = h.client.send(ApiRequest::get("/auth/me")).await;
    assert_eq!(body_text(&result), "/auth/me");
    assert_eq!(
        h.exchange.calls(),
        vec![("/auth/me".to_string(), Some("good".to_string()))]
    );
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sends_unauthenticated_without_credential() {
    let h = harness(
        ScriptedExchange::new(Some("good"), RefreshOutcome::MissingToken),
        None,
    );
    let result = h
        .client
        .send_unauthenticated(ApiRequest::post("/auth/login"))
        .await;
    assert!(matches!(result, Err(ClientError::Unauthorized)));
    assert_eq!(h.exchange.calls(), vec![("/auth/login".to_string(), None)]);
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh_and_replay_in_arrival_order() {
    let (exchange, release) =
        ScriptedExchange::new(Some("fresh"), RefreshOutcome::Rotate("fresh")).gated();
    let h = harness(exchange, Some("stale"));

    let releaser = async {
        while h.client.suspended_requests() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(h.client.is_refreshing());
        release.send(()).expect("refresh waiting");
    };
    let (a, b, c, ()) = join4(
        h.client.send(ApiRequest::get("/a")),
        h.client.send(ApiRequest::get("/b")),
        h.client.send(ApiRequest::get("/c")),
        releaser,
    )
    .await;

    assert_eq!(body_text(&a), "/a");
    assert_eq!(body_text(&b), "/b");
    assert_eq!(body_text(&c), "/c");
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(!h.client.is_refreshing());
    assert_eq!(h.client.suspended_requests(), 0);

    let stale = Some("stale".to_string());
    let fresh = Some("fresh".to_string());
    assert_eq!(
        h.exchange.calls(),
        vec![
            ("/a".to_string(), stale.clone()),
            ("/b".to_string(), stale.clone()),
            ("/c".to_string(), stale),
            ("/b".to_string(), fresh.clone()),
            ("/c".to_string(), fresh.clone()),
            ("/a".to_string(), fresh),
        ]
    );
    assert_eq!(
        h.store.current().map(|c| c.access_token),
        Some("fresh".to_string())
    );
}

#[tokio::test]
async fn refresh_network_failure_rejects_everyone_and_signals_once() {
    let (exchange, release) =
        ScriptedExchange::new(Some("never"), RefreshOutcome::NetworkFailure).gated();
    let mut h = harness(exchange, Some("stale"));

    let releaser = async {
        while h.client.suspended_requests() < 2 {
            tokio::task::yield_now().await;
        }
        release.send(()).expect("refresh waiting");
    };
    let (a, b, c, ()) = join4(
        h.client.send(ApiRequest::get("/a")),
        h.client.send(ApiRequest::get("/b")),
        h.client.send(ApiRequest::get("/c")),
        releaser,
    )
    .await;

    for result in [a, b, c] {
        assert!(
            matches!(result, Err(ClientError::RefreshFailed(_))),
            "expected refresh failure, got {result:?}"
        );
    }
    assert!(h.store.current().is_none());
    assert!(!h.client.is_refreshing());
    assert_eq!(h.client.suspended_requests(), 0);
    assert!(matches!(h.events.try_recv(), Ok(ClientEvent::SessionExpired)));
    assert!(h.events.try_recv().is_err());
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_without_token_counts_as_failure() {
    let mut h = harness(
        ScriptedExchange::new(Some("never"), RefreshOutcome::MissingToken),
        Some("stale"),
    );
    let result = h.client.send(ApiRequest::get("/conversations")).await;
    match result {
        Err(ClientError::RefreshFailed(reason)) => assert!(reason.contains("access_token")),
        other => panic!("expected refresh failure, got {other:?}"),
    }
    assert!(h.store.current().is_none());
    assert!(matches!(h.events.try_recv(), Ok(ClientEvent::SessionExpired)));
}

#[tokio::test]
async fn second_401_after_refresh_is_final() {
    let mut h = harness(
        ScriptedExchange::new(Some("nobody"), RefreshOutcome::IssueRejected("rotated")),
        Some("stale"),
    );
    let result = h.client.send(ApiRequest::get("/loop")).await;
    assert!(matches!(result, Err(ClientError::Unauthorized)));
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.exchange.calls().len(), 2);
    // The refresh itself succeeded, so the session is still considered live.
    assert_eq!(
        h.store.current().map(|c| c.access_token),
        Some("rotated".to_string())
    );
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn other_errors_skip_the_refresh_protocol() {
    let h = harness(
        ScriptedExchange::new(Some("good"), RefreshOutcome::MissingToken),
        Some("good"),
    );
    let result = h.client.send(ApiRequest::get("/boom")).await;
    match result {
        Err(ClientError::Http { status, detail }) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(detail, "kaboom");
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rotated_credential_is_retried_without_refreshing() {
    let h = harness(
        ScriptedExchange::new(Some("fresh"), RefreshOutcome::MissingToken),
        Some("stale"),
    );
    // Another tab refreshes while this request is in flight.
    *h.exchange.rotate_on_reject.lock().expect("rotate") = Some(h.store.clone());

    let result = h.client.send(ApiRequest::get("/me")).await;

    assert_eq!(body_text(&result), "/me");
    assert_eq!(h.exchange.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.exchange.calls(),
        vec![
            ("/me".to_string(), Some("stale".to_string())),
            ("/me".to_string(), Some("fresh".to_string())),
        ]
    );
}

#[tokio::test]
async fn cancelled_refresh_rejects_queued_requests() {
    let (exchange, _release) =
        ScriptedExchange::new(Some("fresh"), RefreshOutcome::Rotate("fresh")).gated();
    let h = harness(exchange, Some("stale"));

    let mut leader = Box::pin(h.client.send(ApiRequest::get("/leader")));
    assert!(poll!(leader.as_mut()).is_pending());
    assert!(h.client.is_refreshing());

    let mut follower = Box::pin(h.client.send(ApiRequest::get("/follower")));
    assert!(poll!(follower.as_mut()).is_pending());
    assert_eq!(h.client.suspended_requests(), 1);

    drop(leader);
    assert!(!h.client.is_refreshing());
    assert!(matches!(
        follower.await,
        Err(ClientError::RefreshFailed(_))
    ));
}

#[tokio::test]
async fn credential_rotated_just_before_refresh_decision_is_reused() {
    let exchange = Arc::new(ScriptedExchange::new(
        Some("fresh"),
        RefreshOutcome::MissingToken,
    ));
    let store = Arc::new(SequencedStore::new(&["stale", "fresh"]));
    let (tx, mut events) = broadcast::channel(16);
    let client = AuthenticatedClient::new(exchange.clone(), store, tx);

    let result = client.send(ApiRequest::get("/me")).await;

    assert_eq!(body_text(&result), "/me");
    assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 0);
    assert!(!client.is_refreshing());
    assert_eq!(
        exchange.calls(),
        vec![
            ("/me".to_string(), Some("stale".to_string())),
            ("/me".to_string(), Some("fresh".to_string())),
        ]
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn rejected_refresh_reason_is_not_wrapped_twice() {
    let mut h = harness(
        ScriptedExchange::new(Some("never"), RefreshOutcome::Reject),
        Some("stale"),
    );
    let err = h
        .client
        .send(ApiRequest::get("/auth/me"))
        .await
        .expect_err("refresh rejected");

    assert_eq!(
        err.to_string(),
        "credential refresh failed: refresh rejected (401)"
    );
    assert!(h.store.current().is_none());
    assert!(matches!(h.events.try_recv(), Ok(ClientEvent::SessionExpired)));
}

//! In-process fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::connection::transport::{TransportId, TransportListener};
use crate::connection::{ConnectionError, ConnectionManager};
use crate::favorites::{FavoritesApi, FavoritesError};
use crate::session::{Credential, CredentialProvider, Identity, IssuedCredential, SessionError};
use crate::types::{FavoriteRecord, MovieId};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `check` every 10ms until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Issues `token-1`, `token-2`, ... and optionally fails after `n` issues.
pub struct SequenceProvider {
    issued: AtomicUsize,
    fail_after: Option<usize>,
}

impl SequenceProvider {
    pub fn new() -> Self {
        Self { issued: AtomicUsize::new(0), fail_after: None }
    }

    pub fn failing_after(successes: usize) -> Self {
        Self { issued: AtomicUsize::new(0), fail_after: Some(successes) }
    }

    /// Issue calls so far, failed ones included.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for SequenceProvider {
    async fn issue(&self, identity: &Identity) -> Result<IssuedCredential, SessionError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_after.is_some_and(|limit| n > limit) {
            return Err(SessionError::Issue(format!("provider refused {}", identity.id)));
        }
        Ok(IssuedCredential { credential: Credential::new(format!("token-{n}")), ttl: Duration::from_secs(900) })
    }
}

// =============================================================================
// FAVORITES
// =============================================================================

/// In-memory favorites store with call counters and failure switches.
#[derive(Default)]
pub struct FakeFavoritesApi {
    records: Mutex<BTreeMap<MovieId, FavoriteRecord>>,
    credentials: Mutex<Vec<String>>,
    lists: AtomicUsize,
    adds: AtomicUsize,
    removes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_lists: AtomicBool,
}

impl FakeFavoritesApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = FavoriteRecord>) -> Self {
        let api = Self::default();
        lock(&api.records).extend(records.into_iter().map(|record| (record.movie_id, record)));
        api
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<MovieId> {
        lock(&self.records).keys().copied().collect()
    }

    /// Credentials seen on every call, in order.
    pub fn credentials(&self) -> Vec<String> {
        lock(&self.credentials).clone()
    }

    fn record_credential(&self, credential: &Credential) {
        lock(&self.credentials).push(credential.as_str().to_owned());
    }
}

#[async_trait::async_trait]
impl FavoritesApi for FakeFavoritesApi {
    async fn list(&self, credential: &Credential) -> Result<Vec<FavoriteRecord>, FavoritesError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.record_credential(credential);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(FavoritesError::Status { op: "list", status: 500 });
        }
        Ok(lock(&self.records).values().cloned().collect())
    }

    async fn add(&self, credential: &Credential, movie: &FavoriteRecord) -> Result<(), FavoritesError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.record_credential(credential);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FavoritesError::Rejected("database unavailable".to_owned()));
        }
        lock(&self.records).insert(movie.movie_id, movie.clone());
        Ok(())
    }

    async fn remove(&self, credential: &Credential, movie: &FavoriteRecord) -> Result<(), FavoritesError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.record_credential(credential);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FavoritesError::Rejected("database unavailable".to_owned()));
        }
        lock(&self.records).remove(&movie.movie_id);
        Ok(())
    }
}

// =============================================================================
// TRANSPORT LISTENER
// =============================================================================

/// Records every callback it receives.
#[derive(Default)]
pub struct RecordingListener {
    opened: AtomicUsize,
    closed: AtomicUsize,
    errors: AtomicUsize,
    messages: Mutex<Vec<(TransportId, String)>>,
}

impl RecordingListener {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl TransportListener for RecordingListener {
    fn on_open(&self, _connection: &ConnectionManager, _transport: TransportId) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _connection: &ConnectionManager, _transport: TransportId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _transport: TransportId, _error: &ConnectionError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, transport: TransportId, text: &str) {
        lock(&self.messages).push((transport, text.to_owned()));
    }
}

// =============================================================================
// NOTIFICATION SERVER
// =============================================================================

enum ServerCommand {
    Text(String),
    Close,
}

#[derive(Default)]
struct ServerState {
    connections: AtomicUsize,
    handshakes: Mutex<Vec<(String, HashMap<String, String>)>>,
    received: Mutex<Vec<(usize, Value)>>,
    close_codes: Mutex<Vec<u16>>,
    peers: Mutex<HashMap<usize, mpsc::UnboundedSender<ServerCommand>>>,
}

impl ServerState {
    fn send_to(&self, connection: usize, command: ServerCommand) -> bool {
        lock(&self.peers).get(&connection).is_some_and(|tx| tx.send(command).is_ok())
    }
}

/// Websocket server speaking the notification protocol on `127.0.0.1:0`.
///
/// Greets every connection with `connection_established`, answers a
/// `favorite_movie` frame with `favorite_confirmed` to the sender and
/// `new_favorite` to every other peer, and records what it receives.
pub struct FakeNotifyServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FakeNotifyServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new().route("/ws/{user_id}", get(upgrade)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn socket_base(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Number of websocket connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        lock(&self.state.peers).len()
    }

    /// `(user id, query parameters)` of every accepted handshake.
    pub fn handshakes(&self) -> Vec<(String, HashMap<String, String>)> {
        lock(&self.state.handshakes).clone()
    }

    /// Frames received on connection `index` (0-based, in accept order).
    pub fn received_on(&self, index: usize) -> Vec<Value> {
        lock(&self.state.received)
            .iter()
            .filter(|(connection, _)| *connection == index)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn received_of_type(&self, kind: &str) -> Vec<Value> {
        lock(&self.state.received)
            .iter()
            .filter(|(_, frame)| frame["type"] == kind)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        lock(&self.state.close_codes).clone()
    }

    /// Push a raw text frame to connection `index`.
    pub fn send_text(&self, index: usize, text: &str) -> bool {
        self.state.send_to(index, ServerCommand::Text(text.to_owned()))
    }

    /// Close connection `index` from the server side.
    pub fn drop_connection(&self, index: usize) -> bool {
        self.state.send_to(index, ServerCommand::Close)
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, user_id, query, state))
}

async fn serve_socket(socket: WebSocket, user_id: String, query: HashMap<String, String>, state: Arc<ServerState>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let index = {
        let mut peers = lock(&state.peers);
        let index = state.connections.fetch_add(1, Ordering::SeqCst);
        peers.insert(index, tx);
        index
    };
    lock(&state.handshakes).push((user_id.clone(), query));

    let (mut write, mut read) = socket.split();
    let greeting = json!({ "type": "connection_established", "message": "Connected to movie notifications!" });
    let _ = write.send(WsMessage::Text(greeting.to_string().into())).await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ServerCommand::Text(text)) => {
                    if write.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    lock(&state.received).push((index, frame.clone()));
                    if frame["type"] == "favorite_movie" {
                        relay_favorite(&state, index, &user_id, &frame);
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    lock(&state.close_codes).push(frame.map_or(1005, |frame| frame.code));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }

    lock(&state.peers).remove(&index);
}

fn relay_favorite(state: &ServerState, sender: usize, user_id: &str, frame: &Value) {
    let title = frame["movie"]["title"].as_str().unwrap_or("a movie");
    let user_name = frame["user_name"].as_str().unwrap_or(user_id);
    let confirmed = json!({
        "type": "favorite_confirmed",
        "message": format!("You just favorited {title}"),
        "movie": frame["movie"],
    });
    state.send_to(sender, ServerCommand::Text(confirmed.to_string()));

    let announced = json!({
        "type": "new_favorite",
        "message": format!("{user_name} just favorited {title}"),
        "movie": frame["movie"],
        "user_name": user_name,
    });
    let others: Vec<usize> = lock(&state.peers).keys().copied().filter(|peer| *peer != sender).collect();
    for peer in others {
        state.send_to(peer, ServerCommand::Text(announced.to_string()));
    }
}

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::client::config::ClientConfig;
use crate::client::models::notifications::{Notification, NotificationFeed};
use crate::client::services::error::ExchangeError;
use crate::client::services::wire::{
    self, ChatSend, ClientFrame, DownloadNotice, ServerFrame, DOWNLOAD_EVENT,
};

/// Lifecycle of a long-lived link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    /// Terminal; the link will not redial on its own.
    Closed,
}

/// Caller-facing side of the chat socket. Clones share one physical link.
#[derive(Clone)]
pub struct ChatHandle {
    username: String,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    events: broadcast::Sender<ServerFrame>,
    state: watch::Receiver<LinkState>,
    attempts: Arc<AtomicU32>,
}

impl ChatHandle {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Every subscriber sees every decoded inbound frame.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.events.subscribe()
    }

    /// Queue a chat message. Queued frames survive a reconnect; they are
    /// written once the link is open again.
    pub fn send_chat(&self, receiver_username: &str, content: &str) -> Result<(), ExchangeError> {
        let frame = ClientFrame::Chat(ChatSend {
            receiver_username: receiver_username.to_string(),
            content: content.to_string(),
        });
        self.outgoing
            .send(frame)
            .map_err(|_| ExchangeError::Transport("chat link is shut down".to_string()))
    }

    /// Retries since the link was last open; resets to zero on every
    /// successful dial.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Caller-facing side of the notification stream.
#[derive(Clone)]
pub struct NotificationHandle {
    username: String,
    feed: Arc<Mutex<NotificationFeed>>,
    notices: broadcast::Sender<DownloadNotice>,
    state: watch::Receiver<LinkState>,
}

impl NotificationHandle {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadNotice> {
        self.notices.subscribe()
    }

    /// Newest-first copy of the bounded feed.
    pub async fn snapshot(&self) -> Vec<Notification> {
        self.feed.lock().await.iter().cloned().collect()
    }
}

/// Everything the chat link task owns.
pub struct ChatShared {
    pub outgoing: mpsc::UnboundedReceiver<ClientFrame>,
    pub events: broadcast::Sender<ServerFrame>,
    pub state: watch::Sender<LinkState>,
    pub attempts: Arc<AtomicU32>,
    pub shutdown: watch::Receiver<bool>,
}

/// Everything the notification link task owns.
pub struct NotifyShared {
    pub feed: Arc<Mutex<NotificationFeed>>,
    pub notices: broadcast::Sender<DownloadNotice>,
    pub state: watch::Sender<LinkState>,
    pub attempts: Arc<AtomicU32>,
    pub shutdown: watch::Receiver<bool>,
}

/// Seam between the registry and the network, so tests can count dials
/// without opening sockets.
pub trait Transport: Send + Sync {
    fn spawn_chat(&self, cfg: &ClientConfig, username: &str, shared: ChatShared);
    fn spawn_notifications(&self, cfg: &ClientConfig, username: &str, shared: NotifyShared);
}

/// Real transport over tokio-tungstenite and reqwest.
pub struct NetTransport;

impl Transport for NetTransport {
    fn spawn_chat(&self, cfg: &ClientConfig, username: &str, shared: ChatShared) {
        let cfg = cfg.clone();
        let username = username.to_string();
        tokio::spawn(run_chat(cfg, username, shared));
    }

    fn spawn_notifications(&self, cfg: &ClientConfig, username: &str, shared: NotifyShared) {
        let cfg = cfg.clone();
        let username = username.to_string();
        tokio::spawn(run_notifications(cfg, username, shared));
    }
}

/// 1000 (normal) and 1001 (going away) are deliberate closes; anything else,
/// including a vanished peer, earns a redial.
pub fn should_reconnect(close_code: Option<u16>) -> bool {
    !matches!(close_code, Some(1000) | Some(1001))
}

enum SessionEnd {
    /// Registry asked us to stop, or every handle is gone.
    Shutdown,
    /// The link dropped; carries the close code when the peer sent one.
    Closed(Option<u16>),
}

async fn run_chat(cfg: ClientConfig, username: String, mut shared: ChatShared) {
    let url = match cfg.chat_ws_url(&username) {
        Ok(url) => url,
        Err(e) => {
            log::error!(target: "connection", "chat link unusable: {}", e);
            let _ = shared.state.send(LinkState::Closed);
            return;
        }
    };

    loop {
        if *shared.shutdown.borrow() {
            break;
        }
        let _ = shared.state.send(LinkState::Connecting);

        let end = match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                shared.attempts.store(0, Ordering::SeqCst);
                let _ = shared.state.send(LinkState::Open);
                log::info!(target: "connection", "chat link open for {}", username);
                chat_session(ws, &mut shared).await
            }
            Err(e) => {
                log::warn!(target: "connection", "chat dial failed: {}", e);
                SessionEnd::Closed(None)
            }
        };

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Closed(code) => {
                if !should_reconnect(code) {
                    log::info!(target: "connection", "chat link closed cleanly");
                    break;
                }
                shared.attempts.fetch_add(1, Ordering::SeqCst);
                log::info!(
                    target: "connection",
                    "chat link lost (code {:?}); retrying in {}s",
                    code,
                    cfg.reconnect_delay_secs
                );
                if wait_or_shutdown(cfg.reconnect_delay_secs, &mut shared.shutdown).await {
                    break;
                }
            }
        }
    }
    let _ = shared.state.send(LinkState::Closed);
}

async fn chat_session(
    ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    shared: &mut ChatShared,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            changed = shared.shutdown.changed() => {
                if changed.is_err() || *shared.shutdown.borrow() {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
            frame = shared.outgoing.recv() => {
                let Some(frame) = frame else {
                    // Every handle dropped; nothing left to serve.
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                match wire::encode_frame(&frame) {
                    Ok(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            log::warn!(target: "connection", "chat write failed: {}", e);
                            return SessionEnd::Closed(None);
                        }
                    }
                    Err(e) => log::error!(target: "connection", "unencodable frame dropped: {}", e),
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => match wire::decode_frame(&text) {
                        Ok(frame) => {
                            // No subscribers is fine; the frame just falls out.
                            let _ = shared.events.send(frame);
                        }
                        Err(e) => log::warn!(target: "connection", "dropping frame: {}", e),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        return SessionEnd::Closed(frame.map(|f| u16::from(f.code)));
                    }
                    // Pings are answered by the protocol layer on flush.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!(target: "connection", "chat read failed: {}", e);
                        return SessionEnd::Closed(None);
                    }
                    None => return SessionEnd::Closed(None),
                }
            }
        }
    }
}

async fn run_notifications(cfg: ClientConfig, username: String, mut shared: NotifyShared) {
    let url = match cfg.subscribe_url(&username) {
        Ok(url) => url,
        Err(e) => {
            log::error!(target: "connection", "notification link unusable: {}", e);
            let _ = shared.state.send(LinkState::Closed);
            return;
        }
    };
    let client = reqwest::Client::new();

    loop {
        if *shared.shutdown.borrow() {
            break;
        }
        let _ = shared.state.send(LinkState::Connecting);

        match client.get(url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => {
                shared.attempts.store(0, Ordering::SeqCst);
                let _ = shared.state.send(LinkState::Open);
                // No replay contract with the server: whatever the previous
                // connection collected is gone.
                shared.feed.lock().await.clear();
                log::info!(target: "connection", "notification stream open for {}", username);
                if let SessionEnd::Shutdown = notification_session(resp, &mut shared).await {
                    break;
                }
            }
            Ok(resp) => {
                log::warn!(target: "connection", "subscribe refused: {}", resp.status());
            }
            Err(e) => {
                log::warn!(target: "connection", "subscribe dial failed: {}", e);
            }
        }

        shared.attempts.fetch_add(1, Ordering::SeqCst);
        if wait_or_shutdown(cfg.reconnect_delay_secs, &mut shared.shutdown).await {
            break;
        }
    }
    let _ = shared.state.send(LinkState::Closed);
}

async fn notification_session(resp: reqwest::Response, shared: &mut NotifyShared) -> SessionEnd {
    let mut body = resp.bytes_stream();
    let mut parser = wire::SseParser::new();
    let mut buffer = String::new();

    loop {
        tokio::select! {
            changed = shared.shutdown.changed() => {
                if changed.is_err() || *shared.shutdown.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            chunk = body.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            if let Some(event) = parser.feed_line(line.trim_end_matches('\n')) {
                                dispatch_event(event, shared).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!(target: "connection", "notification read failed: {}", e);
                        return SessionEnd::Closed(None);
                    }
                    None => return SessionEnd::Closed(None),
                }
            }
        }
    }
}

async fn dispatch_event(event: wire::SseEvent, shared: &mut NotifyShared) {
    if event.name != DOWNLOAD_EVENT {
        log::debug!(target: "connection", "ignoring sse event {:?}", event.name);
        return;
    }
    match wire::decode_download_notice(&event) {
        Ok(notice) => {
            shared.feed.lock().await.push_notice(&notice);
            let _ = shared.notices.send(notice);
        }
        Err(e) => log::warn!(target: "connection", "dropping notification: {}", e),
    }
}

/// Sleep the reconnect delay; true means a shutdown arrived instead.
async fn wait_or_shutdown(delay_secs: u64, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

struct ChatSlot {
    handle: ChatHandle,
    shutdown: watch::Sender<bool>,
}

struct NotifySlot {
    handle: NotificationHandle,
    shutdown: watch::Sender<bool>,
}

/// Owns at most one chat link and one notification link for the session.
///
/// Acquiring for the user that already holds a live link hands back the
/// existing handle; acquiring for a different user tears the old link down
/// first. Sharing is by handle clone, never by a second physical connection.
pub struct ConnectionRegistry {
    cfg: ClientConfig,
    transport: Arc<dyn Transport>,
    chat: Mutex<Option<ChatSlot>>,
    notify: Mutex<Option<NotifySlot>>,
}

impl ConnectionRegistry {
    pub fn new(cfg: ClientConfig) -> Self {
        Self::with_transport(cfg, Arc::new(NetTransport))
    }

    pub fn with_transport(cfg: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            cfg,
            transport,
            chat: Mutex::new(None),
            notify: Mutex::new(None),
        }
    }

    pub async fn acquire_chat(&self, username: &str) -> ChatHandle {
        let mut slot = self.chat.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.handle.username == username && existing.handle.state() != LinkState::Closed
            {
                return existing.handle.clone();
            }
            let _ = existing.shutdown.send(true);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));

        let handle = ChatHandle {
            username: username.to_string(),
            outgoing: out_tx,
            events: events_tx.clone(),
            state: state_rx,
            attempts: attempts.clone(),
        };
        self.transport.spawn_chat(
            &self.cfg,
            username,
            ChatShared {
                outgoing: out_rx,
                events: events_tx,
                state: state_tx,
                attempts,
                shutdown: shutdown_rx,
            },
        );
        *slot = Some(ChatSlot {
            handle: handle.clone(),
            shutdown: shutdown_tx,
        });
        handle
    }

    pub async fn release_chat(&self) {
        if let Some(slot) = self.chat.lock().await.take() {
            let _ = slot.shutdown.send(true);
        }
    }

    pub async fn acquire_notifications(&self, username: &str) -> NotificationHandle {
        let mut slot = self.notify.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.handle.username == username && existing.handle.state() != LinkState::Closed
            {
                return existing.handle.clone();
            }
            let _ = existing.shutdown.send(true);
        }

        let feed = Arc::new(Mutex::new(NotificationFeed::new(
            self.cfg.notification_capacity,
        )));
        let (notices_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = NotificationHandle {
            username: username.to_string(),
            feed: feed.clone(),
            notices: notices_tx.clone(),
            state: state_rx,
        };
        self.transport.spawn_notifications(
            &self.cfg,
            username,
            NotifyShared {
                feed,
                notices: notices_tx,
                state: state_tx,
                attempts: Arc::new(AtomicU32::new(0)),
                shutdown: shutdown_rx,
            },
        );
        *slot = Some(NotifySlot {
            handle: handle.clone(),
            shutdown: shutdown_tx,
        });
        handle
    }

    pub async fn release_notifications(&self) {
        if let Some(slot) = self.notify.lock().await.take() {
            let _ = slot.shutdown.send(true);
        }
    }
}

//! 控制通道客户端
//!
//! 与隧道无关的注册/心跳 WebSocket：
//! - 连接建立后发送 `device_online`
//! - 回应应用层 `ping`，另有每 30 秒一次的传输层 Ping
//! - 断开或失败后按固定延迟重连，同一时间只保留一个重连定时器

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::env::ChannelSettings;
use crate::domain::channel::{ConnectionState, DeviceSpecs, InboundMessage, OutboundMessage};
use crate::error::ChannelError;

/// 状态变化回调
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// 会话结束原因
enum SessionEnd {
    /// 本地调用了 disconnect
    Cancelled,
    /// 对端关闭
    Closed,
    Failed(ChannelError),
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ChannelClient {
    settings: ChannelSettings,
    specs: DeviceSpecs,
    /// 正在连接或已连接
    in_flight: AtomicBool,
    /// disconnect 之后不再自动重连
    wanted: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    listener: Option<StateListener>,
    session: Mutex<Option<Session>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    reconnect_attempts: AtomicU32,
}

impl ChannelClient {
    pub fn new(settings: ChannelSettings, specs: DeviceSpecs) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            specs,
            in_flight: AtomicBool::new(false),
            wanted: AtomicBool::new(false),
            state_tx,
            listener: None,
            session: Mutex::new(None),
            reconnect: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 重连延迟，与重试次数无关
    pub fn reconnect_delay(&self, _attempt: u32) -> Duration {
        Duration::from_secs(self.settings.reconnect_delay_secs)
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_replace(state) != state;
        if changed {
            debug!(state = state.as_str(), "Channel state changed");
            if let Some(listener) = &self.listener {
                listener(state);
            }
        }
    }

    /// 发起连接，已在连接中或已连接时为空操作
    pub fn connect(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("Channel already connecting or connected, ignoring connect");
            return;
        }
        self.wanted.store(true, Ordering::SeqCst);
        // 手动连接时丢弃待执行的重连
        self.cancel_reconnect();
        self.set_state(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let end = this.run_session(token).await;
            this.finish_session(end);
        });

        if let Ok(mut slot) = self.session.lock() {
            if let Some(old) = slot.replace(Session { cancel, task }) {
                old.cancel.cancel();
            }
        }
    }

    /// 关闭连接并取消重连（可重复调用）
    pub async fn disconnect(&self) {
        self.wanted.store(false, Ordering::SeqCst);
        self.cancel_reconnect();

        let session = self.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            session.cancel.cancel();
            let abort = session.task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(3), session.task)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        // 会话结束时可能刚好排了一次重连
        self.cancel_reconnect();
        self.in_flight.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        info!("Channel disconnected");
    }

    fn cancel_reconnect(&self) {
        let pending = self.reconnect.lock().ok().and_then(|mut s| s.take());
        if let Some(task) = pending {
            task.abort();
        }
    }

    fn finish_session(self: &Arc<Self>, end: SessionEnd) {
        self.in_flight.store(false, Ordering::SeqCst);
        match end {
            SessionEnd::Cancelled => {}
            SessionEnd::Closed => {
                info!("Channel closed by server");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
            SessionEnd::Failed(e) => {
                error!(error = %e, "Channel failed");
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    /// 取消已有定时器后，恰好安排一次重连
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.wanted.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.reconnect_delay(attempt);
        info!(attempt, delay_secs = delay.as_secs(), "Scheduling channel reconnect");

        let this = Arc::clone(self);
        let Ok(mut slot) = self.reconnect.lock() else {
            return;
        };
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(tokio::spawn(async move {
            sleep(delay).await;
            if this.wanted.load(Ordering::SeqCst) {
                this.connect();
            }
        }));
    }

    async fn run_session(&self, cancel: CancellationToken) -> SessionEnd {
        let parsed = match validate_url(&self.settings.url) {
            Ok(url) => url,
            Err(e) => return SessionEnd::Failed(e),
        };
        let url = parsed.as_str();
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        info!(url, "Connecting control channel");

        let ws_stream = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            result = tokio::time::timeout(connect_timeout, connect_async(url)) => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => return SessionEnd::Failed(ChannelError::Connect(e.to_string())),
                Err(_) => return SessionEnd::Failed(ChannelError::Timeout(connect_timeout)),
            },
        };
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let online = OutboundMessage::DeviceOnline {
            specs: self.specs.clone(),
        };
        let sent = match online.encode() {
            Ok(json) => ws_tx
                .send(Message::Text(json))
                .await
                .map_err(send_error),
            Err(e) => Err(ChannelError::Encode(e)),
        };
        if let Err(e) = sent {
            return SessionEnd::Failed(e);
        }

        info!(device_id = %self.specs.device_id, "Control channel connected, registration sent");
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        let period = Duration::from_secs(self.settings.ping_interval_secs.max(1));
        let mut ping_interval = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Client disconnect".into(),
                    }));
                    let _ = ws_tx.send(close).await;
                    let _ = ws_tx.close().await;
                    return SessionEnd::Cancelled;
                }

                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_text(&text, &mut ws_tx).await {
                                return SessionEnd::Failed(e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_tx.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Server sent close frame");
                            return SessionEnd::Closed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return SessionEnd::Failed(ChannelError::Connect(e.to_string()));
                        }
                        None => return SessionEnd::Closed,
                    }
                }

                _ = ping_interval.tick() => {
                    if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Failed(send_error(e));
                    }
                }
            }
        }
    }

    async fn handle_text<S>(&self, text: &str, ws_tx: &mut S) -> Result<(), ChannelError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let msg = match InboundMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Failed to parse channel message");
                return Ok(());
            }
        };

        match msg {
            InboundMessage::Registered {
                device_id,
                frp_port,
                message,
            } => {
                info!(
                    device_id = ?device_id,
                    frp_port = ?frp_port,
                    message = message.as_deref().unwrap_or(""),
                    "Device registration confirmed"
                );
            }
            InboundMessage::Ping => {
                let pong = OutboundMessage::Pong.encode()?;
                ws_tx
                    .send(Message::Text(pong))
                    .await
                    .map_err(|e| ChannelError::Send(e.to_string()))?;
            }
            InboundMessage::Command { command, .. } => {
                info!(command = ?command, "Received command (not handled)");
            }
            InboundMessage::TaskUpdate { task_id, status } => {
                debug!(task_id = ?task_id, status = ?status, "Received task update");
            }
            InboundMessage::Unknown => {
                warn!(message = %text, "Unknown channel message type");
            }
        }
        Ok(())
    }
}

/// 对端已关闭的发送失败单独归为 `Closed`
fn send_error(e: WsError) -> ChannelError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
        other => ChannelError::Send(other.to_string()),
    }
}

/// 只接受 ws/wss 地址
fn validate_url(raw: &str) -> Result<url::Url, ChannelError> {
    let url = url::Url::parse(raw).map_err(|e| ChannelError::Connect(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChannelError::Connect(format!("unsupported scheme: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn settings(url: String) -> ChannelSettings {
        ChannelSettings {
            enabled: true,
            url,
            device_id: "device_6104".to_string(),
            device_name: "dev1".to_string(),
            device_type: "linux".to_string(),
            remote_port: 6104,
            screen_resolution: "unknown".to_string(),
            connect_timeout_secs: 2,
            ping_interval_secs: 30,
            reconnect_delay_secs: 1,
        }
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("ws://10.0.0.5:9999").is_ok());
        assert!(validate_url("wss://relay.example.com/ws").is_ok());
        assert!(validate_url("http://10.0.0.5:9999").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_send_error_on_closed_socket() {
        assert!(matches!(send_error(WsError::ConnectionClosed), ChannelError::Closed));
        assert!(matches!(send_error(WsError::AlreadyClosed), ChannelError::Closed));
        assert!(matches!(
            send_error(WsError::Io(std::io::Error::new(std::io::ErrorKind::Other, "reset"))),
            ChannelError::Send(_)
        ));
    }

    fn specs() -> DeviceSpecs {
        DeviceSpecs {
            device_id: "device_6104".to_string(),
            frp_port: 6104,
            device_name: "dev1".to_string(),
            device_type: "linux".to_string(),
            model: "test".to_string(),
            os_version: "1".to_string(),
            screen_resolution: "unknown".to_string(),
            battery: 100,
            network: "ethernet".to_string(),
        }
    }

    /// 每个连接：记录首条消息，发送 ping，转发后续文本；`close_first` 时立即关闭首个连接
    async fn ws_server(close_first: bool) -> (String, Arc<AtomicUsize>, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    if close_first && n == 0 {
                        let _ = ws.close(None).await;
                        return;
                    }
                    if let Some(Ok(Message::Text(first))) = ws.next().await {
                        let _ = tx.send(first);
                    }
                    let _ = ws
                        .send(Message::Text(r#"{"type":"registered","device_id":"device_6104"}"#.to_string()))
                        .await;
                    let _ = ws.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await;
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = tx.send(text);
                        }
                    }
                });
            }
        });

        (format!("ws://{}", addr), accepted, rx)
    }

    async fn wait_for_state(client: &ChannelClient, state: ConnectionState) {
        let mut rx = client.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_registers_and_answers_ping() {
        let (url, accepted, mut rx) = ws_server(false).await;
        let client = Arc::new(ChannelClient::new(settings(url), specs()));

        client.connect();
        wait_for_state(&client, ConnectionState::Connected).await;

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(json["type"], "device_online");
        assert_eq!(json["specs"]["device_id"], "device_6104");

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply, r#"{"type":"pong"}"#);

        // 已连接时再次 connect 不会建立新连接
        client.connect();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let (url, accepted, _rx) = ws_server(true).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let client = Arc::new(
            ChannelClient::new(settings(url), specs())
                .with_listener(Arc::new(move |s| sink.lock().unwrap().push(s))),
        );

        client.connect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;

        client.disconnect().await;
        let states = seen.lock().unwrap().clone();
        assert_eq!(states.first(), Some(&ConnectionState::Connecting));
        assert!(states.contains(&ConnectionState::Connected));
        assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect() {
        let (url, accepted, _rx) = ws_server(false).await;
        let client = Arc::new(ChannelClient::new(settings(url), specs()));

        client.connect();
        wait_for_state(&client, ConnectionState::Connected).await;
        client.disconnect().await;
        client.disconnect().await;

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Arc::new(ChannelClient::new(settings(format!("ws://{}", addr)), specs()));
        client.connect();
        wait_for_state(&client, ConnectionState::Error).await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_delay_is_constant() {
        let client = ChannelClient::new(settings("ws://127.0.0.1:1".to_string()), specs());
        for n in [1, 2, 7] {
            assert_eq!(client.reconnect_delay(n), client.reconnect_delay(n + 5));
        }
        assert_eq!(client.reconnect_delay(1), Duration::from_secs(1));
    }
}

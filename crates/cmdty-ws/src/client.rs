//! Price stream client.
//!
//! A single driver task owns the socket, the reconnect deadline and the
//! heartbeat interval. It feeds every input into [`StreamMachine`] and
//! executes the commands that come back, so there is never more than one
//! socket, one pending reconnect or one heartbeat at a time.

use crate::error::{StreamError, StreamResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::{ClientMessage, ServerMessage};
use crate::price_table::PriceTable;
use crate::rate_limiter::RateLimiter;
use crate::state::{ConnectionState, ReconnectPolicy, StreamCommand, StreamEvent, StreamMachine};
use crate::subscription::SubscriptionSet;
use cmdty_core::{Clock, Notifier};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the transport drops without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL.
    pub url: String,
    pub user_id: Option<String>,
    pub session_id: String,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Attempts before giving up and surfacing an error.
    pub max_reconnect_attempts: u32,
    /// Heartbeat interval while open.
    pub heartbeat_interval_ms: u64,
    /// Pong must arrive within this.
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Outbound control messages per minute.
    pub max_messages_per_minute: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user_id: None,
            session_id: uuid::Uuid::new_v4().to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30000,
            heartbeat_timeout_ms: 10000,
            connect_timeout_ms: 10000,
            max_messages_per_minute: 60,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Observable client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    /// Epoch milliseconds of the scheduled reconnect.
    pub next_retry_at: Option<i64>,
    /// A connect is waiting for the network to return.
    pub parked: bool,
}

impl StreamStatus {
    fn of(machine: &StreamMachine) -> Self {
        Self {
            state: machine.state(),
            attempts: machine.attempts(),
            next_retry_at: machine.next_retry_at(),
            parked: machine.is_parked(),
        }
    }
}

/// Cloneable control surface of a running client.
#[derive(Clone)]
pub struct StreamHandle {
    events: mpsc::Sender<StreamEvent>,
    status: watch::Receiver<StreamStatus>,
}

impl StreamHandle {
    async fn send(&self, event: StreamEvent) -> StreamResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| StreamError::Shutdown)
    }

    pub async fn connect(&self) -> StreamResult<()> {
        self.send(StreamEvent::Connect).await
    }

    /// Manual reconnect. The only way out of the error state.
    pub async fn reconnect(&self) -> StreamResult<()> {
        self.send(StreamEvent::Reconnect).await
    }

    pub async fn disconnect(&self) -> StreamResult<()> {
        self.send(StreamEvent::Disconnect).await
    }

    pub async fn subscribe(&self, symbols: Vec<String>) -> StreamResult<()> {
        self.send(StreamEvent::Subscribe(symbols)).await
    }

    pub async fn unsubscribe(&self, symbols: Vec<String>) -> StreamResult<()> {
        self.send(StreamEvent::Unsubscribe(symbols)).await
    }

    pub async fn set_online(&self, online: bool) -> StreamResult<()> {
        self.send(StreamEvent::NetworkChanged { online }).await
    }

    pub async fn set_entitled(&self, entitled: bool) -> StreamResult<()> {
        self.send(StreamEvent::EntitlementChanged { entitled }).await
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&StreamStatus) -> bool,
    ) -> StreamResult<StreamStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(predicate)
            .await
            .map_err(|_| StreamError::Shutdown)?;
        Ok(*status)
    }
}

/// Running stream client. Dropping it tears the connection down.
pub struct StreamClient {
    handle: StreamHandle,
    prices: Arc<PriceTable>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Spawn the driver task. Nothing connects until `connect` is called or
    /// a subscription is added.
    pub fn spawn(
        config: StreamConfig,
        prices: Arc<PriceTable>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let machine = StreamMachine::new(
            config.reconnect_policy(),
            SubscriptionSet::new(config.user_id.clone(), config.session_id.clone()),
        );
        let (status_tx, status_rx) = watch::channel(StreamStatus::of(&machine));
        let cancel = CancellationToken::new();

        let driver = Driver {
            liveness: HeartbeatMonitor::new(Duration::from_millis(config.heartbeat_timeout_ms)),
            limiter: RateLimiter::per_minute(config.max_messages_per_minute),
            config,
            machine,
            clock,
            socket: None,
            retry: None,
            heartbeat: None,
            prices: Arc::clone(&prices),
            notifier,
            events: events_rx,
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            handle: StreamHandle {
                events: events_tx,
                status: status_rx,
            },
            prices,
            cancel,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn prices(&self) -> &Arc<PriceTable> {
        &self.prices
    }

    pub fn status(&self) -> StreamStatus {
        self.handle.status()
    }

    /// Tear down and wait for the driver to finish sending its Close frame.
    pub async fn shutdown(mut self) {
        info!("Stream client shutdown requested");
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(?e, "Stream driver task failed");
            }
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    config: StreamConfig,
    machine: StreamMachine,
    clock: Arc<dyn Clock>,
    socket: Option<WsStream>,
    retry: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    liveness: HeartbeatMonitor,
    limiter: RateLimiter,
    prices: Arc<PriceTable>,
    notifier: Notifier,
    events: mpsc::Receiver<StreamEvent>,
    status: watch::Sender<StreamStatus>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },

                () = wait_deadline(&mut self.retry) => {
                    self.retry = None;
                    StreamEvent::RetryDue
                }

                () = tick(&mut self.heartbeat) => {
                    if self.liveness.is_timed_out() {
                        error!("Heartbeat timeout");
                        self.socket = None;
                        StreamEvent::SocketClosed {
                            code: ABNORMAL_CLOSURE,
                            reason: "heartbeat timeout".to_string(),
                        }
                    } else {
                        StreamEvent::HeartbeatDue
                    }
                }

                frame = next_frame(&mut self.socket) => match self.on_frame(frame).await {
                    Some(event) => event,
                    None => continue,
                },
            };

            self.dispatch(event).await;
        }

        self.dispatch(StreamEvent::Disconnect).await;
        info!("Stream driver stopped");
    }

    /// Run an event through the machine, executing commands and feeding any
    /// follow-up events back in until quiescent.
    async fn dispatch(&mut self, event: StreamEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let commands = self.machine.handle(event, self.clock.now_ms());
            for command in commands {
                if let Some(follow_up) = self.execute(command).await {
                    queue.push_back(follow_up);
                }
            }
        }
        self.status.send_replace(StreamStatus::of(&self.machine));
    }

    async fn execute(&mut self, command: StreamCommand) -> Option<StreamEvent> {
        match command {
            StreamCommand::OpenSocket => Some(self.open_socket().await),
            StreamCommand::CloseSocket { code } => {
                self.close_socket(code).await;
                None
            }
            StreamCommand::ScheduleRetry { delay } => {
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                None
            }
            StreamCommand::CancelRetry => {
                self.retry = None;
                None
            }
            StreamCommand::StartHeartbeat => {
                let period = Duration::from_millis(self.config.heartbeat_interval_ms);
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.liveness.reset();
                self.heartbeat = Some(interval);
                None
            }
            StreamCommand::StopHeartbeat => {
                self.heartbeat = None;
                None
            }
            StreamCommand::Send(message) => self.send(message).await,
            StreamCommand::NotifyExhausted { attempts } => {
                self.notifier.error(
                    "Live prices unavailable",
                    &format!(
                        "Could not reconnect after {attempts} attempts. Reconnect manually to resume live prices."
                    ),
                );
                None
            }
        }
    }

    async fn open_socket(&mut self) -> StreamEvent {
        info!(url = %self.config.url, "Connecting to price stream");
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let result = tokio::select! {
            r = tokio::time::timeout(
                timeout,
                connect_async_tls_with_config(self.config.url.as_str(), None, true, None),
            ) => r,
            () = self.cancel.cancelled() => {
                return StreamEvent::ConnectFailed("shutdown during handshake".to_string());
            }
        };

        match result {
            Ok(Ok((ws, _response))) => {
                self.socket = Some(ws);
                StreamEvent::Opened
            }
            Ok(Err(e)) => StreamEvent::ConnectFailed(e.to_string()),
            Err(_) => StreamEvent::ConnectFailed("handshake timed out".to_string()),
        }
    }

    async fn close_socket(&mut self, code: u16) {
        let Some(mut ws) = self.socket.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed("client disconnect"),
        };
        if let Err(e) = ws.send(Message::Close(Some(frame))).await {
            warn!(?e, "Failed to send Close frame");
        } else {
            debug!(code, "Sent Close frame");
        }
    }

    async fn send(&mut self, message: ClientMessage) -> Option<StreamEvent> {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(?e, "Failed to encode control message");
                return None;
            }
        };

        tokio::select! {
            () = self.limiter.acquire() => {}
            () = self.cancel.cancelled() => return None,
        }

        let ws = self.socket.as_mut()?;
        if let ClientMessage::Ping { .. } = message {
            self.liveness.record_ping();
        }
        match ws.send(Message::Text(text)).await {
            Ok(()) => {
                debug!(kind = message.kind(), "Sent control message");
                None
            }
            Err(e) => {
                warn!(?e, kind = message.kind(), "Send failed, dropping socket");
                self.socket = None;
                Some(StreamEvent::SocketClosed {
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tungstenite::Error>>,
    ) -> Option<StreamEvent> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.liveness.record_message();
                self.handle_text(&text)
            }
            Some(Ok(Message::Ping(data))) => {
                if let Some(ws) = self.socket.as_mut() {
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        warn!(?e, "Failed to answer ping");
                    }
                }
                None
            }
            Some(Ok(Message::Pong(_))) => {
                self.liveness.record_pong();
                None
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (f.code.into(), f.reason.to_string()))
                    .unwrap_or((ABNORMAL_CLOSURE, "closed without frame".to_string()));
                self.socket = None;
                Some(StreamEvent::SocketClosed { code, reason })
            }
            Some(Err(e)) => {
                error!(?e, "Stream read error");
                self.socket = None;
                Some(StreamEvent::SocketClosed {
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string(),
                })
            }
            None => {
                warn!("Stream ended");
                self.socket = None;
                Some(StreamEvent::SocketClosed {
                    code: ABNORMAL_CLOSURE,
                    reason: "stream ended".to_string(),
                })
            }
            Some(Ok(_)) => None,
        }
    }

    fn handle_text(&self, text: &str) -> Option<StreamEvent> {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %StreamError::Protocol(e.to_string()), "Dropping malformed stream message");
                return None;
            }
        };

        match msg {
            ServerMessage::PriceUpdate { data } => {
                self.prices.apply(data.into_tick());
                None
            }
            ServerMessage::ConnectionStatus { connected, message } => {
                info!(connected, message = message.as_deref().unwrap_or(""), "Server connection status");
                None
            }
            ServerMessage::Pong { .. } => {
                self.liveness.record_pong();
                Some(StreamEvent::Pong)
            }
            ServerMessage::Error { error } => {
                warn!(%error, "Server reported error");
                None
            }
        }
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match socket.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdty_core::{NotificationLevel, SystemClock};

    fn unreachable_config(max_attempts: u32) -> StreamConfig {
        StreamConfig {
            url: "ws://127.0.0.1:1".to_string(),
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 20,
            max_reconnect_attempts: max_attempts,
            connect_timeout_ms: 1000,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 30000);
        assert_eq!(config.max_messages_per_minute, 60);
        assert_eq!(config.reconnect_policy().delay_for(6), Duration::from_millis(30000));
    }

    #[tokio::test]
    async fn test_exhausted_reconnect_notifies_user() {
        let notifier = Notifier::default();
        let mut notifications = notifier.subscribe();
        let client = StreamClient::spawn(
            unreachable_config(2),
            Arc::new(PriceTable::default()),
            notifier,
            Arc::new(SystemClock),
        );
        let handle = client.handle();

        handle.connect().await.unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            handle.wait_for(|s| s.state == ConnectionState::Error),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.attempts, 2);

        let note = notifications.recv().await.unwrap();
        assert_eq!(note.level, NotificationLevel::Error);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let client = StreamClient::spawn(
            unreachable_config(1),
            Arc::new(PriceTable::default()),
            Notifier::default(),
            Arc::new(SystemClock),
        );
        let handle = client.handle();
        client.shutdown().await;

        assert!(matches!(handle.connect().await, Err(StreamError::Shutdown)));
        assert_eq!(handle.status().state, ConnectionState::Closed);
    }
}

//! Connection state machine.
//!
//! `StreamMachine` is pure: it consumes events and returns the commands the
//! driver must execute. It never touches sockets or timers itself, which
//! keeps every transition testable without I/O.

use crate::message::ClientMessage;
use crate::subscription::SubscriptionSet;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Close code for a normal, intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    /// Closed on purpose. No reconnect is scheduled.
    Closed,
    /// Reconnect attempts exhausted. Only a manual reconnect leaves this state.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;

        let exponent = attempt.saturating_sub(1).min(20);
        let delay = base.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(max))
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Explicit connect request.
    Connect,
    /// Manual reconnect. Resets the attempt counter.
    Reconnect,
    /// Explicit disconnect or teardown.
    Disconnect,
    /// Handshake completed.
    Opened,
    /// Handshake failed.
    ConnectFailed(String),
    /// Socket closed by the server or the transport.
    SocketClosed { code: u16, reason: String },
    /// The reconnect deadline elapsed.
    RetryDue,
    NetworkChanged { online: bool },
    EntitlementChanged { entitled: bool },
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    HeartbeatDue,
    /// Server answered a heartbeat.
    Pong,
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    OpenSocket,
    /// Send a Close frame with `code` and drop the socket.
    CloseSocket { code: u16 },
    /// Replace any pending reconnect deadline.
    ScheduleRetry { delay: Duration },
    CancelRetry,
    StartHeartbeat,
    StopHeartbeat,
    Send(ClientMessage),
    /// Raise a user-facing notification.
    NotifyExhausted { attempts: u32 },
}

/// Reconnect state machine for one stream client.
#[derive(Debug, Clone)]
pub struct StreamMachine {
    state: ConnectionState,
    attempts: u32,
    next_retry_at: Option<i64>,
    policy: ReconnectPolicy,
    online: bool,
    entitled: bool,
    /// A connect is wanted but was held back while offline.
    parked: bool,
    subscriptions: SubscriptionSet,
}

impl StreamMachine {
    pub fn new(policy: ReconnectPolicy, subscriptions: SubscriptionSet) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            next_retry_at: None,
            policy,
            online: true,
            entitled: true,
            parked: false,
            subscriptions,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Epoch milliseconds of the scheduled reconnect, if any.
    pub fn next_retry_at(&self) -> Option<i64> {
        self.next_retry_at
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    /// Apply one event at `now_ms` and return the commands to execute, in order.
    pub fn handle(&mut self, event: StreamEvent, now_ms: i64) -> Vec<StreamCommand> {
        let from = self.state;
        let commands = match event {
            StreamEvent::Connect => match self.state {
                ConnectionState::Disconnected | ConnectionState::Closed => self.request_connect(),
                _ => Vec::new(),
            },
            StreamEvent::Reconnect => match self.state {
                ConnectionState::Connecting | ConnectionState::Open => Vec::new(),
                _ => {
                    self.attempts = 0;
                    self.request_connect()
                }
            },
            StreamEvent::Disconnect => self.close(),
            StreamEvent::Opened => self.on_opened(),
            StreamEvent::ConnectFailed(reason) => {
                if self.state != ConnectionState::Connecting {
                    Vec::new()
                } else {
                    warn!(%reason, attempts = self.attempts, "Stream handshake failed");
                    self.schedule_retry(now_ms)
                }
            }
            StreamEvent::SocketClosed { code, reason } => self.on_socket_closed(code, &reason, now_ms),
            StreamEvent::RetryDue => {
                if self.state != ConnectionState::Reconnecting {
                    Vec::new()
                } else if !self.online {
                    debug!(attempts = self.attempts, "Offline, parking reconnect");
                    self.parked = true;
                    self.next_retry_at = None;
                    Vec::new()
                } else {
                    self.next_retry_at = None;
                    self.begin_connect()
                }
            }
            StreamEvent::NetworkChanged { online } => {
                self.online = online;
                if online && self.parked && self.entitled {
                    info!("Network restored, resuming parked connect");
                    self.parked = false;
                    self.begin_connect()
                } else {
                    Vec::new()
                }
            }
            StreamEvent::EntitlementChanged { entitled } => {
                self.entitled = entitled;
                if entitled {
                    self.maybe_auto_connect()
                } else {
                    match self.state {
                        ConnectionState::Connecting
                        | ConnectionState::Open
                        | ConnectionState::Reconnecting => {
                            info!("Entitlement revoked, closing stream");
                            self.close()
                        }
                        _ => {
                            self.parked = false;
                            Vec::new()
                        }
                    }
                }
            }
            StreamEvent::Subscribe(symbols) => match self.subscriptions.add(&symbols) {
                Some(message) => {
                    let mut commands = self.send_or_buffer(message);
                    commands.extend(self.maybe_auto_connect());
                    commands
                }
                None => Vec::new(),
            },
            StreamEvent::Unsubscribe(symbols) => match self.subscriptions.remove(&symbols) {
                Some(message) => self.send_or_buffer(message),
                None => Vec::new(),
            },
            StreamEvent::HeartbeatDue => {
                if self.state == ConnectionState::Open {
                    vec![StreamCommand::Send(ClientMessage::Ping { timestamp: now_ms })]
                } else {
                    Vec::new()
                }
            }
            // Liveness only; never touches the backoff counter.
            StreamEvent::Pong => Vec::new(),
        };

        if from != self.state {
            debug!(from = %from, to = %self.state, attempts = self.attempts, "Stream state transition");
        }
        commands
    }

    fn request_connect(&mut self) -> Vec<StreamCommand> {
        if !self.entitled {
            debug!("Not entitled to live prices, connect ignored");
            return Vec::new();
        }
        if !self.online {
            debug!("Offline, parking connect");
            self.parked = true;
            return Vec::new();
        }
        self.begin_connect()
    }

    fn maybe_auto_connect(&mut self) -> Vec<StreamCommand> {
        let idle = matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Closed
        );
        if idle && !self.subscriptions.is_empty() {
            self.request_connect()
        } else {
            Vec::new()
        }
    }

    fn begin_connect(&mut self) -> Vec<StreamCommand> {
        self.state = ConnectionState::Connecting;
        self.parked = false;
        self.next_retry_at = None;
        vec![StreamCommand::CancelRetry, StreamCommand::OpenSocket]
    }

    fn on_opened(&mut self) -> Vec<StreamCommand> {
        if self.state != ConnectionState::Connecting {
            // Torn down while the handshake was in flight.
            return vec![StreamCommand::CloseSocket {
                code: NORMAL_CLOSURE,
            }];
        }

        self.state = ConnectionState::Open;
        self.attempts = 0;
        self.next_retry_at = None;
        info!("Stream open");

        let mut commands = vec![StreamCommand::StartHeartbeat];
        commands.extend(
            self.subscriptions
                .drain_buffer()
                .into_iter()
                .map(StreamCommand::Send),
        );
        commands
    }

    fn on_socket_closed(&mut self, code: u16, reason: &str, now_ms: i64) -> Vec<StreamCommand> {
        let was_open = self.state == ConnectionState::Open;
        if !matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            return Vec::new();
        }
        if was_open {
            self.subscriptions.reset_buffer_to_full_set();
        }

        if code == NORMAL_CLOSURE {
            info!(%reason, "Stream closed normally by server");
            self.state = ConnectionState::Closed;
            self.next_retry_at = None;
            return vec![StreamCommand::StopHeartbeat, StreamCommand::CancelRetry];
        }

        warn!(code, %reason, "Stream closed abnormally");
        let mut commands = vec![StreamCommand::StopHeartbeat];
        commands.extend(self.schedule_retry(now_ms));
        commands
    }

    fn schedule_retry(&mut self, now_ms: i64) -> Vec<StreamCommand> {
        if self.attempts >= self.policy.max_attempts {
            error!(attempts = self.attempts, "Stream reconnect attempts exhausted");
            self.state = ConnectionState::Error;
            self.next_retry_at = None;
            return vec![
                StreamCommand::CancelRetry,
                StreamCommand::NotifyExhausted {
                    attempts: self.attempts,
                },
            ];
        }

        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        self.state = ConnectionState::Reconnecting;
        self.next_retry_at = Some(now_ms + delay.as_millis() as i64);
        info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        vec![StreamCommand::ScheduleRetry { delay }]
    }

    fn close(&mut self) -> Vec<StreamCommand> {
        let had_socket = matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        );
        if self.state == ConnectionState::Open {
            self.subscriptions.reset_buffer_to_full_set();
        }
        self.state = ConnectionState::Closed;
        self.next_retry_at = None;
        self.parked = false;

        let mut commands = vec![StreamCommand::CancelRetry, StreamCommand::StopHeartbeat];
        if had_socket {
            commands.push(StreamCommand::CloseSocket {
                code: NORMAL_CLOSURE,
            });
        }
        commands
    }

    fn send_or_buffer(&mut self, message: ClientMessage) -> Vec<StreamCommand> {
        if self.state == ConnectionState::Open {
            vec![StreamCommand::Send(message)]
        } else {
            self.subscriptions.buffer(message);
            Vec::new()
        }
    }
}

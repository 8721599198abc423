//! Mock price stream server for integration tests.
//!
//! Provides a WebSocket server that:
//! - Accepts connections
//! - Answers `subscribe` with one `price_update` per commodity
//! - Answers `ping` with `pong`
//! - Records received messages and close codes

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Default)]
struct Recorded {
    messages: VecDeque<String>,
    connections: u32,
    close_codes: Vec<u16>,
}

/// A mock WebSocket price server.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    kick_tx: broadcast::Sender<u16>,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockWsServer {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (kick_tx, _) = broadcast::channel::<u16>(4);

        let recorded_clone = recorded.clone();
        let kick_clone = kick_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            recorded_clone.clone(),
                            kick_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            kick_tx,
            recorded,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        self.recorded.lock().await.connections
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.recorded.lock().await.messages.iter().cloned().collect()
    }

    /// Received messages of the given `type`.
    pub async fn received_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.received_messages()
            .await
            .iter()
            .filter_map(|m| serde_json::from_str::<serde_json::Value>(m).ok())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    /// Close codes sent by clients.
    pub async fn close_codes(&self) -> Vec<u16> {
        self.recorded.lock().await.close_codes.clone()
    }

    /// Close every open connection with `code`.
    pub fn kick(&self, code: u16) {
        let _ = self.kick_tx.send(code);
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn price_update(symbol: &str) -> String {
    serde_json::json!({
        "type": "price_update",
        "data": {
            "symbol": symbol,
            "price": "2001.50",
            "bid": "2001.25",
            "ask": "2001.75",
            "lastUpdate": "2024-05-01T12:00:00Z"
        }
    })
    .to_string()
}

async fn handle_connection(
    stream: TcpStream,
    recorded: Arc<Mutex<Recorded>>,
    mut kick: broadcast::Receiver<u16>,
) {
    recorded.lock().await.connections += 1;

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        let msg = tokio::select! {
            msg = read.next() => msg,
            Ok(code) = kick.recv() => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: "kicked".into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                break;
            }
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                recorded.lock().await.messages.push_back(text.clone());

                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                match parsed["type"].as_str() {
                    Some("subscribe") => {
                        let symbols = parsed["commodities"].as_array().cloned().unwrap_or_default();
                        for symbol in symbols.iter().filter_map(|s| s.as_str()) {
                            let _ = write.send(Message::Text(price_update(symbol))).await;
                        }
                    }
                    Some("ping") => {
                        let pong = serde_json::json!({
                            "type": "pong",
                            "timestamp": parsed["timestamp"]
                        });
                        let _ = write.send(Message::Text(pong.to_string())).await;
                    }
                    _ => {}
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                recorded.lock().await.close_codes.push(code);
                break;
            }
            Some(Err(_)) | None => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockWsServer::start().await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        server.shutdown().await;
    }
}

#![allow(dead_code)]

use std::time::Duration;

use accordbot::client::ReplySink;
use accordbot::error::Result;
use accordbot::gateway::GatewayConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const TOKEN: &str = "test-bot-token";

/// Which protocol's heartbeats the fake server answers automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Gateway,
    Voice,
}

/// In-process websocket server. Each accepted connection is handed to the
/// test to script.
pub struct FakeServer {
    pub url: String,
    protocol: Protocol,
    connections: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl FakeServer {
    pub async fn start(protocol: Protocol) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            url: format!("ws://127.0.0.1:{}", addr.port()),
            protocol,
            connections: rx,
        }
    }

    /// Waits indefinitely; `None` once the listener stops.
    pub async fn next_connection(&mut self) -> Option<FakeConnection> {
        let ws = self.connections.recv().await?;
        Some(FakeConnection {
            ws,
            protocol: self.protocol,
            auto_ack: true,
        })
    }

    pub async fn accept(&mut self) -> FakeConnection {
        let ws = tokio::time::timeout(TEST_TIMEOUT, self.connections.recv())
            .await
            .expect("client did not connect in time")
            .expect("listener stopped");
        FakeConnection {
            ws,
            protocol: self.protocol,
            auto_ack: true,
        }
    }
}

pub struct FakeConnection {
    ws: WebSocketStream<TcpStream>,
    protocol: Protocol,
    auto_ack: bool,
}

impl FakeConnection {
    /// Stop answering heartbeats; `recv` hands them to the test instead.
    pub fn withhold_acks(&mut self) {
        self.auto_ack = false;
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    pub async fn hello(&mut self, interval_ms: u64) {
        match self.protocol {
            Protocol::Gateway => {
                self.send_json(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}))
                    .await
            }
            Protocol::Voice => {
                self.send_json(json!({"op": 8, "d": {"heartbeat_interval": interval_ms as f64}}))
                    .await
            }
        }
    }

    pub async fn dispatch(&mut self, seq: u64, name: &str, d: Value) {
        self.send_json(json!({"op": 0, "s": seq, "t": name, "d": d}))
            .await;
    }

    pub async fn ready(&mut self, seq: u64, session_id: &str, resume_url: &str) {
        self.dispatch(
            seq,
            "READY",
            json!({
                "v": 10,
                "session_id": session_id,
                "resume_gateway_url": resume_url,
                "user": {"id": "100", "username": "accordbot", "bot": true},
                "guilds": []
            }),
        )
        .await;
    }

    pub async fn close(&mut self, code: u16) {
        let _ = self
            .ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })))
            .await;
    }

    /// Next JSON frame from the client, answering heartbeats on the way.
    /// `None` once the client closes.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let msg = tokio::time::timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("client went quiet")?;
            let text = match msg {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            };
            let value: Value = serde_json::from_str(&text).unwrap();
            if !self.auto_ack {
                return Some(value);
            }
            match (self.protocol, value["op"].as_u64()) {
                (Protocol::Gateway, Some(1)) => self.send_json(json!({"op": 11})).await,
                (Protocol::Voice, Some(3)) => {
                    let nonce = value["d"].clone();
                    self.send_json(json!({"op": 6, "d": nonce})).await
                }
                _ => return Some(value),
            }
        }
    }

    /// Skip frames until one with opcode `op`.
    pub async fn recv_op(&mut self, op: u64) -> Value {
        loop {
            let value = self.recv().await.expect("client closed before expected frame");
            if value["op"].as_u64() == Some(op) {
                return value;
            }
        }
    }

    /// Close code the client sent, if it closed.
    pub async fn recv_close(&mut self) -> Option<u16> {
        loop {
            let msg = tokio::time::timeout(TEST_TIMEOUT, self.ws.next()).await.ok()??;
            match msg {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Reply sink for tests that never look at replies.
pub struct NullSink;

#[async_trait]
impl ReplySink for NullSink {
    async fn reply(&self, _channel_id: &str, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_message(&self, _channel_id: &str, _message_id: &str) -> Result<()> {
        Ok(())
    }
}

pub fn gateway_config(url: &str) -> GatewayConfig {
    GatewayConfig {
        url: url.to_string(),
        token: TOKEN.to_string(),
        intents: accordbot::gateway::intents::DEFAULT,
        shard_id: 0,
        shard_count: 1,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        malformed_frame_limit: 2,
    }
}

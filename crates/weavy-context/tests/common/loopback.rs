//! A local websocket hub speaking the JSON hub protocol.
//!
//! Answers the handshake, completes invocations (the topic `silent` never gets
//! a completion, `denied` gets an error) and records every client record.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use url::Url;

const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Default)]
struct LoopbackState {
    records: Mutex<Vec<Value>>,
    tokens: Mutex<Vec<String>>,
    paths: Mutex<Vec<String>>,
    connections: AtomicUsize,
    rejected_token: Mutex<Option<String>>,
    live: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

#[derive(Clone)]
pub struct LoopbackHub {
    addr: SocketAddr,
    state: Arc<LoopbackState>,
}

fn frame(record: Value) -> Message {
    let mut text = record.to_string();
    text.push(RECORD_SEPARATOR);
    Message::text(text)
}

impl LoopbackHub {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(LoopbackState::default());
        tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(state.clone(), stream));
                }
            }
        });
        Self { addr, state }
    }

    /// Hub url as the context would build it.
    pub fn url(&self) -> Url {
        format!("http://{}/hubs/rtm", self.addr).parse().unwrap()
    }

    /// Upgrades carrying `token` are refused with 401.
    pub fn reject_token(&self, token: &str) {
        *self.state.rejected_token.lock().unwrap() = Some(token.to_string());
    }

    /// Completed websocket upgrades.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// `access_token` of every upgrade request, refused ones included.
    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.paths.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<Value> {
        self.state.records.lock().unwrap().clone()
    }

    pub fn handshakes(&self) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| record.get("protocol").is_some())
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.records()
            .iter()
            .filter(|record| record["type"] == 6)
            .count()
    }

    /// Arguments of every invocation of `target`.
    pub fn invocations(&self, target: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| record["type"] == 1 && record["target"] == target)
            .map(|record| record["arguments"].clone())
            .collect()
    }

    /// Sends a server push to the connected client.
    pub fn push(&self, target: &str, payload: Value) {
        self.send(frame(json!({
            "type": 1,
            "target": target,
            "arguments": [payload],
        })));
    }

    /// Closes the live socket from the server side.
    pub fn drop_connection(&self) {
        self.send(Message::Close(None));
    }

    fn send(&self, message: Message) {
        if let Some(live) = self.state.live.lock().unwrap().as_ref() {
            let _ = live.send(message);
        }
    }
}

async fn serve(state: Arc<LoopbackState>, stream: TcpStream) {
    let callback = {
        let state = state.clone();
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            state
                .paths
                .lock()
                .unwrap()
                .push(request.uri().path().to_string());
            let token = url::form_urlencoded::parse(request.uri().query().unwrap_or("").as_bytes())
                .find(|(key, _)| key == "access_token")
                .map(|(_, value)| value.into_owned());
            if let Some(token) = &token {
                state.tokens.lock().unwrap().push(token.clone());
            }
            if token.is_some() && token == *state.rejected_token.lock().unwrap() {
                let mut refused = ErrorResponse::new(Some("invalid token".to_string()));
                *refused.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(refused);
            }
            Ok(response)
        }
    };
    let Ok(socket) = accept_hdr_async(stream, callback).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.live.lock().unwrap() = Some(tx.clone());
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if write.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = read.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        for record in text
            .as_str()
            .split(RECORD_SEPARATOR)
            .filter(|record| !record.trim().is_empty())
        {
            let Ok(record) = serde_json::from_str::<Value>(record) else {
                continue;
            };
            state.records.lock().unwrap().push(record.clone());

            if record.get("protocol").is_some() {
                let _ = tx.send(frame(json!({})));
                continue;
            }
            let Some(id) = record.get("invocationId").and_then(Value::as_str) else {
                continue;
            };
            match record["arguments"][0].as_str() {
                Some("silent") => {}
                Some("denied") => {
                    let _ = tx.send(frame(json!({
                        "type": 3,
                        "invocationId": id,
                        "error": "not allowed",
                    })));
                }
                _ => {
                    let _ = tx.send(frame(json!({ "type": 3, "invocationId": id })));
                }
            }
        }
    }
    writer.abort();
}

//! Fake tool-execution peer speaking the bridge protocol.
//!
//! Hosts one running server `fs` (tools `read_file`, `delete_file`) and one
//! stopped server. Tool names drive behavior:
//! `slow` is answered after the next answered frame, `hang` never is,
//! `fail` returns a tool error, `hangup` drops the connection and `shutdown`
//! drops it and stops listening. Anything else echoes its call back.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

pub const SECRET: &str = "s3cret";

pub struct Peer {
    pub url: String,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl Peer {
    /// `call_tool` frames received so far.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the tools called so far, in order.
    pub fn called_tools(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c["toolName"].as_str().map(str::to_string))
            .collect()
    }
}

enum Reply {
    Send(Vec<Value>),
    Hold,
    Hangup,
    Shutdown,
}

fn tool_result(frame: &Value) -> Value {
    json!({
        "type": "tool_result",
        "requestId": frame["requestId"],
        "result": {"tool": frame["toolName"], "arguments": frame["arguments"]},
    })
}

fn respond(frame: &Value) -> Reply {
    let request_id = frame["requestId"].clone();
    match frame["type"].as_str() {
        Some("discover") => Reply::Send(vec![json!({
            "type": "servers",
            "requestId": request_id,
            "servers": [
                {"id": "fs", "name": "Filesystem", "status": "running"},
                {"id": "old", "name": "Retired", "status": "stopped"},
            ],
        })]),
        Some("list_tools") => Reply::Send(vec![json!({
            "type": "tools_list",
            "requestId": request_id,
            "tools": [
                {"name": "read_file", "description": "Read a file"},
                {"name": "delete_file", "description": "Delete a file"},
            ],
        })]),
        Some("call_tool") => match frame["toolName"].as_str() {
            Some("slow") => Reply::Hold,
            Some("hang") => Reply::Send(vec![]),
            Some("fail") => Reply::Send(vec![json!({
                "type": "tool_error",
                "requestId": request_id,
                "error": "disk full",
            })]),
            Some("hangup") => Reply::Hangup,
            Some("shutdown") => Reply::Shutdown,
            _ => Reply::Send(vec![tool_result(frame)]),
        },
        _ => Reply::Send(vec![json!({
            "type": "echo",
            "requestId": request_id,
            "payload": frame,
        })]),
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    let _ = ws.send(Message::text(frame.to_string())).await;
}

async fn serve(mut ws: WebSocketStream<TcpStream>, calls: &Mutex<Vec<Value>>, stop: &Notify) {
    let mut held = Vec::new();

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        if frame["type"] == "auth" {
            let ok = frame["payload"]["secret"] == SECRET;
            send(
                &mut ws,
                json!({
                    "type": "response",
                    "id": frame["id"],
                    "data": {"success": ok, "message": if ok { "welcome" } else { "bad secret" }},
                }),
            )
            .await;
            if !ok {
                let _ = ws.close(None).await;
                return;
            }
            continue;
        }

        if frame["type"] == "call_tool" {
            calls.lock().unwrap().push(frame.clone());
        }

        match respond(&frame) {
            Reply::Send(replies) => {
                for reply in replies {
                    send(&mut ws, reply).await;
                }
                for frame in held.drain(..) {
                    send(&mut ws, tool_result(&frame)).await;
                }
            }
            Reply::Hold => held.push(frame),
            Reply::Hangup => {
                let _ = ws.close(None).await;
                return;
            }
            Reply::Shutdown => {
                stop.notify_one();
                let _ = ws.close(None).await;
                return;
            }
        }
    }
}

/// Listen on an ephemeral local port, one task per connection.
pub async fn spawn_peer() -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(Notify::new());

    let recorded = Arc::clone(&calls);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else {
                        break;
                    };
                    let calls = Arc::clone(&recorded);
                    let stop = Arc::clone(&stop);
                    tokio::spawn(async move {
                        if let Ok(ws) = accept_async(stream).await {
                            serve(ws, &calls, &stop).await;
                        }
                    });
                }
                _ = stop.notified() => break,
            }
        }
    });

    Peer { url, calls }
}

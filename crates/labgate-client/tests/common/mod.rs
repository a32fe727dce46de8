#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use labgate_client::Engine;
use labgate_client::config::{ChannelConfig, SyncConfig};
use labgate_client::error::HttpError;
use labgate_client::notify::NoticeLog;
use labgate_client::transport::{HttpClient, Query};

/// One request seen by [`ScriptedHttp`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// [`HttpClient`] that answers from a per-route script.
///
/// Routes are `"METHOD path"`. Unscripted routes answer 404. A route can
/// be held behind a gate so tests control when its response arrives.
#[derive(Default)]
pub struct ScriptedHttp {
    script: RefCell<HashMap<String, VecDeque<Result<Value, HttpError>>>>,
    gates: RefCell<HashMap<String, Rc<Notify>>>,
    requests: RefCell<Vec<Recorded>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `route`. Responses are used in order; the last
    /// one is repeated once the queue would run dry.
    pub fn respond(&self, route: &str, response: Result<Value, HttpError>) -> &Self {
        self.script
            .borrow_mut()
            .entry(route.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn ok(&self, route: &str, body: Value) -> &Self {
        self.respond(route, Ok(body))
    }

    pub fn status(&self, route: &str, status: u16, message: Option<&str>) -> &Self {
        self.respond(
            route,
            Err(HttpError::Status {
                status,
                message: message.map(str::to_string),
            }),
        )
    }

    /// Hold responses for `route` until the returned handle is notified.
    pub fn gate(&self, route: &str) -> Rc<Notify> {
        let notify = Rc::new(Notify::new());
        self.gates
            .borrow_mut()
            .insert(route.to_string(), Rc::clone(&notify));
        notify
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.borrow().clone()
    }

    pub fn count(&self, route: &str) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| format!("{} {}", r.method, r.path) == route)
            .count()
    }

    async fn answer(
        &self,
        method: &'static str,
        path: &str,
        query: &Query,
        body: Option<&Value>,
    ) -> Result<Value, HttpError> {
        self.requests.borrow_mut().push(Recorded {
            method,
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            body: body.cloned(),
        });

        let route = format!("{method} {path}");
        let gate = self.gates.borrow().get(&route).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut script = self.script.borrow_mut();
        match script.get_mut(&route) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue.front().cloned().unwrap(),
            _ => Err(HttpError::Status {
                status: 404,
                message: Some(format!("no script for {route}")),
            }),
        }
    }
}

impl HttpClient for ScriptedHttp {
    async fn get(&self, path: &str, query: &Query) -> Result<Value, HttpError> {
        self.answer("GET", path, query, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, HttpError> {
        self.answer("POST", path, &[], Some(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value, HttpError> {
        self.answer("PUT", path, &[], Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value, HttpError> {
        self.answer("DELETE", path, &[], None).await
    }
}

/// An engine over a fresh [`ScriptedHttp`], with notices collected in a
/// [`NoticeLog`].
pub fn scripted_engine(config: SyncConfig) -> (Engine<ScriptedHttp>, Rc<ScriptedHttp>, Rc<NoticeLog>) {
    let http = Rc::new(ScriptedHttp::new());
    let notices = Rc::new(NoticeLog::default());
    let engine = Engine::new(Rc::clone(&http), config, Rc::clone(&notices) as _);
    (engine, http, notices)
}

/// A stub lab API served by axum on an ephemeral port.
pub struct StubApi {
    pub addr: SocketAddr,
    _server: tokio::task::JoinHandle<()>,
}

impl StubApi {
    pub async fn start(router: axum::Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;
        Self {
            addr,
            _server: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }
}

/// A stub Reverb server. Each accepted websocket is handed to the handler
/// together with its 1-based connection number.
pub struct StubReverb {
    pub addr: SocketAddr,
    _server: tokio::task::JoinHandle<()>,
}

impl StubReverb {
    pub async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(usize, WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut connections = 0;
            while let Ok((stream, _)) = listener.accept().await {
                connections += 1;
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    tokio::spawn(handler(connections, ws));
                }
            }
        });
        Self {
            addr,
            _server: handle,
        }
    }

    /// Channel config pointing at this server, reconnecting immediately.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: format!("ws://{}", self.addr),
            reconnect_delay_secs: 0,
            ..ChannelConfig::default()
        }
    }
}

/// Send a protocol frame. `data` goes out JSON-encoded in a string, the way
/// Pusher servers send it.
pub async fn send_frame(
    ws: &mut WebSocketStream<TcpStream>,
    event: &str,
    channel: Option<&str>,
    data: Value,
) {
    let mut frame = json!({ "event": event, "data": data.to_string() });
    if let Some(channel) = channel {
        frame["channel"] = json!(channel);
    }
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Send `pusher:connection_established` with the given socket id.
pub async fn establish(ws: &mut WebSocketStream<TcpStream>, socket_id: &str) {
    send_frame(
        ws,
        "pusher:connection_established",
        None,
        json!({ "socket_id": socket_id, "activity_timeout": 30 }),
    )
    .await;
}

/// Next text frame from the client, decoded. `None` once the client is gone.
pub async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

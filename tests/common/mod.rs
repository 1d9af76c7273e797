//! A served router plus socket client helpers for the end-to-end tests.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use roomchat::{
    app,
    auth::Keys,
    db,
    fabric::{BroadcastFabric, InProcessFabric},
    AppState, GatewaySettings,
};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::header::AUTHORIZATION, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serves the full router on an ephemeral port over a throwaway SQLite file.
pub async fn serve() -> (SocketAddr, AppState) {
    let name = format!("roomchat-gateway-{}.db", Uuid::now_v7().simple());
    let path = std::env::temp_dir().join(name);
    let db_pool = db::connect(&format!("sqlite://{}", path.display()), 4).await.unwrap();
    db::migrate(&db_pool).await.unwrap();

    let state = AppState {
        db_pool,
        keys: Keys::new(b"gateway-test-secret"),
        fabric: Arc::new(InProcessFabric::new()),
        gateway: GatewaySettings { handshake_timeout: Duration::from_secs(5) },
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move { axum::serve(listener, router).await });
    (addr, state)
}

pub async fn connect(
    addr: SocketAddr,
    query: &str,
    token: Option<&str>,
) -> Result<Client, tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws?{query}").into_client_request()?;
    if let Some(token) = token {
        let bearer = format!("Bearer {token}").parse().unwrap();
        request.headers_mut().insert(AUTHORIZATION, bearer);
    }
    connect_async(request).await.map(|(client, _)| client)
}

/// Connects `user_id` with a fresh token, expecting the handshake to succeed.
pub async fn join(addr: SocketAddr, state: &AppState, user_id: Uuid, query: &str) -> Client {
    let token = state.keys.issue(user_id, 60).unwrap();
    connect(addr, query, Some(&token)).await.unwrap()
}

/// Waits for the server side of freshly upgraded sockets to subscribe.
pub async fn wait_for_subscribers(state: &AppState, room_id: Uuid, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while state.fabric.local_subscribers(room_id) != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {expected} subscribers on {room_id}"));
}

pub async fn next_frame(client: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
            return frame;
        }
    }
}

pub async fn next_json(client: &mut Client) -> Value {
    let frame = next_frame(client).await;
    serde_json::from_str(frame.to_text().unwrap()).unwrap()
}

pub async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

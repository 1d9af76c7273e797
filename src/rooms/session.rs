use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::ws::{CloseFrame, Message, WebSocket},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    auth::Principal,
    fabric::{BroadcastFabric, Envelope, Subscription},
    rooms::msg::{self, InboundMessage, OutboundMessage, SubmitError},
    AppState,
};

/// Close code sent when the sender's credential stops validating mid-session.
pub const UNAUTHENTICATED_CLOSE_CODE: u16 = 4000;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Admitted,
    Active,
    Closed,
}

/// One admitted connection bound to one room.
///
/// The room's subscription lives exactly as long as the session is active;
/// closing (or dropping) the session releases it once.
pub struct Session {
    principal: Principal,
    room_id: Uuid,
    state: SessionState,
    subscription: Option<Subscription>,
}

impl Session {
    pub fn admitted(principal: Principal, room_id: Uuid) -> Session {
        Session { principal, room_id, state: SessionState::Admitted, subscription: None }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Subscribes to the room and hands back the delivery side. Only an
    /// admitted session can be activated.
    pub fn activate(
        &mut self,
        fabric: Arc<dyn BroadcastFabric>,
    ) -> Option<mpsc::UnboundedReceiver<Arc<Envelope>>> {
        if self.state != SessionState::Admitted {
            return None;
        }
        let mut subscription = Subscription::open(fabric, self.room_id);
        let deliveries = subscription.take_receiver();
        self.subscription = Some(subscription);
        self.state = SessionState::Active;
        deliveries
    }

    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drives an upgraded socket until either side goes away.
pub async fn run(socket: WebSocket, session: Session, state: AppState) {
    let span = info_span!(
        "session",
        user_id = %session.principal.user_id,
        room_id = %session.room_id,
    );
    drive(socket, session, state).instrument(span).await
}

async fn drive(socket: WebSocket, mut session: Session, state: AppState) {
    let Some(deliveries) = session.activate(state.fabric.clone()) else {
        return;
    };
    info!("session active");

    let (sink, stream) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

    let mut writer = tokio::spawn(write_frames(sink, outbound_rx).in_current_span());
    let mut delivery =
        tokio::spawn(forward_deliveries(deliveries, outbound.clone()).in_current_span());
    let mut reader = tokio::spawn(
        read_frames(
            stream,
            outbound,
            state.db_pool.clone(),
            state.fabric.clone(),
            session.principal.clone(),
            session.room_id,
        )
        .in_current_span(),
    );

    let writer_done = tokio::select! {
        _ = &mut reader => false,
        _ = &mut delivery => false,
        _ = &mut writer => true,
    };

    session.close();
    reader.abort();
    delivery.abort();
    // The writer finishes once every outbound sender is gone, flushing a
    // pending close frame first. A finished handle must not be polled again.
    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!("session closed");
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "socket write failed");
            return;
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}

async fn forward_deliveries(
    mut deliveries: mpsc::UnboundedReceiver<Arc<Envelope>>,
    outbound: mpsc::Sender<Message>,
) {
    while let Some(envelope) = deliveries.recv().await {
        let frame = match serde_json::to_string(&OutboundMessage::from(envelope.as_ref())) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode delivery");
                continue;
            }
        };
        if outbound.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    outbound: mpsc::Sender<Message>,
    db_pool: SqlitePool,
    fabric: Arc<dyn BroadcastFabric>,
    principal: Principal,
    room_id: Uuid,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "socket read failed");
                break;
            }
        };

        let inbound = match frame {
            Message::Text(text) => serde_json::from_str::<InboundMessage>(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice::<InboundMessage>(&bytes),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let Ok(inbound) = inbound else {
            debug!("ignoring undecodable frame");
            continue;
        };

        match msg::submit(&db_pool, fabric.as_ref(), &principal, room_id, inbound).await {
            Ok(_) => {}
            Err(SubmitError::Unauthenticated(e)) => {
                warn!(error = %e, "credential no longer valid, closing session");
                let close = CloseFrame {
                    code: UNAUTHENTICATED_CLOSE_CODE,
                    reason: "unauthenticated".into(),
                };
                let _ = outbound.send(Message::Close(Some(close))).await;
                break;
            }
            Err(e) => warn!(error = %e, "message not delivered"),
        }
    }
}

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

mod protocol;
mod state;

use protocol::{LeadershipChange, Message, Topic, SERVER_ORIGIN};
use state::{LeaveOutcome, RoomError, ServerState};

type ClientSender = mpsc::UnboundedSender<Message>;
type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

#[derive(Clone)]
struct AppState {
    server_state: ServerState,
    client_senders: ClientSenders,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_server=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3005);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app_state = AppState {
        server_state: ServerState::new(),
        client_senders: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Lockstep relay listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let server_state = state.server_state.clone();
    let client_senders = state.client_senders.clone();
    let client_id = Uuid::new_v4();
    server_state.add_client(client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    client_senders.write().await.insert(client_id, tx.clone());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) =
                    handle_message(&text, client_id, &server_state, &client_senders).await
                {
                    tracing::warn!("Rejected message from {}: {}", client_id, e);
                    let _ = tx.send(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    client_senders.write().await.remove(&client_id);
    if let Some(outcome) = server_state.remove_client(client_id).await {
        after_leave(&server_state, &client_senders, outcome).await;
    }
    send_task.abort();
}

async fn handle_message(
    text: &str,
    client_id: Uuid,
    state: &ServerState,
    client_senders: &ClientSenders,
) -> anyhow::Result<()> {
    let msg: Message = serde_json::from_str(text)?;

    match msg {
        Message::CreateRoom { media_url } => {
            leave_current_room(state, client_senders, client_id).await;
            let room_id = state.create_room(client_id, media_url.clone())?;
            send_to(
                client_senders,
                client_id,
                Message::RoomCreated {
                    room_id: room_id.clone(),
                    client_id,
                    media_url,
                },
            )
            .await;
            broadcast_member_count(state, client_senders, &room_id).await;
        }

        Message::JoinRoom { room_id } => {
            if state.room_of(client_id).as_deref() != Some(room_id.as_str()) {
                leave_current_room(state, client_senders, client_id).await;
            }
            let response = match state.join_room(client_id, &room_id).await {
                Ok(outcome) => Message::RoomJoined {
                    room_id: room_id.clone(),
                    client_id,
                    is_leader: outcome.is_leader,
                    media_url: outcome.media_url,
                },
                Err(RoomError::NotFound) => Message::RoomNotFound,
                Err(e) => Message::Error {
                    message: e.to_string(),
                },
            };
            send_to(client_senders, client_id, response).await;
            broadcast_member_count(state, client_senders, &room_id).await;
        }

        Message::LeaveRoom => {
            leave_current_room(state, client_senders, client_id).await;
            send_to(client_senders, client_id, Message::RoomLeft).await;
        }

        Message::HandOff { new_leader_id } => {
            let room_id = state.hand_off(client_id, new_leader_id).await?;
            announce_leader(state, client_senders, &room_id, new_leader_id).await;
        }

        Message::SelectMedia { media_url } => {
            let room_id = state.select_media(client_id, media_url.clone())?;
            let members = state.get_room_members(&room_id).await;
            let senders = client_senders.read().await;
            for member_id in members {
                if let Some(tx) = senders.get(&member_id) {
                    let _ = tx.send(Message::MediaChanged {
                        room_id: room_id.clone(),
                        media_url: media_url.clone(),
                    });
                }
            }
        }

        Message::Subscribe { topic } => {
            state.subscribe(client_id, &topic)?;
        }

        Message::Unsubscribe { topic } => {
            state.unsubscribe(client_id, &topic);
        }

        Message::Publish { topic, payload } => {
            let topic = state.authorize_publish(client_id, &topic)?;
            deliver(state, client_senders, &topic, &client_id.to_string(), payload).await;
        }

        _ => {
            tracing::warn!("Unexpected message from client: {:?}", msg);
        }
    }

    Ok(())
}

async fn send_to(client_senders: &ClientSenders, client_id: Uuid, msg: Message) {
    if let Some(tx) = client_senders.read().await.get(&client_id) {
        let _ = tx.send(msg);
    }
}

/// Route a payload to every subscriber of `topic`, stamped with its publisher.
async fn deliver(
    state: &ServerState,
    client_senders: &ClientSenders,
    topic: &Topic,
    from: &str,
    payload: serde_json::Value,
) {
    let subscribers = state.subscribers(topic);
    let senders = client_senders.read().await;

    tracing::debug!(
        "Delivering {} from {} to {} subscriber(s)",
        topic,
        from,
        subscribers.len()
    );

    let topic = topic.to_string();
    for subscriber in subscribers {
        if let Some(tx) = senders.get(&subscriber) {
            let _ = tx.send(Message::Delivery {
                topic: topic.clone(),
                from: from.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

async fn announce_leader(
    state: &ServerState,
    client_senders: &ClientSenders,
    room_id: &str,
    leader_id: Uuid,
) {
    let change = LeadershipChange {
        new_leader_id: leader_id.to_string(),
    };
    match serde_json::to_value(&change) {
        Ok(payload) => {
            deliver(
                state,
                client_senders,
                &Topic::Leadership(room_id.to_string()),
                SERVER_ORIGIN,
                payload,
            )
            .await
        }
        Err(e) => tracing::error!("Failed to serialize leadership change: {}", e),
    }
}

async fn leave_current_room(state: &ServerState, client_senders: &ClientSenders, client_id: Uuid) {
    if let Some(outcome) = state.leave_room(client_id).await {
        after_leave(state, client_senders, outcome).await;
    }
}

async fn after_leave(state: &ServerState, client_senders: &ClientSenders, outcome: LeaveOutcome) {
    if outcome.room_closed {
        return;
    }
    if let Some(new_leader) = outcome.new_leader {
        announce_leader(state, client_senders, &outcome.room_id, new_leader).await;
    }
    broadcast_member_count(state, client_senders, &outcome.room_id).await;
}

async fn broadcast_member_count(
    state: &ServerState,
    client_senders: &ClientSenders,
    room_id: &str,
) {
    let members = state.get_room_members(room_id).await;
    let count = members.len();
    if count == 0 {
        return;
    }
    let senders = client_senders.read().await;
    for member_id in members {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(Message::RoomMemberUpdate {
                room_id: room_id.to_string(),
                members: count,
            });
        }
    }
}

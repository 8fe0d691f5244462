//! RoomSync Server - Shared Desktop State Synchronization
//!
//! A real-time room server for collaborative window-manager desktops:
//! - Last-writer-wins delta merge over a canonical window set
//! - Sled embedded database for room state persistence
//! - Axum with WebSocket for room traffic
//! - JSON text protocol shared with browser clients

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

mod room;
mod storage;

use room::protocol::{RoomProtocol, ServerMessage};
use room::{RoomServer, RoomServerConfig};
use storage::{RoomMetadata, SledRoomStore, StorageConfig};

/// Shared application state
pub struct AppState {
    /// Multi-room synchronization server
    room_server: Arc<RoomServer>,
    /// Concrete store handle for the metadata endpoints
    storage: Arc<SledRoomStore>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(storage: SledRoomStore) -> Self {
        let storage = Arc::new(storage);
        let room_server = Arc::new(RoomServer::new(
            storage.clone(),
            RoomServerConfig::default(),
        ));

        Self {
            room_server,
            storage,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_rooms: usize,
    active_peers: usize,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRoomResponse {
    room_id: String,
    name: String,
    ws_url: String,
}

#[derive(Debug, Serialize)]
struct RoomInfo {
    room_id: String,
    name: String,
    peer_count: usize,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomInfo>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct RoomPeer {
    conn_id: String,
    connected_at: i64,
}

#[derive(Debug, Serialize)]
struct RoomDetailResponse {
    room_id: String,
    name: String,
    peers: Vec<RoomPeer>,
    version: Option<u64>,
    size_bytes: u64,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.room_server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: stats.active_rooms,
        active_peers: stats.active_peers,
    })
}

/// Create a new room
async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, (StatusCode, String)> {
    // Short, URL-friendly room id from a UUID
    let full_uuid = uuid::Uuid::new_v4().to_string();
    let room_id: String = full_uuid.chars().take(8).collect();

    let short_id: String = room_id.chars().take(4).collect();
    let name = payload.name.unwrap_or_else(|| format!("Room {}", short_id));

    info!("Creating room: {} ({})", name, room_id);

    if let Err(e) = state.storage.save_metadata(&RoomMetadata::new(&room_id, &name)) {
        error!("Failed to save room metadata: {}", e);
        // Continue anyway - the room works without a metadata record
    }

    Ok(Json(CreateRoomResponse {
        room_id: room_id.clone(),
        name,
        ws_url: format!("/ws/{}", room_id),
    }))
}

/// List all rooms
async fn list_rooms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.list_rooms() {
        Ok(metas) => {
            let rooms: Vec<RoomInfo> = metas
                .into_iter()
                .map(|meta| {
                    let peer_count = state
                        .room_server
                        .get_room(&meta.room_id)
                        .map(|r| r.peer_count())
                        .unwrap_or(0);

                    RoomInfo {
                        room_id: meta.room_id,
                        name: meta.name,
                        peer_count,
                        created_at: meta.created_at,
                        updated_at: meta.updated_at,
                    }
                })
                .collect();

            let total = rooms.len();
            Json(RoomListResponse { rooms, total })
        }
        Err(e) => {
            error!("Failed to list rooms: {}", e);
            Json(RoomListResponse {
                rooms: vec![],
                total: 0,
            })
        }
    }
}

/// Get room details
async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let metadata = state
        .storage
        .get_metadata(&room_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let live = state.room_server.get_room(&room_id);
    let peers: Vec<RoomPeer> = live
        .as_ref()
        .map(|room| {
            room.peers()
                .into_iter()
                .map(|(conn_id, connected_at)| RoomPeer {
                    conn_id,
                    connected_at,
                })
                .collect()
        })
        .unwrap_or_default();

    let version = match live {
        Some(room) => room.current_version().await,
        None => None,
    };

    Ok(Json(RoomDetailResponse {
        room_id: metadata.room_id,
        name: metadata.name,
        peers,
        version,
        size_bytes: metadata.size_bytes,
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for room: {}", room_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, room_id, state))
}

/// Handle one WebSocket connection for its whole lifetime
async fn handle_websocket(socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Connection id; never reused, even by the same client reconnecting
    let conn_id = uuid::Uuid::new_v4().to_string();

    info!(
        "New WebSocket connection: conn={}, room={}",
        conn_id, room_id
    );

    // Channel feeding this connection's socket pusher task
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Attach to the room; this delivers the initial state_sync through tx
    let room = match state.room_server.connect(&room_id, &conn_id, tx).await {
        Ok(room) => room,
        Err(e) => {
            warn!("Rejecting connection to room {}: {}", room_id, e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    let conn_id_recv = conn_id.clone();
    let conn_id_send = conn_id.clone();
    let room_recv = room.clone();

    // Task to forward queued frames from the room to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match RoomProtocol::encode_server(&msg) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for conn {}", conn_id_send);
    });

    // Task to dispatch incoming socket frames into the room
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    room_recv.handle_frame(&conn_id_recv, &text).await;
                }
                Message::Binary(_) => {
                    debug!("Ignoring binary frame from conn {}", conn_id_recv);
                }
                Message::Ping(_) => {
                    // Pong is handled automatically
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", conn_id_recv);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for conn {}", conn_id_recv);
    });

    // Wait for either direction to finish
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    // Cleanup
    room.disconnect(&conn_id);
    info!("Conn {} disconnected from room {}", conn_id, room_id);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomsync_server=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize storage
    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/rooms.sled".to_string());

    info!("Initializing storage at: {}", storage_path);

    let storage = match SledRoomStore::open(StorageConfig::new(&storage_path)) {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to open storage at {}: {}", storage_path, e);
            std::process::exit(1);
        }
    };

    info!("Storage initialized successfully");

    // Create application state
    let state = Arc::new(AppState::new(storage));

    // Start background tasks
    let _cleanup_handle = state.room_server.clone().start_background_tasks();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Room management
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:room_id", get(get_room))
        // WebSocket endpoint
        .route("/ws/:room_id", get(ws_handler))
        // Add state and middleware
        .with_state(state.clone())
        .layer(cors);

    // Start server
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1999);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("RoomSync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:room_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let shutdown_server = state.room_server.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        shutdown_server.shutdown();
    });

    if let Err(e) = serve.await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

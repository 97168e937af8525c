//! Control plane: a WebSocket endpoint carrying `{uri, body}` frames.
//!
//! Every command frame gets exactly one reply frame with the same `uri`.
//! Failures come back as `{"error": message}` bodies, plus a `code` for
//! authentication failures.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::VbetError;
use crate::game::User;
use crate::remote::{Credentials, Remote};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Store,
    remote: Remote,
    users: Arc<Mutex<HashMap<String, Arc<User>>>>,
}

#[derive(Debug, Deserialize)]
struct Command {
    uri: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize)]
struct Reply {
    uri: String,
    body: Value,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    username: String,
}

#[derive(Debug, Deserialize)]
struct PlayerBody {
    username: String,
    #[serde(default)]
    game_id: Option<u32>,
    player: String,
    odd_id: u32,
}

fn error_body(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<VbetError>() {
        Some(VbetError::InvalidUserAuthentication { code, .. }) => {
            json!({"error": err.to_string(), "code": *code as u16})
        }
        _ => json!({"error": format!("{:#}", err)}),
    }
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Store, remote: Remote) -> Self {
        AppState {
            config,
            store,
            remote,
            users: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn handle(&self, command: Command) -> Reply {
        debug!("control {} {}", command.uri, command.body);
        let body = match self.dispatch(&command.uri, command.body).await {
            Ok(body) => body,
            Err(e) => {
                warn!("control {} failed: {:#}", command.uri, e);
                error_body(&e)
            }
        };
        Reply {
            uri: command.uri,
            body,
        }
    }

    async fn dispatch(&self, uri: &str, body: Value) -> Result<Value> {
        match uri {
            "login" => {
                let LoginBody { username, password } = serde_json::from_value(body).context("Invalid login body")?;
                self.login(&username, &password).await
            }
            "add" => {
                let UserBody { username } = serde_json::from_value(body).context("Invalid add body")?;
                self.add(&username).await
            }
            "player" => {
                let cmd: PlayerBody = serde_json::from_value(body).context("Invalid player body")?;
                let user = self.user(&cmd.username).await?;
                let delivered = user.modify_player(cmd.game_id, &cmd.player, cmd.odd_id);
                Ok(json!({"username": cmd.username, "player": cmd.player, "odd_id": cmd.odd_id, "delivered": delivered}))
            }
            "users" => Ok(json!(self.statuses().await)),
            "exit" => {
                let UserBody { username } = serde_json::from_value(body).context("Invalid exit body")?;
                let user = self
                    .users
                    .lock()
                    .await
                    .remove(&username)
                    .ok_or_else(|| VbetError::UnknownUser(username.clone()))?;
                user.exit();
                Ok(json!({"username": username}))
            }
            other => Err(anyhow!("unknown command {}", other)),
        }
    }

    /// Authenticate against the bookmaker, cache the credentials and start
    /// the user.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value> {
        let credentials = self.remote.auth.login(username, password).await?;
        self.store
            .set(&self.config.session_key(username), &serde_json::to_value(&credentials)?)
            .context("Failed to cache session")?;
        info!("[{}] login success [{}]", username, credentials.unit_id);
        self.start_user(username, credentials).await
    }

    /// Start a user from its cached session.
    async fn add(&self, username: &str) -> Result<Value> {
        let cached = self
            .store
            .get(&self.config.session_key(username))?
            .ok_or_else(|| VbetError::InvalidUserCache(username.to_string()))?;
        let credentials: Credentials = serde_json::from_value(cached)
            .map_err(|_| VbetError::InvalidUserCache(username.to_string()))?;
        self.start_user(username, credentials).await
    }

    async fn start_user(&self, username: &str, credentials: Credentials) -> Result<Value> {
        let mut users = self.users.lock().await;
        if let Some(user) = users.get(username) {
            return Ok(json!(user.status().await));
        }
        let settings = self.config.user_settings(username, credentials);
        let user = User::start(settings, self.remote.clone(), self.store.clone()).await?;
        let status = user.status().await;
        users.insert(username.to_string(), user);
        Ok(json!(status))
    }

    async fn user(&self, username: &str) -> Result<Arc<User>> {
        self.users
            .lock()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| VbetError::UnknownUser(username.to_string()).into())
    }

    async fn statuses(&self) -> Vec<crate::game::UserStatus> {
        let users: Vec<Arc<User>> = self.users.lock().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(users.len());
        for user in users {
            statuses.push(user.status().await);
        }
        statuses.sort_by(|a, b| a.username.cmp(&b.username));
        statuses
    }

    /// Stop every running user.
    pub async fn shutdown(&self) {
        for (_, user) in self.users.lock().await.drain() {
            user.exit();
        }
    }
}

/// Build the Axum router for the control plane.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/users", get(users_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve(socket, state))
}

/// GET /api/users
async fn users_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, (StatusCode, String)> {
    Ok(Json(state.statuses().await))
}

async fn serve(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("control client connected");
    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("control client error: {}", e);
                break;
            }
        };
        let reply = match serde_json::from_str::<Command>(&text) {
            Ok(command) => state.handle(command).await,
            Err(e) => Reply {
                uri: String::new(),
                body: json!({"error": format!("invalid frame: {}", e)}),
            },
        };
        let frame = match serde_json::to_string(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                error!("control reply encode failed: {}", e);
                continue;
            }
        };
        if socket.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
    debug!("control client disconnected");
}

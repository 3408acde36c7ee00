// REST surface: room presence lookup.

use axum::{
    extract::{Extension, Path, State},
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use syncroom_common::types::PresenceUser;
use tracing::{debug, error, info};

use crate::{
    app::RoomServices,
    auth::middleware::{require_bearer_auth, AuthenticatedUser},
    error::{ApiError, ErrorCode},
};

const USERS_SUFFIX: &str = "/users";

#[derive(Debug, Serialize)]
pub struct RoomUsersResponse {
    pub room_id: String,
    pub users: Vec<PresenceUser>,
    pub count: usize,
}

pub fn router(services: RoomServices) -> Router {
    let identity = services.identity.clone();
    Router::new()
        .route("/api/rooms/{*room_path}", get(room_users))
        .with_state(services)
        .route_layer(middleware::from_fn_with_state(identity, require_bearer_auth))
}

/// `GET /api/rooms/{room_id}/users`. Room ids may themselves contain `/`, so
/// the whole tail is captured and the `/users` suffix stripped here.
async fn room_users(
    State(services): State<RoomServices>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(room_path): Path<String>,
) -> Result<Json<RoomUsersResponse>, ApiError> {
    let room_id = room_path
        .strip_suffix(USERS_SUFFIX)
        .filter(|room_id| !room_id.is_empty())
        .ok_or_else(|| ApiError::from_code(ErrorCode::NotFound))?;

    let role = services.access.resolve_role(room_id, user.user_id).await.map_err(|err| {
        error!(room_id = %room_id, error = ?err, "failed to resolve room role");
        ApiError::from_code(ErrorCode::InternalError)
    })?;
    if role.is_none() {
        info!(
            room_id = %room_id,
            user_id = %user.user_id,
            username = %user.username,
            "room users request denied"
        );
        return Err(ApiError::new(ErrorCode::AuthForbidden, "access denied to this room"));
    }

    let members = services.presence.members(room_id).await.map_err(|err| {
        error!(room_id = %room_id, error = ?err, "failed to read room presence");
        ApiError::from_code(ErrorCode::InternalError)
    })?;
    let users = services.access.usernames_for(&members).await.map_err(|err| {
        error!(room_id = %room_id, error = ?err, "failed to resolve presence usernames");
        ApiError::from_code(ErrorCode::InternalError)
    })?;

    debug!(room_id = %room_id, username = %user.username, count = users.len(), "room users listed");
    Ok(Json(RoomUsersResponse { room_id: room_id.to_owned(), count: users.len(), users }))
}

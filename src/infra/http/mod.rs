mod admin;
mod gateway;
mod messages;
mod middleware;

pub use admin::AdminState;
pub use gateway::{GatewayState, ResolvedRoute, RouteTable};
pub use messages::MessageState;

use axum::{
    Router,
    extract::FromRef,
    middleware as axum_middleware,
    routing::{get, post},
};

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct RouterState {
    pub gateway: GatewayState,
    pub messages: MessageState,
}

impl FromRef<RouterState> for GatewayState {
    fn from_ref(state: &RouterState) -> Self {
        state.gateway.clone()
    }
}

impl FromRef<RouterState> for MessageState {
    fn from_ref(state: &RouterState) -> Self {
        state.messages.clone()
    }
}

/// Public listener: cached API reads, forwarded writes and message sealing.
pub fn build_router(state: RouterState) -> Router {
    Router::new()
        .route(
            "/api/{*path}",
            get(gateway::api_read)
                .post(gateway::api_write)
                .put(gateway::api_write)
                .patch(gateway::api_write)
                .delete(gateway::api_write),
        )
        .route("/messages/seal", post(messages::seal))
        .route("/messages/open", post(messages::open))
        .route("/health", get(gateway::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Admin listener: purges and statistics.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_cache/purge", post(admin::purge))
        .route("/_cache/stats", get(admin::stats))
        .route("/health", get(gateway::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

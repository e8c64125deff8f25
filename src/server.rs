use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use log::info;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::supervisor::ConnectionStatus;

pub fn router(status: ConnectionStatus) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(status)
}

async fn root() -> &'static str {
    "citygate is running"
}

async fn health(State(status): State<ConnectionStatus>) -> impl IntoResponse {
    let state = status.current();
    let code = if status.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "state": state.to_string() })))
}

/// Serve the liveness host until `cancel` fires.
pub async fn serve(
    port: u16,
    status: ConnectionStatus,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("HTTP host listening on {addr}");
    axum::Server::try_bind(&addr)?
        .serve(router(status).into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("HTTP host stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::supervisor::ConnectionState;

    async fn get_health(state: ConnectionState) -> (StatusCode, serde_json::Value) {
        let (_tx, rx) = watch::channel(state);
        let response = router(ConnectionStatus::from(rx))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok_when_connected() {
        let (code, body) = get_health(ConnectionState::Connected).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "Connected");
    }

    #[tokio::test]
    async fn health_is_unavailable_while_reconnecting() {
        let (code, body) = get_health(ConnectionState::Reconnecting).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["state"], "Reconnecting");
    }

    #[tokio::test]
    async fn root_answers() {
        let (_tx, rx) = watch::channel(ConnectionState::Disconnected);
        let response = router(ConnectionStatus::from(rx))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

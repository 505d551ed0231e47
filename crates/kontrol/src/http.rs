//! Kontrol's plain-HTTP surface: `POST /register` for kites that
//! prefer not to keep a session open, and `GET /heartbeat?id=` with
//! the literal `pong` / `registeragain` bodies.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use kite_protocol::{RegisterHttpRequest, RegisterResult};

use crate::storage::KiteRecord;
use crate::KontrolState;

pub(crate) fn router(state: Arc<KontrolState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat", get(heartbeat))
        .with_state(state)
}

async fn register(
    State(state): State<Arc<KontrolState>>,
    Json(body): Json<RegisterHttpRequest>,
) -> impl IntoResponse {
    if body.authentication.kind != "kiteKey" {
        return (
            StatusCode::UNAUTHORIZED,
            "registration requires kiteKey authentication",
        )
            .into_response();
    }
    let key_id = match state.signer.verify_kite_key(&body.authentication.key) {
        Ok((_claims, key_id)) => key_id,
        Err(e) => {
            tracing::debug!(error = %e, "http register with invalid kite key");
            return (StatusCode::UNAUTHORIZED, "invalid kite key").into_response();
        }
    };

    let record = KiteRecord {
        kite: body.kite,
        url: body.url.clone(),
        key_id,
    };
    if let Err(e) = state.storage.add(&record).await {
        tracing::error!(error = %e, "storage add failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
    }
    state.heartbeats.track(record);

    Json(RegisterResult {
        url: body.url,
        heartbeat_interval: state.heartbeat_interval.as_secs() as i64,
        kite_key: None,
        public_key: None,
    })
    .into_response()
}

#[derive(Deserialize)]
struct HeartbeatQuery {
    id: String,
}

async fn heartbeat(
    State(state): State<Arc<KontrolState>>,
    Query(query): Query<HeartbeatQuery>,
) -> &'static str {
    state.heartbeats.beat(&query.id).await.as_body()
}

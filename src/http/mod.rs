use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::scheduler::{LOOP_NAMES, readiness_window};
use crate::state::LoopHealth;

pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Serialize)]
struct HealthBody {
    cluster: String,
    ready: bool,
    loops: Vec<LoopHealth>,
}

async fn get_healthz(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthBody>) {
    let ready = ctx
        .state
        .is_ready(LOOP_NAMES, readiness_window(&ctx.config))
        .await;
    let body = HealthBody {
        cluster: ctx.cluster_name().to_string(),
        ready,
        loops: ctx.state.loop_health().await,
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::relay::CHANNEL_COUNT;
use crate::state::AppContext;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub(crate) fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/relay", get(api_relay))
        .with_state(ctx)
}

async fn api_status(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.snapshot().await)
}

/// `/api/relay?id=<n>&state=<1|0|toggle>`. Anything but `1` or `toggle`
/// (including no `state`) switches the relay off.
#[derive(Debug, Deserialize)]
struct RelayQuery {
    id: usize,
    state: Option<String>,
}

async fn api_relay(State(ctx): State<AppContext>, Query(q): Query<RelayQuery>) -> Response {
    if q.id >= CHANNEL_COUNT {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("relay id {} out of range", q.id) })),
        )
            .into_response();
    }

    {
        let mut relays = ctx.relays.lock().await;
        match q.state.as_deref() {
            Some("toggle") => relays.toggle(q.id),
            Some("1") => relays.set(q.id, true),
            _ => relays.set(q.id, false),
        }
        tracing::info!(relay = q.id, on = relays.get(q.id), "relay set via http");
    }

    Json(ctx.snapshot().await).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub(crate) async fn serve(
    ctx: AppContext,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("status api listening on http://{addr}");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    engine::{RunHandle, ScanEngine},
    error::Error,
    events::BroadcastPublisher,
    settings::{RuntimeSettings, SettingsProvider},
    types::{NewScan, ScanId, ScanUpdate},
};

#[derive(Clone)]
pub struct AppState {
    engine: ScanEngine,
    settings: Arc<RuntimeSettings>,
    events: BroadcastPublisher,
}

impl AppState {
    pub fn new(engine: ScanEngine, settings: Arc<RuntimeSettings>, events: BroadcastPublisher) -> Self {
        Self {
            engine,
            settings,
            events,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsBody {
    pub scan_timeout_ms: u64,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) | Error::ResultNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidTarget { .. } => StatusCode::BAD_REQUEST,
            Error::ScanBusy(_) => StatusCode::CONFLICT,
            Error::WorkerFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/scans",
            get(list_scans).post(create_scan).delete(clear_scans),
        )
        .route(
            "/scans/{id}",
            get(get_scan).patch(update_scan).delete(delete_scan),
        )
        .route("/scans/{id}/run", post(run_scan))
        .route("/scans/{id}/cancel", post(cancel_scan))
        .route("/scans/{id}/rerun", post(rerun_scan))
        .route("/scans/{id}/results", get(get_results))
        .route("/scans/{id}/results/{result_id}", get(get_result))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/events", get(event_stream))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let app = router(state);
    info!("serving API on http://{bind}/api");
    axum::serve(tokio::net::TcpListener::bind(bind).await?, app).await?;
    Ok(())
}

async fn list_scans(State(app): State<AppState>) -> Result<impl IntoResponse, Error> {
    Ok(Json(app.engine.get_scans().await?))
}

async fn create_scan(
    State(app): State<AppState>,
    Json(new): Json<NewScan>,
) -> Result<impl IntoResponse, Error> {
    let scan = app.engine.create_scan(new).await?;
    Ok((StatusCode::CREATED, Json(scan)))
}

async fn clear_scans(State(app): State<AppState>) -> Result<impl IntoResponse, Error> {
    app.engine.clear_scans().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(app.engine.get_scan(id).await?))
}

async fn update_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
    Json(update): Json<ScanUpdate>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(app.engine.update_scan(id, update).await?))
}

async fn delete_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, Error> {
    app.engine.delete_scan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, Error> {
    let handle = app.engine.begin_run(id).await?;
    Ok((StatusCode::ACCEPTED, Json(drive(handle))))
}

async fn rerun_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, Error> {
    let handle = app.engine.begin_re_run(id).await?;
    Ok((StatusCode::ACCEPTED, Json(drive(handle))))
}

/// Finish the run in the background; the caller gets the starting snapshot.
fn drive(handle: RunHandle) -> crate::types::Scan {
    let scan = handle.scan().clone();
    let id = handle.id();
    tokio::spawn(async move {
        if let Err(e) = handle.finish().await {
            warn!(scan_id = id, error = %e, "scan run ended with an error");
        }
    });
    scan
}

async fn cancel_scan(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, Error> {
    let cancelled = app.engine.cancel_scan(id).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn get_results(
    State(app): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(app.engine.get_template_results(id).await?))
}

async fn get_result(
    State(app): State<AppState>,
    Path((id, result_id)): Path<(ScanId, u64)>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(app.engine.get_template_result(id, result_id).await?))
}

async fn get_settings(State(app): State<AppState>) -> impl IntoResponse {
    Json(SettingsBody {
        scan_timeout_ms: app.settings.scan_timeout_millis(),
    })
}

async fn put_settings(
    State(app): State<AppState>,
    Json(body): Json<SettingsBody>,
) -> impl IntoResponse {
    if body.scan_timeout_ms == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "scan_timeout_ms must be positive" })),
        )
            .into_response();
    }
    app.settings.set_scan_timeout_millis(body.scan_timeout_ms);
    info!(scan_timeout_ms = body.scan_timeout_ms, "settings updated");
    (StatusCode::OK, Json(body)).into_response()
}

async fn event_stream(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(app.events.subscribe()).filter_map(|msg| match msg {
        Ok(event) => Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()
            .map(Ok),
        Err(_) => Some(Ok(Event::default().event("lagged").data("event stream lagged"))),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

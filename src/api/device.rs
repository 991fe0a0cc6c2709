//! Per-printer job status, print commands, and webcam endpoints (C6, C7).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::command_surface;
use crate::db::Printer;
use crate::quickcam::QuickCam;
use crate::AppState;

const MJPEG_BOUNDARY: &str = "oestreamboundary";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{serial}/status", get(job_status))
        .route("/{serial}/pause", post(pause))
        .route("/{serial}/resume", post(resume))
        .route("/{serial}/cancel", post(cancel))
        .route("/{serial}/light", post(set_light))
        .route("/{serial}/webcam/snapshot", get(webcam_snapshot))
        .route("/{serial}/webcam/stream", get(webcam_stream))
}

fn not_connected(serial: &str) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, format!("printer {serial} is not connected"))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<Json<command_surface::JobStatus>, (StatusCode, String)> {
    let mut printer_state = state
        .printer_manager
        .get_state(&serial)
        .await
        .ok_or_else(|| not_connected(&serial))?;

    let records = state.printer_manager.record_store(&serial);
    let status = command_surface::get_job_status(&mut printer_state, &records).await;
    Ok(Json(status))
}

async fn pause(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .printer_manager
        .pause(&serial)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .printer_manager
        .resume(&serial)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .printer_manager
        .cancel(&serial)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}

#[derive(Debug, Deserialize)]
struct SetLightRequest {
    on: bool,
}

async fn set_light(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Json(request): Json<SetLightRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .printer_manager
        .set_chamber_light(&serial, request.on)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}

/// Returns the existing `QuickCam` for a printer, or builds one from its
/// stored connection details the first time it's asked for.
async fn get_or_create_webcam(
    state: &Arc<AppState>,
    serial: &str,
) -> Result<Arc<QuickCam>, (StatusCode, String)> {
    if let Some(cam) = state.webcams.lock().await.get(serial) {
        return Ok(cam.clone());
    }

    let printer = sqlx::query_as::<_, Printer>("SELECT * FROM printers WHERE serial = ?")
        .bind(serial)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("printer {serial} not found")))?;

    let ip = printer
        .ip_address
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "printer has no IP address".to_string()))?;
    let access_code = printer
        .access_code
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "printer has no access code".to_string()))?;

    let cam = QuickCam::new(
        serial.to_string(),
        ip,
        access_code,
        state.printer_manager.clone(),
        state.config.camera_debug,
    );

    let mut webcams = state.webcams.lock().await;
    let cam = webcams.entry(serial.to_string()).or_insert(cam).clone();
    Ok(cam)
}

async fn webcam_snapshot(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let cam = get_or_create_webcam(&state, &serial).await?;
    match cam.snapshot().await {
        Some(jpeg) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response()),
        None => Err((StatusCode::SERVICE_UNAVAILABLE, "no webcam frame available yet".to_string())),
    }
}

fn multipart_part(jpeg: &Bytes) -> Bytes {
    let mut framed = bytes::BytesMut::with_capacity(jpeg.len() + 96);
    framed.extend_from_slice(
        format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", jpeg.len())
            .as_bytes(),
    );
    framed.extend_from_slice(jpeg);
    framed.extend_from_slice(b"\r\n");
    framed.freeze()
}

async fn webcam_stream(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let cam = get_or_create_webcam(&state, &serial).await?;
    let rx = cam.subscribe();

    // Some MJPEG viewers swallow the first part they see while they finish
    // negotiating the multipart boundary, so double it up front.
    let warmup: Vec<Bytes> = cam
        .snapshot()
        .await
        .map(|frame| vec![frame.clone(), frame])
        .unwrap_or_default();

    let body_stream = futures_util::stream::iter(warmup)
        .chain(
            tokio_stream::wrappers::BroadcastStream::new(rx)
                .filter_map(|frame| async move { frame.ok() }),
        )
        .map(|frame| Ok::<Bytes, std::io::Error>(multipart_part(&frame)));

    let content_type = format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}");
    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(body_stream),
    )
        .into_response())
}

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use bytes::{BufMut, Bytes, BytesMut};
use frame_bus::distributor::SinkSummary;
use frame_bus::pipeline::{PipelineHandle, PipelineState};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::sink::{PreviewStats, PreviewSurface};

const BOUNDARY: &str = "frame";

#[derive(Clone)]
pub(crate) struct AppState {
    pub surface: Arc<PreviewSurface>,
    pub pipeline: PipelineHandle,
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    state: PipelineState,
    frames: u64,
    width: u32,
    height: u32,
    preview: PreviewStats,
    sinks: Vec<SinkSummary>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream))
        .route("/status", get(status))
        .with_state(state)
}

/// Binds `addr` and serves the preview until `cancel` fires. The preview
/// surface is closed once the server stops.
pub(crate) async fn start_preview_server(
    addr: &str,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind preview server to {}", addr))?;
    let local = listener.local_addr()?;
    log::info!("preview available at http://{}", local);

    let surface = state.surface.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("preview server error: {}", e);
        }
        surface.close();
    });
    Ok(local)
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down preview server");
}

async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html>\n<html><head><title>cam-relay</title></head>\
         <body style=\"margin:0;background:#000\">\
         <img src=\"/stream\" style=\"width:100%;height:auto\">\
         </body></html>",
    )
}

async fn stream(State(state): State<AppState>) -> impl IntoResponse {
    let closed = state.surface.closed_token();
    let parts = WatchStream::new(state.surface.subscribe())
        .filter_map(|jpeg| async move { jpeg.map(|jpeg| Ok::<_, Infallible>(multipart_part(&jpeg))) })
        .take_until(closed.cancelled_owned());

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(parts),
    )
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let preview = state.surface.stats();
    let pipeline_state = state.pipeline.state();
    Json(StatusResponse {
        running: !pipeline_state.is_terminal(),
        state: pipeline_state,
        frames: state.pipeline.frames_distributed(),
        width: preview.width,
        height: preview.height,
        preview,
        sinks: state.pipeline.sinks(),
    })
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

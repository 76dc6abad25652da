//! HTTP API for the lector narration engine.
//!
//! Runs on port 2004 by default. CORS-permissive so a reader UI served from
//! another localhost port can drive it. `/events` streams [`ReaderEvent`]s as
//! server-sent events. Backend and voice choices are written back to the
//! config file so they survive a restart.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{FromRef, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::warn;

use lector_core::document::paragraphs_from_text;
use lector_core::types::{
    BackendInfo, BackendKind, Paragraph, ReaderConfig, ReaderEvent, ReaderStatus, SidecarStatus,
    TocEntry, VoiceParams,
};

use crate::config;
use crate::engine::ReaderEngine;
use crate::manager::SidecarManager;

#[derive(Clone)]
struct AppState {
    engine: ReaderEngine,
    config_path: Arc<PathBuf>,
}

impl FromRef<AppState> for ReaderEngine {
    fn from_ref(state: &AppState) -> Self {
        state.engine.clone()
    }
}

/// Build the axum router around a shared [`ReaderEngine`]. Settings changed
/// over the API are saved to `config_path`.
pub fn router(engine: ReaderEngine, config_path: PathBuf) -> Router {
    Router::new()
        .route("/paragraphs", post(load_paragraphs))
        .route("/play", post(play))
        .route("/jump", post(jump))
        .route("/toc/jump", post(toc_jump))
        .route("/toggle", post(toggle))
        .route("/stop", post(stop))
        .route("/seek", post(seek))
        .route("/rate", post(rate))
        .route("/voice", post(voice))
        .route("/status", get(status))
        .route("/events", get(events))
        .route("/backend", get(backend_info).post(set_backend))
        .route("/lifecycle/background", post(background))
        .route("/lifecycle/foreground", post(foreground))
        .route("/lifecycle/memory-warning", post(memory_warning))
        .layer(CorsLayer::permissive())
        .with_state(AppState {
            engine,
            config_path: Arc::new(config_path),
        })
}

/// Apply `update` to the saved config. Failures are logged; the running
/// engine already has the new setting.
fn persist(path: &Path, update: impl FnOnce(&mut ReaderConfig)) {
    let saved = config::load(path).and_then(|mut cfg| {
        update(&mut cfg);
        config::save(path, &cfg)
    });
    if let Err(e) = saved {
        warn!("server: settings not saved: {e}");
    }
}

#[derive(Clone)]
struct SidecarState {
    manager: Arc<SidecarManager>,
    models_dir: PathBuf,
}

/// Routes reporting on the local Kokoro sidecar. Merged into [`router`] by
/// the binary when the on-device backend is wired up.
pub fn sidecar_router(manager: Arc<SidecarManager>, models_dir: PathBuf) -> Router {
    Router::new()
        .route("/sidecar", get(sidecar_status))
        .layer(CorsLayer::permissive())
        .with_state(SidecarState {
            manager,
            models_dir,
        })
}

async fn sidecar_status(State(state): State<SidecarState>) -> Json<SidecarStatus> {
    Json(state.manager.status(&state.models_dir).await)
}

#[derive(serde::Serialize)]
struct OkResponse {
    ok: bool,
}

fn ok() -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

#[derive(serde::Deserialize)]
struct ParagraphInput {
    text: String,
    #[serde(default)]
    anchor: Option<String>,
}

/// Either explicit paragraphs or a whole document to split.
#[derive(serde::Deserialize)]
struct LoadRequest {
    #[serde(default)]
    paragraphs: Vec<ParagraphInput>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    markdown: bool,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadResponse {
    ok: bool,
    paragraph_count: usize,
}

async fn load_paragraphs(
    State(engine): State<ReaderEngine>,
    Json(req): Json<LoadRequest>,
) -> Json<LoadResponse> {
    let paragraphs: Vec<Paragraph> = match req.text {
        Some(text) => paragraphs_from_text(&text, req.markdown),
        None => req
            .paragraphs
            .into_iter()
            .enumerate()
            .map(|(index, p)| Paragraph {
                index,
                text: p.text,
                anchor: p.anchor,
            })
            .collect(),
    };
    let paragraph_count = paragraphs.len();
    engine.load_paragraphs(paragraphs);
    Json(LoadResponse {
        ok: true,
        paragraph_count,
    })
}

#[derive(serde::Deserialize)]
struct IndexRequest {
    index: usize,
}

async fn play(
    State(engine): State<ReaderEngine>,
    Json(req): Json<IndexRequest>,
) -> Json<OkResponse> {
    engine.play_paragraph(req.index);
    ok()
}

async fn jump(
    State(engine): State<ReaderEngine>,
    Json(req): Json<IndexRequest>,
) -> Json<OkResponse> {
    engine.jump_to_paragraph(req.index);
    ok()
}

#[derive(serde::Serialize)]
struct TocJumpResponse {
    ok: bool,
    index: Option<usize>,
}

async fn toc_jump(
    State(engine): State<ReaderEngine>,
    Json(entry): Json<TocEntry>,
) -> Json<TocJumpResponse> {
    let index = engine.jump_to_toc(entry).await;
    Json(TocJumpResponse {
        ok: index.is_some(),
        index,
    })
}

async fn toggle(State(engine): State<ReaderEngine>) -> Json<OkResponse> {
    engine.toggle_play_pause();
    ok()
}

async fn stop(State(engine): State<ReaderEngine>) -> Json<OkResponse> {
    engine.stop();
    ok()
}

#[derive(serde::Deserialize)]
struct SeekRequest {
    position: f64,
}

async fn seek(
    State(engine): State<ReaderEngine>,
    Json(req): Json<SeekRequest>,
) -> Json<OkResponse> {
    engine.seek(req.position);
    ok()
}

#[derive(serde::Deserialize)]
struct RateRequest {
    rate: f32,
}

async fn rate(
    State(engine): State<ReaderEngine>,
    Json(req): Json<RateRequest>,
) -> Json<OkResponse> {
    engine.set_rate(req.rate);
    ok()
}

async fn voice(State(state): State<AppState>, Json(req): Json<VoiceParams>) -> Json<OkResponse> {
    persist(&state.config_path, |cfg| {
        cfg.voice = req.voice.clone();
        cfg.speed = req.speed;
    });
    state.engine.set_voice(req);
    ok()
}

async fn status(State(engine): State<ReaderEngine>) -> Json<ReaderStatus> {
    Json(engine.status())
}

async fn events(
    State(engine): State<ReaderEngine>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = engine.subscribe_events();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(sse_event(&event)), rx)),
                Err(RecvError::Lagged(n)) => warn!("server: event stream lagged, skipped {n}"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &ReaderEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().data(data)
}

async fn backend_info(State(engine): State<ReaderEngine>) -> Json<BackendInfo> {
    Json(engine.backend_info())
}

#[derive(serde::Deserialize)]
struct BackendRequest {
    preference: BackendKind,
}

async fn set_backend(
    State(state): State<AppState>,
    Json(req): Json<BackendRequest>,
) -> Json<BackendInfo> {
    state.engine.set_backend_preference(req.preference);
    persist(&state.config_path, |cfg| cfg.backend = req.preference);
    Json(state.engine.backend_info())
}

async fn background(State(engine): State<ReaderEngine>) -> Json<OkResponse> {
    engine.enter_background().await;
    ok()
}

async fn foreground(State(engine): State<ReaderEngine>) -> Json<OkResponse> {
    engine.enter_foreground().await;
    ok()
}

async fn memory_warning(State(engine): State<ReaderEngine>) -> Json<OkResponse> {
    engine.memory_warning().await;
    ok()
}

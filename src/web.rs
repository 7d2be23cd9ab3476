//
// web.rs
// MedImg-Pipeline
//
// Axum-based HTTP server exposing chunked upload, study processing, status, image preview,
// free-form analysis queries and segmentation task discovery.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{info, warn};

use crate::{
    analysis::StudyContext,
    config::PipelineConfig,
    decode,
    error::{IngestError, LifecycleError, PipelineError},
    image,
    lifecycle::StudyLifecycle,
    models::{ImageInfo, ProcessReport, ValidFile},
    pipeline::{Pipeline, ProcessRequest},
    storage::{FileStore, StoredUpload, UPLOAD_CHUNK_SIZE},
    validate,
};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    store: FileStore,
    studies: Arc<StudyRegistry>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Upload-time facts plus the lifecycle of the current processing attempt.
#[derive(Debug, Clone, Serialize)]
struct StudyRecord {
    id: u64,
    filename: String,
    patient_id: String,
    study_id: String,
    description: Option<String>,
    uploaded_at: DateTime<Utc>,
    validation: ValidFile,
    lifecycle: StudyLifecycle,
    report: Option<ProcessReport>,
    error: Option<String>,
}

impl StudyRecord {
    fn context(&self) -> StudyContext {
        StudyContext {
            patient_id: self.patient_id.clone(),
            study_id: self.study_id.clone(),
            modality: self.validation.modality.clone(),
            study_date: self.uploaded_at.format("%Y-%m-%d").to_string(),
            description: self.description.clone(),
            processing_status: self.lifecycle.status(),
        }
    }
}

/// In-process study table. The lock is only held for bookkeeping, never across an await.
#[derive(Default)]
struct StudyRegistry {
    next_id: AtomicU64,
    records: Mutex<HashMap<u64, StudyRecord>>,
}

impl StudyRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, StudyRecord>> {
        // A panic while holding the lock cannot leave a record half-written, so keep serving.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, mut record: StudyRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        record.id = id;
        self.lock().insert(id, record);
        id
    }

    fn get(&self, id: u64) -> ApiResult<StudyRecord> {
        self.lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("study {id} not found")))
    }

    /// Move a study into `processing`, returning its stored filename. A finished study is
    /// resubmitted as a new attempt.
    fn begin(&self, id: u64) -> ApiResult<String> {
        let mut records = self.lock();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("study {id} not found")))?;
        if record.lifecycle.is_terminal() {
            record.lifecycle = record.lifecycle.resubmit().map_err(lifecycle_error)?;
        }
        record.lifecycle.begin().map_err(lifecycle_error)?;
        record.error = None;
        Ok(record.filename.clone())
    }

    fn finish(&self, id: u64, result: &Result<ProcessReport, PipelineError>) -> ApiResult<()> {
        let mut records = self.lock();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("study {id} not found")))?;
        match result {
            Ok(report) => {
                record.lifecycle.succeed().map_err(lifecycle_error)?;
                record.report = Some(report.clone());
            }
            Err(e) => {
                record.lifecycle.fail().map_err(lifecycle_error)?;
                record.error = Some(e.to_string());
            }
        }
        Ok(())
    }
}

/// Bootstraps the Axum HTTP server and wires up API routes. Derived outputs (previews,
/// segmentation masks) are served read-only under `/processed`.
pub async fn start_server(config: &PipelineConfig, host: &str, port: u16) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let state = AppState {
        pipeline: Arc::new(pipeline),
        store: FileStore::new(&config.storage.upload_dir, config.storage.max_upload_bytes)?,
        studies: Arc::new(StudyRegistry::default()),
    };

    // Multipart framing adds a little on top of the file itself.
    let body_limit = usize::try_from(config.storage.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(64 * 1024);

    let app = Router::new()
        .route("/api/upload", post(upload_handler))
        .route("/api/process/:id", post(process_handler))
        .route("/api/studies", get(list_studies))
        .route("/api/studies/:id/status", get(status_handler))
        .route("/api/studies/:id/info", get(info_handler))
        .route("/api/studies/:id/image", get(image_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/segmentation/tasks", get(tasks_handler))
        .nest_service("/processed", ServeDir::new(&config.storage.processed_dir))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(%addr, "server running");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    // Every early return below drops `stored`, which deletes the file again.
    let mut stored: Option<PendingUpload> = None;
    let mut patient_id = None;
    let mut study_id = None;
    let mut description = None;

    while let Some(mut field) = multipart.next_field().await.map_err(bad_request)? {
        match field.name() {
            Some("file") => {
                if stored.is_some() {
                    return Err(bad_request("Only one file can be uploaded per request"));
                }
                let original_name = field.file_name().map(str::to_string);
                let mut writer = state
                    .store
                    .begin_upload(original_name.as_deref())
                    .await
                    .map_err(ingest_error)?;
                // Stream the part in bounded chunks instead of buffering the whole file.
                loop {
                    let chunk = match field.chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            writer.abort().await;
                            return Err(bad_request(e));
                        }
                    };
                    for piece in chunk.chunks(UPLOAD_CHUNK_SIZE) {
                        writer.write_chunk(piece).await.map_err(ingest_error)?;
                    }
                }
                let upload = writer.finish().await.map_err(ingest_error)?;
                stored = Some(PendingUpload::new(state.store.clone(), upload));
            }
            Some("patient_id") => patient_id = Some(field.text().await.map_err(bad_request)?),
            Some("study_id") => study_id = Some(field.text().await.map_err(bad_request)?),
            Some("description") => description = Some(field.text().await.map_err(bad_request)?),
            _ => {}
        }
    }

    let pending = stored.ok_or((StatusCode::BAD_REQUEST, "No file selected".to_string()))?;
    let patient_id = non_empty(patient_id)
        .map(|id| validate::normalize_patient_id(&id))
        .transpose()
        .map_err(bad_request)?;
    let description = non_empty(description)
        .map(|d| validate::normalize_description(&d))
        .transpose()
        .map_err(bad_request)?;
    let validation = state.pipeline.ingest(pending.path()).map_err(pipeline_error)?;
    let stored = pending.keep();

    let id = state.studies.insert(StudyRecord {
        id: 0,
        filename: stored.filename.clone(),
        patient_id: patient_id.unwrap_or_else(|| "UNKNOWN".to_string()),
        study_id: non_empty(study_id)
            .unwrap_or_else(|| format!("STUDY_{}", Utc::now().format("%Y%m%d_%H%M%S"))),
        description,
        uploaded_at: Utc::now(),
        validation: validation.clone(),
        lifecycle: StudyLifecycle::new(),
        report: None,
        error: None,
    });
    info!(id, filename = %stored.filename, size = stored.size, "study uploaded");

    Ok(Json(json!({
        "success": true,
        "study_id": id,
        "filename": stored.filename,
        "format": validation.format,
        "modality": validation.modality,
        "dimensions": validation.dimensions,
        "warnings": validation.warnings,
    })))
}

/// A stored upload that is deleted on drop unless the study gets registered.
struct PendingUpload {
    store: FileStore,
    upload: StoredUpload,
    kept: bool,
}

impl PendingUpload {
    fn new(store: FileStore, upload: StoredUpload) -> Self {
        Self {
            store,
            upload,
            kept: false,
        }
    }

    fn path(&self) -> &std::path::Path {
        &self.upload.path
    }

    fn keep(mut self) -> StoredUpload {
        self.kept = true;
        self.upload.clone()
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        if let Err(e) = self.store.remove(&self.upload.path) {
            warn!(path = ?self.upload.path, error = %e, "failed to discard upload");
        }
    }
}

async fn process_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: Option<Json<ProcessRequest>>,
) -> ApiResult<Json<Value>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    // Detached from the request future; the outcome is recorded even if the client goes away.
    let report = tokio::spawn(async move {
        let filename = state.studies.begin(id)?;
        let result = match state.store.resolve(&filename) {
            Ok(path) => state.pipeline.run(&path, &request).await,
            Err(e) => Err(e.into()),
        };
        state.studies.finish(id, &result)?;
        result.map_err(pipeline_error)
    })
    .await
    .map_err(internal_error)??;

    Ok(Json(json!({
        "success": true,
        "study_id": id,
        "report": report,
    })))
}

async fn list_studies(State(state): State<AppState>) -> Json<Value> {
    let records = state.studies.lock();
    let mut studies: Vec<Value> = records
        .values()
        .map(|r| {
            json!({
                "id": r.id,
                "filename": r.filename,
                "patient_id": r.patient_id,
                "study_id": r.study_id,
                "modality": r.validation.modality,
                "format": r.validation.format,
                "status": r.lifecycle.status(),
                "uploaded_at": r.uploaded_at,
            })
        })
        .collect();
    studies.sort_by_key(|s| s["id"].as_u64());
    Json(json!({ "studies": studies }))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Value>> {
    let record = state.studies.get(id)?;
    Ok(Json(json!({
        "study_id": id,
        "status": record.lifecycle.status(),
        "attempt": record.lifecycle.attempt(),
        "error": record.error,
        "has_report": record.report.is_some(),
    })))
}

async fn info_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ImageInfo>> {
    let path = stored_path(&state, id)?;
    let info = tokio::task::spawn_blocking(move || {
        decode::decode(&path).map(|asset| decode::describe(&asset))
    })
    .await
    .map_err(internal_error)?
    .map_err(internal_error)?;
    Ok(Json(info))
}

#[derive(Debug, Default, Deserialize)]
struct SliceQuery {
    slice: Option<i64>,
}

async fn image_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<SliceQuery>,
) -> ApiResult<impl IntoResponse> {
    let path = stored_path(&state, id)?;
    // Render the selected slice to PNG bytes so the UI can embed an <img>.
    let (index, bytes) = tokio::task::spawn_blocking(move || {
        let asset = decode::decode(&path).map_err(internal_error)?;
        image::preview_png_bytes(&asset, query.slice).map_err(internal_error)
    })
    .await
    .map_err(internal_error)??;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::HeaderName::from_static("x-slice-index"), index.to_string()),
        ],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    study_id: u64,
    query: String,
}

async fn analyze_handler(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<Json<Value>> {
    if request.query.trim().is_empty() {
        return Err(bad_request("Query is required"));
    }
    let client = state.pipeline.analysis().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "text-generation API is not configured".to_string(),
    ))?;

    let record = state.studies.get(request.study_id)?;
    let segmentation = record.report.as_ref().map(|r| &r.segmentation);
    let report = client
        .process_query(&request.query, Some(&record.context()), segmentation)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "response": report.text,
        "confidence": report.confidence,
        "model": report.model,
        "timestamp": report.timestamp,
    })))
}

async fn tasks_handler(State(state): State<AppState>) -> Json<Value> {
    let orchestrator = state.pipeline.orchestrator();
    Json(json!({
        "tasks": orchestrator.available_tasks(),
        "tool_available": orchestrator.tool_available(),
    }))
}

/// On-disk location of a study's upload, confined to the store root.
fn stored_path(state: &AppState, id: u64) -> ApiResult<PathBuf> {
    let filename = state.studies.get(id)?.filename;
    state.store.resolve(&filename).map_err(not_found)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ingest_error(err: IngestError) -> (StatusCode, String) {
    match err {
        IngestError::Rejected(reason) => (StatusCode::BAD_REQUEST, reason),
        IngestError::Resource(e) => internal_error(e),
    }
}

fn lifecycle_error(err: LifecycleError) -> (StatusCode, String) {
    (StatusCode::CONFLICT, err.to_string())
}

fn pipeline_error(err: PipelineError) -> (StatusCode, String) {
    match err {
        PipelineError::Validation { .. } => bad_request(err),
        PipelineError::Lifecycle(e) => lifecycle_error(e),
        other => internal_error(other),
    }
}

fn bad_request<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn internal_error<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn not_found<E: Display>(err: E) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, err.to_string())
}

use axum::{
    extract::{multipart::Field, Multipart, Path, Query, State},
    http::{header::LOCATION, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fwcrypt_core::engine::jobs::{JobHandle, JobId, Submission};
use fwcrypt_core::engine::protocol::ProtocolGraph;
use fwcrypt_core::engine::report::{content_hash, ENGINE_VERSION};
use fwcrypt_core::{AnalysisError, AnalysisReport};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::security::{Principal, Scope};
use crate::server::AppState;

/// Multipart field carrying the firmware image.
const UPLOAD_FIELD: &str = "file";

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/results", get(results))
        .route("/protocol/:file", get(protocol))
        .route("/compliance/:file", get(compliance))
        .route("/jobs/:id", get(job_status).delete(cancel_job))
        .route("/keys/:id/revoke", post(revoke_key))
}

/// Confidence as shown to API callers.
fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn rounded_graph(graph: &ProtocolGraph) -> ProtocolGraph {
    let mut graph: ProtocolGraph = graph.clone();
    for node in graph.nodes.iter_mut() {
        node.confidence = round3(node.confidence);
    }
    graph.anomaly_score = round3(graph.anomaly_score);
    graph
}

fn rounded_report(report: &AnalysisReport) -> AnalysisReport {
    let mut report: AnalysisReport = report.clone();
    report.arch_confidence = round3(report.arch_confidence);
    for detection in report.detections.iter_mut() {
        detection.confidence = round3(detection.confidence);
        detection.signature_score = round3(detection.signature_score);
        detection.structural_score = round3(detection.structural_score);
    }
    report.protocols = report.protocols.iter().map(rounded_graph).collect();
    report
}

/// Dashboard summary returned by `/analyze`.
fn analysis_summary(report: &AnalysisReport) -> serde_json::Value {
    let mut summary = serde_json::Map::new();
    for (group, mut best) in report.summary() {
        best.confidence = round3(best.confidence);
        summary.insert(
            group.to_ascii_lowercase(),
            serde_json::to_value(best).unwrap_or(serde_json::Value::Null),
        );
    }
    serde_json::json!({
        "file": report.display_name(),
        "arch": report.architecture.name(),
        "size": report.size,
        "content_hash": report.content_hash,
        "summary": summary,
        "risk_score": report.compliance.risk_score,
        "risk_level": report.compliance.risk_level,
    })
}

fn find_report(state: &AppState, file: &str) -> Result<Arc<AnalysisReport>, ApiError> {
    state
        .jobs
        .store()
        .lookup(file)
        .ok_or_else(|| ApiError::not_found(format!("no report for {}", file)))
}

fn find_job(state: &AppState, id: &str) -> Result<Arc<JobHandle>, ApiError> {
    id.parse::<JobId>()
        .ok()
        .and_then(|id| state.jobs.job(id))
        .ok_or_else(|| ApiError::not_found(format!("no job {}", id)))
}

fn accepted(job: &JobHandle) -> Response {
    let location: String = format!("/jobs/{}", job.id);
    (StatusCode::ACCEPTED, [(LOCATION, location)], Json(job.snapshot())).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let jobs = &state.jobs;
    Json(serde_json::json!({
        "status": "ok",
        "version": ENGINE_VERSION,
        "ruleset_version": jobs.rulesets().snapshot().version,
        "reports": jobs.store().len(),
        "jobs_in_flight": jobs.in_flight(),
        "available_workers": jobs.available_workers(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzeParams {
    #[serde(default, rename = "async")]
    run_async: bool,
}

/// Read one multipart field, enforcing the upload limit while streaming.
async fn read_field(mut field: Field<'_>, limit: usize) -> Result<Vec<u8>, ApiError> {
    let mut data: Vec<u8> = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(|e| upload_error(e, limit))? {
        if data.len() + chunk.len() > limit {
            return Err(AnalysisError::PayloadTooLarge {
                size: data.len() + chunk.len(),
                limit,
            }
            .into());
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn upload_error(err: axum::extract::multipart::MultipartError, limit: usize) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AnalysisError::PayloadTooLarge { size: limit + 1, limit }.into();
    }
    ApiError::bad_request("InvalidMultipart", err.body_text())
}

/// Content hash of an upload, computed off the async workers.
async fn hash_upload(data: Arc<[u8]>) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || content_hash(&data))
        .await
        .map_err(|e| AnalysisError::internal(format!("hashing upload failed: {}", e)).into())
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(params): Query<AnalyzeParams>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    principal.require(Scope::SubmitJobs)?;
    let limit: usize = state.config.max_upload_bytes;

    let mut upload: Option<(Option<String>, Vec<u8>)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| upload_error(e, limit))? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name: Option<String> = field.file_name().map(str::to_string);
        upload = Some((file_name, read_field(field, limit).await?));
        break;
    }
    let (file_name, data) =
        upload.ok_or_else(|| ApiError::bad_request("MissingFile", "multipart field 'file' is required"))?;
    log::info!(
        "Key {} submitted {} ({} bytes)",
        principal.key_id,
        file_name.as_deref().unwrap_or("<unnamed>"),
        data.len()
    );

    let data: Arc<[u8]> = Arc::from(data);
    let hash: String = hash_upload(Arc::clone(&data)).await?;
    let submission: Submission = state.jobs.submit_hashed(data, hash, file_name)?;
    if params.run_async {
        if let Some(job) = submission.job() {
            return Ok(accepted(job));
        }
    }
    let report: Arc<AnalysisReport> = submission.report().await?;
    Ok(Json(analysis_summary(&report)).into_response())
}

#[derive(Debug, Deserialize)]
struct ResultsParams {
    file: String,
}

async fn results(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(params): Query<ResultsParams>,
) -> Result<Json<AnalysisReport>, ApiError> {
    principal.require(Scope::ReadReports)?;
    let report = find_report(&state, &params.file)?;
    Ok(Json(rounded_report(&report)))
}

async fn protocol(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(file): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    principal.require(Scope::ReadReports)?;
    let report = find_report(&state, &file)?;
    let instances: Vec<ProtocolGraph> = report.protocols.iter().map(rounded_graph).collect();

    // largest instance first, earliest instance on ties
    let primary: Option<&ProtocolGraph> = instances
        .iter()
        .max_by(|a, b| a.nodes.len().cmp(&b.nodes.len()).then(b.instance.cmp(&a.instance)));
    let body = match primary {
        Some(graph) => serde_json::json!({
            "file": report.display_name(),
            "nodes": graph.nodes,
            "edges": graph.edges,
            "anomaly_score": graph.anomaly_score,
            "template": graph.template,
            "instances": instances,
        }),
        None => serde_json::json!({
            "file": report.display_name(),
            "nodes": [],
            "edges": [],
            "anomaly_score": 0.0,
            "template": null,
            "instances": [],
        }),
    };
    Ok(Json(body))
}

async fn compliance(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    principal.require(Scope::ReadReports)?;
    let report = find_report(&state, &file)?;
    Ok(Json(&report.compliance).into_response())
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    principal.require(Scope::SubmitJobs)?;
    let job = find_job(&state, &id)?;
    Ok(Json(job.snapshot()).into_response())
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    principal.require(Scope::SubmitJobs)?;
    let job = find_job(&state, &id)?;
    if !job.cancel() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "JobFinished",
            "InputError",
            format!("job {} has already finished", job.id),
        ));
    }
    log::info!("Key {} cancelled job {}", principal.key_id, job.id);
    Ok(accepted(&job))
}

async fn revoke_key(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if principal.key_id != id {
        return Err(ApiError::forbidden("keys can only revoke themselves"));
    }
    if !state.keys.revoke(&id) {
        return Err(ApiError::not_found(format!("no key {}", id)));
    }
    state.persist_keys();
    Ok(Json(serde_json::json!({ "id": id, "revoked": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_upload() {
        let data: Arc<[u8]> = Arc::from(&b"firmware"[..]);
        assert_eq!(hash_upload(Arc::clone(&data)).await.unwrap(), content_hash(&data));
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(0.9375), 0.938);
        assert_eq!(round3(0.94), 0.94);
        assert_eq!(round3(1.0), 1.0);
    }
}

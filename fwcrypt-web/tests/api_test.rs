// HTTP API behavior through the full router
#[path = "../../fwcrypt-core/tests/fixtures/mod.rs"]
mod fixtures;

#[cfg(test)]
mod tests {
    use super::fixtures;
    use axum::body::Body;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use fwcrypt_web::security::{hash_token, ApiKeyConfig, Scope};
    use fwcrypt_web::{router, AppState, ServerConfig};
    use serde_json::Value;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower::ServiceExt;

    const READER: &str = "bb_test_sk_reader";
    const SUBMITTER: &str = "bb_live_sk_submitter";
    const LEGACY: &str = "bb_legacy_sk_revoked";
    const BOUNDARY: &str = "fwcrypt-test-boundary";

    fn key(id: &str, token: &str, scopes: Vec<Scope>, revoked: bool) -> ApiKeyConfig {
        ApiKeyConfig {
            id: id.to_string(),
            name: format!("{} key", id),
            token_sha256: hash_token(token),
            scopes,
            revoked,
        }
    }

    fn config(max_upload_bytes: usize) -> ServerConfig {
        let mut config = ServerConfig {
            max_upload_bytes,
            api_keys: vec![
                key("reader", READER, vec![Scope::ReadReports], false),
                key("ci", SUBMITTER, vec![Scope::ReadReports, Scope::SubmitJobs], false),
                key("legacy", LEGACY, vec![Scope::ReadReports, Scope::SubmitJobs], true),
            ],
            ..ServerConfig::default()
        };
        config.engine.workers = 2;
        config
    }

    fn app_with(config: ServerConfig, path: Option<PathBuf>) -> (Arc<AppState>, Router) {
        let state = Arc::new(AppState::new(config, path).unwrap());
        (state.clone(), router(state))
    }

    fn app() -> (Arc<AppState>, Router) {
        app_with(config(1024 * 1024), None)
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn request(method: &str, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    fn upload(uri: &str, token: &str, field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
        let mut body: Vec<u8> = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, field, file_name
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let (_, app) = app();
        let (status, body) = send(&app, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["ruleset_version"], "2025.1");
    }

    #[tokio::test]
    async fn test_missing_or_unknown_key() {
        let (_, app) = app();
        for token in [None, Some("bb_live_sk_unknown")] {
            let (status, body) = send(&app, get("/results?file=fw.bin", token)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["error"]["code"], "Unauthorized");
            assert_eq!(body["error"]["category"], "AuthError");
        }
    }

    #[tokio::test]
    async fn test_revoked_key_fails_immediately() {
        let (_, app) = app();
        let (status, body) = send(&app, get("/results?file=firmware.bin", Some(READER))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NotFound");

        let (status, body) = send(&app, request("POST", "/keys/reader/revoke", READER)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], true);

        let (status, body) = send(&app, get("/results?file=firmware.bin", Some(READER))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "Unauthorized");

        // revoked in configuration
        let (status, _) = send(&app, get("/results?file=firmware.bin", Some(LEGACY))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_revocation_is_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        let config = config(1024);
        config.save(&path).unwrap();
        let (_, app) = app_with(config, Some(path.clone()));

        let (status, _) = send(&app, request("POST", "/keys/ci/revoke", SUBMITTER)).await;
        assert_eq!(status, StatusCode::OK);
        let saved = ServerConfig::load(&path).unwrap();
        let ci = saved.api_keys.iter().find(|k| k.id == "ci").unwrap();
        assert!(ci.revoked);
        assert!(!saved.api_keys.iter().find(|k| k.id == "reader").unwrap().revoked);
    }

    #[tokio::test]
    async fn test_keys_cannot_revoke_each_other() {
        let (_, app) = app();
        let (status, body) = send(&app, request("POST", "/keys/ci/revoke", READER)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "Forbidden");
        let (status, _) = send(&app, get("/results?file=fw.bin", Some(SUBMITTER))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_requires_scope() {
        let (_, app) = app();
        let image = fixtures::aes_image();
        let (status, body) = send(&app, upload("/analyze", READER, "file", "aes.bin", &image)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["message"], "API key lacks the submit_jobs scope");
    }

    #[tokio::test]
    async fn test_analyze_then_read_reports() {
        let (_, app) = app();
        let image = fixtures::aes_image();
        let (status, body) = send(&app, upload("/analyze", SUBMITTER, "file", "aes.bin", &image)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["file"], "aes.bin");
        assert_eq!(body["arch"], "ARM");
        assert_eq!(body["size"], 0x14B0);
        assert_eq!(body["summary"]["aes"]["present"], true);
        assert_eq!(body["summary"]["aes"]["algorithm"], "AES-128");
        assert_eq!(body["summary"]["aes"]["confidence"], 0.94);
        assert_eq!(body["risk_level"], "Low");
        let hash = body["content_hash"].as_str().unwrap().to_string();

        let (status, report) = send(&app, get("/results?file=aes.bin", Some(READER))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["content_hash"], hash.as_str());
        let (status, by_hash) = send(&app, get(&format!("/results?file={}", hash), Some(READER))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_hash, report);

        let (status, compliance) = send(&app, get("/compliance/aes.bin", Some(READER))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(compliance["ruleset_version"], "2025.1");
        assert_eq!(compliance["risk_level"], "Low");
        assert!(compliance["recommendations"].as_array().unwrap().is_empty());

        let (status, protocol) = send(&app, get("/protocol/aes.bin", Some(READER))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(protocol["nodes"].is_array());
        assert!(protocol["instances"].is_array());
    }

    #[tokio::test]
    async fn test_md5_compliance_ranking() {
        let (_, app) = app();
        let image = fixtures::md5_image();
        let (status, body) = send(&app, upload("/analyze", SUBMITTER, "file", "md5.bin", &image)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["risk_score"].as_u64().unwrap() >= 68);

        let (_, compliance) = send(&app, get("/compliance/md5.bin", Some(READER))).await;
        assert_eq!(compliance["recommendations"][0]["title"], "Replace MD5 with SHA-256");
        let md5 = compliance["verdicts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|v| v["algorithm"] == "MD5")
            .unwrap();
        assert_eq!(md5["in_use"], true);
        assert_eq!(md5["deprecated"], true);
    }

    #[tokio::test]
    async fn test_unknown_architecture_error_body() {
        let (state, app) = app();
        let (status, body) = send(&app, upload("/analyze", SUBMITTER, "file", "zeros.bin", &[0u8; 64])).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "UnknownArchitecture");
        assert_eq!(body["error"]["category"], "InputError");
        assert!(state.jobs.store().is_empty());
    }

    #[tokio::test]
    async fn test_async_submission_and_job_status() {
        let (state, app) = app();
        let image = fixtures::md5_image();
        let response = app
            .clone()
            .oneshot(upload("/analyze?async=true", SUBMITTER, "file", "md5.bin", &image))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let location = response.headers()[LOCATION].to_str().unwrap().to_string();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let job: Value = serde_json::from_slice(&bytes).unwrap();
        let id = job["id"].as_u64().unwrap();
        assert_eq!(location, format!("/jobs/{}", id));
        assert_eq!(job["file_name"], "md5.bin");

        state.jobs.job(id).unwrap().wait().await.unwrap();
        let (status, job) = send(&app, get(&location, Some(SUBMITTER))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"]["state"], "completed");

        let (status, body) = send(&app, request("DELETE", &location, SUBMITTER)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "JobFinished");

        for missing in ["/jobs/999", "/jobs/latest"] {
            let (status, _) = send(&app, get(missing, Some(SUBMITTER))).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
        let (status, _) = send(&app, get(&location, Some(READER))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_upload_limit() {
        let (_, app) = app_with(config(16), None);
        let image = fixtures::aes_image();
        let (status, body) = send(&app, upload("/analyze", SUBMITTER, "file", "aes.bin", &image)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"]["code"], "PayloadTooLarge");
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let (_, app) = app();
        let (status, body) = send(&app, upload("/analyze", SUBMITTER, "firmware", "aes.bin", b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MissingFile");
    }
}

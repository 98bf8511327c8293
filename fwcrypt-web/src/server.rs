use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use fwcrypt_core::engine::compliance::RulesetStore;
use fwcrypt_core::engine::jobs::{JobManager, JobOptions};
use fwcrypt_core::engine::pipeline::Pipeline;
use fwcrypt_core::engine::store::ReportStore;

use crate::config::ServerConfig;
use crate::routes;
use crate::security::ApiKeyStore;
use crate::webhooks::WebhookNotifier;

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub struct AppState {
    pub jobs: Arc<JobManager>,
    pub keys: ApiKeyStore,
    pub config: ServerConfig,
    /// File the configuration was read from; revocations are written back to it
    pub config_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: ServerConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let engine = &config.engine;
        let ruleset = engine.ruleset().context("Failed to load compliance ruleset")?;
        log::info!("Compliance ruleset {} ({} algorithms)", ruleset.version, ruleset.algorithms.len());
        let store = ReportStore::from_dir(engine.report_dir.as_deref())?;

        let mut jobs = JobManager::new(
            JobOptions::from(engine),
            Arc::new(Pipeline::new(engine.pipeline_options())),
            Arc::new(RulesetStore::new(ruleset)),
            Arc::new(store),
        );
        if let Some(notifier) = WebhookNotifier::from_config(&config.webhooks) {
            jobs = jobs.with_listener(Arc::new(notifier));
        }

        Ok(Self {
            jobs: Arc::new(jobs),
            keys: ApiKeyStore::new(config.api_keys.clone()),
            config,
            config_path,
        })
    }

    /// Write the current key table back to the configuration file, if there is one.
    pub fn persist_keys(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let mut config: ServerConfig = self.config.clone();
        config.api_keys = self.keys.snapshot();
        if let Err(err) = config.save(path) {
            log::warn!("Revocation not persisted: {:#}", err);
        }
    }
}

/// Full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit: usize = state.config.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);
    routes::api_routes()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ServerConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let state = Arc::new(AppState::new(config, config_path)?);
        Ok(Self { state })
    }

    pub async fn run(self) -> Result<()> {
        #[cfg(unix)]
        spawn_ruleset_reloader(Arc::clone(&self.state));

        let addr = self.state.config.bind_address;
        let app = router(self.state);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        log::info!("Analysis API listening on http://{}", addr);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Reload the configured ruleset file on SIGHUP. Running jobs keep their snapshot.
#[cfg(unix)]
fn spawn_ruleset_reloader(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Some(path) = state.config.engine.ruleset_path.clone() else {
        return;
    };
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            log::warn!("Ruleset reload on SIGHUP unavailable: {}", err);
            return;
        }
    };
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match state.jobs.rulesets().reload(&path) {
                Ok(ruleset) => log::info!("Reloaded ruleset {} from {}", ruleset.version, path.display()),
                Err(err) => log::warn!("Keeping current ruleset: {}", err),
            }
        }
    });
}

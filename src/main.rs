mod api;
mod auth;
mod chunk_store;
mod config;
mod descriptor;
mod identifiers;
mod insert;
mod introspect;
mod mcp_api;
mod models;
mod rate_limit;
mod schema_infer;
mod sql_gate;
mod staging;
mod storage_class;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use tokio::{sync::RwLock, task};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use config::Config;
use models::{QueryResponse, StageResponse};
use rate_limit::RateLimiter;
use staging::{lock_compartment, Compartment};

const MAX_STAGE_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub compartments: Arc<RwLock<HashMap<String, Arc<Mutex<Compartment>>>>>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    async fn compartment(&self, access_id: &str) -> Result<Arc<Mutex<Compartment>>> {
        {
            let guard = self.compartments.read().await;
            if let Some(existing) = guard.get(access_id) {
                return Ok(existing.clone());
            }
        }

        let data_root = self.config.data_root.clone();
        let id = access_id.to_string();
        let created = task::spawn_blocking(move || Compartment::open_at(&data_root, &id))
            .await
            .context("Compartment open task failed")??;

        let mut guard = self.compartments.write().await;
        Ok(guard
            .entry(access_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(created)))
            .clone())
    }

    /// Every operation locks the compartment inside the blocking task, so
    /// a compartment sees one stage-or-query operation at a time.
    pub async fn stage(
        &self,
        access_id: &str,
        payload: Value,
        descriptor: Option<String>,
    ) -> StageResponse {
        let handle = match self.compartment(access_id).await {
            Ok(handle) => handle,
            Err(err) => return StageResponse::failure(format!("{err:#}")),
        };
        let compress = self.config.compress_chunks;

        task::spawn_blocking(move || {
            lock_compartment(&handle).stage(&payload, descriptor.as_deref(), compress)
        })
        .await
        .unwrap_or_else(|err| StageResponse::failure(format!("Staging task failed: {err}")))
    }

    pub async fn query(&self, access_id: &str, sql: String) -> QueryResponse {
        let handle = match self.compartment(access_id).await {
            Ok(handle) => handle,
            Err(err) => return QueryResponse::failure(format!("{err:#}"), sql),
        };
        let statement = sql.clone();

        task::spawn_blocking(move || lock_compartment(&handle).query(&statement))
            .await
            .unwrap_or_else(|err| {
                QueryResponse::failure(format!("Query task failed: {err}"), sql)
            })
    }

    pub async fn introspect(&self, access_id: &str) -> Result<Value> {
        let handle = self.compartment(access_id).await?;
        task::spawn_blocking(move || lock_compartment(&handle).introspect())
            .await
            .context("Introspection task failed")?
    }

    pub async fn table_columns(&self, access_id: &str, table: String) -> Result<Value> {
        let handle = self.compartment(access_id).await?;
        task::spawn_blocking(move || lock_compartment(&handle).table_columns(&table))
            .await
            .context("Column listing task failed")?
    }

    pub async fn chunking_stats(&self, access_id: &str) -> Result<Value> {
        let handle = self.compartment(access_id).await?;
        task::spawn_blocking(move || lock_compartment(&handle).chunking_stats())
            .await
            .context("Chunk statistics task failed")?
    }

    pub async fn delete(&self, access_id: &str) -> Result<()> {
        let handle = self.compartment(access_id).await?;
        task::spawn_blocking(move || lock_compartment(&handle).delete())
            .await
            .context("Deletion task failed")??;

        let mut registry = self.compartments.write().await;
        registry.remove(access_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "biograph_staging_api=info,tower_http=info".into()),
        )
        .init();

    let mut config = Config::from_env()?;
    if let Err(err) = ensure_data_root(&config.data_root) {
        let original_root = config.data_root.clone();
        let fallback_roots = [
            PathBuf::from("/tmp/biograph-staging-api/data"),
            PathBuf::from("./data"),
        ];

        warn!(
            error = %err,
            original_root = %original_root.display(),
            "Failed to initialize configured data root; trying fallbacks"
        );

        let mut selected_root = None;
        for fallback in fallback_roots {
            match ensure_data_root(&fallback) {
                Ok(()) => {
                    selected_root = Some(fallback);
                    break;
                }
                Err(fallback_err) => {
                    warn!(
                        error = %fallback_err,
                        fallback_root = %fallback.display(),
                        "Fallback data root unavailable"
                    );
                }
            }
        }

        match selected_root {
            Some(root) => {
                info!(data_root = %root.display(), "Using fallback data root");
                config.data_root = root;
            }
            None => {
                return Err(err).context("No writable data root available");
            }
        }
    }

    info!(
        bind_addr = %config.bind_addr,
        data_root = %config.data_root.display(),
        compress_chunks = config.compress_chunks,
        "Runtime configuration initialized"
    );

    let state = AppState {
        rate_limiter: Arc::new(RateLimiter::new(
            config.rate_limit_per_minute,
            config.rate_limit_burst,
        )),
        compartments: Arc::new(RwLock::new(HashMap::new())),
        config,
    };

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/mcp", post(mcp_api::mcp))
        .route(
            "/v1/staging/{access_id}",
            post(api::stage_payload).delete(api::delete_staging),
        )
        .route("/v1/staging/{access_id}/query", post(api::query_staged))
        .route("/v1/staging/{access_id}/schema", get(api::get_schema))
        .route(
            "/v1/staging/{access_id}/tables/{table}",
            get(api::get_table_columns),
        )
        .route(
            "/v1/staging/{access_id}/chunking",
            get(api::get_chunking_stats),
        )
        .layer(DefaultBodyLimit::max(MAX_STAGE_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(state.config.bind_addr).await?;
    info!("biograph-staging-api listening on {}", state.config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn ensure_data_root(path: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create data root at {}", path.display()))
}

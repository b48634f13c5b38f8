//! HTTP API: thin JSON adapters over the store, scheduler, and ranker.
//!
//! Surface kept deliberately small: archive status, per-paper status,
//! similarity queries, manual retry, and a rescan trigger. Pagination and
//! auth live elsewhere.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::db::Db;
use crate::error::PaperflowError;
use crate::extract::ExtractionClient;
use crate::scheduler::IngestionScheduler;
use crate::scheduler::SubmitMode;
use crate::similarity;
use crate::store;

/// Application state shared across handlers
pub struct AppState {
    pub db: Db,
    pub scheduler: Arc<IngestionScheduler>,
    pub extractor: Arc<dyn ExtractionClient>,
    pub config: Config,
    pub query_cache: Arc<EmbeddingCache>,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let allowed_origins = &state.config.http.allowed_origins;

    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(handle_health))
        .route("/papers/status", get(handle_status_counts))
        .route("/papers/similar", get(handle_similar_query))
        .route("/papers/:id/status", get(handle_paper_status))
        .route("/papers/:id/similar", get(handle_similar_to_paper))
        .route("/papers/:id/retry", post(handle_retry))
        .route("/rescan", post(handle_rescan))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Bind and serve until the task is dropped.
pub async fn serve(state: Arc<AppState>, port: u16) -> crate::error::Result<()> {
    let app = build_router(state);
    let addr = format!("127.0.0.1:{}", port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            PaperflowError::Config(format!(
                "Failed to bind HTTP server to {}: {}. Is another paperflow instance running?",
                addr, e
            ))
        })?;

    log::info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| PaperflowError::Io(std::io::Error::other(format!("HTTP server error: {}", e))))?;

    Ok(())
}

fn error_response(e: PaperflowError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        PaperflowError::PaperNotFound(_) => StatusCode::NOT_FOUND,
        PaperflowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn handle_status_counts(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match store::status_counts(&state.db).await {
        Ok(counts) => Json(json!({
            "total_papers": counts.total,
            "processed": counts.processed,
            "pending": counts.pending,
            "in_progress": counts.in_progress,
            "failed": counts.failed,
            "in_flight": state.scheduler.in_flight_count(),
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_paper_status(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match store::find_by_id(&state.db, &id).await {
        Ok(Some(row)) => Json(json!({
            "id": row.id,
            "status": row.status.as_str(),
            "attempt_count": row.attempt_count,
            "last_error": row.last_error,
            "source_path": row.source_path,
            "title": row.title,
            "updated_at": row.updated_at,
        }))
        .into_response(),
        Ok(None) => error_response(PaperflowError::PaperNotFound(id)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct SimilarParams {
    q: Option<String>,
    limit: Option<usize>,
    threshold: Option<f32>,
    title_weight: Option<f32>,
    abstract_weight: Option<f32>,
}

struct RankingDefaults {
    title_weight: f32,
    abstract_weight: f32,
    limit: usize,
    threshold: f32,
}

fn ranking_params(params: &SimilarParams, config: &Config) -> RankingDefaults {
    RankingDefaults {
        title_weight: params.title_weight.unwrap_or(config.similarity.title_weight),
        abstract_weight: params
            .abstract_weight
            .unwrap_or(config.similarity.abstract_weight),
        limit: params.limit.unwrap_or(config.similarity.default_limit),
        threshold: params.threshold.unwrap_or(config.similarity.min_score),
    }
}

async fn handle_similar_to_paper(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(params): Query<SimilarParams>,
) -> impl IntoResponse {
    let p = ranking_params(&params, &state.config);
    match similarity::similar_to_paper(
        &state.db,
        &id,
        p.title_weight,
        p.abstract_weight,
        p.limit,
        p.threshold,
    )
    .await
    {
        Ok(results) => Json(json!({ "similar_papers": results })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_similar_query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SimilarParams>,
) -> impl IntoResponse {
    let Some(query) = params.q.clone() else {
        return error_response(PaperflowError::InvalidInput(
            "missing query parameter q".to_string(),
        ))
        .into_response();
    };

    let p = ranking_params(&params, &state.config);
    match similarity::similar_to_query(
        &state.db,
        state.extractor.as_ref(),
        Some(&state.query_cache),
        &query,
        p.title_weight,
        p.abstract_weight,
        p.limit,
        p.threshold,
    )
    .await
    {
        Ok(results) => Json(json!({ "similar_papers": results })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_retry(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.scheduler.retry(&id).await {
        Ok(outcome) => Json(json!({ "id": id, "outcome": format!("{:?}", outcome) })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_rescan(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let root = state.config.archive_root().to_path_buf();
    let scheduler = Arc::clone(&state.scheduler);

    // A full scan of a large archive can take a while; run it off-request.
    tokio::spawn(async move {
        match crate::scan::discover_pdfs(&root) {
            Ok(files) => {
                let mut submitted = 0usize;
                for file in &files {
                    match scheduler.submit(file, SubmitMode::Block).await {
                        Ok(crate::scheduler::SubmitOutcome::Enqueued) => submitted += 1,
                        Ok(_) => {}
                        Err(e) => log::error!("rescan: submit {} failed: {}", file.relative_path, e),
                    }
                }
                log::info!("rescan complete: {} of {} files enqueued", submitted, files.len());
            }
            Err(e) => log::error!("rescan failed: {}", e),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

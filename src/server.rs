//! Review HTTP API and UI.
//!
//! Exposes the thread/label data for a human reviewer to confirm or correct,
//! plus the query assistant endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Review UI (`<ui_dir>/index.html`) |
//! | `GET`  | `/api/threads` | Grouped thread + label view |
//! | `GET`  | `/api/thread_labels[?parent_message_id=]` | List labels, optionally for one thread |
//! | `POST` | `/api/thread_labels/update` | Apply reviewed label updates to one thread |
//! | `POST` | `/api/query` | Ask the query assistant |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses carry `{ "error": { "code": "...", "message": "..." } }`.
//! Codes: `bad_request` (400), `not_found` (404), `internal` (500).
//! Validation failures reject the whole request; storage errors roll the
//! enclosing transaction back.
//!
//! The similarity index is loaded once at startup and treated as read-only
//! for the life of the process.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::assistant::{self, QueryOutcome};
use crate::config::{require_env, Config};
use crate::db;
use crate::index::SimilarityIndex;
use crate::llm::{GeminiClient, TextGenerator};
use crate::models::{Label, ThreadLabel};
use crate::reconcile;
use crate::threads;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    index: Arc<SimilarityIndex>,
    generator: Option<Arc<GeminiClient>>,
}

/// Starts the review server. Binds to `[server].bind` and runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    crate::migrate::apply(&pool).await?;

    // Missing or stale index degrades to "no relevant thread found" instead
    // of refusing to serve the review endpoints.
    let index = match SimilarityIndex::load(&config.index) {
        Ok(index) => {
            println!(
                "loaded similarity index: {} thread roots, {} dims",
                index.len(),
                index.dims()
            );
            index
        }
        Err(e) => {
            eprintln!("Warning: similarity index unavailable ({}); queries will find nothing", e);
            SimilarityIndex::from_parts(vec![], vec![])?
        }
    };

    // Rephrasing needs the LLM key up front; fail at startup, not per request
    let generator = if config.assistant.rephrase {
        require_env("GEMINI_API_KEY")?;
        Some(Arc::new(GeminiClient::new(
            &config.labeler.model,
            config.labeler.max_retries,
            config.labeler.timeout_secs,
        )?))
    } else {
        None
    };

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        index: Arc::new(index),
        generator,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(handle_ui))
        .route("/api/threads", get(handle_threads))
        .route("/api/thread_labels", get(handle_thread_labels))
        .route("/api/thread_labels/update", post(handle_update))
        .route("/api/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("review server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET / ============

async fn handle_ui(State(state): State<AppState>) -> Response {
    let index_path = state
        .config
        .server
        .ui_dir
        .as_ref()
        .map(|dir| dir.join("index.html"));

    match index_path.and_then(|p| std::fs::read_to_string(p).ok()) {
        Some(content) => Html(content).into_response(),
        None => (StatusCode::NOT_FOUND, "Review UI not found").into_response(),
    }
}

// ============ GET /api/threads ============

#[derive(Serialize)]
struct ThreadView {
    id: String,
    created: i64,
    messages: Vec<MessageView>,
}

#[derive(Serialize)]
struct MessageView {
    message_id: String,
    text: String,
    label: Option<String>,
    confidence: Option<f64>,
    reviewed: Option<bool>,
    created: i64,
}

async fn handle_threads(State(state): State<AppState>) -> Result<Json<Vec<ThreadView>>, AppError> {
    let messages = threads::fetch_messages(&state.pool, None)
        .await
        .map_err(internal)?;

    let label_rows = sqlx::query_as::<_, (String, String, Option<f64>, bool)>(
        "SELECT message_id, label, confidence_score, reviewed FROM thread_labels",
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal)?;

    let labels: HashMap<String, (String, Option<f64>, bool)> = label_rows
        .into_iter()
        .map(|(id, label, confidence, reviewed)| (id, (label, confidence, reviewed)))
        .collect();

    let view = threads::assemble(&messages)
        .into_iter()
        .map(|thread| {
            let mut all = vec![thread.root.clone()];
            all.extend(thread.children);
            ThreadView {
                id: thread.root.message_id.clone(),
                created: thread.root.created,
                messages: all
                    .into_iter()
                    .map(|m| {
                        let label = labels.get(&m.message_id);
                        MessageView {
                            message_id: m.message_id,
                            text: m.text,
                            label: label.map(|(l, _, _)| l.clone()),
                            confidence: label.and_then(|(_, c, _)| *c),
                            reviewed: label.map(|(_, _, r)| *r),
                            created: m.created,
                        }
                    })
                    .collect(),
            }
        })
        .collect();

    Ok(Json(view))
}

// ============ GET /api/thread_labels ============

#[derive(Deserialize)]
struct LabelListParams {
    parent_message_id: Option<String>,
}

async fn handle_thread_labels(
    State(state): State<AppState>,
    Query(params): Query<LabelListParams>,
) -> Result<Json<Vec<ThreadLabel>>, AppError> {
    let rows = match params.parent_message_id {
        Some(ref root_id) => {
            let members = threads::fetch_thread_member_ids(&state.pool, root_id)
                .await
                .map_err(internal)?;
            if members.is_empty() {
                return Err(not_found(format!(
                    "no thread messages found for parent_message_id {}",
                    root_id
                )));
            }

            let mut all = fetch_labels(&state.pool).await.map_err(internal)?;
            all.retain(|row| members.contains(&row.message_id));
            all
        }
        None => fetch_labels(&state.pool).await.map_err(internal)?,
    };

    Ok(Json(rows))
}

async fn fetch_labels(pool: &SqlitePool) -> anyhow::Result<Vec<ThreadLabel>> {
    let rows = sqlx::query_as::<_, (String, String, Option<f64>, Option<String>, bool)>(
        "SELECT message_id, label, confidence_score, solution_message_id, reviewed
         FROM thread_labels ORDER BY message_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(message_id, label, confidence_score, solution_message_id, reviewed)| ThreadLabel {
                message_id,
                label,
                confidence_score,
                solution_message_id,
                reviewed,
            },
        )
        .collect())
}

// ============ POST /api/thread_labels/update ============

#[derive(Deserialize)]
struct UpdateRequest {
    thread_parent_id: String,
    updates: Vec<LabelUpdate>,
}

#[derive(Deserialize)]
struct LabelUpdate {
    message_id: String,
    label: Label,
    confidence_score: f64,
    #[serde(default)]
    reviewed: bool,
}

#[derive(Serialize)]
struct UpdateResponse {
    success: bool,
    updated: usize,
    solution_message_id: Option<String>,
}

/// Apply reviewer updates to one thread, then recompute its solution from
/// committed `answer` rows. Everything happens in one transaction: a request
/// that fails validation changes nothing.
async fn handle_update(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<UpdateResponse>, AppError> {
    // Manual parse so malformed bodies are a 400, not a framework rejection
    let request: UpdateRequest =
        serde_json::from_value(body).map_err(|e| bad_request(format!("invalid request: {}", e)))?;

    let members = threads::fetch_thread_member_ids(&state.pool, &request.thread_parent_id)
        .await
        .map_err(internal)?;
    if members.is_empty() {
        return Err(not_found(format!(
            "no thread messages found for parent_message_id {}",
            request.thread_parent_id
        )));
    }

    for update in &request.updates {
        if !members.contains(&update.message_id) {
            return Err(bad_request(format!(
                "message {} is not part of thread {}",
                update.message_id, request.thread_parent_id
            )));
        }
        if !(0.0..=1.0).contains(&update.confidence_score) {
            return Err(bad_request(format!(
                "confidence_score {} for {} outside [0, 1]",
                update.confidence_score, update.message_id
            )));
        }
    }

    let member_ids: Vec<String> = members.into_iter().collect();

    let mut tx = state.pool.begin().await.map_err(internal)?;
    for update in &request.updates {
        reconcile::upsert_label(
            &mut tx,
            &update.message_id,
            update.label,
            update.confidence_score,
            update.reviewed,
        )
        .await
        .map_err(internal)?;
    }
    let solution = reconcile::recompute_solution(&mut tx, &member_ids)
        .await
        .map_err(internal)?;
    tx.commit().await.map_err(internal)?;

    Ok(Json(UpdateResponse {
        success: true,
        updated: request.updates.len(),
        solution_message_id: solution,
    }))
}

// ============ POST /api/query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: QueryRequest =
        serde_json::from_value(body).map_err(|_| bad_request("missing query text"))?;

    if request.query.trim().is_empty() {
        return Err(bad_request("missing query text"));
    }

    let generator = state
        .generator
        .as_ref()
        .map(|g| g.as_ref() as &dyn TextGenerator);

    let outcome = assistant::answer_query(
        &state.pool,
        &state.index,
        &state.config,
        generator,
        &request.query,
    )
    .await
    .map_err(|e| {
        let msg = e.to_string();
        if msg.contains("disabled") {
            bad_request(msg)
        } else {
            internal(msg)
        }
    })?;

    let response = match outcome {
        QueryOutcome::TooVague => serde_json::json!({
            "found": false,
            "message": "Your question seems a bit unclear. Could you provide more details so I can help better?",
        }),
        QueryOutcome::NoMatch => serde_json::json!({
            "found": false,
            "message": "no relevant thread found",
        }),
        QueryOutcome::Match { matched, rephrased } => {
            let mut response = serde_json::json!({
                "found": true,
                "thread_id": matched.thread_id,
                "thread_question": matched.thread_question,
                "answer": matched.answer,
                "follow_ups": matched.follow_ups,
                "similarity": matched.similarity,
            });
            if let Some(reply) = rephrased {
                response["assistant_response"] = serde_json::json!(reply.response);
                response["confidence_score"] = serde_json::json!(reply.confidence_score);
                response["reasoning"] = serde_json::json!(reply.reasoning);
            }
            response
        }
    };

    Ok(Json(response))
}

//! # Chat Server Routes
//!
//! Actix handlers for the chat page and the JSON chat API. Generation is
//! CPU-bound, so each request hands it to the blocking thread pool.

use crate::cache::ResponseCache;
use crate::responder::{ResponseError, ResponseGenerator};
use actix_files::Files;
use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Model name clients pass in `model` to reach the local GPT-J responder.
pub const GPTJ_MODEL_NAME: &str = "gpt-j";

const INDEX_HTML: &str = include_str!("index.html");

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: Option<PathBuf>,
    pub cache_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            static_dir: None,
            cache_ttl: crate::cache::DEFAULT_TTL,
        }
    }
}

/// Shared by every worker.
pub struct AppState {
    pub responder: ResponseGenerator,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(responder: ResponseGenerator, cache: Arc<ResponseCache>) -> Self {
        Self { responder, cache }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub reply: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub status: String,
    pub model: String,
}

fn error_response(mut builder: actix_web::HttpResponseBuilder, message: impl Into<String>) -> HttpResponse {
    builder.json(ErrorBody { error: message.into() })
}

// malformed bodies get the same JSON error shape as the handlers
fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let body = error_response(HttpResponse::BadRequest(), format!("Invalid request body: {}", err));
    InternalError::from_response(err, body).into()
}

/// Serves the chat page at `/`.
pub async fn index() -> impl Responder {
    HttpResponse::Ok().content_type("text/html; charset=utf-8").body(INDEX_HTML)
}

pub async fn health(state: web::Data<AppState>) -> impl Responder {
    let status = if state.responder.is_available() { "ok" } else { "degraded" };
    HttpResponse::Ok().json(Health {
        status: status.to_string(),
        model: state.responder.model_id().to_string(),
    })
}

/// `POST /api/chat` with `{"message": "...", "model": "gpt-j"}`.
///
/// Returns `{"reply": "..."}`, or `{"error": "..."}` with 400 for bad input,
/// 503 when the model never loaded and 500 when generation fails.
pub async fn chat(state: web::Data<AppState>, request: web::Json<ChatRequest>) -> HttpResponse {
    let request = request.into_inner();
    let message = request.message.as_deref().map(str::trim).unwrap_or_default().to_string();
    if message.is_empty() {
        return error_response(HttpResponse::BadRequest(), "Message cannot be empty");
    }
    if let Some(model) = request.model.as_deref() {
        if model != GPTJ_MODEL_NAME {
            return error_response(HttpResponse::BadRequest(), format!("Unsupported model '{}'", model));
        }
    }

    if let Some(reply) = state.cache.get(&message) {
        info!("Serving cached reply");
        return HttpResponse::Ok().json(ChatReply { reply });
    }

    let responder = state.responder.clone();
    let prompt = message.clone();
    match web::block(move || responder.generate_response(&prompt)).await {
        Ok(Ok(reply)) => {
            state.cache.purge_expired();
            state.cache.put(message, reply.clone());
            HttpResponse::Ok().json(ChatReply { reply })
        }
        Ok(Err(e @ ResponseError::ModelUnavailable { .. })) => {
            error!("GPT-J Error: {}", e);
            error_response(HttpResponse::ServiceUnavailable(), "GPT-J model is not available.")
        }
        Ok(Err(e @ ResponseError::GenerationFailed(_))) => {
            error!("GPT-J Error: {}", e);
            error_response(
                HttpResponse::InternalServerError(),
                "Failed to generate response using GPT-J.",
            )
        }
        Err(e) => {
            error!("Generation task did not complete: {}", e);
            error_response(
                HttpResponse::InternalServerError(),
                "Failed to generate response using GPT-J.",
            )
        }
    }
}

/// Registers the page and API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/", web::get().to(index))
        .route("/api/health", web::get().to(health))
        .route("/api/chat", web::post().to(chat));
}

pub async fn run_server(config: ServerConfig, responder: ResponseGenerator) -> std::io::Result<()> {
    let cache = Arc::new(ResponseCache::new(config.cache_ttl, crate::cache::DEFAULT_CAPACITY));
    let state = web::Data::new(AppState::new(responder, cache));
    let static_dir = config.static_dir.clone();

    info!("Server running at http://{}:{}/", config.host, config.port);
    HttpServer::new(move || {
        let static_dir = static_dir.clone();
        App::new()
            .app_data(state.clone())
            .configure(configure)
            .configure(move |cfg| {
                if let Some(dir) = static_dir {
                    cfg.service(Files::new("/static", dir));
                }
            })
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}

//! GPT-J text generation in pure Rust.
//!
//! [`loader::load_pipeline`] resolves a checkpoint (local directory or
//! Hugging Face Hub), loads its safetensors weights into an ndarray GPT-J
//! model and wraps it in a [`pipeline::TextGenerationPipeline`].
//! [`responder::ResponseGenerator`] answers prompts with it, and the optional
//! `server` feature exposes the same over HTTP.

pub mod attention;
pub mod cache;
pub mod common;
pub mod config;
pub mod loader;
pub mod mlp;
pub mod model;
pub mod model_loader;
pub mod pipeline;
pub mod registry;
pub mod responder;
pub mod sampling;
pub mod system_resources;
pub mod tokenizer;
#[cfg(feature = "server")]
pub mod ui;

pub use loader::{load_pipeline, LoadError};
pub use pipeline::{GeneratedText, TextGenerationPipeline, TextGenerator};
pub use registry::{ModelSource, DEFAULT_MODEL_ID};
pub use responder::{ResponseError, ResponseGenerator, RESPONSE_MAX_LENGTH};

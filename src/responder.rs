//! Turns a user prompt into a single reply from the loaded model.

use crate::config::GenerationConfig;
use crate::loader::LoadError;
use crate::pipeline::{PipelineError, TextGenerator};
use log::{error, info, warn};
use std::sync::Arc;

/// Total token limit for a reply, prompt included.
pub const RESPONSE_MAX_LENGTH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("model {model_id} is unavailable: {source}")]
    ModelUnavailable {
        model_id: String,
        #[source]
        source: Arc<LoadError>,
    },
    #[error("AI Error: Failed to generate response using GPT-J. {0}")]
    GenerationFailed(#[source] PipelineError),
}

/// Per-call knobs on top of the fixed reply settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseOptions {
    pub max_length: Option<usize>,
    pub seed: Option<u64>,
    pub greedy: bool,
}

enum State {
    Ready(Arc<dyn TextGenerator>),
    Unavailable(Arc<LoadError>),
}

/// Holds the outcome of loading a model and answers prompts with it.
///
/// A generator built from a failed load stays usable: every call reports
/// `ModelUnavailable` instead of panicking.
#[derive(Clone)]
pub struct ResponseGenerator {
    model_id: String,
    state: Arc<State>,
}

impl ResponseGenerator {
    pub fn new(model_id: impl Into<String>, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            model_id: model_id.into(),
            state: Arc::new(State::Ready(generator)),
        }
    }

    pub fn unavailable(model_id: impl Into<String>, cause: LoadError) -> Self {
        let model_id = model_id.into();
        warn!("Model {} unavailable, replies will fail: {}", model_id, cause);
        Self {
            model_id,
            state: Arc::new(State::Unavailable(Arc::new(cause))),
        }
    }

    pub fn from_load<G>(model_id: impl Into<String>, outcome: Result<G, LoadError>) -> Self
    where
        G: TextGenerator + 'static,
    {
        match outcome {
            Ok(generator) => Self::new(model_id, Arc::new(generator)),
            Err(cause) => Self::unavailable(model_id, cause),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_available(&self) -> bool {
        matches!(*self.state, State::Ready(_))
    }

    /// Generates a continuation of `prompt`, up to 100 tokens in total, without the prompt itself.
    pub fn generate_response(&self, prompt: &str) -> Result<String, ResponseError> {
        self.generate_response_with(prompt, &ResponseOptions::default())
    }

    pub fn generate_response_with(&self, prompt: &str, options: &ResponseOptions) -> Result<String, ResponseError> {
        let generator = match &*self.state {
            State::Ready(generator) => generator,
            State::Unavailable(cause) => {
                return Err(ResponseError::ModelUnavailable {
                    model_id: self.model_id.clone(),
                    source: Arc::clone(cause),
                })
            }
        };

        let params = reply_params(generator.defaults(), options);
        let candidates = generator.generate(prompt, &params).map_err(|e| {
            error!("Generation failed for {}: {}", self.model_id, e);
            ResponseError::GenerationFailed(e)
        })?;
        let first = candidates
            .into_iter()
            .next()
            .ok_or(ResponseError::GenerationFailed(PipelineError::NoCandidates))?;
        info!(
            "Generated {} tokens ({:?})",
            first.token_ids.len(),
            first.finish_reason
        );
        Ok(first.generated_text)
    }
}

fn reply_params(defaults: &GenerationConfig, options: &ResponseOptions) -> GenerationConfig {
    let mut params = GenerationConfig {
        max_length: options.max_length.unwrap_or(RESPONSE_MAX_LENGTH),
        max_new_tokens: None,
        num_return_sequences: 1,
        return_full_text: false,
        ..defaults.clone()
    };
    if options.seed.is_some() {
        params.seed = options.seed;
    }
    if options.greedy {
        params.do_sample = false;
    }
    params
}

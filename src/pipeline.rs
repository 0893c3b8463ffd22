//! Text-generation pipeline: tokenize, run the model autoregressively, decode.

use crate::config::GenerationConfig;
use crate::model::{CausalLm, ModelError};
use crate::sampling::LogitsProcessor;
use crate::tokenizer::{TokenizerError, TokenizerWrapper};
use log::{debug, trace};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("prompt produced no tokens")]
    EmptyPrompt,
    #[error("prompt is {prompt_tokens} tokens, which leaves no room under a limit of {limit}")]
    PromptTooLong { prompt_tokens: usize, limit: usize },
    #[error("invalid generation parameter: {0}")]
    InvalidParameter(String),
    #[error("generation produced no candidates")]
    NoCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model emitted the end-of-text token.
    Eos,
    /// The token budget ran out.
    Length,
}

/// One generated candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedText {
    pub generated_text: String,
    /// New tokens only; the prompt is not included.
    pub token_ids: Vec<u32>,
    pub finish_reason: FinishReason,
}

/// Anything that turns a prompt into candidate continuations.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationConfig) -> Result<Vec<GeneratedText>, PipelineError>;

    /// Parameters the generator was loaded with.
    fn defaults(&self) -> &GenerationConfig;
}

pub struct TextGenerationPipeline {
    model: Box<dyn CausalLm>,
    tokenizer: TokenizerWrapper,
    defaults: GenerationConfig,
    eos_token_id: u32,
}

impl TextGenerationPipeline {
    pub fn new(
        model: Box<dyn CausalLm>,
        tokenizer: TokenizerWrapper,
        defaults: GenerationConfig,
        eos_token_id: u32,
    ) -> Self {
        Self {
            model,
            tokenizer,
            defaults,
            eos_token_id,
        }
    }

    fn validate(params: &GenerationConfig) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidParameter(msg));
        if params.num_return_sequences == 0 {
            return invalid("num_return_sequences must be at least 1".to_string());
        }
        if !(params.repetition_penalty.is_finite() && params.repetition_penalty > 0.0) {
            return invalid(format!("repetition_penalty must be positive, got {}", params.repetition_penalty));
        }
        if params.do_sample {
            if !(params.temperature.is_finite() && params.temperature > 0.0) {
                return invalid(format!("temperature must be positive, got {}", params.temperature));
            }
            if !(params.top_p > 0.0 && params.top_p <= 1.0) {
                return invalid(format!("top_p must be in (0, 1], got {}", params.top_p));
            }
        } else if params.num_return_sequences > 1 {
            return invalid("greedy decoding can only return one sequence".to_string());
        }
        Ok(())
    }

    // Number of new tokens allowed for a prompt of `prompt_len` tokens.
    fn token_budget(&self, prompt_len: usize, params: &GenerationConfig) -> Result<usize, PipelineError> {
        let max_positions = self.model.max_positions();
        if prompt_len >= max_positions {
            return Err(PipelineError::PromptTooLong {
                prompt_tokens: prompt_len,
                limit: max_positions,
            });
        }
        let requested = match params.max_new_tokens {
            Some(n) => n,
            None if prompt_len >= params.max_length => {
                return Err(PipelineError::PromptTooLong {
                    prompt_tokens: prompt_len,
                    limit: params.max_length,
                })
            }
            None => params.max_length - prompt_len,
        };
        Ok(requested.min(max_positions - prompt_len))
    }

    fn generate_one(
        &self,
        prompt_ids: &[u32],
        budget: usize,
        processor: &mut LogitsProcessor,
    ) -> Result<(Vec<u32>, FinishReason), PipelineError> {
        let mut new_tokens = Vec::with_capacity(budget);
        if budget == 0 {
            return Ok((new_tokens, FinishReason::Length));
        }

        let mut cache = self.model.new_cache();
        let mut context = prompt_ids.to_vec();
        let mut logits = self.model.forward(prompt_ids, &mut cache)?;
        loop {
            let next = processor.next_token(&logits.to_vec(), &context);
            trace!("step {}: token {}", new_tokens.len(), next);
            if next == self.eos_token_id {
                return Ok((new_tokens, FinishReason::Eos));
            }
            new_tokens.push(next);
            context.push(next);
            if new_tokens.len() >= budget {
                return Ok((new_tokens, FinishReason::Length));
            }
            logits = self.model.forward(&[next], &mut cache)?;
        }
    }

    // Text after the prompt. The prompt is decoded the same way as the full
    // sequence so the cut lands on the same boundary.
    fn continuation(&self, prompt_ids: &[u32], new_tokens: &[u32]) -> Result<String, PipelineError> {
        let prompt_text = self.tokenizer.decode(prompt_ids, true)?;
        let all_ids: Vec<u32> = prompt_ids.iter().chain(new_tokens).copied().collect();
        let full_text = self.tokenizer.decode(&all_ids, true)?;
        match full_text.strip_prefix(prompt_text.as_str()) {
            Some(rest) => Ok(rest.to_string()),
            None => Ok(self.tokenizer.decode(new_tokens, true)?),
        }
    }
}

impl TextGenerator for TextGenerationPipeline {
    fn generate(&self, prompt: &str, params: &GenerationConfig) -> Result<Vec<GeneratedText>, PipelineError> {
        Self::validate(params)?;
        let prompt_ids = self.tokenizer.encode(prompt, false)?;
        if prompt_ids.is_empty() {
            return Err(PipelineError::EmptyPrompt);
        }
        let budget = self.token_budget(prompt_ids.len(), params)?;
        debug!(
            "Generating {} candidate(s): prompt {} tokens, budget {} tokens, sampling {}",
            params.num_return_sequences,
            prompt_ids.len(),
            budget,
            params.do_sample
        );

        let mut candidates = Vec::with_capacity(params.num_return_sequences);
        for index in 0..params.num_return_sequences {
            let seed = params.seed.map(|s| s.wrapping_add(index as u64));
            let mut processor = LogitsProcessor::new(
                seed,
                params.do_sample,
                params.temperature,
                params.top_k,
                params.top_p,
                params.repetition_penalty,
            );
            let (token_ids, finish_reason) = self.generate_one(&prompt_ids, budget, &mut processor)?;
            let continuation = self.continuation(&prompt_ids, &token_ids)?;
            let generated_text = if params.return_full_text {
                format!("{}{}", prompt, continuation)
            } else {
                continuation
            };
            debug!("Candidate {} finished ({:?}) after {} tokens", index, finish_reason, token_ids.len());
            candidates.push(GeneratedText {
                generated_text,
                token_ids,
                finish_reason,
            });
        }
        Ok(candidates)
    }

    fn defaults(&self) -> &GenerationConfig {
        &self.defaults
    }
}

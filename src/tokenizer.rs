use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer from {}: {message}", path.display())]
    Load { path: PathBuf, message: String },
    #[error("invalid tokenizer definition: {0}")]
    Parse(String),
    #[error("encoding failed for text '{text}': {message}")]
    Encode { text: String, message: String },
    #[error("decoding failed for ids {ids:?}: {message}")]
    Decode { ids: Vec<u32>, message: String },
}

#[derive(Debug)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    pub fn new(tokenizer_path: &Path) -> Result<Self, TokenizerError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| TokenizerError::Load {
            path: tokenizer_path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self { tokenizer })
    }

    /// Builds a tokenizer from the contents of a `tokenizer.json`.
    pub fn from_json(json: &str) -> Result<Self, TokenizerError> {
        let tokenizer = json
            .parse::<Tokenizer>()
            .map_err(|e| TokenizerError::Parse(e.to_string()))?;
        Ok(Self { tokenizer })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| TokenizerError::Encode {
                text: text.to_string(),
                message: e.to_string(),
            })?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| TokenizerError::Decode {
                ids: ids.to_vec(),
                message: e.to_string(),
            })
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn get_vocab_size(&self, with_added_tokens: bool) -> usize {
        self.tokenizer.get_vocab_size(with_added_tokens)
    }
}

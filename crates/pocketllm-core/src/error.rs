use thiserror::Error;

use crate::runtime::TokenId;

/// Failure reported by a runtime backend (model, context or sampler layer).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Backend initialisation failed: {0}")]
    Backend(String),

    #[error("Model load failed for {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Context allocation failed: {0}")]
    Context(String),

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by an [`InferenceSession`](crate::session::InferenceSession).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to load model: {0}")]
    Load(#[source] RuntimeError),

    #[error("Failed to create inference context: {0}")]
    Context(#[source] RuntimeError),

    #[error("Prompt too long: {tokens} tokens, limit is {limit} (context {n_ctx})")]
    PromptTooLong {
        tokens: usize,
        limit: usize,
        n_ctx: usize,
    },

    #[error("Latest turn needs {needed} tokens but only {available} of the prompt budget remain")]
    LatestTurnTooLong { needed: usize, available: usize },

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Decode failed at position {position} (code {code})")]
    Decode { position: usize, code: i32 },

    #[error("Failed to build sampler chain: {0}")]
    Sampler(#[source] RuntimeError),

    #[error("Sampling failed: {0}")]
    Sample(#[source] RuntimeError),

    #[error("Tokenization failed (code {0})")]
    Tokenize(i32),

    #[error("Token {token} could not be rendered (code {code})")]
    Detokenize { token: TokenId, code: i32 },

    #[error("Batch capacity {capacity} exceeded")]
    BatchOverflow { capacity: usize },

    #[error("Session is not initialized")]
    NotInitialized,

    #[error("No prompt has been prepared")]
    NotPrepared,
}

impl SessionError {
    /// Numeric status in the convention of the native C boundary:
    /// `-1` missing handle, `-2` not prepared, `-3` sampler, `-4` decode.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotInitialized => -1,
            Self::NotPrepared => -2,
            Self::Sampler(_) | Self::Sample(_) => -3,
            Self::Decode { .. } | Self::BatchOverflow { .. } => -4,
            Self::PromptTooLong { .. } | Self::LatestTurnTooLong { .. } => -5,
            Self::Tokenize(_) | Self::Detokenize { .. } | Self::EmptyPrompt => -6,
            Self::Load(_) | Self::Context(_) => -7,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Invalid stop-marker configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StopError {
    #[error("Stop marker list is empty")]
    NoMarkers,

    #[error("Stop marker at index {0} is empty")]
    EmptyMarker(usize),

    #[error("Stop markers must share one leading character: {first:?} vs {other:?}")]
    MixedLeadingChar { first: char, other: char },

    #[error("Stop marker {marker:?} repeats its leading character {lead:?}")]
    InteriorLeadChar { marker: String, lead: char },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_native_convention() {
        assert_eq!(SessionError::NotInitialized.code(), -1);
        assert_eq!(SessionError::NotPrepared.code(), -2);
        assert_eq!(
            SessionError::Sampler(RuntimeError::Sampler("x".into())).code(),
            -3
        );
        assert_eq!(SessionError::Decode { position: 3, code: 1 }.code(), -4);
    }

    #[test]
    fn prompt_too_long_message_names_limit() {
        let err = SessionError::PromptTooLong { tokens: 950, limit: 896, n_ctx: 1024 };
        let msg = err.to_string();
        assert!(msg.contains("950"));
        assert!(msg.contains("896"));
    }
}

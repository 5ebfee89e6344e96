//! The boundary between a session and the engine that actually runs a model.
//!
//! A [`Runtime`] hands out three kinds of resources: a model (weights plus
//! vocabulary), a decode context (attention cache plus the logits of the last
//! decoded position) and a sampler chain bound to that context type. The
//! session owns all three and releases them in reverse order of creation.
//!
//! | Runtime | Feature | Engine |
//! |---|---|---|
//! | [`CandleRuntime`](candle::CandleRuntime) | _default_ | Pure-Rust quantized GGUF via `candle` |
//! | `LlamaCppRuntime` | `llama-cpp` | llama.cpp through `llama-cpp-2` |

use std::path::Path;

use crate::batch::Batch;
use crate::error::RuntimeResult;
use crate::sampler::SamplerConfig;

pub mod candle;
#[cfg(feature = "llama-cpp")]
pub mod llama_cpp;

/// Vocabulary index of a token.
pub type TokenId = i32;

/// Position of a token inside the context window.
pub type Position = i32;

/// Sequence a batch slot belongs to. Sessions only ever use sequence 0.
pub type SeqId = i32;

/// Options for loading model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParams {
    pub use_mmap: bool,
}

/// Options for allocating a decode context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: usize,
    pub n_batch: usize,
    pub n_ubatch: usize,
    pub n_threads: usize,
    /// Keep key/value tensors on an accelerator. Always `false` here.
    pub offload_kqv: bool,
    /// Collect per-call performance counters. Always `false` here.
    pub collect_perf: bool,
}

/// Token-level view of a loaded model.
///
/// The buffer-based signatures mirror the native C API: a negative return
/// value means "the output buffer is too small", and its magnitude is the
/// size required. Callers retry once with a buffer of that size.
pub trait Vocabulary {
    /// Tokenize `text` into `out`, returning the number of tokens written.
    fn tokenize(&self, text: &str, out: &mut [TokenId], add_special: bool, parse_special: bool)
        -> i32;

    /// Render `token` as raw bytes into `out`, returning the byte count.
    fn token_to_piece(&self, token: TokenId, out: &mut [u8], special: bool) -> i32;

    /// Whether `token` ends generation (EOS, EOT and friends).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Whether `text` is a single token of this vocabulary.
    fn has_token(&self, text: &str) -> bool;
}

/// An attention cache plus the logits of the last decoded position.
pub trait DecodeContext {
    fn n_ctx(&self) -> usize;

    fn n_batch(&self) -> usize;

    /// Drop every cached position so the next decode starts at position 0.
    fn clear_memory(&mut self);

    /// Run the model over `batch`. Errors carry the native status code.
    fn decode(&mut self, batch: &Batch) -> Result<(), i32>;
}

/// A stateful sampler chain reading logits from a context of type `C`.
pub trait TokenSampler<C> {
    fn sample(&mut self, ctx: &C) -> RuntimeResult<TokenId>;

    /// Clear accumulated state (penalty history, RNG) while keeping the chain.
    fn reset(&mut self);
}

/// Factory for the three resources a session owns.
pub trait Runtime: Clone {
    type Model: Vocabulary;
    type Context: DecodeContext;
    type Sampler: TokenSampler<Self::Context>;

    fn load_model(&self, path: &Path, params: &ModelParams) -> RuntimeResult<Self::Model>;

    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> RuntimeResult<Self::Context>;

    fn new_sampler(
        &self,
        model: &Self::Model,
        config: &SamplerConfig,
    ) -> RuntimeResult<Self::Sampler>;
}

/// Copy `src` into `dst` using the negative-size convention of [`Vocabulary`].
pub(crate) fn copy_with_size_hint<T: Copy>(src: &[T], dst: &mut [T]) -> i32 {
    if src.len() > dst.len() {
        return -(src.len() as i32);
    }
    dst[..src.len()].copy_from_slice(src);
    src.len() as i32
}

//! A single loaded model and its decode state.
//!
//! ## Lifecycle
//!
//! ```text
//! init ──► prepare_prompt ──► get_next_token × N ──► prepare_prompt … ──► free
//! ```
//!
//! Every `prepare_prompt` wipes the attention cache: there is no prefix reuse
//! between prompts. Generation ends when the context is nearly full, the
//! per-prompt budget is spent, a turn marker appears in a piece, or the
//! model emits an end-of-generation token. Those are reported as
//! [`NextToken::End`], never as errors.
//!
//! A session is tied to the thread that drives it and is not `Clone`: the
//! underlying resources must be released exactly once. After [`free`]
//! (or a failed [`init`]) every operation reports
//! [`SessionError::NotInitialized`].
//!
//! [`free`]: InferenceSession::free
//! [`init`]: InferenceSession::init

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn, Span};

use crate::batch::{Batch, DEFAULT_SEQ};
use crate::budget::TokenCounter;
use crate::chat_template::ChatFormat;
use crate::error::{SessionError, SessionResult};
use crate::runtime::{
    ContextParams, DecodeContext, ModelParams, Position, Runtime, TokenId, TokenSampler,
    Vocabulary,
};
use crate::sampler::SamplerSlot;

pub const DEFAULT_CONTEXT_SIZE: usize = 1024;
pub const DEFAULT_THREADS: usize = 4;
/// Upper bound on the decode batch size.
pub const MAX_BATCH: usize = 128;
/// Upper bound on the micro-batch size.
pub const MAX_UBATCH: usize = 64;
/// Context positions a prompt must leave free.
pub const PROMPT_SAFETY_MARGIN: usize = 128;
/// Generation stops once the cursor is this close to the end of the context.
pub const CONTEXT_GUARD: usize = 4;
/// Floor of the per-prompt generation budget.
pub const MIN_NEW_TOKENS: usize = 16;
/// Substrings that end generation when they show up inside a single piece.
///
/// The first entry has no closing `>` on purpose: some vocabularies split
/// `<|im_end|>` so that the `>` arrives in the next piece.
pub const DEFAULT_TURN_MARKERS: &[&str] = &["<|im_end|", "<|im_start|>", "<|user|>", "user\n"];

/// Initial size of the detokenization buffer.
const PIECE_BUFFER: usize = 64;

/// Parameters for [`InferenceSession::init`].
///
/// `context_size` and `threads` follow the native convention: zero or
/// negative selects the default.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub model_path: PathBuf,
    pub context_size: i32,
    pub threads: i32,
    pub use_mmap: bool,
    pub turn_markers: Vec<String>,
    /// Span every log line of the session is recorded under.
    pub span: Span,
}

impl SessionParams {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: 0,
            threads: 0,
            use_mmap: true,
            turn_markers: DEFAULT_TURN_MARKERS.iter().map(|s| s.to_string()).collect(),
            span: Span::none(),
        }
    }

    pub fn effective_context_size(&self) -> usize {
        positive_or(self.context_size, DEFAULT_CONTEXT_SIZE)
    }

    pub fn effective_threads(&self) -> usize {
        positive_or(self.threads, DEFAULT_THREADS)
    }
}

fn positive_or(value: i32, default: usize) -> usize {
    if value > 0 {
        value as usize
    } else {
        default
    }
}

/// Why generation for the current prompt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The cursor reached the context guard.
    ContextFull,
    /// The per-prompt generation budget is spent.
    BudgetExhausted,
    /// The sampled piece contained a turn marker.
    TurnBoundary,
    /// The model produced an end-of-generation token.
    EndOfGeneration,
}

/// Outcome of one [`InferenceSession::get_next_token`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextToken {
    /// Raw bytes of the sampled token. Not necessarily valid UTF-8 on its own.
    Piece(Vec<u8>),
    End(EndReason),
}

/// Resources in release order: sampler, batch, context, model.
struct Loaded<R: Runtime> {
    sampler: SamplerSlot<R::Sampler>,
    batch: Batch,
    context: R::Context,
    model: R::Model,
}

pub struct InferenceSession<R: Runtime> {
    runtime: R,
    inner: Option<Loaded<R>>,
    model_path: PathBuf,
    turn_markers: Vec<String>,
    span: Span,
    prepared: bool,
    cursor: usize,
    prompt_tokens: usize,
    generated: usize,
    max_new_tokens: usize,
}

impl<R: Runtime> InferenceSession<R> {
    /// Load the model, allocate a context and the decode batch.
    ///
    /// On failure everything allocated so far is released before returning.
    pub fn init(runtime: R, params: SessionParams) -> SessionResult<Self> {
        let span = params.span.clone();
        let _enter = span.enter();

        let n_ctx = params.effective_context_size();
        let n_threads = params.effective_threads();
        info!(
            model = %params.model_path.display(),
            n_ctx,
            n_threads,
            use_mmap = params.use_mmap,
            "Initializing inference session"
        );

        let model = runtime
            .load_model(&params.model_path, &ModelParams { use_mmap: params.use_mmap })
            .map_err(|e| {
                error!(error = %e, "Model load failed");
                SessionError::Load(e)
            })?;

        let ctx_params = ContextParams {
            n_ctx,
            n_batch: MAX_BATCH.min(n_ctx),
            n_ubatch: MAX_UBATCH.min(n_ctx),
            n_threads,
            offload_kqv: false,
            collect_perf: false,
        };
        let context = match runtime.new_context(&model, &ctx_params) {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, "Context allocation failed; releasing model");
                drop(model);
                return Err(SessionError::Context(e));
            }
        };

        let batch = Batch::new(MAX_BATCH.min(context.n_batch()));
        info!(
            n_ctx = context.n_ctx(),
            batch_capacity = batch.capacity(),
            "Inference session ready"
        );

        Ok(Self {
            runtime,
            inner: Some(Loaded { sampler: SamplerSlot::empty(), batch, context, model }),
            model_path: params.model_path,
            turn_markers: params.turn_markers,
            span: params.span,
            prepared: false,
            cursor: 0,
            prompt_tokens: 0,
            generated: 0,
            max_new_tokens: 0,
        })
    }

    /// Count the tokens of `text` without decoding anything.
    ///
    /// Neither special tokens are added nor special markup parsed, so chat
    /// markup counts as plain text. Use for budget estimation only.
    pub fn tokenize(&self, text: &str) -> SessionResult<usize> {
        let loaded = self.inner.as_ref().ok_or(SessionError::NotInitialized)?;
        Ok(tokenize_exact(&loaded.model, text, false, false)?.len())
    }

    /// Reset all decode state and prime the context with `prompt`.
    pub fn prepare_prompt(&mut self, prompt: &str) -> SessionResult<()> {
        let _enter = self.span.enter();
        self.prepared = false;
        let loaded = self.inner.as_mut().ok_or(SessionError::NotInitialized)?;

        loaded.context.clear_memory();
        let tokens = tokenize_exact(&loaded.model, prompt, true, true)?;
        if tokens.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        let n_ctx = loaded.context.n_ctx();
        let limit = n_ctx.saturating_sub(PROMPT_SAFETY_MARGIN);
        if tokens.len() >= limit {
            warn!(tokens = tokens.len(), limit, n_ctx, "Prompt does not fit the context");
            return Err(SessionError::PromptTooLong { tokens: tokens.len(), limit, n_ctx });
        }

        let mut cursor = 0;
        for chunk in tokens.chunks(loaded.batch.capacity()) {
            loaded.batch.load_chunk(chunk, cursor)?;
            debug!(start = cursor, len = chunk.len(), "Decoding prompt chunk");
            if let Err(code) = loaded.context.decode(&loaded.batch) {
                error!(position = cursor, code, "Prompt decode failed");
                return Err(SessionError::Decode { position: cursor, code });
            }
            cursor += chunk.len();
        }

        self.cursor = cursor;
        self.prompt_tokens = cursor;
        self.generated = 0;
        self.max_new_tokens =
            MIN_NEW_TOKENS.max(n_ctx.saturating_sub(cursor + PROMPT_SAFETY_MARGIN));
        loaded.sampler.reset::<R::Context>();
        self.prepared = true;

        info!(
            prompt_tokens = cursor,
            max_new_tokens = self.max_new_tokens,
            "Prompt prepared"
        );
        Ok(())
    }

    /// Sample, render and decode one token.
    pub fn get_next_token(&mut self, temperature: f32, top_p: f32) -> SessionResult<NextToken> {
        let _enter = self.span.enter();
        let loaded = self.inner.as_mut().ok_or(SessionError::NotInitialized)?;
        if !self.prepared {
            return Err(SessionError::NotPrepared);
        }

        let sampler = loaded.sampler.ensure(&self.runtime, &loaded.model, temperature, top_p)?;

        if self.cursor + CONTEXT_GUARD >= loaded.context.n_ctx() {
            info!(cursor = self.cursor, "Context full, ending generation");
            return Ok(NextToken::End(EndReason::ContextFull));
        }
        if self.generated >= self.max_new_tokens {
            info!(generated = self.generated, "Generation budget exhausted");
            return Ok(NextToken::End(EndReason::BudgetExhausted));
        }

        let token = sampler.sample(&loaded.context).map_err(SessionError::Sample)?;
        let piece = render_piece(&loaded.model, token)?;

        if contains_marker(&piece, &self.turn_markers) {
            debug!(token, "Turn marker in piece");
            return Ok(NextToken::End(EndReason::TurnBoundary));
        }
        if loaded.model.is_eog(token) {
            debug!(token, "End-of-generation token");
            return Ok(NextToken::End(EndReason::EndOfGeneration));
        }

        loaded.batch.clear();
        loaded.batch.push(token, self.cursor as Position, DEFAULT_SEQ, true)?;
        if let Err(code) = loaded.context.decode(&loaded.batch) {
            error!(position = self.cursor, code, "Token decode failed");
            return Err(SessionError::Decode { position: self.cursor, code });
        }
        self.cursor += 1;
        self.generated += 1;

        Ok(NextToken::Piece(piece))
    }

    /// Release sampler, batch, context and model, in that order.
    ///
    /// Idempotent; also run on drop.
    pub fn free(&mut self) {
        let Some(loaded) = self.inner.take() else {
            return;
        };
        let _enter = self.span.enter();
        let Loaded { mut sampler, batch, context, model } = loaded;
        sampler.release();
        drop(batch);
        drop(context);
        drop(model);
        self.prepared = false;
        info!(model = %self.model_path.display(), "Inference session released");
    }

    /// Pick the chat format matching this model's special tokens.
    pub fn detect_chat_format(&self) -> ChatFormat {
        match &self.inner {
            Some(loaded) => ChatFormat::detect(|t| loaded.model.has_token(t)),
            None => ChatFormat::default(),
        }
    }

    pub fn set_turn_markers<I, S>(&mut self, markers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.turn_markers = markers.into_iter().map(Into::into).collect();
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn n_ctx(&self) -> Option<usize> {
        self.inner.as_ref().map(|l| l.context.n_ctx())
    }

    pub fn batch_capacity(&self) -> Option<usize> {
        self.inner.as_ref().map(|l| l.batch.capacity())
    }

    /// Next position to be written.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Tokens generated since the last successful prepare.
    pub fn generated(&self) -> usize {
        self.generated
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }
}

impl<R: Runtime> Drop for InferenceSession<R> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<R: Runtime> TokenCounter for InferenceSession<R> {
    fn count_tokens(&self, text: &str) -> SessionResult<usize> {
        self.tokenize(text)
    }
}

impl<R: Runtime> std::fmt::Debug for InferenceSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("model_path", &self.model_path)
            .field("initialized", &self.inner.is_some())
            .field("prepared", &self.prepared)
            .field("cursor", &self.cursor)
            .field("generated", &self.generated)
            .finish()
    }
}

// ── Buffer helpers ───────────────────────────────────────────────────────────

/// Tokenize with one retry when the vocabulary reports a larger required size.
fn tokenize_exact<V: Vocabulary>(
    vocab: &V,
    text: &str,
    add_special: bool,
    parse_special: bool,
) -> SessionResult<Vec<TokenId>> {
    let mut buf = vec![0; text.len() + 4];
    let mut n = vocab.tokenize(text, &mut buf, add_special, parse_special);
    if n < 0 {
        buf.resize(n.unsigned_abs() as usize, 0);
        n = vocab.tokenize(text, &mut buf, add_special, parse_special);
    }
    if n < 0 {
        return Err(SessionError::Tokenize(n));
    }
    buf.truncate(n as usize);
    Ok(buf)
}

/// Render a token's bytes, including special tokens, with one resize retry.
fn render_piece<V: Vocabulary>(vocab: &V, token: TokenId) -> SessionResult<Vec<u8>> {
    let mut buf = vec![0u8; PIECE_BUFFER];
    let mut n = vocab.token_to_piece(token, &mut buf, true);
    if n < 0 {
        buf.resize(n.unsigned_abs() as usize, 0);
        n = vocab.token_to_piece(token, &mut buf, true);
    }
    if n < 0 {
        return Err(SessionError::Detokenize { token, code: n });
    }
    buf.truncate(n as usize);
    Ok(buf)
}

fn contains_marker(piece: &[u8], markers: &[String]) -> bool {
    !piece.is_empty()
        && markers.iter().any(|m| {
            let m = m.as_bytes();
            !m.is_empty() && piece.windows(m.len()).any(|w| w == m)
        })
}

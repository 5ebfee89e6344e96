//! llama.cpp runtime through the `llama-cpp-2` bindings.
//!
//! The llama.cpp backend is process-global: it is initialised once, on first
//! use, and its log output is routed into `tracing`.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, DecodeError, LogOptions};
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    copy_with_size_hint, ContextParams, DecodeContext, ModelParams, Runtime, TokenId,
    TokenSampler, Vocabulary,
};
use crate::sampler::SamplerConfig;

static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> RuntimeResult<&'static LlamaBackend> {
    BACKEND
        .get_or_init(|| {
            send_logs_to_tracing(LogOptions::default());
            LlamaBackend::init().map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| RuntimeError::Backend(e.clone()))
}

#[derive(Debug, Clone, Default)]
pub struct LlamaCppRuntime;

impl LlamaCppRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Runtime for LlamaCppRuntime {
    type Model = LlamaCppModel;
    type Context = LlamaCppContext;
    type Sampler = LlamaCppSampler;

    fn load_model(&self, path: &Path, params: &ModelParams) -> RuntimeResult<LlamaCppModel> {
        let backend = backend()?;
        if !params.use_mmap {
            warn!("llama.cpp bindings always memory-map model files");
        }
        // CPU only.
        let model_params = LlamaModelParams::default().with_n_gpu_layers(0);
        info!(path = %path.display(), "Loading model with llama.cpp");
        let model = LlamaModel::load_from_file(backend, path, &model_params).map_err(|e| {
            RuntimeError::ModelLoad { path: path.display().to_string(), reason: e.to_string() }
        })?;
        Ok(LlamaCppModel { inner: Arc::new(model) })
    }

    fn new_context(&self, model: &LlamaCppModel, params: &ContextParams) -> RuntimeResult<LlamaCppContext> {
        let backend = backend()?;
        let to_u32 = |v: usize| u32::try_from(v).map_err(|_| RuntimeError::Context(format!("{v} out of range")));
        let n_ctx = NonZeroU32::new(to_u32(params.n_ctx)?)
            .ok_or_else(|| RuntimeError::Context("context size must be positive".into()))?;
        let threads = i32::try_from(params.n_threads).unwrap_or(i32::MAX);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(to_u32(params.n_batch)?)
            .with_n_ubatch(to_u32(params.n_ubatch)?)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let model_ref = Arc::clone(&model.inner);
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .map_err(|e| RuntimeError::Context(e.to_string()))?;
        // SAFETY: the context borrows the model it was created from. The
        // borrow is extended to 'static, and `LlamaCppContext` keeps an `Arc`
        // to that model in a field declared after `ctx`, so the model outlives
        // the context.
        let ctx: LlamaContext<'static> = unsafe { std::mem::transmute(ctx) };

        debug!(n_ctx = params.n_ctx, n_batch = params.n_batch, threads, "llama.cpp context ready");
        Ok(LlamaCppContext {
            ctx,
            batch: LlamaBatch::new(params.n_batch, 1),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            _model: Arc::clone(&model.inner),
        })
    }

    fn new_sampler(&self, _model: &LlamaCppModel, config: &SamplerConfig) -> RuntimeResult<LlamaCppSampler> {
        if config.temperature.is_nan() || config.top_p.is_nan() {
            return Err(RuntimeError::Sampler("temperature and top_p must be numbers".into()));
        }
        let penalty_last_n = i32::try_from(config.penalty_last_n).unwrap_or(i32::MAX);
        let top_k = i32::try_from(config.top_k).unwrap_or(i32::MAX);
        let chain = LlamaSampler::chain_simple([
            LlamaSampler::penalties(
                penalty_last_n,
                config.penalty_repeat,
                config.penalty_freq,
                config.penalty_present,
            ),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::top_k(top_k),
            LlamaSampler::top_p(config.top_p, config.min_keep),
            LlamaSampler::dist(config.seed),
        ]);
        Ok(LlamaCppSampler { chain })
    }
}

pub struct LlamaCppModel {
    inner: Arc<LlamaModel>,
}

impl Vocabulary for LlamaCppModel {
    fn tokenize(&self, text: &str, out: &mut [TokenId], add_special: bool, _parse_special: bool) -> i32 {
        let add_bos = if add_special { AddBos::Always } else { AddBos::Never };
        match self.inner.str_to_token(text, add_bos) {
            Ok(tokens) => {
                let ids: Vec<TokenId> = tokens.into_iter().map(|t| t.0).collect();
                copy_with_size_hint(&ids, out)
            }
            Err(e) => {
                warn!(error = %e, "llama.cpp tokenization failed");
                -1
            }
        }
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8], special: bool) -> i32 {
        let special = if special { Special::Tokenize } else { Special::Plaintext };
        match self.inner.token_to_bytes(LlamaToken::new(token), special) {
            Ok(bytes) => copy_with_size_hint(&bytes, out),
            Err(e) => {
                warn!(token, error = %e, "llama.cpp piece rendering failed");
                -1
            }
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.inner.is_eog_token(LlamaToken::new(token))
    }

    fn has_token(&self, text: &str) -> bool {
        self.inner
            .str_to_token(text, AddBos::Never)
            .is_ok_and(|tokens| tokens.len() == 1)
    }
}

pub struct LlamaCppContext {
    // Dropped before `_model`.
    ctx: LlamaContext<'static>,
    batch: LlamaBatch,
    n_ctx: usize,
    n_batch: usize,
    _model: Arc<LlamaModel>,
}

impl DecodeContext for LlamaCppContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn clear_memory(&mut self) {
        self.ctx.clear_kv_cache();
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), i32> {
        self.batch.clear();
        for i in 0..batch.len() {
            let seq = batch.seq_ids()[i];
            self.batch
                .add(LlamaToken::new(batch.tokens()[i]), batch.positions()[i], &[seq], batch.logits()[i])
                .map_err(|_| -1)?;
        }
        self.ctx.decode(&mut self.batch).map_err(|e| match e {
            DecodeError::NoKvCacheSlot => 1,
            DecodeError::NTokensZero => -1,
            DecodeError::Unknown(code) => code,
            #[allow(unreachable_patterns)]
            _ => -1,
        })
    }
}

pub struct LlamaCppSampler {
    chain: LlamaSampler,
}

impl TokenSampler<LlamaCppContext> for LlamaCppSampler {
    fn sample(&mut self, ctx: &LlamaCppContext) -> RuntimeResult<TokenId> {
        // -1 reads the logits of the last slot that requested them.
        Ok(self.chain.sample(&ctx.ctx, -1).0)
    }

    fn reset(&mut self) {
        self.chain.reset();
    }
}

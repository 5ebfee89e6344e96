//! Pure-Rust runtime: quantized GGUF weights executed by `candle` on the CPU.
//!
//! The quantized model implementations keep their own KV cache and reset it
//! whenever a forward pass starts at position 0. Their causal mask only
//! covers a fresh sequence, so a multi-token batch that continues a filled
//! cache is replayed from position 0 together with everything already cached.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    copy_with_size_hint, ContextParams, DecodeContext, ModelParams, Runtime, TokenId,
    TokenSampler, Vocabulary,
};
use crate::sampler::SamplerConfig;
use crate::sampling::CpuSampler;
use crate::tokenizer::{gguf_u32, Tokenizer};

/// Status returned when a batch does not fit the remaining context.
const NO_KV_SLOT: i32 = 1;
/// Status returned for malformed batches and failed forward passes.
const DECODE_FAILED: i32 = -1;

/// Architecture-specific weights behind one `forward` call.
enum Weights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl Weights {
    fn forward(&mut self, x: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(m) => m.forward(x, index_pos),
            Self::Qwen2(m) => m.forward(x, index_pos),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandleRuntime;

impl CandleRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Runtime for CandleRuntime {
    type Model = CandleModel;
    type Context = CandleContext;
    type Sampler = CpuSampler;

    fn load_model(&self, path: &Path, params: &ModelParams) -> RuntimeResult<CandleModel> {
        let load_err = |reason: String| RuntimeError::ModelLoad {
            path: path.display().to_string(),
            reason,
        };
        info!(path = %path.display(), use_mmap = params.use_mmap, "Loading GGUF model");
        if !params.use_mmap {
            debug!("use_mmap has no effect on the candle runtime");
        }

        let mut file = File::open(path).map_err(|e| load_err(e.to_string()))?;
        let content =
            gguf_file::Content::read(&mut file).map_err(|e| load_err(e.to_string()))?;

        let architecture = match content.metadata.get("general.architecture") {
            Some(gguf_file::Value::String(s)) => s.clone(),
            _ => "llama".to_string(),
        };
        let context_length =
            gguf_u32(&content.metadata, &format!("{architecture}.context_length"))
                .map(|n| n as usize);

        // The tokenizer reads metadata, so it is built before `from_gguf`
        // consumes the content.
        let sibling = path.with_file_name("tokenizer.json");
        let tokenizer = if sibling.exists() {
            Tokenizer::from_file(&sibling)?
        } else {
            Tokenizer::from_gguf_metadata(&content.metadata)?
        };

        let device = Device::Cpu;
        let weights = match architecture.as_str() {
            "qwen2" => Weights::Qwen2(quantized_qwen2::ModelWeights::from_gguf(
                content, &mut file, &device,
            )?),
            other => {
                if !matches!(other, "llama" | "mistral") {
                    warn!(architecture = other, "Unknown architecture, trying LLaMA layout");
                }
                Weights::Llama(quantized_llama::ModelWeights::from_gguf(
                    content, &mut file, &device,
                )?)
            }
        };

        info!(
            architecture = %architecture,
            context_length,
            vocab_size = tokenizer.vocab_size(),
            "Model loaded"
        );
        Ok(CandleModel {
            weights: Arc::new(Mutex::new(weights)),
            tokenizer: Arc::new(tokenizer),
            architecture,
            context_length,
        })
    }

    fn new_context(&self, model: &CandleModel, params: &ContextParams) -> RuntimeResult<CandleContext> {
        if params.n_ctx == 0 || params.n_batch == 0 {
            return Err(RuntimeError::Context("context and batch size must be positive".into()));
        }
        if let Some(trained) = model.context_length {
            if params.n_ctx > trained {
                warn!(n_ctx = params.n_ctx, trained, "Context exceeds the trained length");
            }
        }
        debug!(n_threads = params.n_threads, "candle schedules its own CPU threads");
        // Contexts share the model's weights and its KV cache; the first
        // decode of a fresh context starts at position 0 and resets the cache.
        Ok(CandleContext {
            weights: Arc::clone(&model.weights),
            device: Device::Cpu,
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            cached: Vec::new(),
            logits: None,
        })
    }

    fn new_sampler(&self, _model: &CandleModel, config: &SamplerConfig) -> RuntimeResult<CpuSampler> {
        if config.temperature.is_nan() || config.top_p.is_nan() {
            return Err(RuntimeError::Sampler("temperature and top_p must be numbers".into()));
        }
        Ok(CpuSampler::new(*config))
    }
}

pub struct CandleModel {
    weights: Arc<Mutex<Weights>>,
    tokenizer: Arc<Tokenizer>,
    architecture: String,
    context_length: Option<usize>,
}

impl CandleModel {
    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Context length the model was trained with, when the file declares it.
    pub fn context_length(&self) -> Option<usize> {
        self.context_length
    }

    pub fn tokenizer(&self) -> Arc<Tokenizer> {
        Arc::clone(&self.tokenizer)
    }
}

impl Vocabulary for CandleModel {
    fn tokenize(&self, text: &str, out: &mut [TokenId], add_special: bool, _parse_special: bool) -> i32 {
        // Added special tokens are always matched by the HF tokenizer, so
        // `parse_special` cannot be honoured here.
        match self.tokenizer.encode(text, add_special) {
            Ok(ids) => {
                let ids: Vec<TokenId> = ids.into_iter().map(|id| id as TokenId).collect();
                copy_with_size_hint(&ids, out)
            }
            Err(e) => {
                error!(error = %e, "Tokenization failed");
                DECODE_FAILED
            }
        }
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8], special: bool) -> i32 {
        let Ok(id) = u32::try_from(token) else {
            return DECODE_FAILED;
        };
        match self.tokenizer.piece_bytes(id, special) {
            Ok(bytes) => copy_with_size_hint(&bytes, out),
            Err(e) => {
                error!(token, error = %e, "Token rendering failed");
                DECODE_FAILED
            }
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        u32::try_from(token).is_ok_and(|id| self.tokenizer.is_eog(id))
    }

    fn has_token(&self, text: &str) -> bool {
        self.tokenizer.token_id(text).is_some()
    }
}

pub struct CandleContext {
    weights: Arc<Mutex<Weights>>,
    device: Device,
    n_ctx: usize,
    n_batch: usize,
    /// Tokens currently held in the KV cache, by position.
    cached: Vec<u32>,
    /// Logits of the last position of the most recent batch that asked for them.
    logits: Option<Vec<f32>>,
}

impl CandleContext {
    pub fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn forward_last(&mut self, ids: &[u32], index_pos: usize) -> candle_core::Result<Vec<f32>> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let logits = {
            let mut weights = self
                .weights
                .lock()
                .map_err(|_| candle_core::Error::Msg("model weights lock poisoned".into()))?;
            weights.forward(&input, index_pos)?
        };
        let last = match logits.dims() {
            [_, _, _] => logits.i((0, ids.len() - 1))?,
            [_, _] => logits.i(0)?,
            _ => logits,
        };
        last.to_dtype(DType::F32)?.to_vec1::<f32>()
    }
}

impl DecodeContext for CandleContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn clear_memory(&mut self) {
        self.cached.clear();
        self.logits = None;
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), i32> {
        let Some(&first) = batch.positions().first() else {
            return Err(DECODE_FAILED);
        };
        let start = usize::try_from(first).map_err(|_| DECODE_FAILED)?;
        if start != self.cached.len() {
            error!(start, cached = self.cached.len(), "Batch does not continue the cache");
            return Err(DECODE_FAILED);
        }
        if start + batch.len() > self.n_ctx {
            return Err(NO_KV_SLOT);
        }
        let ids: Vec<u32> = batch
            .tokens()
            .iter()
            .map(|&t| u32::try_from(t))
            .collect::<Result<_, _>>()
            .map_err(|_| DECODE_FAILED)?;

        let result = if start > 0 && ids.len() > 1 {
            let mut replay = self.cached.clone();
            replay.extend_from_slice(&ids);
            self.forward_last(&replay, 0)
        } else {
            self.forward_last(&ids, start)
        };
        let logits = result.map_err(|e| {
            error!(start, len = ids.len(), error = %e, "Forward pass failed");
            DECODE_FAILED
        })?;

        self.cached.extend_from_slice(&ids);
        self.logits = batch.logits().last().copied().unwrap_or(false).then_some(logits);
        Ok(())
    }
}

impl TokenSampler<CandleContext> for CpuSampler {
    fn sample(&mut self, ctx: &CandleContext) -> RuntimeResult<TokenId> {
        let logits = ctx
            .logits()
            .ok_or_else(|| RuntimeError::Sampler("no logits available; decode first".into()))?;
        Ok(self.sample_logits(logits) as TokenId)
    }

    fn reset(&mut self) {
        self.restart();
    }
}

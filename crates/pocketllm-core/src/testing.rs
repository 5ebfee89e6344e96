//! Scripted in-memory runtime for unit tests.
//!
//! Tokenization is one token per byte (token id = byte value), the sampler
//! replays a fixed script, and every resource event is appended to a shared
//! journal so tests can assert on ordering.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::batch::Batch;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    copy_with_size_hint, ContextParams, DecodeContext, ModelParams, Position, Runtime, TokenId,
    TokenSampler, Vocabulary,
};
use crate::sampler::SamplerConfig;

/// End-of-generation token of the scripted vocabulary. Renders as nothing.
pub const EOG: TokenId = 100_000;

/// Route `tracing` output of the code under test to the test harness.
/// Filtered by `RUST_LOG`; safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    LoadModel(PathBuf),
    FreeModel(PathBuf),
    NewContext { n_ctx: usize, n_batch: usize, n_ubatch: usize, n_threads: usize },
    FreeContext,
    ClearMemory,
    Decode(DecodeRecord),
    NewSampler { temperature: f32, top_p: f32 },
    ResetSampler,
    FreeSampler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRecord {
    pub tokens: Vec<TokenId>,
    pub positions: Vec<Position>,
    pub logits: Vec<bool>,
}

#[derive(Debug, Default)]
struct Script {
    journal: Vec<Call>,
    decode_calls: usize,
}

#[derive(Debug, Clone)]
struct Behaviour {
    fail_load: bool,
    fail_context: bool,
    fail_sampler: bool,
    fail_decode_at: Option<usize>,
    tokens_per_byte: usize,
    generation: Vec<TokenId>,
    pieces: HashMap<TokenId, Vec<u8>>,
    specials: HashSet<String>,
    sample_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ScriptedRuntime {
    behaviour: Arc<Behaviour>,
    script: Arc<Mutex<Script>>,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            behaviour: Arc::new(Behaviour {
                fail_load: false,
                fail_context: false,
                fail_sampler: false,
                fail_decode_at: None,
                tokens_per_byte: 1,
                generation: Vec::new(),
                pieces: HashMap::new(),
                specials: HashSet::new(),
                sample_delay: None,
            }),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    fn tweak(mut self, f: impl FnOnce(&mut Behaviour)) -> Self {
        f(Arc::make_mut(&mut self.behaviour));
        self
    }

    pub fn failing_load(self) -> Self {
        self.tweak(|b| b.fail_load = true)
    }

    pub fn failing_context(self) -> Self {
        self.tweak(|b| b.fail_context = true)
    }

    pub fn failing_sampler(self) -> Self {
        self.tweak(|b| b.fail_sampler = true)
    }

    /// Fail the `n`-th decode call (0-based) of this runtime.
    pub fn failing_decode_at(self, n: usize) -> Self {
        self.tweak(|b| b.fail_decode_at = Some(n))
    }

    pub fn tokens_per_byte(self, n: usize) -> Self {
        self.tweak(|b| b.tokens_per_byte = n)
    }

    /// Tokens the sampler returns after each prepare; [`EOG`] once exhausted.
    pub fn script(self, tokens: Vec<TokenId>) -> Self {
        self.tweak(|b| b.generation = tokens)
    }

    pub fn script_text(self, text: &str) -> Self {
        self.script(text.bytes().map(TokenId::from).collect())
    }

    pub fn with_piece(self, token: TokenId, piece: &str) -> Self {
        self.with_piece_bytes(token, piece.as_bytes())
    }

    pub fn with_piece_bytes(self, token: TokenId, piece: &[u8]) -> Self {
        let piece = piece.to_vec();
        self.tweak(move |b| {
            b.pieces.insert(token, piece);
        })
    }

    pub fn with_special(self, text: &str) -> Self {
        let text = text.to_string();
        self.tweak(move |b| {
            b.specials.insert(text);
        })
    }

    /// Sleep this long inside every `sample` call.
    pub fn sample_delay(self, delay: Duration) -> Self {
        self.tweak(|b| b.sample_delay = Some(delay))
    }

    /// A model handle that bypasses `load_model` and the journal.
    pub fn model(&self) -> ScriptedModel {
        ScriptedModel { path: None, behaviour: self.behaviour.clone(), script: self.script.clone() }
    }

    pub fn journal(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().journal.iter().filter(|c| pred(c)).count()
    }

    pub fn decodes(&self) -> Vec<DecodeRecord> {
        self.lock()
            .journal
            .iter()
            .filter_map(|c| match c {
                Call::Decode(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(script: &Mutex<Script>, call: Call) {
    lock(script).journal.push(call);
}

impl Runtime for ScriptedRuntime {
    type Model = ScriptedModel;
    type Context = ScriptedContext;
    type Sampler = ScriptedSampler;

    fn load_model(&self, path: &Path, _params: &ModelParams) -> RuntimeResult<ScriptedModel> {
        if self.behaviour.fail_load {
            return Err(RuntimeError::ModelLoad {
                path: path.display().to_string(),
                reason: "scripted failure".into(),
            });
        }
        record(&self.script, Call::LoadModel(path.to_path_buf()));
        Ok(ScriptedModel {
            path: Some(path.to_path_buf()),
            behaviour: self.behaviour.clone(),
            script: self.script.clone(),
        })
    }

    fn new_context(
        &self,
        _model: &ScriptedModel,
        params: &ContextParams,
    ) -> RuntimeResult<ScriptedContext> {
        if self.behaviour.fail_context {
            return Err(RuntimeError::Context("scripted failure".into()));
        }
        record(
            &self.script,
            Call::NewContext {
                n_ctx: params.n_ctx,
                n_batch: params.n_batch,
                n_ubatch: params.n_ubatch,
                n_threads: params.n_threads,
            },
        );
        Ok(ScriptedContext {
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            sampled: Cell::new(0),
            behaviour: self.behaviour.clone(),
            script: self.script.clone(),
        })
    }

    fn new_sampler(
        &self,
        _model: &ScriptedModel,
        config: &SamplerConfig,
    ) -> RuntimeResult<ScriptedSampler> {
        if self.behaviour.fail_sampler {
            return Err(RuntimeError::Sampler("scripted failure".into()));
        }
        record(
            &self.script,
            Call::NewSampler { temperature: config.temperature, top_p: config.top_p },
        );
        Ok(ScriptedSampler { behaviour: self.behaviour.clone(), script: self.script.clone() })
    }
}

pub struct ScriptedModel {
    path: Option<PathBuf>,
    behaviour: Arc<Behaviour>,
    script: Arc<Mutex<Script>>,
}

impl Vocabulary for ScriptedModel {
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        _add_special: bool,
        _parse_special: bool,
    ) -> i32 {
        let tokens: Vec<TokenId> = text
            .bytes()
            .flat_map(|b| std::iter::repeat(TokenId::from(b)).take(self.behaviour.tokens_per_byte))
            .collect();
        copy_with_size_hint(&tokens, out)
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8], _special: bool) -> i32 {
        let piece = match self.behaviour.pieces.get(&token) {
            Some(p) => p.clone(),
            None => match u8::try_from(token) {
                Ok(b) => vec![b],
                Err(_) => Vec::new(),
            },
        };
        copy_with_size_hint(&piece, out)
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn has_token(&self, text: &str) -> bool {
        self.behaviour.specials.contains(text)
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            record(&self.script, Call::FreeModel(path));
        }
    }
}

pub struct ScriptedContext {
    n_ctx: usize,
    n_batch: usize,
    /// Samples drawn since the last `clear_memory`; indexes the script.
    sampled: Cell<usize>,
    behaviour: Arc<Behaviour>,
    script: Arc<Mutex<Script>>,
}

impl DecodeContext for ScriptedContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn clear_memory(&mut self) {
        self.sampled.set(0);
        record(&self.script, Call::ClearMemory);
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), i32> {
        let mut script = lock(&self.script);
        let call = script.decode_calls;
        script.decode_calls += 1;
        if self.behaviour.fail_decode_at == Some(call) {
            return Err(-1);
        }
        script.journal.push(Call::Decode(DecodeRecord {
            tokens: batch.tokens().to_vec(),
            positions: batch.positions().to_vec(),
            logits: batch.logits().to_vec(),
        }));
        Ok(())
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        record(&self.script, Call::FreeContext);
    }
}

pub struct ScriptedSampler {
    behaviour: Arc<Behaviour>,
    script: Arc<Mutex<Script>>,
}

impl TokenSampler<ScriptedContext> for ScriptedSampler {
    fn sample(&mut self, ctx: &ScriptedContext) -> RuntimeResult<TokenId> {
        if let Some(delay) = self.behaviour.sample_delay {
            std::thread::sleep(delay);
        }
        let i = ctx.sampled.get();
        ctx.sampled.set(i + 1);
        Ok(self.behaviour.generation.get(i).copied().unwrap_or(EOG))
    }

    fn reset(&mut self) {
        record(&self.script, Call::ResetSampler);
    }
}

impl Drop for ScriptedSampler {
    fn drop(&mut self) {
        record(&self.script, Call::FreeSampler);
    }
}

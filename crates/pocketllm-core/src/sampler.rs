use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::runtime::{Runtime, TokenSampler};

/// Number of recent tokens the repetition penalty looks back over.
pub const PENALTY_LAST_N: usize = 64;
/// Multiplicative repetition penalty applied to recent tokens.
pub const PENALTY_REPEAT: f32 = 1.2;
/// Candidate pool kept by the top-k stage.
pub const TOP_K: usize = 40;
/// Fixed seed of the final distribution draw.
pub const SAMPLER_SEED: u32 = 1234;

/// Parameters of the fixed sampling chain:
/// penalties → temperature → top-k → top-p → seeded draw.
///
/// Only `temperature` and `top_p` vary per request; everything else is a
/// constant of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    pub penalty_last_n: usize,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub min_keep: usize,
    pub seed: u32,
}

impl SamplerConfig {
    pub fn new(temperature: f32, top_p: f32) -> Self {
        Self {
            penalty_last_n: PENALTY_LAST_N,
            penalty_repeat: PENALTY_REPEAT,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            temperature,
            top_k: TOP_K,
            top_p,
            min_keep: 1,
            seed: SAMPLER_SEED,
        }
    }
}

/// Holds the session's sampler chain and the parameters it was built with.
pub(crate) struct SamplerSlot<S> {
    chain: Option<S>,
    built_with: Option<(f32, f32)>,
}

impl<S> SamplerSlot<S> {
    pub(crate) fn empty() -> Self {
        Self { chain: None, built_with: None }
    }

    /// Whether a chain for `(temperature, top_p)` must be built from scratch.
    pub(crate) fn needs_rebuild(&self, temperature: f32, top_p: f32) -> bool {
        self.chain.is_none() || self.built_with != Some((temperature, top_p))
    }

    /// Return a chain for `(temperature, top_p)`.
    ///
    /// A matching chain is reset and reused. Otherwise the old chain is
    /// released before the replacement is built; if the build fails the slot
    /// stays empty.
    pub(crate) fn ensure<R>(
        &mut self,
        runtime: &R,
        model: &R::Model,
        temperature: f32,
        top_p: f32,
    ) -> SessionResult<&mut S>
    where
        R: Runtime<Sampler = S>,
        S: TokenSampler<R::Context>,
    {
        if self.needs_rebuild(temperature, top_p) {
            self.release();
            debug!(temperature, top_p, "Building sampler chain");
            let chain = runtime
                .new_sampler(model, &SamplerConfig::new(temperature, top_p))
                .map_err(SessionError::Sampler)?;
            self.built_with = Some((temperature, top_p));
            Ok(self.chain.insert(chain))
        } else {
            match self.chain.as_mut() {
                Some(chain) => {
                    chain.reset();
                    Ok(chain)
                }
                None => Err(SessionError::NotInitialized),
            }
        }
    }

    /// Reset the chain's accumulated state, if one exists.
    pub(crate) fn reset<C>(&mut self)
    where
        S: TokenSampler<C>,
    {
        if let Some(chain) = self.chain.as_mut() {
            chain.reset();
        }
    }

    pub(crate) fn release(&mut self) {
        self.chain = None;
        self.built_with = None;
    }
}

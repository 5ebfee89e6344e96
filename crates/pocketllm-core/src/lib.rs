//! # pocketllm-core
//!
//! On-device inference for GGUF models: a single-session decode loop, streaming
//! stop-marker handling, and a request controller that serves one generation at
//! a time from a dedicated worker thread.
//!
//! ## Layers
//!
//! | Module | Role |
//! |---|---|
//! | [`runtime`] | Engine boundary: model, context and sampler factories |
//! | [`session`] | [`InferenceSession`]: prime a prompt, then sample token by token |
//! | [`batch`] | Fixed-capacity decode batch and prompt chunking |
//! | [`sampler`] | Fixed sampling chain and its rebuild policy |
//! | [`stop`] | [`StopBuffer`]: hide stop markers split across fragments |
//! | [`budget`] | Fit a conversation into the context window |
//! | [`chat_template`] | Per-format turn rendering and stop markers |
//! | [`controller`] | [`StreamController`]: single-flight request actor |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `llama-cpp` | Adds `runtime::llama_cpp::LlamaCppRuntime` backed by llama.cpp |

pub mod batch;
pub mod budget;
pub mod chat_template;
pub mod controller;
pub mod error;
pub mod runtime;
pub mod sampler;
pub mod sampling;
pub mod session;
pub mod stop;
pub mod tokenizer;
pub mod utf8;

#[cfg(test)]
pub(crate) mod testing;

pub use budget::{build_budgeted_prompt, BudgetedPrompt, TokenCounter};
pub use chat_template::{ChatFormat, Role, Turn};
pub use controller::{
    ControllerConfig, ControllerHandle, EventRecord, Prompt, Request, RequestId, StreamController,
    StreamEvent,
};
pub use error::{RuntimeError, RuntimeResult, SessionError, SessionResult, StopError};
pub use runtime::candle::CandleRuntime;
#[cfg(feature = "llama-cpp")]
pub use runtime::llama_cpp::LlamaCppRuntime;
pub use runtime::{Runtime, TokenId};
pub use sampler::SamplerConfig;
pub use session::{EndReason, InferenceSession, NextToken, SessionParams};
pub use stop::{StopBuffer, StopUpdate};
pub use tokenizer::Tokenizer;
pub use utf8::Utf8Assembler;

//! Request control: one worker thread owning one [`InferenceSession`].
//!
//! ## Flow
//!
//! ```text
//! ControllerHandle ──Command──► worker thread ──StreamEvent──► consumer
//!   submit / cancel /            (owns the session,             (tokio
//!   warmup / shutdown             loads models lazily)           receiver)
//! ```
//!
//! The worker serves one request at a time. A submit that arrives while a
//! request is generating cancels it at the next token boundary and takes its
//! place. Only one request waits at a time: a newer submit replaces an
//! older waiting one, which is dropped without any events.
//!
//! Every request that reaches the worker ends with exactly one terminal event,
//! [`StreamEvent::Done`] or [`StreamEvent::Cancelled`], and nothing for that
//! id follows it. Failures send [`StreamEvent::Error`] right before `Done`.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, info_span, warn};

use crate::budget::{build_budgeted_prompt, prompt_budget};
use crate::chat_template::{ChatFormat, Turn};
use crate::error::SessionResult;
use crate::runtime::Runtime;
use crate::session::{InferenceSession, NextToken, SessionParams};
use crate::stop::StopBuffer;
use crate::utf8::Utf8Assembler;

/// Caller-chosen request identifier, echoed on every event.
pub type RequestId = u64;

/// Generation room kept free when fitting a conversation into the context.
pub const DEFAULT_RESERVED_FOR_GENERATION: usize = 256;

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    /// Used verbatim.
    Text(String),
    /// Rendered with the model's chat template and fitted to the context.
    Turns(Vec<Turn>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub model_path: PathBuf,
    pub prompt: Prompt,
    #[serde(default)]
    pub system: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

/// Events streamed back to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token { request_id: RequestId, text: String },
    /// Terminal. `tokens_per_second` is absent when the request failed.
    Done { request_id: RequestId, tokens_per_second: Option<f64> },
    Error { request_id: RequestId, message: String },
    /// Terminal.
    Cancelled { request_id: RequestId },
    /// A warmup load finished.
    Warmup,
}

impl StreamEvent {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Token { request_id, .. }
            | Self::Done { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::Cancelled { request_id } => Some(*request_id),
            Self::Warmup => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Cancelled { .. })
    }
}

/// Flat record form of a [`StreamEvent`], one optional field per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub is_done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    pub was_cancelled: bool,
    pub is_warmup: bool,
}

impl From<&StreamEvent> for EventRecord {
    fn from(event: &StreamEvent) -> Self {
        let mut record = EventRecord { request_id: event.request_id(), ..Default::default() };
        match event {
            StreamEvent::Token { text, .. } => record.token = Some(text.clone()),
            StreamEvent::Done { tokens_per_second, .. } => {
                record.is_done = true;
                record.tokens_per_second = *tokens_per_second;
            }
            StreamEvent::Error { message, .. } => record.error = Some(message.clone()),
            StreamEvent::Cancelled { .. } => {
                record.is_done = true;
                record.was_cancelled = true;
            }
            StreamEvent::Warmup => record.is_warmup = true,
        }
        record
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Non-positive selects the session default.
    pub context_size: i32,
    /// Non-positive selects the session default.
    pub threads: i32,
    pub use_mmap: bool,
    pub reserved_for_generation: usize,
    /// Overrides detection from the model's vocabulary.
    pub chat_format: Option<ChatFormat>,
    /// Overrides the chat format's stop markers.
    pub stop_markers: Option<Vec<String>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            context_size: 0,
            threads: 0,
            use_mmap: true,
            reserved_for_generation: DEFAULT_RESERVED_FOR_GENERATION,
            chat_format: None,
            stop_markers: None,
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Submit(Request),
    Cancel(Option<RequestId>),
    Warmup(PathBuf),
    Shutdown,
}

/// Cheap, cloneable sender side of the controller.
///
/// All methods are fire-and-forget; they return `false` once the worker has
/// stopped.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    /// Queue a request, superseding whatever is running or waiting.
    pub fn submit(&self, request: Request) -> bool {
        self.send(Command::Submit(request))
    }

    /// Cancel whatever is in flight.
    pub fn cancel(&self) -> bool {
        self.send(Command::Cancel(None))
    }

    /// Cancel `id` if it is in flight or waiting; ignored otherwise.
    pub fn cancel_request(&self, id: RequestId) -> bool {
        self.send(Command::Cancel(Some(id)))
    }

    /// Load `model_path` ahead of the first request.
    pub fn warmup(&self, model_path: impl Into<PathBuf>) -> bool {
        self.send(Command::Warmup(model_path.into()))
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> bool {
        self.inbox.send(command).is_ok()
    }
}

/// Owner of the worker thread. Dropping it shuts the worker down and joins it.
pub struct StreamController {
    handle: ControllerHandle,
    worker: Option<thread::JoinHandle<()>>,
}

impl StreamController {
    /// Start the worker thread. Returns the controller and its event stream.
    pub fn spawn<R>(
        runtime: R,
        config: ControllerConfig,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<StreamEvent>)>
    where
        R: Runtime + Send + 'static,
    {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // The worker is built on its own thread: native contexts need not be Send.
        let join = thread::Builder::new()
            .name("pocketllm-session".to_string())
            .spawn(move || Worker::new(runtime, config, inbox_rx, events_tx).run())?;
        Ok((Self { handle: ControllerHandle { inbox: inbox_tx }, worker: Some(join) }, events_rx))
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// Stop the worker after the current token and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.worker.take() {
            if join.join().is_err() {
                error!("Session worker panicked");
            }
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Loading(PathBuf),
    Preparing(RequestId),
    Generating(RequestId),
    Draining(RequestId),
}

struct Worker<R: Runtime> {
    runtime: R,
    config: ControllerConfig,
    session: Option<InferenceSession<R>>,
    format: ChatFormat,
    inbox: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: State,
    pending: Option<Request>,
    /// When the current request reached the worker.
    request_started: Instant,
    cancel_requested: bool,
    shutting_down: bool,
}

impl<R: Runtime> Worker<R> {
    fn new(
        runtime: R,
        config: ControllerConfig,
        inbox: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            runtime,
            config,
            session: None,
            format: ChatFormat::default(),
            inbox,
            events,
            state: State::Idle,
            pending: None,
            request_started: Instant::now(),
            cancel_requested: false,
            shutting_down: false,
        }
    }

    fn run(mut self) {
        info!("Session worker started");
        while !self.shutting_down {
            if let Some(request) = self.pending.take() {
                self.cancel_requested = false;
                self.process(request);
                self.set_state(State::Idle);
                continue;
            }
            match self.inbox.blocking_recv() {
                Some(command) => self.handle_idle(command),
                None => break,
            }
        }
        if let Some(request) = self.pending.take() {
            info!(request_id = request.id, "Waiting request cancelled by shutdown");
            self.emit(StreamEvent::Cancelled { request_id: request.id });
        }
        if let Some(mut session) = self.session.take() {
            session.free();
        }
        info!("Session worker stopped");
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Worker state");
            self.state = state;
        }
    }

    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn handle_idle(&mut self, command: Command) {
        match command {
            Command::Submit(request) => self.pending = Some(request),
            Command::Cancel(id) => debug!(?id, "Cancel while idle ignored"),
            Command::Warmup(path) => self.warmup(&path),
            Command::Shutdown => self.shutting_down = true,
        }
    }

    /// Read every queued command without blocking. Called between tokens.
    fn drain_inbox(&mut self, in_flight: RequestId) {
        loop {
            match self.inbox.try_recv() {
                Ok(Command::Submit(request)) => {
                    debug!(superseded = in_flight, next = request.id, "Request superseded");
                    if let Some(dropped) = self.pending.replace(request) {
                        debug!(request_id = dropped.id, "Waiting request replaced");
                    }
                    self.cancel_requested = true;
                }
                Ok(Command::Cancel(None)) => self.cancel_requested = true,
                Ok(Command::Cancel(Some(id))) if id == in_flight => self.cancel_requested = true,
                Ok(Command::Cancel(Some(id))) => {
                    if self.pending.as_ref().is_some_and(|p| p.id == id) {
                        self.pending = None;
                        self.emit(StreamEvent::Cancelled { request_id: id });
                    } else {
                        debug!(request_id = id, "Cancel for unknown request ignored");
                    }
                }
                Ok(Command::Warmup(path)) => {
                    debug!(path = %path.display(), "Warmup ignored while busy");
                }
                Ok(Command::Shutdown) => {
                    self.shutting_down = true;
                    self.cancel_requested = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn warmup(&mut self, path: &Path) {
        let span = info_span!("warmup", model = %path.display());
        let _enter = span.enter();
        match self.ensure_session(path) {
            Ok(()) => {
                info!("Model warm");
                self.emit(StreamEvent::Warmup);
            }
            Err(e) => warn!(error = %e, "Warmup failed; the next request will retry"),
        }
        self.set_state(State::Idle);
    }

    /// Make sure a session for `path` is loaded, replacing any other model.
    fn ensure_session(&mut self, path: &Path) -> SessionResult<()> {
        if let Some(session) = &self.session {
            if session.model_path() == path && session.is_initialized() {
                return Ok(());
            }
        }
        self.set_state(State::Loading(path.to_path_buf()));
        if let Some(mut old) = self.session.take() {
            info!(old = %old.model_path().display(), new = %path.display(), "Swapping model");
            old.free();
        }

        let mut params = SessionParams::new(path);
        params.context_size = self.config.context_size;
        params.threads = self.config.threads;
        params.use_mmap = self.config.use_mmap;
        params.span = info_span!("session", model = %path.display());
        let mut session = InferenceSession::init(self.runtime.clone(), params)?;

        self.format = self.config.chat_format.unwrap_or_else(|| session.detect_chat_format());
        session.set_turn_markers(self.format.turn_markers().iter().copied());
        info!(format = %self.format, "Model loaded");
        self.session = Some(session);
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        self.request_started.elapsed().as_millis() as u64
    }

    fn fail(&mut self, request_id: RequestId, message: String) {
        error!(request_id, elapsed_ms = self.elapsed_ms(), error = %message, "Request failed");
        self.emit(StreamEvent::Error { request_id, message });
        self.emit(StreamEvent::Done { request_id, tokens_per_second: None });
    }

    fn cancelled(&mut self, request_id: RequestId) {
        self.set_state(State::Draining(request_id));
        info!(request_id, elapsed_ms = self.elapsed_ms(), "Request cancelled");
        self.emit(StreamEvent::Cancelled { request_id });
    }

    fn process(&mut self, request: Request) {
        let id = request.id;
        self.request_started = Instant::now();
        let span = info_span!("request", request_id = id);
        let _enter = span.enter();
        info!(model = %request.model_path.display(), max_tokens = request.max_tokens, "Processing request");

        if let Err(message) = validate(&request) {
            return self.fail(id, message);
        }
        if let Err(e) = self.ensure_session(&request.model_path) {
            return self.fail(id, e.to_string());
        }

        self.set_state(State::Preparing(id));
        let prompt = match self.build_prompt(&request) {
            Ok(prompt) => prompt,
            Err(message) => return self.fail(id, message),
        };
        let markers: Vec<String> = match &self.config.stop_markers {
            Some(markers) => markers.clone(),
            None => self.format.stop_markers().iter().map(|s| s.to_string()).collect(),
        };
        let stop = match StopBuffer::new(markers) {
            Ok(stop) => stop,
            Err(e) => return self.fail(id, e.to_string()),
        };
        let prepared = match self.session.as_mut() {
            Some(session) => session.prepare_prompt(&prompt),
            None => return self.fail(id, "no session loaded".to_string()),
        };
        if let Err(e) = prepared {
            return self.fail(id, e.to_string());
        }

        self.generate(&request, stop);
    }

    fn build_prompt(&self, request: &Request) -> Result<String, String> {
        let system = request.system.as_deref().unwrap_or("");
        match &request.prompt {
            Prompt::Text(text) => {
                let mut prompt = self.format.render_system(system);
                prompt.push_str(text);
                Ok(prompt)
            }
            Prompt::Turns(turns) => {
                let session = self.session.as_ref().ok_or("no session loaded")?;
                let n_ctx = session.n_ctx().ok_or("session not initialized")?;
                let budget = prompt_budget(n_ctx, self.config.reserved_for_generation);
                let built = build_budgeted_prompt(session, self.format, system, turns, budget)
                    .map_err(|e| e.to_string())?;
                debug!(
                    included = built.included_turns,
                    dropped = built.dropped_turns,
                    estimated_tokens = built.estimated_tokens,
                    budget,
                    "Conversation fitted"
                );
                Ok(built.prompt)
            }
        }
    }

    fn generate(&mut self, request: &Request, mut stop: StopBuffer) {
        let id = request.id;
        self.set_state(State::Generating(id));
        let started = Instant::now();
        let mut utf8 = Utf8Assembler::new();

        for _ in 0..request.max_tokens {
            self.drain_inbox(id);
            if self.cancel_requested {
                return self.cancelled(id);
            }

            let Some(session) = self.session.as_mut() else {
                return self.fail(id, "session lost during generation".to_string());
            };
            match session.get_next_token(request.temperature, request.top_p) {
                Ok(NextToken::Piece(bytes)) => {
                    let update = stop.push(&utf8.push(&bytes));
                    if !update.emit.is_empty() {
                        self.emit(StreamEvent::Token { request_id: id, text: update.emit });
                    }
                    if update.stopped {
                        debug!("Stop marker reached");
                        break;
                    }
                }
                Ok(NextToken::End(reason)) => {
                    debug!(?reason, "Generation ended");
                    break;
                }
                Err(e) => return self.fail(id, e.to_string()),
            }
        }

        if !stop.is_stopped() {
            let mut tail = stop.push(&utf8.finish()).emit;
            if !stop.is_stopped() {
                tail.push_str(&stop.finish());
            }
            if !tail.is_empty() {
                self.emit(StreamEvent::Token { request_id: id, text: tail });
            }
        }

        let generated = self.session.as_ref().map_or(0, |s| s.generated());
        let elapsed = started.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 { generated as f64 / elapsed } else { 0.0 };
        info!(
            request_id = id,
            elapsed_ms = self.elapsed_ms(),
            generated,
            tokens_per_second,
            "Request complete"
        );
        self.emit(StreamEvent::Done { request_id: id, tokens_per_second: Some(tokens_per_second) });
    }
}

fn validate(request: &Request) -> Result<(), String> {
    if request.max_tokens == 0 {
        return Err("max_tokens must be at least 1".to_string());
    }
    let empty = match &request.prompt {
        Prompt::Text(text) => text.is_empty(),
        Prompt::Turns(turns) => turns.is_empty(),
    };
    if empty {
        return Err("prompt is empty".to_string());
    }
    Ok(())
}

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::env;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::memory::{ConversationMemory, ConversationTurn, Observation, Role};
use crate::session::Session;
use crate::translator::ActionTranslator;

// ========================= Core Types =========================

/// Where an action lands: explicit pixels, or a description for grounding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Coordinates { x: i32, y: i32 },
    Description(String),
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target::Description(s.to_string())
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        Target::Description(s)
    }
}

impl From<(i32, i32)> for Target {
    fn from((x, y): (i32, i32)) -> Self {
        Target::Coordinates { x, y }
    }
}

impl Target {
    fn validate(&self) -> Result<(), AgentError> {
        match self {
            Target::Coordinates { x, y } if *x < 0 || *y < 0 => Err(AgentError::InvalidAction(
                format!("coordinates ({x}, {y}) are off screen"),
            )),
            Target::Description(d) if d.trim().is_empty() => {
                Err(AgentError::InvalidAction("empty target description".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRequest {
    Click {
        target: Target,
    },
    Type {
        #[serde(alias = "payload")]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    Key {
        #[serde(alias = "payload")]
        combo: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
    },
    Command {
        #[serde(alias = "payload")]
        command: String,
        #[serde(default)]
        background: bool,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ms: Option<u64>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Key,
    Command,
    Wait,
    Done,
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionRequest::Click { .. } => ActionKind::Click,
            ActionRequest::Type { .. } => ActionKind::Type,
            ActionRequest::Key { .. } => ActionKind::Key,
            ActionRequest::Command { .. } => ActionKind::Command,
            ActionRequest::Wait { .. } => ActionKind::Wait,
            ActionRequest::Done { .. } => ActionKind::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ActionRequest::Done { .. })
    }

    /// Rejects requests that could never reach the desktop in a sane state.
    pub fn validate(&self) -> Result<(), AgentError> {
        match self {
            ActionRequest::Click { target } => target.validate(),
            ActionRequest::Type { text, target } => {
                if text.is_empty() {
                    return Err(AgentError::InvalidAction("type requires text".into()));
                }
                target.as_ref().map_or(Ok(()), Target::validate)
            }
            ActionRequest::Key { combo, target } => {
                if combo.trim().is_empty() {
                    return Err(AgentError::InvalidAction("key requires a combo".into()));
                }
                target.as_ref().map_or(Ok(()), Target::validate)
            }
            ActionRequest::Command { command, .. } if command.trim().is_empty() => {
                Err(AgentError::InvalidAction("command must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// One reasoning step: optional free-text thought plus the chosen action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub action: ActionRequest,
}

impl Decision {
    pub fn act(action: ActionRequest) -> Self {
        Self { thought: None, action }
    }

    pub fn done() -> Self {
        Self::act(ActionRequest::Done { summary: None })
    }

    /// Strict parse of raw model output. Accepts `{"thought", "action"}` or a
    /// bare action object, optionally inside a fenced block. Anything else is
    /// a `ReasoningModel` error.
    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        let json = extract_json(raw).ok_or_else(|| {
            AgentError::ReasoningModel(format!("no JSON object in model output: {}", preview(raw)))
        })?;
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| AgentError::ReasoningModel(format!("malformed model output: {e}")))?;
        let decision = if value.get("action").is_some() {
            serde_json::from_value::<Decision>(value)
        } else {
            serde_json::from_value::<ActionRequest>(value).map(Decision::act)
        }
        .map_err(|e| AgentError::ReasoningModel(format!("unrecognised action: {e}")))?;
        decision
            .action
            .validate()
            .map_err(|e| AgentError::ReasoningModel(e.to_string()))?;
        Ok(decision)
    }
}

/// Normalised grounding hit; `x` and `y` are fractions of the screen.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    /// Capture order within one session; strictly increasing.
    pub seq: u64,
    pub captured_at_ms: u128,
    pub image_base64: String,
}

impl Screenshot {
    pub fn new(seq: u64, png: &[u8]) -> Self {
        Self {
            id: nanoid!(),
            seq,
            captured_at_ms: now_ms(),
            image_base64: B64.encode(png),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.image_base64)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub kind: ActionKind,
    pub success: bool,
    pub message: String,
    pub screenshot_after: Option<Screenshot>,
    pub timestamp_ms: u128,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

impl ActionResult {
    pub fn succeeded(kind: ActionKind, message: String, shot: Screenshot, attempts: u32) -> Self {
        Self {
            kind,
            success: true,
            message,
            screenshot_after: Some(shot),
            timestamp_ms: now_ms(),
            attempts,
            error: None,
        }
    }

    pub fn failed(kind: ActionKind, error: AgentError, attempts: u32) -> Self {
        Self {
            kind,
            success: false,
            message: error.to_string(),
            screenshot_after: None,
            timestamp_ms: now_ms(),
            attempts,
            error: Some(error),
        }
    }

    /// Desktop retries ran out; the invocation cannot go on.
    pub fn is_fatal(&self) -> bool {
        matches!(self.error, Some(AgentError::ActionExecution(_)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    SingleStep,
    MultiStep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    StepComplete,
    Done,
    Failed,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    StopToolCalled,
    SingleStepIncomplete,
    MaxIterationsReached,
    TimedOut,
    ErrorOccurred,
    SessionReset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownMode {
    /// Wait for an in-flight instruction to finish.
    Graceful,
    /// Cancel an in-flight instruction; it ends `Failed` with `SessionReset`.
    Force,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    pub initialized: bool,
    pub sandbox_active: bool,
    pub state: LoopState,
    pub uptime_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub success: bool,
    pub message: String,
    pub action_log: Vec<ActionResult>,
    pub final_screenshot: Option<Screenshot>,
    pub completed: bool,
    pub state: LoopState,
    pub completion_reason: CompletionReason,
    pub iterations: usize,
    pub error: Option<AgentError>,
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("busy: another instruction is running")]
    Busy,
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("grounding failed: {0}")]
    GroundingFailed(String),
    #[error("action execution error: {0}")]
    ActionExecution(String),
    #[error("reasoning model error: {0}")]
    ReasoningModel(String),
    #[error("step budget exhausted after {0} steps")]
    StepBudgetExceeded(usize),
    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("session reset")]
    SessionReset,
    #[error("other error: {0}")]
    Other(String),
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Desktop: Send + Sync {
    /// Bring the sandbox up. Called once per provisioning.
    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// PNG bytes of the whole screen.
    async fn screenshot(&self) -> Result<Vec<u8>, AgentError>;
    async fn click(&self, x: i32, y: i32) -> Result<(), AgentError>;
    async fn type_text(&self, text: &str) -> Result<(), AgentError>;
    async fn key(&self, combo: &str) -> Result<(), AgentError>;
    async fn run(&self, command: &str, background: bool) -> Result<CommandOutput, AgentError>;
}

#[async_trait]
pub trait Grounder: Send + Sync {
    /// `Ok(None)` means the model found no match.
    async fn locate(
        &self,
        screenshot: &Screenshot,
        description: &str,
    ) -> Result<Option<Location>, AgentError>;
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn next(
        &self,
        context: &ConversationMemory,
        screenshot: &Screenshot,
    ) -> Result<Decision, AgentError>;
}

// ========================= Configuration =========================

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an AI assistant with computer use abilities. \
You control a Linux desktop through clicks, typing, key presses and shell commands. \
Take one action at a time and signal completion with the done action once the objective is met.";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub max_step_retries: u32,
    pub action_timeout: Duration,
    pub invocation_timeout: Duration,
    pub command_timeout: Duration,
    pub default_wait: Duration,
    pub max_wait: Duration,
    pub memory_ceiling: usize,
    pub min_grounding_confidence: f64,
    pub display: (u32, u32),
    pub sandbox_lifetime: Option<Duration>,
    pub system_prompt: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for AgentConfig {
    fn default() -> Self {
        let invocation_s = env::var("AGENT_INVOCATION_TIMEOUT_S")
            .or_else(|_| env::var("REQUEST_TIMEOUT_SECONDS"))
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(300);
        let lifetime_min: u64 = env_or("SANDBOX_MAX_LIFETIME_MINUTES", 30);
        Self {
            max_steps: env_or("AGENT_MAX_STEPS", 20),
            max_step_retries: env_or("AGENT_MAX_STEP_RETRIES", 2),
            action_timeout: Duration::from_secs(env_or("AGENT_ACTION_TIMEOUT_S", 30)),
            invocation_timeout: Duration::from_secs(invocation_s),
            command_timeout: Duration::from_secs(env_or("AGENT_COMMAND_TIMEOUT_S", 60)),
            default_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
            memory_ceiling: env_or("AGENT_MEMORY_CEILING", 64),
            min_grounding_confidence: 0.3,
            display: (
                env_or("AGENT_DISPLAY_WIDTH", 1024),
                env_or("AGENT_DISPLAY_HEIGHT", 768),
            ),
            sandbox_lifetime: (lifetime_min > 0).then(|| Duration::from_secs(lifetime_min * 60)),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

// ========================= Agent Core =========================

enum Halt {
    Deadline,
    Cancelled,
}

struct Termination {
    state: LoopState,
    reason: CompletionReason,
    message: String,
    error: Option<AgentError>,
}

impl Termination {
    fn failed(error: AgentError) -> Self {
        let reason = match error {
            AgentError::StepBudgetExceeded(_) => CompletionReason::MaxIterationsReached,
            AgentError::SessionReset => CompletionReason::SessionReset,
            _ => CompletionReason::ErrorOccurred,
        };
        Self { state: LoopState::Failed, reason, message: error.to_string(), error: Some(error) }
    }
}

impl From<Halt> for Termination {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::Cancelled => Termination::failed(AgentError::SessionReset),
            Halt::Deadline => {
                let err = AgentError::TimedOut("invocation deadline elapsed".into());
                Termination {
                    state: LoopState::TimedOut,
                    reason: CompletionReason::TimedOut,
                    message: err.to_string(),
                    error: Some(err),
                }
            }
        }
    }
}

struct Run {
    run_id: String,
    log: Vec<ActionResult>,
    last_screenshot: Option<Screenshot>,
    iterations: usize,
}

pub struct Agent<D, R, G>
where
    D: Desktop,
    R: Reasoner,
    G: Grounder,
{
    session: Session<D>,
    translator: ActionTranslator<D, G>,
    reasoner: R,
    cfg: AgentConfig,
    // Held for the whole of an invocation; try_lock failing means Busy.
    memory: Mutex<ConversationMemory>,
    state: RwLock<LoopState>,
    cancel: watch::Sender<bool>,
}

impl<D, R, G> Agent<D, R, G>
where
    D: Desktop,
    R: Reasoner,
    G: Grounder,
{
    pub fn new(session: Session<D>, reasoner: R, grounder: G, cfg: AgentConfig) -> Self {
        let session = session.with_max_lifetime(cfg.sandbox_lifetime);
        let translator = ActionTranslator::new(session.desktop(), grounder, cfg.clone());
        let memory = ConversationMemory::new(cfg.system_prompt.clone(), cfg.memory_ceiling);
        let (cancel, _) = watch::channel(false);
        Self {
            session,
            translator,
            reasoner,
            cfg,
            memory: Mutex::new(memory),
            state: RwLock::new(LoopState::Idle),
            cancel,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        let mut memory = self.memory.try_lock().map_err(|_| AgentError::Busy)?;
        self.session.provision().await?;
        memory.reset();
        *self.state.write().await = LoopState::Idle;
        Ok(())
    }

    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), AgentError> {
        if mode == ShutdownMode::Force {
            self.cancel.send_replace(true);
        }
        let mut memory = self.memory.lock().await;
        self.cancel.send_replace(false);
        let res = self.session.teardown().await;
        memory.reset();
        *self.state.write().await = LoopState::Idle;
        info!(?mode, "session shut down");
        res
    }

    /// Tear the sandbox down, cancelling any running instruction, and bring a
    /// fresh one up.
    pub async fn restart(&self) -> Result<(), AgentError> {
        self.shutdown(ShutdownMode::Force).await?;
        self.start().await
    }

    pub async fn status(&self) -> SessionStatus {
        let (initialized, sandbox_active, uptime) = self.session.flags().await;
        SessionStatus {
            initialized,
            sandbox_active,
            state: *self.state.read().await,
            uptime_secs: uptime.map(|d| d.as_secs()),
        }
    }

    /// Clears conversation memory, keeping the system turn.
    pub async fn reset(&self) -> Result<(), AgentError> {
        let mut memory = self.memory.try_lock().map_err(|_| AgentError::Busy)?;
        memory.reset();
        *self.state.write().await = LoopState::Idle;
        info!("memory reset");
        Ok(())
    }

    pub fn memory_snapshot(&self) -> Result<Vec<ConversationTurn>, AgentError> {
        let memory = self.memory.try_lock().map_err(|_| AgentError::Busy)?;
        Ok(memory.to_vec())
    }

    // ---------- primitive pass-throughs ----------

    pub async fn screenshot(&self) -> Result<Screenshot, AgentError> {
        let _guard = self.memory.try_lock().map_err(|_| AgentError::Busy)?;
        self.session.ensure_ready().await?;
        self.translator.capture().await
    }

    pub async fn click(&self, target: impl Into<Target>) -> Result<ActionResult, AgentError> {
        self.dispatch_direct(ActionRequest::Click { target: target.into() }).await
    }

    pub async fn type_text(&self, text: &str) -> Result<ActionResult, AgentError> {
        self.dispatch_direct(ActionRequest::Type { text: text.to_string(), target: None })
            .await
    }

    pub async fn key(&self, combo: &str) -> Result<ActionResult, AgentError> {
        self.dispatch_direct(ActionRequest::Key { combo: combo.to_string(), target: None })
            .await
    }

    pub async fn command(
        &self,
        command: &str,
        background: bool,
    ) -> Result<ActionResult, AgentError> {
        self.dispatch_direct(ActionRequest::Command {
            command: command.to_string(),
            background,
        })
        .await
    }

    async fn dispatch_direct(&self, request: ActionRequest) -> Result<ActionResult, AgentError> {
        let _guard = self.memory.try_lock().map_err(|_| AgentError::Busy)?;
        self.session.ensure_ready().await?;
        request.validate()?;
        info!(kind = ?request.kind(), "direct dispatch");
        self.translator.dispatch(&request, None).await
    }

    // ---------- the loop ----------

    pub async fn execute(
        &self,
        instruction: &str,
        mode: Mode,
    ) -> Result<ExecutionReport, AgentError> {
        self.execute_with_budget(instruction, mode, self.cfg.max_steps).await
    }

    pub async fn execute_with_budget(
        &self,
        instruction: &str,
        mode: Mode,
        max_steps: usize,
    ) -> Result<ExecutionReport, AgentError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(AgentError::InvalidAction("instruction must not be empty".into()));
        }
        let mut memory = self.memory.try_lock().map_err(|_| AgentError::Busy)?;
        self.session.ensure_ready().await?;

        let mut cancel = self.cancel.subscribe();
        let deadline = Instant::now() + self.cfg.invocation_timeout;
        let mut run = Run {
            run_id: nanoid!(),
            log: Vec::new(),
            last_screenshot: None,
            iterations: 0,
        };

        // A repeated single step whose objective is still the newest turn
        // continues it instead of stating it twice.
        let continuing = mode == Mode::SingleStep
            && memory
                .last()
                .filter(|turn| turn.role == Role::User)
                .and_then(ConversationTurn::text)
                == Some(instruction);
        if !continuing {
            memory.append(ConversationTurn::user(instruction));
        }
        *self.state.write().await = LoopState::Running;
        info!(run_id = %run.run_id, ?mode, max_steps, "instruction started: {}", instruction);

        let end = self
            .drive(&mut memory, &mut run, mode, max_steps, deadline, &mut cancel)
            .await;

        *self.state.write().await = end.state;
        match end.state {
            LoopState::Done | LoopState::StepComplete => info!(
                run_id = %run.run_id,
                state = ?end.state,
                steps = run.log.len(),
                "instruction finished"
            ),
            _ => warn!(
                run_id = %run.run_id,
                state = ?end.state,
                "instruction ended: {}",
                end.message
            ),
        }

        Ok(ExecutionReport {
            run_id: run.run_id,
            success: matches!(end.state, LoopState::Done | LoopState::StepComplete),
            message: end.message,
            action_log: run.log,
            final_screenshot: run.last_screenshot,
            completed: end.state == LoopState::Done,
            state: end.state,
            completion_reason: end.reason,
            iterations: run.iterations,
            error: end.error,
        })
    }

    async fn drive(
        &self,
        memory: &mut ConversationMemory,
        run: &mut Run,
        mode: Mode,
        max_steps: usize,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> Termination {
        for step in 0..max_steps {
            if *cancel.borrow() {
                return Halt::Cancelled.into();
            }

            let screenshot = match guard(self.translator.capture(), deadline, cancel).await {
                Ok(Ok(shot)) => shot,
                Ok(Err(e)) => return Termination::failed(e),
                Err(halt) => return halt.into(),
            };
            run.last_screenshot = Some(screenshot.clone());
            run.iterations += 1;

            let decision = match guard(self.reason(memory, &screenshot), deadline, cancel).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => return Termination::failed(e),
                Err(halt) => return halt.into(),
            };
            let thought = decision.thought.as_deref().map(str::trim);
            if let Some(thought) = thought.filter(|t| !t.is_empty()) {
                memory.append(ConversationTurn::assistant(format!("THOUGHT: {thought}")));
            }
            let action = decision.action;
            info!(run_id = %run.run_id, step, kind = ?action.kind(), "decision");

            if let ActionRequest::Done { summary } = &action {
                let message = summary.clone().unwrap_or_else(|| "task completed".to_string());
                return Termination {
                    state: LoopState::Done,
                    reason: CompletionReason::StopToolCalled,
                    message,
                    error: None,
                };
            }

            let dispatch = self.translator.dispatch(&action, Some(&screenshot));
            let result = match guard(dispatch, deadline, cancel).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ActionResult::failed(action.kind(), e, 0),
                Err(halt) => return halt.into(),
            };
            let observation = Observation::from_result(&action, &result);
            memory.append(ConversationTurn::observation(observation));
            if let Some(shot) = &result.screenshot_after {
                run.last_screenshot = Some(shot.clone());
            }
            let fatal = result.is_fatal();
            if !result.success {
                warn!(
                    run_id = %run.run_id,
                    step,
                    kind = ?result.kind,
                    "action failed: {}",
                    result.message
                );
            }
            let error = result.error.clone();
            run.log.push(result);

            if fatal {
                return Termination::failed(error.unwrap_or_else(|| {
                    AgentError::ActionExecution("action retries exhausted".into())
                }));
            }
            if mode == Mode::SingleStep {
                return Termination {
                    state: LoopState::StepComplete,
                    reason: CompletionReason::SingleStepIncomplete,
                    message: "single step executed".into(),
                    error: None,
                };
            }
        }
        Termination::failed(AgentError::StepBudgetExceeded(max_steps))
    }

    /// One reasoning call. Every failure here aborts the invocation, so
    /// everything is folded into `ReasoningModel`.
    async fn reason(
        &self,
        memory: &ConversationMemory,
        screenshot: &Screenshot,
    ) -> Result<Decision, AgentError> {
        let call = self.reasoner.next(memory, screenshot);
        let decision = match timeout(self.cfg.action_timeout, call).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(AgentError::ReasoningModel(msg))) => return Err(AgentError::ReasoningModel(msg)),
            Ok(Err(other)) => return Err(AgentError::ReasoningModel(other.to_string())),
            Err(_) => {
                return Err(AgentError::ReasoningModel(format!(
                    "no decision within {}s",
                    self.cfg.action_timeout.as_secs()
                )))
            }
        };
        decision
            .action
            .validate()
            .map_err(|e| AgentError::ReasoningModel(e.to_string()))?;
        Ok(decision)
    }
}

/// Races `fut` against the invocation deadline and session cancellation.
/// Dropping `fut` on either is what keeps memory free of half-finished turns.
async fn guard<F: Future>(
    fut: F,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> Result<F::Output, Halt> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(Halt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Halt::Deadline),
        out = fut => Ok(out),
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ========================= Helpers =========================

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Finds the outermost JSON object in free text, tolerating code fences and
/// prose around it.
pub(crate) fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(120) {
        Some((i, _)) => format!("{}...", &trimmed[..i]),
        None => trimmed.to_string(),
    }
}

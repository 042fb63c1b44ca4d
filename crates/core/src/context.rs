use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::ids::TaskId;
use crate::state::State;

/// Ambient values for one transition invocation.
///
/// Built by the executor before each call into user code and handed to
/// transition functions and listeners. Cheap to clone. Accessors fall back
/// to well-defined defaults so listeners can run outside a transition, but
/// `state` and `task_id` are only meaningful inside one.
#[derive(Clone, Debug)]
pub struct TaskContext {
    state: Option<State>,
    task_id: Option<TaskId>,
    attempt: u32,
    span: Span,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken, span: Span) -> Self {
        Self { state: None, task_id: None, attempt: 0, span, cancel }
    }

    /// Context with no machine attached; useful in tests and for listeners
    /// fired outside a worker.
    pub fn background() -> Self {
        Self::new(CancellationToken::new(), Span::current())
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// State being executed, or [`State::UNKNOWN`] outside a transition.
    pub fn state(&self) -> State {
        self.state.clone().unwrap_or(State::UNKNOWN)
    }

    /// Task being executed, or the zero id outside a transition.
    pub fn task_id(&self) -> TaskId {
        self.task_id.unwrap_or_default()
    }

    /// Zero-based retry counter for this (task, target-state) pair.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the owning machine is shut down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

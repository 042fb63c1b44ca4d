use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use statecraft_core::{Backoff, MachineId, State, TaskContext, TaskId};
use statecraft_db::{NewTransition, SqliteStore, Store, TaskRecord, TransitionStatus};

use crate::options::{CompletionListener, MachineConfig, MachineOption, TransitionListener};
use crate::MachineError;

/// Single-arm start gate shared across clones of a builder lineage. Exactly
/// one `build_and_start` wins; every later call observes `AlreadyStarted`.
#[derive(Debug, Default)]
pub struct StartLock {
    started: AtomicBool,
}

impl StartLock {
    pub const fn new() -> Self {
        Self { started: AtomicBool::new(false) }
    }

    pub fn try_start(&self) -> Result<(), MachineError> {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| MachineError::AlreadyStarted)
    }
}

/// An open task found during the resume sweep, resolved to the state it
/// should re-enter. `state` is [`State::INITIAL`] for tasks that never left
/// the entrypoint; `payload` then holds the submitted arguments, otherwise
/// the argument tuple of the last committed transition.
#[derive(Clone, Debug)]
pub struct ResumedTask {
    pub task_id: TaskId,
    pub state: State,
    pub from: State,
    pub payload: Vec<u8>,
}

/// Per-machine executor services shared by the generated submit, transition,
/// and worker code: the store handle, backoff policy, listeners, and the
/// ambient context every invocation inherits.
pub struct MachineCore {
    name: String,
    machine_id: MachineId,
    store: Arc<dyn Store>,
    backoff: Backoff,
    span: Span,
    cancel: CancellationToken,
    on_transition: Option<TransitionListener>,
    on_completion: Option<CompletionListener>,
}

impl MachineCore {
    /// Applies options in order, falls back to the shared in-memory store,
    /// and registers the machine name.
    pub async fn initialize(
        name: impl Into<String>,
        cancel: CancellationToken,
        options: impl IntoIterator<Item = MachineOption>,
    ) -> Result<Self, MachineError> {
        let name = name.into();

        let mut config = MachineConfig::default();
        for option in options {
            option.apply(&mut config);
        }

        let store = match config.store.take() {
            Some(store) => store,
            None => Arc::new(SqliteStore::in_memory().await?) as Arc<dyn Store>,
        };

        let machine_id = store.create_machine(&name).await?;
        tracing::info!(
            parent: &config.span,
            machine = %name,
            machine_id = machine_id.as_i64(),
            "machine registered"
        );

        Ok(Self {
            name,
            machine_id,
            store,
            backoff: config.backoff,
            span: config.span,
            cancel,
            on_transition: config.on_transition,
            on_completion: config.on_completion,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    /// Ambient context for one invocation of `state` on `task_id`.
    pub fn task_context(&self, state: &State, task_id: TaskId, attempt: u32) -> TaskContext {
        let span = tracing::info_span!(
            parent: &self.span,
            "transition",
            machine = %self.name,
            state = %state,
            task = task_id.as_i64(),
            attempt
        );
        TaskContext::new(self.cancel.clone(), span)
            .with_state(state.clone())
            .with_task_id(task_id)
            .with_attempt(attempt)
    }

    pub async fn create_task(&self, payload: &[u8]) -> Result<TaskRecord, MachineError> {
        let task = self.store.create_task(self.machine_id, payload).await?;
        tracing::debug!(parent: &self.span, task = task.id.as_i64(), "task created");
        Ok(task)
    }

    /// Records the committed row and fires the transition listener before
    /// the caller enqueues the next message, so observers always see the
    /// commit first.
    pub async fn commit_transition(
        &self,
        ctx: &TaskContext,
        to: &State,
        payload: &[u8],
    ) -> Result<(), MachineError> {
        let from = ctx.state();
        self.store
            .record_transition(NewTransition {
                task_id: ctx.task_id(),
                from_state: &from,
                to_state: to,
                payload,
                attempt: ctx.attempt(),
                status: TransitionStatus::Committed,
            })
            .await?;

        tracing::info!(parent: ctx.span(), from = %from, to = %to, "transition committed");

        if let Some(listener) = &self.on_transition {
            listener(ctx, ctx.task_id(), &from, to);
        }
        Ok(())
    }

    /// Registers a failed attempt at `state`: bumps the attempt counter,
    /// appends the failed row, and returns the attempt number with the
    /// delay to sleep before re-enqueueing.
    pub async fn fail_attempt(
        &self,
        ctx: &TaskContext,
        from: &State,
        state: &State,
        payload: &[u8],
        error: &anyhow::Error,
    ) -> Result<(u32, Duration), MachineError> {
        let attempt = self.store.attempts_at(ctx.task_id(), state).await? + 1;
        self.store
            .record_transition(NewTransition {
                task_id: ctx.task_id(),
                from_state: from,
                to_state: state,
                payload,
                attempt,
                status: TransitionStatus::Failed,
            })
            .await?;

        let delay = (self.backoff)(attempt);
        tracing::warn!(
            parent: ctx.span(),
            error = %error,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "transition failed, will retry"
        );
        Ok((attempt, delay))
    }

    /// Moves a task to the fatal `__error__` state. Used when its payload
    /// can no longer be decoded; the task is not re-enqueued afterwards.
    pub async fn fail_task(
        &self,
        task_id: TaskId,
        from: &State,
        reason: &str,
    ) -> Result<(), MachineError> {
        self.store
            .record_transition(NewTransition {
                task_id,
                from_state: from,
                to_state: &State::ERROR,
                payload: &[],
                attempt: 0,
                status: TransitionStatus::Committed,
            })
            .await?;

        tracing::error!(parent: &self.span, task = task_id.as_i64(), reason, "task failed fatally");
        Ok(())
    }

    /// Fires the completion listener for a task that reached `state`.
    pub fn complete(&self, ctx: &TaskContext, state: &State) {
        tracing::info!(parent: ctx.span(), state = %state, "task completed");
        if let Some(listener) = &self.on_completion {
            listener(ctx, ctx.task_id(), state);
        }
    }

    /// A non-terminal function returned without taking any transition. The
    /// contract expects exactly one; nothing is persisted, so the task will
    /// surface again on the next start.
    pub fn complete_without_transition(&self, ctx: &TaskContext) {
        let state = ctx.state();
        tracing::warn!(
            parent: ctx.span(),
            state = %state,
            "transition function returned without advancing; completing in place"
        );
        if let Some(listener) = &self.on_completion {
            listener(ctx, ctx.task_id(), &state);
        }
    }

    /// Number of failed attempts already on record for `(task, state)`;
    /// carried into the context of a resumed message.
    pub async fn prior_attempts(
        &self,
        task_id: TaskId,
        state: &State,
    ) -> Result<u32, MachineError> {
        Ok(self.store.attempts_at(task_id, state).await?)
    }

    /// Resume sweep: every open task of this machine resolved to the state
    /// it should re-enter, derived from its last committed transition.
    pub async fn open_tasks(
        &self,
        terminal_states: &[State],
    ) -> Result<Vec<ResumedTask>, MachineError> {
        let tasks = self.store.list_open_tasks(self.machine_id, terminal_states).await?;
        let mut resumed = Vec::with_capacity(tasks.len());

        for task in tasks {
            let entry = match self.store.last_committed_transition(task.id).await? {
                Some(transition) => ResumedTask {
                    task_id: task.id,
                    state: transition.to_state,
                    from: transition.from_state,
                    payload: transition.payload,
                },
                None => ResumedTask {
                    task_id: task.id,
                    state: State::INITIAL,
                    from: State::INITIAL,
                    payload: task.payload,
                },
            };
            tracing::info!(
                parent: &self.span,
                task = entry.task_id.as_i64(),
                state = %entry.state,
                "resuming task"
            );
            resumed.push(entry);
        }
        Ok(resumed)
    }
}

/// Cancellation-aware bounded enqueue. Checks shutdown first so a cancelled
/// machine never accepts new messages even when the queue has room.
pub async fn send_or_cancel<T>(
    core: &MachineCore,
    queue: &flume::Sender<T>,
    message: T,
) -> Result<(), MachineError> {
    tokio::select! {
        biased;
        () = core.cancelled() => Err(MachineError::Cancelled),
        result = queue.send_async(message) => result.map_err(|_| MachineError::Cancelled),
    }
}

/// Cancellation-aware dequeue; `None` means the worker should exit.
pub async fn recv_or_cancel<T>(core: &MachineCore, queue: &flume::Receiver<T>) -> Option<T> {
    tokio::select! {
        biased;
        () = core.cancelled() => None,
        message = queue.recv_async() => message.ok(),
    }
}

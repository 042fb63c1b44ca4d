use std::sync::Arc;

use tracing::Span;

use statecraft_core::{default_backoff, Backoff, State, TaskContext, TaskId};
use statecraft_db::Store;

/// Fired synchronously on the worker after each committed transition,
/// before the next message is enqueued.
pub type TransitionListener = Arc<dyn Fn(&TaskContext, TaskId, &State, &State) + Send + Sync>;

/// Fired synchronously once per task, after its terminal state's function
/// returns.
pub type CompletionListener = Arc<dyn Fn(&TaskContext, TaskId, &State) + Send + Sync>;

/// Configuration assembled by applying options in the order given to
/// `build_and_start`. Later options win.
pub struct MachineConfig {
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) backoff: Backoff,
    pub(crate) span: Span,
    pub(crate) on_transition: Option<TransitionListener>,
    pub(crate) on_completion: Option<CompletionListener>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            store: None,
            backoff: default_backoff(),
            span: Span::current(),
            on_transition: None,
            on_completion: None,
        }
    }
}

pub struct MachineOption(Box<dyn FnOnce(&mut MachineConfig) + Send>);

impl MachineOption {
    pub(crate) fn apply(self, config: &mut MachineConfig) {
        (self.0)(config);
    }
}

pub fn with_store(store: Arc<dyn Store>) -> MachineOption {
    MachineOption(Box::new(move |config| config.store = Some(store)))
}

pub fn with_backoff(backoff: Backoff) -> MachineOption {
    MachineOption(Box::new(move |config| config.backoff = backoff))
}

/// Parent span for every worker invocation of this machine; the ambient
/// structured-logging carrier.
pub fn with_span(span: Span) -> MachineOption {
    MachineOption(Box::new(move |config| config.span = span))
}

pub fn with_transition_listener(
    listener: impl Fn(&TaskContext, TaskId, &State, &State) + Send + Sync + 'static,
) -> MachineOption {
    MachineOption(Box::new(move |config| config.on_transition = Some(Arc::new(listener))))
}

pub fn with_completion_listener(
    listener: impl Fn(&TaskContext, TaskId, &State) + Send + Sync + 'static,
) -> MachineOption {
    MachineOption(Box::new(move |config| config.on_completion = Some(Arc::new(listener))))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use statecraft_core::linear;

    use super::{with_backoff, with_completion_listener, MachineConfig};

    #[test]
    fn options_apply_in_order_and_later_options_win() {
        let mut config = MachineConfig::default();

        let first = with_backoff(linear(Duration::from_millis(5), Duration::from_millis(5)));
        let second = with_backoff(linear(Duration::from_millis(80), Duration::from_secs(1)));
        first.apply(&mut config);
        second.apply(&mut config);

        assert_eq!((config.backoff)(1), Duration::from_millis(80));
    }

    #[test]
    fn listeners_are_installed() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let mut config = MachineConfig::default();
        with_completion_listener(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .apply(&mut config);

        let listener = config.on_completion.expect("listener installed");
        let ctx = statecraft_core::TaskContext::background();
        listener(&ctx, statecraft_core::TaskId(1), &statecraft_core::State::DONE);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

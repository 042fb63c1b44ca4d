pub mod codec;
pub mod error;
pub mod machine;
pub mod options;

use std::future::Future;
use std::pin::Pin;

pub use error::MachineError;
pub use machine::{recv_or_cancel, send_or_cancel, MachineCore, ResumedTask, StartLock};
pub use options::{
    with_backoff, with_completion_listener, with_span, with_store, with_transition_listener,
    CompletionListener, MachineConfig, MachineOption, TransitionListener,
};

/// Boxed future returned by registered transition functions. Generated
/// builder stages box the user's async closure into this shape.
pub type TransitionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

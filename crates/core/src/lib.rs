pub mod backoff;
pub mod context;
pub mod ids;
pub mod state;

pub use backoff::{default_backoff, exponential, linear, Backoff};
pub use context::TaskContext;
pub use ids::{MachineId, TaskId};
pub use state::State;

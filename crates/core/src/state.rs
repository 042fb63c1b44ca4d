use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque state name.
///
/// Generated modules declare their states as constants via
/// [`State::from_static`]; names read back from the store are owned. The
/// three reserved names mark the task lifecycle edges: `__initial__` before
/// the first committed transition, `__done__` for terminal success when no
/// terminal is configured, and `__error__` for fatal, non-resumable failure.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Cow<'static, str>);

impl State {
    pub const INITIAL: State = State::from_static("__initial__");
    pub const DONE: State = State::from_static("__done__");
    pub const ERROR: State = State::from_static("__error__");

    /// Sentinel surfaced by context accessors outside a transition.
    pub const UNKNOWN: State = State::from_static("__unknown__");

    pub const fn from_static(name: &'static str) -> Self {
        State(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        State(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self.as_str(), "__initial__" | "__done__" | "__error__")
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for State {
    fn from(name: String) -> Self {
        State::new(name)
    }
}

impl PartialEq<str> for State {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

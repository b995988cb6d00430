//! # Actions
//!
//! An [`Action`] is the symbolic outcome a node's post phase returns. The flow
//! uses it as an edge label: `(node, action)` selects the next node.
//!
//! One value is reserved. [`DEFAULT_ACTION`] (`"default"`) is what a node
//! returns when it makes no routing decision, and it is also the fallback key
//! the flow looks up when no route matches the returned action exactly.
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//!
//! let search: Action = "search".into();
//! assert_eq!(search.name(), "search");
//! assert!(Action::default().is_default());
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// The reserved action name used when no specific routing decision is made.
pub const DEFAULT_ACTION: &str = "default";

/// A routing label produced by a node's post phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    /// Create an action from any string-like name
    pub fn simple<S: Into<String>>(name: S) -> Self {
        Action(name.into())
    }

    /// The name of this action
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Whether this is the reserved default action
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_ACTION
    }
}

impl Default for Action {
    fn default() -> Self {
        Action(DEFAULT_ACTION.to_string())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        Action(s)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Action(s.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.0
    }
}

impl AsRef<str> for Action {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets routing tables keyed by `Action` be queried with a plain `&str`.
impl Borrow<str> for Action {
    fn borrow(&self) -> &str {
        &self.0
    }
}

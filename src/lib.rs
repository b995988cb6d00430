//! # flowgraph-rs
//!
//! A small directed-graph workflow executor.
//!
//! Work is modelled as a **Graph + Shared Store**:
//! - **Node**: one unit of work with a prep → exec → post lifecycle, where
//!   exec can be retried
//! - **Flow**: connects nodes through **Actions** (labelled edges) and walks
//!   them until no route matches
//! - **Shared Store**: the key/value map nodes use to talk to each other
//! - **BatchNode**: applies one function to every item of a collection,
//!   sequentially or on concurrent tasks
//!
//! Every run is driven by an [`ExecutionContext`], which carries cancellation
//! and an optional deadline into every phase of every node.
//!
//! ## Example
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), FlowError> {
//! let double = Node::new(
//!     FunctionNode::with_prep(
//!         "double",
//!         |_ctx, store: SharedStore| async move { Ok(store.require::<i64>("n")?) },
//!         |_ctx, n: i64| async move { Ok(n * 2) },
//!     )
//!     .with_post(|_ctx, store, _, doubled: i64| async move {
//!         store.set("n", doubled);
//!         Ok(Action::from(if doubled < 100 { "again" } else { "done" }))
//!     }),
//! )
//! .shared();
//!
//! let mut flow = Flow::new(double.clone());
//! flow.connect(&double, "again", &double);
//!
//! let store = SharedStore::new();
//! store.set("n", 3);
//! let result = flow.run(&ExecutionContext::new(), &store).await?;
//!
//! assert_eq!(store.get("n"), Some(json!(192)));
//! assert_eq!(result.final_action, Action::from("done"));
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod context;
pub mod flow;
pub mod node;
pub mod shared_store;

pub use action::{Action, DEFAULT_ACTION};
pub use context::ExecutionContext;
pub use flow::{
    DEFAULT_MAX_PATH_LEN, Flow, FlowBuilder, FlowConfig, FlowExecutionResult, NodeRef, NodeRunner,
};
pub use node::batch::BatchNode;
pub use node::{FunctionNode, Node, NodeBackend, NodeId, RetryConfig};
pub use shared_store::{KEY_ITEMS, KEY_RESULTS, SharedStore};

/// Commonly used external types
pub use serde_json::Value as JsonValue;

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::{
        Action, BatchNode, BoxError, DEFAULT_ACTION, ExecutionContext, Flow, FlowBuilder,
        FlowConfig, FlowError, FlowExecutionResult, FlowResult, FunctionNode, KEY_ITEMS,
        KEY_RESULTS, Node, NodeBackend, NodeId, NodeRef, NodeRunner, RetryConfig, SharedStore,
    };

    pub use serde_json::Value as JsonValue;
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Error type returned by node bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for flow operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Everything that can stop a node or a flow
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// The prep phase failed; exec and post did not run
    #[error("Prep failed: {0}")]
    Prep(#[source] BoxError),

    /// Every exec attempt failed and no fallback recovered
    #[error("Exec failed after {attempts} attempt(s): {source}")]
    Exec {
        attempts: usize,
        #[source]
        source: BoxError,
    },

    /// The post phase failed; earlier store writes are kept
    #[error("Post failed: {0}")]
    Post(#[source] BoxError),

    /// The execution context was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// The execution context's deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The first failing item of a batch
    #[error("Batch item {index} failed: {source}")]
    BatchItem {
        index: usize,
        #[source]
        source: BoxError,
    },

    /// A batch worker task panicked or was aborted from outside
    #[error("Batch worker failed: {0}")]
    BatchWorker(#[from] tokio::task::JoinError),

    /// The optional hop limit of a flow was reached
    #[error("Maximum hops exceeded: {0}")]
    MaxHopsExceeded(usize),

    /// Two different nodes with the same id were wired into one flow
    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(String),

    /// A required key is missing from the shared store
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// True for [`Cancelled`](Self::Cancelled) and
    /// [`DeadlineExceeded`](Self::DeadlineExceeded).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Index of the failing batch item, looking through the `Exec` wrapper a
    /// batch error is reported in.
    pub fn batch_item_index(&self) -> Option<usize> {
        match self {
            Self::BatchItem { index, .. } => Some(*index),
            Self::Exec { source, .. } => source
                .downcast_ref::<FlowError>()
                .and_then(FlowError::batch_item_index),
            _ => None,
        }
    }
}

//! # Flow Orchestration
//!
//! A [`Flow`] is a directed graph of nodes whose edges are labelled with
//! [`Action`]s. Running a flow walks the graph from its start node:
//!
//! 1. Run the current node and take the action its post phase returns.
//! 2. Look up `(current node, action)` in the routing table, then
//!    `(current node, "default")` if there is no exact match.
//! 3. If neither exists the flow has finished successfully; otherwise the
//!    resolved node becomes the current node.
//!
//! Any node error aborts the whole run and is returned unchanged. Cycles are
//! legal, so a graph may loop indefinitely; runs are bounded only by the
//! [`ExecutionContext`] (cancellation or deadline) and, if configured, by
//! [`FlowConfig::max_hops`].
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), FlowError> {
//! let ask = Node::new(
//!     FunctionNode::new("ask", |_ctx, _| async { Ok("What is Rust?".to_string()) })
//!         .with_post(|_ctx, store, _, question: String| async move {
//!             store.set("question", question);
//!             Ok(Action::default())
//!         }),
//! )
//! .shared();
//! let answer = Node::new(
//!     FunctionNode::with_prep(
//!         "answer",
//!         |_ctx, store: SharedStore| async move { Ok(store.require::<String>("question")?) },
//!         |_ctx, question: String| async move { Ok(format!("An answer to: {question}")) },
//!     )
//!     .with_post(|_ctx, store, _, answer: String| async move {
//!         store.set("answer", answer);
//!         Ok(Action::default())
//!     }),
//! )
//! .shared();
//!
//! let mut flow = Flow::new(ask.clone());
//! flow.connect(&ask, DEFAULT_ACTION, &answer);
//!
//! let store = SharedStore::new();
//! let result = flow.run(&ExecutionContext::new(), &store).await?;
//!
//! assert_eq!(result.steps_executed, 2);
//! assert!(store.contains_key("answer"));
//! # Ok(())
//! # }
//! ```

use crate::action::DEFAULT_ACTION;
use crate::node::{Node, NodeBackend, NodeId};
use crate::{Action, ExecutionContext, FlowError, SharedStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Type-erased node runner, so nodes with different prep/exec types can live
/// in one routing table.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    fn id(&self) -> &NodeId;

    fn name(&self) -> &str;

    async fn run(&self, ctx: &ExecutionContext, store: &SharedStore) -> Result<Action, FlowError>;
}

/// Shared handle to a node inside a flow
pub type NodeRef = Arc<dyn NodeRunner>;

#[async_trait]
impl<B> NodeRunner for Node<B>
where
    B: NodeBackend + 'static,
{
    fn id(&self) -> &NodeId {
        Node::id(self)
    }

    fn name(&self) -> &str {
        Node::name(self)
    }

    async fn run(&self, ctx: &ExecutionContext, store: &SharedStore) -> Result<Action, FlowError> {
        Node::run(self, ctx, store).await
    }
}

/// Default number of node ids a run keeps in [`FlowExecutionResult::execution_path`]
pub const DEFAULT_MAX_PATH_LEN: usize = 1000;

/// Configuration for flow execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Name used in logs and as the node name when nested
    pub name: String,
    /// Optional cap on node executions per run; `None` means unbounded
    pub max_hops: Option<usize>,
    /// How many of the most recent node ids a run records; 0 records none
    pub max_path_len: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            name: "flow".to_string(),
            max_hops: None,
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }
}

/// Execution result from a successful flow run
#[derive(Debug, Clone, PartialEq)]
pub struct FlowExecutionResult {
    /// The action returned by the last node
    pub final_action: Action,
    /// The ID of the last executed node
    pub last_node_id: NodeId,
    /// Number of node executions
    pub steps_executed: usize,
    /// The most recent node ids in execution order, at most
    /// [`FlowConfig::max_path_len`] of them
    pub execution_path: Vec<NodeId>,
}

/// A start node plus a routing table of `(node, action) -> node` entries.
pub struct Flow {
    id: NodeId,
    start: NodeRef,
    nodes: HashMap<NodeId, NodeRef>,
    routes: HashMap<NodeId, HashMap<Action, NodeId>>,
    config: FlowConfig,
}

impl Flow {
    /// Create a flow that starts at `start`
    pub fn new(start: NodeRef) -> Self {
        Self::with_config(start, FlowConfig::default())
    }

    /// Create a flow with custom configuration
    pub fn with_config(start: NodeRef, config: FlowConfig) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(start.id().clone(), Arc::clone(&start));
        Self {
            id: NodeId::generate(),
            start,
            nodes,
            routes: HashMap::new(),
            config,
        }
    }

    /// Route `action` from `from` to `to`.
    ///
    /// Connecting the same `(from, action)` pair twice replaces the earlier
    /// destination.
    ///
    /// # Panics
    ///
    /// Panics if `from` or `to` shares its id with a different node already in
    /// the flow. Use [`try_connect`](Self::try_connect) to get an error instead.
    pub fn connect(&mut self, from: &NodeRef, action: impl Into<Action>, to: &NodeRef) -> &mut Self {
        if let Err(err) = self.add_route(from, action.into(), to) {
            panic!("invalid route in flow '{}': {err}", self.config.name);
        }
        self
    }

    /// Like [`connect`](Self::connect), but a node id collision is returned as
    /// [`FlowError::DuplicateNodeId`] and leaves the flow unchanged.
    pub fn try_connect(
        &mut self,
        from: &NodeRef,
        action: impl Into<Action>,
        to: &NodeRef,
    ) -> Result<&mut Self, FlowError> {
        self.add_route(from, action.into(), to)?;
        Ok(self)
    }

    fn add_route(&mut self, from: &NodeRef, action: Action, to: &NodeRef) -> Result<(), FlowError> {
        self.check_identity(from)?;
        self.check_identity(to)?;
        if from.id() == to.id() && !Arc::ptr_eq(from, to) {
            return Err(FlowError::DuplicateNodeId(to.id().to_string()));
        }
        self.register(from);
        self.register(to);

        let previous = self
            .routes
            .entry(from.id().clone())
            .or_default()
            .insert(action.clone(), to.id().clone());
        if let Some(previous) = previous {
            debug!(
                flow = %self.config.name,
                from = %from.name(),
                action = %action,
                replaced = %previous,
                "route replaced"
            );
        }
        Ok(())
    }

    fn check_identity(&self, node: &NodeRef) -> Result<(), FlowError> {
        match self.nodes.get(node.id()) {
            Some(existing) if !Arc::ptr_eq(existing, node) => {
                Err(FlowError::DuplicateNodeId(node.id().to_string()))
            }
            _ => Ok(()),
        }
    }

    fn register(&mut self, node: &NodeRef) {
        self.nodes
            .entry(node.id().clone())
            .or_insert_with(|| Arc::clone(node));
    }

    pub fn start_node(&self) -> &NodeRef {
        &self.start
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Number of distinct nodes reachable through the routing table
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve the node that follows `from` when it returns `action`:
    /// exact match first, then the default action, otherwise `None`.
    pub fn next_node(&self, from: &NodeId, action: &Action) -> Option<&NodeRef> {
        let routes = self.routes.get(from)?;
        routes
            .get(action)
            .or_else(|| routes.get(DEFAULT_ACTION))
            .and_then(|id| self.nodes.get(id))
    }

    /// Run the flow from its start node until no route matches.
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        store: &SharedStore,
    ) -> Result<FlowExecutionResult, FlowError> {
        info!(flow = %self.config.name, execution_id = %ctx.execution_id(), "flow started");

        let mut current = Arc::clone(&self.start);
        let max_path_len = self.config.max_path_len;
        let mut execution_path = VecDeque::with_capacity(max_path_len.min(64));
        let mut steps_executed = 0usize;

        loop {
            if let Some(err) = ctx.err() {
                info!(flow = %self.config.name, reason = %err, "flow stopped");
                return Err(err);
            }
            if let Some(max_hops) = self.config.max_hops {
                if steps_executed >= max_hops {
                    error!(flow = %self.config.name, max_hops, "hop limit reached");
                    return Err(FlowError::MaxHopsExceeded(max_hops));
                }
            }

            steps_executed += 1;
            if max_path_len > 0 {
                if execution_path.len() == max_path_len {
                    execution_path.pop_front();
                }
                execution_path.push_back(current.id().clone());
            }
            let action = match current.run(ctx, store).await {
                Ok(action) => action,
                Err(err) => {
                    if err.is_cancellation() {
                        info!(flow = %self.config.name, node = %current.name(), reason = %err, "flow stopped");
                    } else {
                        error!(flow = %self.config.name, node = %current.name(), error = %err, "node failed, aborting flow");
                    }
                    return Err(err);
                }
            };

            match self.next_node(current.id(), &action) {
                Some(next) => {
                    debug!(
                        flow = %self.config.name,
                        from = %current.name(),
                        action = %action,
                        to = %next.name(),
                        "routing"
                    );
                    current = Arc::clone(next);
                }
                None => {
                    info!(
                        flow = %self.config.name,
                        steps = steps_executed,
                        final_action = %action,
                        "flow completed"
                    );
                    return Ok(FlowExecutionResult {
                        final_action: action,
                        last_node_id: current.id().clone(),
                        steps_executed,
                        execution_path: execution_path.into(),
                    });
                }
            }
        }
    }
}

/// A flow can be a node of another flow. Its action is the final action of
/// its last node.
#[async_trait]
impl NodeRunner for Flow {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, ctx: &ExecutionContext, store: &SharedStore) -> Result<Action, FlowError> {
        Flow::run(self, ctx, store)
            .await
            .map(|result| result.final_action)
    }
}

/// Builder for creating flows easily
pub struct FlowBuilder {
    start: NodeRef,
    routes: Vec<(NodeRef, Action, NodeRef)>,
    config: FlowConfig,
}

impl FlowBuilder {
    /// Start building a flow that begins at `start`
    pub fn new(start: &NodeRef) -> Self {
        Self {
            start: Arc::clone(start),
            routes: Vec::new(),
            config: FlowConfig::default(),
        }
    }

    /// Set the flow name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set maximum node executions per run
    pub fn max_hops(mut self, max_hops: usize) -> Self {
        self.config.max_hops = Some(max_hops);
        self
    }

    /// Keep at most `len` node ids in the execution path
    pub fn max_path_len(mut self, len: usize) -> Self {
        self.config.max_path_len = len;
        self
    }

    /// Add a route (from, action) -> to
    pub fn route(mut self, from: &NodeRef, action: impl Into<Action>, to: &NodeRef) -> Self {
        self.routes
            .push((Arc::clone(from), action.into(), Arc::clone(to)));
        self
    }

    /// Build the flow
    ///
    /// # Panics
    ///
    /// Panics if two different nodes in the routes share an id, as
    /// [`Flow::connect`] does.
    pub fn build(self) -> Flow {
        let mut flow = Flow::with_config(self.start, self.config);
        for (from, action, to) in &self.routes {
            flow.connect(from, action.clone(), to);
        }
        flow
    }
}

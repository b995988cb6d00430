//! # Node System
//!
//! Nodes are the units of work a flow sequences. Every node follows the same
//! three-phase lifecycle:
//!
//! ### 1. Prep (`prep`)
//! Gathers input from the shared store. Runs at most once per execution and
//! is never retried.
//!
//! ### 2. Exec (`exec`)
//! Does the actual work, usually an unreliable external call. This is the only
//! retried phase: it runs up to `max_retries + 1` times, with an optional delay
//! (and backoff) between attempts. It has no access to the shared store.
//!
//! ### 3. Post (`post`)
//! Records the outcome in the shared store and picks the [`Action`] that
//! routes the flow. Runs at most once, and only after exec succeeded.
//!
//! Intermediate values are typed per node through the associated types of
//! [`NodeBackend`], so a mismatch between what prep produces and what exec
//! expects is a compile error.
//!
//! ## Building nodes
//!
//! Implement [`NodeBackend`] for reusable nodes, or use [`FunctionNode`] to
//! assemble one from closures:
//!
//! ```rust
//! use flowgraph_rs::prelude::*;
//! use std::time::Duration;
//!
//! let node = Node::new(
//!     FunctionNode::with_prep(
//!         "shout",
//!         |_ctx, store: SharedStore| async move {
//!             Ok(store.require::<String>("input")?)
//!         },
//!         |_ctx, input: String| async move { Ok(input.to_uppercase()) },
//!     )
//!     .with_post(|_ctx, store, _input, output: String| async move {
//!         store.set("output", output);
//!         Ok(Action::default())
//!     })
//!     .with_retries(3)
//!     .with_retry_delay(Duration::from_millis(100)),
//! );
//! # let _ = node;
//! ```
//!
//! ## Cancellation
//!
//! Each exec attempt and each retry delay is raced against the
//! [`ExecutionContext`]. Once the context is cancelled or its deadline passes
//! the node returns [`FlowError::Cancelled`] / [`FlowError::DeadlineExceeded`]
//! immediately, whatever retry budget is left.

use crate::flow::NodeRef;
use crate::{Action, BoxError, ExecutionContext, FlowError, SharedStore};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod batch;
mod retry;

pub use retry::RetryConfig;

type PrepFn<P> =
    Box<dyn Fn(ExecutionContext, SharedStore) -> BoxFuture<'static, Result<P, BoxError>> + Send + Sync>;
type ExecFn<P, E> =
    Box<dyn Fn(ExecutionContext, P) -> BoxFuture<'static, Result<E, BoxError>> + Send + Sync>;
type PostFn<P, E> = Box<
    dyn Fn(ExecutionContext, SharedStore, P, E) -> BoxFuture<'static, Result<Action, BoxError>>
        + Send
        + Sync,
>;
type FallbackFn<P, E> = Box<
    dyn Fn(ExecutionContext, P, BoxError) -> BoxFuture<'static, Result<E, BoxError>> + Send + Sync,
>;

/// Identity of a node inside a flow's routing table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Core trait for implementing custom nodes.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// The type returned by the prep phase
    type PrepResult: Send + Sync + 'static;
    /// The type returned by the exec phase
    type ExecResult: Send + Sync + 'static;

    /// Read what exec needs from the shared store.
    async fn prep(
        &self,
        ctx: &ExecutionContext,
        store: &SharedStore,
    ) -> Result<Self::PrepResult, BoxError>;

    /// Perform the main computation. May run several times, so it should be
    /// safe to repeat.
    async fn exec(
        &self,
        ctx: &ExecutionContext,
        prep_result: &Self::PrepResult,
    ) -> Result<Self::ExecResult, BoxError>;

    /// Write results back and choose the next action.
    async fn post(
        &self,
        _ctx: &ExecutionContext,
        _store: &SharedStore,
        _prep_result: Self::PrepResult,
        _exec_result: Self::ExecResult,
    ) -> Result<Action, BoxError> {
        Ok(Action::default())
    }

    /// Called once exec has failed on its last allowed attempt.
    ///
    /// Returning `Ok` substitutes a recovery value that continues into post as
    /// if exec had succeeded. By default the error is re-raised.
    async fn exec_fallback(
        &self,
        _ctx: &ExecutionContext,
        _prep_result: &Self::PrepResult,
        error: BoxError,
    ) -> Result<Self::ExecResult, BoxError> {
        Err(error)
    }

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Retry policy for the exec phase
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::default()
    }
}

/// Runs a [`NodeBackend`] through its lifecycle, owning the retry loop.
pub struct Node<B: NodeBackend> {
    id: NodeId,
    backend: B,
}

impl<B: NodeBackend> Node<B> {
    /// Create a new node with a random id
    pub fn new(backend: B) -> Self {
        Self::with_id(NodeId::generate(), backend)
    }

    /// Create a node with a fixed id, handy for asserting execution paths.
    ///
    /// Ids must be unique within a flow: wiring two different nodes with the
    /// same id makes [`Flow::connect`](crate::Flow::connect) panic and
    /// [`Flow::try_connect`](crate::Flow::try_connect) return
    /// [`FlowError::DuplicateNodeId`].
    pub fn with_id(id: impl Into<NodeId>, backend: B) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Wrap the node in a shareable handle for wiring into flows
    pub fn shared(self) -> NodeRef
    where
        B: 'static,
    {
        Arc::new(self)
    }

    /// Run the complete lifecycle: prep -> exec (with retries) -> post
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        store: &SharedStore,
    ) -> Result<Action, FlowError> {
        let name = self.backend.name();

        debug!(node = %name, id = %self.id, "prep");
        let prep_result = match self.backend.prep(ctx, store).await {
            Ok(prep_result) => prep_result,
            Err(error) => return Err(ctx.err().unwrap_or(FlowError::Prep(error))),
        };

        let exec_result = self.exec_with_retries(ctx, &prep_result).await?;

        debug!(node = %name, id = %self.id, "post");
        match self.backend.post(ctx, store, prep_result, exec_result).await {
            Ok(action) => {
                debug!(node = %name, action = %action, "node finished");
                Ok(action)
            }
            Err(error) => Err(ctx.err().unwrap_or(FlowError::Post(error))),
        }
    }

    async fn exec_with_retries(
        &self,
        ctx: &ExecutionContext,
        prep_result: &B::PrepResult,
    ) -> Result<B::ExecResult, FlowError> {
        let name = self.backend.name();
        let retry = self.backend.retry_config();
        let max_attempts = retry.max_attempts();
        let mut attempt = 1;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let attempt_ctx = ctx.for_attempt(attempt, max_attempts);
            debug!(node = %name, attempt, max_attempts, "exec");
            let outcome = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                outcome = self.backend.exec(&attempt_ctx, prep_result) => outcome,
            };

            let error = match outcome {
                Ok(exec_result) => return Ok(exec_result),
                Err(error) => error,
            };

            if let Some(err) = ctx.err() {
                return Err(err);
            }

            if attempt >= max_attempts {
                if max_attempts > 1 {
                    warn!(node = %name, attempts = attempt, error = %error, "exec retries exhausted");
                }
                let recovered = tokio::select! {
                    biased;
                    err = ctx.done() => return Err(err),
                    recovered = self.backend.exec_fallback(&attempt_ctx, prep_result, error) => recovered,
                };
                return match recovered {
                    Ok(exec_result) => Ok(exec_result),
                    Err(source) => Err(ctx.err().unwrap_or(FlowError::Exec {
                        attempts: attempt,
                        source,
                    })),
                };
            }

            attempt += 1;
            let delay = retry.delay_before(attempt);
            warn!(
                node = %name,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "exec failed, retrying"
            );
            if !delay.is_zero() {
                ctx.sleep(delay).await?;
            }
        }
    }
}

impl<B: NodeBackend + fmt::Debug> fmt::Debug for Node<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .finish()
    }
}

/// A node assembled from closures, for quick prototyping.
///
/// Only exec is required. Without a prep closure the prep result is `()`;
/// without a post closure the node returns the default action.
pub struct FunctionNode<P, E> {
    name: String,
    prep_fn: PrepFn<P>,
    exec_fn: ExecFn<P, E>,
    post_fn: Option<PostFn<P, E>>,
    fallback_fn: Option<FallbackFn<P, E>>,
    retry: RetryConfig,
}

impl<E> FunctionNode<(), E>
where
    E: Send + Sync + 'static,
{
    /// Create a node from an exec closure alone
    pub fn new<F, Fut>(name: impl Into<String>, exec: F) -> Self
    where
        F: Fn(ExecutionContext, ()) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, BoxError>> + Send + 'static,
    {
        Self::with_prep(name, |_, _| async { Ok::<(), BoxError>(()) }, exec)
    }
}

impl<P, E> FunctionNode<P, E>
where
    P: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a node from prep and exec closures
    pub fn with_prep<PF, PFut, F, Fut>(name: impl Into<String>, prep: PF, exec: F) -> Self
    where
        PF: Fn(ExecutionContext, SharedStore) -> PFut + Send + Sync + 'static,
        PFut: Future<Output = Result<P, BoxError>> + Send + 'static,
        F: Fn(ExecutionContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            prep_fn: Box::new(move |ctx, store| Box::pin(prep(ctx, store))),
            exec_fn: Box::new(move |ctx, prep_result| Box::pin(exec(ctx, prep_result))),
            post_fn: None,
            fallback_fn: None,
            retry: RetryConfig::default(),
        }
    }

    /// Set the post closure
    pub fn with_post<F, Fut>(mut self, post: F) -> Self
    where
        F: Fn(ExecutionContext, SharedStore, P, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action, BoxError>> + Send + 'static,
    {
        self.post_fn = Some(Box::new(move |ctx, store, prep_result, exec_result| {
            Box::pin(post(ctx, store, prep_result, exec_result))
        }));
        self
    }

    /// Set a recovery closure used once exec retries are exhausted
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(ExecutionContext, P, BoxError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, BoxError>> + Send + 'static,
    {
        self.fallback_fn = Some(Box::new(move |ctx, prep_result, error| {
            Box::pin(fallback(ctx, prep_result, error))
        }));
        self
    }

    /// Set maximum number of retries
    pub fn with_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Set retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.wait = delay;
        self
    }

    /// Set the backoff multiplier applied to the retry delay
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.retry.backoff = backoff;
        self
    }

    /// Replace the whole retry policy
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl<P, E> NodeBackend for FunctionNode<P, E>
where
    P: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type PrepResult = P;
    type ExecResult = E;

    async fn prep(&self, ctx: &ExecutionContext, store: &SharedStore) -> Result<P, BoxError> {
        (self.prep_fn)(ctx.clone(), store.clone()).await
    }

    async fn exec(&self, ctx: &ExecutionContext, prep_result: &P) -> Result<E, BoxError> {
        (self.exec_fn)(ctx.clone(), prep_result.clone()).await
    }

    async fn post(
        &self,
        ctx: &ExecutionContext,
        store: &SharedStore,
        prep_result: P,
        exec_result: E,
    ) -> Result<Action, BoxError> {
        match &self.post_fn {
            Some(post) => post(ctx.clone(), store.clone(), prep_result, exec_result).await,
            None => Ok(Action::default()),
        }
    }

    async fn exec_fallback(
        &self,
        ctx: &ExecutionContext,
        prep_result: &P,
        error: BoxError,
    ) -> Result<E, BoxError> {
        match &self.fallback_fn {
            Some(fallback) => fallback(ctx.clone(), prep_result.clone(), error).await,
            None => Err(error),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn retry_config(&self) -> RetryConfig {
        self.retry.clone()
    }
}

#[cfg(test)]
mod tests;

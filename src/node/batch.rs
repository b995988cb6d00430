//! Batch fan-out over a collection read from the shared store.
//!
//! A [`BatchNode`] is an ordinary [`NodeBackend`]:
//!
//! - **prep** reads `Vec<I>` from the items key (`"items"` by default). A
//!   missing key is an empty batch.
//! - **exec** applies the item function to every element, either one after
//!   the other or on concurrently spawned tasks, and collects the outputs in
//!   input order. Retries apply to the batch as a whole.
//! - **post** writes the ordered `Vec<O>` under the results key (`"results"`
//!   by default) and returns the configured action.
//!
//! Both modes fail fast. The first failing item aborts the batch with
//! [`FlowError::BatchItem`] and nothing is written to the store. In concurrent
//! mode the remaining workers are cancelled through a child context and their
//! tasks aborted.

use super::{NodeBackend, RetryConfig};
use crate::shared_store::{KEY_ITEMS, KEY_RESULTS};
use crate::{Action, BoxError, ExecutionContext, FlowError, SharedStore};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

type ItemFn<I, O> =
    Arc<dyn Fn(ExecutionContext, I) -> BoxFuture<'static, Result<O, BoxError>> + Send + Sync>;

/// Applies one function to every item of a collection.
pub struct BatchNode<I, O> {
    name: String,
    item_fn: ItemFn<I, O>,
    concurrent: bool,
    max_concurrency: Option<usize>,
    items_key: String,
    results_key: String,
    action: Action,
    retry: RetryConfig,
}

impl<I, O> BatchNode<I, O>
where
    I: DeserializeOwned + Clone + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    /// Create a batch node. With `concurrent` set, items are processed in
    /// parallel, all at once unless [`with_max_concurrency`](Self::with_max_concurrency)
    /// bounds it.
    pub fn new<F, Fut>(name: impl Into<String>, item_fn: F, concurrent: bool) -> Self
    where
        F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            item_fn: Arc::new(move |ctx, item| Box::pin(item_fn(ctx, item))),
            concurrent,
            max_concurrency: None,
            items_key: KEY_ITEMS.to_string(),
            results_key: KEY_RESULTS.to_string(),
            action: Action::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Limit how many items are in flight at once (concurrent mode only)
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Read the input collection from `key` instead of `"items"`
    pub fn with_items_key(mut self, key: impl Into<String>) -> Self {
        self.items_key = key.into();
        self
    }

    /// Write the ordered results to `key` instead of `"results"`
    pub fn with_results_key(mut self, key: impl Into<String>) -> Self {
        self.results_key = key.into();
        self
    }

    /// Action returned after the results are written
    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.action = action.into();
        self
    }

    /// Set maximum number of retries for the whole batch
    pub fn with_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Set retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.wait = delay;
        self
    }

    /// Replace the whole retry policy
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    async fn run_sequential(
        &self,
        ctx: &ExecutionContext,
        items: &[I],
    ) -> Result<Vec<O>, FlowError> {
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let outcome = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                outcome = (self.item_fn)(ctx.clone(), item.clone()) => outcome,
            };
            match outcome {
                Ok(result) => results.push(result),
                Err(source) => return Err(ctx.err().unwrap_or(FlowError::BatchItem { index, source })),
            }
        }

        Ok(results)
    }

    async fn run_concurrent(
        &self,
        ctx: &ExecutionContext,
        items: &[I],
    ) -> Result<Vec<O>, FlowError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let limit = self
            .max_concurrency
            .unwrap_or(items.len())
            .clamp(1, items.len());
        let workers = ctx.child();
        let mut slots: Vec<Option<O>> = std::iter::repeat_with(|| None).take(items.len()).collect();

        debug!(node = %self.name, items = items.len(), limit, "spawning batch workers");
        let mut pending = stream::iter(items.iter().cloned().enumerate())
            .map(|(index, item)| {
                let item_fn = Arc::clone(&self.item_fn);
                let worker_ctx = workers.clone();
                AbortOnDrop(tokio::spawn(async move {
                    let outcome = tokio::select! {
                        biased;
                        err = worker_ctx.done() => Err(BoxError::from(err)),
                        outcome = item_fn(worker_ctx.clone(), item) => outcome,
                    };
                    (index, outcome)
                }))
            })
            .buffer_unordered(limit);

        let outcome = loop {
            let next = tokio::select! {
                biased;
                err = ctx.done() => break Err(err),
                next = pending.next() => next,
            };
            match next {
                None => break Ok(()),
                Some(Ok((index, Ok(result)))) => slots[index] = Some(result),
                Some(Ok((index, Err(source)))) => {
                    break Err(ctx.err().unwrap_or(FlowError::BatchItem { index, source }));
                }
                Some(Err(join_error)) => break Err(FlowError::BatchWorker(join_error)),
            }
        };

        if outcome.is_err() {
            workers.cancel();
        }
        // Dropping the stream aborts every worker still running.
        drop(pending);
        outcome?;

        // A drained stream has yielded every index exactly once.
        Ok(slots.into_iter().flatten().collect())
    }
}

#[async_trait]
impl<I, O> NodeBackend for BatchNode<I, O>
where
    I: DeserializeOwned + Clone + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    type PrepResult = Vec<I>;
    type ExecResult = Vec<O>;

    async fn prep(&self, _ctx: &ExecutionContext, store: &SharedStore) -> Result<Vec<I>, BoxError> {
        match store.get_deserializable::<Vec<I>>(&self.items_key)? {
            Some(items) => Ok(items),
            None => {
                debug!(node = %self.name, key = %self.items_key, "no batch items in store");
                Ok(Vec::new())
            }
        }
    }

    async fn exec(&self, ctx: &ExecutionContext, items: &Vec<I>) -> Result<Vec<O>, BoxError> {
        let results = if self.concurrent {
            self.run_concurrent(ctx, items).await?
        } else {
            self.run_sequential(ctx, items).await?
        };
        Ok(results)
    }

    async fn post(
        &self,
        _ctx: &ExecutionContext,
        store: &SharedStore,
        _items: Vec<I>,
        results: Vec<O>,
    ) -> Result<Action, BoxError> {
        debug!(node = %self.name, results = results.len(), key = %self.results_key, "storing batch results");
        store.set_serializable(self.results_key.as_str(), &results)?;
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn retry_config(&self) -> RetryConfig {
        self.retry.clone()
    }
}

/// Aborts the spawned task when dropped, so abandoned workers do not linger.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

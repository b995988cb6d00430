use crate::prelude::*;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Fails a fixed number of times before succeeding, and recovers through
/// `exec_fallback` if it is still failing when retries run out.
struct FlakyBackend {
    failures: usize,
    retries: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl NodeBackend for FlakyBackend {
    type PrepResult = ();
    type ExecResult = String;

    async fn prep(&self, _ctx: &ExecutionContext, _store: &SharedStore) -> Result<(), BoxError> {
        Ok(())
    }

    async fn exec(&self, ctx: &ExecutionContext, _prep: &()) -> Result<String, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(format!("failure {call}").into());
        }
        Ok(format!("ok on attempt {}", ctx.attempt()))
    }

    async fn post(
        &self,
        _ctx: &ExecutionContext,
        store: &SharedStore,
        _prep: (),
        result: String,
    ) -> Result<Action, BoxError> {
        store.set("flaky", result);
        Ok(Action::from("flaky_done"))
    }

    async fn exec_fallback(
        &self,
        _ctx: &ExecutionContext,
        _prep: &(),
        error: BoxError,
    ) -> Result<String, BoxError> {
        Ok(format!("recovered from {error}"))
    }

    fn name(&self) -> &str {
        "FlakyBackend"
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.retries, Duration::ZERO)
    }
}

fn counting_failure(calls: &Arc<AtomicUsize>) -> FunctionNode<(), ()> {
    let calls = Arc::clone(calls);
    FunctionNode::new("AlwaysFails", move |_ctx, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), BoxError>("service unavailable".into()) }
    })
}

#[tokio::test]
async fn test_function_node() {
    let store = SharedStore::new();
    store.set("input", 42);

    let node = Node::new(
        FunctionNode::with_prep(
            "DoubleNode",
            |_ctx, store: SharedStore| async move { Ok(store.require::<i64>("input")?) },
            |_ctx, input: i64| async move { Ok(input * 2) },
        )
        .with_post(|_ctx, store, _prep, result: i64| async move {
            store.set("output", result);
            Ok(Action::from("double_complete"))
        }),
    );

    let action = assert_ok!(node.run(&ExecutionContext::new(), &store).await);
    assert_eq!(action.name(), "double_complete");
    assert_eq!(store.get("output"), Some(json!(84)));
}

#[tokio::test]
async fn test_default_post_returns_default_action() {
    let node = Node::new(FunctionNode::new("NoPost", |_ctx, _| async { Ok(1) }));

    let action = assert_ok!(node.run(&ExecutionContext::new(), &SharedStore::new()).await);
    assert!(action.is_default());
}

#[tokio::test]
async fn test_exec_runs_once_on_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let node = Node::new(
        FunctionNode::new("Succeeds", move |_ctx, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .with_retries(5),
    );

    assert_ok!(node.run(&ExecutionContext::new(), &SharedStore::new()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exec_retries_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = Node::new(counting_failure(&calls).with_retries(2));

    let err = assert_err!(node.run(&ExecutionContext::new(), &SharedStore::new()).await);
    match err {
        FlowError::Exec { attempts, source } => {
            assert_eq!(attempts, 3);
            assert_eq!(source.to_string(), "service unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_attempt_numbers_are_monotonic() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let node = Node::new(
        FunctionNode::new("Records", move |ctx: ExecutionContext, _| {
            recorder.lock().push((ctx.attempt(), ctx.max_attempts()));
            async move {
                if ctx.can_retry() {
                    Err::<(), BoxError>("not yet".into())
                } else {
                    Ok(())
                }
            }
        })
        .with_retries(2),
    );

    assert_ok!(node.run(&ExecutionContext::new(), &SharedStore::new()).await);
    assert_eq!(*seen.lock(), vec![(1, 3), (2, 3), (3, 3)]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delay_is_applied_between_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = Node::new(
        counting_failure(&calls)
            .with_retries(2)
            .with_retry_delay(Duration::from_millis(100))
            .with_backoff(2.0),
    );

    let start = tokio::time::Instant::now();
    assert_err!(node.run(&ExecutionContext::new(), &SharedStore::new()).await);

    // 100ms before attempt 2, 200ms before attempt 3, nothing after the last.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_attempts_stops_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = Node::new(
        counting_failure(&calls)
            .with_retries(10)
            .with_retry_delay(Duration::from_secs(1)),
    );

    let ctx = ExecutionContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let err = assert_err!(node.run(&ctx, &SharedStore::new()).await);
    assert!(matches!(err, FlowError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_interrupts_exec() {
    let node = Node::new(FunctionNode::new("Slow", |_ctx, _| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }));

    let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(1));
    let err = assert_err!(node.run(&ctx, &SharedStore::new()).await);
    assert!(matches!(err, FlowError::DeadlineExceeded));
}

#[tokio::test]
async fn test_fallback_closure_recovers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = SharedStore::new();
    let node = Node::new(
        counting_failure(&calls)
            .with_retries(1)
            .with_fallback(|_ctx, _prep, error| async move {
                assert_eq!(error.to_string(), "service unavailable");
                Ok(())
            })
            .with_post(|_ctx, store, _, _| async move {
                store.set("recovered", true);
                Ok(Action::from("fallback_used"))
            }),
    );

    let action = assert_ok!(node.run(&ExecutionContext::new(), &store).await);
    assert_eq!(action.name(), "fallback_used");
    assert_eq!(store.get("recovered"), Some(json!(true)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_backend_fallback_only_after_retries() {
    let store = SharedStore::new();

    let recovers = Node::new(FlakyBackend {
        failures: 2,
        retries: 2,
        calls: AtomicUsize::new(0),
    });
    assert_ok!(recovers.run(&ExecutionContext::new(), &store).await);
    assert_eq!(store.get("flaky"), Some(json!("ok on attempt 3")));

    let falls_back = Node::new(FlakyBackend {
        failures: 5,
        retries: 1,
        calls: AtomicUsize::new(0),
    });
    let action = assert_ok!(falls_back.run(&ExecutionContext::new(), &store).await);
    assert_eq!(action.name(), "flaky_done");
    assert_eq!(store.get("flaky"), Some(json!("recovered from failure 2")));
    assert_eq!(falls_back.backend().calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_prep_error_skips_exec_and_post() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let store = SharedStore::new();

    let node = Node::new(
        FunctionNode::with_prep(
            "NeedsInput",
            |_ctx, store: SharedStore| async move { Ok(store.require::<String>("missing")?) },
            move |_ctx, _input: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .with_post(|_ctx, store, _, _| async move {
            store.set("posted", true);
            Ok(Action::default())
        }),
    );

    let err = assert_err!(node.run(&ExecutionContext::new(), &store).await);
    assert!(matches!(err, FlowError::Prep(_)));
    assert!(err.to_string().contains("Key not found: missing"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!store.contains_key("posted"));
}

#[tokio::test]
async fn test_post_error_keeps_earlier_writes() {
    let store = SharedStore::new();
    let node = Node::new(
        FunctionNode::new("PartialPost", |_ctx, _| async { Ok("value") }).with_post(
            |_ctx, store, _, value| async move {
                store.set("written_before_failure", value);
                Err::<Action, BoxError>("could not decide".into())
            },
        ),
    );

    let err = assert_err!(node.run(&ExecutionContext::new(), &store).await);
    assert!(matches!(err, FlowError::Post(_)));
    assert_eq!(store.get("written_before_failure"), Some(json!("value")));
}

#[test]
fn test_node_identity() {
    let node = Node::with_id("fixed", FunctionNode::new("Named", |_ctx, _| async { Ok(()) }));
    assert_eq!(node.id().as_str(), "fixed");
    assert_eq!(node.name(), "Named");

    let a = Node::new(FunctionNode::new("A", |_ctx, _| async { Ok(()) }));
    let b = Node::new(FunctionNode::new("A", |_ctx, _| async { Ok(()) }));
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn test_failed_exec_skips_post_and_preps_once() {
    let preps = Arc::new(AtomicUsize::new(0));
    let execs = Arc::new(AtomicUsize::new(0));
    let store = SharedStore::new();
    store.set("input", "payload");

    let node = {
        let preps = Arc::clone(&preps);
        let execs = Arc::clone(&execs);
        Node::new(
            FunctionNode::with_prep(
                "AlwaysFailsWithPrep",
                move |_ctx, store: SharedStore| {
                    preps.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(store.require::<String>("input")?) }
                },
                move |_ctx, _input: String| {
                    execs.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), BoxError>("still down".into()) }
                },
            )
            .with_post(|_ctx, store, _, _| async move {
                store.set("posted", true);
                Ok(Action::default())
            })
            .with_retries(3),
        )
    };

    let err = assert_err!(node.run(&ExecutionContext::new(), &store).await);
    assert!(matches!(err, FlowError::Exec { attempts: 4, .. }));
    assert_eq!(preps.load(Ordering::SeqCst), 1);
    assert_eq!(execs.load(Ordering::SeqCst), 4);
    assert!(!store.contains_key("posted"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_slow_fallback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = SharedStore::new();
    let node = Node::new(
        counting_failure(&calls)
            .with_fallback(|_ctx, _prep, _error| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .with_post(|_ctx, store, _, _| async move {
                store.set("posted", true);
                Ok(Action::default())
            }),
    );

    let ctx = ExecutionContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let start = tokio::time::Instant::now();
    let err = assert_err!(node.run(&ctx, &store).await);
    assert!(matches!(err, FlowError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!store.contains_key("posted"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_interrupts_slow_fallback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = Node::new(counting_failure(&calls).with_fallback(
        |_ctx, _prep, error| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(error)
        },
    ));

    let ctx = ExecutionContext::new().with_timeout(Duration::from_millis(50));
    let err = assert_err!(node.run(&ctx, &SharedStore::new()).await);
    assert!(matches!(err, FlowError::DeadlineExceeded));
}

#[tokio::test(start_paused = true)]
async fn test_huge_retry_delay_is_still_cancellable() {
    let calls = Arc::new(AtomicUsize::new(0));
    let node = Node::new(
        counting_failure(&calls)
            .with_retries(1)
            .with_retry_delay(Duration::MAX),
    );

    let ctx = ExecutionContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let err = assert_err!(node.run(&ctx, &SharedStore::new()).await);
    assert!(matches!(err, FlowError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

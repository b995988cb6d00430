//! 🤖 flowgraph-rs agent demo
//!
//! Three small flows built from mock node bodies:
//! - `qa`: read a question, answer it
//! - `agent`: analyze → search → analyze → process → answer, a cycle that
//!   leaves once search results are in the store
//! - `batch`: load items, process them concurrently, aggregate the results
//!
//! Run with `cargo run --example agent_flow -- agent "What is Rust?"`.
//! `RUST_LOG=flowgraph_rs=debug` shows every phase and routing decision.
//! Ctrl-C cancels the running flow.

use flowgraph_rs::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_QUESTION: &str = "What is the capital of France?";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "qa".to_string());
    let question = args.next().unwrap_or_else(|| DEFAULT_QUESTION.to_string());

    let store = SharedStore::new();
    let flow = match mode.as_str() {
        "qa" => {
            println!("🤖 Starting Q&A Flow...");
            store.set("user_input", question);
            create_qa_flow()
        }
        "agent" => {
            println!("🤖 Starting Agent Flow...");
            store.set("question", question);
            create_agent_flow()
        }
        "batch" => {
            println!("🤖 Starting Batch Processing Flow...");
            create_batch_flow()
        }
        other => {
            return Err(format!("Unknown mode: {other}. Use 'qa', 'agent', or 'batch'").into());
        }
    };

    let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(30));
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    println!("🚀 Running flow...");
    let result = flow.run(&ctx, &store).await?;
    println!(
        "   {} step(s), final action '{}'",
        result.steps_executed, result.final_action
    );

    match mode.as_str() {
        "batch" => {
            if let Some(results) = store.get("final_results") {
                println!("\n✅ Batch Processing Complete:");
                println!("{}", results.as_str().unwrap_or_default());
            }
        }
        _ => {
            if let Some(answer) = store.get("answer") {
                println!("\n✅ Answer:");
                println!("{}", answer.as_str().unwrap_or_default());
            }
        }
    }

    println!("\n🎉 Flow completed successfully!");
    Ok(())
}

// ============================================================================
// Q&A
// ============================================================================

fn create_qa_flow() -> Flow {
    let get_question = get_question_node();
    let answer = answer_node();

    let mut flow = Flow::with_config(
        get_question.clone(),
        FlowConfig {
            name: "qa".to_string(),
            ..FlowConfig::default()
        },
    );
    flow.connect(&get_question, DEFAULT_ACTION, &answer);
    flow
}

fn get_question_node() -> NodeRef {
    Node::new(
        FunctionNode::with_prep(
            "GetQuestion",
            |_ctx, store: SharedStore| async move {
                Ok(store
                    .get_deserializable::<String>("user_input")?
                    .unwrap_or_else(|| DEFAULT_QUESTION.to_string()))
            },
            |_ctx, input: String| async move { Ok(input.trim().to_string()) },
        )
        .with_post(|_ctx, store, _, question: String| async move {
            store.set("question", question);
            Ok(Action::default())
        }),
    )
    .shared()
}

fn answer_node() -> NodeRef {
    Node::new(
        FunctionNode::with_prep(
            "Answer",
            |_ctx, store: SharedStore| async move {
                let question = store.require::<String>("question")?;
                let context = store.get_deserializable::<String>("context")?;
                Ok((question, context))
            },
            |_ctx, (question, context): (String, Option<String>)| async move {
                // Stand-in for a model call.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(match context {
                    Some(context) => format!("Answer to '{question}' using: {context}"),
                    None => format!("This is a placeholder answer for: {question}"),
                })
            },
        )
        .with_post(|_ctx, store, _, answer: String| async move {
            store.set("answer", answer);
            Ok(Action::default())
        })
        .with_retries(3)
        .with_retry_delay(Duration::from_millis(200))
        .with_backoff(2.0),
    )
    .shared()
}

// ============================================================================
// Agent
// ============================================================================

fn create_agent_flow() -> Flow {
    let analyze = analyze_node();
    let search = search_node();
    let process = process_node();
    let answer = answer_node();

    FlowBuilder::new(&analyze)
        .name("agent")
        .max_hops(20)
        .route(&analyze, "search", &search)
        .route(&analyze, "process", &process)
        .route(&analyze, "answer", &answer)
        .route(&search, "analyze", &analyze)
        .route(&search, "process", &process)
        .route(&process, DEFAULT_ACTION, &answer)
        .build()
}

fn analyze_node() -> NodeRef {
    Node::new(
        FunctionNode::with_prep(
            "Analyze",
            |_ctx, store: SharedStore| async move {
                store.require::<String>("question")?;
                Ok(store.contains_key("search_results"))
            },
            |_ctx, has_results: bool| async move {
                Ok(if has_results { "process" } else { "search" })
            },
        )
        .with_post(|_ctx, _store, _, decision: &'static str| async move {
            Ok(Action::from(decision))
        }),
    )
    .shared()
}

fn search_node() -> NodeRef {
    Node::new(
        FunctionNode::with_prep(
            "Search",
            |_ctx, store: SharedStore| async move { Ok(store.require::<String>("question")?) },
            |_ctx, question: String| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(format!("Mock search results for: {question}"))
            },
        )
        .with_post(|_ctx, store, _, results: String| async move {
            store.set("search_results", results);
            Ok(Action::from("analyze"))
        })
        .with_retries(2)
        .with_retry_delay(Duration::from_millis(250)),
    )
    .shared()
}

fn process_node() -> NodeRef {
    Node::new(
        FunctionNode::with_prep(
            "Process",
            |_ctx, store: SharedStore| async move {
                Ok(store.require::<String>("search_results")?)
            },
            |_ctx, results: String| async move {
                Ok(format!("Processed information from {} bytes of search results", results.len()))
            },
        )
        .with_post(|_ctx, store, _, processed: String| async move {
            store.set("context", processed);
            Ok(Action::default())
        }),
    )
    .shared()
}

// ============================================================================
// Batch
// ============================================================================

fn create_batch_flow() -> Flow {
    let load = load_items_node();
    let process = Node::new(
        BatchNode::new(
            "BatchProcess",
            |_ctx, item: String| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(format!("Processed: {item}"))
            },
            true,
        )
        .with_max_concurrency(3),
    )
    .shared();
    let aggregate = aggregate_results_node();

    FlowBuilder::new(&load)
        .name("batch")
        .route(&load, DEFAULT_ACTION, &process)
        .route(&process, DEFAULT_ACTION, &aggregate)
        .build()
}

fn load_items_node() -> NodeRef {
    Node::new(
        FunctionNode::new("LoadItems", |_ctx, _| async {
            Ok((1..=5).map(|i| format!("Item {i}")).collect::<Vec<_>>())
        })
        .with_post(|_ctx, store, _, items: Vec<String>| async move {
            store.set_serializable(KEY_ITEMS, &items)?;
            Ok(Action::default())
        }),
    )
    .shared()
}

fn aggregate_results_node() -> NodeRef {
    Node::new(
        FunctionNode::with_prep(
            "AggregateResults",
            |_ctx, store: SharedStore| async move {
                Ok(store.require::<Vec<String>>(KEY_RESULTS)?)
            },
            |_ctx, results: Vec<String>| async move {
                let mut aggregated = String::from("Aggregated Results:\n");
                for (i, result) in results.iter().enumerate() {
                    aggregated.push_str(&format!("{}. {}\n", i + 1, result));
                }
                Ok(aggregated)
            },
        )
        .with_post(|_ctx, store, _, aggregated: String| async move {
            store.set("final_results", aggregated);
            Ok(Action::default())
        }),
    )
    .shared()
}

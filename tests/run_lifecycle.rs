//! Dispatch modes, cancellation, pause/resume and timeouts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use uar_orchestrator::uar::domain::runs::{OwnerType, RunRecord, RunStatus};
use uar_orchestrator::uar::domain::steps::{StepInput, StepOutput};
use uar_orchestrator::uar::persistence::providers::memory::MemoryRunStore;
use uar_orchestrator::uar::runtime::cancellation::CancellationRegistry;
use uar_orchestrator::uar::runtime::engine::{Step, StepContext, StepExecutor, Workflow};
use uar_orchestrator::uar::runtime::manager::{
    DispatchMode, DispatchRequest, Dispatched, RunManager, RuntimeSettings,
};

/// Works until cancelled, checking in every few milliseconds.
#[derive(Debug)]
struct Spinner;

#[async_trait]
impl StepExecutor for Spinner {
    async fn execute(&self, _input: StepInput, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        loop {
            ctx.checkpoint().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn manager() -> RunManager {
    let manager = RunManager::new(
        CancellationRegistry::in_memory(),
        Some(Arc::new(MemoryRunStore::new())),
        RuntimeSettings {
            default_timeout: None,
            pause_poll: Duration::from_millis(10),
            event_channel_capacity: 16,
            event_retention: None,
        },
    );
    manager.register_workflow(Workflow::new(
        "spin",
        vec![
            Step::function("part", |_input: StepInput| async move {
                Ok(StepOutput::new("partial"))
            }),
            Step::executor("spin", Arc::new(Spinner)),
        ],
    ));
    manager
}

async fn wait_for(manager: &RunManager, run_id: &str, check: impl Fn(&RunRecord) -> bool) -> RunRecord {
    for _ in 0..500 {
        if let Some(record) = manager.get_run(run_id).await.unwrap()
            && check(&record)
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached the expected state");
}

async fn wait_for_event(manager: &RunManager, run_id: &str, event_type: &str) {
    for _ in 0..500 {
        let seen = manager.events().snapshot(run_id).is_some_and(|s| {
            s.events.iter().any(|e| e.kind.event_type() == event_type)
        });
        if seen {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never emitted {event_type}");
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_partial_content() {
    let manager = manager();
    let runner = manager.clone();
    let task = tokio::spawn(async move {
        runner
            .dispatch(DispatchRequest::new(OwnerType::Workflow, "spin", "go").run_id("c1"))
            .await
    });

    wait_for(&manager, "c1", |r| r.status == RunStatus::Running).await;
    assert!(manager.cancel("c1").await.unwrap());

    let Dispatched::Completed(record) = task.await.unwrap().unwrap() else {
        panic!("sync dispatch returns the record");
    };
    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(record.content.as_deref(), Some("partial"));
    assert_eq!(record.step_outputs.len(), 2);
    assert!(!record.step_outputs[1].success);

    // Terminal now; a second cancel changes nothing.
    assert!(!manager.cancel("c1").await.unwrap());
    let active = manager.cancellation().get_active_runs().await.unwrap();
    assert!(!active.contains_key("c1"));
}

#[tokio::test]
async fn test_sync_run_settles_after_caller_gives_up() {
    let manager = manager();
    manager.register_workflow(Workflow::new(
        "slow",
        vec![Step::function("nap", |_input: StepInput| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(StepOutput::new("rested"))
        })],
    ));

    let request = DispatchRequest::new(OwnerType::Workflow, "slow", "x").run_id("gone-caller");
    let abandoned = tokio::time::timeout(Duration::from_millis(20), manager.dispatch(request)).await;
    assert!(abandoned.is_err());

    let record = wait_for(&manager, "gone-caller", |r| r.status.is_terminal()).await;
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.content.as_deref(), Some("rested"));
    assert!(manager.active_runs().await.is_empty());
    let flags = manager.cancellation().get_active_runs().await.unwrap();
    assert!(!flags.contains_key("gone-caller"));
}

#[tokio::test]
async fn test_cancel_before_start_wins() {
    let manager = manager();
    assert!(!manager.cancel("early").await.unwrap());

    let request = DispatchRequest::new(OwnerType::Workflow, "spin", "go").run_id("early");
    let Dispatched::Completed(record) = manager.dispatch(request).await.unwrap() else {
        panic!("sync dispatch returns the record");
    };
    assert_eq!(record.status, RunStatus::Cancelled);
    assert!(record.step_outputs.is_empty());
}

#[tokio::test]
async fn test_stream_ends_after_single_terminal_event() {
    let manager = manager();
    manager.register_workflow(Workflow::new(
        "quick",
        vec![Step::function("only", |input: StepInput| async move {
            Ok(StepOutput::new(input.input))
        })],
    ));

    let request = DispatchRequest::new(OwnerType::Workflow, "quick", "hi")
        .mode(DispatchMode::Stream)
        .run_id("s1");
    let Dispatched::Stream(stream) = manager.dispatch(request).await.unwrap() else {
        panic!("expected a stream");
    };
    let events: Vec<_> = stream.collect().await;

    let indices: Vec<u64> = events.iter().map(|e| e.event_index).collect();
    assert_eq!(indices, (0..events.len() as u64).collect::<Vec<_>>());
    assert_eq!(events.iter().filter(|e| e.kind.is_terminal()).count(), 1);
    assert_eq!(events.last().unwrap().kind.event_type(), "run_completed");
    assert_eq!(events[0].kind.event_type(), "run_started");
}

#[tokio::test]
async fn test_dropping_stream_cancels_run() {
    let manager = manager();
    let request = DispatchRequest::new(OwnerType::Workflow, "spin", "go")
        .mode(DispatchMode::Stream)
        .run_id("d1");
    let Dispatched::Stream(mut stream) = manager.dispatch(request).await.unwrap() else {
        panic!("expected a stream");
    };
    let first = stream.next().await.unwrap();
    assert_eq!(first.kind.event_type(), "run_started");
    drop(stream);

    let record = wait_for(&manager, "d1", |r| r.status.is_terminal()).await;
    assert_eq!(record.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_background_is_persisted_before_returning() {
    let manager = manager();
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    manager.register_workflow(Workflow::new(
        "held",
        vec![Step::function("wait", move |_input: StepInput| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(StepOutput::new("released"))
            }
        })],
    ));

    let request = DispatchRequest::new(OwnerType::Workflow, "held", "x")
        .mode(DispatchMode::Background)
        .run_id("b1");
    let Dispatched::Background(handle) = manager.dispatch(request).await.unwrap() else {
        panic!("expected a handle");
    };
    assert_eq!(handle.status, RunStatus::Pending);
    assert!(manager.get_run("b1").await.unwrap().is_some());

    wait_for(&manager, "b1", |r| r.status == RunStatus::Running).await;
    release.notify_one();
    let record = wait_for(&manager, "b1", |r| r.status.is_terminal()).await;
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.content.as_deref(), Some("released"));
}

#[tokio::test]
async fn test_pause_holds_until_resumed() {
    let manager = manager();
    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    manager.register_workflow(Workflow::new(
        "review",
        vec![
            Step::function("draft", move |_input: StepInput| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(StepOutput::new("draft"))
                }
            }),
            Step::function("publish", |input: StepInput| async move {
                Ok(StepOutput::new(format!("published {}", input.latest_content())))
            }),
        ],
    ));

    let runner = manager.clone();
    let task = tokio::spawn(async move {
        runner
            .dispatch(DispatchRequest::new(OwnerType::Workflow, "review", "x").run_id("p1"))
            .await
    });
    wait_for(&manager, "p1", |r| r.status == RunStatus::Running).await;

    let paused = manager.pause("p1").await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    release.notify_one();

    // The draft finishes, but publish waits behind the gate.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = manager.events().snapshot("p1").unwrap();
    let started: Vec<_> = snapshot
        .events
        .iter()
        .filter(|e| e.kind.event_type() == "step_started")
        .collect();
    assert_eq!(started.len(), 1);
    assert!(!task.is_finished());

    manager.resume("p1").await.unwrap();
    let Dispatched::Completed(record) = task.await.unwrap().unwrap() else {
        panic!("sync dispatch returns the record");
    };
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.content.as_deref(), Some("published draft"));

    let kinds: Vec<&str> = manager
        .events()
        .snapshot("p1")
        .unwrap()
        .events
        .iter()
        .map(|e| e.kind.event_type())
        .collect();
    assert!(kinds.contains(&"run_paused"));
    assert!(kinds.contains(&"run_resumed"));
}

#[tokio::test]
async fn test_pause_rejected_for_finished_run() {
    let manager = manager();
    manager.cancel("gone").await.unwrap();
    manager
        .dispatch(DispatchRequest::new(OwnerType::Workflow, "spin", "go").run_id("gone"))
        .await
        .unwrap();
    assert!(manager.pause("gone").await.is_err());
    assert!(manager.pause("never-existed").await.is_err());
}

#[tokio::test]
async fn test_timeout_ends_in_error() {
    let manager = manager();
    let request = DispatchRequest::new(OwnerType::Workflow, "spin", "go")
        .run_id("t1")
        .timeout(Duration::from_millis(50));
    let Dispatched::Completed(record) = manager.dispatch(request).await.unwrap() else {
        panic!("sync dispatch returns the record");
    };
    assert_eq!(record.status, RunStatus::Error);
    assert!(record.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(record.content.as_deref(), Some("partial"));
}

#[tokio::test]
async fn test_tools_report_around_each_call() {
    #[derive(Debug)]
    struct Lookup;

    #[async_trait]
    impl uar_orchestrator::uar::runtime::engine::Tool for Lookup {
        fn name(&self) -> &str {
            "lookup"
        }

        async fn call(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "found": input }))
        }
    }

    #[derive(Debug)]
    struct Researcher;

    #[async_trait]
    impl StepExecutor for Researcher {
        async fn execute(&self, input: StepInput, ctx: &StepContext) -> anyhow::Result<StepOutput> {
            let result = ctx.call_tool(&Lookup, serde_json::json!(input.input)).await?;
            Ok(StepOutput::new(result.to_string()))
        }
    }

    let manager = manager();
    manager.register_workflow(Workflow::new(
        "research",
        vec![Step::executor("research", Arc::new(Researcher))],
    ));
    manager
        .dispatch(DispatchRequest::new(OwnerType::Workflow, "research", "rust").run_id("tool1"))
        .await
        .unwrap();
    wait_for_event(&manager, "tool1", "tool_completed").await;

    let kinds: Vec<&str> = manager
        .events()
        .snapshot("tool1")
        .unwrap()
        .events
        .iter()
        .map(|e| e.kind.event_type())
        .collect();
    let started = kinds.iter().position(|k| *k == "tool_started").unwrap();
    let completed = kinds.iter().position(|k| *k == "tool_completed").unwrap();
    assert!(started < completed);
}

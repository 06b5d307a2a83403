mod common;

use std::sync::Arc;

use serde_json::json;

use common::Harness;
use plexus_core::config::AppConfig;
use plexus_core::plan::{AdviserType, SkipType};
use plexus_core::step::{ChainLink, ResponseData, TaskRequest, TaskResponse};
use plexus_core::types::{ExecutionMode, FailureInfo, FailureType, Status};
use plexus_engine::EngineBuilder;
use plexus_test_utils::{plan_node, PlanBuilder, RecordingDispatcher, ScriptedStep};

#[tokio::test]
async fn sync_nodes_run_in_sequence() {
    let step = Arc::new(ScriptedStep::sync("noop"));
    let h = Harness::new(EngineBuilder::new().with_step(step.clone()));
    let plan = PlanBuilder::new("seq")
        .step_then("a", "noop", "b")
        .step_then("b", "noop", "c")
        .step("c", "noop", ExecutionMode::Sync)
        .build();

    let (pe, status) = h.run(plan).await;
    assert_eq!(status, Status::Succeeded);
    assert_eq!(step.starts(), 3);

    let a = h.current(&pe, "a").await.unwrap();
    let b = h.current(&pe, "b").await.unwrap();
    let c = h.current(&pe, "c").await.unwrap();
    assert_eq!(a.next_id.as_deref(), Some(b.uuid.as_str()));
    assert_eq!(b.previous_id.as_deref(), Some(a.uuid.as_str()));
    assert_eq!(c.previous_id.as_deref(), Some(b.uuid.as_str()));
    for node in [&a, &b, &c] {
        assert_eq!(node.status, Status::Succeeded);
        assert_eq!(node.ambiance.levels.len(), 1);
    }

    let plan_execution = h.engine.plan_execution(&pe).await.unwrap().unwrap();
    assert_eq!(plan_execution.status, Status::Succeeded);
    assert!(plan_execution.end_ts.is_some());
}

#[tokio::test]
async fn children_with_one_unretried_failure_fail_the_parent() {
    let fork = Arc::new(ScriptedStep::children("fork", &["ok", "bad"]));
    let bad = Arc::new(
        ScriptedStep::sync("bad-step")
            .always_failing(FailureInfo::new("exit 1", FailureType::ApplicationError)),
    );
    let h = Harness::new(
        EngineBuilder::new()
            .with_step(fork.clone())
            .with_step(Arc::new(ScriptedStep::sync("ok-step")))
            .with_step(bad.clone()),
    );
    let plan = PlanBuilder::new("fan-out")
        .step("fork", "fork", ExecutionMode::Children)
        .step("ok", "ok-step", ExecutionMode::Sync)
        .node(plan_node("bad", "bad-step", ExecutionMode::Sync).with_adviser(
            AdviserType::Retry,
            json!({
                "retry_count": 3,
                "wait_interval_list": [0],
                "applicable_failure_types": ["TIMEOUT_ERROR"]
            }),
        ))
        .build();

    let (pe, status) = h.run(plan).await;
    assert_eq!(status, Status::Failed);

    // Both child payloads reach the parent in one resume.
    let resumes = fork.resumes();
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].len(), 2);
    let mut statuses: Vec<Status> = resumes[0]
        .values()
        .map(|r| match r {
            ResponseData::Child(child) => child.status,
            other => panic!("unexpected response {other:?}"),
        })
        .collect();
    statuses.sort();
    assert_eq!(statuses, vec![Status::Succeeded, Status::Failed]);

    // The retry adviser did not match APPLICATION_ERROR.
    assert_eq!(bad.starts(), 1);
    assert_eq!(h.attempts(&pe, "bad").await.len(), 1);
    let parent = h.current(&pe, "fork").await.unwrap();
    assert_eq!(parent.status, Status::Failed);

    let bad_node = h.current(&pe, "bad").await.unwrap();
    assert_eq!(bad_node.parent_id.as_deref(), Some(parent.uuid.as_str()));
    assert_eq!(bad_node.ambiance.levels.len(), 2);
    assert_eq!(bad_node.ambiance.levels[0].runtime_id, parent.uuid);
}

#[tokio::test]
async fn async_node_resumes_once_every_callback_arrived() {
    let step = Arc::new(ScriptedStep::asynchronous(
        "approval",
        vec!["cb-1".into(), "cb-2".into()],
    ));
    let h = Harness::new(EngineBuilder::new().with_step(step.clone()));
    let plan = PlanBuilder::new("async")
        .step("wait", "approval", ExecutionMode::Async)
        .build();

    // A response that arrives before the node suspends is buffered.
    h.engine.notify("cb-1", ResponseData::Callback(json!({"ok": true}))).await;
    let pe = h.start(plan).await;
    let waiting = h.wait_for(&pe, "wait", Status::AsyncWaiting).await;
    assert_eq!(h.engine.pending_callbacks(&waiting.uuid).await, vec!["cb-2".to_string()]);

    h.engine.notify("cb-2", ResponseData::Callback(json!({"ok": true}))).await;
    assert_eq!(h.finish(&pe).await, Status::Succeeded);

    let resumes = step.resumes();
    assert_eq!(resumes.len(), 1);
    assert!(resumes[0].contains_key("cb-1"));
    assert!(resumes[0].contains_key("cb-2"));
}

#[tokio::test]
async fn task_result_completes_the_node() {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let request = TaskRequest::new("shell", json!({"script": "make"}));
    let h = Harness::new(
        EngineBuilder::new()
            .with_dispatcher(dispatcher.clone())
            .with_step(Arc::new(ScriptedStep::task("build", request))),
    );
    let plan = PlanBuilder::new("task")
        .step("build", "build", ExecutionMode::TaskV2)
        .build();

    let pe = h.start(plan).await;
    let waiting = h.wait_for(&pe, "build", Status::TaskWaiting).await;
    let (task_id, sent) = dispatcher.submitted()[0].clone();
    assert_eq!(sent.callback_token, waiting.uuid);

    h.engine
        .notify(
            &task_id,
            ResponseData::Task(TaskResponse {
                task_id: task_id.clone(),
                status: Status::Succeeded,
                payload: json!({"exit_code": 0}),
                failure_info: None,
            }),
        )
        .await;
    assert_eq!(h.finish(&pe).await, Status::Succeeded);
}

#[tokio::test]
async fn failed_task_fails_the_plan() {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let h = Harness::new(
        EngineBuilder::new()
            .with_dispatcher(dispatcher.clone())
            .with_step(Arc::new(ScriptedStep::task(
                "build",
                TaskRequest::new("shell", json!({})),
            ))),
    );
    let plan = PlanBuilder::new("task")
        .step("build", "build", ExecutionMode::Task)
        .build();

    let pe = h.start(plan).await;
    h.wait_for(&pe, "build", Status::TaskWaiting).await;
    let task_id = dispatcher.last_task_id().unwrap();
    h.engine
        .notify(
            &task_id,
            ResponseData::Task(TaskResponse {
                task_id: task_id.clone(),
                status: Status::Failed,
                payload: json!(null),
                failure_info: Some(FailureInfo::new("exit 2", FailureType::ApplicationError)),
            }),
        )
        .await;
    assert_eq!(h.finish(&pe).await, Status::Failed);
    let node = h.current(&pe, "build").await.unwrap();
    assert_eq!(node.failure_info.unwrap().error_message, "exit 2");
}

#[tokio::test]
async fn child_chain_runs_links_one_after_another() {
    let chain = Arc::new(ScriptedStep::chain(
        "pipeline",
        vec![ChainLink::child("first"), ChainLink::child("second").last()],
    ));
    let h = Harness::new(
        EngineBuilder::new()
            .with_step(chain.clone())
            .with_step(Arc::new(ScriptedStep::sync("noop"))),
    );
    let plan = PlanBuilder::new("chain")
        .step("pipeline", "pipeline", ExecutionMode::ChildChain)
        .step("first", "noop", ExecutionMode::Sync)
        .step("second", "noop", ExecutionMode::Sync)
        .build();

    let (pe, status) = h.run(plan).await;
    assert_eq!(status, Status::Succeeded);

    let first = h.current(&pe, "first").await.unwrap();
    let second = h.current(&pe, "second").await.unwrap();
    assert!(first.end_ts.unwrap() <= second.created_at);

    // One resume per finished link; each sees every child so far.
    let resumes = chain.resumes();
    assert_eq!(resumes.len(), 2);
    assert_eq!(resumes[0].len(), 1);
    assert_eq!(resumes[1].len(), 2);
    assert!(resumes[1].contains_key(&first.uuid));
    assert!(resumes[1].contains_key(&second.uuid));
}

#[tokio::test]
async fn suspended_chain_link_waits_for_its_callback() {
    let chain = Arc::new(ScriptedStep::chain(
        "gated",
        vec![ChainLink::child("deploy").suspended()],
    ));
    let h = Harness::new(
        EngineBuilder::new()
            .with_step(chain.clone())
            .with_step(Arc::new(ScriptedStep::sync("noop"))),
    );
    let plan = PlanBuilder::new("gate")
        .step("gated", "gated", ExecutionMode::ChildChain)
        .step("deploy", "noop", ExecutionMode::Sync)
        .build();

    let pe = h.start(plan).await;
    let waiting = h.wait_for(&pe, "gated", Status::AsyncWaiting).await;
    assert!(h.current(&pe, "deploy").await.is_none());

    let callbacks = h.engine.pending_callbacks(&waiting.uuid).await;
    assert_eq!(callbacks.len(), 1);
    h.engine
        .notify(&callbacks[0], ResponseData::Callback(json!("approved")))
        .await;

    assert_eq!(h.finish(&pe).await, Status::Succeeded);
    assert_eq!(h.current(&pe, "deploy").await.unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn task_chain_dispatches_each_link_after_the_previous_result() {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let chain = Arc::new(ScriptedStep::chain(
        "rollout",
        vec![
            ChainLink::task(TaskRequest::new("canary", json!({}))),
            ChainLink::task(TaskRequest::new("full", json!({}))).last(),
        ],
    ));
    let h = Harness::new(
        EngineBuilder::new()
            .with_dispatcher(dispatcher.clone())
            .with_step(chain.clone()),
    );
    let plan = PlanBuilder::new("rollout")
        .step("rollout", "rollout", ExecutionMode::TaskChainV2)
        .build();

    let pe = h.start(plan).await;
    for expected in 1..=2 {
        h.wait_for(&pe, "rollout", Status::TaskWaiting).await;
        let submitted = dispatcher.submitted();
        assert_eq!(submitted.len(), expected);
        let (task_id, _) = submitted[expected - 1].clone();
        h.engine
            .notify(
                &task_id,
                ResponseData::Task(TaskResponse {
                    task_id: task_id.clone(),
                    status: Status::Succeeded,
                    payload: json!({}),
                    failure_info: None,
                }),
            )
            .await;
        if expected == 1 {
            // Wait for the second link to go out before looping.
            let poll = async {
                while dispatcher.submitted().len() < 2 {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            };
            tokio::time::timeout(std::time::Duration::from_secs(5), poll)
                .await
                .unwrap();
        }
    }

    assert_eq!(h.finish(&pe).await, Status::Succeeded);
    let kinds: Vec<String> = dispatcher
        .submitted()
        .into_iter()
        .map(|(_, r)| r.task_type)
        .collect();
    assert_eq!(kinds, vec!["canary".to_string(), "full".to_string()]);
}

#[tokio::test]
async fn unknown_execution_mode_errors_the_node() {
    let h = Harness::new(EngineBuilder::new().with_step(Arc::new(ScriptedStep::sync("remote"))));
    let plan = PlanBuilder::new("no-dispatcher")
        .step("remote", "remote", ExecutionMode::Task)
        .build();

    let (pe, status) = h.run(plan).await;
    assert_eq!(status, Status::Errored);
    let node = h.current(&pe, "remote").await.unwrap();
    assert_eq!(node.status, Status::Errored);
    assert!(node.failure_info.unwrap().error_message.contains("Task"));
}

#[tokio::test]
async fn unregistered_step_errors_the_node() {
    let h = Harness::new(EngineBuilder::new());
    let plan = PlanBuilder::new("missing")
        .step("ghost", "ghost", ExecutionMode::Sync)
        .build();
    let (_, status) = h.run(plan).await;
    assert_eq!(status, Status::Errored);
}

#[tokio::test]
async fn skipped_vertices_are_elided_from_the_graph() {
    let h = Harness::new(EngineBuilder::new().with_step(Arc::new(ScriptedStep::sync("noop"))));
    let plan = PlanBuilder::new("skip")
        .step_then("a", "noop", "b")
        .node(
            plan_node("b", "noop", ExecutionMode::Sync)
                .with_skip_type(SkipType::SkipNode)
                .with_adviser(AdviserType::OnSuccess, json!({"next_node_id": "c"})),
        )
        .step("c", "noop", ExecutionMode::Sync)
        .build();

    let (pe, status) = h.run(plan).await;
    assert_eq!(status, Status::Succeeded);

    let a = h.current(&pe, "a").await.unwrap();
    let b = h.current(&pe, "b").await.unwrap();
    let c = h.current(&pe, "c").await.unwrap();
    let graph = h.engine.graph(&pe).unwrap();
    assert_eq!(graph.root_ids, vec![a.uuid.clone()]);
    assert_eq!(graph.edges(&a.uuid).unwrap().next_ids, vec![c.uuid.clone()]);
    assert_eq!(graph.edges(&c.uuid).unwrap().prev_ids, vec![a.uuid.clone()]);
    assert!(graph.vertex(&b.uuid).is_none());
    assert!(!graph.references(&b.uuid));
    assert_eq!(graph.vertex(&c.uuid).unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn finished_plan_executions_are_released() {
    let mut config = AppConfig::default();
    config.engine.retained_graphs = 3;
    let h = Harness::new(
        EngineBuilder::new()
            .with_config(config)
            .with_step(Arc::new(ScriptedStep::sync("noop"))),
    );

    let mut finished = Vec::new();
    for i in 0..50 {
        let plan = PlanBuilder::new(format!("plan-{i}"))
            .step_then("a", "noop", "b")
            .step("b", "noop", ExecutionMode::Sync)
            .build();
        let (pe, status) = h.run(plan).await;
        assert_eq!(status, Status::Succeeded);
        finished.push(pe);
    }
    h.wait_released().await;
    assert_eq!(h.engine.active_plan_executions(), 0);

    // Only the newest graphs are kept; records stay in the store.
    assert!(h.engine.graph(&finished[0]).is_none());
    let last = h.engine.graph(&finished[49]).unwrap();
    assert_eq!(last.vertices.len(), 2);
    assert_eq!(h.engine.node_executions(&finished[0]).await.unwrap().len(), 2);
}

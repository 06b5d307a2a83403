use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use plexus_core::ambiance::ExecutionMetadata;
use plexus_core::config::{AppConfig, StoreBackend};
use plexus_core::execution::NodeExecution;
use plexus_core::plan::Plan;
use plexus_core::step::{ResponseData, TaskRequest, TaskResponse};
use plexus_core::traits::NodeExecutionStore;
use plexus_core::types::{FailureInfo, FailureType, Status};
use plexus_engine::{EngineBuilder, OrchestrationEngine};
use plexus_store::SqliteStore;
use plexus_test_utils::{setup_abstractions, RecordingDispatcher, ScriptedStep};

const RELEASE_PLAN: &str = r#"{
    "uuid": "release",
    "start_node_id": "stage",
    "nodes": {
        "stage": {
            "uuid": "stage", "identifier": "stage", "name": "Release stage",
            "step_type": {"type": "stage", "category": "STAGE"},
            "group": "STAGE", "mode": "CHILD"
        },
        "build": {
            "uuid": "build", "identifier": "build",
            "step_type": {"type": "compile"}, "mode": "SYNC",
            "advisers": [{"type": "ON_SUCCESS", "parameters": {"next_node_id": "tests"}}]
        },
        "tests": {
            "uuid": "tests", "identifier": "tests",
            "step_type": {"type": "tests"}, "mode": "CHILDREN",
            "advisers": [{"type": "ON_SUCCESS", "parameters": {"next_node_id": "publish"}}]
        },
        "unit": {
            "uuid": "unit", "identifier": "unit",
            "step_type": {"type": "unit"}, "mode": "SYNC",
            "advisers": [{"type": "RETRY", "parameters": {"retry_count": 2, "wait_interval_list": [0]}}]
        },
        "lint": {
            "uuid": "lint", "identifier": "lint",
            "step_type": {"type": "lint"}, "mode": "SYNC"
        },
        "publish": {
            "uuid": "publish", "identifier": "publish",
            "step_type": {"type": "publish"}, "mode": "TASK",
            "step_parameters": {"image": "api:<+outcome.artifact.tag>"}
        }
    }
}"#;

struct Pipeline {
    engine: OrchestrationEngine,
    dispatcher: Arc<RecordingDispatcher>,
    publish: Arc<ScriptedStep>,
    unit: Arc<ScriptedStep>,
    cancel: CancellationToken,
}

fn pipeline(config: AppConfig) -> Pipeline {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let publish = Arc::new(ScriptedStep::task(
        "publish",
        TaskRequest::new("docker-push", json!({})),
    ));
    let unit = Arc::new(ScriptedStep::sync("unit").failing_first(
        1,
        FailureInfo::new("flaky test", FailureType::TimeoutError),
    ));
    let engine = EngineBuilder::new()
        .with_config(config)
        .with_dispatcher(dispatcher.clone())
        .with_step(Arc::new(ScriptedStep::child("stage", "build")))
        .with_step(Arc::new(ScriptedStep::sync("compile").with_group_outcome(
            "artifact",
            json!({"tag": "v7"}),
            "STAGE",
        )))
        .with_step(Arc::new(ScriptedStep::children("tests", &["unit", "lint"])))
        .with_step(unit.clone())
        .with_step(Arc::new(ScriptedStep::sync("lint")))
        .with_step(publish.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    engine.spawn(cancel.clone()).unwrap();
    Pipeline {
        engine,
        dispatcher,
        publish,
        unit,
        cancel,
    }
}

async fn wait_for_status(engine: &OrchestrationEngine, pe: &str, node_id: &str, status: Status) -> NodeExecution {
    let poll = async {
        loop {
            let found = engine
                .node_executions(pe)
                .await
                .unwrap()
                .into_iter()
                .find(|n| n.node_id == node_id && !n.old_retry && n.status == status);
            if let Some(node) = found {
                return node;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("{node_id} never reached {status:?}"))
}

async fn run_release(p: &Pipeline) -> (String, Status) {
    let plan = Plan::from_json(RELEASE_PLAN).unwrap();
    let pe = p
        .engine
        .start_plan(plan, setup_abstractions(), ExecutionMetadata::default())
        .await
        .unwrap();

    wait_for_status(&p.engine, &pe, "publish", Status::TaskWaiting).await;
    let task_id = p.dispatcher.last_task_id().unwrap();
    p.engine
        .notify(
            &task_id,
            ResponseData::Task(TaskResponse {
                task_id: task_id.clone(),
                status: Status::Succeeded,
                payload: json!({"digest": "sha256:abc"}),
                failure_info: None,
            }),
        )
        .await;

    let status = tokio::time::timeout(Duration::from_secs(5), p.engine.await_completion(&pe))
        .await
        .unwrap()
        .unwrap();
    (pe, status)
}

#[tokio::test]
async fn release_pipeline_runs_to_completion() {
    let p = pipeline(AppConfig::default());
    let (pe, status) = run_release(&p).await;
    assert_eq!(status, Status::Succeeded);

    // The flaky unit test was retried once.
    assert_eq!(p.unit.starts(), 2);
    let nodes = p.engine.node_executions(&pe).await.unwrap();
    let units: Vec<_> = nodes.iter().filter(|n| n.node_id == "unit").collect();
    assert_eq!(units.len(), 2);
    assert!(units[0].old_retry);
    assert_eq!(units[1].status, Status::Succeeded);

    // The stage-scoped artifact reached the publish step's parameters.
    assert_eq!(
        p.publish.contexts()[0].step_parameters,
        json!({"image": "api:v7"})
    );
    let (_, request) = &p.dispatcher.submitted()[0];
    assert_eq!(request.task_type, "docker-push");

    let graph = p.engine.graph(&pe).unwrap();
    let stage = nodes.iter().find(|n| n.node_id == "stage").unwrap();
    assert_eq!(graph.root_ids, vec![stage.uuid.clone()]);
    assert_eq!(graph.vertices.len(), 6);
    let build = nodes.iter().find(|n| n.node_id == "build").unwrap();
    assert_eq!(graph.edges(&stage.uuid).unwrap().edges, vec![build.uuid.clone()]);

    p.cancel.cancel();
}

#[tokio::test]
async fn release_pipeline_persists_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("plexus.db");
    let mut config = AppConfig::default();
    config.store.backend = StoreBackend::Sqlite;
    config.store.path = db_path.display().to_string();

    let p = pipeline(config);
    let (pe, status) = run_release(&p).await;
    assert_eq!(status, Status::Succeeded);
    p.cancel.cancel();

    let store = SqliteStore::open(&db_path).unwrap();
    let plan = store.get_plan_execution(&pe).await.unwrap().unwrap();
    assert_eq!(plan.status, Status::Succeeded);
    assert!(plan.end_ts.is_some());

    let nodes = store.find_by_plan_execution(&pe, vec![]).await.unwrap();
    assert_eq!(nodes.len(), 7);
    assert!(nodes
        .iter()
        .filter(|n| !n.old_retry)
        .all(|n| n.status == Status::Succeeded));

    assert_eq!(nodes[0].identifier, "stage");
}

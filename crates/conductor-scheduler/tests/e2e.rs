//! End-to-end scenarios against a live container runtime.
//!
//! These need a Docker/Podman daemon and a base image carrying the
//! `claude-code` worker binary, so they are ignored by default:
//!
//! ```sh
//! CONDUCTOR_E2E_IMAGE=conductor-worker:latest cargo test -p conductor-scheduler -- --ignored
//! ```

use conductor_core::config::{EngineConfig, EnvironmentConfig};
use conductor_core::ids::AgentId;
use conductor_core::message::{AgentMessage, MessageType};
use conductor_core::task::{SubtaskSpec, Task, TaskStatus, TaskType};
use conductor_scheduler::Orchestrator;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn e2e_config(num_agents: usize, max_workers: usize) -> EngineConfig {
    let image = std::env::var("CONDUCTOR_E2E_IMAGE")
        .unwrap_or_else(|_| "conductor-worker:latest".to_string());
    let socket = std::env::temp_dir().join(format!("conductor-e2e-{}.sock", std::process::id()));

    let mut config = EngineConfig::default();
    config.num_agents = num_agents;
    config.min_agents = num_agents;
    config.max_workers = max_workers;
    config.communication.socket_path = socket;
    config.isolated_workspace.workspace_root =
        std::env::temp_dir().join(format!("conductor-e2e-ws-{}", std::process::id()));
    config.isolated_workspace.default_environment = "worker".to_string();
    config.isolated_workspace.environments = vec![EnvironmentConfig {
        name: "worker".to_string(),
        image,
        packages: vec![],
        volumes: HashMap::new(),
    }];
    config
}

async fn started(config: EngineConfig) -> Arc<Orchestrator> {
    let orchestrator = Arc::new(Orchestrator::new(config).expect("orchestrator"));
    orchestrator.start().await.expect("fleet start");
    orchestrator
}

fn generic(description: &str, timeout_secs: u64) -> Task {
    let mut task = Task::new(TaskType::Generic, description);
    task.timeout = Duration::from_secs(timeout_secs);
    task
}

#[tokio::test]
#[ignore = "requires a container runtime and the worker image"]
async fn scenario_single_generic_task() {
    let orchestrator = started(e2e_config(1, 10)).await;

    let result = orchestrator
        .execute_task(generic("echo hello", 10))
        .await
        .expect("execute");

    assert_eq!(result.status, TaskStatus::Success);
    let output = result
        .result
        .get("output")
        .and_then(|v| v.as_str())
        .expect("output field");
    assert!(output.contains("hello"), "output was: {output}");

    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a container runtime and the worker image"]
async fn scenario_priority_ordering() {
    let orchestrator = started(e2e_config(1, 1)).await;

    // Occupy the only agent.
    let blocker = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.execute_task(generic("sleep 3", 30)).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    let submit = |id: &str, priority: u8| {
        let orchestrator = Arc::clone(&orchestrator);
        let mut task = generic("echo ok", 60);
        task.task_id = conductor_core::ids::TaskId::new(id);
        task.priority = priority;
        tokio::spawn(async move { orchestrator.execute_task(task).await })
    };
    let a = submit("A", 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = submit("B", 9);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let c = submit("C", 5);

    let result_a = a.await.unwrap().unwrap();
    let result_b = b.await.unwrap().unwrap();
    let result_c = c.await.unwrap().unwrap();
    blocker.await.unwrap().unwrap();

    // Dispatch order must be B, C, A.
    assert!(result_b.timestamp < result_c.timestamp);
    assert!(result_c.timestamp < result_a.timestamp);

    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a container runtime and the worker image"]
async fn scenario_parallel_fan_out() {
    let orchestrator = started(e2e_config(3, 10)).await;

    let mut task = Task::new(TaskType::Analysis, "split work");
    task.parallel = true;
    task.timeout = Duration::from_secs(30);
    task.subtasks = vec![
        SubtaskSpec {
            task_type: Some(TaskType::Analysis),
            description: "analyze the module layout".into(),
            ..Default::default()
        },
        SubtaskSpec {
            task_type: Some(TaskType::Generic),
            description: "echo reviewing".into(),
            ..Default::default()
        },
        SubtaskSpec {
            task_type: Some(TaskType::Generic),
            description: "echo testing".into(),
            ..Default::default()
        },
    ];

    let started_at = Instant::now();
    let results = orchestrator.execute_parallel_task(task).await.expect("fan out");
    let wall = started_at.elapsed();

    assert_eq!(results.len(), 3);
    let agents: std::collections::HashSet<_> =
        results.iter().map(|r| r.agent_id.clone()).collect();
    assert_eq!(agents.len(), 3, "subtasks must land on distinct agents");

    let slowest = results
        .iter()
        .map(|r| r.execution_time)
        .fold(0.0_f64, f64::max);
    assert!(wall.as_secs_f64() < slowest * 1.5 + 1.0);

    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a container runtime and the worker image"]
async fn scenario_task_timeout() {
    let orchestrator = started(e2e_config(1, 10)).await;

    let started_at = Instant::now();
    let result = orchestrator
        .execute_task(generic("sleep 60", 2))
        .await
        .expect("execute");
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(started_at.elapsed() <= Duration::from_secs(3));

    // The agent frees up shortly after the abort.
    let mut idle = false;
    for _ in 0..25 {
        if orchestrator
            .agent(&AgentId::numbered(0))
            .map(|a| a.is_idle())
            .unwrap_or(false)
        {
            idle = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(idle, "agent did not return to idle");

    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a container runtime and the worker image"]
async fn scenario_agent_crash_mid_task() {
    let orchestrator = started(e2e_config(2, 10)).await;

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.execute_task(generic("sleep 10", 30)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Kill agent_000's container out from under it.
    let status = std::process::Command::new("docker")
        .args(["rm", "-f", "claude-agent-agent_000"])
        .status()
        .expect("docker rm");
    assert!(status.success());

    let result = running.await.unwrap().unwrap();
    assert_ne!(result.status, TaskStatus::Success);
    assert!(result.error.is_some());

    // The fleet keeps serving from the surviving agent.
    let follow_up = orchestrator
        .execute_task(generic("echo still-alive", 15))
        .await
        .expect("follow-up");
    assert_eq!(follow_up.status, TaskStatus::Success);
    assert_eq!(follow_up.agent_id, AgentId::numbered(1));

    orchestrator.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a container runtime and the worker image"]
async fn scenario_peer_to_peer_task() {
    let config = e2e_config(2, 10);
    let socket_path = config.communication.socket_path.clone();
    let orchestrator = started(config).await;

    // A third peer joins the broker and asks agent_001 for work.
    let client = conductor_channel::ChannelClient::connect(
        &socket_path,
        AgentId::new("agent_ext"),
        Duration::from_secs(2),
    )
    .await
    .expect("connect");

    let mut payload = Map::new();
    payload.insert("task_type".to_string(), json!("generic"));
    payload.insert("description".to_string(), json!("echo peer-work"));
    payload.insert("timeout".to_string(), json!(15.0));
    let request = AgentMessage::new(
        AgentId::new("agent_ext"),
        AgentId::numbered(1),
        MessageType::TaskRequest,
        payload,
    );
    let request_id = request.message_id.clone();
    client.send(request).await.expect("send request");

    let response = client
        .receive(Duration::from_secs(30))
        .await
        .expect("task response");
    assert_eq!(response.message_type, MessageType::TaskResponse);
    assert_eq!(response.correlation_id, Some(request_id));
    assert_eq!(response.sender_id, AgentId::numbered(1));
    assert_eq!(
        response.payload.get("status"),
        Some(&json!("success")),
        "payload: {:?}",
        response.payload
    );

    client.close().await;
    orchestrator.shutdown().await;
}

// ABOUTME: End-to-end tests running real `upswarm spawn` workers under a supervisor.
// ABOUTME: Exercises the spawn command line, worker identification, and echo replies.

use std::time::Duration;

use tokio::time::{timeout, Instant};
use upswarm_core::{
    Message, ServiceClient, StatusInfo, Supervisor, SupervisorConfig, SupervisorHandle, Topology,
    WorkerCommand,
};

fn worker_config() -> SupervisorConfig {
    SupervisorConfig {
        port: 0,
        reconcile_initial_delay_ms: 60_000,
        spawn_stagger_ms: 20,
        worker: WorkerCommand {
            program: Some(env!("CARGO_BIN_EXE_upswarm").into()),
            ..WorkerCommand::default()
        },
        ..SupervisorConfig::default()
    }
}

async fn wait_for<F>(handle: &SupervisorHandle, mut done: F) -> StatusInfo
where
    F: FnMut(&StatusInfo) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let status = handle.status().await.unwrap();
        if done(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "condition not reached: {status:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Worker lifecycle
// ============================================================================

#[tokio::test]
async fn test_spawned_echo_workers_identify_and_reply() {
    let supervisor = Supervisor::bind(worker_config()).await.unwrap();
    let addr = supervisor.local_addr().to_string();
    let handle = supervisor.handle();
    let task = tokio::spawn(supervisor.run());

    handle
        .update_topology(Topology::new().with("echo", 2))
        .await
        .unwrap();
    wait_for(&handle, |s| {
        s.processes.get("echo") == Some(&2) && s.connections.get("echo") == Some(&2)
    })
    .await;

    let mut caller = ServiceClient::connect(&addr).await.unwrap();
    let caller_id = caller.identify("caller").await.unwrap();
    wait_for(&handle, |s| s.connections.get("caller") == Some(&1)).await;

    caller
        .send(Message::text("ping").with_receipt("echo"))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(10), caller.recv())
        .await
        .expect("timed out waiting for echo")
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload, Message::text("ping").payload);
    assert_eq!(reply.receipt(), Some(caller_id.as_str()));
    assert!(reply.sender().is_some());

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_kill_service_disconnects_workers() {
    let supervisor = Supervisor::bind(worker_config()).await.unwrap();
    let addr = supervisor.local_addr().to_string();
    let handle = supervisor.handle();
    let task = tokio::spawn(supervisor.run());

    handle.spawn("audit").await.unwrap();
    wait_for(&handle, |s| s.connections.get("audit") == Some(&1)).await;

    let mut admin = ServiceClient::connect(&addr).await.unwrap();
    admin.send(Message::kill_service("audit")).await.unwrap();
    let confirmation = timeout(Duration::from_secs(10), admin.recv())
        .await
        .expect("timed out waiting for confirmation")
        .unwrap()
        .unwrap();
    assert_eq!(confirmation, Message::text("'audit' killed successfully."));

    // The killed worker's connection closes and leaves the registry.
    wait_for(&handle, |s| {
        s.processes.get("audit").is_none() && s.connections.get("audit").is_none()
    })
    .await;

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

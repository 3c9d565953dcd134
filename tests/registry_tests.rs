//! Lifecycle tests for the background process registry against real
//! shell processes.

use anyhow::Result;
use commandeer::{ExecError, ExecutorConfig, ProcessRegistry, ProcessStatus};
use std::collections::HashMap;
use std::time::Duration;

fn registry() -> ProcessRegistry {
    ProcessRegistry::new(&ExecutorConfig::default()).expect("default config is valid")
}

async fn wait_for_status(
    registry: &ProcessRegistry,
    process_id: &str,
    wanted: ProcessStatus,
) -> bool {
    for _ in 0..50 {
        let record = registry.status(process_id).await.expect("known process");
        if record.status == wanted {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn started_process_is_running_then_completes() -> Result<()> {
    let registry = registry();
    let record = registry.start("sleep 1", None, HashMap::new(), false).await?;

    let status = registry.status(&record.process_id).await?;
    assert_eq!(status.status, ProcessStatus::Running);
    assert_eq!(status.pid, record.pid);

    assert!(wait_for_status(&registry, &record.process_id, ProcessStatus::Completed).await);
    Ok(())
}

#[tokio::test]
async fn failing_process_ends_up_failed() {
    let registry = registry();
    let record = registry
        .start("sleep 0; exit 3", None, HashMap::new(), false)
        .await
        .expect("start");

    assert!(wait_for_status(&registry, &record.process_id, ProcessStatus::Failed).await);
}

#[tokio::test]
async fn captured_process_records_its_output() -> Result<()> {
    let registry = registry();
    let record = registry
        .start("echo 'captured line'", None, HashMap::new(), true)
        .await?;

    assert!(wait_for_status(&registry, &record.process_id, ProcessStatus::Completed).await);

    let (stdout, stderr) = registry.output(&record.process_id).await?;
    assert!(stdout.contains("captured line"));
    assert_eq!(stderr, "");
    Ok(())
}

#[tokio::test]
async fn kill_is_idempotent() {
    let registry = registry();
    let record = registry
        .start("sleep 30", None, HashMap::new(), false)
        .await
        .expect("start");

    assert!(registry.kill(&record.process_id).await);
    assert!(!registry.kill(&record.process_id).await);
    assert!(!registry.kill("proc_unknown_0").await);

    let status = registry.status(&record.process_id).await.expect("status");
    assert_eq!(status.status, ProcessStatus::Killed);
}

#[tokio::test]
async fn killed_status_is_sticky_across_refreshes() {
    let registry = registry();
    let record = registry
        .start("sleep 30", None, HashMap::new(), false)
        .await
        .expect("start");

    registry.kill(&record.process_id).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for listed in registry.list().await {
        if listed.process_id == record.process_id {
            assert_eq!(listed.status, ProcessStatus::Killed);
        }
    }
}

#[tokio::test]
async fn kill_mid_run_preserves_captured_output() {
    let registry = registry();
    let record = registry
        .start("echo 'early output'; sleep 30", None, HashMap::new(), true)
        .await
        .expect("start");

    // let the first line land in the buffer
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(registry.kill(&record.process_id).await);

    let (stdout, _stderr) = registry.output(&record.process_id).await.expect("output");
    assert!(stdout.contains("early output"));
}

#[tokio::test]
async fn restart_produces_a_new_id_and_keeps_the_old_record() {
    let registry = registry();
    let original = registry
        .start("sleep 30", None, HashMap::new(), false)
        .await
        .expect("start");

    let restarted = registry.restart(&original.process_id).await.expect("restart");
    assert_ne!(restarted.process_id, original.process_id);
    assert_eq!(restarted.command, original.command);
    assert_eq!(restarted.status, ProcessStatus::Running);

    let old = registry.status(&original.process_id).await.expect("status");
    assert_eq!(old.status, ProcessStatus::Killed);

    registry.shutdown().await;
}

#[tokio::test]
async fn restart_keeps_capture_enabled() {
    let registry = registry();
    let original = registry
        .start("echo 'round one'; sleep 30", None, HashMap::new(), true)
        .await
        .expect("start");

    let restarted = registry.restart(&original.process_id).await.expect("restart");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (stdout, _) = registry.output(&restarted.process_id).await.expect("output");
    assert!(stdout.contains("round one"));

    registry.shutdown().await;
}

#[tokio::test]
async fn restart_of_unknown_process_is_not_found() {
    let registry = registry();
    let err = registry.restart("proc_unknown_0").await.unwrap_err();
    assert!(matches!(err, ExecError::NotFound { .. }));
}

#[tokio::test]
async fn records_carry_working_directory_and_environment() {
    let registry = registry();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut env = HashMap::new();
    env.insert("BG_MARKER".to_string(), "present".to_string());

    let record = registry
        .start(
            "echo $BG_MARKER",
            Some(dir.path().to_path_buf()),
            env.clone(),
            true,
        )
        .await
        .expect("start");

    assert_eq!(record.working_directory.as_deref(), Some(dir.path()));
    assert_eq!(record.environment_variables, env);

    assert!(wait_for_status(&registry, &record.process_id, ProcessStatus::Completed).await);
    let (stdout, _) = registry.output(&record.process_id).await.expect("output");
    assert!(stdout.contains("present"));
}

#[tokio::test]
async fn cleanup_removes_only_aged_terminal_records() {
    let registry = registry();
    let done = registry
        .start("true", None, HashMap::new(), false)
        .await
        .expect("start");
    let running = registry
        .start("sleep 30", None, HashMap::new(), false)
        .await
        .expect("start");

    assert!(wait_for_status(&registry, &done.process_id, ProcessStatus::Completed).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    registry.cleanup(Duration::from_millis(1)).await;

    let remaining: Vec<String> = registry
        .list()
        .await
        .into_iter()
        .map(|r| r.process_id)
        .collect();
    assert!(!remaining.contains(&done.process_id));
    assert!(remaining.contains(&running.process_id));

    // a generous age keeps even terminal records around
    registry.kill(&running.process_id).await;
    registry.cleanup(Duration::from_secs(3600)).await;
    assert_eq!(registry.list().await.len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn shutdown_kills_everything_and_clears_state() {
    let registry = registry();
    for _ in 0..3 {
        registry
            .start("sleep 30", None, HashMap::new(), false)
            .await
            .expect("start");
    }
    assert_eq!(registry.list().await.len(), 3);

    registry.shutdown().await;
    assert!(registry.list().await.is_empty());
}

#[tokio::test]
async fn concurrent_starts_are_all_tracked() {
    let registry = std::sync::Arc::new(registry());
    let mut handles = Vec::new();
    for i in 0..4 {
        let registry = std::sync::Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry
                .start(&format!("sleep {}", 10 + i), None, HashMap::new(), false)
                .await
                .expect("start")
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("start task").process_id);
    }
    assert_eq!(registry.list().await.len(), 4);

    for id in &ids {
        assert!(registry.kill(id).await);
    }
    registry.shutdown().await;
}

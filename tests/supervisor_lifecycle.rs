//! Supervisor 수명주기 통합 테스트: 실제 sh 프로세스로 시작/정지/종료/재시작 검증

#![cfg(unix)]

mod common;

use codehost::supervisor::{JobEventKind, JobState, StopOutcome, StopReason, SupervisorError};
use common::*;
use std::time::Duration;

const LONG: &str = "echo started\nsleep 30\n";
const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_capacity_ceiling_of_two() {
    let h = harness(2);
    let a = job_with_script(&h.sup, 1, "a", LONG).await;
    let b = job_with_script(&h.sup, 1, "b", LONG).await;
    let c = job_with_script(&h.sup, 2, "c", LONG).await;

    h.sup.start(a.id).await.unwrap();
    h.sup.start(b.id).await.unwrap();
    let err = h.sup.start(c.id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::CapacityExceeded { limit: 2 }));
    assert!(!is_running_in_store(&h.store, c.id));
    assert_eq!(h.sup.slots_in_use(), 2);

    assert_eq!(h.sup.stop(a.id, StopReason::User).await.unwrap(), StopOutcome::Stopped);
    h.sup.start(c.id).await.unwrap();
    assert_eq!(h.sup.slots_in_use(), 2);
    assert_eq!(h.store.counts().unwrap().running, 2);

    h.sup.stop(b.id, StopReason::User).await.unwrap();
    h.sup.stop(c.id, StopReason::User).await.unwrap();
    assert_eq!(h.sup.slots_in_use(), 0);
    println!("✓ ceiling=2: A, B ok; C denied; stop A; C ok");
}

#[tokio::test]
async fn test_start_running_job_is_already_running() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "bot", LONG).await;

    h.sup.start(job.id).await.unwrap();
    let first = h.store.get(job.id).unwrap().unwrap().backend_handle;
    assert!(first.is_some());

    let err = h.sup.start(job.id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
    assert_eq!(h.store.get(job.id).unwrap().unwrap().backend_handle, first);
    assert_eq!(h.sup.slots_in_use(), 1);

    h.sup.stop(job.id, StopReason::User).await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "bot", LONG).await;

    assert_eq!(h.sup.stop(job.id, StopReason::User).await.unwrap(), StopOutcome::NotRunning);

    h.sup.start(job.id).await.unwrap();
    assert_eq!(h.sup.stop(job.id, StopReason::User).await.unwrap(), StopOutcome::Stopped);
    assert_eq!(h.sup.stop(job.id, StopReason::User).await.unwrap(), StopOutcome::NotRunning);
    assert_eq!(h.sup.slots_in_use(), 0);

    let log = h.store.log_buffer(job.id).unwrap();
    assert_eq!(log.matches("Stopped by user").count(), 1);
}

#[tokio::test]
async fn test_missing_entry_and_unknown_job() {
    let h = harness(4);
    let job = h.sup.create_job(1, "empty", None).unwrap();
    assert!(matches!(h.sup.start(job.id).await, Err(SupervisorError::MissingEntry(_))));
    assert!(matches!(h.sup.start(9999).await, Err(SupervisorError::NotFound(_))));
    assert!(matches!(
        h.sup.stop(9999, StopReason::User).await,
        Err(SupervisorError::NotFound(_))
    ));
    assert_eq!(h.sup.slots_in_use(), 0);
}

#[tokio::test]
async fn test_running_flag_matches_tracking() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "short", "echo hi\nsleep 0.3\nexit 2\n").await;

    for _ in 0..2 {
        h.sup.start(job.id).await.unwrap();
        assert!(is_running_in_store(&h.store, job.id));
        assert!(h.sup.is_tracked(job.id));
        assert_eq!(h.sup.status(job.id).unwrap().state, JobState::Running);

        let settled = wait_until(WAIT, || !h.sup.is_tracked(job.id)).await;
        assert!(settled, "process exit was not observed");
        assert!(!is_running_in_store(&h.store, job.id));
        assert!(h.store.get(job.id).unwrap().unwrap().backend_handle.is_none());
        assert_eq!(h.sup.slots_in_use(), 0);
    }

    let log = h.store.log_buffer(job.id).unwrap();
    assert_eq!(log.matches("Process exited with code 2").count(), 2);
}

#[tokio::test]
async fn test_log_buffer_capped_from_head() {
    let h = harness(4);
    let script = "i=0\nwhile [ $i -lt 2000 ]; do echo line-$i-padding-padding; i=$((i+1)); done\n";
    let job = job_with_script(&h.sup, 1, "chatty", script).await;

    h.sup.start(job.id).await.unwrap();
    let log = wait_for_log(&h.store, job.id, "Process exited with code 0", WAIT).await;

    assert!(log.chars().count() <= 10_000);
    assert!(!log.contains("line-0-"), "oldest output should be gone");
    assert!(log.contains("STDOUT: line-1999-padding-padding\n"));
    assert!(log.ends_with("Process exited with code 0\n"));

    let tail = h.sup.read_logs(1, "chatty").await.unwrap();
    assert!(tail.starts_with("...\n"));
    assert!(tail.chars().count() <= 4_000 + 4);
    assert!(log.ends_with(&tail[4..]));
}

#[tokio::test]
async fn test_auto_restart_after_abnormal_exit() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "crashy", "echo boot\nexit 1\n").await;
    h.sup.set_auto_restart(1, "crashy", true).await.unwrap();
    let mut events = h.sup.subscribe();

    h.sup.start(job.id).await.unwrap();
    let log = wait_for_log(&h.store, job.id, "Restarted: main.sh", WAIT).await;
    let exit_at = log.find("Process exited with code 1").expect("exit line");
    let restart_at = log.find("Restarted: main.sh").expect("restart marker");
    assert!(exit_at < restart_at);

    let mut saw_exit = false;
    let mut saw_restart = false;
    while !(saw_exit && saw_restart) {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.job_id, job.id);
        match event.kind {
            JobEventKind::Exited { code } => {
                assert_eq!(code, Some(1));
                saw_exit = true;
            }
            JobEventKind::Restarted => {
                assert!(saw_exit, "restart reported before exit");
                saw_restart = true;
            }
            JobEventKind::RestartDenied { reason } => panic!("restart denied: {reason}"),
        }
    }

    h.sup.set_auto_restart(1, "crashy", false).await.unwrap();
    assert!(wait_until(WAIT, || !h.sup.is_tracked(job.id)).await);
    h.sup.stop(job.id, StopReason::User).await.unwrap();
    assert_eq!(h.sup.slots_in_use(), 0);
}

#[tokio::test]
async fn test_clean_exit_is_not_restarted() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "once", "echo done\n").await;
    h.sup.set_auto_restart(1, "once", true).await.unwrap();

    h.sup.start(job.id).await.unwrap();
    wait_for_log(&h.store, job.id, "Process exited with code 0", WAIT).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let log = h.store.log_buffer(job.id).unwrap();
    assert!(!log.contains("Restarted"));
    assert!(!h.sup.is_tracked(job.id));
}

#[tokio::test]
async fn test_restart_denied_without_slot() {
    let h = harness_with(|c| {
        c.supervisor.max_concurrent = 1;
        c.supervisor.restart_backoff_ms = 500;
    });
    let crashy = job_with_script(&h.sup, 1, "crashy", "sleep 0.2\nexit 1\n").await;
    let hog = job_with_script(&h.sup, 1, "hog", LONG).await;
    h.sup.set_auto_restart(1, "crashy", true).await.unwrap();
    let mut events = h.sup.subscribe();

    h.sup.start(crashy.id).await.unwrap();
    let exited = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(exited.kind, JobEventKind::Exited { code: Some(1) }));

    // take the only slot during the backoff window
    h.sup.start(hog.id).await.unwrap();

    let denied = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(denied.job_id, crashy.id);
    assert!(matches!(denied.kind, JobEventKind::RestartDenied { .. }));
    assert!(!is_running_in_store(&h.store, crashy.id));
    assert!(h.store.log_buffer(crashy.id).unwrap().contains("Restart denied"));
    assert_eq!(h.sup.slots_in_use(), 1);

    h.sup.stop(hog.id, StopReason::User).await.unwrap();
}

#[tokio::test]
async fn test_replacing_script_stops_first() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "bot", "echo version-one\nsleep 30\n").await;
    h.sup.start(job.id).await.unwrap();
    wait_for_log(&h.store, job.id, "version-one", WAIT).await;
    let old_entry = h.store.get(job.id).unwrap().unwrap().entry_path.unwrap();

    let new_entry = h
        .sup
        .submit_script(1, "bot", b"echo version-two\nsleep 30\n", "bot.sh")
        .await
        .unwrap();

    let stored = h.store.get(job.id).unwrap().unwrap();
    assert!(!stored.running);
    assert!(!h.sup.is_tracked(job.id));
    assert_eq!(stored.entry_path.as_deref(), Some(new_entry.as_path()));
    assert!(!old_entry.exists());
    assert_eq!(h.sup.slots_in_use(), 0);

    let log = h.store.log_buffer(job.id).unwrap();
    let stop_at = log.find("Stopped to install a new script").unwrap();
    let install_at = log.rfind("Script installed: bot.sh").unwrap();
    assert!(stop_at < install_at);

    h.sup.start(job.id).await.unwrap();
    let log = wait_for_log(&h.store, job.id, "version-two", WAIT).await;
    assert!(log.contains("STDOUT: version-two"));
    h.sup.stop(job.id, StopReason::User).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_respect_ceiling() {
    let h = harness(3);
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(job_with_script(&h.sup, 1, &format!("job{i}"), LONG).await.id);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for id in ids.clone() {
        let sup = h.sup.clone();
        tasks.spawn(async move { sup.start(id).await });
    }
    let mut started = 0;
    let mut denied = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(()) => started += 1,
            Err(SupervisorError::CapacityExceeded { .. }) => denied += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((started, denied), (3, 7));
    assert_eq!(h.store.counts().unwrap().running, 3);
    assert_eq!(h.sup.slots_in_use(), 3);

    for id in ids {
        h.sup.stop(id, StopReason::User).await.unwrap();
    }
    assert_eq!(h.sup.slots_in_use(), 0);
}

#[tokio::test]
async fn test_spawn_failure_leaves_job_stopped() {
    let h = harness_with(|c| c.backend.interpreter = "definitely-not-an-interpreter-xyz".into());
    let job = job_with_script(&h.sup, 1, "broken", LONG).await;

    let err = h.sup.start(job.id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    assert!(!is_running_in_store(&h.store, job.id));
    assert!(!h.sup.is_tracked(job.id));
    assert_eq!(h.sup.slots_in_use(), 0);
    assert!(h.store.log_buffer(job.id).unwrap().contains("Failed to start main.sh"));
}

#[tokio::test]
async fn test_delete_running_job() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "bot", LONG).await;
    let dir = h.sup.workspace().job_dir(1, job.id, &job.safe_name);
    assert!(dir.exists());

    h.sup.start(job.id).await.unwrap();
    h.sup.request_delete(1, "bot").await.unwrap();

    assert!(h.store.get(job.id).unwrap().is_none());
    assert!(!dir.exists());
    assert!(!h.sup.is_tracked(job.id));
    assert_eq!(h.sup.slots_in_use(), 0);
    assert!(matches!(
        h.sup.request_start(1, "bot").await,
        Err(SupervisorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_dependencies_recorded_once() {
    let h = harness_with(|c| {
        c.dependencies.command = vec![
            "sh".into(),
            "-c".into(),
            "echo installing \"$@\"".into(),
            "sh".into(),
        ];
        c.dependencies.install_on_start = true;
    });
    let job = job_with_script(&h.sup, 1, "bot", "echo ok\n").await;

    h.sup.install_dependency(1, "bot", "requests").await.unwrap();
    h.sup.install_dependency(1, "bot", " requests ").await.unwrap();
    h.sup.install_dependency(1, "bot", "aiohttp").await.unwrap();
    assert!(matches!(
        h.sup.install_dependency(1, "bot", "--index-url=evil").await,
        Err(SupervisorError::InvalidRequest(_))
    ));

    let stored = h.store.get(job.id).unwrap().unwrap();
    assert_eq!(stored.dependencies, vec!["requests", "aiohttp"]);
    let log = h.store.log_buffer(job.id).unwrap();
    assert!(log.contains("installing requests"));
    assert!(log.contains("Installed aiohttp"));

    // start re-installs recorded dependencies before spawning
    h.sup.start(job.id).await.unwrap();
    let log = wait_for_log(&h.store, job.id, "Process exited with code 0", WAIT).await;
    assert!(log.contains("STDOUT: ok"));
}

#[tokio::test]
async fn test_failed_dependency_install() {
    let h = harness_with(|c| {
        c.dependencies.command = vec!["sh".into(), "-c".into(), "echo 'not found' >&2; exit 1".into(), "sh".into()];
    });
    let job = job_with_script(&h.sup, 1, "bot", "echo ok\n").await;

    let err = h.sup.install_dependency(1, "bot", "nonexistent").await.unwrap_err();
    assert!(matches!(err, SupervisorError::DependencyInstall(_)));
    assert!(h.store.get(job.id).unwrap().unwrap().dependencies.is_empty());
    assert!(h.store.log_buffer(job.id).unwrap().contains("not found"));
}

#[tokio::test]
async fn test_shutdown_keeps_running_intent() {
    let h = harness(4);
    let job = job_with_script(&h.sup, 1, "bot", LONG).await;
    h.sup.start(job.id).await.unwrap();

    h.sup.shutdown().await;

    let stored = h.store.get(job.id).unwrap().unwrap();
    assert!(stored.running, "record keeps running=true for recovery");
    assert!(stored.backend_handle.is_some());
    assert!(!h.sup.is_tracked(job.id));
    assert_eq!(h.sup.slots_in_use(), 0);
    assert!(matches!(h.sup.start(job.id).await, Err(SupervisorError::ShuttingDown)));
    assert!(h.store.log_buffer(job.id).unwrap().contains("supervisor shutting down"));
}

#[tokio::test]
async fn test_reap_inactive_owner() {
    let h = harness(4);
    let idle = job_with_script(&h.sup, 1, "idle", LONG).await;
    let active = job_with_script(&h.sup, 2, "active", LONG).await;
    h.sup.start(idle.id).await.unwrap();

    h.store.set_last_active(1, 1_000).unwrap();
    let reaped = codehost::reaper::reap_inactive(&h.sup, Duration::from_secs(86_400)).await.unwrap();

    assert_eq!(reaped, 1);
    assert!(h.store.get(idle.id).unwrap().is_none());
    assert!(h.store.get(active.id).unwrap().is_some());
    assert!(!h.sup.workspace().owner_dir(1).exists());
    assert!(h.sup.workspace().owner_dir(2).exists());
    assert_eq!(h.sup.slots_in_use(), 0);
    assert_eq!(h.store.counts().unwrap().owners, 1);
}

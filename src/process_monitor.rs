use sysinfo::{Pid, ProcessStatus, System};

/// 특정 PID가 살아 있는지 확인 (크로스 플랫폼)
///
/// A zombie (exited, not yet reaped) counts as dead.
pub fn is_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .map(|process| process.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

// ── Async wrapper ──────────────────────────────────────────
// sysinfo 시스템 콜은 동기적으로 OS 프로세스 테이블을 읽습니다.
// tokio 워커 스레드에서 직접 호출하면 런타임이 블로킹되므로,
// spawn_blocking을 통해 전용 블로킹 스레드풀에서 실행합니다.

/// `is_running`의 비동기 래퍼.
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

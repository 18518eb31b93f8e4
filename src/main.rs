use std::sync::Arc;

use codehost::{backend, config, ipc, reaper, store, supervisor};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Codehost daemon starting");

    let cfg = config::GlobalConfig::load()?;
    std::fs::create_dir_all(&cfg.projects_dir)?;

    let store = Arc::new(store::JobStore::open(cfg.db_path())?);
    let backend = backend::from_config(&cfg.backend);
    let supervisor = supervisor::Supervisor::new(&cfg, store, backend);

    // 이전 실행에서 running으로 남은 작업 복구
    match supervisor.recover().await {
        Ok(report) if report.total() > 0 => tracing::info!(
            "Recovered jobs: {} re-attached, {} respawned, {} stopped",
            report.reattached.len(),
            report.respawned.len(),
            report.stopped.len()
        ),
        Ok(_) => {}
        Err(e) => tracing::error!("Recovery failed: {}", e),
    }

    // 비활성 소유자 정리 태스크
    if cfg.reaper.enabled {
        tokio::spawn(reaper::run_loop(
            supervisor.clone(),
            cfg.reaper.max_idle(),
            cfg.reaper.interval(),
        ));
    }

    // 알림 로거: 채팅 계층이 붙기 전까지 이벤트를 로그로 남긴다
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    "[Event] owner {} job '{}' (#{}): {:?}",
                    event.owner,
                    event.name,
                    event.job_id,
                    event.kind
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger skipped {} event(s)", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Graceful shutdown: Ctrl+C 시 정리
    let ipc_server = ipc::IPCServer::new(supervisor.clone(), &cfg.ipc_listen);
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
    };
    if let Err(e) = ipc_server.start(shutdown).await {
        tracing::error!("IPC server error: {}", e);
    }

    supervisor.shutdown().await;
    tracing::info!("Codehost daemon stopped");
    Ok(())
}

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tower_http::trace::TraceLayer;

use crate::supervisor::Supervisor;

mod handlers;

/// Largest accepted script or archive upload.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// IPC 요청/응답 타입
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptQuery {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRestartRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub package: String,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Supervisor,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Supervisor, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        use handlers::jobs;

        Router::new()
            .route("/api/stats", get(jobs::stats))
            .route("/api/owners/:owner/jobs", get(jobs::list_jobs).post(jobs::create_job))
            .route(
                "/api/owners/:owner/jobs/:name",
                get(jobs::job_status).delete(jobs::delete_job),
            )
            .route("/api/owners/:owner/jobs/:name/script", put(jobs::submit_script))
            .route("/api/owners/:owner/jobs/:name/start", post(jobs::start_job))
            .route("/api/owners/:owner/jobs/:name/stop", post(jobs::stop_job))
            .route("/api/owners/:owner/jobs/:name/auto-restart", put(jobs::set_auto_restart))
            .route("/api/owners/:owner/jobs/:name/logs", get(jobs::read_logs))
            .route(
                "/api/owners/:owner/jobs/:name/dependencies",
                post(jobs::install_dependency),
            )
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend;
    use crate::config::GlobalConfig;
    use crate::store::JobStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server(tmp: &std::path::Path) -> IPCServer {
        let mut config = GlobalConfig::default();
        config.projects_dir = tmp.join("projects");
        config.backend.interpreter = "sh".into();
        config.supervisor.grace_period_ms = 500;
        config.dependencies.install_on_start = false;
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let sup = Supervisor::new(&config, store, backend::from_config(&config.backend));
        IPCServer::new(sup, "127.0.0.1:0")
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_create_and_list_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let app = server(tmp.path()).router();

        let (status, body) =
            send(&app, "POST", "/api/owners/5/jobs", Some(json!({"name": "my bot"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["job"]["safe_name"], "my_bot");

        let (status, body) =
            send(&app, "POST", "/api/owners/5/jobs", Some(json!({"name": "my bot"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "DUPLICATE_NAME");

        let (status, body) = send(&app, "GET", "/api/owners/5/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["state"], "stopped");
        assert_eq!(jobs[0]["running"], false);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let tmp = tempfile::tempdir().unwrap();
        let app = server(tmp.path()).router();

        let (status, body) = send(&app, "POST", "/api/owners/1/jobs/ghost/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error_code"], "NOT_FOUND");

        send(&app, "POST", "/api/owners/1/jobs", Some(json!({"name": "empty"}))).await;
        let (status, body) = send(&app, "POST", "/api/owners/1/jobs/empty/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "MISSING_ENTRY");

        let (status, body) = send(&app, "POST", "/api/owners/1/jobs/empty/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "not_running");
    }

    #[tokio::test]
    async fn test_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let app = server(tmp.path()).router();
        send(&app, "POST", "/api/owners/1/jobs", Some(json!({"name": "a"}))).await;
        send(&app, "POST", "/api/owners/2/jobs", Some(json!({"name": "b"}))).await;

        let (status, body) = send(&app, "GET", "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["owners"], 2);
        assert_eq!(body["stats"]["jobs"], 2);
        assert_eq!(body["stats"]["running_jobs"], 0);
        assert_eq!(body["stats"]["slot_limit"], 8);
    }

    #[tokio::test]
    async fn test_auto_restart_toggle() {
        let tmp = tempfile::tempdir().unwrap();
        let app = server(tmp.path()).router();
        send(&app, "POST", "/api/owners/1/jobs", Some(json!({"name": "a"}))).await;

        let (status, _) = send(
            &app,
            "PUT",
            "/api/owners/1/jobs/a/auto-restart",
            Some(json!({"enabled": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, "GET", "/api/owners/1/jobs/a", None).await;
        assert_eq!(body["job"]["auto_restart"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upload_start_logs_stop_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc = server(tmp.path());
        let app = ipc.router();
        send(&app, "POST", "/api/owners/1/jobs", Some(json!({"name": "echo"}))).await;

        let req = Request::builder()
            .method("PUT")
            .uri("/api/owners/1/jobs/echo/script?filename=run.sh")
            .body(Body::from("echo hello-from-job\nsleep 30\n"))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let (status, _) = send(&app, "POST", "/api/owners/1/jobs/echo/start", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "POST", "/api/owners/1/jobs/echo/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "ALREADY_RUNNING");

        let mut logs = String::new();
        for _ in 0..50 {
            let (_, body) = send(&app, "GET", "/api/owners/1/jobs/echo/logs", None).await;
            logs = body["logs"].as_str().unwrap_or_default().to_string();
            if logs.contains("hello-from-job") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(logs.contains("STDOUT: hello-from-job"), "logs: {logs}");

        let (status, body) = send(&app, "POST", "/api/owners/1/jobs/echo/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "stopped");

        let (status, _) = send(&app, "DELETE", "/api/owners/1/jobs/echo", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "GET", "/api/owners/1/jobs/echo", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(ipc.supervisor.slots_in_use(), 0);
    }
}

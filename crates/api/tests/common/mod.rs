#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use scriptgate_core::config::EngineConfig;
use scriptgate_core::scripting::cache::DependencyCache;
use scriptgate_core::scripting::deps::DependencyDeclaration;
use scriptgate_core::scripting::installer::{InstallError, PackageInstaller};
use serde_json::Value;
use tower::ServiceExt;

use scriptgate_api::config::ServerConfig;
use scriptgate_api::router::build_app_router;
use scriptgate_api::state::AppState;

/// Schema answer plus a greeting, as a bash body.
pub const HELLO_UNIT: &str = r#"if [ "$1" = "--_sys_get_schema" ]; then
  echo '{"name":{"flag":"--name","type":"str","required":true,"help":"Who to greet"}}'
  exit 0
fi
echo "{\"msg\":\"Hello $2\"}"
"#;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
    }
}

/// Installer fake: records calls, writes a marker file, fails on demand.
#[derive(Default)]
pub struct FakeInstaller {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeInstaller {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn install(
        &self,
        declaration: &DependencyDeclaration,
        target: &Path,
    ) -> Result<String, InstallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InstallError::Failed {
                exit_code: 1,
                output: format!("No matching distribution for {}", declaration.specifiers.join(" ")),
            });
        }
        tokio::fs::write(target.join("installed.txt"), declaration.specifiers.join("\n")).await?;
        Ok("installed".to_string())
    }
}

/// A unit tree, a work dir and the wired application state.
pub struct TestApp {
    _tmp: tempfile::TempDir,
    pub units: PathBuf,
    pub installer: Arc<FakeInstaller>,
    pub state: AppState,
}

impl TestApp {
    /// Every interpreter is `bash`, so units of any runtime are bash bodies.
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let units = tmp.path().join("units");
        std::fs::create_dir_all(&units).expect("mkdir units");

        let mut engine = EngineConfig::default();
        engine.units_dir = units.clone();
        engine.work_dir = tmp.path().join("work");
        engine.execution_timeout = Duration::from_secs(5);
        engine.schema_timeout = Duration::from_secs(5);
        engine.kill_grace = Duration::from_millis(300);
        engine.interpreters.python = "bash".to_string();
        engine.interpreters.node = "bash".to_string();
        let engine = Arc::new(engine);

        let installer = Arc::new(FakeInstaller::default());
        let cache = Arc::new(DependencyCache::new(&engine, installer.clone()));
        let notify = Arc::new(scriptgate_events::NotifySubscriptions::new(
            engine.work_dir.join("notify_units.json"),
        ));
        let state = AppState::new(
            test_config(),
            engine,
            cache,
            Arc::new(scriptgate_events::EventBus::default()),
            notify,
        );

        Self {
            _tmp: tmp,
            units,
            installer,
            state,
        }
    }

    /// The router exactly as `main.rs` builds it.
    pub fn router(&self) -> Router {
        build_app_router(self.state.clone(), &test_config())
    }

    /// Write an executable bash unit at `rel` under the unit tree.
    pub fn write_unit(&self, rel: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.units.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, format!("#!/bin/bash\n{body}")).expect("write unit");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        std::fs::write(self.units.join(rel), contents).expect("write file");
    }

    pub async fn scan(&self) {
        self.state.scanner.scan().await;
    }
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    app.oneshot(request).await.expect("response")
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    send_json(app, Method::POST, uri, body).await
}

pub async fn put_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    send_json(app, Method::PUT, uri, body).await
}

async fn send_json(app: Router, method: Method, uri: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    app.oneshot(request).await.expect("response")
}

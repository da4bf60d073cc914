//! Engine behaviour with the default, working-directory-relative layout.
//!
//! Changes the process working directory, so this file holds a single test.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use scriptgate_core::config::EngineConfig;
use scriptgate_core::scripting::cache::DependencyCache;
use scriptgate_core::scripting::installer::SystemInstaller;
use scriptgate_core::scripting::result::{ExecutionRequest, ExecutionResult};
use scriptgate_core::scripting::scanner::UnitScanner;
use scriptgate_core::scripting::supervisor::ExecutionSupervisor;

const HELLO: &str = "#!/bin/bash\n\
if [ \"$1\" = \"--_sys_get_schema\" ]; then echo '{}'; exit 0; fi\n\
echo \"{\\\"tmp\\\":\\\"$SCRIPT_TMP_DIR\\\"}\"\n";

#[tokio::test]
async fn default_relative_layout_runs_units() {
    let tmp = tempfile::tempdir().expect("temp dir");
    std::env::set_current_dir(tmp.path()).expect("enter temp dir");

    let units = tmp.path().join("scripts_repo");
    std::fs::create_dir_all(&units).expect("units dir");
    let script = units.join("hello.sh");
    std::fs::write(&script, HELLO).expect("write unit");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let config = Arc::new(EngineConfig::default());
    assert!(config.units_dir.is_absolute());
    assert!(config.work_dir.is_absolute());
    assert!(config.work_dir.ends_with(".scriptgate"));

    let installer = Arc::new(SystemInstaller::new(Arc::clone(&config)));
    let cache = Arc::new(
        DependencyCache::open(&config, installer)
            .await
            .expect("open cache"),
    );
    let scanner = UnitScanner::new(Arc::clone(&config), cache);
    let report = scanner.scan().await;
    assert_eq!(report.added.len(), 1);

    let catalog = scanner.catalog();
    let entry = catalog.get("hello.sh").expect("unit registered");
    assert!(entry.is_callable(), "unit not callable: {:?}", entry.error);
    assert!(entry.descriptor.entry.is_absolute());

    let supervisor = ExecutionSupervisor::new(Arc::clone(&config));
    let request = ExecutionRequest::new("hello.sh", serde_json::Map::new(), Duration::from_secs(5));
    let result = supervisor
        .execute(
            &request,
            &entry.descriptor,
            entry.schema.as_ref().expect("schema"),
            entry.environment.as_ref().expect("environment"),
        )
        .await
        .expect("spawn");

    match result {
        ExecutionResult::Success { payload, .. } => {
            let scratch = payload["tmp"].as_str().expect("scratch path");
            assert!(std::path::Path::new(scratch).is_absolute(), "relative scratch: {scratch}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

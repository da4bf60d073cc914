//! Integration tests for the unit catalog and call endpoints.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, get, post_json, put_json, TestApp, HELLO_UNIT};
use serde_json::json;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lists_units_with_state_and_schema() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.write_unit("broken.sh", "echo not-json\n");
    app.scan().await;

    let response = get(app.router(), "/api/v1/units").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let units = json["data"].as_array().expect("data should be an array");
    assert_eq!(units.len(), 2);

    let hello = units
        .iter()
        .find(|u| u["descriptor"]["id"] == "hello.sh")
        .expect("hello listed");
    assert_eq!(hello["descriptor"]["state"], "ready");
    assert_eq!(hello["callable"], true);
    assert_eq!(hello["schema"]["name"]["flag"], "--name");

    let broken = units
        .iter()
        .find(|u| u["descriptor"]["id"] == "broken.sh")
        .expect("broken listed");
    assert_eq!(broken["descriptor"]["state"], "error");
    assert_eq!(broken["callable"], false);
    assert_eq!(broken["error"]["stage"], "extraction");
}

#[tokio::test]
async fn get_unit_and_schema() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.scan().await;

    let json = body_json(get(app.router(), "/api/v1/units/hello.sh").await).await;
    assert_eq!(json["data"]["descriptor"]["runtime"], "shell");

    let json = body_json(get(app.router(), "/api/v1/units/hello.sh/schema").await).await;
    assert_eq!(json["data"]["name"]["type"], "str");
    assert_eq!(json["data"]["name"]["required"], true);
}

#[tokio::test]
async fn nested_unit_ids_are_percent_encoded() {
    let app = TestApp::new();
    app.write_unit("tools/hello.sh", HELLO_UNIT);
    app.scan().await;

    let response = get(app.router(), "/api/v1/units/tools%2Fhello.sh").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["descriptor"]["id"], "tools/hello.sh");
}

#[tokio::test]
async fn unknown_unit_returns_404() {
    let app = TestApp::new();
    app.scan().await;

    let response = get(app.router(), "/api/v1/units/missing.sh").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn environment_of_a_ready_unit() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.scan().await;

    let response = get(app.router(), "/api/v1/units/hello.sh/environment").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["env_vars"]["SCRIPT_ID"], "hello.sh");
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_returns_success_payload() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.scan().await;
    let mut events = app.state.event_bus.subscribe();

    let response = post_json(
        app.router(),
        "/api/v1/units/hello.sh/run",
        json!({ "params": { "name": "Alice" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["outcome"], "success");
    assert_eq!(json["data"]["payload"], json!({ "msg": "Hello Alice" }));

    let event = events.recv().await.expect("run event");
    assert_eq!(event.record.unit_id, "hello.sh");
}

#[tokio::test]
async fn missing_parameter_is_a_validation_failure() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.scan().await;

    let response = post_json(app.router(), "/api/v1/units/hello.sh/run", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["outcome"], "failure");
    assert_eq!(json["data"]["kind"], "validation_error");
}

#[tokio::test]
async fn slow_unit_times_out() {
    let app = TestApp::new();
    app.write_unit(
        "slow.sh",
        "if [ \"$1\" = \"--_sys_get_schema\" ]; then echo '{}'; exit 0; fi\nsleep 30\n",
    );
    app.scan().await;

    let response = post_json(
        app.router(),
        "/api/v1/units/slow.sh/run",
        json!({ "timeout_secs": 1 }),
    )
    .await;
    let json = body_json(response).await;
    assert_eq!(json["data"]["outcome"], "timeout");
}

#[tokio::test]
async fn zero_timeout_is_rejected() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.scan().await;

    let response = post_json(
        app.router(),
        "/api/v1/units/hello.sh/run",
        json!({ "params": { "name": "Bob" }, "timeout_secs": 0 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn error_unit_cannot_be_called() {
    let app = TestApp::new();
    app.write_unit("broken.sh", "exit 3\n");
    app.scan().await;

    let response = post_json(app.router(), "/api/v1/units/broken.sh/run", json!({})).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "CONFLICT");
}

// ---------------------------------------------------------------------------
// Running executions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_execution_can_be_terminated() {
    let app = TestApp::new();
    app.write_unit(
        "slow.sh",
        "if [ \"$1\" = \"--_sys_get_schema\" ]; then echo '{}'; exit 0; fi\nsleep 30\n",
    );
    app.scan().await;

    let router = app.router();
    let call = tokio::spawn(post_json(
        router.clone(),
        "/api/v1/units/slow.sh/run",
        json!({ "timeout_secs": 20 }),
    ));

    let execution_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let json = body_json(get(router.clone(), "/api/v1/executions/running").await).await;
            if let Some(id) = json["data"][0]["execution_id"].as_str() {
                break id.to_string();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("execution shows up as running");

    let response = post_json(
        router.clone(),
        &format!("/api/v1/executions/{execution_id}/terminate"),
        json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call returns")
        .expect("join");
    let json = body_json(response).await;
    assert_eq!(json["data"]["outcome"], "failure");
    assert_eq!(json["data"]["kind"], "terminated");

    let response = post_json(
        router,
        &format!("/api/v1/executions/{execution_id}/terminate"),
        json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Notification opt-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notify_is_off_until_enabled() {
    let app = TestApp::new();
    app.write_unit("hello.sh", HELLO_UNIT);
    app.scan().await;

    let json = body_json(get(app.router(), "/api/v1/units/hello.sh").await).await;
    assert_eq!(json["data"]["notify"], false);

    let response = put_json(
        app.router(),
        "/api/v1/units/hello.sh/notify",
        json!({ "enabled": true }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["unit_id"], "hello.sh");
    assert_eq!(json["data"]["enabled"], true);
    assert!(app.state.notify.is_enabled("hello.sh"));
    assert!(app.state.notify.path().exists());

    let json = body_json(get(app.router(), "/api/v1/units").await).await;
    assert_eq!(json["data"][0]["notify"], true);

    put_json(
        app.router(),
        "/api/v1/units/hello.sh/notify",
        json!({ "enabled": false }),
    )
    .await;
    assert!(!app.state.notify.is_enabled("hello.sh"));
}

#[tokio::test]
async fn notify_for_unknown_unit_returns_404() {
    let app = TestApp::new();
    app.scan().await;

    let response = put_json(
        app.router(),
        "/api/v1/units/missing.sh/notify",
        json!({ "enabled": true }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!app.state.notify.is_enabled("missing.sh"));
}

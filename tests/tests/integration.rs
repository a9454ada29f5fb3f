use async_trait::async_trait;
use fim_kernel::bus::RequestReplyBus;
use fim_kernel::config::{DispatchMode, RuntimeConfig, SettableConfigureManager};
use fim_kernel::connector::{PipelineProcess, sync_process};
use fim_kernel::dispatch::FlowInvoker;
use fim_kernel::model::{DataInstance, ModelInstance};
use fim_kernel::{FlowError, PrimitiveValue, ProcessError, ProcessResult};
use fim_runtime::{
    Application, ApplicationBuilder, BusFlowInvoker, InProcessBus, RuntimeError,
};
use fim_testing::{MockSourceGenerator, MockTargetGenerator};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const REGISTER: &str = r##"
[model]
"user/user_id" = "int"
"user/username" = "string"
"user/email" = "string"
"user/audited" = "bool"
"user/ledger_seq" = "int"

[flows.register]
in = [["user/username", "username"]]
out = [["user_id", "user/user_id"]]
steps = [
    { "@check_not_blank_break" = ["username", "E1", "bad input"] },
    { "@assign" = ["user_id", 123] },
]

[pipelines.register]
source_connectors = [
    { "@connector" = "http", "@mapping" = "http_in", "@name" = "register-http", path = "configure-static://REGISTER_PATH" },
]
steps = [
    { "@flow" = "register" },
    { "#flow" = "&audit", "@mapping" = "audit_out", "@name" = "audit", "@case-non-empty" = ["user/email"] },
    { "@flow" = "&audit", "@mapping" = "ledger_out", "@name" = "ledger", topic = "users" },
]

[pipelines.register.connector_mapping.http_in]
req = [["body", "", [["username", "user/username"], ["email", "user/email"]]]]
res = [["user/user_id", "user_id"], ["user/audited", "audited"], ["user/ledger_seq", "seq"]]
errors = { E1 = { message = "error/message", status = 400 } }

[pipelines.register.connector_mapping.audit_out]
req = [["user/username", "who"], ["user/email", "email"]]
res = [["ack", "user/audited"]]

[pipelines.register.connector_mapping.ledger_out]
req = [["user/user_id", "id"]]
res = [["seq", "user/ledger_seq"]]
"##;

struct Harness {
    app: Application,
    http: MockSourceGenerator,
    audit: MockTargetGenerator,
}

fn harness(config: RuntimeConfig, bus: Option<Arc<InProcessBus>>) -> Harness {
    fim_runtime::init_logging(&config);
    let http = MockSourceGenerator::new("http");
    let audit = MockTargetGenerator::new("audit");
    let settings = Arc::new(SettableConfigureManager::new());
    settings.set_configure("REGISTER_PATH", "/register");

    let mut builder = ApplicationBuilder::new()
        .with_config(config)
        .with_source_generator(Arc::new(http.clone()))
        .with_target_generator(Arc::new(audit.clone()))
        .with_configure_manager(settings);
    if let Some(bus) = bus {
        builder = builder.with_bus(bus);
    }
    Harness {
        app: builder.build().unwrap(),
        http,
        audit,
    }
}

async fn started(config: RuntimeConfig, bus: Option<Arc<InProcessBus>>) -> Harness {
    let mut h = harness(config, bus);
    let mut container = h.app.spawn_container("users").unwrap();
    container.load_merged(REGISTER).unwrap();
    h.app.add_container(container).unwrap();

    h.audit
        .connector("audit")
        .unwrap()
        .set_reply(json!({"ack": true}))
        .await;
    h.audit
        .connector("ledger")
        .unwrap()
        .set_reply(json!({"seq": 7}))
        .await;
    h.app.startup().await.unwrap();
    h
}

#[tokio::test]
async fn test_register_end_to_end() {
    let h = started(RuntimeConfig::default(), None).await;
    let http = h.http.connector("register-http").unwrap();
    assert_eq!(http.options()["path"], "/register");
    assert!(http.is_running().await);

    let response = http
        .trigger(json!({"body": {"username": "alice", "email": "a@example.com"}}))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(response.status, 200);
    // the async audit step never writes back
    assert_eq!(response.body, json!({"user_id": 123, "seq": 7}));

    let audit = h.audit.connector("audit").unwrap();
    assert_eq!(
        audit.history().await,
        vec![json!({"who": "alice", "email": "a@example.com"})]
    );
    let ledger = h.audit.connector("ledger").unwrap();
    assert_eq!(ledger.history().await, vec![json!({"id": 123})]);
    assert_eq!(ledger.options()["topic"], "users");
    fim_testing::assert_triggered!(http, 1);
}

#[tokio::test]
async fn test_gate_skips_audit_without_email() {
    let h = started(RuntimeConfig::default(), None).await;
    let http = h.http.connector("register-http").unwrap();

    let response = http
        .trigger(json!({"body": {"username": "bob"}}))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(h.audit.connector("audit").unwrap().call_count().await, 0);
    assert_eq!(h.audit.connector("ledger").unwrap().call_count().await, 1);
}

#[tokio::test]
async fn test_flow_error_maps_to_status_and_stops_pipeline() {
    let h = started(RuntimeConfig::default(), None).await;
    let http = h.http.connector("register-http").unwrap();

    let response = http
        .trigger(json!({"body": {"username": "  "}}))
        .await
        .unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.body, json!({"error": {"message": "bad input"}}));
    let error = response.error.unwrap();
    assert_eq!(error.key.as_deref(), Some("E1"));

    assert_eq!(h.audit.connector("ledger").unwrap().call_count().await, 0);
}

#[tokio::test]
async fn test_target_failure_is_unmapped() {
    let h = started(RuntimeConfig::default(), None).await;
    h.audit
        .connector("ledger")
        .unwrap()
        .set_error(FlowError::new("LEDGER_DOWN", "ledger unavailable"))
        .await;

    let response = h
        .http
        .connector("register-http")
        .unwrap()
        .trigger(json!({"body": {"username": "carol"}}))
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.body, json!({}));
    assert_eq!(response.error.unwrap().message, "ledger unavailable");
}

#[tokio::test]
async fn test_register_over_bus() {
    let mut config = RuntimeConfig::default();
    config.dispatch.mode = DispatchMode::Bus;
    let bus = Arc::new(InProcessBus::new());
    let h = started(config, Some(bus.clone())).await;
    assert!(bus.is_served("users/register"));

    let http = h.http.connector("register-http").unwrap();
    let response = http
        .trigger(json!({"body": {"username": "alice"}}))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"user_id": 123, "seq": 7}));

    let response = http
        .trigger(json!({"body": {"username": ""}}))
        .await
        .unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.body, json!({"error": {"message": "bad input"}}));
}

#[tokio::test]
async fn test_shutdown_releases_bus_and_connectors() {
    let mut config = RuntimeConfig::default();
    config.dispatch.mode = DispatchMode::Bus;
    let bus = Arc::new(InProcessBus::new());
    let mut h = started(config, Some(bus.clone())).await;

    h.app.stop().await.unwrap();
    assert!(!bus.is_served("users/register"));
    let http = h.http.connector("register-http").unwrap();
    assert!(!http.is_running().await);
    assert!(http.trigger(json!({"body": {}})).await.is_err());
}

#[tokio::test]
async fn test_container_start_unwinds() {
    let mut h = harness(RuntimeConfig::default(), None);
    let mut container = h.app.spawn_container("broken").unwrap();
    container
        .load_pipeline(
            "p",
            r#"
            source_connectors = [
                { "@connector" = "http", "@mapping" = "m", "@name" = "first" },
                { "@connector" = "http", "@mapping" = "m", "@name" = "second", fail_start = true },
            ]
            [connector_mapping.m]
            "#,
        )
        .unwrap();
    h.app.add_container(container).unwrap();

    let err = h.app.startup().await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        RuntimeError::Connector { name, .. } if name == "second"
    ));
    assert!(!h.http.connector("first").unwrap().is_running().await);
    assert!(!h.app.is_started());
}

// ============================================================================
// Remote invoker
// ============================================================================

fn invokers(timeout: Duration) -> (Arc<InProcessBus>, BusFlowInvoker, BusFlowInvoker) {
    let bus = Arc::new(InProcessBus::new());
    let shared: Arc<dyn RequestReplyBus> = bus.clone();
    let server = BusFlowInvoker::new(shared.clone(), timeout).with_node_id("server");
    let client = BusFlowInvoker::new(shared, timeout).with_node_id("client");
    (bus, server, client)
}

#[tokio::test]
async fn test_remote_flow_error_propagation() {
    let (_bus, server, client) = invokers(Duration::from_secs(5));
    server
        .add_pipeline(
            "svc/check",
            sync_process(|_| Err(FlowError::new("E1", "bad input").into())),
        )
        .unwrap();
    server.start().await.unwrap();

    let err = client
        .invoke("svc/check", &mut ModelInstance::new())
        .await
        .unwrap_err();
    match err {
        ProcessError::Flow(e) => {
            assert_eq!(e.key, "E1");
            assert_eq!(e.message, "bad input");
        }
        other => panic!("expected a flow error, got {other}"),
    }
}

#[tokio::test]
async fn test_remote_success_merges_reply() {
    let (_bus, server, client) = invokers(Duration::from_secs(5));
    server
        .add_pipeline(
            "svc/enrich",
            sync_process(|m| {
                m.add_or_update_field("user/id", Some(PrimitiveValue::Int(5)))?;
                Ok(())
            }),
        )
        .unwrap();
    server.start().await.unwrap();

    let mut model =
        ModelInstance::from_general_object(&json!({"keep": 1, "user": {"name": "a"}})).unwrap();
    client.invoke("svc/enrich", &mut model).await.unwrap();
    assert_eq!(
        model.to_general_object(),
        json!({"keep": 1, "user": {"name": "a", "id": 5}})
    );
}

#[tokio::test]
async fn test_remote_panic_is_a_generic_error() {
    let (_bus, server, client) = invokers(Duration::from_secs(5));
    server
        .add_pipeline("svc/explode", sync_process(|_| panic!("boom")))
        .unwrap();
    server.start().await.unwrap();

    let err = client
        .invoke("svc/explode", &mut ModelInstance::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Remote(ref m) if m.starts_with("500:")));

    // the handler survives the panic
    let err = client
        .invoke("svc/explode", &mut ModelInstance::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Remote(_)));
}

struct Stalled;

#[async_trait]
impl PipelineProcess for Stalled {
    async fn process(&self, _model: &mut ModelInstance) -> ProcessResult<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_remote_timeout() {
    let (_bus, server, client) = invokers(Duration::from_millis(200));
    server.add_pipeline("svc/slow", Arc::new(Stalled)).unwrap();
    server.start().await.unwrap();

    let err = client
        .invoke("svc/slow", &mut ModelInstance::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Timeout(d) if d == Duration::from_millis(200)));
}

#[tokio::test]
async fn test_remote_unknown_pipeline() {
    let (_bus, _server, client) = invokers(Duration::from_secs(1));
    let err = client
        .invoke("svc/none", &mut ModelInstance::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Bus(_)));
}

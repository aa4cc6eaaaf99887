//! End-to-end tests of the engine against the reference directory over the
//! HTTP adapter.

use pushsync_directory::{DirectoryServer, ServerConfig};
use pushsync_engine::{
    AuthData, BindingError, DirectoryApi, EngineConfig, HttpDirectory, HttpTokenProvider,
    LoopbackClient, MemoryEventSink, RetryConfig, SyncEngine, TokenProvider,
};
use pushsync_protocol::{DeviceMetadata, HttpRequest, HttpResponse, InterestSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);
const INSTANCE: &str = "instance-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connect(server: &Arc<DirectoryServer>) -> impl DirectoryApi + 'static {
    let server = Arc::clone(server);
    HttpDirectory::new(
        "https://directory.test/device_api/v1/",
        INSTANCE,
        LoopbackClient::new(move |request: &HttpRequest| server.handle(request)),
    )
}

fn provider(server: &Arc<DirectoryServer>) -> Arc<dyn TokenProvider> {
    let server = Arc::clone(server);
    Arc::new(move |user: &str| -> Result<String, String> { Ok(server.token_for(user)) })
}

fn config() -> EngineConfig {
    EngineConfig::new(INSTANCE)
        .with_retry(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
        )
        .with_metadata(DeviceMetadata::new("1.0.0", "14"))
}

fn open(server: &Arc<DirectoryServer>, dir: &Path, events: &MemoryEventSink) -> SyncEngine {
    SyncEngine::open(
        config(),
        connect(server),
        dir,
        Arc::new(events.clone()),
        Some(provider(server)),
    )
    .unwrap()
}

fn set(names: &[&str]) -> InterestSet {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn device_lifecycle() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();
    let engine = open(&server, dir.path(), &events);

    engine.subscribe("donuts").unwrap();
    engine.start("tok-1").unwrap();
    engine.set_user_id("alice").unwrap();
    engine.wait_idle(WAIT).unwrap();

    let device_id = engine.device_id().unwrap();
    let record = server.device(&device_id).unwrap();
    assert_eq!(record.interests, set(&["donuts"]));
    assert_eq!(record.token, "tok-1");
    assert_eq!(record.user_id.as_deref(), Some("alice"));
    assert_eq!(record.metadata, DeviceMetadata::new("1.0.0", "14"));
    assert_eq!(events.bindings(), vec![("alice".to_string(), None)]);

    engine.unsubscribe("donuts").unwrap();
    engine.subscribe("pizza").unwrap();
    engine.refresh_token("tok-2").unwrap();
    engine.wait_idle(WAIT).unwrap();

    let record = server.device(&device_id).unwrap();
    assert_eq!(record.interests, set(&["pizza"]));
    assert_eq!(record.token, "tok-2");

    engine.stop().unwrap();
    engine.wait_idle(WAIT).unwrap();
    assert_eq!(server.device_count(), 0);
    assert_eq!(engine.device_id(), None);
    assert!(engine.interests().is_empty());
    assert_eq!(events.interest_changes().last(), Some(&InterestSet::new()));
}

#[test]
fn pending_jobs_survive_restart() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();

    {
        let engine = open(&server, dir.path(), &events);
        engine.subscribe("a").unwrap();
        engine.subscribe("b").unwrap();
        engine.wait_idle(WAIT).unwrap();
        assert_eq!(engine.pending_jobs(), 2);
    }

    let engine = open(&server, dir.path(), &events);
    assert_eq!(engine.interests(), set(&["a", "b"]));
    engine.start("tok-1").unwrap();
    engine.wait_idle(WAIT).unwrap();

    let device_id = engine.device_id().unwrap();
    assert_eq!(server.device(&device_id).unwrap().interests, set(&["a", "b"]));
    assert_eq!(engine.pending_jobs(), 0);
}

#[test]
fn started_device_is_not_registered_twice() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();

    let first_id = {
        let engine = open(&server, dir.path(), &events);
        engine.start("tok-1").unwrap();
        engine.wait_idle(WAIT).unwrap();
        engine.device_id().unwrap()
    };

    let engine = open(&server, dir.path(), &events);
    assert_eq!(engine.device_id().as_deref(), Some(first_id.as_str()));
    engine.start("tok-1").unwrap();
    engine.wait_idle(WAIT).unwrap();

    assert_eq!(server.device_count(), 1);
    assert_eq!(engine.device_id(), Some(first_id));
}

#[test]
fn forgotten_device_is_recreated_with_local_interests() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();
    let engine = open(&server, dir.path(), &events);

    engine.start("tok-1").unwrap();
    engine.subscribe("a").unwrap();
    engine.wait_idle(WAIT).unwrap();
    let old_id = engine.device_id().unwrap();

    assert!(server.forget_device(&old_id));
    engine.subscribe("b").unwrap();
    engine.wait_idle(WAIT).unwrap();

    let new_id = engine.device_id().unwrap();
    assert_ne!(new_id, old_id);
    let record = server.device(&new_id).unwrap();
    assert_eq!(record.interests, set(&["a", "b"]));
    assert_eq!(record.token, "tok-1");
}

#[test]
fn stop_before_start_discards_earlier_changes() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    server.set_initial_interests("old-device", set(&["portugal"]));
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();
    let engine = open(&server, dir.path(), &events);

    engine.subscribe("hello").unwrap();
    engine.stop().unwrap();
    engine.subscribe("goodbye").unwrap();
    engine
        .start_with_prior_ids("tok-1", vec!["old-device".into()])
        .unwrap();
    engine.wait_idle(WAIT).unwrap();

    let expected = set(&["goodbye", "portugal"]);
    assert_eq!(engine.interests(), expected);
    let device_id = engine.device_id().unwrap();
    assert_eq!(server.device(&device_id).unwrap().interests, expected);
}

#[test]
fn transient_server_errors_are_retried() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();
    let engine = open(&server, dir.path(), &events);

    engine.start("tok-1").unwrap();
    engine.wait_idle(WAIT).unwrap();

    server.fail_next(503);
    server.fail_next(502);
    engine.subscribe("a").unwrap();
    engine.wait_idle(WAIT).unwrap();

    let device_id = engine.device_id().unwrap();
    assert_eq!(server.device(&device_id).unwrap().interests, set(&["a"]));
}

#[test]
fn user_limit_is_reported() {
    init_tracing();
    let server = Arc::new(DirectoryServer::new(
        ServerConfig::default().with_max_devices_per_user(1),
    ));
    let first_dir = tempdir().unwrap();
    let second_dir = tempdir().unwrap();
    let first_events = MemoryEventSink::new();
    let second_events = MemoryEventSink::new();

    let first = open(&server, first_dir.path(), &first_events);
    first.start("tok-1").unwrap();
    first.set_user_id("alice").unwrap();
    first.wait_idle(WAIT).unwrap();
    assert_eq!(first_events.bindings(), vec![("alice".to_string(), None)]);

    let second = open(&server, second_dir.path(), &second_events);
    second.start("tok-2").unwrap();
    second.set_user_id("alice").unwrap();
    second.wait_idle(WAIT).unwrap();

    let bindings = second_events.bindings();
    assert_eq!(bindings.len(), 1);
    assert!(matches!(bindings[0].1, Some(BindingError::TooManyDevices(_))));
    assert_eq!(second.user_id(), None);
}

#[test]
fn forged_user_token_is_rejected() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();
    let forged: Arc<dyn TokenProvider> =
        Arc::new(|user: &str| -> Result<String, String> { Ok(format!("{user}.00ff")) });
    let engine = SyncEngine::open(
        config(),
        connect(&server),
        dir.path(),
        Arc::new(events.clone()),
        Some(forged),
    )
    .unwrap();

    engine.start("tok-1").unwrap();
    engine.set_user_id("alice").unwrap();
    engine.wait_idle(WAIT).unwrap();

    let bindings = events.bindings();
    assert_eq!(bindings.len(), 1);
    assert!(matches!(bindings[0].1, Some(BindingError::TokenRejected(_))));
    assert_eq!(engine.user_id(), None);
}

#[test]
fn application_start_reports_new_metadata() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();
    let engine = open(&server, dir.path(), &events);

    engine.start("tok-1").unwrap();
    engine.wait_idle(WAIT).unwrap();
    let before = server.request_count();

    let upgraded = DeviceMetadata::new("1.1.0", "15");
    engine.application_start(upgraded.clone()).unwrap();
    engine.application_start(upgraded.clone()).unwrap();
    engine.wait_idle(WAIT).unwrap();

    let device_id = engine.device_id().unwrap();
    assert_eq!(server.device(&device_id).unwrap().metadata, upgraded);
    assert_eq!(server.request_count(), before + 1);
}

#[test]
fn user_token_from_host_auth_endpoint() {
    init_tracing();
    let server = Arc::new(DirectoryServer::default());
    let dir = tempdir().unwrap();
    let events = MemoryEventSink::new();

    // The host backend signs tokens only for requests carrying its session.
    let issuer = Arc::clone(&server);
    let auth = LoopbackClient::new(move |request: &HttpRequest| {
        let session = request
            .headers
            .iter()
            .any(|(name, value)| name == "Cookie" && value == "session=abc");
        let user = request
            .url
            .split_once("user_id=")
            .map(|(_, rest)| rest.split('&').next().unwrap_or_default());
        match (session, user) {
            (true, Some(user)) => HttpResponse {
                status: 200,
                body: issuer.token_for(user).into_bytes(),
            },
            _ => HttpResponse::empty(401),
        }
    });
    let provider: Arc<dyn TokenProvider> = Arc::new(HttpTokenProvider::new(
        "https://app.test/pusher/beams-auth",
        auth,
        || AuthData::new().with_header("Cookie", "session=abc"),
    ));

    let engine = SyncEngine::open(
        config(),
        connect(&server),
        dir.path(),
        Arc::new(events.clone()),
        Some(provider),
    )
    .unwrap();
    engine.start("tok-1").unwrap();
    engine.set_user_id("alice").unwrap();
    engine.wait_idle(WAIT).unwrap();

    assert_eq!(events.bindings(), vec![("alice".to_string(), None)]);
    let device_id = engine.device_id().unwrap();
    assert_eq!(
        server.device(&device_id).unwrap().user_id.as_deref(),
        Some("alice")
    );
}

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use apiforge_common::protocol::ws::RelayWsMessage;
use apiforge_common::types::{
    job_event_key, ExecutionAgent, RelayMessage, RelayMessageKind,
};
use apiforge_syncd::auth::JwtIdentityService;
use apiforge_syncd::gateway::ExternalWriteGateway;
use apiforge_syncd::relay::{EventBroker, JobRecord, MemoryJobEventStore, RelayService};
use apiforge_syncd::scope::{MemoryScopeDirectory, ScopeDirectory};
use apiforge_syncd::session::SessionRegistry;
use apiforge_syncd::store::UpdateLogStore;
use apiforge_syncd::ws;

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const TEST_SECRET: &str = "apiforge_test_secret_that_is_definitely_long_enough";

struct TestServer {
    addr: std::net::SocketAddr,
    identity: Arc<JwtIdentityService>,
    jobs: MemoryJobEventStore,
    relay: Arc<RelayService>,
    server_task: tokio::task::JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let identity =
        Arc::new(JwtIdentityService::new(TEST_SECRET).expect("test jwt service should initialize"));
    let store = Arc::new(UpdateLogStore::open_in_memory().expect("store should open"));
    let registry = Arc::new(SessionRegistry::new(store, 400));
    let scopes: Arc<dyn ScopeDirectory> = Arc::new(MemoryScopeDirectory::new());
    let jobs = MemoryJobEventStore::new();
    let relay = Arc::new(RelayService::new(
        Arc::new(jobs.clone()),
        Arc::new(EventBroker::new()),
    ));
    let gateway = Arc::new(ExternalWriteGateway::new(
        Arc::clone(&identity),
        Arc::clone(&scopes),
        Arc::clone(&registry),
    ));

    let app = ws::router(ws::AppState {
        identity: Arc::clone(&identity),
        scopes,
        registry,
        gateway,
        relay: Arc::clone(&relay),
    });
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay ws server should run");
    });

    TestServer { addr, identity, jobs, relay, server_task }
}

fn event(time: i64, kind: RelayMessageKind, seq: u64) -> serde_json::Value {
    serde_json::to_value(RelayMessage { time, kind, message: json!({"seq": seq}) })
        .expect("relay message should serialize")
}

async fn recv_frame(socket: &mut ClientSocket) -> RelayWsMessage {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for relay frame");
        let message =
            next.expect("websocket should remain open").expect("websocket read should succeed");
        match message {
            WsMessage::Text(raw) => {
                return serde_json::from_str(raw.as_str()).expect("relay frame should decode");
            }
            WsMessage::Ping(payload) => {
                socket
                    .send(WsMessage::Pong(payload))
                    .await
                    .expect("websocket should reply to ping");
            }
            WsMessage::Close(_) => panic!("websocket closed while expecting a frame"),
            WsMessage::Binary(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

#[tokio::test]
async fn subscriber_sees_history_then_live_events_exactly_once() {
    let server = start_server().await;
    let job_id = Uuid::new_v4();
    let scope_key = "team:team-42".to_string();
    server
        .jobs
        .register_job(JobRecord {
            job_id,
            scope_key: scope_key.clone(),
            agent: ExecutionAgent::Local,
        })
        .await;

    let job_key = job_event_key(ExecutionAgent::Local, &scope_key, &job_id.to_string());
    for seq in 1..=2 {
        server
            .relay
            .publish(&job_key, event(1000 + seq as i64, RelayMessageKind::Progress, seq))
            .await
            .expect("publish should succeed");
    }

    let token = server
        .identity
        .issue_scope_token(Uuid::new_v4(), &scope_key)
        .expect("token should issue");
    let (mut socket, _) = connect_async(format!(
        "ws://{}/jobs/{}?agent=local&token={}",
        server.addr, job_id, token
    ))
    .await
    .expect("subscriber should connect");

    let mut observed = Vec::new();
    for _ in 0..2 {
        match recv_frame(&mut socket).await {
            RelayWsMessage::Updates { payload } => observed.push(payload),
            RelayWsMessage::Error { code, .. } => panic!("unexpected error frame: {code}"),
        }
    }

    // A replay of history entry 1 plus one genuinely new event.
    server.relay.publish(&job_key, event(1001, RelayMessageKind::Progress, 1)).await.unwrap();
    server.relay.publish(&job_key, event(1003, RelayMessageKind::Metrics, 3)).await.unwrap();

    match recv_frame(&mut socket).await {
        RelayWsMessage::Updates { payload } => observed.push(payload),
        RelayWsMessage::Error { code, .. } => panic!("unexpected error frame: {code}"),
    }

    let times: Vec<i64> = observed.iter().map(|message| message.time).collect();
    assert_eq!(times, vec![1001, 1002, 1003], "duplicate live replay must be filtered");

    let _ = socket.close(None).await;
    server.server_task.abort();
}

#[tokio::test]
async fn foreign_scope_subscriber_gets_an_error_frame_and_no_data() {
    let server = start_server().await;
    let job_id = Uuid::new_v4();
    let scope_key = "team:team-42".to_string();
    server
        .jobs
        .register_job(JobRecord {
            job_id,
            scope_key: scope_key.clone(),
            agent: ExecutionAgent::Cloud,
        })
        .await;

    let job_key = job_event_key(ExecutionAgent::Cloud, &scope_key, &job_id.to_string());
    server
        .relay
        .publish(&job_key, event(1000, RelayMessageKind::Progress, 1))
        .await
        .expect("publish should succeed");

    let foreign_token = server
        .identity
        .issue_scope_token(Uuid::new_v4(), "team:other")
        .expect("token should issue");
    let (mut socket, _) = connect_async(format!(
        "ws://{}/jobs/{}?agent=cloud&token={}",
        server.addr, job_id, foreign_token
    ))
    .await
    .expect("upgrade succeeds, authorization happens on the stream");

    match recv_frame(&mut socket).await {
        RelayWsMessage::Error { code, retryable, .. } => {
            assert_eq!(code, "AUTH_FORBIDDEN");
            assert!(!retryable);
        }
        RelayWsMessage::Updates { .. } => panic!("job data must not leak to a foreign scope"),
    }

    // Server closes after the error frame.
    let next = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("timed out waiting for close");
    assert!(
        matches!(next, Some(Ok(WsMessage::Close(_))) | None),
        "connection should close after the error frame"
    );

    server.server_task.abort();
}

#[tokio::test]
async fn unknown_job_reports_not_found() {
    let server = start_server().await;
    let token = server
        .identity
        .issue_scope_token(Uuid::new_v4(), "team:team-42")
        .expect("token should issue");

    let (mut socket, _) = connect_async(format!(
        "ws://{}/jobs/{}?agent=local&token={}",
        server.addr,
        Uuid::new_v4(),
        token
    ))
    .await
    .expect("subscriber should connect");

    match recv_frame(&mut socket).await {
        RelayWsMessage::Error { code, .. } => assert_eq!(code, "JOB_NOT_FOUND"),
        RelayWsMessage::Updates { .. } => panic!("unknown job must not produce data"),
    }

    server.server_task.abort();
}

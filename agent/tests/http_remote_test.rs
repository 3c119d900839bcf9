//! HTTP transport tests against a local mock of the realtime database.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tally_agent::{HttpRemote, RemoteError, RemoteStore};
use tally_engine::{Document, PathPatch, DEFAULT_USERS};
use tokio::net::TcpListener;

#[derive(Debug, Default)]
struct Recorded {
    stored: Value,
    put: Option<Value>,
    patch: Option<Value>,
    auth: Vec<Option<String>>,
    fail: bool,
}

type Shared = Arc<Mutex<Recorded>>;

fn record_auth(state: &Shared, query: &HashMap<String, String>) {
    state.lock().unwrap().auth.push(query.get("auth").cloned());
}

async fn read(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    record_auth(&state, &query);
    let recorded = state.lock().unwrap();
    if recorded.fail {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(recorded.stored.clone()))
}

async fn put(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    record_auth(&state, &query);
    let mut recorded = state.lock().unwrap();
    recorded.stored = body.clone();
    recorded.put = Some(body.clone());
    Json(body)
}

async fn patch(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    record_auth(&state, &query);
    state.lock().unwrap().patch = Some(body.clone());
    Json(body)
}

/// Start the mock and return its base URL.
async fn serve(state: Shared) -> String {
    let app = Router::new()
        .route("/pointSystemV3.json", get(read).put(put))
        .route("/.json", axum::routing::patch(patch))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn null_document_reads_as_absent() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let remote = HttpRemote::new(base, "pointSystemV3", None);

    assert_eq!(remote.read_document().await.unwrap(), None);
    assert_eq!(state.lock().unwrap().auth, vec![None]);
}

#[tokio::test]
async fn document_round_trips_through_put_and_get() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let remote = HttpRemote::new(base, "pointSystemV3", Some("secret".into()));

    let mut doc = Document::with_users(&DEFAULT_USERS);
    doc.stamp_sync("2024-01-02T00:00:00.000Z");
    remote.write_document(&doc).await.unwrap();

    let put = state.lock().unwrap().put.clone().unwrap();
    assert_eq!(put["system"]["lastSync"], json!("2024-01-02T00:00:00.000Z"));

    let read = remote.read_document().await.unwrap().unwrap();
    assert_eq!(Document::from_value(read).unwrap(), doc);
    assert!(state
        .lock()
        .unwrap()
        .auth
        .iter()
        .all(|a| a.as_deref() == Some("secret")));
}

#[tokio::test]
async fn multi_path_update_is_rooted() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let remote = HttpRemote::new(base, "pointSystemV3", None);

    let mut paths = PathPatch::new();
    paths.insert("points/user77".into(), json!({"total": 91, "weekly": 20}));
    paths.insert("system/lastSync".into(), json!("2024-01-02T23:00:00.000Z"));
    remote.write_paths(&paths).await.unwrap();

    let body = state.lock().unwrap().patch.clone().unwrap();
    assert_eq!(
        body,
        json!({
            "pointSystemV3/points/user77": {"total": 91, "weekly": 20},
            "pointSystemV3/system/lastSync": "2024-01-02T23:00:00.000Z"
        })
    );
}

#[tokio::test]
async fn empty_patch_sends_nothing() {
    let state = Shared::default();
    let base = serve(state.clone()).await;
    let remote = HttpRemote::new(base, "pointSystemV3", None);

    remote.write_paths(&PathPatch::new()).await.unwrap();
    assert!(state.lock().unwrap().auth.is_empty());
}

#[tokio::test]
async fn error_status_is_reported() {
    let state = Shared::default();
    state.lock().unwrap().fail = true;
    let base = serve(state.clone()).await;
    let remote = HttpRemote::new(base, "pointSystemV3", None);

    match remote.read_document().await {
        Err(RemoteError::Status { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let remote = HttpRemote::new(format!("http://{addr}"), "pointSystemV3", None);
    assert!(matches!(
        remote.read_document().await,
        Err(RemoteError::Unavailable(_))
    ));
}

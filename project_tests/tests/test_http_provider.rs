//! `HttpProvider` against an in-process axum server speaking the provider's
//! `webapi` protocol.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_fleetsync::core::ValidationError;
use lib_fleetsync::{HttpProvider, SyncError, TrackingProvider};
use project_tests::credentials;

type Seen = Arc<Mutex<Vec<(String, Value)>>>;

const TOKEN: &str = "tok-1";

async fn webapi(State(seen): State<Seen>, Query(query): Query<HashMap<String, String>>, Json(body): Json<Value>) -> Response {
    let action = query.get("action").cloned().unwrap_or_default();
    seen.lock().unwrap().push((action.clone(), body.clone()));

    if action != "login" && query.get("token").map(String::as_str) != Some(TOKEN) {
        return Json(json!({"status": 10012, "cause": "Token expired"})).into_response();
    }

    let reply = match action.as_str() {
        "login" if body["password"] == credentials().password_hash => json!({"status": 0, "token": TOKEN}),
        "login" => json!({"status": 1, "cause": "wrong password"}),
        "querymonitorlist" => json!({
            "status": 0,
            "groups": [
                {"groupid": 1, "groupname": "North", "devices": [
                    {"deviceid": 1001, "devicename": "Van 1", "devicetype": 3,
                     "lastactivetime": 1_700_000_000_000i64, "assigned": 1},
                    {"deviceid": "1002", "devicename": "", "assigned": false}
                ]},
                {"groupid": "2", "groupname": "South", "devices": [
                    {"deviceid": "1001", "devicename": "Duplicate"}
                ]}
            ]
        }),
        "lastposition" => json!({
            "status": 0,
            "lastquerypositiontime": 174_500,
            "records": [
                {"deviceid": 1001, "lat": 48.1, "lng": "2.3", "speed": 12, "heading": 180,
                 "moving": 1, "acc": 1, "updatetime": 1_700_000_100_000i64, "alarm": 0},
                {"deviceid": "1002", "speed": 0, "updatetime": 1_700_000_100_000i64}
            ]
        }),
        _ => return (StatusCode::NOT_FOUND, "unknown action").into_response(),
    };
    Json(reply).into_response()
}

async fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response()
}

async fn locked() -> Response {
    (StatusCode::UNAUTHORIZED, "locked").into_response()
}

async fn spawn_server() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/tracker/webapi", post(webapi))
        .route("/down/webapi", post(unavailable))
        .route("/locked/webapi", post(locked))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base, seen)
}

fn provider(base: &str, path: &str) -> HttpProvider {
    HttpProvider::new(&format!("{base}/{path}"), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn full_session_round_trip() {
    let (base, seen) = spawn_server().await;
    let provider = provider(&base, "tracker");
    let creds = credentials();

    let token = provider.login(&creds).await.unwrap();
    assert_eq!(token, TOKEN);

    let devices = provider.query_monitor_list(&token, &creds.username).await.unwrap();
    assert_eq!(devices.len(), 2, "duplicates across groups are dropped");
    assert_eq!(devices[0].id, "1001");
    assert_eq!(devices[0].name, "Van 1");
    assert_eq!(devices[0].group.as_deref(), Some("North"));
    assert!(devices[0].assigned);
    assert!(devices[0].last_active.is_some());
    assert_eq!(devices[1].name, "1002", "blank names fall back to the id");

    let ids = vec!["1001".to_string(), "1002".to_string()];
    let page = provider.last_position(&token, &ids, 173_000).await.unwrap();
    assert_eq!(page.cursor, Some(174_500));
    assert_eq!(page.positions.len(), 1);
    let fix = &page.positions[0];
    assert_eq!(fix.device_id, "1001");
    assert_eq!(fix.longitude, 2.3);
    assert!(fix.moving);
    assert_eq!(fix.ignition, Some(true));
    assert_eq!(fix.alarm, None);
    assert_eq!(page.rejected.len(), 1);
    assert_eq!(page.rejected[0].reason, ValidationError::MissingCoordinates);

    let seen = seen.lock().unwrap().clone();
    let actions: Vec<&str> = seen.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(actions, ["login", "querymonitorlist", "lastposition"]);
    assert_eq!(seen[0].1["type"], "USER");
    assert_eq!(seen[0].1["from"], "WEB");
    assert_eq!(seen[1].1["username"], creds.username.as_str());
    assert_eq!(seen[2].1["lastquerypositiontime"], 173_000);
    assert_eq!(seen[2].1["deviceids"], json!(["1001", "1002"]));
}

#[tokio::test]
async fn wrong_password_and_stale_token_are_auth_errors() {
    let (base, _seen) = spawn_server().await;
    let provider = provider(&base, "tracker");
    let mut creds = credentials();
    creds.password_hash = "ffffffffffffffffffffffffffffffff".into();

    assert!(matches!(provider.login(&creds).await, Err(SyncError::Auth(_))));
    assert!(matches!(
        provider.query_monitor_list("expired", &creds.username).await,
        Err(SyncError::Auth(_))
    ));
}

#[tokio::test]
async fn http_failures_map_onto_the_error_taxonomy() {
    let (base, _seen) = spawn_server().await;
    let creds = credentials();

    assert!(matches!(
        provider(&base, "down").login(&creds).await,
        Err(SyncError::ServerError(_))
    ));
    assert!(matches!(
        provider(&base, "locked").login(&creds).await,
        Err(SyncError::Auth(_))
    ));

    // Nothing listens on port 1.
    let refused = HttpProvider::new("http://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
    assert!(matches!(refused.login(&creds).await, Err(SyncError::Network(_))));
}

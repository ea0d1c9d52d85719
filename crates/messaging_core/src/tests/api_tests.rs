use super::*;
use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::{domain::UserId, error::ErrorCode};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    seen_auth: Arc<Mutex<Vec<String>>>,
    seen_pages: Arc<Mutex<Vec<HashMap<String, String>>>>,
    posted: Arc<Mutex<Vec<Value>>>,
    read: Arc<Mutex<Vec<String>>>,
}

async fn handle_threads(State(state): State<ServerState>, headers: HeaderMap) -> Json<Value> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.seen_auth.lock().await.push(auth.to_string());
    }
    Json(json!({
        "data": {
            "current_page": 1,
            "data": [{
                "id": 14,
                "other_user": {"id": "2", "full_name": "Ms. Rivera", "role": "tutor"},
                "latest_message": {
                    "id": 12, "message": "See you Friday", "sender_id": 2,
                    "is_read": 0, "created_at": "2024-03-01 09:10:00"
                },
                "unread_count": 2
            }]
        }
    }))
}

async fn handle_messages(
    State(state): State<ServerState>,
    Path(thread_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.seen_pages.lock().await.push(params);
    Json(json!({
        "messages": [{
            "id": 12, "thread_id": thread_id, "sender_id": 2, "recipient_id": 1,
            "message": "See you Friday", "is_read": true,
            "created_at": "2024-03-01T09:10:00Z"
        }]
    }))
}

async fn handle_create(
    State(state): State<ServerState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.posted.lock().await.push(body.clone());
    if body["body"] == "" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"message": "The given data was invalid.", "errors": {"body": ["required"]}})),
        );
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": {
                "id": "900", "thread_id": 14, "sender_id": 1, "recipient_id": body["recipient_id"],
                "message": body["body"], "created_at": "2024-03-01T09:20:00Z",
                "attachments": [{"id": 3, "filename": "worksheet.pdf", "path": "uploads/ws.pdf", "size": 8}]
            }
        })),
    )
}

async fn handle_read(State(state): State<ServerState>, Path(id): Path<String>) -> StatusCode {
    state.read.lock().await.push(id);
    StatusCode::NO_CONTENT
}

async fn handle_download(Query(params): Query<HashMap<String, String>>) -> (StatusCode, Vec<u8>) {
    match params.get("path").map(String::as_str) {
        Some("uploads/ws.pdf") => (StatusCode::OK, b"%PDF-1.7".to_vec()),
        _ => (StatusCode::NOT_FOUND, b"missing".to_vec()),
    }
}

async fn spawn_api_server() -> Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/messages/threads", get(handle_threads))
        .route("/api/messages/threads/:id", get(handle_messages))
        .route("/api/messages", post(handle_create))
        .route("/api/messages/:id/read", post(handle_read))
        .route("/api/files/download", get(handle_download))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), state))
}

#[test]
fn unwraps_nested_data_envelopes() {
    let body = json!({"data": {"data": [{"id": 1}], "total": 1}});
    assert_eq!(unwrap_envelope(body, THREAD_LIST_KEYS), json!([{"id": 1}]));
}

#[test]
fn unwraps_named_keys() {
    let body = json!({"success": true, "data": {"conversations": [{"id": 1}]}});
    assert_eq!(unwrap_envelope(body, THREAD_LIST_KEYS), json!([{"id": 1}]));
}

#[test]
fn leaves_message_text_field_alone() {
    let bare = json!({"id": 5, "message": "hello", "sender_id": 1});
    assert_eq!(unwrap_envelope(bare.clone(), MESSAGE_KEYS), bare);
}

#[test]
fn rejects_non_http_base_url() {
    assert!(HttpMessagingApi::new("ws://127.0.0.1/api", None).is_err());
    assert!(HttpMessagingApi::new("not a url", None).is_err());
}

#[tokio::test]
async fn lists_threads_through_paginated_envelope() {
    let (base_url, state) = spawn_api_server().await.expect("spawn server");
    let api = HttpMessagingApi::new(&base_url, Some("secret".into())).expect("api");

    let threads = api.list_threads().await.expect("threads");

    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].thread_id, ThreadId::new("14"));
    assert_eq!(threads[0].participant.id, UserId(2));
    assert_eq!(threads[0].participant.name, "Ms. Rivera");
    assert_eq!(threads[0].unread_count, 2);
    let last = threads[0].last_message.as_ref().expect("last message");
    assert_eq!(last.body, "See you Friday");
    assert!(!last.is_read);
    assert_eq!(state.seen_auth.lock().await.as_slice(), ["Bearer secret"]);
}

#[tokio::test]
async fn lists_messages_with_page_params() {
    let (base_url, state) = spawn_api_server().await.expect("spawn server");
    let api = HttpMessagingApi::new(&base_url, None).expect("api");

    let messages = api
        .list_messages(&ThreadId::new("14"), PageParams { page: 2, per_page: 25 })
        .await
        .expect("messages");

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, Some(MessageId(12)));
    assert_eq!(messages[0].thread_id, Some(ThreadId::new("14")));
    assert!(messages[0].is_read);
    let pages = state.seen_pages.lock().await;
    assert_eq!(pages[0].get("page").map(String::as_str), Some("2"));
    assert_eq!(pages[0].get("per_page").map(String::as_str), Some("25"));
}

#[tokio::test]
async fn create_message_returns_persisted_copy() {
    let (base_url, state) = spawn_api_server().await.expect("spawn server");
    let api = HttpMessagingApi::new(&base_url, None).expect("api");

    let created = api
        .create_message(CreateMessageRequest {
            recipient_id: UserId(2),
            subject: None,
            body: "Hi".into(),
            thread_id: Some(ThreadId::new("14")),
            attachments: Vec::new(),
        })
        .await
        .expect("create");

    assert_eq!(created.id, Some(MessageId(900)));
    assert_eq!(created.body, "Hi");
    assert_eq!(created.attachments[0].file_path, "uploads/ws.pdf");
    let posted = state.posted.lock().await;
    assert_eq!(posted[0]["recipient_id"], json!(2));
    assert!(posted[0].get("subject").is_none());
}

#[tokio::test]
async fn validation_failure_maps_to_api_error() {
    let (base_url, _state) = spawn_api_server().await.expect("spawn server");
    let api = HttpMessagingApi::new(&base_url, None).expect("api");

    let err = api
        .create_message(CreateMessageRequest {
            recipient_id: UserId(2),
            subject: None,
            body: String::new(),
            thread_id: None,
            attachments: Vec::new(),
        })
        .await
        .expect_err("validation error");

    let api_error = err.downcast_ref::<ApiError>().expect("api error");
    assert_eq!(api_error.status, 422);
    assert_eq!(api_error.code, ErrorCode::Validation);
    assert!(api_error.message.contains("body: required"));
}

#[tokio::test]
async fn marks_read_and_downloads_files() {
    let (base_url, state) = spawn_api_server().await.expect("spawn server");
    let api = HttpMessagingApi::new(&base_url, None).expect("api");

    api.mark_read(MessageId(12)).await.expect("mark read");
    assert_eq!(state.read.lock().await.as_slice(), ["12"]);

    let bytes = api.download_file("uploads/ws.pdf").await.expect("download");
    assert_eq!(bytes, b"%PDF-1.7");

    let missing = api.download_file("uploads/nope.pdf").await.expect_err("missing");
    assert_eq!(
        missing.downcast_ref::<ApiError>().map(|e| e.code),
        Some(ErrorCode::NotFound)
    );
}

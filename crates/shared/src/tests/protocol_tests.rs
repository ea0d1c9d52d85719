use super::*;
use serde_json::json;

#[test]
fn message_payload_accepts_backend_variants() {
    let payload: MessagePayload = serde_json::from_value(json!({
        "id": "77",
        "thread_id": 9,
        "sender_id": "3",
        "recipient_id": 4,
        "message": "See you Friday",
        "is_read": 0,
        "created_at": "2024-03-01 09:30:00",
        "attachments": [
            {"id": 1, "original_name": "notes.pdf", "path": "attachments/notes.pdf", "size": 2048, "mime_type": "application/pdf"}
        ]
    }))
    .expect("payload");

    assert_eq!(payload.id, Some(MessageId(77)));
    assert_eq!(payload.thread_id, Some(ThreadId::new("9")));
    assert_eq!(payload.sender_id, UserId(3));
    assert_eq!(payload.body, "See you Friday");
    assert!(!payload.is_read);
    assert_eq!(payload.created_at.to_rfc3339(), "2024-03-01T09:30:00+00:00");
    assert_eq!(payload.attachments[0].file_name, "notes.pdf");
    assert_eq!(payload.attachments[0].file_size, 2048);
}

#[test]
fn message_payload_without_id_still_parses() {
    let payload: MessagePayload = serde_json::from_value(json!({
        "sender_id": 3,
        "recipient_id": 4,
        "body": "hello",
        "is_read": "1",
        "created_at": "2024-03-01T09:30:00.000000Z"
    }))
    .expect("payload");
    assert!(payload.id.is_none());
    assert!(payload.is_read);
}

#[test]
fn thread_summary_reads_aliases() {
    let summary: ThreadSummary = serde_json::from_value(json!({
        "id": "A",
        "other_user": {"id": 8, "full_name": "Ms. Rivera", "role": "tutor"},
        "latest_message": {
            "id": 12,
            "body": "See you Friday",
            "sender_id": 8,
            "is_read": true,
            "created_at": "2024-03-01T09:30:00Z"
        },
        "unread_count": 2
    }))
    .expect("summary");
    assert_eq!(summary.thread_id.as_str(), "A");
    assert_eq!(summary.participant.name, "Ms. Rivera");
    assert_eq!(summary.participant.role, Some(Role::Tutor));
    assert_eq!(summary.unread_count, 2);
    assert_eq!(summary.last_message.map(|m| m.id), Some(MessageId(12)));
}

#[test]
fn message_payload_accepts_unix_timestamps() {
    let payload: MessagePayload = serde_json::from_value(json!({
        "id": 7,
        "sender_id": 1,
        "recipient_id": 2,
        "body": "x",
        "created_at": 1700000000
    }))
    .expect("numeric timestamp");
    assert_eq!(payload.created_at.to_rfc3339(), "2023-11-14T22:13:20+00:00");

    assert_eq!(
        parse_timestamp("1700000000").map(|ts| ts.timestamp()),
        Ok(1700000000)
    );
    assert!(serde_json::from_value::<MessagePayload>(json!({
        "id": 7,
        "sender_id": 1,
        "recipient_id": 2,
        "body": "x",
        "created_at": i64::MAX
    }))
    .is_err());
}

#[test]
fn rejects_garbage_timestamp() {
    assert!(parse_timestamp("next tuesday").is_err());
}

#[test]
fn create_request_omits_empty_optionals() {
    let request = CreateMessageRequest {
        recipient_id: UserId(4),
        subject: None,
        body: "Hi".into(),
        thread_id: None,
        attachments: Vec::new(),
    };
    let value = serde_json::to_value(&request).expect("serialize");
    assert_eq!(value, json!({"recipient_id": 4, "body": "Hi"}));
}

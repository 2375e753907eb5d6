//! Tests for `src/store/writer.rs`: idempotent upserts and forward-only status.

use wabridge::store::{ChatUpsert, UpsertOutcome};
use wabridge::types::{
    ContentKind, DeliveryStatus, Direction, MediaReference, Message,
};

use crate::support::{memory_store, ts};

fn message(chat: &str, id: &str, minute: u32, status: DeliveryStatus) -> Message {
    Message {
        chat_jid: chat.to_owned(),
        id: id.to_owned(),
        sender: "4915112345678@s.whatsapp.net".to_owned(),
        timestamp: ts(minute),
        direction: Direction::Inbound,
        kind: ContentKind::Text,
        text: Some(format!("message {id}")),
        media: None,
        status,
    }
}

#[tokio::test]
async fn duplicate_key_is_stored_once() {
    let store = memory_store().await;
    let first = store
        .upsert_message(message("123@g.us", "abc", 0, DeliveryStatus::Sent), None)
        .await
        .expect("first upsert");
    let second = store
        .upsert_message(message("123@g.us", "abc", 0, DeliveryStatus::Sent), None)
        .await
        .expect("second upsert");

    assert_eq!(first, UpsertOutcome::Inserted);
    assert_eq!(second, UpsertOutcome::Unchanged);
    let stats = store.stats().await.expect("stats");
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.chats, 1);
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let store = memory_store().await;
    for status in [
        DeliveryStatus::Sent,
        DeliveryStatus::Delivered,
        DeliveryStatus::Sent,
    ] {
        store
            .upsert_message(message("123@g.us", "abc", 0, status), None)
            .await
            .expect("upsert");
    }

    let stored = store
        .get_message("123@g.us", "abc")
        .await
        .expect("read")
        .expect("message present");
    assert_eq!(stored.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn final_status_is_the_maximum_in_any_order() {
    let orders = [
        [DeliveryStatus::Read, DeliveryStatus::Sent, DeliveryStatus::Delivered],
        [DeliveryStatus::Delivered, DeliveryStatus::Read, DeliveryStatus::Sent],
        [DeliveryStatus::Sent, DeliveryStatus::Delivered, DeliveryStatus::Read],
    ];
    for order in orders {
        let store = memory_store().await;
        store
            .upsert_message(message("a@s.whatsapp.net", "m1", 0, order[0]), None)
            .await
            .expect("insert");
        for status in &order[1..] {
            store
                .merge_status("a@s.whatsapp.net", "m1", *status)
                .await
                .expect("merge");
        }
        let stored = store
            .get_message("a@s.whatsapp.net", "m1")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(stored.status, DeliveryStatus::Read, "order {order:?}");
    }
}

#[tokio::test]
async fn upsert_reports_status_advance() {
    let store = memory_store().await;
    store
        .upsert_message(message("a@s.whatsapp.net", "m1", 0, DeliveryStatus::Sent), None)
        .await
        .expect("insert");
    let outcome = store
        .upsert_message(message("a@s.whatsapp.net", "m1", 0, DeliveryStatus::Read), None)
        .await
        .expect("upsert");
    assert_eq!(outcome, UpsertOutcome::StatusAdvanced);
}

#[tokio::test]
async fn early_status_is_held_until_the_message_arrives() {
    let store = memory_store().await;
    for status in [DeliveryStatus::Read, DeliveryStatus::Delivered] {
        let changed = store
            .merge_status("a@s.whatsapp.net", "early", status)
            .await
            .expect("merge");
        assert!(!changed);
    }
    assert_eq!(store.stats().await.expect("stats").messages, 0);

    store
        .upsert_message(message("a@s.whatsapp.net", "early", 0, DeliveryStatus::Sent), None)
        .await
        .expect("insert");

    let stored = store
        .get_message("a@s.whatsapp.net", "early")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.status, DeliveryStatus::Read);
    let held: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_status")
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(held, 0, "held rank is consumed on insert");
}

#[tokio::test]
async fn held_status_never_lowers_a_higher_inserted_status() {
    let store = memory_store().await;
    store
        .merge_status("a@s.whatsapp.net", "m", DeliveryStatus::Delivered)
        .await
        .expect("merge");

    store
        .upsert_message(message("a@s.whatsapp.net", "m", 0, DeliveryStatus::Read), None)
        .await
        .expect("insert");

    let stored = store
        .get_message("a@s.whatsapp.net", "m")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.status, DeliveryStatus::Read);
}

#[tokio::test]
async fn chat_name_survives_later_unnamed_upserts() {
    let store = memory_store().await;
    store
        .upsert_message(
            message("123@g.us", "m1", 0, DeliveryStatus::Delivered),
            Some("Family".to_owned()),
        )
        .await
        .expect("first");
    store
        .upsert_message(message("123@g.us", "m2", 5, DeliveryStatus::Delivered), None)
        .await
        .expect("second");
    store
        .upsert_chat(ChatUpsert {
            name: Some(String::new()),
            ..ChatUpsert::new("123@g.us")
        })
        .await
        .expect("blank rename");

    let chat = store
        .get_chat("123@g.us", false)
        .await
        .expect("read")
        .expect("chat present");
    assert_eq!(chat.name.as_deref(), Some("Family"));
    assert!(chat.is_group);
    assert_eq!(chat.last_activity, Some(ts(5)));
}

#[tokio::test]
async fn last_activity_only_moves_forward() {
    let store = memory_store().await;
    store
        .upsert_message(message("a@s.whatsapp.net", "late", 30, DeliveryStatus::Delivered), None)
        .await
        .expect("late");
    store
        .upsert_message(message("a@s.whatsapp.net", "early", 1, DeliveryStatus::Delivered), None)
        .await
        .expect("early");

    let chat = store
        .get_chat("a@s.whatsapp.net", true)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(chat.last_activity, Some(ts(30)));
    assert_eq!(
        chat.last_message.map(|m| m.id).as_deref(),
        Some("late")
    );
}

#[tokio::test]
async fn group_participants_are_replaced_only_when_given() {
    let store = memory_store().await;
    store
        .upsert_chat(ChatUpsert {
            name: Some("Team".to_owned()),
            participants: Some(vec!["1@s.whatsapp.net".to_owned(), "2@s.whatsapp.net".to_owned()]),
            ..ChatUpsert::new("555@g.us")
        })
        .await
        .expect("group");
    store
        .upsert_chat(ChatUpsert::new("555@g.us"))
        .await
        .expect("touch");

    let chat = store
        .get_chat("555@g.us", false)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(chat.participants.len(), 2);
}

#[tokio::test]
async fn media_local_path_is_set_once() {
    let store = memory_store().await;
    let mut msg = message("a@s.whatsapp.net", "img", 0, DeliveryStatus::Delivered);
    msg.kind = ContentKind::Image;
    msg.media = Some(MediaReference {
        locator: b"loc".to_vec(),
        mime_type: "image/jpeg".to_owned(),
        file_name: None,
        size: Some(3),
        local_path: None,
    });
    store.upsert_message(msg, None).await.expect("insert");

    let first = store
        .set_media_local_path("a@s.whatsapp.net", "img", "/tmp/one.jpg".into())
        .await
        .expect("first");
    let second = store
        .set_media_local_path("a@s.whatsapp.net", "img", "/tmp/two.jpg".into())
        .await
        .expect("second");
    assert!(first);
    assert!(!second);

    let media = store
        .media_reference("a@s.whatsapp.net", "img")
        .await
        .expect("read")
        .expect("reference present");
    assert_eq!(media.local_path, Some("/tmp/one.jpg".into()));
    assert_eq!(media.locator, b"loc".to_vec());
    let stats = store.stats().await.expect("stats");
    assert_eq!((stats.media, stats.media_downloaded), (1, 1));
}

#[tokio::test]
async fn record_media_reference_does_not_overwrite() {
    let store = memory_store().await;
    store
        .upsert_message(message("a@s.whatsapp.net", "m1", 0, DeliveryStatus::Delivered), None)
        .await
        .expect("insert");
    let reference = MediaReference {
        locator: b"first".to_vec(),
        mime_type: "audio/ogg".to_owned(),
        file_name: None,
        size: None,
        local_path: None,
    };
    let first = store
        .record_media_reference("a@s.whatsapp.net", "m1", reference.clone())
        .await
        .expect("first");
    let second = store
        .record_media_reference(
            "a@s.whatsapp.net",
            "m1",
            MediaReference {
                locator: b"second".to_vec(),
                ..reference
            },
        )
        .await
        .expect("second");
    assert!(first);
    assert!(!second);
    let stored = store
        .media_reference("a@s.whatsapp.net", "m1")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.locator, b"first".to_vec());
}

#[tokio::test]
async fn schema_rejects_duplicate_message_keys() {
    let store = memory_store().await;
    store
        .upsert_message(message("a@s.whatsapp.net", "m1", 0, DeliveryStatus::Sent), None)
        .await
        .expect("insert");

    let raw = sqlx::query(
        "INSERT INTO messages (chat_jid, id, sender, timestamp, direction, kind, status) \
         VALUES ('a@s.whatsapp.net', 'm1', 'x@s.whatsapp.net', '2024-05-01T12:00:00.000Z', \
                 'inbound', 'text', 0)",
    )
    .execute(store.pool())
    .await;
    assert!(raw.is_err(), "primary key must reject a second row");
}

#[tokio::test]
async fn concurrent_writers_serialise() {
    let store = memory_store().await;
    let mut handles = Vec::new();
    for n in 0..20u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .upsert_message(
                    message("a@s.whatsapp.net", &format!("m{n}"), n, DeliveryStatus::Sent),
                    None,
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("upsert");
    }
    assert_eq!(store.stats().await.expect("stats").messages, 20);
}

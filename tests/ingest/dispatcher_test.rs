//! Tests for `src/ingest/mod.rs`: event application, idempotence, failure isolation.

use tokio::sync::mpsc;

use wabridge::ingest::Dispatcher;
use wabridge::network::NetworkEvent;
use wabridge::store::MessageQuery;
use wabridge::types::{ContentKind, DeliveryStatus, Direction};

use crate::support::{image_message, memory_store, text_message, with_status};

const CHAT: &str = "123@g.us";
const ALICE: &str = "4915112345678@s.whatsapp.net";

#[tokio::test]
async fn duplicate_message_events_are_idempotent() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());
    let event = NetworkEvent::Message(text_message(CHAT, "abc", ALICE, 0, "hi"));

    dispatcher.apply(event.clone()).await;
    dispatcher.apply(event).await;

    assert_eq!(store.stats().await.expect("stats").messages, 1);
    let stats = dispatcher.stats();
    assert_eq!((stats.applied(), stats.duplicates(), stats.failed()), (1, 1, 0));
}

#[tokio::test]
async fn receipts_merge_forward_only_in_any_order() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());
    let mut outbound = with_status(
        text_message(CHAT, "abc", ALICE, 0, "hi"),
        DeliveryStatus::Sent,
    );
    outbound.from_me = true;
    dispatcher.apply(NetworkEvent::Message(outbound)).await;

    for status in [DeliveryStatus::Read, DeliveryStatus::Delivered] {
        dispatcher
            .apply(NetworkEvent::Receipt {
                chat_jid: CHAT.to_owned(),
                message_ids: vec!["abc".to_owned()],
                status,
            })
            .await;
    }

    let stored = store
        .get_message(CHAT, "abc")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.status, DeliveryStatus::Read);
    assert_eq!(stored.direction, Direction::Outbound);
}

#[tokio::test]
async fn receipt_before_message_is_applied_on_arrival() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());

    dispatcher
        .apply(NetworkEvent::Receipt {
            chat_jid: CHAT.to_owned(),
            message_ids: vec!["later".to_owned()],
            status: DeliveryStatus::Read,
        })
        .await;
    dispatcher
        .apply(NetworkEvent::Message(with_status(
            text_message(CHAT, "later", ALICE, 0, "hi"),
            DeliveryStatus::Sent,
        )))
        .await;

    let stored = store
        .get_message(CHAT, "later")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.status, DeliveryStatus::Read);
    assert_eq!(dispatcher.stats().failed(), 0);
}

#[tokio::test]
async fn storage_failure_drops_event_and_keeps_going() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());
    sqlx::query("DROP TABLE media")
        .execute(store.pool())
        .await
        .expect("drop media table");

    dispatcher
        .apply(NetworkEvent::Message(image_message(CHAT, "img", 0, b"loc")))
        .await;
    dispatcher
        .apply(NetworkEvent::Message(text_message(CHAT, "txt", ALICE, 1, "still here")))
        .await;

    assert_eq!(dispatcher.stats().failed(), 1);
    assert!(store.get_message(CHAT, "img").await.expect("read").is_none());
    assert!(store.get_message(CHAT, "txt").await.expect("read").is_some());
}

#[tokio::test]
async fn history_sync_applies_each_message() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());
    let messages = (0..4u32)
        .map(|n| text_message(CHAT, &format!("h{n}"), ALICE, n, "old news"))
        .collect::<Vec<_>>();

    dispatcher
        .apply(NetworkEvent::HistorySync {
            messages: messages.clone(),
        })
        .await;
    dispatcher.apply(NetworkEvent::HistorySync { messages }).await;

    assert_eq!(store.stats().await.expect("stats").messages, 4);
    assert_eq!(dispatcher.stats().applied(), 4);
    assert_eq!(dispatcher.stats().duplicates(), 4);
}

#[tokio::test]
async fn contact_and_group_events_update_metadata() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());

    dispatcher
        .apply(NetworkEvent::Contact {
            jid: ALICE.to_owned(),
            name: Some("Alice".to_owned()),
        })
        .await;
    dispatcher
        .apply(NetworkEvent::Group {
            jid: CHAT.to_owned(),
            name: Some("Climbing".to_owned()),
            participants: vec![ALICE.to_owned()],
        })
        .await;

    let contacts = store.search_contacts("alice", 5).await.expect("search");
    assert_eq!(contacts.len(), 1);
    let group = store
        .get_chat(CHAT, false)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(group.name.as_deref(), Some("Climbing"));
    assert_eq!(group.participants, vec![ALICE.to_owned()]);
}

#[tokio::test]
async fn push_name_creates_contact_for_bare_sender() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());
    let mut incoming = text_message(CHAT, "m1", "4915112345678:12@s.whatsapp.net", 0, "yo");
    incoming.sender_name = Some("Ali".to_owned());

    dispatcher.apply(NetworkEvent::Message(incoming)).await;

    let found = store.search_contacts("ali", 5).await.expect("search");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].jid, ALICE);
    let stored = store
        .get_message(CHAT, "m1")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.sender, ALICE);
}

#[tokio::test]
async fn media_message_keeps_reference_without_downloading() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());

    dispatcher
        .apply(NetworkEvent::Message(image_message(CHAT, "img", 0, b"loc")))
        .await;

    let stored = store
        .get_message(CHAT, "img")
        .await
        .expect("read")
        .expect("present");
    assert_eq!(stored.kind, ContentKind::Image);
    let media = stored.media.expect("media reference");
    assert_eq!(media.mime_type, "image/jpeg");
    assert!(media.local_path.is_none());
}

#[tokio::test]
async fn spawned_dispatcher_drains_queue_in_order() {
    let store = memory_store().await;
    let dispatcher = Dispatcher::new(store.clone());
    let stats = dispatcher.stats();
    let (tx, rx) = mpsc::channel(16);
    let task = dispatcher.spawn(rx);

    for n in 0..3u32 {
        tx.send(NetworkEvent::Message(text_message(
            CHAT,
            &format!("q{n}"),
            ALICE,
            n,
            "queued",
        )))
        .await
        .expect("send");
    }
    drop(tx);
    task.await.expect("dispatcher exits when the queue closes");

    assert_eq!(stats.applied(), 3);
    let listed = store
        .list_messages(&MessageQuery::in_chat(CHAT))
        .await
        .expect("list");
    assert_eq!(listed.len(), 3);
}

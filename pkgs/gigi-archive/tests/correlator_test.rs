// Copyright 2024 Gigi Team.
//
// Comprehensive tests for the deletion and edit correlators

mod common;

use common::*;
use gigi_archive::deletion_correlator::{STUB_ADMIN_REVOKE, STUB_REVOKE};
use gigi_archive::{
    AlertContent, ContentPart, CorrelatorTiming, DeletionCorrelator, DeletionOutcome,
    DeletionSignal, EditCorrelator, ExtendedText, MediaStore, MessageStore, PolicyHandle,
    ProtocolType, ReplyContext, RetentionPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<MessageStore>,
    media: Arc<MediaStore>,
    sink: Arc<RecordingSink>,
    correlator: DeletionCorrelator,
}

fn harness() -> Harness {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MessageStore::open(dir.path()));
    let media = Arc::new(MediaStore::new(
        dir.path().join("media"),
        Arc::new(FakeFetcher::new(b"bytes")),
        Duration::from_millis(1),
    ));
    let sink = Arc::new(RecordingSink::default());
    let correlator = DeletionCorrelator::new(
        Arc::clone(&store),
        Arc::clone(&media),
        sink.clone(),
        CorrelatorTiming {
            settle_delay: Duration::from_millis(10),
            retry_delay: Duration::from_millis(60),
        },
        vec![BOT_ID.to_string()],
    );
    Harness {
        _dir: dir,
        store,
        media,
        sink,
        correlator,
    }
}

fn revoke(message_id: &str, chat_id: &str) -> DeletionSignal {
    DeletionSignal::Stub {
        code: STUB_REVOKE,
        message_id: message_id.to_string(),
        chat_id: chat_id.to_string(),
    }
}

#[tokio::test]
async fn test_deletion_alerts_with_archived_content() {
    let h = harness();
    h.store.archive(&text("A", GROUP_CHAT, "you will never see this"));

    let outcome = h.correlator.handle(revoke("A", GROUP_CHAT)).await;
    assert_eq!(outcome, DeletionOutcome::Alerted);

    let alerts = h.sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].message_id, "A");
    assert_eq!(alerts[0].chat_id, GROUP_CHAT);
    match &alerts[0].content {
        AlertContent::Recovered { record, media_path } => {
            assert_eq!(record.text_content.as_deref(), Some("you will never see this"));
            assert!(media_path.is_none());
        }
        AlertContent::Unrecoverable => panic!("expected recovered content"),
    }

    assert!(h.store.get("A").unwrap().deleted);
    assert_eq!(h.store.deletions_for_message("A").len(), 1);
}

#[tokio::test]
async fn test_alert_carries_media_path() {
    let h = harness();
    let msg = image("A", PRIVATE_CHAT);
    h.store.archive(&msg);
    let media = h
        .media
        .download(&msg, gigi_archive::MessageKind::Image)
        .await
        .unwrap();
    assert!(h.store.attach_media("A", media.clone()));

    let outcome = h.correlator.handle(revoke("A", PRIVATE_CHAT)).await;
    assert_eq!(outcome, DeletionOutcome::Alerted);

    match &h.sink.alerts()[0].content {
        AlertContent::Recovered { media_path, .. } => {
            assert_eq!(media_path.as_deref(), Some(h.media.path_of(&media.relative_path).as_path()));
        }
        AlertContent::Unrecoverable => panic!("expected recovered content"),
    }
}

#[tokio::test]
async fn test_self_deletion_marks_without_alert() {
    let h = harness();
    let mut msg = text("A", GROUP_CHAT, "oops, wrong chat");
    msg.from_self = true;
    h.store.archive(&msg);

    let outcome = h.correlator.handle(revoke("A", GROUP_CHAT)).await;
    assert_eq!(outcome, DeletionOutcome::SelfDeletion);
    assert_eq!(h.sink.count(), 0);
    assert!(h.store.get("A").unwrap().deleted);
    assert_eq!(h.store.deletions_for_message("A").len(), 1);
}

#[tokio::test]
async fn test_never_archived_sends_degraded_alert() {
    let h = harness();

    let outcome = h.correlator.handle(revoke("ghost", GROUP_CHAT)).await;
    assert_eq!(outcome, DeletionOutcome::Unrecoverable { alerted: true });

    let alerts = h.sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].content, AlertContent::Unrecoverable);
    assert!(h.store.deletions_for_message("ghost").is_empty());
    assert!(h.store.recent_deletions(10).is_empty());
}

#[tokio::test]
async fn test_self_chat_miss_is_silent() {
    let h = harness();

    let outcome = h
        .correlator
        .handle(revoke("ghost", "15559990000@s.whatsapp.net"))
        .await;
    assert_eq!(outcome, DeletionOutcome::Unrecoverable { alerted: false });
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn test_broadcast_chats_are_excluded() {
    let h = harness();
    h.store.archive(&text("S", STATUS_CHAT, "status update"));

    for chat in [STATUS_CHAT, CHANNEL_CHAT] {
        let outcome = h.correlator.handle(revoke("S", chat)).await;
        assert_eq!(outcome, DeletionOutcome::ExcludedChat);
    }
    assert_eq!(h.sink.count(), 0);
    assert!(!h.store.get("S").unwrap().deleted);
}

#[tokio::test]
async fn test_non_deletion_signal_is_ignored() {
    let h = harness();
    h.store.archive(&text("A", GROUP_CHAT, "hello"));

    let outcome = h
        .correlator
        .handle(DeletionSignal::Stub {
            code: 2,
            message_id: "A".to_string(),
            chat_id: GROUP_CHAT.to_string(),
        })
        .await;
    assert_eq!(outcome, DeletionOutcome::NotADeletion);
    assert!(!h.store.get("A").unwrap().deleted);
}

#[tokio::test]
async fn test_duplicate_signal_shapes_alert_once() {
    let h = harness();
    h.store.archive(&text("A", GROUP_CHAT, "deleted by admin"));

    let stub = DeletionSignal::Stub {
        code: STUB_ADMIN_REVOKE,
        message_id: "A".to_string(),
        chat_id: GROUP_CHAT.to_string(),
    };
    let protocol = DeletionSignal::Protocol {
        protocol_type: ProtocolType::Named("REVOKE".to_string()),
        target_id: "A".to_string(),
        chat_id: GROUP_CHAT.to_string(),
    };

    let (first, second) = tokio::join!(h.correlator.handle(stub), h.correlator.handle(protocol));
    let mut outcomes = [first, second];
    outcomes.sort_by_key(|outcome| *outcome == DeletionOutcome::Alerted);
    assert_eq!(outcomes, [DeletionOutcome::Duplicate, DeletionOutcome::Alerted]);

    let late = h.correlator.handle(revoke("A", GROUP_CHAT)).await;
    assert_eq!(late, DeletionOutcome::AlreadyDeleted);

    assert_eq!(h.sink.count(), 1);
    assert_eq!(h.store.deletions_for_message("A").len(), 1);
}

#[tokio::test]
async fn test_late_archival_is_found_on_retry() {
    let h = harness();
    let msg = text("A", GROUP_CHAT, "raced the deletion");

    let (outcome, _) = tokio::join!(h.correlator.handle(revoke("A", GROUP_CHAT)), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.store.archive(&msg);
    });

    assert_eq!(outcome, DeletionOutcome::Alerted);
    assert!(matches!(
        h.sink.alerts()[0].content,
        AlertContent::Recovered { .. }
    ));
}

fn edit_correlator(dir: &TempDir, store: Arc<MessageStore>) -> EditCorrelator {
    EditCorrelator::open(
        dir.path(),
        store,
        PolicyHandle::new(RetentionPolicy::default()),
        10,
    )
}

#[tokio::test]
async fn test_edit_maps_to_original_by_leading_token() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MessageStore::open(dir.path()));
    let edits = edit_correlator(&dir, Arc::clone(&store));

    store.archive(&text("A", GROUP_CHAT, "hello world"));
    store.archive(&text("X", GROUP_CHAT, "unrelated chatter"));
    let edit = edited("B", GROUP_CHAT, "hello universe");
    store.archive(&edit);

    let mapping = edits.correlate(&edit).expect("edit correlated");
    assert_eq!(mapping.edited_id, "B");
    assert_eq!(mapping.original_id, "A");
    assert_eq!(mapping.chat_id, GROUP_CHAT);
    assert_eq!(edits.original_of("B").as_deref(), Some("A"));

    // A second edit event for the same id keeps the first mapping
    assert_eq!(edits.correlate(&edit).unwrap().original_id, "A");
    assert_eq!(edits.mapping_count(), 1);
}

#[tokio::test]
async fn test_edit_ignores_other_chats_and_plain_messages() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MessageStore::open(dir.path()));
    let edits = edit_correlator(&dir, Arc::clone(&store));

    store.archive(&text("A", PRIVATE_CHAT, "hello world"));
    let edit = edited("B", GROUP_CHAT, "hello universe");
    store.archive(&edit);
    assert!(edits.correlate(&edit).is_none());

    let plain = text("C", GROUP_CHAT, "hello again");
    assert!(edits.correlate(&plain).is_none());
    assert_eq!(edits.mapping_count(), 0);
}

#[tokio::test]
async fn test_edit_scan_window_is_bounded() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MessageStore::open(dir.path()));
    let edits = edit_correlator(&dir, Arc::clone(&store));

    let base = chrono::Utc::now().timestamp() - 100;
    let mut original = text("A", GROUP_CHAT, "hello world");
    original.timestamp = base;
    store.archive(&original);
    for i in 0..10 {
        let mut filler = text(&format!("f{}", i), GROUP_CHAT, "filler message");
        filler.timestamp = base + 1 + i;
        store.archive(&filler);
    }

    let edit = edited("B", GROUP_CHAT, "hello universe");
    store.archive(&edit);
    assert!(edits.correlate(&edit).is_none());
}

#[tokio::test]
async fn test_edit_keeps_reply_context_backup() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MessageStore::open(dir.path()));
    let edits = edit_correlator(&dir, Arc::clone(&store));

    store.archive(&text("A", GROUP_CHAT, "meet at noon"));
    let edit = raw(
        "B",
        GROUP_CHAT,
        vec![ContentPart::Edited {
            content: vec![ContentPart::ExtendedText(ExtendedText {
                text: "meet at one".to_string(),
                context: Some(ReplyContext {
                    quoted_id: Some("Q".to_string()),
                    quoted_sender: None,
                    quoted_message: Some(serde_json::json!({"conversation": "when?"})),
                }),
            })],
        }],
    );
    store.archive(&edit);
    edits.correlate(&edit).expect("edit correlated");

    let backup = edits.context_backup("B").expect("context backed up");
    assert_eq!(backup.expires_at - backup.stored_at, chrono::Duration::hours(72));
    assert_eq!(backup.context["quoted_id"], "Q");

    assert_eq!(edits.expire_context_backups(backup.stored_at), 0);
    assert_eq!(
        edits.expire_context_backups(backup.expires_at + chrono::Duration::seconds(1)),
        1
    );
    assert!(edits.context_backup("B").is_none());
}

#[tokio::test]
async fn test_edit_mappings_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MessageStore::open(dir.path()));
    {
        let edits = edit_correlator(&dir, Arc::clone(&store));
        store.archive(&text("A", GROUP_CHAT, "hello world"));
        let edit = edited("B", GROUP_CHAT, "hello universe");
        store.archive(&edit);
        edits.correlate(&edit).unwrap();
    }

    let edits = edit_correlator(&dir, store);
    assert_eq!(edits.original_of("B").as_deref(), Some("A"));
}

#[tokio::test]
async fn test_revoke_signal_from_ingested_message() {
    let h = harness();
    h.store.archive(&text("A", GROUP_CHAT, "regret"));

    let msg = raw(
        "R",
        GROUP_CHAT,
        vec![ContentPart::Protocol(gigi_archive::ProtocolPayload {
            protocol_type: ProtocolType::Numeric(0),
            target_id: Some("A".to_string()),
            target_chat_id: None,
        })],
    );
    let signal = DeletionSignal::from_raw(&msg).expect("revoke signal");
    assert_eq!(h.correlator.handle(signal).await, DeletionOutcome::Alerted);
    assert!(DeletionSignal::from_raw(&text("T", GROUP_CHAT, "plain")).is_none());
}

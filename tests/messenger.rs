mod support;

use petid_messenger::api::MessengerApi;
use petid_messenger::api::events::PushEvent;
use petid_messenger::api::models::{ConversationRef, LOADING_NAME, MediaUpload};
use petid_messenger::directory::OpenOutcome;
use petid_messenger::{ChannelSignal, Error, Messenger, SendOutcome};
use std::sync::Arc;
use std::time::Duration;
use support::{FakeBackend, ME, conversation, init_logging, message, settle, user};
use tokio_util::sync::CancellationToken;

fn messenger(backend: &Arc<FakeBackend>) -> Arc<Messenger> {
    let api: Arc<dyn MessengerApi> = backend.clone();
    Arc::new(Messenger::new(api, ME, None, CancellationToken::new()))
}

fn seeded() -> Arc<FakeBackend> {
    let backend = FakeBackend::new();
    backend.add_conversation(
        conversation(7, user(42, "Ana"), 1),
        vec![message(1, 7, 42, "hey", false)],
    );
    backend.add_conversation(
        conversation(8, user(43, "Bo"), 0),
        vec![message(2, 8, ME, "sup", true)],
    );
    backend
}

#[tokio::test(start_paused = true)]
async fn opening_an_unknown_counterpart_shows_a_placeholder() {
    init_logging();
    let backend = FakeBackend::new();
    let m = messenger(&backend);
    m.start().await.unwrap();

    let outcome = m.open_with_counterpart(42).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Created(ConversationRef::Pending(42)));

    let entries = m.conversations();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, ConversationRef::Pending(42));
    assert_eq!(entries[0].counterpart.id, 42);
    assert_eq!(entries[0].counterpart.name, LOADING_NAME);
    assert_eq!(m.selected().map(|c| c.id), Some(ConversationRef::Pending(42)));
    assert!(m.messages().is_empty());
    assert_eq!(backend.calls("messages"), 0);
}

#[tokio::test(start_paused = true)]
async fn first_send_promotes_the_placeholder() {
    init_logging();
    let backend = FakeBackend::new();
    backend.next_chat_id(7);
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.open_with_counterpart(42).await.unwrap();

    m.set_draft("hi");
    let outcome = m.send().await.unwrap();
    assert_eq!(outcome, SendOutcome::Promoted(ConversationRef::Durable(7)));

    let entries = m.conversations();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, ConversationRef::Durable(7));
    assert_eq!(entries[0].counterpart.id, 42);
    assert_eq!(m.selected().map(|c| c.id), Some(ConversationRef::Durable(7)));
    assert_eq!(m.timeline().current(), Some(ConversationRef::Durable(7)));
    let texts: Vec<_> = m.messages().into_iter().map(|e| e.message.content).collect();
    assert_eq!(texts, vec!["hi"]);
    assert!(m.messages().iter().all(|e| !e.is_optimistic()));
    assert_eq!(m.draft(), "");
    assert_eq!(backend.sent(), vec![(42, "hi".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn repeated_opens_keep_a_single_placeholder() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();

    for _ in 0..3 {
        m.open_with_counterpart(50).await.unwrap();
    }
    let placeholders = m
        .conversations()
        .iter()
        .filter(|c| c.id == ConversationRef::Pending(50))
        .count();
    assert_eq!(placeholders, 1);
}

#[tokio::test(start_paused = true)]
async fn promotion_leaves_exactly_one_durable_conversation() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.open_with_counterpart(50).await.unwrap();

    m.set_draft("first");
    assert!(matches!(m.send().await.unwrap(), SendOutcome::Promoted(_)));
    m.open_with_counterpart(50).await.unwrap();
    m.set_draft("second");
    assert!(matches!(m.send().await.unwrap(), SendOutcome::Delivered(_)));

    let for_50: Vec<_> = m
        .conversations()
        .into_iter()
        .filter(|c| c.counterpart.id == 50)
        .collect();
    assert_eq!(for_50.len(), 1);
    assert!(!for_50[0].id.is_pending());
}

#[tokio::test(start_paused = true)]
async fn existing_counterpart_opens_its_conversation() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);

    // Not started: opening loads the list first.
    let outcome = m.open_with_counterpart(42).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Existing(ConversationRef::Durable(7)));
    assert_eq!(m.messages().len(), 1);
    settle().await;
    assert_eq!(backend.marked_read(), vec![7]);
}

#[tokio::test(start_paused = true)]
async fn invalid_counterparts_are_rejected() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    assert!(matches!(m.open_with_counterpart(0).await, Err(Error::NoRecipient)));
    assert!(matches!(m.open_with_counterpart(ME).await, Err(Error::NoRecipient)));
    assert!(m.conversations().iter().all(|c| !c.id.is_pending()));
}

#[tokio::test(start_paused = true)]
async fn send_needs_a_selection_and_content() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();

    m.set_draft("hello");
    assert!(matches!(m.send().await, Err(Error::NoConversationSelected)));

    m.select(ConversationRef::Durable(8)).await.unwrap();
    m.set_draft("   ");
    assert!(matches!(m.send().await, Err(Error::EmptyMessage)));
    assert!(matches!(m.send_attachments(Vec::new()).await, Err(Error::EmptyMessage)));
    assert!(backend.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_send_drops_the_optimistic_entry_and_keeps_the_draft() {
    init_logging();
    let backend = seeded();
    backend.fail("send");
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(8)).await.unwrap();

    m.set_draft("lost?");
    assert!(matches!(m.send().await, Err(Error::Status { status: 500, .. })));
    assert_eq!(m.draft(), "lost?");
    let texts: Vec<_> = m.messages().into_iter().map(|e| e.message.content).collect();
    assert_eq!(texts, vec!["sup"]);
}

#[tokio::test(start_paused = true)]
async fn failed_first_send_keeps_the_placeholder() {
    init_logging();
    let backend = seeded();
    backend.fail("send");
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.open_with_counterpart(50).await.unwrap();

    m.set_draft("hi");
    assert!(m.send().await.is_err());
    assert_eq!(m.selected().map(|c| c.id), Some(ConversationRef::Pending(50)));
    assert!(m.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn identical_send_in_flight_is_rejected() {
    init_logging();
    let backend = seeded();
    backend.delay("send", Duration::from_millis(500));
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(8)).await.unwrap();
    m.set_draft("once");

    let first = tokio::spawn({
        let m = m.clone();
        async move { m.send().await }
    });
    settle().await;
    assert!(matches!(m.send().await, Err(Error::DuplicateSend)));
    assert!(matches!(first.await.unwrap(), Ok(SendOutcome::Delivered(_))));
    assert_eq!(backend.sent().len(), 1);

    // Once settled the same text may be sent again.
    m.set_draft("once");
    assert!(m.send().await.is_ok());
    assert_eq!(backend.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn draft_typed_during_send_survives() {
    init_logging();
    let backend = seeded();
    backend.delay("send", Duration::from_millis(500));
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(8)).await.unwrap();
    m.set_draft("first");

    let sending = tokio::spawn({
        let m = m.clone();
        async move { m.send().await }
    });
    settle().await;
    m.set_draft("next thought");
    sending.await.unwrap().unwrap();
    assert_eq!(m.draft(), "next thought");
}

#[tokio::test(start_paused = true)]
async fn unreconciled_send_deselects_the_placeholder() {
    init_logging();
    let backend = seeded();
    backend.create_on_send(false);
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.open_with_counterpart(50).await.unwrap();

    m.set_draft("anyone there?");
    assert_eq!(m.send().await.unwrap(), SendOutcome::Unreconciled);
    assert!(m.selected().is_none());
    assert_eq!(m.timeline().current(), None);
    assert!(m.conversations().iter().all(|c| !c.id.is_pending()));
}

#[tokio::test(start_paused = true)]
async fn attachments_carry_the_draft_as_caption() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(7)).await.unwrap();
    m.set_draft("look");

    let media = vec![MediaUpload {
        file_name: "dog.png".into(),
        content_type: Some("image/png".into()),
        bytes: vec![1, 2, 3],
    }];
    let outcome = m.send_attachments(media).await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered(ConversationRef::Durable(7)));
    assert_eq!(backend.calls("send_media"), 1);
    assert_eq!(backend.sent(), vec![(42, "look".to_string())]);
    assert_eq!(m.draft(), "");
}

#[tokio::test(start_paused = true)]
async fn pushed_message_lands_in_the_open_timeline() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(8)).await.unwrap();

    let incoming = message(30, 8, 43, "ping", false);
    m.handle_signal(ChannelSignal::Event(PushEvent::NewMessage(incoming))).await;
    settle().await;

    let texts: Vec<_> = m.messages().into_iter().map(|e| e.message.content).collect();
    assert_eq!(texts, vec!["sup", "ping"]);
    assert_eq!(m.conversations()[0].id, ConversationRef::Durable(8));
    assert_eq!(m.conversations()[0].unread_count, 0);
    assert_eq!(backend.marked_read(), vec![8]);
}

#[tokio::test(start_paused = true)]
async fn pushed_message_elsewhere_bumps_unread() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(7)).await.unwrap();
    let before = m.messages();

    let incoming = message(31, 8, 43, "psst", false);
    m.handle_signal(ChannelSignal::Event(PushEvent::NewMessage(incoming))).await;

    assert_eq!(m.messages(), before);
    let head = &m.conversations()[0];
    assert_eq!(head.id, ConversationRef::Durable(8));
    assert_eq!(head.unread_count, 1);
}

#[tokio::test(start_paused = true)]
async fn message_for_unknown_conversation_refreshes_the_list() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    assert_eq!(backend.calls("conversations"), 1);

    backend.add_conversation(conversation(9, user(44, "Cy"), 1), Vec::new());
    let incoming = message(32, 9, 44, "new here", false);
    m.handle_signal(ChannelSignal::Event(PushEvent::NewMessage(incoming))).await;

    assert_eq!(backend.calls("conversations"), 2);
    assert!(m.conversations().iter().any(|c| c.id == ConversationRef::Durable(9)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_but_first_connect_does_not() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    m.select(ConversationRef::Durable(7)).await.unwrap();
    let lists = backend.calls("conversations");
    let loads = backend.calls("messages");

    m.handle_signal(ChannelSignal::Connected).await;
    assert_eq!(backend.calls("conversations"), lists);

    m.handle_signal(ChannelSignal::Disconnected).await;
    m.handle_signal(ChannelSignal::Connected).await;
    assert_eq!(backend.calls("conversations"), lists + 1);
    assert_eq!(backend.calls("messages"), loads + 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_silences_late_events_and_fetches() {
    init_logging();
    let backend = seeded();
    backend.delay("conversations", Duration::from_millis(200));
    let m = messenger(&backend);

    let loading = tokio::spawn({
        let m = m.clone();
        async move { m.start().await }
    });
    settle().await;
    m.teardown();
    loading.await.unwrap().unwrap();
    assert!(m.conversations().is_empty());

    let incoming = message(33, 7, 42, "late", false);
    m.handle_signal(ChannelSignal::Event(PushEvent::NewMessage(incoming))).await;
    m.handle_signal(ChannelSignal::Connected).await;
    m.handle_signal(ChannelSignal::Connected).await;
    settle().await;

    assert!(m.conversations().is_empty());
    assert!(m.messages().is_empty());
    assert_eq!(backend.calls("conversations"), 1);
}

#[tokio::test(start_paused = true)]
async fn open_racing_teardown_leaves_nothing_behind() {
    init_logging();
    let backend = seeded();
    backend.delay("conversations", Duration::from_millis(200));
    let m = messenger(&backend);

    let opening = tokio::spawn({
        let m = m.clone();
        async move { m.open_with_counterpart(50).await }
    });
    settle().await;
    m.teardown();

    let result = opening.await.unwrap();
    assert!(matches!(result, Err(Error::SessionClosed)));
    assert!(m.conversations().is_empty());
    assert!(m.selected().is_none());
    assert_eq!(m.timeline().current(), None);
    assert_eq!(backend.calls("messages"), 0);
}

#[tokio::test(start_paused = true)]
async fn selecting_a_conversation_clears_its_badge() {
    init_logging();
    let backend = seeded();
    let m = messenger(&backend);
    m.start().await.unwrap();
    let unread = || {
        m.conversations()
            .into_iter()
            .find(|c| c.id == ConversationRef::Durable(7))
            .map(|c| c.unread_count)
    };
    assert_eq!(unread(), Some(1));

    m.select(ConversationRef::Durable(7)).await.unwrap();
    assert_eq!(unread(), Some(0));
}

//! End-to-end scenarios against a scripted transport and in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use ei_config::AppConfig;
use ei_llm::{LlmError, ScriptedTransport};
use ei_runtime::{Processor, ProcessorEvent, QueueActivity};
use ei_state::schema::Role;
use ei_state::StateError;
use ei_storage::MemoryStorage;

const WAIT: Duration = Duration::from_secs(10);

async fn start_processor(transport: &ScriptedTransport) -> Processor {
    let processor = Processor::new(
        AppConfig::default(),
        Arc::new(transport.clone()),
        Arc::new(MemoryStorage::new()),
    );
    processor.start().await.expect("processor starts");
    processor
}

/// Wait until `check` passes, polling between ticks.
async fn wait_until<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Collect events until the predicate matches one; returns everything seen.
async fn collect_until(
    rx: &mut broadcast::Receiver<ProcessorEvent>,
    stop: impl Fn(&ProcessorEvent) -> bool,
) -> Vec<ProcessorEvent> {
    timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.expect("event stream open");
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

fn assert_subsequence(events: &[ProcessorEvent], expected: &[&str]) {
    let mut remaining = expected.iter().peekable();
    for event in events {
        if remaining.peek().is_some_and(|next| event_label(event) == **next) {
            remaining.next();
        }
    }
    assert!(
        remaining.peek().is_none(),
        "missing event {:?}; saw {:?}",
        remaining.peek(),
        events.iter().map(event_label).collect::<Vec<_>>()
    );
}

fn event_label(event: &ProcessorEvent) -> String {
    match event {
        ProcessorEvent::MessageAdded { persona } => format!("added:{persona}"),
        ProcessorEvent::MessageQueued { persona } => format!("queued:{persona}"),
        ProcessorEvent::MessageProcessing { persona } => format!("processing:{persona}"),
        ProcessorEvent::QueueStateChanged(QueueActivity::Busy) => "busy".to_string(),
        ProcessorEvent::QueueStateChanged(QueueActivity::Idle) => "idle".to_string(),
        ProcessorEvent::QueueStateChanged(QueueActivity::Paused) => "paused".to_string(),
        other => format!("{other:?}"),
    }
}

// ── Scenario 1: basic send ────────────────────────────────────────────────────

#[tokio::test]
async fn basic_send_delivers_reply_with_ordered_events() {
    let transport = ScriptedTransport::new();
    transport.push_text("Hello! I am Ei.");
    let processor = start_processor(&transport).await;
    let mut rx = processor.subscribe();

    processor.send_message("ei", "Hi").await.expect("send");

    let events = collect_until(&mut rx, |e| {
        matches!(e, ProcessorEvent::QueueStateChanged(QueueActivity::Idle))
    })
    .await;
    assert_subsequence(
        &events,
        &[
            "added:ei",
            "queued:ei",
            "busy",
            "processing:ei",
            "added:ei",
            "idle",
        ],
    );

    let messages = processor.get_messages("ei").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::Human);
    assert_eq!(messages[1].role, Role::System);
    assert_eq!(messages[1].content, "Hello! I am Ei.");
    assert!(!messages[1].read);

    processor.stop().await;
}

// ── Scenario 2: echo strip ────────────────────────────────────────────────────

#[tokio::test]
async fn leading_echo_is_stripped_from_reply() {
    let transport = ScriptedTransport::new();
    transport.push_text("Hi\n\nGreat to see you.");
    let processor = start_processor(&transport).await;

    processor.send_message("ei", "Hi").await.expect("send");
    wait_until(|| async { processor.get_messages("ei").await.len() == 2 }).await;

    let messages = processor.get_messages("ei").await;
    assert_eq!(messages[1].content, "Great to see you.");

    processor.stop().await;
}

// ── Scenario 3: no message ────────────────────────────────────────────────────

#[tokio::test]
async fn silence_appends_nothing_but_bumps_heartbeat() {
    let transport = ScriptedTransport::new();
    transport.push_text("No Message");
    let processor = start_processor(&transport).await;

    assert!(processor.get_persona("ei").await.unwrap().last_heartbeat.is_none());
    processor.send_message("ei", "Hi").await.expect("send");

    wait_until(|| async {
        processor
            .get_persona("ei")
            .await
            .is_some_and(|p| p.last_heartbeat.is_some())
    })
    .await;

    let messages = processor.get_messages("ei").await;
    assert_eq!(messages.len(), 1, "no system message for silence");

    processor.stop().await;
}

// ── Scenario 4: supersession ──────────────────────────────────────────────────

#[tokio::test]
async fn new_message_supersedes_in_flight_response() {
    let transport = ScriptedTransport::new();
    transport.push_text("I caught both.");
    let _gate = transport.hold();

    let processor = start_processor(&transport).await;
    let mut rx = processor.subscribe();

    processor.send_message("ei", "A").await.expect("send A");
    collect_until(&mut rx, |e| {
        matches!(e, ProcessorEvent::MessageProcessing { .. })
    })
    .await;

    processor.send_message("ei", "B").await.expect("send B");
    transport.release();

    wait_until(|| async {
        processor
            .get_messages("ei")
            .await
            .iter()
            .any(|m| m.role == Role::System)
    })
    .await;

    let messages = processor.get_messages("ei").await;
    let replies: Vec<_> = messages.iter().filter(|m| m.role == Role::System).collect();
    assert_eq!(replies.len(), 1, "exactly one reply for the superseded pair");
    assert_eq!(replies[0].content, "I caught both.");

    // The delivered generation saw the full context, A and B both.
    let final_call = transport.calls().pop().expect("reply call recorded");
    assert!(final_call.user.contains('A') && final_call.user.contains('B'));

    processor.stop().await;
}

// ── Scenario 5: three-step extraction ─────────────────────────────────────────

#[tokio::test]
async fn birthday_flows_through_scan_match_update() {
    let transport = ScriptedTransport::new();
    // Response to the human message.
    transport.push_text("Noted!");
    // Step 1 scans, dispatched fact → trait → topic → person.
    transport.push_text(
        r#"{"mentioned": [], "new_items": [{"name": "Birthday", "value": "May 26, 1984", "confidence": "high"}]}"#,
    );
    transport.push_text(r#"{"mentioned": [], "new_items": []}"#);
    transport.push_text(r#"{"mentioned": [], "new_items": []}"#);
    transport.push_text(r#"{"mentioned": [], "new_items": []}"#);
    // Step 2: nothing on file.
    transport.push_text(r#"{"match_id": null, "confidence": 0.0}"#);
    // Step 3: the full fact.
    transport.push_text(
        r#"{"name": "Birthday", "description": "May 26, 1984", "sentiment": 0.0, "confidence": 0.9, "quotes": []}"#,
    );

    let processor = start_processor(&transport).await;
    processor
        .send_message("ei", "My birthday is May 26, 1984")
        .await
        .expect("send");

    wait_until(|| async { processor.get_human().await.facts.len() == 1 }).await;

    let human = processor.get_human().await;
    let fact = &human.facts[0];
    assert_eq!(fact.core.name, "Birthday");
    assert_eq!(fact.core.description, "May 26, 1984");
    assert_eq!(fact.core.sentiment, 0.0);
    assert_eq!(fact.core.persona_groups, vec!["General".to_string()]);
    assert_eq!(fact.core.learned_by.as_deref(), Some("ei"));
    assert_eq!(fact.confidence, 0.9);

    // Every scanned message carries the fact flag.
    wait_until(|| async {
        processor
            .get_messages("ei")
            .await
            .iter()
            .all(|m| m.f == Some(true))
    })
    .await;

    processor.stop().await;
}

// ── Quote validation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn quotes_are_verified_verbatim_and_paraphrases_discarded() {
    let transport = ScriptedTransport::new();
    transport.push_text("Lovely.");
    transport.push_text(
        r#"{"mentioned": [], "new_items": [{"name": "Sailing", "value": "loves sailing", "confidence": "high"}]}"#,
    );
    transport.push_text(r#"{"mentioned": [], "new_items": []}"#);
    transport.push_text(r#"{"mentioned": [], "new_items": []}"#);
    transport.push_text(r#"{"mentioned": [], "new_items": []}"#);
    transport.push_text(r#"{"match_id": null, "confidence": 0.0}"#);
    transport.push_text(
        r#"{"name": "Sailing", "description": "Loves to sail", "sentiment": 0.8,
            "quotes": [
                {"text": "the sea is the only place I feel small", "reason": "vivid"},
                {"text": "the ocean makes me feel tiny", "reason": "paraphrased"}
            ]}"#,
    );

    let processor = start_processor(&transport).await;
    // The accented prefix keeps byte and character offsets apart.
    let original = "Déjà vu again: the sea is the only place I feel small enough to think.";
    processor.send_message("ei", original).await.expect("send");

    wait_until(|| async { !processor.get_human().await.quotes.is_empty() }).await;

    let human = processor.get_human().await;
    assert_eq!(human.quotes.len(), 1, "paraphrase must be discarded");
    let quote = &human.quotes[0];
    assert_eq!(quote.text, "the sea is the only place I feel small");

    // Offset invariant: the char slice [start, end) reproduces the text.
    let messages = processor.get_messages("ei").await;
    let source = messages
        .iter()
        .find(|m| m.id == quote.message_id)
        .expect("source message");
    let (start, end) = (quote.start.unwrap(), quote.end.unwrap());
    let reconstructed: String = source.content.chars().skip(start).take(end - start).collect();
    assert_eq!(reconstructed, quote.text);

    processor.stop().await;
}

// ── Scenario 6: checkpoint save/restore ───────────────────────────────────────

#[tokio::test]
async fn manual_checkpoint_restores_earlier_thread() {
    let transport = ScriptedTransport::new();
    transport.push_text("No Message");
    transport.push_text("No Message");
    let processor = start_processor(&transport).await;

    processor.send_message("ei", "first").await.expect("send");
    wait_until(|| async { transport.call_count() == 1 }).await;
    wait_until(|| async { processor.queue_status().await == (0, false) }).await;

    let meta = processor
        .create_checkpoint(Some(10), Some("before second".to_string()))
        .await
        .expect("checkpoint");
    assert_eq!(meta.slot, 10);

    processor.send_message("ei", "second").await.expect("send");
    wait_until(|| async { transport.call_count() == 2 }).await;
    wait_until(|| async { processor.queue_status().await == (0, false) }).await;
    assert_eq!(processor.get_messages("ei").await.len(), 2);

    processor.restore_checkpoint(meta.id).await.expect("restore");
    let messages = processor.get_messages("ei").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "first");

    processor.stop().await;
}

// ── Boundary behaviors ────────────────────────────────────────────────────────

#[tokio::test]
async fn sending_to_archived_persona_fails() {
    let transport = ScriptedTransport::new();
    let processor = start_processor(&transport).await;

    processor.archive_persona("ei").await.expect("archive");

    let result = processor.send_message("ei", "hello?").await;
    assert!(matches!(result, Err(StateError::Invariant(_))));

    processor.stop().await;
}

#[tokio::test]
async fn paused_queue_holds_work_until_resume() {
    let transport = ScriptedTransport::new();
    transport.push_text("Finally!");
    let processor = start_processor(&transport).await;

    processor.pause_queue().await;
    processor.send_message("ei", "anyone there?").await.expect("send");

    sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.call_count(), 0, "paused queue must not dispatch");
    let (depth, busy) = processor.queue_status().await;
    assert_eq!(depth, 1);
    assert!(!busy);

    processor.resume_queue().await;
    wait_until(|| async { processor.get_messages("ei").await.len() == 2 }).await;

    processor.stop().await;
}

#[tokio::test]
async fn rate_limited_item_retries_then_drops() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push_error(LlmError::RateLimited { retry_after_secs: 0 });
    }
    let processor = start_processor(&transport).await;

    processor.send_message("ei", "Hi").await.expect("send");

    // Three attempts with exponential backoff, then the item is dropped.
    wait_until(|| async {
        transport.call_count() == 3 && processor.queue_status().await == (0, false)
    })
    .await;
    assert_eq!(processor.get_messages("ei").await.len(), 1);

    processor.stop().await;
}

#[tokio::test]
async fn recall_returns_pending_messages_in_order() {
    let transport = ScriptedTransport::new();
    transport.push_text("never delivered");
    let _gate = transport.hold();
    let processor = start_processor(&transport).await;

    processor.send_message("ei", "one").await.expect("send");
    processor.send_message("ei", "two").await.expect("send");

    let recalled = processor
        .recall_pending_messages("ei")
        .await
        .expect("recall");
    assert_eq!(recalled, "one\ntwo");
    assert!(processor.get_messages("ei").await.is_empty());

    transport.release();
    processor.stop().await;
}

#[tokio::test]
async fn failed_response_emits_error_and_no_message() {
    let transport = ScriptedTransport::new();
    transport.push_error(LlmError::Provider {
        status: 500,
        body: "upstream exploded".to_string(),
    });
    let processor = start_processor(&transport).await;
    let mut rx = processor.subscribe();

    processor.send_message("ei", "Hi").await.expect("send");

    let events = collect_until(&mut rx, |e| {
        matches!(e, ProcessorEvent::Error { code, .. } if code == "response_failed")
    })
    .await;
    assert!(!events.is_empty());
    assert_eq!(processor.get_messages("ei").await.len(), 1);

    processor.stop().await;
}

// ── Visibility across personas ────────────────────────────────────────────────

#[tokio::test]
async fn scoped_items_stay_out_of_other_personas_prompts() {
    let transport = ScriptedTransport::new();
    let processor = start_processor(&transport).await;

    // A persona with its own private group, plus a fact in that group.
    {
        use ei_state::schema::{Fact, ItemCore, Validation};
        let mut fact = Fact {
            core: ItemCore::new("Secret ambition", "wants to sail the Atlantic"),
            confidence: 0.9,
            validated: Validation::None,
            validated_date: None,
        };
        fact.core.persona_groups = vec!["Private".to_string()];

        transport.push_text(r#"{"short_description": "a muse", "traits": [], "topics": []}"#);
        processor.create_persona("muse", "a muse").await.expect("create");
        wait_until(|| async { processor.get_persona("muse").await.is_some() }).await;
        processor
            .update_persona(
                "muse",
                ei_runtime::PersonaPatch {
                    group_primary: Some(Some("Private".to_string())),
                    ..Default::default()
                },
            )
            .await
            .expect("patch");
        processor.upsert_fact(fact).await;
    }

    // Ei (wildcard) sees the private fact; a General-scoped reply prompt for
    // a third persona must not.
    transport.push_text(r#"{"short_description": "plain", "traits": [], "topics": []}"#);
    processor.create_persona("plain", "plain persona").await.expect("create");
    wait_until(|| async { processor.get_persona("plain").await.is_some() }).await;

    transport.push_text("No Message");
    processor.send_message("plain", "hello").await.expect("send");
    wait_until(|| async { transport.remaining() == 0 }).await;

    let plain_call = transport
        .calls()
        .into_iter()
        .rev()
        .find(|c| c.user.contains("hello"))
        .expect("plain response call");
    assert!(
        !plain_call.system.contains("Secret ambition"),
        "private fact leaked into an unrelated persona's prompt"
    );

    transport.push_text("No Message");
    processor.send_message("ei", "hi ei").await.expect("send");
    wait_until(|| async { transport.remaining() == 0 }).await;
    let ei_call = transport
        .calls()
        .into_iter()
        .rev()
        .find(|c| c.user.contains("hi ei"))
        .expect("ei response call");
    assert!(ei_call.system.contains("Secret ambition"), "ei reads everything");

    processor.stop().await;
}

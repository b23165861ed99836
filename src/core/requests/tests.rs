use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::*;
use crate::core::chat_stream::TransportError;
use crate::core::store::ChatDefaults;
use crate::utils::test_utils::{delta_frame, typed_frame, ScriptedTransport};

struct Harness {
    transport: Arc<ScriptedTransport>,
    manager: RequestManager,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    store: ConversationStore,
    chat: ChatId,
}

fn harness() -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    let (manager, rx) = RequestManager::new(transport.clone(), RequestSettings::default());
    let store = ConversationStore::new(ChatDefaults {
        model: "test-model".into(),
        ..ChatDefaults::default()
    });
    let chat = store.active_id().clone();
    Harness {
        transport,
        manager,
        rx,
        store,
        chat,
    }
}

impl Harness {
    fn submit(&mut self, prompt: &str) -> u64 {
        let chat = self.chat.clone();
        self.manager
            .submit(&mut self.store, &chat, prompt, Attachments::default())
            .expect("submit")
    }

    async fn drive(&mut self) -> RequestOutcome {
        loop {
            let message = self.rx.recv().await.expect("stream message");
            if let Some(outcome) = self.manager.handle_message(&mut self.store, message) {
                return outcome;
            }
        }
    }

    fn history(&self) -> Vec<(Role, String)> {
        self.store
            .chat(&self.chat)
            .unwrap()
            .history
            .iter()
            .map(|m| (m.role, m.content().to_string()))
            .collect()
    }
}

#[tokio::test]
async fn plain_stream_builds_assistant_reply() {
    let mut h = harness();
    h.transport.push_chunks(vec![
        delta_frame("Hi"),
        delta_frame(" there"),
        r#"data: {"choices":[],"usage":{"prompt_tokens":10,"total_tokens":15}}"#.to_string() + "\n",
        "data: [DONE]\n".to_string(),
    ]);

    h.submit("Hello");
    assert_eq!(
        h.manager.active_request(&h.chat).map(|r| r.phase),
        Some(RequestPhase::Sending)
    );
    assert_eq!(h.drive().await, RequestOutcome::Completed);

    assert_eq!(
        h.history(),
        vec![
            (Role::User, "Hello".to_string()),
            (Role::Assistant, "Hi there".to_string()),
        ]
    );
    let chat = h.store.chat(&h.chat).unwrap();
    assert_eq!(chat.name, "Hello");
    assert_eq!(chat.token_usage.total_tokens, 15);
    assert!(!h.manager.is_active(&h.chat));
    assert_eq!(h.manager.last_outcome(&h.chat), Some(&RequestOutcome::Completed));

    let sent = h.transport.requests();
    assert_eq!(sent[0].endpoint, "http://localhost:8080/chat/completions");
    assert_eq!(sent[0].body.model, "test-model");
    assert!(sent[0].body.stream);
    assert_eq!(sent[0].body.messages.len(), 1);
    assert_eq!(sent[0].body.messages[0].content.as_text(), Some("Hello"));
}

#[tokio::test]
async fn thinking_tags_split_across_reads_become_thinking_message() {
    let mut h = harness();
    h.transport.push_chunks(vec![
        delta_frame("<thi"),
        delta_frame("nk>plan"),
        delta_frame(" more</th"),
        delta_frame("ink>Answer"),
    ]);

    h.submit("Question");
    assert_eq!(h.drive().await, RequestOutcome::Completed);

    assert_eq!(
        h.history(),
        vec![
            (Role::User, "Question".to_string()),
            (Role::Thinking, "plan more".to_string()),
            (Role::Assistant, "Answer".to_string()),
        ]
    );
    let chat = h.store.chat(&h.chat).unwrap();
    assert!(chat.history[1].expanded);
}

#[tokio::test]
async fn thinking_after_visible_text_is_placed_before_the_answer() {
    let mut h = harness();
    h.transport.push_chunks(vec![
        delta_frame("Sure. "),
        delta_frame("<think>check</think>"),
        delta_frame("Done."),
    ]);

    h.submit("Go");
    h.drive().await;

    assert_eq!(
        h.history(),
        vec![
            (Role::User, "Go".to_string()),
            (Role::Thinking, "check".to_string()),
            (Role::Assistant, "Sure. Done.".to_string()),
        ]
    );
}

#[tokio::test]
async fn text_after_a_stream_error_is_not_repeated() {
    let mut h = harness();
    h.transport.push_chunks(vec![
        delta_frame("<think>plan</think>Hello"),
        typed_frame(json!({"type": "error", "message": "tool hiccup"})),
        delta_frame(" World"),
    ]);

    h.submit("hi");
    assert_eq!(h.drive().await, RequestOutcome::Completed);

    assert_eq!(
        h.history(),
        vec![
            (Role::User, "hi".to_string()),
            (Role::Thinking, "plan".to_string()),
            (Role::Assistant, "Hello".to_string()),
            (Role::Assistant, "tool hiccup".to_string()),
            (Role::Assistant, " World".to_string()),
        ]
    );
    let chat = h.store.chat(&h.chat).unwrap();
    assert!(chat.history[3].error);
    assert!(!chat.history[4].error);

    h.transport.push_chunks(vec![delta_frame("ok")]);
    h.submit("again");
    h.drive().await;
    let sent = h.transport.requests();
    let echoed: Vec<Option<&str>> = sent[1]
        .body
        .messages
        .iter()
        .filter(|m| m.role == "assistant")
        .map(|m| m.content.as_text())
        .collect();
    assert_eq!(echoed, vec![Some("Hello"), Some(" World")]);
}

#[tokio::test]
async fn tool_augmented_stream_records_each_step() {
    let mut h = harness();
    let chat = h.chat.clone();
    h.store.set_mcp_mode(&chat, true);
    h.transport.push_chunks(vec![
        typed_frame(json!({"type": "reasoning", "content": "Need to search"})),
        typed_frame(json!({"type": "status", "message": "calling tool"})),
        typed_frame(json!({"type": "tool_call", "name": "search", "arguments": {"q": "x"}})),
        typed_frame(json!({"type": "tool_result", "name": "search", "result": "found"})),
        typed_frame(json!({"type": "mystery", "content": "?"})),
        typed_frame(json!({"type": "assistant", "content": "Found it"})),
    ]);

    h.submit("Find x");
    assert_eq!(h.drive().await, RequestOutcome::Completed);

    let roles: Vec<Role> = h.history().into_iter().map(|(role, _)| role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Reasoning,
            Role::ToolCall,
            Role::ToolResult,
            Role::Assistant
        ]
    );
    let history = h.history();
    assert_eq!(history[4].1, "Found it");
    let call: serde_json::Value = serde_json::from_str(&history[2].1).unwrap();
    assert_eq!(call["name"], "search");
    assert_eq!(call["arguments"]["q"], "x");

    let chat = h.store.chat(&h.chat).unwrap();
    assert!(!chat.history[1].expanded);
    assert_eq!(
        h.transport.requests()[0].endpoint,
        "http://localhost:8080/mcp/chat/completions"
    );
}

#[tokio::test]
async fn consecutive_tool_calls_stay_separate() {
    let mut h = harness();
    h.transport.push_chunks(vec![
        typed_frame(json!({"type": "tool_call", "name": "a"})),
        typed_frame(json!({"type": "tool_call", "name": "b"})),
    ]);
    h.submit("two tools");
    h.drive().await;

    let roles: Vec<Role> = h.history().into_iter().map(|(role, _)| role).collect();
    assert_eq!(roles, vec![Role::User, Role::ToolCall, Role::ToolCall]);
}

#[tokio::test]
async fn cancel_discards_late_chunks() {
    let mut h = harness();
    let feed = h.transport.push_channel();
    let request_id = h.submit("Hello");

    feed.send(delta_frame("partial").into_bytes()).unwrap();
    loop {
        let message = h.rx.recv().await.unwrap();
        let is_events = matches!(message.kind, StreamMessageKind::Events(_));
        h.manager.handle_message(&mut h.store, message);
        if is_events {
            break;
        }
    }

    let chat = h.chat.clone();
    assert!(h.manager.cancel(&mut h.store, &chat));
    assert!(!h.manager.cancel(&mut h.store, &chat));
    assert_eq!(h.manager.last_outcome(&chat), Some(&RequestOutcome::Cancelled));

    let late = StreamMessage {
        chat_id: chat.clone(),
        request_id,
        kind: StreamMessageKind::Events(vec![StreamEvent::Content("late".into())]),
    };
    assert_eq!(h.manager.handle_message(&mut h.store, late), None);

    let history = h.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1], (Role::Assistant, "partial".to_string()));
    assert_eq!(history[2], (Role::Assistant, CANCELLED_MESSAGE.to_string()));
    assert!(h.store.chat(&chat).unwrap().history[2].error);
}

#[tokio::test]
async fn resubmitting_cancels_the_outstanding_request() {
    let mut h = harness();
    // The first task is cancelled before it is ever polled, so it never opens.
    h.transport.push_chunks(vec![delta_frame("second answer")]);

    let first = h.submit("one");
    let second = h.submit("two");
    assert_ne!(first, second);

    assert_eq!(h.drive().await, RequestOutcome::Completed);
    let history = h.history();
    assert_eq!(
        history,
        vec![
            (Role::User, "one".to_string()),
            (Role::Assistant, CANCELLED_MESSAGE.to_string()),
            (Role::User, "two".to_string()),
            (Role::Assistant, "second answer".to_string()),
        ]
    );

    // The cancelled notice is presentation-only.
    let sent = h.transport.requests();
    let roles: Vec<&str> = sent[sent.len() - 1].body.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "user"]);
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out() {
    let mut h = harness();
    h.transport.push_pending();
    h.submit("Hello");

    assert_eq!(h.drive().await, RequestOutcome::TimedOut);
    let history = h.history();
    assert!(history[1].1.starts_with("Request timeout"));
    assert!(history[1].1.contains("30 seconds"));
}

#[tokio::test(start_paused = true)]
async fn slow_but_steady_stream_outlives_the_idle_limit() {
    let mut h = harness();
    let frames: Vec<String> = (0..40).map(|i| delta_frame(&format!("{i} "))).collect();
    h.transport.push_paced(frames, Duration::from_secs(1));
    h.submit("Count slowly");

    assert_eq!(h.drive().await, RequestOutcome::Completed);
    let history = h.history();
    assert_eq!(history.len(), 2);
    assert!(history[1].1.starts_with("0 1 2 "));
    assert!(history[1].1.ends_with("39 "));
}

#[tokio::test]
async fn deadline_moves_with_stream_activity() {
    let mut h = harness();
    let feed = h.transport.push_channel();
    h.submit("Hello");
    let chat = h.chat.clone();
    let first_deadline = h.manager.active_request(&chat).unwrap().deadline;

    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(20)).await;
    feed.send(delta_frame("still here").into_bytes()).unwrap();
    loop {
        let message = h.rx.recv().await.unwrap();
        let is_events = matches!(message.kind, StreamMessageKind::Events(_));
        h.manager.handle_message(&mut h.store, message);
        if is_events {
            break;
        }
    }

    let deadline = h.manager.active_request(&chat).unwrap().deadline;
    assert!(deadline >= first_deadline + Duration::from_secs(20));
    assert!(h
        .manager
        .check_deadlines(&mut h.store, first_deadline + Duration::from_secs(1))
        .is_empty());
    assert_eq!(
        h.manager.check_deadlines(&mut h.store, deadline),
        vec![chat.clone()]
    );
}

#[tokio::test]
async fn error_status_fails_the_request() {
    let mut h = harness();
    h.transport.push_error(TransportError::Status {
        endpoint: "http://localhost:8080/chat/completions".into(),
        status: 500,
        body: String::new(),
    });
    h.submit("Hello");

    let outcome = h.drive().await;
    assert_eq!(
        outcome,
        RequestOutcome::Failed("Error: POST http://localhost:8080/chat/completions 500".into())
    );
    let history = h.history();
    assert_eq!(
        history[1],
        (
            Role::Assistant,
            "Error: POST http://localhost:8080/chat/completions 500".to_string()
        )
    );
}

#[tokio::test]
async fn deadline_check_times_out_stuck_requests() {
    let mut h = harness();
    h.transport.push_pending();
    h.submit("Hello");

    let chat = h.chat.clone();
    assert!(h
        .manager
        .check_deadlines(&mut h.store, Instant::now())
        .is_empty());
    let expired = h
        .manager
        .check_deadlines(&mut h.store, Instant::now() + Duration::from_secs(31));
    assert_eq!(expired, vec![chat.clone()]);
    assert_eq!(h.manager.last_outcome(&chat), Some(&RequestOutcome::TimedOut));
    assert!(h.history()[1].1.starts_with("Request timeout"));
}

#[tokio::test]
async fn rates_track_only_the_displayed_chat() {
    let mut h = harness();
    let feed = h.transport.push_channel();
    h.submit("Hello");
    feed.send(delta_frame("abcdefgh").into_bytes()).unwrap();
    loop {
        let message = h.rx.recv().await.unwrap();
        let is_events = matches!(message.kind, StreamMessageKind::Events(_));
        h.manager.handle_message(&mut h.store, message);
        if is_events {
            break;
        }
    }

    let chat = h.chat.clone();
    let started = h.manager.active_request(&chat).unwrap().started_at;
    assert_eq!(h.manager.active_request(&chat).unwrap().tokens_received, 2);

    h.manager
        .poll_rates(&ChatId::from("other"), started + Duration::from_secs(1));
    assert_eq!(h.manager.rate_display(&chat), Some(0.0));

    h.manager.poll_rates(&chat, started + Duration::from_secs(1));
    assert_eq!(h.manager.rate_display(&chat), Some(2.0));
    h.manager.poll_rates(&chat, started + Duration::from_secs(4));
    assert_eq!(h.manager.rate_display(&chat), Some(0.5));

    drop(feed);
    assert_eq!(h.drive().await, RequestOutcome::Completed);
    assert_eq!(h.manager.rate_display(&chat), Some(2.0));
}

#[tokio::test]
async fn forgetting_a_chat_writes_nothing() {
    let mut h = harness();
    h.transport.push_pending();
    h.submit("Hello");
    let chat = h.chat.clone();

    h.manager.forget_chat(&chat);
    assert!(!h.manager.is_active(&chat));
    assert_eq!(h.history().len(), 1);
    assert_eq!(h.manager.last_outcome(&chat), None);
}

#[test]
fn empty_prompt_is_rejected() {
    let mut h = harness();
    let chat = h.chat.clone();
    assert_eq!(
        h.manager
            .submit(&mut h.store, &chat, "   ", Attachments::default()),
        Err(RequestError::EmptyPrompt)
    );
    assert_eq!(
        h.manager.submit(
            &mut h.store,
            &ChatId::from("missing"),
            "hi",
            Attachments::default()
        ),
        Err(RequestError::UnknownChat(ChatId::from("missing")))
    );
    assert!(h.history().is_empty());
}

#[test]
fn token_estimate_rounds_up() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("a"), 1);
    assert_eq!(estimate_tokens("abcd"), 1);
    assert_eq!(estimate_tokens("abcde"), 2);
}

//! Tests for conversation sessions driven by a scripted completion service

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use workbench_core::{
    ChannelObserver, ConversationPersistence, MemoryStore, PersistentStore, Scope, SessionEvent,
};
use workbench_llm::{CompletionRequest, CompletionService, Frame, FrameStream, TransportError};
use workbench_session::{ConversationSession, FailureReason, SessionError, TurnOutcome};

enum Script {
    Frames(Vec<Frame>),
    Live(mpsc::UnboundedReceiver<Frame>),
    Unreachable,
    Panic,
}

/// Answers each request with the next script in line.
#[derive(Default)]
struct ScriptedService {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedService {
    fn answer(&self, deltas: &[&str]) {
        let mut frames: Vec<Frame> = deltas.iter().map(|delta| Frame::content(*delta)).collect();
        frames.push(Frame::Done);
        self.push(Script::Frames(frames));
    }

    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    fn live(&self) -> mpsc::UnboundedSender<Frame> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        self.push(Script::Live(frame_rx));
        frame_tx
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionService for ScriptedService {
    async fn open_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<FrameStream, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script left for request");

        match script {
            Script::Frames(frames) => Ok(Box::pin(futures::stream::iter(
                frames.into_iter().map(Ok).collect::<Vec<_>>(),
            ))),
            Script::Live(mut frame_rx) => Ok(Box::pin(async_stream::stream! {
                while let Some(frame) = frame_rx.recv().await {
                    yield Ok(frame);
                }
            })),
            Script::Unreachable => Err(TransportError::Connect("refused".to_string())),
            Script::Panic => Ok(Box::pin(futures::stream::poll_fn(
                |_| -> Poll<Option<Result<Frame, TransportError>>> { panic!("stream exploded") },
            ))),
        }
    }
}

struct Harness {
    session: ConversationSession,
    service: Arc<ScriptedService>,
    store: Arc<MemoryStore>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

async fn harness(scope: Scope) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_with_store(scope, store).await
}

async fn harness_with_store(scope: Scope, store: Arc<MemoryStore>) -> Harness {
    let service = Arc::new(ScriptedService::default());
    let persistence = ConversationPersistence::new(store.clone());
    let (observer, event_rx) = ChannelObserver::channel();
    let session = ConversationSession::load(scope, persistence, service.clone())
        .await
        .unwrap()
        .with_observer(Arc::new(observer));

    Harness {
        session,
        service,
        store,
        event_rx,
    }
}

fn contents(session: &ConversationSession) -> Vec<String> {
    session
        .visible_messages()
        .iter()
        .map(|m| m.content.clone())
        .collect()
}

fn drain(event_rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_send_turn_commits_and_persists() {
    let mut h = harness(Scope::Default).await;
    h.service.answer(&["Hel", "lo"]);

    let outcome = h.session.send_turn("Hi").await.unwrap();
    h.session.flush().await;

    assert!(outcome.is_completed());
    assert_eq!(outcome.message().content, "Hello");
    assert_eq!(contents(&h.session), vec!["Hi", "Hello"]);

    let record = h.store.get("conversation/default").await.unwrap().unwrap();
    assert_eq!(record["baseMessages"][1]["content"], json!("Hello"));

    let updates = drain(&mut h.event_rx)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::MessageUpdated { .. }))
        .count();
    assert_eq!(updates, 2);
}

#[tokio::test]
async fn test_request_carries_history_and_document() {
    let mut h = harness(Scope::Document("manual".to_string())).await;
    h.service.answer(&["A1"]);
    h.service.answer(&["A2"]);

    h.session.send_turn("Q1").await.unwrap();
    h.session.send_turn("Q2").await.unwrap();

    let requests = h.service.requests.lock().unwrap();
    let last = requests.last().unwrap();
    let history: Vec<&str> = last.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(history, vec!["Q1", "A1", "Q2"]);
    assert_eq!(last.doc_id.as_deref(), Some("manual"));
}

#[tokio::test]
async fn test_second_turn_rejected_while_streaming() {
    let mut h = harness(Scope::Default).await;
    let frame_tx = h.service.live();

    h.session.start_turn("first").await.unwrap();
    let err = h.session.start_turn("second").await.unwrap_err();
    assert!(matches!(err, SessionError::StreamInProgress));
    assert!(matches!(
        h.session.start_regenerate(0).await,
        Err(SessionError::StreamInProgress)
    ));

    frame_tx.send(Frame::content("ok")).unwrap();
    frame_tx.send(Frame::Done).unwrap();
    let outcome = h.session.finish_turn().await.unwrap();

    assert_eq!(outcome.message().content, "ok");
    assert_eq!(contents(&h.session), vec!["first", "ok"]);
    assert_eq!(h.service.request_count(), 1);
}

#[tokio::test]
async fn test_finish_without_stream_is_an_error() {
    let mut h = harness(Scope::Default).await;
    assert!(matches!(
        h.session.finish_turn().await,
        Err(SessionError::NoActiveStream)
    ));
}

#[tokio::test]
async fn test_model_error_commits_partial_answer() {
    let mut h = harness(Scope::Default).await;
    h.service.push(Script::Frames(vec![
        Frame::content("Half an ans"),
        Frame::error("overloaded"),
        Frame::content("wer"),
    ]));

    let outcome = h.session.send_turn("Q").await.unwrap();

    match outcome {
        TurnOutcome::Failed { partial, reason } => {
            assert_eq!(partial.content, "Half an ans");
            assert_eq!(reason, FailureReason::Model("overloaded".to_string()));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(contents(&h.session), vec!["Q", "Half an ans"]);
}

#[tokio::test]
async fn test_unreachable_service_fails_the_turn() {
    let mut h = harness(Scope::Default).await;
    h.service.push(Script::Unreachable);

    let outcome = h.session.send_turn("Q").await.unwrap();

    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            reason: FailureReason::Transport(TransportError::Connect(_)),
            ..
        }
    ));
    assert_eq!(contents(&h.session), vec!["Q", ""]);
}

#[tokio::test]
async fn test_user_cancel_keeps_partial_answer() {
    let mut h = harness(Scope::Default).await;
    let frame_tx = h.service.live();

    h.session.start_turn("Q").await.unwrap();
    frame_tx.send(Frame::content("so far")).unwrap();
    wait_for_update(&mut h.event_rx, "so far").await;

    assert!(h.session.cancel_stream());
    let outcome = h.session.finish_turn().await.unwrap();

    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            reason: FailureReason::Cancelled,
            ..
        }
    ));
    assert_eq!(contents(&h.session), vec!["Q", "so far"]);
}

#[tokio::test]
async fn test_regenerate_keeps_both_answers() {
    let mut h = harness(Scope::Default).await;
    h.service.answer(&["A1"]);
    h.service.answer(&["A1 again"]);
    h.service.answer(&["A1 third"]);

    h.session.send_turn("Q1").await.unwrap();
    let outcome = h.session.regenerate(0).await.unwrap();

    assert_eq!(outcome.message().content, "A1 again");
    let conversation = h.session.conversation();
    assert_eq!(conversation.base_messages.len(), 1);
    assert_eq!(conversation.branches.len(), 2);
    assert_eq!(conversation.branches[0].messages[0].content, "A1");
    assert_eq!(conversation.branches[1].version, 2);
    assert_eq!(contents(&h.session), vec!["Q1", "A1 again"]);

    h.session.regenerate(0).await.unwrap();
    let versions: Vec<u32> = h
        .session
        .branches()
        .list_branches_at(1)
        .iter()
        .map(|b| b.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    // The regenerate request ends with the question being answered.
    let requests = h.service.requests.lock().unwrap();
    let history: Vec<&str> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(history, vec!["Q1"]);
}

#[tokio::test]
async fn test_switching_mid_stream_discards_the_stream() {
    let mut h = harness(Scope::Default).await;
    h.service.answer(&["A1"]);
    h.service.answer(&["A1b"]);
    h.session.send_turn("Q1").await.unwrap();
    h.session.regenerate(0).await.unwrap();

    let branches = h.session.branches().list_branches_at(1);
    let first = branches[0].branch_id.clone();
    let second = branches[1].branch_id.clone();
    assert_eq!(h.session.branches().current_branch_id(), Some(second.as_str()));

    let frame_tx = h.service.live();
    h.session.start_turn("Q2").await.unwrap();
    frame_tx.send(Frame::content("streaming into v2")).unwrap();
    wait_for_update(&mut h.event_rx, "streaming into v2").await;

    h.session.switch_to(&first).await.unwrap();
    assert!(!h.session.is_streaming());

    // The stream was dropped; anything sent now goes nowhere.
    let _ = frame_tx.send(Frame::content(" late"));
    let _ = frame_tx.send(Frame::Done);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = drain(&mut h.event_rx);
    assert!(
        events
            .iter()
            .all(|event| matches!(event, SessionEvent::BranchChanged { .. })),
        "no update may follow the switch: {events:?}"
    );
    assert_eq!(contents(&h.session), vec!["Q1", "A1"]);

    h.session.switch_to(&second).await.unwrap();
    assert_eq!(contents(&h.session), vec!["Q1", "A1b"]);
}

#[tokio::test]
async fn test_switch_during_regenerate_leaves_reply_pending() {
    let mut h = harness(Scope::Default).await;
    h.service.answer(&["A1"]);
    h.session.send_turn("Q1").await.unwrap();

    let frame_tx = h.service.live();
    h.session.start_regenerate(0).await.unwrap();
    frame_tx.send(Frame::content("half")).unwrap();
    wait_for_update(&mut h.event_rx, "half").await;

    let branches = h.session.branches().list_branches_at(1);
    let first = branches[0].branch_id.clone();
    let second = branches[1].branch_id.clone();
    h.session.switch_to(&first).await.unwrap();
    assert_eq!(contents(&h.session), vec!["Q1", "A1"]);

    h.session.switch_to(&second).await.unwrap();
    assert_eq!(contents(&h.session), vec!["Q1"]);
    assert!(h.session.branches().awaiting_reply());
    assert!(matches!(
        h.session.send_turn("Q2").await,
        Err(SessionError::AwaitingReply)
    ));
    assert_eq!(h.service.request_count(), 2);

    h.service.answer(&["A1 retried"]);
    assert!(h.session.reply().await.unwrap().is_completed());
    assert_eq!(contents(&h.session), vec!["Q1", "A1 retried"]);
    {
        let requests = h.service.requests.lock().unwrap();
        let history: Vec<&str> = requests[2].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["Q1"]);
    }

    h.service.answer(&["A2"]);
    h.session.send_turn("Q2").await.unwrap();
    assert_eq!(contents(&h.session), vec!["Q1", "A1 retried", "Q2", "A2"]);

    // The question stays regenerable on the recovered branch.
    h.service.answer(&["A1 third"]);
    h.session.regenerate(0).await.unwrap();
    let versions: Vec<u32> = h
        .session
        .branches()
        .list_branches_at(1)
        .iter()
        .map(|b| b.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(contents(&h.session), vec!["Q1", "A1 third"]);
}

#[tokio::test]
async fn test_reply_without_pending_question_is_rejected() {
    let mut h = harness(Scope::Default).await;
    assert!(matches!(
        h.session.reply().await,
        Err(SessionError::NothingToReply)
    ));

    h.service.answer(&["A"]);
    h.session.send_turn("Q").await.unwrap();
    assert!(matches!(
        h.session.start_reply().await,
        Err(SessionError::NothingToReply)
    ));
    assert_eq!(h.service.request_count(), 1);
}

#[tokio::test]
async fn test_delete_during_regenerate_starts_fresh() {
    let mut h = harness(Scope::Default).await;
    h.service.answer(&["A1"]);
    h.session.send_turn("Q1").await.unwrap();

    let frame_tx = h.service.live();
    h.session.start_regenerate(0).await.unwrap();
    frame_tx.send(Frame::content("half")).unwrap();
    wait_for_update(&mut h.event_rx, "half").await;

    assert!(h.session.delete().await.unwrap());
    assert!(!h.session.is_streaming());
    assert!(h.session.visible_messages().is_empty());
    assert!(!h.session.branches().awaiting_reply());

    let _ = frame_tx.send(Frame::Done);
    h.service.answer(&["fresh answer"]);
    h.session.send_turn("fresh question").await.unwrap();
    h.session.flush().await;
    assert_eq!(contents(&h.session), vec!["fresh question", "fresh answer"]);
    assert!(h.store.get("conversation/default").await.unwrap().is_some());
}

#[tokio::test]
async fn test_panicking_stream_keeps_the_question() {
    let mut h = harness(Scope::Default).await;
    h.service.push(Script::Panic);

    h.session.start_turn("Q").await.unwrap();
    assert!(matches!(
        h.session.finish_turn().await,
        Err(SessionError::Task(_))
    ));

    assert!(!h.session.is_streaming());
    assert_eq!(contents(&h.session), vec!["Q", ""]);
    h.session.flush().await;
    let stored = h.store.get("conversation/default").await.unwrap().unwrap();
    assert_eq!(stored["baseMessages"][0]["content"], json!("Q"));
}

#[tokio::test]
async fn test_unknown_branch_leaves_stream_running() {
    let mut h = harness(Scope::Default).await;
    let frame_tx = h.service.live();
    h.session.start_turn("Q").await.unwrap();

    assert!(matches!(
        h.session.switch_to("missing").await,
        Err(SessionError::Branch(_))
    ));
    assert!(h.session.is_streaming());

    frame_tx.send(Frame::Done).unwrap();
    assert!(h.session.finish_turn().await.unwrap().is_completed());
}

#[tokio::test]
async fn test_session_resumes_from_legacy_record() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(
            "messages/module:intro",
            json!([
                {"role": "user", "content": "old question"},
                {"role": "assistant", "content": "old answer"}
            ]),
        )
        .await
        .unwrap();

    let mut h = harness_with_store(Scope::Module("intro".to_string()), store).await;
    assert_eq!(contents(&h.session), vec!["old question", "old answer"]);

    h.service.answer(&["new answer"]);
    h.session.send_turn("new question").await.unwrap();
    h.session.flush().await;

    let persistence = ConversationPersistence::new(h.store.clone());
    let stored = persistence
        .load(&Scope::Module("intro".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.branches.len(), 1);
    assert_eq!(stored.branches[0].messages.len(), 4);
}

#[tokio::test]
async fn test_delete_resets_the_conversation() {
    let mut h = harness(Scope::Default).await;
    h.service.answer(&["A"]);
    h.session.send_turn("Q").await.unwrap();

    assert!(h.session.delete().await.unwrap());

    assert!(h.session.visible_messages().is_empty());
    assert_eq!(h.store.get("conversation/default").await.unwrap(), None);
}

async fn wait_for_update(event_rx: &mut mpsc::UnboundedReceiver<SessionEvent>, content: &str) {
    let deadline = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = event_rx.recv().await {
            if let SessionEvent::MessageUpdated { message, .. } = event {
                if message.content == content {
                    return;
                }
            }
        }
    });
    deadline.await.expect("update did not arrive");
}

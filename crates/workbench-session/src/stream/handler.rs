use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use workbench_core::ConversationObserver;
use workbench_llm::{CompletionRequest, CompletionService, FrameStream};

use crate::assembler::{FailureReason, ResponseAssembler, StreamOutcome, Transition};

/// Open a stream and assemble one answer from it.
///
/// Cancellation is honoured while connecting as well as while streaming.
pub async fn run_completion(
    service: Arc<dyn CompletionService>,
    request: CompletionRequest,
    mut assembler: ResponseAssembler,
    cancel_token: CancellationToken,
    branch_id: Option<String>,
    observer: Arc<dyn ConversationObserver>,
) -> StreamOutcome {
    let opened = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => None,
        opened = service.open_stream(&request) => Some(opened),
    };

    let stream = match opened {
        Some(Ok(stream)) => stream,
        Some(Err(error)) => {
            assembler.fail(FailureReason::Transport(error));
            return assembler.into_outcome();
        }
        None => {
            assembler.fail(FailureReason::Cancelled);
            return assembler.into_outcome();
        }
    };

    consume_frame_stream(
        stream,
        assembler,
        &cancel_token,
        branch_id.as_deref(),
        observer.as_ref(),
    )
    .await
}

/// Feed frames into `assembler` until it reaches a terminal state.
///
/// `on_update` fires once per frame that changed the message, and never
/// after `cancel_token` has been cancelled. The stream is dropped before
/// returning, which releases the underlying reader.
pub async fn consume_frame_stream(
    mut stream: FrameStream,
    mut assembler: ResponseAssembler,
    cancel_token: &CancellationToken,
    branch_id: Option<&str>,
    observer: &dyn ConversationObserver,
) -> StreamOutcome {
    let target = branch_id.unwrap_or("base");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log::info!("[{}] Stream cancelled", target);
                assembler.fail(FailureReason::Cancelled);
                break;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(frame)) => match assembler.apply(frame) {
                Transition::Updated => {
                    if cancel_token.is_cancelled() {
                        assembler.fail(FailureReason::Cancelled);
                        break;
                    }
                    observer.on_update(branch_id, assembler.message());
                }
                Transition::Completed => {
                    log::debug!("[{}] Stream completed", target);
                    break;
                }
                Transition::Failed(_) => break,
                Transition::Ignored => {}
            },
            Some(Err(error)) => {
                assembler.fail(FailureReason::Transport(error));
                break;
            }
            None => {
                assembler.end_of_stream();
                break;
            }
        }
    }

    drop(stream);
    assembler.into_outcome()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream;
    use workbench_core::Message;
    use workbench_llm::{Frame, TransportError};

    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        updates: Mutex<Vec<(Option<String>, String)>>,
    }

    impl ConversationObserver for RecordingObserver {
        fn on_update(&self, branch_id: Option<&str>, message: &Message) {
            self.updates
                .lock()
                .unwrap()
                .push((branch_id.map(str::to_string), message.content.clone()));
        }
    }

    fn build_stream(items: Vec<Result<Frame, TransportError>>) -> FrameStream {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn consume_frame_stream_notifies_per_content_frame() {
        let observer = RecordingObserver::default();
        let stream = build_stream(vec![
            Ok(Frame::content("Hel")),
            Ok(Frame::content("lo")),
            Ok(Frame::Done),
        ]);

        let outcome = consume_frame_stream(
            stream,
            ResponseAssembler::new(),
            &CancellationToken::new(),
            Some("b1"),
            &observer,
        )
        .await;

        assert!(matches!(&outcome, StreamOutcome::Completed(m) if m.content == "Hello"));
        let updates = observer.updates.lock().unwrap();
        assert_eq!(
            *updates,
            vec![
                (Some("b1".to_string()), "Hel".to_string()),
                (Some("b1".to_string()), "Hello".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn consume_frame_stream_maps_transport_errors() {
        let observer = RecordingObserver::default();
        let stream = build_stream(vec![
            Ok(Frame::content("par")),
            Err(TransportError::Stream("reset".to_string())),
            Ok(Frame::content("never")),
        ]);

        let outcome = consume_frame_stream(
            stream,
            ResponseAssembler::new(),
            &CancellationToken::new(),
            None,
            &observer,
        )
        .await;

        match outcome {
            StreamOutcome::Failed { partial, reason } => {
                assert_eq!(partial.content, "par");
                assert!(matches!(reason, FailureReason::Transport(_)));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(observer.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_update() {
        let observer = RecordingObserver::default();
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let outcome = consume_frame_stream(
            build_stream(vec![Ok(Frame::content("x")), Ok(Frame::Done)]),
            ResponseAssembler::new(),
            &cancel_token,
            None,
            &observer,
        )
        .await;

        assert!(matches!(
            outcome,
            StreamOutcome::Failed {
                reason: FailureReason::Cancelled,
                ..
            }
        ));
        assert!(observer.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_closed_before_done_fails_with_partial() {
        let observer = RecordingObserver::default();

        let outcome = consume_frame_stream(
            build_stream(vec![Ok(Frame::content("tail"))]),
            ResponseAssembler::new(),
            &CancellationToken::new(),
            None,
            &observer,
        )
        .await;

        match outcome {
            StreamOutcome::Failed { partial, reason } => {
                assert_eq!(partial.content, "tail");
                assert!(matches!(reason, FailureReason::Transport(_)));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(observer.updates.lock().unwrap().len(), 1);
    }
}

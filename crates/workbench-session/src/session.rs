use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use workbench_core::{
    BranchStore, CitationResolver, Conversation, ConversationObserver, ConversationPersistence,
    Message, NoopObserver, Scope,
};
use workbench_llm::{CompletionRequest, CompletionService};

use crate::assembler::{FailureReason, ResponseAssembler, StreamOutcome};
use crate::commit::CommitQueue;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::stream::run_completion;

/// How a turn ended. Failures carry whatever the model produced before the
/// stream stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { message: Message },
    Failed { partial: Message, reason: FailureReason },
}

impl TurnOutcome {
    pub fn message(&self) -> &Message {
        match self {
            TurnOutcome::Completed { message } => message,
            TurnOutcome::Failed { partial, .. } => partial,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}

impl From<StreamOutcome> for TurnOutcome {
    fn from(outcome: StreamOutcome) -> Self {
        match outcome {
            StreamOutcome::Completed(message) => TurnOutcome::Completed { message },
            StreamOutcome::Failed { partial, reason } => TurnOutcome::Failed { partial, reason },
        }
    }
}

/// What the active stream will be committed as.
#[derive(Debug)]
enum PendingTurn {
    /// A new question; committed together with its answer.
    Question(Message),
    /// An answer for the question already at the end of the visible list.
    Reply,
}

struct ActiveStream {
    cancel_token: CancellationToken,
    turn: PendingTurn,
    branch_id: Option<String>,
    handle: JoinHandle<StreamOutcome>,
}

/// One conversation: its branch tree, its persisted record and at most one
/// in-flight completion stream.
pub struct ConversationSession {
    scope: Scope,
    branches: BranchStore,
    persistence: ConversationPersistence,
    service: Arc<dyn CompletionService>,
    resolver: Option<Arc<dyn CitationResolver>>,
    observer: Arc<dyn ConversationObserver>,
    config: SessionConfig,
    active: Option<ActiveStream>,
    commits: CommitQueue,
}

impl ConversationSession {
    pub fn new(
        scope: Scope,
        conversation: Conversation,
        persistence: ConversationPersistence,
        service: Arc<dyn CompletionService>,
    ) -> Self {
        let mut config = SessionConfig::default();
        config.adopt_conversation(&conversation);

        Self {
            scope,
            branches: BranchStore::new(conversation),
            persistence,
            service,
            resolver: None,
            observer: Arc::new(NoopObserver),
            config,
            active: None,
            commits: CommitQueue::new(),
        }
    }

    /// Restore the scope's conversation, or start an empty one.
    pub async fn load(
        scope: Scope,
        persistence: ConversationPersistence,
        service: Arc<dyn CompletionService>,
    ) -> Result<Self> {
        let conversation = match persistence.load(&scope).await? {
            Some(conversation) => {
                log::info!(
                    "[{}] Restored conversation {} ({} branch(es))",
                    scope,
                    conversation.id,
                    conversation.branches.len()
                );
                conversation
            }
            None => {
                let mut conversation = Conversation::new();
                conversation.doc_id = scope.doc_id().map(str::to_string);
                conversation
            }
        };

        // Records from storage were validated on load.
        Ok(Self::new(scope, conversation, persistence, service))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConversationObserver>) -> Self {
        self.branches.set_observer(observer.clone());
        self.observer = observer;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CitationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self.config.adopt_conversation(self.branches.conversation());
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn branches(&self) -> &BranchStore {
        &self.branches
    }

    pub fn conversation(&self) -> &Conversation {
        self.branches.conversation()
    }

    pub fn visible_messages(&self) -> Vec<Message> {
        self.branches.visible_messages()
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Start answering a new user message. Rejected while another answer is
    /// streaming, or while the last question on the current branch has no
    /// answer (see [`ConversationSession::start_reply`]).
    pub async fn start_turn(&mut self, content: impl Into<String>) -> Result<()> {
        self.ensure_idle()?;
        if self.branches.awaiting_reply() {
            return Err(SessionError::AwaitingReply);
        }
        self.commits.flush().await;

        let question = Message::user(content);
        let mut messages = self.branches.visible_messages();
        messages.push(question.clone());

        self.spawn_stream(messages, PendingTurn::Question(question));
        Ok(())
    }

    /// Regenerate the answer to the user message at `message_index` on a new
    /// branch, keeping the earlier answer on its own branch.
    pub async fn start_regenerate(&mut self, message_index: usize) -> Result<()> {
        self.ensure_idle()?;
        self.commits.flush().await;

        // The first fork at a point only preserves the existing answer as
        // version 1; a second fork opens the empty branch to fill.
        let needs_empty_branch = !self.branches.fork_at(message_index)?.messages.is_empty();
        if needs_empty_branch {
            self.branches.fork_at(message_index)?;
        }
        self.commit().await;

        let messages = self.branches.visible_messages();
        self.spawn_stream(messages, PendingTurn::Reply);
        Ok(())
    }

    /// Answer the unanswered question at the end of the visible list, for
    /// example after a regenerate was interrupted by a branch switch.
    pub async fn start_reply(&mut self) -> Result<()> {
        self.ensure_idle()?;
        if !self.branches.awaiting_reply() {
            return Err(SessionError::NothingToReply);
        }
        self.commits.flush().await;

        let messages = self.branches.visible_messages();
        self.spawn_stream(messages, PendingTurn::Reply);
        Ok(())
    }

    /// Wait for the active stream and commit its result to the branch it was
    /// started on.
    pub async fn finish_turn(&mut self) -> Result<TurnOutcome> {
        let active = self.active.take().ok_or(SessionError::NoActiveStream)?;
        let outcome = match active.handle.await {
            Ok(outcome) => outcome,
            Err(error) => {
                log::error!("[{}] Stream task failed: {}", self.scope, error);
                // Keep the question; a pending reply stays open for start_reply.
                if let PendingTurn::Question(question) = active.turn {
                    self.branches.append_turn(question, Message::assistant(""))?;
                    self.commit().await;
                }
                return Err(SessionError::Task(error.to_string()));
            }
        };

        let answer = outcome.message().clone();
        match active.turn {
            PendingTurn::Question(question) => self.branches.append_turn(question, answer)?,
            PendingTurn::Reply => self.branches.append_reply(answer)?,
        }

        match &outcome {
            StreamOutcome::Completed(_) => log::info!(
                "[{}] Turn completed on {}",
                self.scope,
                active.branch_id.as_deref().unwrap_or("base")
            ),
            StreamOutcome::Failed { reason, .. } => log::warn!(
                "[{}] Turn failed on {}: {}",
                self.scope,
                active.branch_id.as_deref().unwrap_or("base"),
                reason
            ),
        }

        self.commit().await;
        Ok(outcome.into())
    }

    pub async fn send_turn(&mut self, content: impl Into<String>) -> Result<TurnOutcome> {
        self.start_turn(content).await?;
        self.finish_turn().await
    }

    pub async fn regenerate(&mut self, message_index: usize) -> Result<TurnOutcome> {
        self.start_regenerate(message_index).await?;
        self.finish_turn().await
    }

    pub async fn reply(&mut self) -> Result<TurnOutcome> {
        self.start_reply().await?;
        self.finish_turn().await
    }

    /// Ask the active stream to stop. The partial answer is still committed
    /// by [`ConversationSession::finish_turn`].
    pub fn cancel_stream(&self) -> bool {
        match &self.active {
            Some(active) => {
                active.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Switch branches. An answer still streaming is cancelled and discarded
    /// first, so it can never land in the newly current branch.
    pub async fn switch_to(&mut self, branch_id: &str) -> Result<()> {
        if self.branches.branch(branch_id).is_none() {
            return Err(workbench_core::BranchError::UnknownBranch(branch_id.to_string()).into());
        }
        self.abandon_stream().await;
        self.branches.switch_to(branch_id)?;
        self.commit().await;
        Ok(())
    }

    /// Fork without regenerating. Cancels and discards any active stream.
    pub async fn fork_at(&mut self, message_index: usize) -> Result<String> {
        self.abandon_stream().await;
        let branch_id = self.branches.fork_at(message_index)?.branch_id.clone();
        self.commit().await;
        Ok(branch_id)
    }

    /// Delete the persisted conversation and start over with an empty one.
    pub async fn delete(&mut self) -> Result<bool> {
        self.abandon_stream().await;
        self.commits.flush().await;
        let removed = self.persistence.delete(&self.scope).await?;

        let mut conversation = Conversation::new();
        conversation.doc_id = self.scope.doc_id().map(str::to_string);
        self.branches = BranchStore::new(conversation).with_observer(self.observer.clone());
        Ok(removed)
    }

    /// Wait until every commit has been written.
    pub async fn flush(&mut self) {
        self.commits.flush().await;
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.active.is_some() {
            return Err(SessionError::StreamInProgress);
        }
        Ok(())
    }

    fn spawn_stream(&mut self, messages: Vec<Message>, turn: PendingTurn) {
        let branch_id = self.branches.current_branch_id().map(str::to_string);
        let document = self.config.document.clone();

        let mut request = CompletionRequest::new(messages)
            .with_document(document.doc_id.clone(), document.knowledge_base_id.clone())
            .with_evaluation(self.config.enable_evaluation);
        if let Some(context) = &self.config.context {
            request = request.with_context(context.clone());
        }

        let assembler = ResponseAssembler::new()
            .with_document(document)
            .with_resolver(self.resolver.clone());
        let cancel_token = CancellationToken::new();

        log::debug!(
            "[{}] Streaming answer into {}",
            self.scope,
            branch_id.as_deref().unwrap_or("base")
        );

        let handle = tokio::spawn(run_completion(
            self.service.clone(),
            request,
            assembler,
            cancel_token.clone(),
            branch_id.clone(),
            self.observer.clone(),
        ));

        self.active = Some(ActiveStream {
            cancel_token,
            turn,
            branch_id,
            handle,
        });
    }

    /// Cancel the active stream, wait for it to stop and drop its output.
    async fn abandon_stream(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel_token.cancel();
        if let Err(error) = active.handle.await {
            log::error!("[{}] Stream task failed: {}", self.scope, error);
        }
        log::info!(
            "[{}] Discarded stream for {}",
            self.scope,
            active.branch_id.as_deref().unwrap_or("base")
        );
    }

    async fn commit(&mut self) {
        self.commits
            .submit(
                self.persistence.clone(),
                self.scope.clone(),
                self.branches.conversation().clone(),
            )
            .await;
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel_token.cancel();
        }
    }
}

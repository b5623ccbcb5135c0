//! Tree-structured conversation history.
//!
//! A conversation is a shared prefix (`baseMessages`) plus branches. Each
//! branch continues the visible list of its parent (the prefix, or another
//! branch) from `branch_point` onwards:
//!
//! ```text
//! visible(branch) = visible(parent)[..branch_point] ++ branch.messages
//! visible(root)   = baseMessages
//! ```
//!
//! Branches that share a parent and a `branch_point` are the alternatives at
//! one fork point and are numbered by `version`.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{BranchError, BranchResult};
use crate::events::{ConversationObserver, NoopObserver};
use crate::model::{Branch, Conversation, EvaluationResult, Message};

/// The part of the visible list contributed by one lineage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    /// Index into `branches`; `None` for `baseMessages`.
    node: Option<usize>,
    start: usize,
    end: usize,
}

impl Segment {
    fn contains(&self, position: usize) -> bool {
        self.start <= position && position < self.end
    }
}

/// Alternatives available at one fork point of the current view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkPoint {
    pub branch_point: usize,
    pub parent_branch_id: Option<String>,
    /// Branch ids ordered by ascending version.
    pub branch_ids: Vec<String>,
    /// The alternative that lies on the current lineage, if any.
    pub active_branch_id: Option<String>,
}

pub struct BranchStore {
    conversation: Conversation,
    observer: Arc<dyn ConversationObserver>,
}

impl std::fmt::Debug for BranchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchStore")
            .field("conversation", &self.conversation)
            .finish_non_exhaustive()
    }
}

impl Default for BranchStore {
    fn default() -> Self {
        Self::new(Conversation::new())
    }
}

impl BranchStore {
    /// Wrap a conversation without validating it. Use
    /// [`BranchStore::from_conversation`] for records read from storage.
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn from_conversation(conversation: Conversation) -> BranchResult<Self> {
        validate(&conversation)?;
        Ok(Self::new(conversation))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConversationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn set_observer(&mut self, observer: Arc<dyn ConversationObserver>) {
        self.observer = observer;
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn into_conversation(self) -> Conversation {
        self.conversation
    }

    pub fn current_branch_id(&self) -> Option<&str> {
        self.conversation.current_branch_id.as_deref()
    }

    pub fn current_branch(&self) -> Option<&Branch> {
        self.current_index().map(|index| &self.conversation.branches[index])
    }

    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.conversation.branch(branch_id)
    }

    /// The message list a caller sees: the current lineage's prefix followed
    /// by the current branch's messages.
    pub fn visible_messages(&self) -> Vec<Message> {
        self.segments()
            .iter()
            .flat_map(|segment| {
                self.node_messages(segment.node)[..segment.end - segment.start]
                    .iter()
                    .cloned()
            })
            .collect()
    }

    pub fn visible_len(&self) -> usize {
        self.segments().last().map(|segment| segment.end).unwrap_or(0)
    }

    pub fn message_at(&self, index: usize) -> Option<&Message> {
        let segments = self.segments();
        let segment = owner(&segments, index)?;
        self.node_messages(segment.node).get(index - segment.start)
    }

    /// True when the visible list ends with a user message that has no reply
    /// yet (for example a freshly regenerated, still empty branch).
    pub fn awaiting_reply(&self) -> bool {
        let len = self.visible_len();
        len > 0 && self.message_at(len - 1).is_some_and(Message::is_user)
    }

    /// Append a completed user/assistant exchange to the current branch, or
    /// to `baseMessages` while the conversation has no branches.
    pub fn append_turn(&mut self, user: Message, assistant: Message) -> BranchResult<()> {
        if !user.is_user() {
            return Err(BranchError::InvalidTurn(
                "first message of a turn must have the user role".to_string(),
            ));
        }
        if !assistant.is_assistant() {
            return Err(BranchError::InvalidTurn(
                "second message of a turn must have the assistant role".to_string(),
            ));
        }

        log::debug!(
            "[{}] Appending turn to {}",
            self.conversation.id,
            self.current_branch_id().unwrap_or("base")
        );

        let target = self.current_messages_mut();
        target.push(user);
        target.push(assistant);
        self.conversation.touch();
        Ok(())
    }

    /// Append a lone assistant reply. Only valid while the visible list is
    /// awaiting a reply.
    pub fn append_reply(&mut self, assistant: Message) -> BranchResult<()> {
        if !assistant.is_assistant() {
            return Err(BranchError::InvalidTurn(
                "reply must have the assistant role".to_string(),
            ));
        }
        if !self.awaiting_reply() {
            return Err(BranchError::InvalidTurn(
                "conversation is not awaiting a reply".to_string(),
            ));
        }

        self.current_messages_mut().push(assistant);
        self.conversation.touch();
        Ok(())
    }

    /// Fork the conversation so the assistant answer following the user
    /// message at `message_index` can be regenerated.
    ///
    /// The first fork at a point moves the existing continuation into
    /// version 1 and leaves the visible list unchanged. Later forks at the
    /// same point create an empty branch with the next version and make it
    /// current.
    pub fn fork_at(&mut self, message_index: usize) -> BranchResult<&Branch> {
        self.check_regen_anchor(message_index)?;

        let branch_point = message_index + 1;
        let segments = self.segments();
        let donor = owner(&segments, message_index).ok_or_else(|| {
            BranchError::InvalidForkPoint {
                index: message_index,
                reason: "index is outside the visible conversation".to_string(),
            }
        })?;
        let parent_id = donor
            .node
            .map(|index| self.conversation.branches[index].branch_id.clone());

        let latest_version = self
            .conversation
            .branches
            .iter()
            .filter(|b| b.parent_branch_id == parent_id && b.branch_point == branch_point)
            .map(|b| b.version)
            .max();

        let created = match latest_version {
            Some(version) => {
                let branch = Branch::new(version + 1, branch_point, parent_id, Vec::new());
                self.conversation.current_branch_id = Some(branch.branch_id.clone());
                branch
            }
            None => self.split_continuation(donor, branch_point, parent_id),
        };

        log::info!(
            "[{}] Forked at message {}: branch {} (version {})",
            self.conversation.id,
            message_index,
            created.branch_id,
            created.version
        );

        self.conversation.branches.push(created);
        self.conversation.touch();
        self.notify_branch_changed();

        let index = self.conversation.branches.len() - 1;
        Ok(&self.conversation.branches[index])
    }

    pub fn switch_to(&mut self, branch_id: &str) -> BranchResult<()> {
        if self.index_of(branch_id).is_none() {
            return Err(BranchError::UnknownBranch(branch_id.to_string()));
        }

        log::info!(
            "[{}] Switching to branch {}",
            self.conversation.id,
            branch_id
        );

        self.conversation.current_branch_id = Some(branch_id.to_string());
        self.conversation.touch();
        self.notify_branch_changed();
        Ok(())
    }

    /// Alternatives at `branch_point` in the current view, by ascending
    /// version.
    pub fn list_branches_at(&self, branch_point: usize) -> Vec<&Branch> {
        let Some(parent_id) = self.fork_parent(branch_point) else {
            return Vec::new();
        };

        let mut branches: Vec<&Branch> = self
            .conversation
            .branches
            .iter()
            .filter(|b| b.branch_point == branch_point && b.parent_branch_id == parent_id)
            .collect();
        branches.sort_by_key(|b| b.version);
        branches
    }

    /// Every fork point reachable from the current view, in list order.
    pub fn fork_points(&self) -> Vec<ForkPoint> {
        let lineage: HashSet<usize> = self.lineage().into_iter().collect();

        (0..=self.visible_len())
            .filter_map(|branch_point| {
                let branches = self.list_branches_at(branch_point);
                let first = branches.first()?;
                let active_branch_id = branches
                    .iter()
                    .find(|b| {
                        self.index_of(&b.branch_id)
                            .is_some_and(|index| lineage.contains(&index))
                    })
                    .map(|b| b.branch_id.clone());

                Some(ForkPoint {
                    branch_point,
                    parent_branch_id: first.parent_branch_id.clone(),
                    branch_ids: branches.iter().map(|b| b.branch_id.clone()).collect(),
                    active_branch_id,
                })
            })
            .collect()
    }

    /// Attach an evaluation to the visible assistant message at `index`,
    /// replacing any earlier one.
    pub fn set_evaluation(
        &mut self,
        index: usize,
        evaluation: EvaluationResult,
    ) -> BranchResult<()> {
        let segments = self.segments();
        let segment = owner(&segments, index).ok_or_else(|| {
            BranchError::InvalidTurn(format!("no message at index {index}"))
        })?;
        let offset = index - segment.start;
        let message = match segment.node {
            Some(node) => &mut self.conversation.branches[node].messages[offset],
            None => &mut self.conversation.base_messages[offset],
        };
        if !message.is_assistant() {
            return Err(BranchError::InvalidTurn(format!(
                "message {index} is not an assistant message"
            )));
        }
        message.set_evaluation(evaluation);
        self.conversation.touch();
        Ok(())
    }

    fn check_regen_anchor(&self, message_index: usize) -> BranchResult<()> {
        let invalid = |reason: &str| BranchError::InvalidForkPoint {
            index: message_index,
            reason: reason.to_string(),
        };

        let anchor = self
            .message_at(message_index)
            .ok_or_else(|| invalid("index is outside the visible conversation"))?;
        if !anchor.is_user() {
            return Err(invalid("message is not a user message"));
        }
        let answer = self
            .message_at(message_index + 1)
            .ok_or_else(|| invalid("user message has no assistant reply"))?;
        if !answer.is_assistant() {
            return Err(invalid("user message is not followed by an assistant reply"));
        }
        Ok(())
    }

    /// First fork at a point: the donor's continuation becomes version 1.
    fn split_continuation(
        &mut self,
        donor: Segment,
        branch_point: usize,
        parent_id: Option<String>,
    ) -> Branch {
        let offset = branch_point - donor.start;
        let continuation = match donor.node {
            // baseMessages is not a branch, so it may be truncated.
            None => self.conversation.base_messages.split_off(offset),
            // Branch history is append-only: version 1 gets a copy.
            Some(index) => self.conversation.branches[index].messages[offset..].to_vec(),
        };

        let branch = Branch::new(1, branch_point, parent_id.clone(), continuation);

        // Deeper forks of the donor keep their content but now hang off
        // version 1, which carries the same prefix.
        for other in self.conversation.branches.iter_mut() {
            if other.parent_branch_id == parent_id && other.branch_point > branch_point {
                other.parent_branch_id = Some(branch.branch_id.clone());
            }
        }

        let donor_is_current = match donor.node {
            None => self.conversation.current_branch_id.is_none(),
            Some(index) => self.current_index() == Some(index),
        };
        if donor_is_current {
            self.conversation.current_branch_id = Some(branch.branch_id.clone());
        }

        branch
    }

    /// The parent whose children are the alternatives at `branch_point` in
    /// the current view. `None` when the point is outside the view.
    fn fork_parent(&self, branch_point: usize) -> Option<Option<String>> {
        if branch_point == 0 {
            return Some(None);
        }
        let segments = self.segments();
        let segment = owner(&segments, branch_point - 1)?;
        Some(
            segment
                .node
                .map(|index| self.conversation.branches[index].branch_id.clone()),
        )
    }

    fn notify_branch_changed(&self) {
        self.observer.on_branch_changed(&self.conversation);
    }

    fn index_of(&self, branch_id: &str) -> Option<usize> {
        self.conversation
            .branches
            .iter()
            .position(|b| b.branch_id == branch_id)
    }

    fn current_index(&self) -> Option<usize> {
        self.current_branch_id().and_then(|id| self.index_of(id))
    }

    fn node_messages(&self, node: Option<usize>) -> &[Message] {
        match node {
            Some(index) => &self.conversation.branches[index].messages,
            None => &self.conversation.base_messages,
        }
    }

    fn current_messages_mut(&mut self) -> &mut Vec<Message> {
        match self.current_index() {
            Some(index) => &mut self.conversation.branches[index].messages,
            None => &mut self.conversation.base_messages,
        }
    }

    /// Branch indices from the outermost ancestor down to the current branch.
    fn lineage(&self) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut cursor = self.current_branch_id();
        while let Some(branch_id) = cursor {
            let Some(index) = self.index_of(branch_id) else {
                break;
            };
            if chain.contains(&index) {
                break;
            }
            chain.push(index);
            cursor = self.conversation.branches[index].parent_branch_id.as_deref();
        }
        chain.reverse();
        chain
    }

    fn segments(&self) -> Vec<Segment> {
        let nodes: Vec<(Option<usize>, usize, usize)> =
            std::iter::once((None, 0, self.conversation.base_messages.len()))
                .chain(self.lineage().into_iter().map(|index| {
                    let branch = &self.conversation.branches[index];
                    (Some(index), branch.branch_point, branch.messages.len())
                }))
                .collect();

        nodes
            .iter()
            .enumerate()
            .map(|(position, &(node, start, len))| {
                let end = match nodes.get(position + 1) {
                    Some(&(_, next_start, _)) => next_start.max(start),
                    None => start + len,
                };
                Segment { node, start, end }
            })
            .collect()
    }
}

fn owner(segments: &[Segment], position: usize) -> Option<Segment> {
    segments
        .iter()
        .rev()
        .find(|segment| segment.contains(position))
        .copied()
}

/// Check the structural invariants of a conversation tree.
pub fn validate(conversation: &Conversation) -> BranchResult<()> {
    let corrupt = |reason: String| Err(BranchError::Corrupt(reason));
    let branches = &conversation.branches;

    let mut ids = HashSet::new();
    for branch in branches {
        if !ids.insert(branch.branch_id.as_str()) {
            return corrupt(format!("duplicate branch id {}", branch.branch_id));
        }
        if branch.version == 0 {
            return corrupt(format!("branch {} has version 0", branch.branch_id));
        }
    }

    let mut versions = HashSet::new();
    for branch in branches {
        let slot = (
            branch.parent_branch_id.as_deref(),
            branch.branch_point,
            branch.version,
        );
        if !versions.insert(slot) {
            return corrupt(format!(
                "version {} appears twice at fork point {}",
                branch.version, branch.branch_point
            ));
        }

        match branch.parent_branch_id.as_deref() {
            None => {
                if branch.branch_point > conversation.base_messages.len() {
                    return corrupt(format!(
                        "branch {} forks at {} beyond a prefix of {}",
                        branch.branch_id,
                        branch.branch_point,
                        conversation.base_messages.len()
                    ));
                }
            }
            Some(parent_id) => {
                let Some(parent) = conversation.branch(parent_id) else {
                    return corrupt(format!(
                        "branch {} references missing parent {}",
                        branch.branch_id, parent_id
                    ));
                };
                let parent_end = parent.branch_point + parent.messages.len();
                if branch.branch_point <= parent.branch_point || branch.branch_point > parent_end
                {
                    return corrupt(format!(
                        "branch {} forks at {} outside its parent's range {}..={}",
                        branch.branch_id,
                        branch.branch_point,
                        parent.branch_point + 1,
                        parent_end
                    ));
                }
            }
        }
    }

    for branch in branches {
        let mut steps = 0;
        let mut cursor = branch.parent_branch_id.as_deref();
        while let Some(parent_id) = cursor {
            steps += 1;
            if steps > branches.len() {
                return corrupt(format!("branch {} has a cyclic ancestry", branch.branch_id));
            }
            cursor = conversation
                .branch(parent_id)
                .and_then(|parent| parent.parent_branch_id.as_deref());
        }
    }

    match conversation.current_branch_id.as_deref() {
        Some(current) if conversation.branch(current).is_none() => {
            corrupt(format!("current branch {current} does not exist"))
        }
        None if !branches.is_empty() => corrupt("branches exist but none is current".to_string()),
        _ => Ok(()),
    }
}

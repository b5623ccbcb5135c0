use std::io::{self, Write};
use std::sync::Mutex;

use colored::Colorize;
use workbench_core::{BranchStore, ConversationObserver, Message, Role};
use workbench_session::{FailureReason, TurnOutcome};

/// Prints streamed content as it arrives.
///
/// Snapshots carry the whole message so far; only the unseen suffix is
/// written.
#[derive(Default)]
pub struct StreamPrinter {
    printed: Mutex<PrintedState>,
}

#[derive(Default)]
struct PrintedState {
    message_id: String,
    chars: usize,
    citations: usize,
}

impl StreamPrinter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationObserver for StreamPrinter {
    fn on_update(&self, _branch_id: Option<&str>, message: &Message) {
        let Ok(mut printed) = self.printed.lock() else {
            return;
        };
        if printed.message_id != message.id {
            *printed = PrintedState {
                message_id: message.id.clone(),
                ..PrintedState::default()
            };
        }

        let delta: String = message.content.chars().skip(printed.chars).collect();
        if !delta.is_empty() {
            print!("{}", delta.green());
            let _ = io::stdout().flush();
            printed.chars += delta.chars().count();
        }

        for citation in message.citations.iter().skip(printed.citations) {
            let source = citation.doc_title.as_deref().unwrap_or("document");
            println!();
            print!(
                "{}",
                format!("  [{} p.{}] {}", source, citation.page, citation.text.trim()).dimmed()
            );
        }
        printed.citations = message.citations.len();
    }
}

pub fn print_outcome(outcome: &TurnOutcome) {
    println!();
    match outcome {
        TurnOutcome::Completed { message } => {
            if let Some(evaluation) = &message.evaluation {
                println!(
                    "{}",
                    format!("📊 Evaluation score: {:.1}", evaluation.overall_score).dimmed()
                );
            }
        }
        TurnOutcome::Failed { reason, .. } => {
            let text = match reason {
                FailureReason::Cancelled => "⏹  Answer cancelled".to_string(),
                other => format!("❌ {}", other),
            };
            println!("{}", text.red());
            println!("{}", "   Use /regen <index> to try again".dimmed());
        }
    }
}

pub fn print_conversation(branches: &BranchStore) {
    let messages = branches.visible_messages();
    if messages.is_empty() {
        println!("{}", "(empty conversation)".dimmed());
        return;
    }

    for (index, message) in messages.iter().enumerate() {
        let label = match message.role {
            Role::User => "You:".cyan().bold(),
            Role::Assistant => "AI:".green().bold(),
        };
        println!("{} {} {}", format!("[{index}]").dimmed(), label, message.content);
        if !message.citations.is_empty() {
            println!(
                "{}",
                format!("     {} citation(s)", message.citations.len()).dimmed()
            );
        }
    }

    print_fork_points(branches);
}

pub fn print_fork_points(branches: &BranchStore) {
    for point in branches.fork_points() {
        let versions: Vec<String> = branches
            .list_branches_at(point.branch_point)
            .iter()
            .map(|branch| {
                let marker = if point.active_branch_id.as_deref() == Some(branch.branch_id.as_str())
                {
                    "*"
                } else {
                    " "
                };
                format!("{marker}v{} {}", branch.version, short_id(&branch.branch_id))
            })
            .collect();
        println!(
            "{}",
            format!("⑂ after message {}: {}", point.branch_point, versions.join("  ")).yellow()
        );
    }
}

fn short_id(branch_id: &str) -> &str {
    branch_id.get(..8).unwrap_or(branch_id)
}

pub fn print_error(error: &dyn std::fmt::Display) {
    println!("{}", format!("❌ {}", error).red());
}

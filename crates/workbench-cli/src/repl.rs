use std::io::{self, Write};

use colored::Colorize;
use workbench_session::{ConversationSession, SessionError};

use crate::printer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Regenerate(usize),
    Reply,
    Branches(usize),
    Switch(String),
    Show,
    Delete,
    Help,
    Quit,
    Invalid(String),
}

pub fn parse_command(input: &str) -> Option<Command> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
        return Some(Command::Quit);
    }
    let Some(rest) = input.strip_prefix('/') else {
        return Some(Command::Say(input.to_string()));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "regen" | "regenerate" => match argument.parse() {
            Ok(index) => Command::Regenerate(index),
            Err(_) => Command::Invalid("usage: /regen <message index>".to_string()),
        },
        "branches" => match argument.parse() {
            Ok(point) => Command::Branches(point),
            Err(_) => Command::Invalid("usage: /branches <fork point>".to_string()),
        },
        "switch" if !argument.is_empty() => Command::Switch(argument.to_string()),
        "switch" => Command::Invalid("usage: /switch <branch id>".to_string()),
        "reply" => Command::Reply,
        "show" => Command::Show,
        "delete" => Command::Delete,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command /{other}")),
    };
    Some(command)
}

/// Resolve a full branch id from a unique prefix.
fn resolve_branch(session: &ConversationSession, prefix: &str) -> Result<String, String> {
    let matches: Vec<&str> = session
        .conversation()
        .branches
        .iter()
        .map(|branch| branch.branch_id.as_str())
        .filter(|branch_id| branch_id.starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [branch_id] => Ok(branch_id.to_string()),
        [] => Err(format!("no branch matches '{prefix}'")),
        _ => Err(format!("'{prefix}' matches {} branches", matches.len())),
    }
}

fn print_help() {
    println!("{}", "Commands:".cyan());
    println!("  /regen <i>      regenerate the answer to user message i");
    println!("  /reply          answer the last question if it has no answer");
    println!("  /branches <p>   list the alternatives at fork point p");
    println!("  /switch <id>    switch to a branch (id prefix is enough)");
    println!("  /show           print the current conversation");
    println!("  /delete         delete this conversation");
    println!("  quit            leave");
}

pub async fn run(mut session: ConversationSession) -> anyhow::Result<()> {
    println!("{}", "🤖 Chat Workbench".cyan().bold());
    println!("{}", format!("Scope: {}", session.scope()).dimmed());
    println!("{}", "Type /help for commands, 'quit' to leave".dimmed());
    println!();
    printer::print_conversation(session.branches());

    loop {
        print!("{} ", "You:".cyan().bold());
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let Some(command) = parse_command(&input) else {
            continue;
        };

        match command {
            Command::Quit => break,
            Command::Help => print_help(),
            Command::Invalid(message) => printer::print_error(&message),
            Command::Show => printer::print_conversation(session.branches()),
            Command::Say(content) => {
                print!("{} ", "AI:".green().bold());
                match session.send_turn(content).await {
                    Ok(outcome) => printer::print_outcome(&outcome),
                    Err(SessionError::AwaitingReply) => {
                        printer::print_error(&SessionError::AwaitingReply);
                        println!("{}", "Use /reply to answer it".dimmed());
                    }
                    Err(error) => printer::print_error(&error),
                }
            }
            Command::Regenerate(index) => {
                print!("{} ", "AI:".green().bold());
                match session.regenerate(index).await {
                    Ok(outcome) => {
                        printer::print_outcome(&outcome);
                        printer::print_fork_points(session.branches());
                    }
                    Err(error) => printer::print_error(&error),
                }
            }
            Command::Reply => {
                print!("{} ", "AI:".green().bold());
                match session.reply().await {
                    Ok(outcome) => printer::print_outcome(&outcome),
                    Err(error) => printer::print_error(&error),
                }
            }
            Command::Branches(point) => {
                let branches = session.branches().list_branches_at(point);
                if branches.is_empty() {
                    println!("{}", format!("No branches at fork point {point}").dimmed());
                }
                for branch in branches {
                    println!(
                        "  v{} {} ({} message(s))",
                        branch.version,
                        branch.branch_id,
                        branch.messages.len()
                    );
                }
            }
            Command::Switch(prefix) => match resolve_branch(&session, &prefix) {
                Ok(branch_id) => match session.switch_to(&branch_id).await {
                    Ok(()) => printer::print_conversation(session.branches()),
                    Err(error) => printer::print_error(&error),
                },
                Err(message) => printer::print_error(&message),
            },
            Command::Delete => match session.delete().await {
                Ok(_) => println!("{}", "🗑  Conversation deleted".yellow()),
                Err(error) => printer::print_error(&error),
            },
        }
    }

    session.flush().await;
    println!("{}", "👋 Goodbye!".cyan());
    Ok(())
}

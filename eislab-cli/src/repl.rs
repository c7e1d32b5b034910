//! Follow-up REPL and report rendering.

use eislab_core::AnalysisSession;
use eislab_core::error::AnalysisError;
use eislab_core::types::{StructuredReport, TurnContent, TurnRole};
use std::io::{self, BufRead, Write};

const HELP: &str = "\
  /save [subject]  Save this run to history
  /turns           Show the conversation so far
  /status          Show the session phase
  /quit            Leave (unsaved runs are discarded)
  Anything else is sent as a follow-up question.";

/// Print a structured report to stdout.
pub fn print_report(report: &StructuredReport) {
    println!("\n\x1b[1m{}\x1b[0m\n", report.title);
    println!("{}\n", report.summary);
    for metric in &report.metrics {
        println!("  \x1b[1;36m{}\x1b[0m: {}", metric.name, metric.value);
        if !metric.insight.is_empty() {
            println!("    {}", metric.insight);
        }
    }
    println!();
}

/// Ask follow-up questions until the user quits or input ends.
///
/// Returns whether the run was saved from inside the loop.
pub async fn run_follow_ups(session: &AnalysisSession, subject: &str) -> anyhow::Result<bool> {
    println!("  Ask a follow-up question. Type /help for commands, /quit to exit\n");

    let stdin = io::stdin();
    let mut saved = false;
    loop {
        print!("\x1b[1;34m> \x1b[0m");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input).is_err() || input.is_empty() {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            let (cmd, arg) = input.split_once(' ').unwrap_or((input, ""));
            match cmd {
                "/quit" | "/exit" | "/q" => break,
                "/help" | "/?" => println!("{}", HELP),
                "/status" => println!("  Phase: {}", session.phase().await),
                "/turns" => print_turns(session).await,
                "/save" => {
                    let subject = if arg.trim().is_empty() {
                        subject
                    } else {
                        arg.trim()
                    };
                    match session.commit(subject).await {
                        Ok(run) => {
                            saved = true;
                            println!("  Saved run {} for '{}'.", run.id, run.subject);
                        }
                        Err(e) => eprintln!("  \x1b[31mCould not save: {}\x1b[0m", e),
                    }
                }
                _ => println!("  Unknown command: {}. Type /help for commands.", cmd),
            }
            continue;
        }

        match session.ask(input).await {
            Ok(answer) => println!("\n{}\n", answer),
            Err(AnalysisError::Busy) => {
                println!("  Still waiting on the previous answer.");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Follow-up failed");
                eprintln!("  \x1b[31m{}\x1b[0m", e);
                println!("  You can ask again; the unanswered question will be replaced.");
            }
        }
    }
    Ok(saved)
}

async fn print_turns(session: &AnalysisSession) {
    for (i, turn) in session.turns().await.iter().enumerate() {
        let who = match turn.role {
            TurnRole::Requester => "you",
            TurnRole::Responder => "assistant",
        };
        let text = match &turn.content {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Report(report) => format!("[report] {}", report.title),
        };
        let preview: String = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .chars()
            .take(100)
            .collect();
        println!("  {:>2}. {:<9} {}", i + 1, who, preview);
    }
}

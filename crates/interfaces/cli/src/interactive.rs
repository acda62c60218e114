//! The interactive terminal session: stdin lines in, events out.
//!
//! Plain text goes to the active persona; `/commands` route to processor
//! methods. Rendering is deliberately bare — the core emits events and this
//! loop prints them.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use ei_runtime::{Processor, ProcessorEvent, QueueActivity};
use ei_state::schema::Role;

pub async fn run(processor: Arc<Processor>) -> Result<()> {
    let mut events = processor.subscribe();
    let printer = {
        let processor = processor.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&processor, &event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(n, "event printer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    println!("ei — type a message, /help for commands, /quit to leave");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            if handle_command(&processor, command).await? {
                break;
            }
            continue;
        }

        let persona = processor.get_active_persona().await;
        if let Err(err) = processor.send_message(&persona, &line).await {
            println!("! {err}");
        }
    }

    printer.abort();
    Ok(())
}

/// Returns `true` when the session should end.
async fn handle_command(processor: &Processor, command: &str) -> Result<bool> {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
    let rest: Vec<&str> = parts.collect();

    match verb.as_str() {
        "quit" | "q" => {
            if rest.first() == Some(&"force") {
                processor.stop().await;
            } else {
                processor.save_and_exit().await?;
            }
            return Ok(true);
        }
        "help" => print_help(),
        "persona" => match rest.first() {
            Some(name) => match processor.set_active_persona(name).await {
                Ok(()) => println!("now talking to {name}"),
                Err(err) => println!("! {err}"),
            },
            None => {
                for persona in processor.get_persona_list(false).await {
                    let marker = if persona.is_paused { " (paused)" } else { "" };
                    println!(
                        "  {}{marker} — {}",
                        persona.name,
                        persona.short_description.as_deref().unwrap_or("")
                    );
                }
            }
        },
        "create" => {
            if rest.len() < 2 {
                println!("usage: /create <name> <description…>");
            } else {
                let name = rest[0];
                let description = rest[1..].join(" ");
                match processor.create_persona(name, &description).await {
                    Ok(()) => println!("generating {name}…"),
                    Err(err) => println!("! {err}"),
                }
            }
        }
        "archive" => {
            let persona = target_persona(processor, &rest).await;
            report(processor.archive_persona(&persona).await);
        }
        "unarchive" => match rest.first() {
            Some(name) => report(processor.unarchive_persona(name).await),
            None => println!("usage: /unarchive <name>"),
        },
        "nick" => match (rest.first(), rest.get(1)) {
            (Some(&"add"), Some(alias)) => {
                let persona = processor.get_active_persona().await;
                report(
                    processor
                        .update_persona(
                            &persona,
                            ei_runtime::PersonaPatch {
                                add_alias: Some(alias.to_string()),
                                ..Default::default()
                            },
                        )
                        .await,
                );
            }
            (Some(&"remove"), Some(alias)) => {
                let persona = processor.get_active_persona().await;
                report(
                    processor
                        .update_persona(
                            &persona,
                            ei_runtime::PersonaPatch {
                                remove_alias: Some(alias.to_string()),
                                ..Default::default()
                            },
                        )
                        .await,
                );
            }
            _ => println!("usage: /nick add|remove <alias>"),
        },
        "pause" => {
            let persona = target_persona(processor, &rest).await;
            report(processor.pause_persona(&persona, None).await);
        }
        "resume" => {
            let persona = target_persona(processor, &rest).await;
            report(processor.resume_persona(&persona).await);
        }
        "poke" => {
            let persona = target_persona(processor, &rest).await;
            report(processor.poke_persona(&persona).await);
        }
        "recall" => {
            let persona = processor.get_active_persona().await;
            match processor.recall_pending_messages(&persona).await {
                Ok(text) if text.is_empty() => println!("(nothing pending)"),
                Ok(text) => println!("recalled:\n{text}"),
                Err(err) => println!("! {err}"),
            }
        }
        "details" => {
            let persona = target_persona(processor, &rest).await;
            match processor.get_persona(&persona).await {
                Some(p) => {
                    println!("{} — {}", p.name, p.long_description.as_deref().unwrap_or("(no description)"));
                    println!("  groups: primary={:?} visible={:?}", p.group_primary, p.groups_visible);
                    println!("  traits: {}", p.traits.iter().map(|t| t.core.name.as_str()).collect::<Vec<_>>().join(", "));
                    println!("  topics: {}", p.topics.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", "));
                }
                None => println!("! unknown persona {persona}"),
            }
        }
        "me" => {
            let human = processor.get_human().await;
            println!(
                "facts: {}  traits: {}  topics: {}  people: {}  quotes: {}",
                human.facts.len(),
                human.traits.len(),
                human.topics.len(),
                human.people.len(),
                human.quotes.len()
            );
            for fact in &human.facts {
                println!("  fact: {} — {}", fact.core.name, fact.core.description);
            }
        }
        "checkpoint" => {
            let name = if rest.is_empty() {
                None
            } else {
                Some(rest.join(" "))
            };
            match processor.create_checkpoint(None, name).await {
                Ok(meta) => println!("checkpoint {} in slot {}", meta.id, meta.slot),
                Err(err) => println!("! {err}"),
            }
        }
        "checkpoints" => {
            for meta in processor.list_checkpoints().await {
                println!("  [{}] {:?} {} — {}", meta.slot, meta.kind, meta.id, meta.name);
            }
        }
        "restore" => match rest.first().and_then(|s| s.parse().ok()) {
            Some(id) => report(processor.restore_checkpoint(id).await),
            None => println!("usage: /restore <checkpoint-id>"),
        },
        "queue" => {
            let (depth, busy) = processor.queue_status().await;
            println!("queue: {depth} item(s), {}", if busy { "busy" } else { "idle" });
        }
        other => println!("unknown command /{other} — try /help"),
    }
    Ok(false)
}

async fn target_persona(processor: &Processor, rest: &[&str]) -> String {
    match rest.first() {
        Some(name) => name.to_string(),
        None => processor.get_active_persona().await,
    }
}

fn report(result: Result<(), ei_state::StateError>) {
    match result {
        Ok(()) => println!("ok"),
        Err(err) => println!("! {err}"),
    }
}

async fn print_event(processor: &Processor, event: &ProcessorEvent) {
    match event {
        ProcessorEvent::MessageAdded { persona } => {
            let messages = processor.get_messages(persona).await;
            if let Some(last) = messages.last() {
                if last.role == Role::System && !last.read {
                    println!("\n{persona}: {}\n", last.content);
                    let _ = processor.mark_all_messages_read(persona).await;
                }
            }
        }
        ProcessorEvent::MessageProcessing { persona } => println!("[{persona}] thinking…"),
        ProcessorEvent::QueueStateChanged(QueueActivity::Paused) => println!("[queue] paused"),
        ProcessorEvent::Error { code, message } => println!("[error:{code}] {message}"),
        ProcessorEvent::PersonaAdded(name) => println!("[{name}] persona ready"),
        ProcessorEvent::OneShotReturned { guid, .. } => println!("[one-shot {guid}] returned"),
        _ => {}
    }
}

fn print_help() {
    println!(
        "\
  /persona [name]        list personas or switch the active one
  /create <name> <desc>  generate a new persona
  /archive [name]        archive (hide) a persona
  /unarchive <name>      bring one back
  /nick add|remove <a>   manage aliases for the active persona
  /pause [name]          stop heartbeats and new work
  /resume [name]         resume a paused persona
  /poke [name]           ask a persona to check in right now
  /recall                take back unanswered messages
  /details [name]        persona traits, topics, groups
  /me                    what the system knows about you
  /checkpoint [name]     save a manual checkpoint
  /checkpoints           list checkpoints
  /restore <id>          restore a checkpoint
  /queue                 queue status
  /quit [force]          save and exit (force skips saving)"
    );
}

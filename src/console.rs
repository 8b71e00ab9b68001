//! Line-oriented operator console. Every command goes to the fleet through a
//! [`FleetHandle`] and comes back as a structured reply.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chorus_backend::fleet::handle::{FleetCommand, FleetHandle, FleetReply};
use chorus_backend::fleet::{FleetError, FleetEvent};
use chorus_backend::persona::{PersonaDescriptor, PersonaFields};

/// Placeholder replaced by the id of the most recently spawned persona.
pub const LAST_SPAWNED: &str = "$last";

pub const HELP: &str = "\
commands:
  spawn <id> [<display name>] [-- <instructions>]
                                    create a persona
  generate <description>            let the model invent a persona
  despawn <id>                      delete a persona and its account
  list                              personas with a live session
  show <id>                         definition and session state
  send <id> <room> <text>           post as a persona
  join <id> <room>                  join a room as a persona
  invite <id> <room> <user>         invite a user (or persona id) to a room
  script <file>                     replay commands from a file
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Fleet(FleetCommand),
    Script(PathBuf),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n(type 'help' for usage)", self.0)
    }
}

fn usage(text: &str) -> ParseError {
    ParseError(format!("usage: {}", text))
}

/// Parse one console line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str, last_spawned: Option<&str>) -> Result<Option<ConsoleCommand>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let line = if trimmed.contains(LAST_SPAWNED) {
        let last = last_spawned
            .ok_or_else(|| ParseError(format!("{} used before any spawn", LAST_SPAWNED)))?;
        trimmed.replace(LAST_SPAWNED, last)
    } else {
        trimmed.to_string()
    };

    let (verb, rest) = split_word(&line);
    let command = match verb.to_ascii_lowercase().as_str() {
        "spawn" => {
            let (head, instructions) = match rest.split_once("--") {
                Some((head, instructions)) => (head, Some(instructions.trim().to_string())),
                None => (rest, None),
            };
            let (id, display) = split_word(head);
            if id.is_empty() {
                return Err(usage("spawn <id> [<display name>] [-- <instructions>]"));
            }
            let display = display.trim();
            ConsoleCommand::Fleet(FleetCommand::Spawn {
                descriptor: PersonaDescriptor::Direct(PersonaFields {
                    id: id.to_string(),
                    display_name: (!display.is_empty()).then(|| display.to_string()),
                    instructions: instructions.filter(|i| !i.is_empty()),
                    traits: Default::default(),
                }),
            })
        }
        "generate" => {
            if rest.trim().is_empty() {
                return Err(usage("generate <description>"));
            }
            ConsoleCommand::Fleet(FleetCommand::Spawn {
                descriptor: PersonaDescriptor::Generated {
                    prompt: rest.trim().to_string(),
                },
            })
        }
        "despawn" => ConsoleCommand::Fleet(FleetCommand::Despawn {
            persona_id: single_arg(rest, "despawn <id>")?,
        }),
        "list" | "ls" => ConsoleCommand::Fleet(FleetCommand::List),
        "show" | "describe" => ConsoleCommand::Fleet(FleetCommand::Describe {
            persona_id: single_arg(rest, "show <id>")?,
        }),
        "send" => {
            let (persona_id, rest) = split_word(rest);
            let (room_id, text) = split_word(rest);
            if persona_id.is_empty() || room_id.is_empty() || text.trim().is_empty() {
                return Err(usage("send <id> <room> <text>"));
            }
            ConsoleCommand::Fleet(FleetCommand::Send {
                persona_id: persona_id.to_string(),
                room_id: room_id.to_string(),
                text: text.trim().to_string(),
            })
        }
        "join" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let [persona_id, room_id] = args.as_slice() else {
                return Err(usage("join <id> <room>"));
            };
            ConsoleCommand::Fleet(FleetCommand::Join {
                persona_id: persona_id.to_string(),
                room_id: room_id.to_string(),
            })
        }
        "invite" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let [persona_id, room_id, user_id] = args.as_slice() else {
                return Err(usage("invite <id> <room> <user>"));
            };
            ConsoleCommand::Fleet(FleetCommand::Invite {
                persona_id: persona_id.to_string(),
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            })
        }
        "script" | "replay" => ConsoleCommand::Script(PathBuf::from(single_arg(rest, "script <file>")?)),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError(format!("unknown command '{}'", other))),
    };
    Ok(Some(command))
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], &input[idx..]),
        None => (input, ""),
    }
}

fn single_arg(rest: &str, usage_text: &str) -> Result<String, ParseError> {
    let args: Vec<&str> = rest.split_whitespace().collect();
    match args.as_slice() {
        [one] => Ok(one.to_string()),
        _ => Err(usage(usage_text)),
    }
}

pub fn format_reply(reply: &FleetReply) -> String {
    match reply {
        FleetReply::Spawned(summary) => format!(
            "spawned {} as {} ({})",
            summary.persona_id, summary.user_id, summary.display_name
        ),
        FleetReply::Despawned { persona_id } => format!("despawned {}", persona_id),
        FleetReply::Personas { persona_ids } if persona_ids.is_empty() => {
            "no active personas".to_string()
        }
        FleetReply::Personas { persona_ids } => persona_ids.join("\n"),
        FleetReply::Persona(details) => {
            let d = &details.definition;
            let state = details
                .session_state
                .map(|s| format!("{:?}", s).to_lowercase())
                .unwrap_or_else(|| "dormant".to_string());
            let mut out = format!(
                "{} ({})\n  name: {}\n  state: {}\n  created: {} by {}",
                d.id,
                d.user_id,
                d.display_name,
                state,
                d.created_at.format("%Y-%m-%d %H:%M:%S"),
                d.creator
            );
            if let Some(at) = details.last_activity {
                out.push_str(&format!("\n  last activity: {}", at.format("%H:%M:%S")));
            }
            if !d.traits.is_empty() {
                let traits = serde_json::to_string(&d.traits).unwrap_or_default();
                out.push_str(&format!("\n  traits: {}", traits));
            }
            if !d.instructions.is_empty() {
                out.push_str(&format!("\n  instructions: {}", d.instructions));
            }
            out
        }
        FleetReply::Sent { delivery_id } => format!("sent ({})", delivery_id),
        FleetReply::Joined { room_id } => format!("joined {}", room_id),
        FleetReply::Invited { room_id, user_id } => format!("invited {} to {}", user_id, room_id),
    }
}

pub fn format_error(error: &FleetError) -> String {
    match error {
        FleetError::PartialFailure {
            persona_id,
            completed,
            failed,
            reason,
        } => {
            let done: Vec<String> = completed.iter().map(|s| s.to_string()).collect();
            format!(
                "error: {} partially failed at '{}' ({})\n  completed: {}",
                persona_id,
                failed,
                reason,
                if done.is_empty() { "nothing".to_string() } else { done.join(", ") }
            )
        }
        other => format!("error: {}", other),
    }
}

pub fn format_event(event: &FleetEvent) -> String {
    match event {
        FleetEvent::Spawned { persona_id, user_id } => format!("* {} is online as {}", persona_id, user_id),
        FleetEvent::Despawned { persona_id } => format!("* {} was removed", persona_id),
        FleetEvent::SessionStarted { persona_id } => format!("* {} session started", persona_id),
        FleetEvent::SessionStopped { persona_id } => format!("* {} session stopped", persona_id),
        FleetEvent::SessionFailed { persona_id, reason } => {
            format!("* {} session failed: {}", persona_id, reason)
        }
        FleetEvent::ReplySent {
            persona_id,
            room_id,
            fallback,
            ..
        } => {
            if *fallback {
                format!("* {} sent a fallback reply in {}", persona_id, room_id)
            } else {
                format!("* {} replied in {}", persona_id, room_id)
            }
        }
        FleetEvent::Error { message } => format!("* error: {}", message),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    handle: FleetHandle,
    last_spawned: Option<String>,
    script_depth: usize,
}

const MAX_SCRIPT_DEPTH: usize = 8;

impl Console {
    pub fn new(handle: FleetHandle) -> Self {
        Self {
            handle,
            last_spawned: None,
            script_depth: 0,
        }
    }

    pub fn last_spawned(&self) -> Option<&str> {
        self.last_spawned.as_deref()
    }

    /// Run one line and write its output through `out`.
    pub fn execute_line(&mut self, line: &str, out: &mut dyn FnMut(String)) -> Flow {
        let command = match parse_line(line, self.last_spawned.as_deref()) {
            Ok(Some(command)) => command,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                out(e.to_string());
                return Flow::Continue;
            }
        };

        match command {
            ConsoleCommand::Fleet(command) => {
                match self.handle.call_blocking(command) {
                    Ok(reply) => {
                        if let FleetReply::Spawned(summary) = &reply {
                            self.last_spawned = Some(summary.persona_id.clone());
                        }
                        out(format_reply(&reply));
                    }
                    Err(e) => out(format_error(&e)),
                }
                Flow::Continue
            }
            ConsoleCommand::Script(path) => {
                if let Err(e) = self.run_script(&path, out) {
                    out(format!("error: {:#}", e));
                }
                Flow::Continue
            }
            ConsoleCommand::Help => {
                out(HELP.to_string());
                Flow::Continue
            }
            ConsoleCommand::Quit => Flow::Quit,
        }
    }

    /// Replay a file of console commands, echoing each one.
    pub fn run_script(&mut self, path: &Path, out: &mut dyn FnMut(String)) -> Result<Flow> {
        if self.script_depth >= MAX_SCRIPT_DEPTH {
            anyhow::bail!("scripts nested deeper than {}", MAX_SCRIPT_DEPTH);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {:?}", path))?;

        self.script_depth += 1;
        let mut flow = Flow::Continue;
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            out(format!("> {}", trimmed));
            flow = self.execute_line(trimmed, out);
            if flow == Flow::Quit {
                break;
            }
        }
        self.script_depth -= 1;
        Ok(flow)
    }
}

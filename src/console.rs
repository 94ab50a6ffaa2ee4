//! Line-oriented operator console.
//!
//! Stands in for a chat gateway: each input line is one interaction.
//!
//! ```text
//! <actor> <prefix>:<id> [field=value ...]    component action, e.g. bet_place:3 choice=1 amount=50
//! <actor> new start                          begin an event draft
//! <actor> new name Cup final                 wizard steps: name, type, choice, drop, when
//! <actor> new done                           create and open the drafted event
//! <actor> new cancel
//! ```
//!
//! Field values may contain spaces; a token without `=` continues the
//! previous field.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::actions::{ActionReply, Dispatcher, Fields};
use crate::error::WagerError;
use crate::platform::Capability;
use crate::session::{EventDraft, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardStep {
    Start,
    Name(String),
    Type(String),
    Choice(String),
    /// 1-based, as shown to the operator.
    Drop(usize),
    When(String),
    Show,
    Done,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Action {
        actor: String,
        custom_id: String,
        fields: Fields,
    },
    Wizard {
        actor: String,
        step: WizardStep,
    },
}

/// Parse one console line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>, WagerError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut tokens = line.split_whitespace();
    let actor = tokens.next().unwrap_or_default().to_string();
    let verb = tokens
        .next()
        .ok_or_else(|| WagerError::Validation("expected an action after the actor".into()))?;
    let rest: Vec<&str> = tokens.collect();

    if verb == "new" {
        let step = wizard_step(&rest)?;
        return Ok(Some(Command::Wizard { actor, step }));
    }

    Ok(Some(Command::Action {
        actor,
        custom_id: verb.to_string(),
        fields: parse_fields(&rest)?,
    }))
}

fn wizard_step(tokens: &[&str]) -> Result<WizardStep, WagerError> {
    let (step, args) = tokens
        .split_first()
        .ok_or_else(|| WagerError::Validation("expected a wizard step".into()))?;
    let arg = args.join(" ");
    let step = match *step {
        "start" => WizardStep::Start,
        "name" => WizardStep::Name(arg),
        "type" => WizardStep::Type(arg),
        "choice" => WizardStep::Choice(arg),
        "drop" => {
            let n: usize = arg
                .parse()
                .map_err(|_| WagerError::Validation("drop takes a choice number".into()))?;
            WizardStep::Drop(n)
        }
        "when" => WizardStep::When(arg),
        "show" => WizardStep::Show,
        "done" => WizardStep::Done,
        "cancel" => WizardStep::Cancel,
        other => {
            return Err(WagerError::Validation(format!("unknown wizard step: {other}")));
        }
    };
    Ok(step)
}

fn parse_fields(tokens: &[&str]) -> Result<Fields, WagerError> {
    let mut fields = Fields::new();
    let mut current: Option<String> = None;
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                fields.insert(key.to_string(), value.to_string());
                current = Some(key.to_string());
            }
            _ => {
                let key = current.as_ref().ok_or_else(|| {
                    WagerError::Validation(format!("expected field=value, got {token}"))
                })?;
                if let Some(value) = fields.get_mut(key) {
                    value.push(' ');
                    value.push_str(token);
                }
            }
        }
    }
    Ok(fields)
}

fn describe(draft: &EventDraft) -> String {
    let choices = draft
        .choices
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {c}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Draft: {} [{}] choices: {}",
        draft.name.as_deref().unwrap_or("(unnamed)"),
        draft.event_type,
        if choices.is_empty() { "none yet".into() } else { choices },
    )
}

pub struct Console {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionStore>,
}

impl Console {
    pub fn new(dispatcher: Arc<Dispatcher>, sessions: Arc<SessionStore>) -> Self {
        Self {
            dispatcher,
            sessions,
        }
    }

    pub async fn execute(&self, command: Command) -> ActionReply {
        match command {
            Command::Action {
                actor,
                custom_id,
                fields,
            } => self.dispatcher.handle(&actor, &custom_id, &fields).await,
            Command::Wizard { actor, step } => match self.wizard(&actor, step).await {
                Ok(message) => ActionReply::ok(message),
                Err(e) => ActionReply::failed(&e),
            },
        }
    }

    async fn wizard(&self, actor: &str, step: WizardStep) -> Result<String, WagerError> {
        if !self.dispatcher.permits(actor, Capability::ManageEvents) {
            return Err(WagerError::PermissionDenied {
                actor: actor.to_string(),
                capability: Capability::ManageEvents.to_string(),
            });
        }
        let sessions = &self.sessions;
        let draft = match step {
            WizardStep::Start => sessions.start(actor),
            WizardStep::Name(name) => sessions.set_name(actor, &name)?,
            WizardStep::Type(t) => sessions.set_type(actor, &t)?,
            WizardStep::Choice(label) => sessions.add_choice(actor, &label)?,
            WizardStep::Drop(n) => sessions.remove_choice(actor, n.saturating_sub(1))?,
            WizardStep::When(when) => sessions.set_schedule(actor, &when)?,
            WizardStep::Show => sessions.draft(actor).ok_or_else(|| {
                WagerError::StateConflict("no event draft in progress; start a new one".into())
            })?,
            WizardStep::Cancel => {
                return Ok(if sessions.cancel(actor) {
                    "Draft discarded".into()
                } else {
                    "No draft to discard".into()
                });
            }
            WizardStep::Done => {
                let event = self
                    .dispatcher
                    .engine()
                    .lifecycle
                    .complete_draft(sessions, actor)
                    .await?;
                return Ok(format!("Event #{} is open for betting: {}", event.id, event.name));
            }
        };
        Ok(describe(&draft))
    }

    /// Serve lines from `reader` until EOF, writing one reply per command.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let reply = match parse_line(&line) {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => continue,
                Err(e) => ActionReply::failed(&e),
            };
            debug!(ok = reply.ok, "Console command handled");
            let marker = if reply.ok { "ok" } else { "error" };
            writer
                .write_all(format!("[{marker}] {}\n", reply.message).as_bytes())
                .await?;
            writer.flush().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BettingConfig;
    use crate::engine::testutil::{announcer, setup_store};
    use crate::engine::Engine;
    use crate::platform::StaticPermissions;
    use crate::types::EventStatus;
    use std::time::Duration;

    #[test]
    fn test_parse_action_with_spaced_field() {
        let cmd = parse_line("op event_cancel:7 reason=rained out").unwrap().unwrap();
        match cmd {
            Command::Action { actor, custom_id, fields } => {
                assert_eq!(actor, "op");
                assert_eq!(custom_id, "event_cancel:7");
                assert_eq!(fields["reason"], "rained out");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_wizard_and_blank_lines() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# note").unwrap(), None);
        assert_eq!(
            parse_line("op new name Cup final").unwrap(),
            Some(Command::Wizard {
                actor: "op".into(),
                step: WizardStep::Name("Cup final".into())
            })
        );
        assert!(parse_line("op new drop x").is_err());
        assert!(parse_line("op").is_err());
        assert!(parse_line("op bet_place:1 stray").is_err());
    }

    async fn console() -> Console {
        let store = setup_store().await;
        let engine = Engine::new(store, announcer(), &BettingConfig::default());
        let perms = Arc::new(StaticPermissions::with_operators(["op"]));
        let dispatcher = Arc::new(Dispatcher::new(engine, perms).unwrap());
        let sessions = Arc::new(SessionStore::new(
            Duration::from_secs(60),
            8,
            BettingConfig::default().terms(),
        ));
        Console::new(dispatcher, sessions)
    }

    #[tokio::test]
    async fn test_script_creates_event_and_takes_bets() {
        let console = console().await;
        let script = "\
op new start
op new name Cup final
op new type sports
op new choice Home
op new choice Away
op new done
alice bet_place:1 choice=1 amount=50
bob event_lock:1
";
        let mut out = Vec::new();
        console.run(script.as_bytes(), &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 8);
        assert!(lines[5].starts_with("[ok] Event #1 is open"));
        assert!(lines[6].starts_with("[ok] Bet #"));
        assert!(lines[7].starts_with("[error]"));

        let event = console.dispatcher.engine().lifecycle.get_event(1).await.unwrap();
        assert_eq!(event.status, EventStatus::Open);
        assert_eq!(event.total_bets_amount, 50);
    }

    #[tokio::test]
    async fn test_wizard_requires_operator() {
        let console = console().await;
        let reply = console
            .execute(Command::Wizard {
                actor: "mallory".into(),
                step: WizardStep::Start,
            })
            .await;
        assert!(!reply.ok);
        assert!(console.sessions.is_empty());
    }
}

//! Chat platform seams.
//!
//! Defines the traits the engine consumes from its host platform:
//! - `ChatChannel`: send and edit messages in a channel
//! - `PermissionCheck`: boolean capability lookup for an actor
//!
//! Announcements built on top of the channel live in [`announcer`].

pub mod announcer;

pub use announcer::{Announcement, Announcer};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::error::ChannelError;

/// Outbound messaging for one chat platform.
///
/// Both calls are only ever issued through the operation queue, so
/// implementations can assume they are never invoked concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Post `content` to `target`, returning the platform message id.
    async fn send(&self, target: &str, content: &str) -> Result<String, ChannelError>;

    /// Replace the content of a previously sent message.
    async fn edit(&self, target: &str, message_id: &str, content: &str)
        -> Result<(), ChannelError>;
}

/// Operator or participant capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    PlaceBet,
    ManageEvents,
    SelectWinners,
    ManageFees,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::PlaceBet => "place_bet",
            Capability::ManageEvents => "manage_events",
            Capability::SelectWinners => "select_winners",
            Capability::ManageFees => "manage_fees",
        };
        write!(f, "{s}")
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait PermissionCheck: Send + Sync {
    fn has_capability(&self, actor: &str, capability: Capability) -> bool;
}

/// Fixed capability table: every actor may bet, listed operators may do
/// everything.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<String, HashSet<Capability>>,
}

impl StaticPermissions {
    pub fn with_operators<I, S>(operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut perms = Self::default();
        for op in operators {
            perms.grant(
                op,
                [
                    Capability::ManageEvents,
                    Capability::SelectWinners,
                    Capability::ManageFees,
                ],
            );
        }
        perms
    }

    pub fn grant(&mut self, actor: impl Into<String>, caps: impl IntoIterator<Item = Capability>) {
        self.grants.entry(actor.into()).or_default().extend(caps);
    }
}

impl PermissionCheck for StaticPermissions {
    fn has_capability(&self, actor: &str, capability: Capability) -> bool {
        capability == Capability::PlaceBet
            || self
                .grants
                .get(actor)
                .is_some_and(|caps| caps.contains(&capability))
    }
}

/// Channel that writes every message to the log. Used by the binary when
/// no chat platform is attached.
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl ChatChannel for LogChannel {
    async fn send(&self, target: &str, content: &str) -> Result<String, ChannelError> {
        let message_id = Uuid::new_v4().to_string();
        info!(target_channel = target, message_id = %message_id, content, "Message sent");
        Ok(message_id)
    }

    async fn edit(
        &self,
        target: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), ChannelError> {
        info!(target_channel = target, message_id, content, "Message edited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everyone_may_bet() {
        let perms = StaticPermissions::default();
        assert!(perms.has_capability("anyone", Capability::PlaceBet));
        assert!(!perms.has_capability("anyone", Capability::ManageEvents));
    }

    #[test]
    fn test_operators_get_management_caps() {
        let perms = StaticPermissions::with_operators(["op"]);
        assert!(perms.has_capability("op", Capability::ManageEvents));
        assert!(perms.has_capability("op", Capability::SelectWinners));
        assert!(perms.has_capability("op", Capability::ManageFees));
        assert!(!perms.has_capability("other", Capability::SelectWinners));
    }

    #[test]
    fn test_single_grant() {
        let mut perms = StaticPermissions::default();
        perms.grant("judge", [Capability::SelectWinners]);
        assert!(perms.has_capability("judge", Capability::SelectWinners));
        assert!(!perms.has_capability("judge", Capability::ManageEvents));
    }

    #[tokio::test]
    async fn test_log_channel_returns_unique_ids() {
        let channel = LogChannel;
        let a = channel.send("hall", "one").await.unwrap();
        let b = channel.send("hall", "two").await.unwrap();
        assert_ne!(a, b);
        channel.edit("hall", &a, "one, edited").await.unwrap();
    }
}

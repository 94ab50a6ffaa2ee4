//! Mock chat channel for integration testing.
//!
//! Records every send and edit in memory and hands out sequential message
//! ids. Rate limiting can be forced for the next N calls to exercise the
//! queue's backoff.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wagerhall::error::ChannelError;
use wagerhall::platform::ChatChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub target: String,
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edited {
    pub message_id: String,
    pub content: String,
}

/// A deterministic, fully controllable `ChatChannel`.
#[derive(Default)]
pub struct MockChannel {
    sent: Arc<Mutex<Vec<Sent>>>,
    edited: Arc<Mutex<Vec<Edited>>>,
    /// Calls left that will answer with a rate-limit error.
    rate_limited: Arc<Mutex<u32>>,
    next_id: AtomicU64,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `calls` sends or edits fail with a rate limit.
    pub fn rate_limit_next(&self, calls: u32) {
        *self.rate_limited.lock().unwrap() = calls;
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn edited(&self) -> Vec<Edited> {
        self.edited.lock().unwrap().clone()
    }

    fn take_rate_limit(&self) -> Result<(), ChannelError> {
        let mut left = self.rate_limited.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(ChannelError::RateLimited { retry_after: None });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatChannel for MockChannel {
    async fn send(&self, target: &str, content: &str) -> Result<String, ChannelError> {
        self.take_rate_limit()?;
        let message_id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent.lock().unwrap().push(Sent {
            target: target.to_string(),
            message_id: message_id.clone(),
            content: content.to_string(),
        });
        Ok(message_id)
    }

    async fn edit(&self, _target: &str, message_id: &str, content: &str) -> Result<(), ChannelError> {
        self.take_rate_limit()?;
        self.edited.lock().unwrap().push(Edited {
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }
}

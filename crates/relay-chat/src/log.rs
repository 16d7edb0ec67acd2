//! Bounded log of recent chat events.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::buffer::{Record, Structured};
use relay_core::CoreError;
use serde::{Deserialize, Serialize};

/// Default number of retained messages.
pub const DEFAULT_CAPACITY: usize = 100;

/// What a chat line records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Something a user said.
    Chat,
    /// A user came online.
    Online,
    /// A user went offline.
    Offline,
}

impl MessageKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// One logged line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Monotonic per log.
    pub id: u64,
    /// Event kind.
    pub kind: MessageKind,
    /// Author or subject.
    pub user_id: String,
    /// Text shown to clients.
    pub content: String,
    /// When it was logged.
    pub sent_at: DateTime<Utc>,
}

impl Structured for ChatMessage {
    fn to_record(&self) -> Record {
        Record::new("ChatMessage")
            .with("id", i64::try_from(self.id).unwrap_or(i64::MAX))
            .with("kind", self.kind.as_str())
            .with("userId", self.user_id.as_str())
            .with("content", self.content.as_str())
            .with("sentAt", self.sent_at)
    }

    fn from_record(record: &Record) -> relay_core::Result<Self> {
        let kind = record.str("kind")?;
        Ok(Self {
            id: u64::try_from(record.i64("id")?).map_err(|_| CoreError::invalid("negative message id"))?,
            kind: MessageKind::parse(kind)
                .ok_or_else(|| CoreError::invalid(format!("unknown message kind {kind:?}")))?,
            user_id: record.str("userId")?.to_owned(),
            content: record.str("content")?.to_owned(),
            sent_at: record
                .date("sentAt")?
                .ok_or_else(|| CoreError::invalid("message without timestamp"))?,
        })
    }
}

struct Inner {
    next_id: u64,
    lines: VecDeque<ChatMessage>,
}

/// Recent messages, oldest evicted first.
pub struct ChatLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ChatLog {
    /// Log retaining at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                next_id: 0,
                lines: VecDeque::with_capacity(capacity.max(1)),
            }),
        }
    }

    /// Append a line and return it.
    pub fn push(&self, kind: MessageKind, user_id: &str, content: impl Into<String>) -> ChatMessage {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let message = ChatMessage {
            id: inner.next_id,
            kind,
            user_id: user_id.to_owned(),
            content: content.into(),
            sent_at: Utc::now(),
        };
        if inner.lines.len() == self.capacity {
            let _ = inner.lines.pop_front();
        }
        inner.lines.push_back(message.clone());
        message
    }

    /// Up to `limit` most recent lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let inner = self.inner.lock();
        let skip = inner.lines.len().saturating_sub(limit);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    /// Retained lines.
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    /// Nothing logged yet.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

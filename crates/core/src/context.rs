//! The explicitly owned session context: persisted level, conversation log,
//! current topic and feedback, the graded turns of the current session, plus
//! a bounded activity log for display.

use crate::store::{LEVEL_KEY, PreferenceStore};
use crate::types::{CefrLevel, ConversationMessage, Feedback, Role, Topic};
use anyhow::Result;
use chrono::{DateTime, Local};
use std::collections::VecDeque;

pub const ACTIVITY_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

/// Ring buffer of recent controller activity, newest last.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    capacity: usize,
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ActivityEntry {
            at: Local::now(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ActivityEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(ACTIVITY_LOG_CAPACITY)
    }
}

/// Tally of the practice turns graded in the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub turns: usize,
    pub good_turns: usize,
    /// Scores of the turns the evaluator scored, in turn order.
    pub scores: Vec<u8>,
}

impl SessionSummary {
    pub fn average_score(&self) -> Option<f32> {
        if self.scores.is_empty() {
            return None;
        }
        let total: f32 = self.scores.iter().map(|&s| f32::from(s)).sum();
        Some(total / self.scores.len() as f32)
    }
}

pub struct SessionContext {
    store: Box<dyn PreferenceStore>,
    level: Option<CefrLevel>,
    conversation: Vec<ConversationMessage>,
    topic: Option<Topic>,
    feedback: Option<Feedback>,
    graded: Vec<Feedback>,
    activity: ActivityLog,
}

impl SessionContext {
    /// Builds the context and loads the persisted level once.
    ///
    /// An unreadable store or a stored value that is not a CEFR code is
    /// logged and treated as "no level yet".
    pub fn init(store: Box<dyn PreferenceStore>) -> Self {
        let level = match store.load(LEVEL_KEY) {
            Ok(Some(raw)) => match raw.parse::<CefrLevel>() {
                Ok(level) => Some(level),
                Err(e) => {
                    tracing::warn!("Ignoring stored level: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to load stored level: {:?}", e);
                None
            }
        };
        tracing::info!("Session context initialized, level: {:?}", level);
        Self {
            store,
            level,
            conversation: Vec::new(),
            topic: None,
            feedback: None,
            graded: Vec::new(),
            activity: ActivityLog::default(),
        }
    }

    pub fn level(&self) -> Option<CefrLevel> {
        self.level
    }

    /// Records the assessed level and persists it.
    pub fn assign_level(&mut self, level: CefrLevel) -> Result<()> {
        self.level = Some(level);
        self.store.save(LEVEL_KEY, level.code())
    }

    /// Drops the level from memory and from the store.
    pub fn forget_level(&mut self) -> Result<()> {
        self.level = None;
        self.store.remove(LEVEL_KEY)
    }

    pub fn conversation(&self) -> &[ConversationMessage] {
        &self.conversation
    }

    pub fn push_message(&mut self, message: ConversationMessage) {
        self.conversation.push(message);
    }

    /// Number of user messages in the conversation.
    pub fn user_turns(&self) -> usize {
        self.conversation
            .iter()
            .filter(|m| m.role == Role::User)
            .count()
    }

    pub fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    pub fn set_topic(&mut self, topic: Topic) {
        self.topic = Some(topic);
    }

    pub fn feedback(&self) -> Option<&Feedback> {
        self.feedback.as_ref()
    }

    /// Shows `feedback` for the latest turn and counts it toward the summary.
    pub fn set_feedback(&mut self, feedback: Feedback) {
        self.graded.push(feedback.clone());
        self.feedback = Some(feedback);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            turns: self.graded.len(),
            good_turns: self.graded.iter().filter(|f| f.is_good).count(),
            scores: self.graded.iter().filter_map(|f| f.score).collect(),
        }
    }

    pub fn clear_feedback(&mut self) {
        self.feedback = None;
    }

    /// Clears everything a new assessment or practice session starts without.
    pub fn reset_conversation(&mut self) {
        self.conversation.clear();
        self.topic = None;
        self.feedback = None;
        self.graded.clear();
        self.activity.clear();
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.activity.push(message);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Common European Framework of Reference proficiency code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CefrLevel {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl CefrLevel {
    pub const ALL: [CefrLevel; 6] = [
        CefrLevel::A1,
        CefrLevel::A2,
        CefrLevel::B1,
        CefrLevel::B2,
        CefrLevel::C1,
        CefrLevel::C2,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            CefrLevel::A1 => "A1",
            CefrLevel::A2 => "A2",
            CefrLevel::B1 => "B1",
            CefrLevel::B2 => "B2",
            CefrLevel::C1 => "C1",
            CefrLevel::C2 => "C2",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CefrLevel::A1 => "Beginner",
            CefrLevel::A2 => "Elementary",
            CefrLevel::B1 => "Intermediate",
            CefrLevel::B2 => "Upper intermediate",
            CefrLevel::C1 => "Advanced",
            CefrLevel::C2 => "Proficient",
        }
    }
}

impl fmt::Display for CefrLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a CEFR level: {0:?}")]
pub struct UnknownLevel(pub String);

impl FromStr for CefrLevel {
    type Err = UnknownLevel;

    /// Accepts a bare code in any case, or the first code embedded in a
    /// longer string such as `"Level: b2 (upper intermediate)"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bytes = upper.as_bytes();
        for i in 0..bytes.len().saturating_sub(1) {
            let boundary_before = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
            let boundary_after = i + 2 >= bytes.len() || !bytes[i + 2].is_ascii_alphanumeric();
            if !(boundary_before && boundary_after) {
                continue;
            }
            let level = match (bytes[i], bytes[i + 1]) {
                (b'A', b'1') => CefrLevel::A1,
                (b'A', b'2') => CefrLevel::A2,
                (b'B', b'1') => CefrLevel::B1,
                (b'B', b'2') => CefrLevel::B2,
                (b'C', b'1') => CefrLevel::C1,
                (b'C', b'2') => CefrLevel::C2,
                _ => continue,
            };
            return Ok(level);
        }
        Err(UnknownLevel(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Roleplay scenario for one practice session. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub difficulty: String,
    pub opening_line: String,
}

/// Coaching feedback for a single user turn in practice mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub is_good: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
}

/// Screen the presentation layer should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    Landing,
    Assessment,
    /// Post-assessment home: level known, practice can start.
    Dashboard,
    Practice,
    Summary,
}

impl View {
    /// Whether the microphone is part of this screen.
    pub fn is_conversational(&self) -> bool {
        matches!(self, View::Assessment | View::Practice)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            View::Landing => write!(f, "Landing"),
            View::Assessment => write!(f, "Assessment"),
            View::Dashboard => write!(f, "Dashboard"),
            View::Practice => write!(f, "Practice"),
            View::Summary => write!(f, "Summary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl fmt::Display for InteractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionState::Idle => write!(f, "Idle"),
            InteractionState::Listening => write!(f, "Listening"),
            InteractionState::Processing => write!(f, "Processing"),
            InteractionState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// Tag identifying one asynchronous operation. Events carrying an epoch
/// that no longer matches the live operation are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

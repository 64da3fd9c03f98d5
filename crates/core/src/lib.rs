pub mod context;
pub mod controller;
pub mod driver;
pub mod evaluator;
pub mod event;
pub mod fallback;
pub mod offline;
pub mod parse;
pub mod prompts;
pub mod speech;
pub mod store;
pub mod types;

use crate::evaluator::EvaluatorRequest;
use crate::event::TimerKind;
use crate::types::{CefrLevel, Epoch, View};

/// Represents commands that the controller issues to the runtime.
///
/// The controller only decides; the runtime (`driver::SessionDriver`)
/// performs the side effects and reports back through events.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartRecognition { epoch: Epoch },
    StopRecognition,
    Evaluate { epoch: Epoch, request: EvaluatorRequest },
    /// Command the runtime to speak the given text to the user.
    SpeakText { epoch: Epoch, text: String },
    CancelSpeech,
    ArmTimer { epoch: Epoch, timer: TimerKind },
    Notify(Notice),
    ViewChanged(View),
}

/// Messages surfaced to the user outside the conversation itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// No speech recognition on this platform. Blocking.
    SpeechInputUnavailable,
    MicrophoneError(String),
    /// An earlier evaluator call has not come back yet.
    StillWorking,
    LevelAssigned(CefrLevel),
    PracticeComplete,
    StorageError(String),
}

impl Notice {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Notice::SpeechInputUnavailable)
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::SpeechInputUnavailable => {
                write!(f, "Speech recognition is not available on this device.")
            }
            Notice::MicrophoneError(e) => write!(f, "Microphone problem: {e}. Please try again."),
            Notice::StillWorking => write!(f, "Still finishing the last reply, one moment..."),
            Notice::LevelAssigned(level) => {
                write!(f, "Your level is {} ({}).", level, level.description())
            }
            Notice::PracticeComplete => write!(f, "Practice complete. Well done!"),
            Notice::StorageError(e) => write!(f, "Could not save your progress: {e}"),
        }
    }
}

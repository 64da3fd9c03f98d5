use crate::evaluator::EvaluatorReply;
use crate::types::Epoch;

/// Buttons the presentation layer can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    BeginAssessment,
    StartListening,
    StopListening,
    Submit,
    Discard,
    /// Drop whatever is happening and record again.
    RetryRecording,
    CancelSpeech,
    StartPractice,
    /// Leave practice (or its summary) for the dashboard.
    FinishPractice,
    RetakeAssessment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Ceiling on a continuous stay in Processing.
    Watchdog,
    /// Window between asking the output adapter to speak and its start
    /// confirmation.
    SpeechStartGrace,
}

/// Everything the controller reacts to. All events other than user actions
/// carry the epoch of the operation that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    User(UserAction),

    RecognitionStarted { epoch: Epoch },
    /// Interim results replace each other; the final one replaces the last
    /// interim.
    Transcript { epoch: Epoch, text: String, is_final: bool },
    RecognitionEnded { epoch: Epoch },
    RecognitionError { epoch: Epoch, error: String },

    /// The output adapter refused to start speaking.
    SpeakFailed { epoch: Epoch },
    SpeechStarted { epoch: Epoch },
    SpeechEnded { epoch: Epoch },
    SpeechError { epoch: Epoch, error: String },

    /// `degraded` is set when the reply is a local fallback.
    EvaluatorReplied {
        epoch: Epoch,
        reply: EvaluatorReply,
        degraded: bool,
    },

    TimerFired { epoch: Epoch, timer: TimerKind },

    Shutdown,
}

pub type EventSender = tokio::sync::mpsc::Sender<Event>;
pub type EventReceiver = tokio::sync::mpsc::Receiver<Event>;

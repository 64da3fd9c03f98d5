//! Contracts for the platform speech engines.

use crate::event::EventSender;
use crate::types::Epoch;
use anyhow::Result;

/// Speech-to-text.
///
/// After `start`, an implementation reports `RecognitionStarted`, any number
/// of `Transcript` updates and finally `RecognitionEnded` or
/// `RecognitionError`, all tagged with `epoch`.
pub trait SpeechInput: Send {
    /// Feature detection. Absence is a hard, user-facing error.
    fn is_available(&self) -> bool;

    fn start(&mut self, epoch: Epoch, events: EventSender) -> Result<()>;

    fn stop(&mut self);
}

/// Text-to-speech.
pub trait SpeechOutput: Send {
    /// Returns whether synthesis was initiated. On `true` the implementation
    /// later reports `SpeechStarted` and `SpeechEnded` (or `SpeechError`)
    /// tagged with `epoch`.
    fn speak(&mut self, epoch: Epoch, text: &str, events: EventSender) -> bool;

    /// Stops the current utterance. No further events are required for it.
    fn cancel(&mut self);
}

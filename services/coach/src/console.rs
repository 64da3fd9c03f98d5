//! Terminal stand-ins for the speech engines.
//!
//! Recognition is dictation: while a recording is open, a typed line is
//! delivered as one utterance. Synthesis uses a platform TTS command when one
//! is on `PATH` and a reading-time simulation otherwise.

use anyhow::Result;
use lingo_core::controller::{Phase, Snapshot};
use lingo_core::event::{Event, EventSender};
use lingo_core::speech::{SpeechInput, SpeechOutput};
use lingo_core::types::Epoch;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TTS_ENGINES: [&str; 3] = ["espeak-ng", "espeak", "say"];
const READING_TIME_PER_WORD: Duration = Duration::from_millis(250);
const MIN_READING_TIME: Duration = Duration::from_millis(600);
/// How long a typed line waits for the recording it asked for to open.
pub const DICTATION_START_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Recording {
    active: Option<(Epoch, EventSender)>,
}

/// Handle shared between the speech input and the line reader.
#[derive(Clone, Default)]
pub struct Dictation {
    state: Arc<Mutex<Recording>>,
}

impl Dictation {
    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers `line` to the open recording and closes it. Returns false
    /// when nothing is recording.
    pub fn dictate(&self, line: &str) -> bool {
        let Some((epoch, events)) = self.lock().active.take() else {
            return false;
        };
        send_utterance(epoch, &events, line);
        true
    }

    /// Waits for the session to report Listening, then delivers `line`.
    /// Returns false and drops the line when the recording was refused or
    /// did not open in time.
    pub async fn dictate_when_listening(
        &self,
        snapshots: &mut watch::Receiver<Snapshot>,
        line: &str,
    ) -> bool {
        let listening = tokio::time::timeout(
            DICTATION_START_TIMEOUT,
            snapshots.wait_for(|s| matches!(s.phase, Phase::Listening { .. })),
        )
        .await
        .is_ok_and(|opened| opened.is_ok());
        if !listening {
            tracing::debug!("Recording never opened, dropping typed line");
            return false;
        }
        self.dictate(line)
    }

    fn open(&self, epoch: Epoch, events: EventSender) {
        self.lock().active = Some((epoch, events.clone()));
        post(&events, Event::RecognitionStarted { epoch });
    }

    fn close(&self) {
        if let Some((epoch, events)) = self.lock().active.take() {
            post(&events, Event::RecognitionEnded { epoch });
        }
    }
}

/// Interim update with all but the last word, then the final text, then the
/// end of the recording.
fn send_utterance(epoch: Epoch, events: &EventSender, line: &str) {
    let text = line.trim();
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() > 1 {
        post(
            events,
            Event::Transcript {
                epoch,
                text: words[..words.len() - 1].join(" "),
                is_final: false,
            },
        );
    }
    post(
        events,
        Event::Transcript {
            epoch,
            text: text.to_string(),
            is_final: true,
        },
    );
    post(events, Event::RecognitionEnded { epoch });
}

fn post(events: &EventSender, event: Event) {
    if let Err(e) = events.try_send(event) {
        tracing::warn!("Failed to deliver speech event: {:?}", e);
    }
}

pub struct ConsoleInput {
    available: bool,
    dictation: Dictation,
}

impl ConsoleInput {
    /// `available` should reflect whether a person is at the keyboard.
    pub fn new(available: bool) -> Self {
        Self {
            available,
            dictation: Dictation::default(),
        }
    }

    pub fn dictation(&self) -> Dictation {
        self.dictation.clone()
    }
}

impl SpeechInput for ConsoleInput {
    fn is_available(&self) -> bool {
        self.available
    }

    fn start(&mut self, epoch: Epoch, events: EventSender) -> Result<()> {
        if !self.available {
            return Err(anyhow::anyhow!("no interactive terminal"));
        }
        // A new recording supersedes one left open.
        self.dictation.close();
        self.dictation.open(epoch, events);
        Ok(())
    }

    fn stop(&mut self) {
        self.dictation.close();
    }
}

pub struct ConsoleOutput {
    engine: Option<PathBuf>,
    current: Option<JoinHandle<()>>,
}

impl ConsoleOutput {
    /// Uses the first TTS engine found on `PATH`.
    pub fn detect() -> Self {
        let engine = std::env::var_os("PATH").and_then(|path| {
            std::env::split_paths(&path).find_map(|dir| find_engine(&dir))
        });
        match &engine {
            Some(path) => tracing::info!("Speaking through {}", path.display()),
            None => tracing::info!("No TTS engine on PATH, simulating speech"),
        }
        Self::with_engine(engine)
    }

    pub fn with_engine(engine: Option<PathBuf>) -> Self {
        Self {
            engine,
            current: None,
        }
    }
}

fn find_engine(dir: &Path) -> Option<PathBuf> {
    TTS_ENGINES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn reading_time(text: &str) -> Duration {
    let words = text.split_whitespace().count() as u32;
    (READING_TIME_PER_WORD * words).max(MIN_READING_TIME)
}

impl SpeechOutput for ConsoleOutput {
    fn speak(&mut self, epoch: Epoch, text: &str, events: EventSender) -> bool {
        self.cancel();
        let task = match &self.engine {
            Some(engine) => {
                let child = tokio::process::Command::new(engine)
                    .arg(text)
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .kill_on_drop(true)
                    .spawn();
                let mut child = match child {
                    Ok(child) => child,
                    Err(e) => {
                        tracing::error!("Failed to start {}: {}", engine.display(), e);
                        return false;
                    }
                };
                tokio::spawn(async move {
                    let _ = events.send(Event::SpeechStarted { epoch }).await;
                    let event = match child.wait().await {
                        Ok(status) if status.success() => Event::SpeechEnded { epoch },
                        Ok(status) => Event::SpeechError {
                            epoch,
                            error: format!("TTS exited with {status}"),
                        },
                        Err(e) => Event::SpeechError {
                            epoch,
                            error: e.to_string(),
                        },
                    };
                    let _ = events.send(event).await;
                })
            }
            None => {
                let delay = reading_time(text);
                tokio::spawn(async move {
                    let _ = events.send(Event::SpeechStarted { epoch }).await;
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::SpeechEnded { epoch }).await;
                })
            }
        };
        self.current = Some(task);
        true
    }

    fn cancel(&mut self) {
        // Dropping the task drops the child process, which kills it.
        if let Some(task) = self.current.take() {
            task.abort();
        }
    }
}

//! Turn-taking controller.
//!
//! A pure state machine: `handle` consumes one event and returns the
//! commands the runtime must execute. It owns no clock and performs no I/O,
//! which keeps every transition testable without timers or adapters.
//!
//! ```text
//! Idle ──start──▶ AwaitingMic ──mic on──▶ Listening ──stop/end──▶ Reviewing
//!   ▲                                                                │submit
//!   │                                                                ▼
//!   ├──── no line / speak failed / grace expired / watchdog ── Processing
//!   │                                                                │speech started
//!   └──────────────── ended / error / cancel ──────────────────── Speaking
//! ```

use crate::context::{ActivityEntry, SessionContext, SessionSummary};
use crate::evaluator::{EvaluatorReply, EvaluatorRequest, MAX_TURNS, TurnRequest};
use crate::event::{Event, TimerKind, UserAction};
use crate::fallback::{FALLBACK_LEVEL, OPENING_QUESTION, fallback_topic};
use crate::types::{
    CefrLevel, ConversationMessage, Epoch, Feedback, InteractionState, Topic, View,
};
use crate::{Command, Notice};

/// What a Processing phase is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Evaluator,
    SpeechStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Idle with a transcript waiting to be submitted or discarded. Late
    /// transcript updates from the same recording still replace it.
    Reviewing { epoch: Epoch, transcript: String },
    /// Recognition requested, start not yet confirmed. Reported as Idle.
    AwaitingMic { epoch: Epoch },
    Listening { epoch: Epoch, transcript: String },
    Processing { epoch: Epoch, awaiting: Awaiting },
    Speaking { epoch: Epoch },
}

impl Phase {
    pub fn interaction_state(&self) -> InteractionState {
        match self {
            Phase::Idle | Phase::Reviewing { .. } | Phase::AwaitingMic { .. } => {
                InteractionState::Idle
            }
            Phase::Listening { .. } => InteractionState::Listening,
            Phase::Processing { .. } => InteractionState::Processing,
            Phase::Speaking { .. } => InteractionState::Speaking,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Reviewing { .. } => "Reviewing",
            Phase::AwaitingMic { .. } => "AwaitingMic",
            Phase::Listening { .. } => "Listening",
            Phase::Processing {
                awaiting: Awaiting::Evaluator,
                ..
            } => "Processing(evaluator)",
            Phase::Processing {
                awaiting: Awaiting::SpeechStart,
                ..
            } => "Processing(speech start)",
            Phase::Speaking { .. } => "Speaking",
        }
    }
}

/// Activity entries carried in each snapshot.
pub const RECENT_ACTIVITY: usize = 20;

/// Read-only view of the controller for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub view: View,
    pub state: InteractionState,
    pub phase: Phase,
    pub conversation: Vec<ConversationMessage>,
    pub topic: Option<Topic>,
    pub feedback: Option<Feedback>,
    pub level: Option<CefrLevel>,
    pub user_turns: usize,
    pub notice: Option<Notice>,
    /// Graded practice turns of the current session.
    pub summary: SessionSummary,
    /// Newest activity entries, oldest first.
    pub activity: Vec<ActivityEntry>,
}

impl Snapshot {
    /// Transcript being recorded or reviewed, if any.
    pub fn transcript(&self) -> Option<&str> {
        match &self.phase {
            Phase::Listening { transcript, .. } | Phase::Reviewing { transcript, .. } => {
                Some(transcript)
            }
            _ => None,
        }
    }

    pub fn is_reviewing(&self) -> bool {
        matches!(self.phase, Phase::Reviewing { .. })
    }
}

pub struct Controller {
    ctx: SessionContext,
    view: View,
    phase: Phase,
    epoch: Epoch,
    /// Re-entrancy guard: the epoch of the evaluator call still outstanding.
    in_flight: Option<Epoch>,
    speech_input_available: bool,
    notice: Option<Notice>,
}

impl Controller {
    /// Starts on the dashboard when a level is already stored, otherwise on
    /// the landing view.
    pub fn new(ctx: SessionContext, speech_input_available: bool) -> Self {
        let view = if ctx.level().is_some() {
            View::Dashboard
        } else {
            View::Landing
        };
        if !speech_input_available {
            tracing::warn!("Speech input is not available; recording will be refused");
        }
        Self {
            ctx,
            view,
            phase: Phase::Idle,
            epoch: Epoch::default(),
            in_flight: None,
            speech_input_available,
            notice: None,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn state(&self) -> InteractionState {
        self.phase.interaction_state()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn is_evaluating(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            view: self.view,
            state: self.state(),
            phase: self.phase.clone(),
            conversation: self.ctx.conversation().to_vec(),
            topic: self.ctx.topic().cloned(),
            feedback: self.ctx.feedback().cloned(),
            level: self.ctx.level(),
            user_turns: self.ctx.user_turns(),
            notice: self.notice.clone(),
            summary: self.ctx.summary(),
            activity: self.ctx.activity().recent(RECENT_ACTIVITY),
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        let mut cmds = Vec::new();
        match event {
            Event::User(action) => self.on_user(action, &mut cmds),

            Event::RecognitionStarted { epoch } => match self.phase {
                Phase::AwaitingMic { epoch: e } if e == epoch => {
                    self.transition(Phase::Listening {
                        epoch,
                        transcript: String::new(),
                    });
                }
                _ => self.stale("recognition start", epoch),
            },

            Event::Transcript {
                epoch,
                text,
                is_final,
            } => match &mut self.phase {
                Phase::Listening { epoch: e, transcript }
                | Phase::Reviewing { epoch: e, transcript }
                    if *e == epoch =>
                {
                    let kind = if is_final { "final" } else { "interim" };
                    tracing::trace!("Transcript ({}): {:?}", kind, text);
                    *transcript = text;
                }
                _ => tracing::debug!("Dropping stale transcript for {}", epoch),
            },

            Event::RecognitionEnded { epoch } => match &self.phase {
                Phase::Listening { epoch: e, transcript } if *e == epoch => {
                    let transcript = transcript.clone();
                    self.to_review(epoch, transcript);
                }
                Phase::AwaitingMic { epoch: e } if *e == epoch => {
                    self.transition(Phase::Idle);
                }
                _ => self.stale("recognition end", epoch),
            },

            Event::RecognitionError { epoch, error } => match self.phase {
                Phase::Listening { epoch: e, .. } | Phase::AwaitingMic { epoch: e }
                    if e == epoch =>
                {
                    tracing::error!("Speech recognition failed: {}", error);
                    self.ctx.log(format!("recognition error: {error}"));
                    self.transition(Phase::Idle);
                    self.notify(Notice::MicrophoneError(error), &mut cmds);
                }
                _ => self.stale("recognition error", epoch),
            },

            Event::SpeakFailed { epoch } => match self.phase {
                Phase::Processing {
                    epoch: e,
                    awaiting: Awaiting::SpeechStart,
                } if e == epoch => {
                    tracing::warn!("Speech output could not start, returning to Idle");
                    self.transition(Phase::Idle);
                }
                _ => self.stale("speak failure", epoch),
            },

            Event::SpeechStarted { epoch } => match self.phase {
                Phase::Processing {
                    epoch: e,
                    awaiting: Awaiting::SpeechStart,
                } if e == epoch => {
                    self.transition(Phase::Speaking { epoch });
                }
                _ => self.stale("speech start", epoch),
            },

            Event::SpeechEnded { epoch } => self.on_speech_finished(epoch, None),

            Event::SpeechError { epoch, error } => self.on_speech_finished(epoch, Some(error)),

            Event::EvaluatorReplied {
                epoch,
                reply,
                degraded,
            } => {
                if self.in_flight == Some(epoch) {
                    self.in_flight = None;
                }
                match self.phase {
                    Phase::Processing {
                        epoch: e,
                        awaiting: Awaiting::Evaluator,
                    } if e == epoch => {
                        if degraded {
                            tracing::warn!("Continuing with a fallback reply for {}", epoch);
                            self.ctx.log("evaluator unavailable, used fallback");
                        }
                        self.apply_reply(epoch, reply, &mut cmds);
                    }
                    _ => self.stale("evaluator reply", epoch),
                }
            }

            Event::TimerFired {
                epoch,
                timer: TimerKind::Watchdog,
            } => {
                if self.in_flight == Some(epoch) {
                    self.in_flight = None;
                }
                match self.phase {
                    Phase::Processing { epoch: e, awaiting } if e == epoch => {
                        tracing::warn!("Watchdog fired in Processing for {}, forcing Idle", epoch);
                        self.ctx.log("watchdog reset");
                        if awaiting == Awaiting::SpeechStart {
                            cmds.push(Command::CancelSpeech);
                        }
                        self.transition(Phase::Idle);
                    }
                    _ => tracing::trace!("Watchdog for {} expired harmlessly", epoch),
                }
            }

            Event::TimerFired {
                epoch,
                timer: TimerKind::SpeechStartGrace,
            } => match self.phase {
                Phase::Processing {
                    epoch: e,
                    awaiting: Awaiting::SpeechStart,
                } if e == epoch => {
                    tracing::warn!("Speech did not start within the grace period, returning to Idle");
                    cmds.push(Command::CancelSpeech);
                    self.transition(Phase::Idle);
                }
                _ => tracing::trace!("Speech grace for {} expired harmlessly", epoch),
            },

            Event::Shutdown => {}
        }
        cmds
    }

    fn on_user(&mut self, action: UserAction, cmds: &mut Vec<Command>) {
        tracing::debug!("User action {:?} in {} / {}", action, self.view, self.phase.name());
        match action {
            UserAction::BeginAssessment => {
                if self.view != View::Landing {
                    return;
                }
                self.abort_activity(cmds);
                self.ctx.reset_conversation();
                self.set_view(View::Assessment, cmds);
                self.ctx.push_message(ConversationMessage::model(OPENING_QUESTION));
                let epoch = self.next_epoch();
                cmds.push(Command::ArmTimer {
                    epoch,
                    timer: TimerKind::Watchdog,
                });
                self.begin_speaking(epoch, OPENING_QUESTION.to_string(), cmds);
            }

            UserAction::StartListening => self.start_listening(cmds),

            UserAction::StopListening => match &self.phase {
                Phase::Listening { epoch, transcript } => {
                    let (epoch, transcript) = (*epoch, transcript.clone());
                    cmds.push(Command::StopRecognition);
                    self.to_review(epoch, transcript);
                }
                Phase::AwaitingMic { .. } => {
                    cmds.push(Command::StopRecognition);
                    self.transition(Phase::Idle);
                }
                _ => {}
            },

            UserAction::Submit => self.submit(cmds),

            UserAction::Discard => {
                if let Phase::Reviewing { .. } = self.phase {
                    self.transition(Phase::Idle);
                }
            }

            UserAction::RetryRecording => {
                if !self.view.is_conversational() {
                    return;
                }
                self.abort_activity(cmds);
                self.start_listening(cmds);
            }

            UserAction::CancelSpeech => {
                if matches!(
                    self.phase,
                    Phase::Speaking { .. } | Phase::Processing { .. }
                ) {
                    self.abort_activity(cmds);
                }
            }

            UserAction::StartPractice => {
                if !matches!(self.view, View::Dashboard | View::Summary) {
                    return;
                }
                let Some(level) = self.ctx.level() else {
                    tracing::warn!("Practice requested without a level");
                    return;
                };
                if self.in_flight.is_some() {
                    self.notify(Notice::StillWorking, cmds);
                    return;
                }
                self.abort_activity(cmds);
                self.ctx.reset_conversation();
                self.set_view(View::Practice, cmds);
                self.request(EvaluatorRequest::TopicIntro { level }, cmds);
            }

            UserAction::FinishPractice => {
                if !matches!(self.view, View::Practice | View::Summary) {
                    return;
                }
                self.abort_activity(cmds);
                self.ctx.reset_conversation();
                self.set_view(View::Dashboard, cmds);
            }

            UserAction::RetakeAssessment => {
                if self.view == View::Landing {
                    return;
                }
                self.abort_activity(cmds);
                if let Err(e) = self.ctx.forget_level() {
                    tracing::error!("Failed to clear stored level: {:?}", e);
                    self.notify(Notice::StorageError(e.to_string()), cmds);
                }
                self.ctx.reset_conversation();
                self.set_view(View::Landing, cmds);
            }
        }
    }

    fn start_listening(&mut self, cmds: &mut Vec<Command>) {
        if !self.view.is_conversational() {
            return;
        }
        if !self.speech_input_available {
            self.notify(Notice::SpeechInputUnavailable, cmds);
            return;
        }
        if !matches!(self.phase, Phase::Idle | Phase::Reviewing { .. }) {
            tracing::debug!("Ignoring start request while {}", self.phase.name());
            return;
        }
        let epoch = self.next_epoch();
        self.transition(Phase::AwaitingMic { epoch });
        cmds.push(Command::StartRecognition { epoch });
    }

    fn submit(&mut self, cmds: &mut Vec<Command>) {
        let Phase::Reviewing { transcript, .. } = &self.phase else {
            return;
        };
        if !self.view.is_conversational() {
            return;
        }
        if self.in_flight.is_some() {
            tracing::debug!("Submission ignored, an evaluator call is in flight");
            return;
        }
        let utterance = transcript.trim().to_string();
        if utterance.is_empty() {
            self.transition(Phase::Idle);
            return;
        }

        self.ctx.push_message(ConversationMessage::user(utterance.clone()));
        let turn = self.ctx.user_turns();
        tracing::info!("Submitted turn {} in {}: {:?}", turn, self.view, utterance);

        let request = match self.view {
            View::Assessment => {
                let history = self.ctx.conversation().to_vec();
                if turn >= MAX_TURNS {
                    EvaluatorRequest::PlacementVerdict { history }
                } else {
                    EvaluatorRequest::PlacementQuestion { history }
                }
            }
            _ => {
                // The new transcript supersedes the previous turn's feedback.
                self.ctx.clear_feedback();
                let level = self.ctx.level().unwrap_or(FALLBACK_LEVEL);
                let topic = self
                    .ctx
                    .topic()
                    .cloned()
                    .unwrap_or_else(|| fallback_topic(level));
                EvaluatorRequest::TurnEvaluation(TurnRequest {
                    topic,
                    history: self.ctx.conversation().to_vec(),
                    utterance,
                    level,
                    turn,
                })
            }
        };
        self.request(request, cmds);
    }

    /// Issues one evaluator call and enters Processing under a fresh epoch.
    fn request(&mut self, request: EvaluatorRequest, cmds: &mut Vec<Command>) {
        let epoch = self.next_epoch();
        self.in_flight = Some(epoch);
        self.ctx.log(format!("evaluating {}", request.kind()));
        self.transition(Phase::Processing {
            epoch,
            awaiting: Awaiting::Evaluator,
        });
        cmds.push(Command::Evaluate { epoch, request });
        cmds.push(Command::ArmTimer {
            epoch,
            timer: TimerKind::Watchdog,
        });
    }

    fn apply_reply(&mut self, epoch: Epoch, reply: EvaluatorReply, cmds: &mut Vec<Command>) {
        match reply {
            EvaluatorReply::Question(question) => {
                self.ctx.push_message(ConversationMessage::model(question.clone()));
                self.begin_speaking(epoch, question, cmds);
            }
            EvaluatorReply::Level(level) => {
                tracing::info!("Assessment complete, level {}", level);
                if let Err(e) = self.ctx.assign_level(level) {
                    tracing::error!("Failed to persist level: {:?}", e);
                    self.notify(Notice::StorageError(e.to_string()), cmds);
                }
                self.transition(Phase::Idle);
                self.set_view(View::Dashboard, cmds);
                self.notify(Notice::LevelAssigned(level), cmds);
            }
            EvaluatorReply::Topic(topic) => {
                tracing::info!("Practice topic: {}", topic.title);
                let opening = topic.opening_line.clone();
                self.ctx.set_topic(topic);
                self.ctx.push_message(ConversationMessage::model(opening.clone()));
                self.begin_speaking(epoch, opening, cmds);
            }
            EvaluatorReply::Turn(eval) => {
                self.ctx.set_feedback(eval.feedback);
                if eval.session_complete {
                    self.set_view(View::Summary, cmds);
                    self.notify(Notice::PracticeComplete, cmds);
                }
                match eval.next_response.filter(|line| !line.trim().is_empty()) {
                    Some(line) => {
                        self.ctx.push_message(ConversationMessage::model(line.clone()));
                        self.begin_speaking(epoch, line, cmds);
                    }
                    None => self.transition(Phase::Idle),
                }
            }
        }
    }

    fn begin_speaking(&mut self, epoch: Epoch, text: String, cmds: &mut Vec<Command>) {
        if text.trim().is_empty() {
            self.transition(Phase::Idle);
            return;
        }
        self.transition(Phase::Processing {
            epoch,
            awaiting: Awaiting::SpeechStart,
        });
        cmds.push(Command::SpeakText { epoch, text });
        cmds.push(Command::ArmTimer {
            epoch,
            timer: TimerKind::SpeechStartGrace,
        });
    }

    fn on_speech_finished(&mut self, epoch: Epoch, error: Option<String>) {
        match self.phase {
            Phase::Speaking { epoch: e }
            | Phase::Processing {
                epoch: e,
                awaiting: Awaiting::SpeechStart,
            } if e == epoch => {
                if let Some(error) = error {
                    tracing::error!("Speech output failed: {}", error);
                    self.ctx.log(format!("speech error: {error}"));
                }
                self.transition(Phase::Idle);
            }
            _ => self.stale("speech end", epoch),
        }
    }

    /// Forces Idle, stopping whichever adapter is busy. An outstanding
    /// evaluator call keeps the guard until it reports back.
    fn abort_activity(&mut self, cmds: &mut Vec<Command>) {
        match self.phase {
            Phase::AwaitingMic { .. } | Phase::Listening { .. } => {
                cmds.push(Command::StopRecognition)
            }
            Phase::Speaking { .. }
            | Phase::Processing {
                awaiting: Awaiting::SpeechStart,
                ..
            } => cmds.push(Command::CancelSpeech),
            _ => {}
        }
        self.transition(Phase::Idle);
    }

    fn to_review(&mut self, epoch: Epoch, transcript: String) {
        if transcript.trim().is_empty() {
            self.transition(Phase::Idle);
        } else {
            self.transition(Phase::Reviewing { epoch, transcript });
        }
    }

    fn transition(&mut self, next: Phase) {
        if self.phase == next {
            return;
        }
        if self.phase.name() != next.name() {
            tracing::info!("{} -> {}", self.phase.name(), next.name());
            self.ctx
                .log(format!("{} -> {}", self.phase.name(), next.name()));
        }
        self.phase = next;
    }

    fn set_view(&mut self, view: View, cmds: &mut Vec<Command>) {
        if self.view == view {
            return;
        }
        tracing::info!("View {} -> {}", self.view, view);
        self.view = view;
        self.notice = None;
        cmds.push(Command::ViewChanged(view));
    }

    fn notify(&mut self, notice: Notice, cmds: &mut Vec<Command>) {
        self.notice = Some(notice.clone());
        cmds.push(Command::Notify(notice));
    }

    fn next_epoch(&mut self) -> Epoch {
        self.epoch = self.epoch.next();
        self.epoch
    }

    fn stale(&self, what: &str, epoch: Epoch) {
        tracing::debug!(
            "Dropping stale {} for {} (now {} at {})",
            what,
            epoch,
            self.phase.name(),
            self.epoch
        );
    }
}

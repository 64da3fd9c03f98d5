//! Session runtime: executes controller commands against the evaluator,
//! the speech adapters and the clock, and feeds the results back as events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::context::SessionContext;
use crate::controller::{Controller, Snapshot};
use crate::evaluator::{Evaluator, EvaluatorRequest, dispatch};
use crate::event::{Event, EventReceiver, EventSender, TimerKind};
use crate::fallback::fallback_for;
use crate::speech::{SpeechInput, SpeechOutput};
use crate::types::Epoch;
use crate::Command;

pub const EVALUATOR_TIMEOUT: Duration = Duration::from_secs(15);
pub const WATCHDOG: Duration = Duration::from_secs(16);
pub const SPEECH_START_GRACE: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimingsError {
    #[error("watchdog ({watchdog:?}) must be longer than the evaluator timeout ({timeout:?})")]
    WatchdogTooShort { watchdog: Duration, timeout: Duration },
    #[error("speech start grace period must be non-zero")]
    ZeroGrace,
}

/// Time limits applied by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    evaluator_timeout: Duration,
    watchdog: Duration,
    speech_start_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            evaluator_timeout: EVALUATOR_TIMEOUT,
            watchdog: WATCHDOG,
            speech_start_grace: SPEECH_START_GRACE,
        }
    }
}

impl Timings {
    /// The watchdog has to outlast the evaluator timeout, otherwise it would
    /// fire before the fallback reply gets a chance to arrive.
    pub fn new(
        evaluator_timeout: Duration,
        watchdog: Duration,
        speech_start_grace: Duration,
    ) -> Result<Self, TimingsError> {
        if watchdog <= evaluator_timeout {
            return Err(TimingsError::WatchdogTooShort {
                watchdog,
                timeout: evaluator_timeout,
            });
        }
        if speech_start_grace.is_zero() {
            return Err(TimingsError::ZeroGrace);
        }
        Ok(Self {
            evaluator_timeout,
            watchdog,
            speech_start_grace,
        })
    }

    pub fn evaluator_timeout(&self) -> Duration {
        self.evaluator_timeout
    }

    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    pub fn speech_start_grace(&self) -> Duration {
        self.speech_start_grace
    }

    fn timer(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Watchdog => self.watchdog,
            TimerKind::SpeechStartGrace => self.speech_start_grace,
        }
    }
}

pub struct SessionDriver {
    controller: Controller,
    evaluator: Arc<dyn Evaluator>,
    input: Box<dyn SpeechInput>,
    output: Box<dyn SpeechOutput>,
    timings: Timings,
    events_tx: EventSender,
    events_rx: EventReceiver,
    snapshots: watch::Sender<Snapshot>,
}

impl SessionDriver {
    pub fn new(
        ctx: SessionContext,
        evaluator: Arc<dyn Evaluator>,
        input: Box<dyn SpeechInput>,
        output: Box<dyn SpeechOutput>,
        timings: Timings,
    ) -> Self {
        let controller = Controller::new(ctx, input.is_available());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshots, _) = watch::channel(controller.snapshot());
        Self {
            controller,
            evaluator,
            input,
            output,
            timings,
            events_tx,
            events_rx,
            snapshots,
        }
    }

    /// Handle for posting user actions (and `Shutdown`) into the session.
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Receives a fresh snapshot after every processed event.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Processes events until `Shutdown`, then stops both speech adapters and
    /// hands back the controller.
    pub async fn run(mut self) -> Controller {
        tracing::info!(
            "Session driver started in {} (evaluator timeout {:?}, watchdog {:?})",
            self.controller.view(),
            self.timings.evaluator_timeout,
            self.timings.watchdog
        );
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            let commands = self.controller.handle(event);
            for command in commands {
                self.execute(command);
            }
            self.snapshots.send_replace(self.controller.snapshot());
        }
        self.input.stop();
        self.output.cancel();
        tracing::info!("Session driver stopped.");
        self.controller
    }

    fn execute(&mut self, command: Command) {
        tracing::trace!("Executing {:?}", command);
        match command {
            Command::StartRecognition { epoch } => {
                if let Err(e) = self.input.start(epoch, self.events_tx.clone()) {
                    tracing::error!("Failed to start speech recognition: {:?}", e);
                    self.post(Event::RecognitionError {
                        epoch,
                        error: e.to_string(),
                    });
                }
            }
            Command::StopRecognition => self.input.stop(),
            Command::Evaluate { epoch, request } => self.spawn_evaluation(epoch, request),
            Command::SpeakText { epoch, text } => {
                tracing::info!("Speaking: {:?}", text);
                if !self.output.speak(epoch, &text, self.events_tx.clone()) {
                    self.post(Event::SpeakFailed { epoch });
                }
            }
            Command::CancelSpeech => self.output.cancel(),
            Command::ArmTimer { epoch, timer } => {
                let delay = self.timings.timer(timer);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The session may already be gone.
                    let _ = tx.send(Event::TimerFired { epoch, timer }).await;
                });
            }
            Command::Notify(notice) => {
                if notice.is_blocking() {
                    tracing::error!("{}", notice);
                } else {
                    tracing::info!("{}", notice);
                }
            }
            Command::ViewChanged(view) => tracing::debug!("Presenting {}", view),
        }
    }

    /// Runs one evaluator call off the event loop. Whatever happens, exactly
    /// one `EvaluatorReplied` comes back for `epoch`.
    fn spawn_evaluation(&self, epoch: Epoch, request: EvaluatorRequest) {
        let evaluator = Arc::clone(&self.evaluator);
        let tx = self.events_tx.clone();
        let limit = self.timings.evaluator_timeout;
        tokio::spawn(async move {
            let kind = request.kind();
            tracing::debug!("Evaluator call {} ({}) started", epoch, kind);
            let outcome = tokio::time::timeout(limit, dispatch(&*evaluator, &request)).await;
            let (reply, degraded) = match outcome {
                Ok(Ok(reply)) => (reply, false),
                Ok(Err(e)) => {
                    tracing::warn!("Evaluator call {} ({}) failed, using fallback: {:?}", epoch, kind, e);
                    (fallback_for(&request), true)
                }
                Err(_) => {
                    tracing::warn!(
                        "Evaluator call {} ({}) timed out after {:?}, using fallback",
                        epoch,
                        kind,
                        limit
                    );
                    (fallback_for(&request), true)
                }
            };
            if tx
                .send(Event::EvaluatorReplied {
                    epoch,
                    reply,
                    degraded,
                })
                .await
                .is_err()
            {
                tracing::debug!("Session closed before evaluator call {} finished", epoch);
            }
        });
    }

    fn post(&self, event: Event) {
        if let Err(e) = self.events_tx.try_send(event) {
            tracing::warn!("Failed to queue event: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Phase;
    use crate::evaluator::{
        MockLanguageModel, ModelEvaluator, PlacementStep, TurnEvaluation, TurnRequest,
    };
    use crate::event::UserAction;
    use crate::fallback::{FALLBACK_QUESTION, fallback_topic};
    use crate::prompts::PromptSet;
    use crate::store::{LEVEL_KEY, MemoryStore};
    use crate::types::{CefrLevel, ConversationMessage, InteractionState, Topic, View};
    use crate::Notice;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Confirms recognition immediately; transcripts are injected by the test.
    struct FakeInput {
        available: bool,
    }

    impl SpeechInput for FakeInput {
        fn is_available(&self) -> bool {
            self.available
        }

        fn start(&mut self, epoch: Epoch, events: EventSender) -> Result<()> {
            events
                .try_send(Event::RecognitionStarted { epoch })
                .map_err(|e| anyhow::anyhow!("{e}"))
        }

        fn stop(&mut self) {}
    }

    #[derive(Clone, Copy)]
    enum Voice {
        /// Starts at once and talks for one second.
        Normal,
        Refuses,
        /// Accepts the text and never starts.
        Mute,
    }

    struct FakeOutput {
        voice: Voice,
        spoken: Arc<Mutex<Vec<String>>>,
        cancelled: Arc<AtomicBool>,
    }

    impl SpeechOutput for FakeOutput {
        fn speak(&mut self, epoch: Epoch, text: &str, events: EventSender) -> bool {
            self.spoken.lock().unwrap().push(text.to_string());
            match self.voice {
                Voice::Normal => {
                    tokio::spawn(async move {
                        let _ = events.send(Event::SpeechStarted { epoch }).await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        let _ = events.send(Event::SpeechEnded { epoch }).await;
                    });
                    true
                }
                Voice::Refuses => false,
                Voice::Mute => true,
            }
        }

        fn cancel(&mut self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Never answers.
    struct HangingEvaluator;

    #[async_trait]
    impl Evaluator for HangingEvaluator {
        async fn placement_step(&self, _history: &[ConversationMessage]) -> Result<PlacementStep> {
            std::future::pending().await
        }

        async fn generate_topic(&self, _level: CefrLevel) -> Result<Topic> {
            std::future::pending().await
        }

        async fn evaluate_turn(&self, _request: &TurnRequest) -> Result<TurnEvaluation> {
            std::future::pending().await
        }
    }

    /// Takes two seconds per call and tracks how many calls overlap.
    #[derive(Default)]
    struct SlowEvaluator {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl Evaluator for SlowEvaluator {
        async fn placement_step(&self, _history: &[ConversationMessage]) -> Result<PlacementStep> {
            Ok(PlacementStep::Question("And then?".to_string()))
        }

        async fn generate_topic(&self, level: CefrLevel) -> Result<Topic> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(fallback_topic(level))
        }

        async fn evaluate_turn(&self, _request: &TurnRequest) -> Result<TurnEvaluation> {
            Err(anyhow::anyhow!("not used"))
        }
    }

    struct Harness {
        events: EventSender,
        snapshots: watch::Receiver<Snapshot>,
        spoken: Arc<Mutex<Vec<String>>>,
        cancelled: Arc<AtomicBool>,
        handle: tokio::task::JoinHandle<Controller>,
    }

    fn start(store: MemoryStore, evaluator: Arc<dyn Evaluator>, voice: Voice, mic: bool) -> Harness {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let cancelled = Arc::new(AtomicBool::new(false));
        let driver = SessionDriver::new(
            SessionContext::init(Box::new(store)),
            evaluator,
            Box::new(FakeInput { available: mic }),
            Box::new(FakeOutput {
                voice,
                spoken: spoken.clone(),
                cancelled: cancelled.clone(),
            }),
            Timings::default(),
        );
        Harness {
            events: driver.events(),
            snapshots: driver.subscribe(),
            spoken,
            cancelled,
            handle: tokio::spawn(driver.run()),
        }
    }

    impl Harness {
        async fn user(&self, action: UserAction) {
            self.events.send(Event::User(action)).await.unwrap();
        }

        /// Waits, in virtual time, no longer than the watchdog ceiling.
        async fn wait_for(&mut self, pred: impl FnMut(&Snapshot) -> bool) -> Snapshot {
            tokio::time::timeout(WATCHDOG, self.snapshots.wait_for(pred))
                .await
                .expect("condition not reached within the watchdog ceiling")
                .expect("driver stopped")
                .clone()
        }

        /// Records and submits one answer once the conversation is idle.
        async fn answer(&mut self, text: &str) {
            self.wait_for(|s| s.view.is_conversational() && s.phase == Phase::Idle)
                .await;
            self.user(UserAction::StartListening).await;
            let snap = self
                .wait_for(|s| matches!(s.phase, Phase::Listening { .. }))
                .await;
            let Phase::Listening { epoch, .. } = snap.phase else {
                unreachable!()
            };
            self.events
                .send(Event::Transcript {
                    epoch,
                    text: text.to_string(),
                    is_final: true,
                })
                .await
                .unwrap();
            self.events
                .send(Event::RecognitionEnded { epoch })
                .await
                .unwrap();
            self.wait_for(|s| s.is_reviewing()).await;
            self.user(UserAction::Submit).await;
        }

        async fn shutdown(self) -> Controller {
            self.events.send(Event::Shutdown).await.unwrap();
            self.handle.await.unwrap()
        }
    }

    #[test]
    fn timings_require_the_watchdog_to_outlast_the_timeout() {
        assert!(Timings::new(EVALUATOR_TIMEOUT, WATCHDOG, SPEECH_START_GRACE).is_ok());
        assert_eq!(
            Timings::new(Duration::from_secs(15), Duration::from_secs(15), SPEECH_START_GRACE),
            Err(TimingsError::WatchdogTooShort {
                watchdog: Duration::from_secs(15),
                timeout: Duration::from_secs(15),
            })
        );
        assert_eq!(
            Timings::new(EVALUATOR_TIMEOUT, WATCHDOG, Duration::ZERO),
            Err(TimingsError::ZeroGrace)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_model_output_falls_back_and_recovers() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .returning(|_| Ok("not json{".to_string()));
        let evaluator = Arc::new(ModelEvaluator::new(model, PromptSet::default()));
        let mut h = start(MemoryStore::new(), evaluator, Voice::Normal, true);

        h.user(UserAction::BeginAssessment).await;
        h.answer("I work as a nurse in Lisbon.").await;

        let snap = h
            .wait_for(|s| {
                s.conversation.last().map(|m| m.text.as_str()) == Some(FALLBACK_QUESTION)
                    && matches!(s.state, InteractionState::Speaking | InteractionState::Idle)
            })
            .await;
        assert_eq!(snap.view, View::Assessment);
        assert!(h.spoken.lock().unwrap().iter().any(|t| t == FALLBACK_QUESTION));
        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_evaluator_times_out_into_the_fallback() {
        let mut h = start(
            MemoryStore::new(),
            Arc::new(HangingEvaluator),
            Voice::Normal,
            true,
        );
        h.user(UserAction::BeginAssessment).await;
        h.answer("Hello, I am Ana.").await;
        h.wait_for(|s| s.state == InteractionState::Processing).await;

        let started = tokio::time::Instant::now();
        h.wait_for(|s| s.state == InteractionState::Speaking).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(14) && waited < WATCHDOG, "{waited:?}");
        assert_eq!(
            h.spoken.lock().unwrap().last().map(String::as_str),
            Some(FALLBACK_QUESTION)
        );
        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_evaluator_call_is_in_flight() {
        let evaluator = Arc::new(SlowEvaluator::default());
        let mut h = start(
            MemoryStore::with_value(LEVEL_KEY, "B1"),
            evaluator.clone(),
            Voice::Normal,
            true,
        );

        h.user(UserAction::StartPractice).await;
        h.user(UserAction::FinishPractice).await;
        h.user(UserAction::StartPractice).await;
        let snap = h.wait_for(|s| s.notice == Some(Notice::StillWorking)).await;
        assert_eq!(snap.view, View::Dashboard);

        // Let the first call finish; its reply is stale and only frees the guard.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.snapshots.borrow().view, View::Dashboard);
        h.user(UserAction::StartPractice).await;
        h.wait_for(|s| s.state == InteractionState::Speaking).await;

        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(evaluator.max_running.load(Ordering::SeqCst), 1);
        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_speech_returns_to_idle() {
        let mut h = start(
            MemoryStore::new(),
            Arc::new(SlowEvaluator::default()),
            Voice::Refuses,
            true,
        );
        h.user(UserAction::BeginAssessment).await;
        let snap = h
            .wait_for(|s| s.view == View::Assessment && s.phase == Phase::Idle)
            .await;
        assert_eq!(snap.conversation.len(), 1);
        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn speech_that_never_starts_is_abandoned_after_the_grace_period() {
        let mut h = start(
            MemoryStore::new(),
            Arc::new(SlowEvaluator::default()),
            Voice::Mute,
            true,
        );
        h.user(UserAction::BeginAssessment).await;
        h.wait_for(|s| s.state == InteractionState::Processing).await;

        let started = tokio::time::Instant::now();
        h.wait_for(|s| s.state == InteractionState::Idle).await;
        assert!(started.elapsed() >= SPEECH_START_GRACE);
        assert!(h.cancelled.load(Ordering::SeqCst));
        h.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_microphone_is_reported() {
        let mut h = start(
            MemoryStore::new(),
            Arc::new(SlowEvaluator::default()),
            Voice::Normal,
            false,
        );
        h.user(UserAction::BeginAssessment).await;
        h.wait_for(|s| s.view == View::Assessment && s.phase == Phase::Idle)
            .await;
        h.user(UserAction::StartListening).await;
        let snap = h
            .wait_for(|s| s.notice == Some(Notice::SpeechInputUnavailable))
            .await;
        assert_eq!(snap.state, InteractionState::Idle);

        let controller = h.shutdown().await;
        assert_eq!(controller.view(), View::Assessment);
    }
}

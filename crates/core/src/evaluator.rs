use crate::parse::parse_reply;
use crate::prompts::{PromptSet, render};
use crate::types::{CefrLevel, ConversationMessage, Feedback, Role, Topic};
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;

/// Number of user turns in a placement interview and in a practice session.
pub const MAX_TURNS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementStep {
    Question(String),
    Verdict(CefrLevel),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEvaluation {
    pub feedback: Feedback,
    pub next_response: Option<String>,
    pub session_complete: bool,
}

/// Everything the evaluator needs to judge one practice turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub topic: Topic,
    pub history: Vec<ConversationMessage>,
    pub utterance: String,
    pub level: CefrLevel,
    /// 1-based number of the turn being judged.
    pub turn: usize,
}

/// A hosted text model: one prompt in, one completion out. Every prompt asks
/// for a single JSON object, so implementations request JSON output when the
/// provider supports it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// The conversation evaluator the controller talks to.
///
/// Implementations return errors freely; the session driver replaces any
/// error (or timeout) with the fallback for that call site.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Next interview question, or the final verdict once the history holds
    /// `MAX_TURNS` user turns.
    async fn placement_step(&self, history: &[ConversationMessage]) -> Result<PlacementStep>;

    async fn generate_topic(&self, level: CefrLevel) -> Result<Topic>;

    async fn evaluate_turn(&self, request: &TurnRequest) -> Result<TurnEvaluation>;
}

/// One evaluator call as issued by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluatorRequest {
    PlacementQuestion { history: Vec<ConversationMessage> },
    PlacementVerdict { history: Vec<ConversationMessage> },
    TopicIntro { level: CefrLevel },
    TurnEvaluation(TurnRequest),
}

impl EvaluatorRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluatorRequest::PlacementQuestion { .. } => "placement-question",
            EvaluatorRequest::PlacementVerdict { .. } => "placement-verdict",
            EvaluatorRequest::TopicIntro { .. } => "topic-intro",
            EvaluatorRequest::TurnEvaluation(_) => "turn-evaluation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluatorReply {
    Question(String),
    Level(CefrLevel),
    Topic(Topic),
    Turn(TurnEvaluation),
}

/// Routes `request` to the matching evaluator method.
pub async fn dispatch(
    evaluator: &dyn Evaluator,
    request: &EvaluatorRequest,
) -> Result<EvaluatorReply> {
    match request {
        EvaluatorRequest::PlacementQuestion { history } => {
            Ok(match evaluator.placement_step(history).await? {
                PlacementStep::Question(q) => EvaluatorReply::Question(q),
                PlacementStep::Verdict(level) => EvaluatorReply::Level(level),
            })
        }
        EvaluatorRequest::PlacementVerdict { history } => {
            match evaluator.placement_step(history).await? {
                PlacementStep::Verdict(level) => Ok(EvaluatorReply::Level(level)),
                PlacementStep::Question(q) => Err(anyhow::anyhow!(
                    "expected a level verdict, got a question: {q:?}"
                )),
            }
        }
        EvaluatorRequest::TopicIntro { level } => {
            Ok(EvaluatorReply::Topic(evaluator.generate_topic(*level).await?))
        }
        EvaluatorRequest::TurnEvaluation(turn) => {
            Ok(EvaluatorReply::Turn(evaluator.evaluate_turn(turn).await?))
        }
    }
}

// --- Model-backed evaluator ---

#[derive(Debug, Deserialize)]
struct PlacementWire {
    question: Option<String>,
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnWire {
    is_good: Option<bool>,
    correction: Option<String>,
    advice: Option<String>,
    score: Option<serde_json::Value>,
    next_response: Option<String>,
}

/// Evaluator backed by a `LanguageModel` and a set of prompt templates.
pub struct ModelEvaluator<M> {
    model: M,
    prompts: PromptSet,
}

impl<M: LanguageModel> ModelEvaluator<M> {
    pub fn new(model: M, prompts: PromptSet) -> Self {
        Self { model, prompts }
    }
}

#[async_trait]
impl<M: LanguageModel> Evaluator for ModelEvaluator<M> {
    async fn placement_step(&self, history: &[ConversationMessage]) -> Result<PlacementStep> {
        let turns = user_turns(history);
        let transcript = format_history(history, "Learner", "Examiner");

        if turns >= MAX_TURNS {
            let prompt = render(&self.prompts.placement_verdict, &[("history", &transcript)]);
            let raw = self.model.generate(&prompt).await?;
            let wire: PlacementWire =
                parse_reply(&raw).context("Failed to parse placement verdict")?;
            let level = wire
                .level
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("verdict has no level: {raw}"))?
                .parse::<CefrLevel>()?;
            tracing::info!("Placement verdict after {} turns: {}", turns, level);
            return Ok(PlacementStep::Verdict(level));
        }

        let turn = (turns + 1).to_string();
        let max = MAX_TURNS.to_string();
        let prompt = render(
            &self.prompts.placement_question,
            &[("history", &transcript), ("turn", &turn), ("max_turns", &max)],
        );
        let raw = self.model.generate(&prompt).await?;
        let wire: PlacementWire = parse_reply(&raw).context("Failed to parse placement question")?;
        match wire.question.map(|q| q.trim().to_string()) {
            Some(q) if !q.is_empty() => Ok(PlacementStep::Question(q)),
            _ => Err(anyhow::anyhow!("placement reply has no question: {raw}")),
        }
    }

    async fn generate_topic(&self, level: CefrLevel) -> Result<Topic> {
        let prompt = render(&self.prompts.topic, &[("level", level.code())]);
        let raw = self.model.generate(&prompt).await?;
        let mut topic: Topic = parse_reply(&raw).context("Failed to parse topic")?;
        if topic.opening_line.trim().is_empty() {
            return Err(anyhow::anyhow!("topic has no opening line: {raw}"));
        }
        if topic.id.is_empty() {
            topic.id = slug(&topic.title);
        }
        if topic.difficulty.is_empty() {
            topic.difficulty = level.code().to_string();
        }
        Ok(topic)
    }

    async fn evaluate_turn(&self, request: &TurnRequest) -> Result<TurnEvaluation> {
        let transcript = format_history(&request.history, "Learner", "You");
        let turn = request.turn.to_string();
        let max = MAX_TURNS.to_string();
        let prompt = render(
            &self.prompts.turn_evaluation,
            &[
                ("level", request.level.code()),
                ("topic_title", &request.topic.title),
                ("scenario", &request.topic.scenario),
                ("history", &transcript),
                ("utterance", &request.utterance),
                ("turn", &turn),
                ("max_turns", &max),
            ],
        );
        let raw = self.model.generate(&prompt).await?;
        let wire: TurnWire = parse_reply(&raw).context("Failed to parse turn evaluation")?;

        let correction = non_empty(wire.correction);
        let feedback = Feedback {
            is_good: wire.is_good.unwrap_or(correction.is_none()),
            correction,
            advice: non_empty(wire.advice),
            score: wire.score.as_ref().and_then(score_from),
        };
        Ok(TurnEvaluation {
            feedback,
            next_response: non_empty(wire.next_response),
            session_complete: request.turn >= MAX_TURNS,
        })
    }
}

pub fn user_turns(history: &[ConversationMessage]) -> usize {
    history.iter().filter(|m| m.role == Role::User).count()
}

/// Renders the conversation as `Label: text` lines.
pub fn format_history(history: &[ConversationMessage], user: &str, model: &str) -> String {
    if history.is_empty() {
        return "(no conversation yet)".to_string();
    }
    history
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => user,
                Role::Model => model,
            };
            format!("{}: {}", who, m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Accepts `3`, `3.6` or `"3"`; clamps into 1..=5.
fn score_from(value: &serde_json::Value) -> Option<u8> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.round().clamp(1.0, 5.0) as u8)
}

fn slug(title: &str) -> String {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    fn turns(n: usize) -> Vec<ConversationMessage> {
        let mut history = vec![];
        for i in 0..n {
            history.push(ConversationMessage::model(format!("Question {i}?")));
            history.push(ConversationMessage::user(format!("Answer {i}.")));
        }
        history
    }

    fn cafe() -> Topic {
        Topic {
            id: "cafe".to_string(),
            title: "At the café".to_string(),
            description: "Order a drink".to_string(),
            scenario: "You are a barista.".to_string(),
            difficulty: "B1".to_string(),
            opening_line: "Hi, what can I get you?".to_string(),
        }
    }

    #[tokio::test]
    async fn placement_asks_questions_before_the_fifth_turn() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .withf(|prompt| prompt.contains("turn 3 of 5"))
            .returning(|_| Ok(r#"{"question": "What did you do last weekend?"}"#.to_string()))
            .once();

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        let step = evaluator.placement_step(&turns(2)).await.unwrap();
        assert_eq!(
            step,
            PlacementStep::Question("What did you do last weekend?".to_string())
        );
    }

    #[tokio::test]
    async fn placement_returns_a_verdict_at_the_fifth_turn() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .withf(|prompt| prompt.contains("placement interview is finished"))
            .returning(|_| Ok("```json\n{\"level\": \"b2\"}\n```".to_string()))
            .once();

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        let step = evaluator.placement_step(&turns(5)).await.unwrap();
        assert_eq!(step, PlacementStep::Verdict(CefrLevel::B2));
    }

    #[tokio::test]
    async fn malformed_placement_reply_is_an_error() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .returning(|_| Ok("not json{".to_string()));

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        assert!(evaluator.placement_step(&turns(1)).await.is_err());
    }

    #[tokio::test]
    async fn turn_evaluation_carries_feedback_and_next_line() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .withf(|prompt| prompt.contains("I am very tired.") && prompt.contains("At the café"))
            .returning(|_| {
                Ok(r#"{"isGood":false,"correction":"I am exhausted.","advice":"Use 'exhausted' not 'very tired'.","score":2,"nextResponse":"I see, go on."}"#.to_string())
            });

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        let request = TurnRequest {
            topic: cafe(),
            history: vec![
                ConversationMessage::model("Hi, what can I get you?"),
                ConversationMessage::user("I am very tired."),
            ],
            utterance: "I am very tired.".to_string(),
            level: CefrLevel::B1,
            turn: 1,
        };
        let eval = evaluator.evaluate_turn(&request).await.unwrap();
        assert!(!eval.feedback.is_good);
        assert_eq!(eval.feedback.score, Some(2));
        assert_eq!(eval.feedback.correction.as_deref(), Some("I am exhausted."));
        assert_eq!(eval.next_response.as_deref(), Some("I see, go on."));
        assert!(!eval.session_complete);
    }

    #[tokio::test]
    async fn learner_braces_reach_the_model_verbatim() {
        let said = "My code is {turn} and {max_turns}";
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .withf(move |prompt| {
                prompt.contains(&format!("Learner: {said}"))
                    && prompt.contains(&format!("\"{said}\""))
                    && prompt.contains("(turn 1 of 5)")
            })
            .returning(|_| Ok(r#"{"isGood":true,"nextResponse":"Noted."}"#.to_string()))
            .once();

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        let request = TurnRequest {
            topic: cafe(),
            history: vec![
                ConversationMessage::model("Hi, what can I get you?"),
                ConversationMessage::user(said),
            ],
            utterance: said.to_string(),
            level: CefrLevel::B1,
            turn: 1,
        };
        let eval = evaluator.evaluate_turn(&request).await.unwrap();
        assert_eq!(eval.next_response.as_deref(), Some("Noted."));
    }

    #[tokio::test]
    async fn fifth_turn_completes_the_session() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .returning(|_| Ok(r#"{"isGood":true,"score":"7","nextResponse":"Bye!"}"#.to_string()));

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        let request = TurnRequest {
            topic: cafe(),
            history: turns(5),
            utterance: "Answer 4.".to_string(),
            level: CefrLevel::B1,
            turn: 5,
        };
        let eval = evaluator.evaluate_turn(&request).await.unwrap();
        assert!(eval.session_complete);
        assert_eq!(eval.feedback.score, Some(5));
    }

    #[tokio::test]
    async fn topic_gets_defaults_for_missing_fields() {
        let mut model = MockLanguageModel::new();
        model
            .expect_generate()
            .with(function(|p: &str| p.contains("CEFR level A2")))
            .returning(|_| {
                Ok(r#"Here it is: {"title":"Lost Luggage","scenario":"Airport desk","openingLine":"Next, please!"}"#.to_string())
            });

        let evaluator = ModelEvaluator::new(model, PromptSet::default());
        let topic = evaluator.generate_topic(CefrLevel::A2).await.unwrap();
        assert_eq!(topic.id, "lost-luggage");
        assert_eq!(topic.difficulty, "A2");
        assert_eq!(topic.opening_line, "Next, please!");
    }

    #[tokio::test]
    async fn verdict_request_rejects_a_question() {
        let mut evaluator = MockEvaluator::new();
        evaluator
            .expect_placement_step()
            .returning(|_| Ok(PlacementStep::Question("More?".to_string())));

        let request = EvaluatorRequest::PlacementVerdict { history: turns(5) };
        assert!(dispatch(&evaluator, &request).await.is_err());
    }

    #[test]
    fn history_is_labelled_by_role() {
        let text = format_history(&turns(1), "Learner", "Examiner");
        assert_eq!(text, "Examiner: Question 0?\nLearner: Answer 0.");
    }
}

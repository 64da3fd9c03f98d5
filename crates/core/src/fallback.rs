//! Local stand-ins used when an evaluator call fails or times out, so the
//! conversation always continues in character.

use crate::evaluator::{EvaluatorReply, EvaluatorRequest, MAX_TURNS, TurnEvaluation};
use crate::types::{CefrLevel, Feedback, Topic};

pub const OPENING_QUESTION: &str =
    "Hi! Let's find your level. To start, could you tell me a little about yourself?";
pub const FALLBACK_QUESTION: &str =
    "Interesting! Could you tell me a bit more about that, and why it matters to you?";
pub const FALLBACK_LEVEL: CefrLevel = CefrLevel::A2;
pub const FALLBACK_ADVICE: &str =
    "I couldn't review that one in detail. Keep going, you're doing fine!";
pub const FALLBACK_CONTINUATION: &str = "I see. Please, go on.";
pub const FALLBACK_CLOSING: &str = "Thanks, that was a great conversation. See you next time!";

pub fn fallback_topic(level: CefrLevel) -> Topic {
    Topic {
        id: "coffee-shop".to_string(),
        title: "At the coffee shop".to_string(),
        description: "Order a drink and chat with the barista.".to_string(),
        scenario: "I am a barista in a busy coffee shop and you are a customer.".to_string(),
        difficulty: level.code().to_string(),
        opening_line: "Hi there! What can I get for you today?".to_string(),
    }
}

pub fn fallback_feedback() -> Feedback {
    Feedback {
        is_good: true,
        correction: None,
        advice: Some(FALLBACK_ADVICE.to_string()),
        score: None,
    }
}

/// The reply substituted for a failed `request`.
pub fn fallback_for(request: &EvaluatorRequest) -> EvaluatorReply {
    match request {
        EvaluatorRequest::PlacementQuestion { .. } => {
            EvaluatorReply::Question(FALLBACK_QUESTION.to_string())
        }
        EvaluatorRequest::PlacementVerdict { .. } => EvaluatorReply::Level(FALLBACK_LEVEL),
        EvaluatorRequest::TopicIntro { level } => EvaluatorReply::Topic(fallback_topic(*level)),
        EvaluatorRequest::TurnEvaluation(turn) => {
            let session_complete = turn.turn >= MAX_TURNS;
            let line = if session_complete {
                FALLBACK_CLOSING
            } else {
                FALLBACK_CONTINUATION
            };
            EvaluatorReply::Turn(TurnEvaluation {
                feedback: fallback_feedback(),
                next_response: Some(line.to_string()),
                session_complete,
            })
        }
    }
}

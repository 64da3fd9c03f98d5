use crate::evaluator::{Evaluator, MAX_TURNS, PlacementStep, TurnEvaluation, TurnRequest, user_turns};
use crate::types::{CefrLevel, ConversationMessage, Feedback, Role, Topic};
use anyhow::Result;
use async_trait::async_trait;

const QUESTIONS: [&str; MAX_TURNS - 1] = [
    "Nice to meet you. What do you usually do on a typical weekday?",
    "What is the most interesting place you have ever visited, and why?",
    "If you could change one thing about your city, what would it be?",
    "Some people say technology makes us less social. What do you think?",
];

const ROLEPLAY_LINES: [&str; MAX_TURNS - 1] = [
    "Sure. Would you like anything else with that?",
    "Great choice. Is that for here or to take away?",
    "No problem. Can I have a name for the order?",
    "Perfect. That will be ready in a few minutes.",
];

/// Canned evaluator that needs no network access.
///
/// The verdict is a rough proxy: average words per learner turn.
pub struct OfflineEvaluator;

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn level_from_words(avg_words: f32) -> CefrLevel {
    match avg_words {
        w if w < 5.0 => CefrLevel::A1,
        w if w < 9.0 => CefrLevel::A2,
        w if w < 14.0 => CefrLevel::B1,
        w if w < 20.0 => CefrLevel::B2,
        w if w < 28.0 => CefrLevel::C1,
        _ => CefrLevel::C2,
    }
}

#[async_trait]
impl Evaluator for OfflineEvaluator {
    async fn placement_step(&self, history: &[ConversationMessage]) -> Result<PlacementStep> {
        let turns = user_turns(history);
        if turns >= MAX_TURNS {
            let words: usize = history
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| word_count(&m.text))
                .sum();
            let avg = words as f32 / turns as f32;
            return Ok(PlacementStep::Verdict(level_from_words(avg)));
        }
        let idx = turns.saturating_sub(1).min(QUESTIONS.len() - 1);
        Ok(PlacementStep::Question(QUESTIONS[idx].to_string()))
    }

    async fn generate_topic(&self, level: CefrLevel) -> Result<Topic> {
        Ok(Topic {
            id: "coffee-order".to_string(),
            title: "Ordering coffee".to_string(),
            description: "Order a drink the way you like it.".to_string(),
            scenario: "I am the barista, you are a customer at the counter.".to_string(),
            difficulty: level.code().to_string(),
            opening_line: "Good morning! What would you like to drink?".to_string(),
        })
    }

    async fn evaluate_turn(&self, request: &TurnRequest) -> Result<TurnEvaluation> {
        let words = word_count(&request.utterance);
        let is_good = words >= 4;
        let score = match words {
            0..=2 => 2,
            3..=5 => 3,
            6..=10 => 4,
            _ => 5,
        };
        let feedback = Feedback {
            is_good,
            correction: None,
            advice: Some(if is_good {
                "Good, natural answer.".to_string()
            } else {
                "Try answering in a full sentence.".to_string()
            }),
            score: Some(score),
        };
        let session_complete = request.turn >= MAX_TURNS;
        let next_response = if session_complete {
            "Here you go. Have a lovely day!".to_string()
        } else {
            let idx = request.turn.saturating_sub(1).min(ROLEPLAY_LINES.len() - 1);
            ROLEPLAY_LINES[idx].to_string()
        };
        Ok(TurnEvaluation {
            feedback,
            next_response: Some(next_response),
            session_complete,
        })
    }
}

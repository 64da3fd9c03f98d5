use lingo_core::context::SessionSummary;
use lingo_core::controller::Snapshot;
use lingo_core::types::{Feedback, InteractionState, Role, Topic, View};

/// Turns successive snapshots into console lines, printing only what changed.
#[derive(Default)]
pub struct Renderer {
    last: Option<Snapshot>,
}

impl Renderer {
    pub fn render(&mut self, snap: &Snapshot) -> Vec<String> {
        let mut lines = Vec::new();
        let prev = self.last.as_ref();

        let view_changed = prev.is_none_or(|p| p.view != snap.view);
        if view_changed {
            lines.push(String::new());
            lines.push(format!("== {} ==", snap.view));
            lines.extend(view_help(snap));
        }

        // The topic usually arrives after the switch to Practice.
        if snap.view == View::Practice {
            if let Some(topic) = &snap.topic {
                if view_changed || prev.is_none_or(|p| p.topic.as_ref() != Some(topic)) {
                    lines.extend(scene_lines(topic));
                }
            }
        }

        // A reset conversation no longer extends the previous one; print it from the start.
        let seen = match prev {
            Some(p) if snap.conversation.starts_with(&p.conversation) => {
                p.conversation.len()
            }
            _ => 0,
        };
        for message in &snap.conversation[seen..] {
            match message.role {
                Role::Model => lines.push(format!("Coach: {}", message.text)),
                Role::User => lines.push(format!("  You: {}", message.text)),
            }
        }

        if let Some(feedback) = &snap.feedback {
            if prev.is_none_or(|p| p.feedback.as_ref() != Some(feedback)) {
                lines.extend(feedback_lines(feedback));
            }
        }

        if let Some(notice) = &snap.notice {
            if prev.is_none_or(|p| p.notice.as_ref() != Some(notice)) {
                lines.push(format!("! {notice}"));
            }
        }

        if snap.is_reviewing() && prev.is_none_or(|p| !p.is_reviewing()) {
            if let Some(text) = snap.transcript() {
                lines.push(format!("  Heard: \"{text}\"  (/send, /discard or /retry)"));
            }
        }

        if prev.is_some_and(|p| p.state != snap.state) && snap.view.is_conversational() {
            lines.push(state_line(snap.state).to_string());
        }

        self.last = Some(snap.clone());
        lines
    }
}

fn view_help(snap: &Snapshot) -> Vec<String> {
    match snap.view {
        View::Landing => vec!["Type /begin to take the placement interview.".to_string()],
        View::Assessment => vec![
            "Answer each question by typing it, or /talk then your line.".to_string(),
        ],
        View::Dashboard => {
            let mut lines = Vec::new();
            if let Some(level) = snap.level {
                lines.push(format!("Your level: {} ({})", level, level.description()));
            }
            lines.push("Type /practice to start a conversation, /retake to reassess.".to_string());
            lines
        }
        View::Practice if snap.topic.is_none() => vec!["Choosing a scene...".to_string()],
        View::Practice => Vec::new(),
        View::Summary => {
            let mut lines = summary_lines(&snap.summary);
            lines.push(
                "Session complete. /practice for another round or /done for the dashboard."
                    .to_string(),
            );
            lines
        }
    }
}

fn scene_lines(topic: &Topic) -> Vec<String> {
    let mut lines = vec![format!("Scene: {} - {}", topic.title, topic.description)];
    if !topic.scenario.trim().is_empty() {
        lines.push(format!("  {}", topic.scenario));
    }
    lines
}

fn summary_lines(summary: &SessionSummary) -> Vec<String> {
    if summary.turns == 0 {
        return Vec::new();
    }
    let mut lines = vec![format!(
        "You spoke {} turns; {} needed no correction.",
        summary.turns, summary.good_turns
    )];
    if let Some(average) = summary.average_score() {
        let scores: Vec<String> = summary.scores.iter().map(u8::to_string).collect();
        lines.push(format!("Scores: {} (average {:.1}/5)", scores.join(", "), average));
    }
    lines
}

/// The recent activity entries as `HH:MM:SS message` lines.
pub fn activity_lines(snap: &Snapshot) -> Vec<String> {
    if snap.activity.is_empty() {
        return vec!["(no activity yet)".to_string()];
    }
    snap.activity
        .iter()
        .map(|entry| format!("{} {}", entry.at.format("%H:%M:%S"), entry.message))
        .collect()
}

fn feedback_lines(feedback: &Feedback) -> Vec<String> {
    let mut lines = Vec::new();
    let verdict = if feedback.is_good { "Good" } else { "Needs work" };
    match feedback.score {
        Some(score) => lines.push(format!("  [{verdict}, {score}/5]")),
        None => lines.push(format!("  [{verdict}]")),
    }
    if let Some(correction) = &feedback.correction {
        lines.push(format!("  Better: {correction}"));
    }
    if let Some(advice) = &feedback.advice {
        lines.push(format!("  Tip: {advice}"));
    }
    lines
}

fn state_line(state: InteractionState) -> &'static str {
    match state {
        InteractionState::Idle => "(your turn)",
        InteractionState::Listening => "(listening... type your answer)",
        InteractionState::Processing => "(thinking...)",
        InteractionState::Speaking => "(speaking, /cancel to skip)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingo_core::Notice;
    use lingo_core::context::ActivityLog;
    use lingo_core::controller::Phase;
    use lingo_core::types::{CefrLevel, ConversationMessage, Epoch};

    fn snapshot(view: View) -> Snapshot {
        Snapshot {
            view,
            state: InteractionState::Idle,
            phase: Phase::Idle,
            conversation: Vec::new(),
            topic: None,
            feedback: None,
            level: None,
            user_turns: 0,
            notice: None,
            summary: SessionSummary::default(),
            activity: Vec::new(),
        }
    }

    fn market() -> Topic {
        Topic {
            id: "market".to_string(),
            title: "At the market".to_string(),
            description: "Buy fruit".to_string(),
            scenario: "You are a stall owner.".to_string(),
            difficulty: "A2".to_string(),
            opening_line: "Fresh apples today!".to_string(),
        }
    }

    #[test]
    fn first_render_shows_the_view_and_its_help() {
        let mut r = Renderer::default();
        let lines = r.render(&snapshot(View::Landing));
        assert!(lines.contains(&"== Landing ==".to_string()));
        assert!(lines.iter().any(|l| l.contains("/begin")));
    }

    #[test]
    fn only_new_messages_are_printed() {
        let mut r = Renderer::default();
        let mut snap = snapshot(View::Assessment);
        snap.conversation.push(ConversationMessage::model("Where are you from?"));
        let lines = r.render(&snap);
        assert!(lines.contains(&"Coach: Where are you from?".to_string()));

        snap.conversation.push(ConversationMessage::user("From Porto."));
        let lines = r.render(&snap);
        assert_eq!(lines, vec!["  You: From Porto.".to_string()]);

        assert!(r.render(&snap).is_empty());
    }

    #[test]
    fn dashboard_shows_the_level_and_notice() {
        let mut r = Renderer::default();
        r.render(&snapshot(View::Assessment));
        let mut snap = snapshot(View::Dashboard);
        snap.level = Some(CefrLevel::B2);
        snap.notice = Some(Notice::LevelAssigned(CefrLevel::B2));
        let lines = r.render(&snap);
        assert!(lines.iter().any(|l| l.starts_with("Your level: B2")));
        assert!(lines.iter().any(|l| l.starts_with("! Your level is B2")));
    }

    #[test]
    fn feedback_is_printed_once() {
        let mut r = Renderer::default();
        let mut snap = snapshot(View::Practice);
        r.render(&snap);
        snap.feedback = Some(Feedback {
            is_good: false,
            correction: Some("I am exhausted.".to_string()),
            advice: Some("Use 'exhausted' not 'very tired'.".to_string()),
            score: Some(2),
        });
        let lines = r.render(&snap);
        assert_eq!(
            lines,
            vec![
                "  [Needs work, 2/5]".to_string(),
                "  Better: I am exhausted.".to_string(),
                "  Tip: Use 'exhausted' not 'very tired'.".to_string(),
            ]
        );
        assert!(r.render(&snap).is_empty());
    }

    #[test]
    fn state_changes_and_review_prompt() {
        let mut r = Renderer::default();
        let mut snap = snapshot(View::Assessment);
        r.render(&snap);

        snap.state = InteractionState::Listening;
        snap.phase = Phase::Listening {
            epoch: Epoch(1),
            transcript: String::new(),
        };
        assert_eq!(r.render(&snap), vec![state_line(InteractionState::Listening)]);

        snap.state = InteractionState::Idle;
        snap.phase = Phase::Reviewing {
            epoch: Epoch(1),
            transcript: "I like trains".to_string(),
        };
        let lines = r.render(&snap);
        assert!(lines[0].contains("Heard: \"I like trains\""));
        assert_eq!(lines[1], state_line(InteractionState::Idle));
    }

    #[test]
    fn scene_is_shown_once_the_topic_arrives() {
        let mut r = Renderer::default();
        let mut snap = snapshot(View::Practice);
        assert_eq!(
            r.render(&snap),
            vec![
                String::new(),
                "== Practice ==".to_string(),
                "Choosing a scene...".to_string()
            ]
        );

        snap.topic = Some(market());
        snap.conversation.push(ConversationMessage::model("Fresh apples today!"));
        assert_eq!(
            r.render(&snap),
            vec![
                "Scene: At the market - Buy fruit".to_string(),
                "  You are a stall owner.".to_string(),
                "Coach: Fresh apples today!".to_string(),
            ]
        );
        assert!(r.render(&snap).is_empty());
    }

    #[test]
    fn summary_view_shows_the_session_scores() {
        let mut r = Renderer::default();
        r.render(&snapshot(View::Practice));
        let mut snap = snapshot(View::Summary);
        snap.summary = SessionSummary {
            turns: 5,
            good_turns: 3,
            scores: vec![4, 2, 5, 3, 4],
        };
        let lines = r.render(&snap);
        assert!(lines.contains(&"You spoke 5 turns; 3 needed no correction.".to_string()));
        assert!(lines.contains(&"Scores: 4, 2, 5, 3, 4 (average 3.6/5)".to_string()));
    }

    #[test]
    fn activity_lines_are_timestamped() {
        let mut snap = snapshot(View::Assessment);
        assert_eq!(activity_lines(&snap), vec!["(no activity yet)".to_string()]);

        let mut log = ActivityLog::with_capacity(4);
        log.push("Idle -> Listening");
        snap.activity = log.recent(4);
        let lines = activity_lines(&snap);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(" Idle -> Listening"));
    }
}

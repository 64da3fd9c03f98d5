use std::collections::HashMap;

/// Prompt templates sent to the language model. Placeholders are written as
/// `{name}`; unknown braces (the JSON examples) are left untouched.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub placement_question: String,
    pub placement_verdict: String,
    pub topic: String,
    pub turn_evaluation: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            placement_question: include_str!("../prompts/placement_question.md").to_string(),
            placement_verdict: include_str!("../prompts/placement_verdict.md").to_string(),
            topic: include_str!("../prompts/topic.md").to_string(),
            turn_evaluation: include_str!("../prompts/turn_evaluation.md").to_string(),
        }
    }
}

impl PromptSet {
    /// Built-in templates overridden by any entry of `overrides` whose key is
    /// a template name (the file stem when loaded from a directory).
    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        let mut set = Self::default();
        for (name, template) in overrides {
            let slot = match name.as_str() {
                "placement_question" => &mut set.placement_question,
                "placement_verdict" => &mut set.placement_verdict,
                "topic" => &mut set.topic,
                "turn_evaluation" => &mut set.turn_evaluation,
                other => {
                    tracing::warn!("Ignoring unknown prompt template '{}'", other);
                    continue;
                }
            };
            tracing::debug!("Using custom prompt template '{}'", name);
            *slot = template;
        }
        set
    }
}

/// Substitutes each `{key}` in `template` with its value in a single
/// left-to-right pass. Inserted values are never scanned again, so braces in
/// learner text survive verbatim.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let known = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, close))
        });
        match known {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

//! Prompt template filling
//!
//! Substitutes `{{...}}` placeholders into a configured input template. The
//! fill is idempotent: if the raw input already matches the shape of the
//! filled template, it is returned unchanged so repeated application never
//! nests wrappers.

use regex::Regex;

use crate::core::constants::{DEFAULT_INPUT_TEMPLATE, DEFAULT_KNOWLEDGE_CUTOFF};
use crate::core::mask::ModelConfig;

const INPUT_VAR: &str = "{{input}}";

/// Knowledge cutoff per model family, longest prefix wins.
const KNOWLEDGE_CUTOFFS: &[(&str, &str)] = &[
    ("gpt-4o", "2023-10"),
    ("gpt-4-turbo", "2023-12"),
    ("gpt-4", "2021-09"),
    ("gpt-3.5-turbo", "2021-09"),
    ("claude-3-5", "2024-04"),
    ("claude-3", "2023-08"),
    ("gemini-1.5", "2023-11"),
];

pub fn knowledge_cutoff(model: &str) -> &'static str {
    KNOWLEDGE_CUTOFFS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, cutoff)| *cutoff)
        .unwrap_or(DEFAULT_KNOWLEDGE_CUTOFF)
}

fn substitute_vars(template: &str, config: &ModelConfig) -> String {
    template
        .replace("{{ServiceProvider}}", &config.provider_name)
        .replace("{{cutoff}}", knowledge_cutoff(&config.model))
        .replace("{{model}}", &config.model)
        .replace("{{time}}", &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
        .replace("{{lang}}", "en")
        .replace("{{newline}}", "\n")
}

/// Build an anchored regex matching any input already shaped like the
/// template. `{{input}}` and every other placeholder become wildcards, so
/// the check is stable even for time-dependent substitutions.
fn shape_regex(template: &str) -> Option<Regex> {
    let placeholder = Regex::new(r"\\\{\\\{\w+\\\}\\\}").ok()?;
    let escaped = regex::escape(template);
    let pattern = format!("(?s)^{}$", placeholder.replace_all(&escaped, ".*"));
    Regex::new(&pattern).ok()
}

/// Fill the configured input template with `input`.
///
/// Pure function. Guarantees the output contains `input` exactly once; a
/// template that omits `{{input}}` gets it appended on a new line.
pub fn fill_template(input: &str, config: &ModelConfig) -> String {
    let mut template = if config.template.is_empty() {
        DEFAULT_INPUT_TEMPLATE.to_string()
    } else {
        config.template.clone()
    };
    if !template.contains(INPUT_VAR) {
        template.push('\n');
        template.push_str(INPUT_VAR);
    }

    // Skip re-wrapping when the input already matches the template shape.
    if let Some(shape) = shape_regex(&template) {
        if shape.is_match(input) {
            return input.to_string();
        }
    }

    substitute_vars(&template, config).replace(INPUT_VAR, input)
}

/// Fill a system-prompt template: same substitutions, no input handling.
pub fn fill_system_template(template: &str, config: &ModelConfig) -> String {
    substitute_vars(template, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_template(template: &str) -> ModelConfig {
        ModelConfig {
            template: template.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_template_returns_input_unchanged() {
        let config = ModelConfig::default();
        assert_eq!(fill_template("Hello there", &config), "Hello there");
    }

    #[test]
    fn wrapping_template_substitutes_placeholders() {
        let config = config_with_template("[{{model}}] {{input}}");
        let filled = fill_template("what is rust", &config);
        assert_eq!(filled, format!("[{}] what is rust", config.model));
    }

    #[test]
    fn fill_is_idempotent() {
        let config = config_with_template("Q ({{ServiceProvider}}): {{input}}");
        let once = fill_template("ship it?", &config);
        let twice = fill_template(&once, &config);
        assert_eq!(once, twice);
    }

    #[test]
    fn template_without_input_var_gets_it_appended() {
        let config = config_with_template("Answer concisely.");
        let filled = fill_template("why is the sky blue", &config);
        assert_eq!(filled, "Answer concisely.\nwhy is the sky blue");
    }

    #[test]
    fn regex_metacharacters_in_template_are_escaped() {
        let config = config_with_template("(a|b)* {{input}} [end]");
        let filled = fill_template("plain", &config);
        assert_eq!(filled, "(a|b)* plain [end]");
        assert_eq!(fill_template(&filled, &config), filled);
    }

    #[test]
    fn cutoff_lookup_prefers_longest_prefix() {
        assert_eq!(knowledge_cutoff("gpt-4o-mini"), "2023-10");
        assert_eq!(knowledge_cutoff("gpt-4-0613"), "2021-09");
        assert_eq!(knowledge_cutoff("some-unknown-model"), DEFAULT_KNOWLEDGE_CUTOFF);
    }

    #[test]
    fn system_template_fills_provider_and_model() {
        let config = ModelConfig::default();
        let filled =
            fill_system_template("provider={{ServiceProvider}} model={{model}}", &config);
        assert_eq!(
            filled,
            format!("provider={} model={}", config.provider_name, config.model)
        );
    }
}

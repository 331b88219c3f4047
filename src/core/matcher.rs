use std::sync::Arc;

use regex::Captures;
use tracing::{debug, trace};

use crate::core::catalogue::IntentCatalogue;
use crate::core::intent::{IntentTemplate, ParsedIntent};
use crate::core::params::IntentParams;

/// Score of any successful pattern match before bonuses.
pub const BASE_CONFIDENCE: f64 = 0.70;
/// Weight of the share of required parameters that were filled.
pub const REQUIRED_PARAMS_WEIGHT: f64 = 0.30;
/// Added when the match covers the whole (trimmed) input.
pub const EXACT_MATCH_BONUS: f64 = 0.10;

/// Finds the best intent for an utterance by scanning every pattern of every
/// template in catalogue order.
#[derive(Clone)]
pub struct IntentMatcher {
    catalogue: Arc<IntentCatalogue>,
}

impl IntentMatcher {
    pub fn new(catalogue: Arc<IntentCatalogue>) -> Self {
        Self { catalogue }
    }

    pub fn catalogue(&self) -> &Arc<IntentCatalogue> {
        &self.catalogue
    }

    /// Best match, or `None` when no pattern matches. Only a strictly higher
    /// confidence displaces the current best, so ties go to the template and
    /// pattern that come first.
    pub fn parse(&self, text: &str) -> Option<ParsedIntent> {
        let mut best: Option<ParsedIntent> = None;

        for (template, patterns) in self.catalogue.compiled() {
            for (index, pattern) in patterns.iter().enumerate() {
                let Some(captures) = pattern.captures(text) else {
                    continue;
                };
                let params = extract_parameters(template, &captures);
                let matched = captures.get(0).map_or("", |m| m.as_str());
                let confidence = score(template, matched, text, &params);
                trace!(intent = %template.name, pattern = index, confidence, "candidate");

                if best.as_ref().map_or(true, |b| confidence > b.confidence) {
                    best = Some(ParsedIntent {
                        intent: Arc::clone(template),
                        extracted_params: params,
                        confidence,
                        raw_text: text.to_string(),
                        matched_text: matched.to_string(),
                        pattern_index: index,
                    });
                }
            }
        }

        match &best {
            Some(parsed) => debug!(intent = parsed.name(), confidence = parsed.confidence, "matched"),
            None => debug!("no intent matched"),
        }
        best
    }
}

/// Builds the parameter map for one match in declaration order. A non-empty
/// capture is converted per kind; otherwise the default applies; otherwise
/// the parameter is left out.
pub fn extract_parameters(template: &IntentTemplate, captures: &Captures<'_>) -> IntentParams {
    let mut params = IntentParams::new();
    for (name, spec) in &template.parameters {
        let captured = captures
            .name(name)
            .map(|m| m.as_str())
            .filter(|text| !text.is_empty());

        let value = match captured {
            Some(text) => spec.kind.convert(text),
            None => spec.default.clone(),
        };
        if let Some(value) = value {
            params.insert(name.clone(), value);
        }
    }
    params
}

/// Confidence in `[0.70, 1.00]` for a successful match.
pub fn score(template: &IntentTemplate, matched: &str, input: &str, params: &IntentParams) -> f64 {
    let mut confidence = BASE_CONFIDENCE;

    let required: Vec<&str> = template
        .required_parameters()
        .map(|spec| spec.name.as_str())
        .collect();
    if !required.is_empty() {
        let filled = required
            .iter()
            .filter(|name| params.contains_key(**name))
            .count();
        confidence += REQUIRED_PARAMS_WEIGHT * (filled as f64 / required.len() as f64);
    }

    if matched.trim().to_lowercase() == input.trim().to_lowercase() {
        confidence += EXACT_MATCH_BONUS;
    }

    confidence.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handlers::{HandlerRegistry, HandlerSettings, UserDirs};
    use crate::core::intent::IntentCategory;
    use crate::core::params::{ParamKind, ParamValue, ParameterSpec};
    use std::time::Duration;

    fn builtin_matcher() -> IntentMatcher {
        let registry = HandlerRegistry::with_builtins(HandlerSettings {
            settle_delay: Duration::ZERO,
            dirs: UserDirs::rooted(&std::env::temp_dir()),
        });
        let catalogue = IntentCatalogue::builtin(&registry).unwrap();
        IntentMatcher::new(Arc::new(catalogue))
    }

    fn matcher_for(templates: Vec<IntentTemplate>) -> IntentMatcher {
        let mut catalogue = IntentCatalogue::new();
        for template in templates {
            catalogue.register(template).unwrap();
        }
        IntentMatcher::new(Arc::new(catalogue))
    }

    #[test]
    fn test_every_example_parses_to_its_intent() {
        let matcher = builtin_matcher();
        for template in matcher.catalogue().all() {
            for example in &template.examples {
                let parsed = matcher
                    .parse(example)
                    .unwrap_or_else(|| panic!("'{}' did not match", example));
                assert_eq!(parsed.name(), template.name, "example '{}'", example);
                assert!((0.7..=1.0).contains(&parsed.confidence));
            }
        }
    }

    #[test]
    fn test_click_scenario() {
        let parsed = builtin_matcher().parse("click at 500,300").unwrap();
        assert_eq!(parsed.name(), "click_coordinates");
        let params = &parsed.extracted_params;
        assert_eq!(params["coordinates"], ParamValue::Coordinates { x: 500, y: 300 });
        assert_eq!(params["button"], ParamValue::Str("left".to_string()));
        assert_eq!(params["clicks"], ParamValue::Int(1));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_screenshot_defaults_to_desktop() {
        let parsed = builtin_matcher().parse("take a screenshot").unwrap();
        assert_eq!(parsed.name(), "take_screenshot");
        assert!(parsed.confidence >= 0.7);
        assert_eq!(
            parsed.extracted_params["save_path"],
            ParamValue::Path("desktop".into())
        );
    }

    #[test]
    fn test_type_quoted_text() {
        let parsed = builtin_matcher().parse("type \"Hello World\"").unwrap();
        assert_eq!(parsed.name(), "type_text");
        assert_eq!(parsed.extracted_params["text"], ParamValue::Str("Hello World".to_string()));
    }

    #[test]
    fn test_no_match_is_none() {
        assert!(builtin_matcher().parse("what a lovely afternoon").is_none());
        assert!(builtin_matcher().parse("").is_none());
    }

    #[test]
    fn test_scoring_bonuses() {
        let template = IntentTemplate::new("greet", IntentCategory::Utility)
            .with_parameter(ParameterSpec::new("name", ParamKind::String).required())
            .with_parameter(ParameterSpec::new("mood", ParamKind::String).required())
            .with_pattern(r"hello\s+(?P<name>\w+)(?:\s+i am (?P<mood>\w+))?");
        let matcher = matcher_for(vec![template]);

        // Half the required parameters, match covers everything.
        let half = matcher.parse("Hello Bob").unwrap();
        assert!((half.confidence - 0.95).abs() < 1e-9);

        // All required parameters but trailing text breaks the exact bonus.
        let full = matcher.parse("hello bob i am happy, thanks").unwrap();
        assert!((full.confidence - 1.0).abs() < 1e-9);

        let partial = matcher.parse("oh, hello bob").unwrap();
        assert!((partial.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_capped() {
        let template = IntentTemplate::new("ping", IntentCategory::Utility)
            .with_parameter(ParameterSpec::new("host", ParamKind::String).required())
            .with_pattern(r"ping (?P<host>\S+)");
        let matcher = matcher_for(vec![template]);
        let parsed = matcher.parse("ping example.org").unwrap();
        assert_eq!(parsed.confidence, 1.0);
    }

    #[test]
    fn test_equal_scores_keep_first_registered() {
        let make = |name: &str| {
            IntentTemplate::new(name, IntentCategory::Utility).with_pattern(r"open (?P<what>\w+)")
        };
        let matcher = matcher_for(vec![make("alpha"), make("beta")]);
        for _ in 0..10 {
            assert_eq!(matcher.parse("open thing").unwrap().name(), "alpha");
        }

        let reversed = matcher_for(vec![make("beta"), make("alpha")]);
        assert_eq!(reversed.parse("open thing").unwrap().name(), "beta");
    }

    #[test]
    fn test_bad_numeric_capture_stays_raw() {
        let template = IntentTemplate::new("repeat", IntentCategory::Utility)
            .with_parameter(ParameterSpec::new("times", ParamKind::Int).with_default(1))
            .with_parameter(ParameterSpec::new("at", ParamKind::Coordinates))
            .with_pattern(r"repeat (?P<times>\w+)(?: at (?P<at>\w+))?");
        let matcher = matcher_for(vec![template]);

        let parsed = matcher.parse("repeat twice at corner").unwrap();
        assert_eq!(parsed.extracted_params["times"], ParamValue::Str("twice".to_string()));
        // Coordinates without two integers are left unset.
        assert!(!parsed.extracted_params.contains_key("at"));

        let parsed = matcher.parse("repeat 3").unwrap();
        assert_eq!(parsed.extracted_params["times"], ParamValue::Int(3));
    }
}

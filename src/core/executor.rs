use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::core::automation::Automation;
use crate::core::intent::{ExecutionResult, ParsedIntent};
use crate::core::params::{ParamValue, RAW_MESSAGE_KEY};

/// Validates a parsed intent and runs its handler. Never returns an error:
/// every failure is folded into `ExecutionResult { success: false, .. }`.
#[derive(Clone)]
pub struct IntentExecutor {
    automation: Arc<dyn Automation>,
}

impl IntentExecutor {
    pub fn new(automation: Arc<dyn Automation>) -> Self {
        Self { automation }
    }

    pub fn automation(&self) -> &Arc<dyn Automation> {
        &self.automation
    }

    /// Validation messages for `parsed`, empty when it may run.
    pub fn validate(&self, parsed: &ParsedIntent) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, spec) in &parsed.intent.parameters {
            match parsed.extracted_params.get(name) {
                None if spec.required => {
                    errors.push(format!("Required parameter '{}' is missing", name));
                }
                Some(value) if !spec.accepts(value) => {
                    errors.push(format!("Parameter '{}' doesn't match required pattern", name));
                }
                _ => {}
            }
        }
        errors
    }

    pub async fn execute(&self, parsed: &ParsedIntent) -> ExecutionResult {
        let intent = parsed.name();
        let Some(handler) = parsed.intent.handler.clone() else {
            warn!(intent, "no handler bound");
            return ExecutionResult::failure(format!("No handler registered for intent: {}", intent));
        };

        let errors = self.validate(parsed);
        if !errors.is_empty() {
            debug!(intent, ?errors, "validation failed");
            return ExecutionResult::failure(errors.join("; "));
        }

        let mut params = parsed.extracted_params.clone();
        params.insert(
            RAW_MESSAGE_KEY.to_string(),
            ParamValue::Str(parsed.raw_text.clone()),
        );

        info!(intent, "dispatching");
        let outcome = AssertUnwindSafe(handler.invoke(self.automation.as_ref(), &params))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(result)) => result.normalized(),
            Ok(Err(err)) => {
                warn!(intent, error = %err, "handler failed");
                ExecutionResult::failure(err.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(intent, reason = %reason, "handler panicked");
                ExecutionResult::failure(format!("Handler for '{}' panicked: {}", intent, reason))
            }
        };
        debug!(intent, success = result.success, "handler finished");
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::automation::RecordingAutomation;
    use crate::core::catalogue::IntentCatalogue;
    use crate::core::handlers::{HandlerError, HandlerRegistry, IntentHandler, SyncHandler};
    use crate::core::intent::{IntentCategory, IntentTemplate};
    use crate::core::matcher::IntentMatcher;
    use crate::core::params::{IntentParams, ParamKind, ParameterSpec};

    fn parse_with(template: IntentTemplate, text: &str) -> ParsedIntent {
        let mut catalogue = IntentCatalogue::new();
        catalogue.register(template).unwrap();
        IntentMatcher::new(Arc::new(catalogue)).parse(text).unwrap()
    }

    fn executor() -> IntentExecutor {
        IntentExecutor::new(Arc::new(RecordingAutomation::new()))
    }

    fn echo() -> Arc<dyn IntentHandler> {
        Arc::new(SyncHandler::new("echo", |_automation, params: &IntentParams| {
            let raw = params
                .get(RAW_MESSAGE_KEY)
                .map(|value| value.to_string())
                .unwrap_or_default();
            Ok(ExecutionResult::ok(raw))
        }))
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let template = IntentTemplate::new("orphan", IntentCategory::Utility).with_pattern("orphan");
        let result = executor().execute(&parse_with(template, "orphan")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No handler registered for intent: orphan"));
    }

    #[tokio::test]
    async fn test_missing_required_parameter_names_it() {
        let template = IntentTemplate::new("send", IntentCategory::Communication)
            .with_parameter(ParameterSpec::new("recipient", ParamKind::String).required())
            .with_parameter(ParameterSpec::new("body", ParamKind::String).required())
            .with_pattern(r"send (?P<body>\w+)(?: to (?P<recipient>\w+))?")
            .with_handler("echo", echo());
        let result = executor().execute(&parse_with(template, "send hello")).await;
        assert!(!result.success);
        assert!(result.message.contains("recipient"));
        assert_eq!(result.message, "Required parameter 'recipient' is missing");
    }

    #[tokio::test]
    async fn test_validation_errors_are_joined() {
        let template = IntentTemplate::new("press", IntentCategory::Automation)
            .with_parameter(
                ParameterSpec::new("button", ParamKind::String)
                    .with_validation("^(left|right)$")
                    .unwrap(),
            )
            .with_parameter(ParameterSpec::new("target", ParamKind::String).required())
            .with_pattern(r"press (?P<button>\w+)")
            .with_handler("echo", echo());
        let result = executor().execute(&parse_with(template, "press sideways")).await;
        assert_eq!(
            result.error.as_deref(),
            Some("Parameter 'button' doesn't match required pattern; Required parameter 'target' is missing")
        );
    }

    #[tokio::test]
    async fn test_handler_sees_raw_message() {
        let template = IntentTemplate::new("say", IntentCategory::Utility)
            .with_pattern("say")
            .with_handler("echo", echo());
        let result = executor().execute(&parse_with(template, "please say it")).await;
        assert!(result.success);
        assert_eq!(result.message, "please say it");
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_are_contained() {
        let failing: Arc<dyn IntentHandler> = Arc::new(SyncHandler::new("fail", |_automation, _params| {
            Err(HandlerError::Failed("disk on fire".to_string()))
        }));
        let template = IntentTemplate::new("fail", IntentCategory::Utility)
            .with_pattern("fail")
            .with_handler("fail", failing);
        let result = executor().execute(&parse_with(template, "fail")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("disk on fire"));

        let panicking: Arc<dyn IntentHandler> = Arc::new(SyncHandler::new("boom", |_automation, _params| {
            panic!("kaboom")
        }));
        let template = IntentTemplate::new("boom", IntentCategory::Utility)
            .with_pattern("boom")
            .with_handler("boom", panicking);
        let result = executor().execute(&parse_with(template, "boom")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_builtin_click_runs_against_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::with_builtins(crate::core::handlers::testing::settings(dir.path()));
        let catalogue = Arc::new(IntentCatalogue::builtin(&registry).unwrap());
        let parsed = IntentMatcher::new(catalogue).parse("click at 500,300").unwrap();

        let automation = Arc::new(RecordingAutomation::new());
        let result = IntentExecutor::new(automation.clone()).execute(&parsed).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.message, "Clicked at (500, 300) with left button");
        assert_eq!(automation.actions().len(), 1);
    }
}

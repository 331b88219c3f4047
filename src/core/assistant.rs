//! One utterance in, one reply out: routes code requests to the sandbox and
//! everything else through match, threshold, confirmation and dispatch, then
//! journals the outcome.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::automation::Automation;
use crate::core::catalogue::IntentCatalogue;
use crate::core::executor::IntentExecutor;
use crate::core::intent::{ExecutionResult, ParsedIntent};
use crate::core::journal::{EntryKind, Journal, JournalEntry};
use crate::core::matcher::IntentMatcher;
use crate::core::sandbox::{CodeExecutor, ExecutionMode, SandboxExecutionResult};

const CODE_MARKERS: &[&str] = &["run this code", "execute", "python code", "```"];
const CODE_PREFIXES: &[&str] = &["run this code:", "execute:", "run:", "python:"];

pub const NOT_UNDERSTOOD: &str =
    "I couldn't understand that request. Try being more specific, like 'take a screenshot' or 'open calculator'.";
pub const NO_CODE: &str =
    "No code found to execute. Put Python code in a ``` block or after 'run this code:'";
pub const CODE_DISABLED: &str = "Code execution is disabled";
pub const DECLINED: &str = "Cancelled by user";

/// True when `message` asks for code to be run.
pub fn is_code_request(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CODE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// The snippet inside the first ``` fence (an optional `python` tag is
/// dropped), else whatever follows a known prefix, else the whole message.
/// Common indentation is removed. `None` when nothing is left.
pub fn extract_code(message: &str) -> Option<String> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?s)```(?:python)?[ \t]*\r?\n?(.*?)```").ok());

    let body = match fence.as_ref().and_then(|re| re.captures(message)) {
        Some(captures) => captures.get(1).map_or("", |m| m.as_str()).to_string(),
        None => {
            let trimmed = message.trim_start();
            let lowered = trimmed.to_lowercase();
            CODE_PREFIXES
                .iter()
                .find(|prefix| lowered.starts_with(*prefix))
                .map_or(trimmed, |prefix| &trimmed[prefix.len()..])
                .to_string()
        }
    };

    let code = dedent(&body);
    (!code.is_empty()).then_some(code)
}

fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|line| !line.trim().is_empty());
    let end = lines.iter().rposition(|line| !line.trim().is_empty());
    let (Some(start), Some(end)) = (start, end) else {
        return String::new();
    };
    let lines = &lines[start..=end];

    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| line.get(indent..).unwrap_or("").trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// What `Assistant::handle` decided.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The intent ran (successfully or not).
    Executed {
        parsed: ParsedIntent,
        result: ExecutionResult,
    },
    /// The intent needs a yes/no first; pass it to `confirm` or `decline`.
    NeedsConfirmation(ParsedIntent),
    Code(SandboxExecutionResult),
    NoCode,
    CodeDisabled,
    /// Nothing matched above the threshold. Carries the best candidate, if any.
    NotUnderstood(Option<(String, f64)>),
    Declined(ParsedIntent),
}

impl Reply {
    pub fn success(&self) -> bool {
        match self {
            Reply::Executed { result, .. } => result.success,
            Reply::Code(result) => result.success,
            Reply::NeedsConfirmation(_) => true,
            _ => false,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Reply::Executed { parsed, result } if result.success => format!("{}: {}", parsed.name(), result.message),
            Reply::Executed { parsed, result } => format!("{} failed: {}", parsed.name(), result.message),
            Reply::NeedsConfirmation(parsed) => format!("'{}' needs confirmation before it runs", parsed.name()),
            Reply::Code(result) if result.success => "Code executed successfully".to_string(),
            Reply::Code(result) => result.error.clone().unwrap_or_else(|| "Code execution failed".to_string()),
            Reply::NoCode => NO_CODE.to_string(),
            Reply::CodeDisabled => CODE_DISABLED.to_string(),
            Reply::NotUnderstood(_) => NOT_UNDERSTOOD.to_string(),
            Reply::Declined(_) => DECLINED.to_string(),
        }
    }
}

pub struct Assistant {
    matcher: IntentMatcher,
    executor: IntentExecutor,
    sandbox: Option<CodeExecutor>,
    journal: Journal,
    threshold: f64,
}

impl Assistant {
    pub fn new(
        config: &Config,
        catalogue: Arc<IntentCatalogue>,
        automation: Arc<dyn Automation>,
        journal: Journal,
    ) -> Self {
        Self {
            matcher: IntentMatcher::new(catalogue),
            executor: IntentExecutor::new(automation),
            sandbox: config.enable_code_execution.then(|| CodeExecutor::new(config)),
            journal,
            threshold: config.confidence_threshold,
        }
    }

    pub fn matcher(&self) -> &IntentMatcher {
        &self.matcher
    }

    pub fn sandbox(&self) -> Option<&CodeExecutor> {
        self.sandbox.as_ref()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    pub async fn handle(&mut self, message: &str) -> Reply {
        let started = Instant::now();
        if is_code_request(message) {
            return self.handle_code(message, started).await;
        }

        let parsed = match self.matcher.parse(message) {
            Some(parsed) if parsed.confidence > self.threshold => parsed,
            other => {
                let best = other.map(|parsed| (parsed.name().to_string(), parsed.confidence));
                debug!(threshold = self.threshold, ?best, "below threshold");
                let mut entry = JournalEntry::new(EntryKind::Unrecognized, message, false, NOT_UNDERSTOOD);
                if let Some((name, confidence)) = &best {
                    entry = entry.with_intent(name, *confidence);
                }
                self.journal.record(entry);
                return Reply::NotUnderstood(best);
            }
        };

        if parsed.intent.requires_confirmation {
            info!(intent = parsed.name(), "awaiting confirmation");
            return Reply::NeedsConfirmation(parsed);
        }
        self.run_intent(parsed, started).await
    }

    /// Runs an intent previously returned as `NeedsConfirmation`.
    pub async fn confirm(&mut self, parsed: ParsedIntent) -> Reply {
        self.run_intent(parsed, Instant::now()).await
    }

    pub fn decline(&mut self, parsed: ParsedIntent) -> Reply {
        let entry = JournalEntry::new(EntryKind::Intent, &parsed.raw_text, false, DECLINED)
            .with_intent(parsed.name(), parsed.confidence);
        self.journal.record(entry);
        Reply::Declined(parsed)
    }

    /// Flushes the journal to disk.
    pub fn shutdown(&self) {
        if let Err(err) = self.journal.save() {
            warn!(error = %err, "journal save failed");
        }
    }

    async fn run_intent(&mut self, parsed: ParsedIntent, started: Instant) -> Reply {
        let result = self.executor.execute(&parsed).await;
        let entry = JournalEntry::new(EntryKind::Intent, &parsed.raw_text, result.success, &result.message)
            .with_intent(parsed.name(), parsed.confidence)
            .with_duration_ms(started.elapsed().as_millis() as u64);
        self.journal.record(entry);
        Reply::Executed { parsed, result }
    }

    async fn handle_code(&mut self, message: &str, started: Instant) -> Reply {
        let Some(sandbox) = &self.sandbox else {
            return Reply::CodeDisabled;
        };
        let Some(code) = extract_code(message) else {
            self.journal.record(JournalEntry::new(EntryKind::Code, message, false, NO_CODE));
            return Reply::NoCode;
        };

        let result = sandbox.execute(&code, ExecutionMode::Persistent).await;
        let summary = match (&result.error, result.success) {
            (Some(error), false) => error.clone(),
            _ => result.output.trim_end().to_string(),
        };
        let entry = JournalEntry::new(EntryKind::Code, message, result.success, &summary)
            .with_duration_ms(started.elapsed().as_millis() as u64);
        self.journal.record(entry);
        Reply::Code(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::automation::RecordingAutomation;
    use crate::core::handlers::{IntentHandler, SyncHandler};
    use crate::core::intent::{IntentCategory, IntentTemplate};
    use crate::core::params::{IntentParams, ParamKind, ParameterSpec};
    use std::time::Duration;

    fn echo() -> Arc<dyn IntentHandler> {
        Arc::new(SyncHandler::new("echo", |_automation, params: &IntentParams| {
            let target = params.get("target").map(|v| v.to_string()).unwrap_or_default();
            Ok(ExecutionResult::ok(format!("did {}", target)))
        }))
    }

    fn assistant() -> Assistant {
        let mut catalogue = IntentCatalogue::new();
        catalogue
            .register(
                IntentTemplate::new("open_thing", IntentCategory::Application)
                    .with_parameter(ParameterSpec::new("target", ParamKind::String).required())
                    .with_pattern(r"^open (?P<target>\w+)$")
                    .with_handler("echo", echo()),
            )
            .unwrap();
        catalogue
            .register(
                IntentTemplate::new("wipe", IntentCategory::FileSystem)
                    .with_parameter(ParameterSpec::new("target", ParamKind::String).required())
                    .with_pattern(r"^wipe (?P<target>\w+)$")
                    .with_handler("echo", echo())
                    .requiring_confirmation(),
            )
            .unwrap();
        let config = Config {
            sandbox_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        Assistant::new(
            &config,
            Arc::new(catalogue),
            Arc::new(RecordingAutomation::new()),
            Journal::in_memory(),
        )
    }

    #[test]
    fn test_code_request_detection() {
        assert!(is_code_request("Run this code: print(1)"));
        assert!(is_code_request("```\nx = 1\n```"));
        assert!(is_code_request("please EXECUTE: x = 1"));
        assert!(!is_code_request("open calculator"));
    }

    #[test]
    fn test_extract_code_from_fence() {
        let message = "run this code:\n```python\n    x = 1\n    if x:\n        print(x)\n```\nthanks";
        assert_eq!(extract_code(message).as_deref(), Some("x = 1\nif x:\n    print(x)"));
    }

    #[test]
    fn test_extract_code_after_prefix() {
        assert_eq!(extract_code("Execute: print('hi')").as_deref(), Some("print('hi')"));
        assert_eq!(extract_code("run this code:   ").as_deref(), None);
        assert_eq!(extract_code("```python\n```"), None);
    }

    #[tokio::test]
    async fn test_code_runs_in_persistent_session() {
        let mut assistant = assistant();
        let first = assistant.handle("run this code: x = 21").await;
        assert!(first.success());
        let reply = assistant.handle("```python\nprint(x * 2)\n```").await;
        match reply {
            Reply::Code(result) => assert_eq!(result.output, "42\n"),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(assistant.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_code_request() {
        let mut assistant = assistant();
        let reply = assistant.handle("run this code:").await;
        assert!(matches!(reply, Reply::NoCode));
        assert!(!reply.success());
    }

    #[tokio::test]
    async fn test_intent_is_executed_and_journalled() {
        let mut assistant = assistant();
        let reply = assistant.handle("open calculator").await;
        assert!(reply.success());
        assert_eq!(reply.message(), "open_thing: did calculator");
        let entry = &assistant.journal().last_n(1)[0];
        assert_eq!(entry.intent.as_deref(), Some("open_thing"));
        assert!(entry.success);
    }

    #[tokio::test]
    async fn test_unmatched_message_is_not_understood() {
        let mut assistant = assistant();
        let reply = assistant.handle("what's the weather").await;
        assert!(matches!(reply, Reply::NotUnderstood(None)));
        assert_eq!(assistant.journal().last_n(1)[0].kind, EntryKind::Unrecognized);
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let mut assistant = assistant();
        let confidence = assistant.matcher().parse("open calculator").map(|p| p.confidence).unwrap();
        assistant.threshold = confidence;
        let reply = assistant.handle("open calculator").await;
        assert!(matches!(reply, Reply::NotUnderstood(Some((ref name, _))) if name == "open_thing"));
    }

    #[tokio::test]
    async fn test_confirmation_flow() {
        let mut assistant = assistant();
        let Reply::NeedsConfirmation(parsed) = assistant.handle("wipe downloads").await else {
            panic!("expected a confirmation request");
        };
        assert!(assistant.journal().is_empty());

        let declined = assistant.decline(parsed.clone());
        assert_eq!(declined.message(), DECLINED);

        let reply = assistant.confirm(parsed).await;
        assert_eq!(reply.message(), "wipe: did downloads");
        assert_eq!(assistant.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_code_disabled() {
        let config = Config {
            enable_code_execution: false,
            ..Config::default()
        };
        let mut assistant = Assistant::new(
            &config,
            Arc::new(IntentCatalogue::new()),
            Arc::new(RecordingAutomation::new()),
            Journal::in_memory(),
        );
        assert!(matches!(assistant.handle("run this code: x = 1").await, Reply::CodeDisabled));
    }
}

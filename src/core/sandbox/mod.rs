//! Restricted execution of user-supplied Python-subset snippets.
//!
//! A run goes through four phases: parse and validate the syntax tree
//! against the deny-lists, build a restricted namespace, evaluate on a
//! dedicated worker thread under a wall-clock timeout, then collect
//! printed output and the JSON-representable top-level variables.
//! Isolated mode skips all of that and hands the snippet to an external
//! interpreter process instead.

pub mod ast;
mod builtins;
pub mod format;
mod interp;
mod isolated;
pub mod lexer;
mod modules;
pub mod ops;
pub mod parser;
pub mod validator;
pub mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as Json;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use interp::{export, Interpreter};
use value::{Exception, SessionValue, Value};

pub use builtins::BUILTIN_FUNCTIONS;
pub use interp::MAX_CALL_DEPTH;

/// Deeply nested user code recurses through the evaluator; the worker
/// thread gets a stack large enough for `MAX_CALL_DEPTH` frames.
const WORKER_STACK_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Safe,
    Isolated,
    Persistent,
}

impl FromStr for ExecutionMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" => Ok(ExecutionMode::Safe),
            "isolated" => Ok(ExecutionMode::Isolated),
            "persistent" => Ok(ExecutionMode::Persistent),
            _ => Err(SandboxError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Safe => "safe",
            ExecutionMode::Isolated => "isolated",
            ExecutionMode::Persistent => "persistent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Syntax error: {message} (line {line})")]
    Syntax { message: String, line: usize },

    #[error("Code validation failed: {}", .0.join("; "))]
    Violations(Vec<String>),

    /// An exception escaped the snippet. `output` is whatever it printed first.
    #[error("{message}")]
    Runtime {
        message: String,
        traceback: String,
        output: String,
    },

    #[error("Execution timed out")]
    Timeout,

    #[error("Execution timed out in isolated mode")]
    IsolatedTimeout,

    #[error("Isolated execution failed: {0}")]
    Isolated(String),

    #[error("Failed to start sandbox worker: {0}")]
    Worker(#[source] std::io::Error),

    #[error("Sandbox worker stopped unexpectedly")]
    WorkerLost,

    #[error("Unknown execution mode: {0}")]
    UnknownMode(String),
}

/// Everything a run reports back. Serialises to the JSON shape the
/// assistant and the CLI print.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SandboxExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Wall-clock seconds.
    pub execution_time: f64,
    pub variables: BTreeMap<String, Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_variables: Option<BTreeMap<String, Json>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl SandboxExecutionResult {
    fn failed(err: SandboxError) -> Self {
        let mut result = SandboxExecutionResult {
            timed_out: matches!(err, SandboxError::Timeout | SandboxError::IsolatedTimeout),
            ..Default::default()
        };
        if let SandboxError::Runtime { traceback, output, .. } = &err {
            result.traceback = Some(traceback.clone());
            result.output = output.clone();
        }
        result.error = Some(err.to_string());
        result
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub variables: BTreeMap<String, Json>,
    pub variable_count: usize,
    pub allowed_modules: Vec<String>,
    /// Seconds.
    pub timeout: f64,
}

struct SafeRun {
    output: String,
    variables: BTreeMap<String, Json>,
    return_value: Option<Json>,
    /// Typed variables to merge back, filled for persistent runs only.
    session: BTreeMap<String, SessionValue>,
}

pub struct CodeExecutor {
    allowed_modules: Vec<String>,
    timeout: Duration,
    interpreter: Vec<String>,
    session: Mutex<BTreeMap<String, SessionValue>>,
}

impl CodeExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            allowed_modules: config.allowed_modules.clone(),
            timeout: config.sandbox_timeout,
            interpreter: config.isolated_interpreter.clone(),
            session: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `code` in `mode`. Never fails: every error is folded into the
    /// returned result.
    pub async fn execute(&self, code: &str, mode: ExecutionMode) -> SandboxExecutionResult {
        let started = Instant::now();
        debug!(%mode, bytes = code.len(), "sandbox run starting");

        let mut result = match mode {
            ExecutionMode::Safe => self.finish_safe(self.run_safe(code, None).await).0,
            ExecutionMode::Persistent => self.run_persistent(code).await,
            ExecutionMode::Isolated => self.run_isolated(code).await,
        };
        result.execution_time = started.elapsed().as_secs_f64();

        info!(
            %mode,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "code execution completed"
        );
        result
    }

    /// Same as `execute` with the mode given by name. An unknown name is
    /// reported as a failed result.
    pub async fn execute_named(&self, code: &str, mode: &str) -> SandboxExecutionResult {
        match mode.parse::<ExecutionMode>() {
            Ok(mode) => self.execute(code, mode).await,
            Err(err) => SandboxExecutionResult::failed(err),
        }
    }

    /// Parses and checks `code` without running it.
    pub async fn validate_code(&self, code: &str) -> Result<(), SandboxError> {
        let code = code.to_string();
        self.on_worker(move |_| check(&code).map(|_| ())).await
    }

    pub async fn clear_session(&self) {
        self.session.lock().await.clear();
        debug!("sandbox session cleared");
    }

    pub async fn session_info(&self) -> SessionInfo {
        let variables = exported(&*self.session.lock().await);
        SessionInfo {
            variable_count: variables.len(),
            variables,
            allowed_modules: self.allowed_modules.clone(),
            timeout: self.timeout.as_secs_f64(),
        }
    }

    /// A `seed` marks a persistent run: globals start from it and the typed
    /// variables come back for merging.
    async fn run_safe(
        &self,
        code: &str,
        seed: Option<BTreeMap<String, SessionValue>>,
    ) -> Result<SafeRun, SandboxError> {
        let code = code.to_string();
        let allowed = self.allowed_modules.clone();
        self.on_worker(move |cancel| evaluate(&code, seed.as_ref(), allowed, cancel)).await
    }

    fn finish_safe(&self, run: Result<SafeRun, SandboxError>) -> (SandboxExecutionResult, BTreeMap<String, SessionValue>) {
        match run {
            Ok(run) => (
                SandboxExecutionResult {
                    success: true,
                    output: run.output,
                    variables: run.variables,
                    return_value: run.return_value,
                    ..Default::default()
                },
                run.session,
            ),
            Err(err) => {
                debug!(error = %err, "sandbox run failed");
                (SandboxExecutionResult::failed(err), BTreeMap::new())
            }
        }
    }

    async fn run_persistent(&self, code: &str) -> SandboxExecutionResult {
        // Held across the run so concurrent persistent runs see each other's
        // merges in order.
        let mut session = self.session.lock().await;
        let run = self.run_safe(code, Some(session.clone())).await;
        let (mut result, updates) = self.finish_safe(run);
        if result.success {
            session.extend(updates);
            result.session_variables = Some(exported(&session));
            debug!(variables = session.len(), "session updated");
        }
        result
    }

    async fn run_isolated(&self, code: &str) -> SandboxExecutionResult {
        match isolated::run(code, &self.interpreter, self.timeout).await {
            Ok(process) => SandboxExecutionResult {
                success: process.success,
                output: process.stdout,
                error: (!process.stderr.is_empty()).then_some(process.stderr),
                return_code: process.code,
                ..Default::default()
            },
            Err(err) => SandboxExecutionResult::failed(err),
        }
    }

    /// Runs `job` on a fresh big-stack thread and waits up to the timeout.
    /// On timeout the cancellation flag is raised and the thread winds down
    /// on its own at its next check.
    async fn on_worker<T, F>(&self, job: F) -> Result<T, SandboxError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<AtomicBool>) -> Result<T, SandboxError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        thread::Builder::new()
            .name("sandbox".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let _ = tx.send(job(flag));
            })
            .map_err(SandboxError::Worker)?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::WorkerLost),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(timeout_ms = self.timeout.as_millis() as u64, "sandbox run timed out; cancelling");
                Err(SandboxError::Timeout)
            }
        }
    }
}

fn check(code: &str) -> Result<ast::Program, SandboxError> {
    let program = parser::parse(code).map_err(|err| SandboxError::Syntax {
        message: err.message,
        line: err.line,
    })?;
    let found = validator::violations(&program);
    if !found.is_empty() {
        return Err(SandboxError::Violations(found));
    }
    Ok(program)
}

fn evaluate(
    code: &str,
    seed: Option<&BTreeMap<String, SessionValue>>,
    allowed: Vec<String>,
    cancel: Arc<AtomicBool>,
) -> Result<SafeRun, SandboxError> {
    let program = check(code)?;
    let mut interpreter = Interpreter::new(allowed, cancel);
    if let Some(seed) = seed {
        interpreter.seed(seed);
    }
    match interpreter.run(&program) {
        Ok(last) => Ok(SafeRun {
            output: interpreter.output().to_string(),
            variables: interpreter.variables(),
            return_value: last.filter(|value| !matches!(value, Value::None)).map(|value| export(&value)),
            session: match seed {
                Some(_) => interpreter.session_values(),
                None => BTreeMap::new(),
            },
        }),
        Err(exc) => Err(SandboxError::Runtime {
            message: exc.to_string(),
            traceback: traceback(&exc),
            output: interpreter.output().to_string(),
        }),
    }
}

fn exported(session: &BTreeMap<String, SessionValue>) -> BTreeMap<String, Json> {
    session
        .iter()
        .map(|(name, value)| (name.clone(), export(&value.to_value())))
        .collect()
}

fn traceback(exc: &Exception) -> String {
    let mut text = String::from("Traceback (most recent call last):\n");
    match exc.line {
        Some(line) => text.push_str(&format!("  File \"<sandbox>\", line {line}, in <module>\n")),
        None => text.push_str("  File \"<sandbox>\", in <module>\n"),
    }
    text.push_str(&exc.to_string());
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(timeout: Duration) -> CodeExecutor {
        let config = Config {
            allowed_modules: ["math", "json", "random", "re", "datetime", "os", "sys"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            sandbox_timeout: timeout,
            isolated_interpreter: vec!["sh".to_string()],
            ..Config::default()
        };
        CodeExecutor::new(&config)
    }

    #[tokio::test]
    async fn test_prohibited_import_is_rejected_before_running() {
        let sandbox = executor(Duration::from_secs(5));
        let result = sandbox.execute("print('side effect')\nimport os\n", ExecutionMode::Safe).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Code validation failed: Prohibited import: os"));
        assert_eq!(result.output, "");
    }

    #[tokio::test]
    async fn test_safe_run_collects_output_and_variables() {
        let sandbox = executor(Duration::from_secs(5));
        let code = "numbers = [1, 2, 3, 4]\ntotal = sum(n * n for n in numbers)\nprint(f\"Result: {total}\")\n";
        let result = sandbox.execute(code, ExecutionMode::Safe).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, "Result: 30\n");
        assert_eq!(result.variables["total"], serde_json::json!(30));
        assert_eq!(result.variables["numbers"], serde_json::json!([1, 2, 3, 4]));
        assert!(result.error.is_none());
        assert!(result.execution_time >= 0.0);
    }

    #[tokio::test]
    async fn test_safe_runs_do_not_share_state() {
        let sandbox = executor(Duration::from_secs(5));
        sandbox.execute("x = 1", ExecutionMode::Safe).await;
        let result = sandbox.execute("print(x)", ExecutionMode::Safe).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("NameError: name 'x' is not defined"));
    }

    #[tokio::test]
    async fn test_persistent_session_carries_variables() {
        let sandbox = executor(Duration::from_secs(5));
        let first = sandbox.execute("x = 42", ExecutionMode::Persistent).await;
        assert!(first.success);
        assert_eq!(first.session_variables.as_ref().map(|s| s.len()), Some(1));

        let second = sandbox.execute("y = x * 2\nprint(y)", ExecutionMode::Persistent).await;
        assert!(second.success, "{:?}", second.error);
        assert_eq!(second.output, "84\n");

        let info = sandbox.session_info().await;
        assert_eq!(info.variable_count, 2);
        assert_eq!(info.variables["y"], serde_json::json!(84));

        sandbox.clear_session().await;
        assert_eq!(sandbox.session_info().await.variable_count, 0);
    }

    #[tokio::test]
    async fn test_persistent_session_keeps_python_types() {
        let sandbox = executor(Duration::from_secs(5));
        let first = sandbox
            .execute("d = {1: 'a'}\nt = (1, 2)\nprint = 3\nlen = 4", ExecutionMode::Persistent)
            .await;
        assert!(first.success, "{:?}", first.error);
        assert!(first.variables.keys().all(|name| name == "d" || name == "t"));

        let second = sandbox
            .execute("print(d[1], type(t).__name__, len(t))", ExecutionMode::Persistent)
            .await;
        assert!(second.success, "{:?}", second.error);
        assert_eq!(second.output, "a tuple 2\n");

        let info = sandbox.session_info().await;
        assert_eq!(info.variable_count, 2);
        assert_eq!(info.variables["d"], serde_json::json!({"1": "a"}));
        assert_eq!(info.variables["t"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_failed_persistent_run_leaves_session_alone() {
        let sandbox = executor(Duration::from_secs(5));
        sandbox.execute("x = 1", ExecutionMode::Persistent).await;
        let result = sandbox.execute("x = 2\nz = 1 / 0", ExecutionMode::Persistent).await;
        assert!(!result.success);
        assert!(result.session_variables.is_none());
        assert_eq!(sandbox.session_info().await.variables["x"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let sandbox = executor(Duration::from_millis(200));
        let started = Instant::now();
        let result = sandbox.execute("while True:\n    pass\n", ExecutionMode::Safe).await;
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.error.as_deref(), Some("Execution timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_runtime_error_keeps_output_and_traceback() {
        let sandbox = executor(Duration::from_secs(5));
        let result = sandbox.execute("print('before')\nvalue = 1 / 0\n", ExecutionMode::Safe).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("ZeroDivisionError: division by zero"));
        assert_eq!(result.output, "before\n");
        let traceback = result.traceback.unwrap_or_default();
        assert!(traceback.contains("line 2"), "{traceback}");
        assert!(traceback.ends_with("ZeroDivisionError: division by zero\n"));
    }

    #[tokio::test]
    async fn test_syntax_error_reports_line() {
        let sandbox = executor(Duration::from_secs(5));
        let result = sandbox.execute("x = 1\nif x\n    pass\n", ExecutionMode::Safe).await;
        assert!(!result.success);
        let error = result.error.unwrap_or_default();
        assert!(error.starts_with("Syntax error:"), "{error}");
        assert!(error.ends_with("(line 2)"), "{error}");
    }

    #[tokio::test]
    async fn test_trailing_expression_becomes_return_value() {
        let sandbox = executor(Duration::from_secs(5));
        let result = sandbox.execute("def double(n):\n    return n * 2\ndouble(21)\n", ExecutionMode::Safe).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.return_value, Some(serde_json::json!(42)));
        assert!(!result.variables.contains_key("double"));

        let none = sandbox.execute("print('x')", ExecutionMode::Safe).await;
        assert!(none.return_value.is_none());
    }

    #[tokio::test]
    async fn test_validate_code_without_running() {
        let sandbox = executor(Duration::from_secs(5));
        assert!(sandbox.validate_code("x = [i for i in range(3)]").await.is_ok());
        let err = sandbox.validate_code("eval('1')").await.unwrap_err();
        assert!(matches!(err, SandboxError::Violations(ref found) if found.len() == 1));
        let err = sandbox.validate_code("def (:").await.unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_unknown_mode_is_reported() {
        let sandbox = executor(Duration::from_secs(5));
        let result = sandbox.execute_named("print(1)", "fast").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown execution mode: fast"));
        assert_eq!("Persistent".parse::<ExecutionMode>().ok(), Some(ExecutionMode::Persistent));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_isolated_mode_runs_a_child_process() {
        let sandbox = executor(Duration::from_secs(5));
        let ok = sandbox.execute("echo hello", ExecutionMode::Isolated).await;
        assert!(ok.success);
        assert_eq!(ok.output, "hello\n");
        assert_eq!(ok.return_code, Some(0));
        assert!(ok.error.is_none());

        let failed = sandbox.execute("echo oops >&2\nexit 3", ExecutionMode::Isolated).await;
        assert!(!failed.success);
        assert_eq!(failed.return_code, Some(3));
        assert_eq!(failed.error.as_deref(), Some("oops\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_isolated_mode_kills_on_timeout() {
        let sandbox = executor(Duration::from_millis(200));
        let result = sandbox.execute("sleep 5", ExecutionMode::Isolated).await;
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.error.as_deref(), Some("Execution timed out in isolated mode"));
    }

    #[test]
    fn test_result_serialises_with_expected_keys() {
        let result = SandboxExecutionResult {
            success: true,
            output: "hi\n".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], serde_json::json!(true));
        assert!(json.get("variables").is_some());
        assert!(json.get("return_value").is_none());
        assert!(json.get("timed_out").is_none());
    }
}

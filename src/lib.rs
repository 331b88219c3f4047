//! Desktop assistant core: pattern-based intent recognition and dispatch,
//! plus a restricted sandbox for small Python-subset snippets.

pub mod config;
pub mod core;

pub use crate::config::Config;
pub use crate::core::assistant::{Assistant, Reply};
pub use crate::core::catalogue::IntentCatalogue;
pub use crate::core::executor::IntentExecutor;
pub use crate::core::intent::{ExecutionResult, IntentTemplate, ParsedIntent};
pub use crate::core::matcher::IntentMatcher;
pub use crate::core::sandbox::{CodeExecutor, ExecutionMode, SandboxExecutionResult};

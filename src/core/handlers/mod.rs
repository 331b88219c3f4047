//! Intent handlers and the registry that binds them to catalogue entries.

mod apps;
mod builtin;
mod desktop;
mod files;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::core::automation::{Automation, AutomationError};
use crate::core::intent::ExecutionResult;
use crate::core::params::IntentParams;

pub use builtin::{BuiltinHandler, HandlerKind};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Automation(#[from] AutomationError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HandlerError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        HandlerError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Executable logic bound to an intent.
#[async_trait]
pub trait IntentHandler: Send + Sync + fmt::Debug {
    async fn invoke(
        &self,
        automation: &dyn Automation,
        params: &IntentParams,
    ) -> Result<ExecutionResult, HandlerError>;
}

/// Adapts a plain function so it can sit in the registry next to async
/// handlers.
pub struct SyncHandler<F> {
    label: &'static str,
    func: F,
}

impl<F> SyncHandler<F>
where
    F: Fn(&dyn Automation, &IntentParams) -> Result<ExecutionResult, HandlerError> + Send + Sync,
{
    pub fn new(label: &'static str, func: F) -> Self {
        Self { label, func }
    }
}

impl<F> fmt::Debug for SyncHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncHandler({})", self.label)
    }
}

#[async_trait]
impl<F> IntentHandler for SyncHandler<F>
where
    F: Fn(&dyn Automation, &IntentParams) -> Result<ExecutionResult, HandlerError> + Send + Sync,
{
    async fn invoke(
        &self,
        automation: &dyn Automation,
        params: &IntentParams,
    ) -> Result<ExecutionResult, HandlerError> {
        (self.func)(automation, params)
    }
}

/// Capability registry: handler name to handler.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn IntentHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one built-in handler per `HandlerKind`.
    pub fn with_builtins(settings: HandlerSettings) -> Self {
        let settings = Arc::new(settings);
        let mut registry = Self::new();
        for kind in HandlerKind::ALL {
            registry.register(kind.name(), Arc::new(BuiltinHandler::new(kind, settings.clone())));
        }
        registry
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn IntentHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IntentHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Well-known user directories. Injected so handlers can be pointed at a
/// scratch tree in tests.
#[derive(Debug, Clone)]
pub struct UserDirs {
    pub home: PathBuf,
    pub desktop: PathBuf,
    pub documents: PathBuf,
    pub downloads: PathBuf,
    pub cwd: PathBuf,
}

impl UserDirs {
    pub fn detect() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            desktop: dirs::desktop_dir().unwrap_or_else(|| home.join("Desktop")),
            documents: dirs::document_dir().unwrap_or_else(|| home.join("Documents")),
            downloads: dirs::download_dir().unwrap_or_else(|| home.join("Downloads")),
            cwd: std::env::current_dir().unwrap_or_else(|_| home.clone()),
            home,
        }
    }

    pub fn rooted(base: &std::path::Path) -> Self {
        Self {
            home: base.to_path_buf(),
            desktop: base.join("Desktop"),
            documents: base.join("Documents"),
            downloads: base.join("Downloads"),
            cwd: base.join("work"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Pause between UI steps so the target window can catch up.
    pub settle_delay: Duration,
    pub dirs: UserDirs,
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle_delay: config.ui_settle_delay,
            dirs: UserDirs::detect(),
        }
    }

    pub async fn settle(&self, factor: u32) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay * factor).await;
        }
    }
}

/// Non-blank string parameter.
pub(crate) fn param_str<'a>(params: &'a IntentParams, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn require_str<'a>(params: &'a IntentParams, name: &str) -> Result<&'a str, HandlerError> {
    param_str(params, name).ok_or_else(|| HandlerError::invalid(name, "missing or empty"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::params::ParamValue;

    pub fn settings(base: &std::path::Path) -> HandlerSettings {
        let dirs = UserDirs::rooted(base);
        for dir in [&dirs.desktop, &dirs.documents, &dirs.downloads, &dirs.cwd] {
            std::fs::create_dir_all(dir).unwrap();
        }
        HandlerSettings {
            settle_delay: Duration::ZERO,
            dirs,
        }
    }

    pub fn params(pairs: &[(&str, ParamValue)]) -> IntentParams {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::automation::RecordingAutomation;

    #[tokio::test]
    async fn test_sync_handler_runs_through_trait() {
        let handler = SyncHandler::new("echo", |_automation, params| {
            let text = require_str(params, "text")?;
            Ok(ExecutionResult::ok(text.to_uppercase()))
        });
        let automation = RecordingAutomation::new();
        let params = testing::params(&[("text", "hi".into())]);
        let result = handler.invoke(&automation, &params).await.unwrap();
        assert_eq!(result.message, "HI");

        let err = handler.invoke(&automation, &IntentParams::new()).await.unwrap_err();
        assert!(err.to_string().contains("'text'"));
    }

    #[test]
    fn test_registry_with_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::with_builtins(testing::settings(dir.path()));
        assert_eq!(registry.names().len(), HandlerKind::ALL.len());
        assert!(registry.get("click_coordinates").is_some());
        assert!(registry.get("launch_rockets").is_none());
    }
}

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::handlers::IntentHandler;
use crate::core::params::{IntentParams, ParameterSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Automation,
    FileSystem,
    SystemInfo,
    Application,
    Communication,
    CodeExecution,
    Media,
    Utility,
}

impl IntentCategory {
    pub fn name(&self) -> &'static str {
        match self {
            IntentCategory::Automation => "automation",
            IntentCategory::FileSystem => "file_system",
            IntentCategory::SystemInfo => "system_info",
            IntentCategory::Application => "application",
            IntentCategory::Communication => "communication",
            IntentCategory::CodeExecution => "code_execution",
            IntentCategory::Media => "media",
            IntentCategory::Utility => "utility",
        }
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registered definition of an intent. Immutable once handed to the
/// catalogue; the catalogue owns the compiled patterns.
#[derive(Clone)]
pub struct IntentTemplate {
    pub name: String,
    pub category: IntentCategory,
    pub description: String,
    pub parameters: IndexMap<String, ParameterSpec>,
    pub patterns: Vec<String>,
    pub examples: Vec<String>,
    pub requires_confirmation: bool,
    /// Capability name the handler was looked up under.
    pub handler_name: Option<String>,
    pub handler: Option<Arc<dyn IntentHandler>>,
}

impl IntentTemplate {
    pub fn new(name: &str, category: IntentCategory) -> Self {
        Self {
            name: name.to_string(),
            category,
            description: String::new(),
            parameters: IndexMap::new(),
            patterns: Vec::new(),
            examples: Vec::new(),
            requires_confirmation: false,
            handler_name: None,
            handler: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.insert(spec.name.clone(), spec);
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_string());
        self
    }

    pub fn with_example(mut self, example: &str) -> Self {
        self.examples.push(example.to_string());
        self
    }

    pub fn with_handler(mut self, name: &str, handler: Arc<dyn IntentHandler>) -> Self {
        self.handler_name = Some(name.to_string());
        self.handler = Some(handler);
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.values().filter(|spec| spec.required)
    }
}

impl fmt::Debug for IntentTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntentTemplate")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .field("patterns", &self.patterns.len())
            .field("requires_confirmation", &self.requires_confirmation)
            .field("handler", &self.handler_name)
            .finish()
    }
}

/// Best match for one utterance.
#[derive(Debug, Clone)]
pub struct ParsedIntent {
    pub intent: Arc<IntentTemplate>,
    pub extracted_params: IntentParams,
    pub confidence: f64,
    pub raw_text: String,
    pub matched_text: String,
    pub pattern_index: usize,
}

impl ParsedIntent {
    pub fn name(&self) -> &str {
        &self.intent.name
    }

    pub fn to_json(&self) -> serde_json::Value {
        let params: serde_json::Map<String, serde_json::Value> = self
            .extracted_params
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        serde_json::json!({
            "intent": self.intent.name,
            "category": self.intent.category,
            "confidence": self.confidence,
            "extracted_params": params,
            "raw_text": self.raw_text,
            "matched_text": self.matched_text,
            "pattern_index": self.pattern_index,
            "requires_confirmation": self.intent.requires_confirmation,
        })
    }
}

/// Uniform outcome of a handler or of the executor itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    /// A failure always carries a non-empty error, mirrored into `message`.
    pub fn failure(error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "Unknown error".to_string();
        }
        Self {
            success: false,
            message: error.clone(),
            data: None,
            error: Some(error),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Fills in a missing error on a failed result.
    pub(crate) fn normalized(mut self) -> Self {
        if !self.success {
            let has_error = self.error.as_deref().map_or(false, |e| !e.trim().is_empty());
            if !has_error {
                let fallback = if self.message.trim().is_empty() {
                    "Handler reported failure without a reason".to_string()
                } else {
                    self.message.clone()
                };
                self.error = Some(fallback.clone());
                if self.message.trim().is_empty() {
                    self.message = fallback;
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::ParamKind;

    #[test]
    fn test_template_builder() {
        let template = IntentTemplate::new("greet", IntentCategory::Utility)
            .with_description("Say hello")
            .with_parameter(ParameterSpec::new("name", ParamKind::String).required())
            .with_parameter(ParameterSpec::new("times", ParamKind::Int).with_default(1))
            .with_pattern(r"hello\s+(?P<name>\w+)")
            .with_example("hello bob");

        assert_eq!(template.parameters.len(), 2);
        assert_eq!(template.required_parameters().count(), 1);
        assert!(template.handler.is_none());
        assert_eq!(template.category.to_string(), "utility");
    }

    #[test]
    fn test_failure_always_has_error() {
        let result = ExecutionResult::failure("");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown error"));

        let silent = ExecutionResult {
            success: false,
            message: "Window not found".to_string(),
            data: None,
            error: None,
        }
        .normalized();
        assert_eq!(silent.error.as_deref(), Some("Window not found"));
    }
}

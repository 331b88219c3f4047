use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::handlers::HandlerRegistry;
use crate::core::intent::{IntentCategory, IntentTemplate};
use crate::core::params::{ParamKind, ParamValue, ParameterSpec};

/// Catalogue shipped with the binary.
pub const BUILTIN_INTENTS: &str = include_str!("../../assets/intents.toml");

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("Intent '{intent}' pattern #{index} does not compile: {source}")]
    PatternCompile {
        intent: String,
        index: usize,
        #[source]
        source: regex::Error,
    },
    #[error("Intent '{intent}' parameter '{parameter}' has an invalid validation pattern: {source}")]
    ValidationPattern {
        intent: String,
        parameter: String,
        #[source]
        source: regex::Error,
    },
    #[error("Intent '{0}' has no patterns")]
    NoPatterns(String),
    #[error("Invalid intent catalogue (TOML): {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid intent catalogue (JSON): {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to read intent catalogue {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Document form of the catalogue, shared by the TOML source and the JSON
/// export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogueSchema {
    pub intents: IndexMap<String, IntentSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentSchema {
    pub category: IntentCategory,
    #[serde(default)]
    pub description: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterSchema>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentSummary {
    pub name: String,
    pub category: IntentCategory,
    pub description: String,
    pub examples: Vec<String>,
    pub bound: bool,
}

struct CatalogueEntry {
    template: Arc<IntentTemplate>,
    matchers: Vec<Regex>,
}

/// Registry of intent templates and their compiled, case-insensitive
/// patterns. Iteration and scan order is registration order; re-registering
/// a name replaces the entry in place.
#[derive(Default)]
pub struct IntentCatalogue {
    entries: Vec<CatalogueEntry>,
    index: HashMap<String, usize>,
}

impl IntentCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: IntentTemplate) -> Result<(), CatalogueError> {
        if template.patterns.is_empty() {
            return Err(CatalogueError::NoPatterns(template.name.clone()));
        }

        let mut matchers = Vec::with_capacity(template.patterns.len());
        for (index, pattern) in template.patterns.iter().enumerate() {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| CatalogueError::PatternCompile {
                    intent: template.name.clone(),
                    index,
                    source,
                })?;
            for group in regex.capture_names().flatten() {
                if !template.parameters.contains_key(group) {
                    debug!(intent = %template.name, group, "capture group has no parameter; ignored");
                }
            }
            matchers.push(regex);
        }

        if template.handler.is_none() {
            warn!(intent = %template.name, "registered without a handler");
        }

        let name = template.name.clone();
        let entry = CatalogueEntry {
            template: Arc::new(template),
            matchers,
        };
        match self.index.get(&name) {
            Some(&position) => {
                debug!(intent = %name, "replacing existing template");
                self.entries[position] = entry;
            }
            None => {
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<IntentTemplate>> {
        self.index.get(name).map(|&i| &self.entries[i].template)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<IntentTemplate>> {
        self.entries.iter().map(|entry| &entry.template)
    }

    /// Templates with their compiled patterns, in scan order.
    pub(crate) fn compiled(&self) -> impl Iterator<Item = (&Arc<IntentTemplate>, &[Regex])> {
        self.entries
            .iter()
            .map(|entry| (&entry.template, entry.matchers.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The embedded catalogue bound against `registry`.
    pub fn builtin(registry: &HandlerRegistry) -> Result<Self, CatalogueError> {
        Self::from_toml_str(BUILTIN_INTENTS, registry)
    }

    pub fn from_toml_str(text: &str, registry: &HandlerRegistry) -> Result<Self, CatalogueError> {
        let schema: CatalogueSchema = toml::from_str(text)?;
        Self::from_schema(schema, registry)
    }

    pub fn from_schema_json(text: &str, registry: &HandlerRegistry) -> Result<Self, CatalogueError> {
        let schema: CatalogueSchema = serde_json::from_str(text)?;
        Self::from_schema(schema, registry)
    }

    /// Loads a `.json` schema export or a TOML catalogue, by extension.
    pub fn load_file(path: &Path, registry: &HandlerRegistry) -> Result<Self, CatalogueError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogueError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_schema_json(&text, registry)
        } else {
            Self::from_toml_str(&text, registry)
        }
    }

    pub fn from_schema(schema: CatalogueSchema, registry: &HandlerRegistry) -> Result<Self, CatalogueError> {
        let mut catalogue = Self::new();
        for (name, intent) in schema.intents {
            let template = build_template(&name, intent, registry)?;
            catalogue.register(template)?;
        }
        info!(intents = catalogue.len(), "intent catalogue loaded");
        Ok(catalogue)
    }

    pub fn schema(&self) -> CatalogueSchema {
        let intents = self
            .all()
            .map(|template| (template.name.clone(), schema_of(template)))
            .collect();
        CatalogueSchema { intents }
    }

    pub fn to_schema_json(&self) -> Result<String, CatalogueError> {
        Ok(serde_json::to_string_pretty(&self.schema())?)
    }

    /// Hex SHA-256 of the canonical schema document.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.schema()).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn summaries(&self) -> Vec<IntentSummary> {
        self.all()
            .map(|template| IntentSummary {
                name: template.name.clone(),
                category: template.category,
                description: template.description.clone(),
                examples: template.examples.clone(),
                bound: template.handler.is_some(),
            })
            .collect()
    }
}

fn build_template(
    name: &str,
    intent: IntentSchema,
    registry: &HandlerRegistry,
) -> Result<IntentTemplate, CatalogueError> {
    let mut template = IntentTemplate::new(name, intent.category).with_description(&intent.description);

    for (param_name, param) in intent.parameters {
        let mut spec = ParameterSpec::new(&param_name, param.kind).with_description(&param.description);
        spec.required = param.required;
        spec.default = param
            .default
            .as_ref()
            .and_then(|json| ParamValue::from_json(param.kind, json));
        if let Some(pattern) = &param.validation_pattern {
            spec = spec
                .with_validation(pattern)
                .map_err(|source| CatalogueError::ValidationPattern {
                    intent: name.to_string(),
                    parameter: param_name.clone(),
                    source,
                })?;
        }
        template = template.with_parameter(spec);
    }

    for pattern in &intent.patterns {
        template = template.with_pattern(pattern);
    }
    for example in &intent.examples {
        template = template.with_example(example);
    }
    if intent.requires_confirmation {
        template = template.requiring_confirmation();
    }

    let handler_name = intent.handler.unwrap_or_else(|| name.to_string());
    match registry.get(&handler_name) {
        Some(handler) => template = template.with_handler(&handler_name, handler),
        None => template.handler_name = Some(handler_name),
    }
    Ok(template)
}

fn schema_of(template: &IntentTemplate) -> IntentSchema {
    let parameters = template
        .parameters
        .values()
        .map(|spec| {
            (
                spec.name.clone(),
                ParameterSchema {
                    kind: spec.kind,
                    required: spec.required,
                    description: spec.description.clone(),
                    default: spec.default.as_ref().map(ParamValue::to_json),
                    validation_pattern: spec.validation_pattern.as_ref().map(|re| re.as_str().to_string()),
                },
            )
        })
        .collect();

    IntentSchema {
        category: template.category,
        description: template.description.clone(),
        patterns: template.patterns.clone(),
        parameters,
        examples: template.examples.clone(),
        requires_confirmation: template.requires_confirmation,
        handler: template
            .handler_name
            .clone()
            .filter(|handler| handler != &template.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handlers::HandlerKind;

    fn registry() -> HandlerRegistry {
        let dir = std::env::temp_dir();
        HandlerRegistry::with_builtins(crate::core::handlers::HandlerSettings {
            settle_delay: std::time::Duration::ZERO,
            dirs: crate::core::handlers::UserDirs::rooted(&dir),
        })
    }

    #[test]
    fn test_builtin_catalogue_loads_and_binds() {
        let catalogue = IntentCatalogue::builtin(&registry()).unwrap();
        assert_eq!(catalogue.len(), HandlerKind::ALL.len());
        for template in catalogue.all() {
            assert!(template.handler.is_some(), "{} is unbound", template.name);
            assert!(!template.examples.is_empty(), "{} has no examples", template.name);
        }
        let click = catalogue.get("click_coordinates").unwrap();
        assert_eq!(click.parameters["clicks"].default, Some(ParamValue::Int(1)));
        assert_eq!(
            click.parameters["button"].default,
            Some(ParamValue::Str("left".to_string()))
        );
        assert!(catalogue.get("file_operations").unwrap().requires_confirmation);
    }

    #[test]
    fn test_register_rejects_bad_pattern() {
        let mut catalogue = IntentCatalogue::new();
        let template = IntentTemplate::new("broken", IntentCategory::Utility)
            .with_pattern("fine")
            .with_pattern("(unclosed");
        match catalogue.register(template) {
            Err(CatalogueError::PatternCompile { intent, index, .. }) => {
                assert_eq!(intent, "broken");
                assert_eq!(index, 1);
            }
            other => panic!("expected compile error, got {:?}", other.map(|_| ())),
        }
        assert!(catalogue.is_empty());
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let mut catalogue = IntentCatalogue::new();
        for name in ["first", "second"] {
            catalogue
                .register(IntentTemplate::new(name, IntentCategory::Utility).with_pattern(name))
                .unwrap();
        }
        catalogue
            .register(
                IntentTemplate::new("first", IntentCategory::Media)
                    .with_pattern("replacement"),
            )
            .unwrap();
        let names: Vec<&str> = catalogue.all().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(catalogue.get("first").unwrap().category, IntentCategory::Media);
    }

    #[test]
    fn test_schema_json_round_trip_keeps_order_and_fingerprint() {
        let registry = registry();
        let catalogue = IntentCatalogue::builtin(&registry).unwrap();
        let json = catalogue.to_schema_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["intents"]["take_screenshot"]["parameters"]["save_path"]["type"], "path");
        assert_eq!(value["intents"]["take_screenshot"]["parameters"]["save_path"]["default"], "desktop");

        let reloaded = IntentCatalogue::from_schema_json(&json, &registry).unwrap();
        let before: Vec<&str> = catalogue.all().map(|t| t.name.as_str()).collect();
        let after: Vec<&str> = reloaded.all().map(|t| t.name.as_str()).collect();
        assert_eq!(before, after);
        assert_eq!(catalogue.fingerprint(), reloaded.fingerprint());
        assert_eq!(catalogue.fingerprint().len(), 64);
    }

    #[test]
    fn test_unknown_handler_leaves_template_unbound() {
        let toml = r#"
            [intents.greet]
            category = "utility"
            handler = "say_hello"
            patterns = ['''hello''']
        "#;
        let catalogue = IntentCatalogue::from_toml_str(toml, &registry()).unwrap();
        let greet = catalogue.get("greet").unwrap();
        assert!(greet.handler.is_none());
        assert_eq!(greet.handler_name.as_deref(), Some("say_hello"));
        assert!(!catalogue.summaries()[0].bound);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let toml = r#"
            [intents.greet]
            category = "utility"
            patterns = ['''hello''']
            priority = 3
        "#;
        assert!(matches!(
            IntentCatalogue::from_toml_str(toml, &registry()),
            Err(CatalogueError::Toml(_))
        ));
    }
}

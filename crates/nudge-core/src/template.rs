//! Template registry: which variables each notification template needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDef {
    /// Dotted variable paths that must resolve, e.g. "user.email".
    pub required_variables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_variables: Vec<String>,
}

impl TemplateDef {
    pub fn new(required: &[&str]) -> Self {
        Self {
            required_variables: required.iter().map(|p| p.to_string()).collect(),
            optional_variables: Vec::new(),
        }
    }

    /// Required paths that are absent (or null) in `variables`, in declaration order.
    pub fn missing_variables(&self, variables: &Map<String, Value>) -> Vec<String> {
        self.required_variables
            .iter()
            .filter(|path| lookup_path(variables, path).is_none())
            .cloned()
            .collect()
    }
}

/// Resolve a dotted path against a variable bag. Null counts as absent.
pub fn lookup_path<'a>(variables: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    (!current.is_null()).then_some(current)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateRegistry(BTreeMap<String, TemplateDef>);

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in email templates.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(
            "welcome_v1",
            TemplateDef::new(&["user.email", "product.name", "links.dashboard", "links.docs"]),
        );
        registry.insert(
            "activation_nudge_v1",
            TemplateDef::new(&["user.email", "product.name", "activation_hint"]),
        );
        registry.insert(
            "feature_discovery_1",
            TemplateDef::new(&["user.email", "feature.name", "feature.url"]),
        );
        registry.insert(
            "pricing_explainer_v1",
            TemplateDef::new(&["user.email", "links.pricing"]),
        );
        registry.insert(
            "churn_feedback_v1",
            TemplateDef::new(&["user.email", "feedback_url"]),
        );
        registry
    }

    pub fn insert(&mut self, name: &str, def: TemplateDef) {
        self.0.insert(name.to_string(), def);
    }

    pub fn get(&self, name: &str) -> Option<&TemplateDef> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

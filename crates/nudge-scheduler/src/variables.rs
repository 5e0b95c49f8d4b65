//! Default template variable resolver.
//!
//! Builds the variable bag from product config, the event, and the campaign
//! rule. Precedence, lowest first: built-in defaults, event properties
//! (merged at the root), rule `params`. Nulls are pruned at every depth.

use async_trait::async_trait;
use nudge_core::campaign::CampaignRule;
use nudge_core::config::{LinksConfig, ProductConfig};
use nudge_core::error::Result;
use nudge_core::traits::VariableResolver;
use nudge_core::types::Event;
use serde_json::{Map, Value, json};

const DEFAULT_FEATURE_NAME: &str = "Unknown Feature";
const DEFAULT_ACTIVATION_HINT: &str = "Get started by creating your first project!";

pub struct DefaultVariableResolver {
    product: ProductConfig,
    links: LinksConfig,
}

impl DefaultVariableResolver {
    pub fn new(product: ProductConfig, links: LinksConfig) -> Self {
        Self { product, links }
    }

    fn base_variables(&self, event: &Event, rule: &CampaignRule) -> Map<String, Value> {
        let email = non_empty(event.properties.get("email").and_then(Value::as_str))
            .map(String::from)
            .unwrap_or_else(|| format!("user_{}@example.com", event.user_id));
        let feature = non_empty(rule.feature.as_deref());
        let feature_url = non_empty(rule.feature_url.as_deref())
            .map(String::from)
            .unwrap_or_else(|| {
                format!("{}/features/{}", self.product.url, feature.unwrap_or("unknown"))
            });
        let feedback_url = non_empty(rule.feedback_url.as_deref())
            .map(String::from)
            .unwrap_or_else(|| format!("{}/feedback", self.product.url));
        let activation_hint =
            non_empty(rule.activation_hint.as_deref()).unwrap_or(DEFAULT_ACTIVATION_HINT);

        let base = json!({
            "product": { "name": self.product.name, "url": self.product.url },
            "links": {
                "dashboard": self.links.dashboard,
                "pricing": self.links.pricing,
                "docs": self.links.docs,
            },
            "user": { "id": event.user_id, "email": email },
            "feature": {
                "name": feature.unwrap_or(DEFAULT_FEATURE_NAME),
                "url": feature_url,
            },
            "activation_hint": activation_hint,
            "feedback_url": feedback_url,
        });
        match base {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl Default for DefaultVariableResolver {
    fn default() -> Self {
        Self::new(ProductConfig::default(), LinksConfig::default())
    }
}

#[async_trait]
impl VariableResolver for DefaultVariableResolver {
    async fn resolve(&self, event: &Event, rule: &CampaignRule) -> Result<Map<String, Value>> {
        let mut variables = self.base_variables(event, rule);
        for (key, value) in &event.properties {
            variables.insert(key.clone(), value.clone());
        }
        if let Some(params) = &rule.params {
            for (key, value) in params {
                variables.insert(key.clone(), value.clone());
            }
        }
        prune_nulls(&mut variables);
        Ok(variables)
    }
}

/// Empty strings count as absent, so defaults fill them in.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

/// Drop null entries from objects, recursively.
pub fn prune_nulls(map: &mut Map<String, Value>) {
    map.retain(|_, value| !value.is_null());
    for value in map.values_mut() {
        if let Value::Object(inner) = value {
            prune_nulls(inner);
        }
    }
}

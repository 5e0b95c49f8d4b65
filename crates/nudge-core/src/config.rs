//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::campaign::RuleTable;
use crate::error::{NudgeError, Result};
use crate::template::TemplateRegistry;

/// Environment variable that overrides `dispatch.webhook_url`.
pub const WEBHOOK_URL_ENV: &str = "NUDGE_WEBHOOK_URL";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub product: ProductConfig,
    #[serde(default)]
    pub links: LinksConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default = "TemplateRegistry::builtin")]
    pub templates: TemplateRegistry,
    #[serde(default = "RuleTable::builtin")]
    pub campaigns: RuleTable,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            dispatch: DispatchConfig::default(),
            product: ProductConfig::default(),
            links: LinksConfig::default(),
            audit: AuditConfig::default(),
            templates: TemplateRegistry::builtin(),
            campaigns: RuleTable::builtin(),
        }
    }
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(WEBHOOK_URL_ENV)
            && !url.trim().is_empty()
        {
            self.dispatch.webhook_url = url;
        }
    }

    /// Check campaigns against templates and sanity-check limits.
    pub fn validate(&self) -> Result<()> {
        if self.audit.capacity == 0 {
            return Err(NudgeError::Config("audit.capacity must be > 0".into()));
        }
        if self.dispatch.webhook_url.trim().is_empty() {
            return Err(NudgeError::Config("dispatch.webhook_url is empty".into()));
        }
        self.campaigns.validate(&self.templates)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Dispatch transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_url() -> String { "http://localhost:5678/webhook-test/gtm-task".into() }
fn default_timeout_secs() -> u64 { 10 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            webhook_url: default_webhook_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Product identity exposed to templates as `product.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductConfig {
    #[serde(default = "default_product_name")]
    pub name: String,
    #[serde(default = "default_product_url")]
    pub url: String,
}

fn default_product_name() -> String { "GTM Core Product".into() }
fn default_product_url() -> String { "http://localhost:3000".into() }

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            name: default_product_name(),
            url: default_product_url(),
        }
    }
}

/// Well-known product links exposed to templates as `links.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinksConfig {
    #[serde(default = "default_dashboard")]
    pub dashboard: String,
    #[serde(default = "default_pricing")]
    pub pricing: String,
    #[serde(default = "default_docs")]
    pub docs: String,
}

fn default_dashboard() -> String { "http://localhost:3000/dashboard".into() }
fn default_pricing() -> String { "http://localhost:3000/pricing".into() }
fn default_docs() -> String { "http://localhost:3000/docs".into() }

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            dashboard: default_dashboard(),
            pricing: default_pricing(),
            docs: default_docs(),
        }
    }
}

/// Audit trail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// How many records the in-memory ring buffer keeps.
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

fn default_audit_capacity() -> usize { 1000 }

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: default_audit_capacity() }
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle events sent by the licensing platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    InstallInstalled,
    InstallActivated,
    InstallDeactivated,
    InstallUninstalled,
    LicenseActivated,
    LicenseDeactivated,
    LicenseExpired,
    Other(String),
}

impl EventType {
    pub fn parse(value: &str) -> Self {
        match value {
            "install.installed" => EventType::InstallInstalled,
            "install.activated" => EventType::InstallActivated,
            "install.deactivated" => EventType::InstallDeactivated,
            "install.uninstalled" => EventType::InstallUninstalled,
            "license.activated" => EventType::LicenseActivated,
            "license.deactivated" => EventType::LicenseDeactivated,
            "license.expired" => EventType::LicenseExpired,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::InstallInstalled => "install.installed",
            EventType::InstallActivated => "install.activated",
            EventType::InstallDeactivated => "install.deactivated",
            EventType::InstallUninstalled => "install.uninstalled",
            EventType::LicenseActivated => "license.activated",
            EventType::LicenseDeactivated => "license.deactivated",
            EventType::LicenseExpired => "license.expired",
            EventType::Other(other) => other,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound webhook body as decoded from JSON.
///
/// Every field is optional here; the pipeline's validation gate decides what
/// a missing field means.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub plugin_id: Option<Value>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub objects: PayloadObjects,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadObjects {
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub install: Option<Value>,
}

impl WebhookPayload {
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn event_id(&self) -> Option<String> {
        self.id.as_ref().and_then(scalar_string)
    }

    pub fn plugin_id(&self) -> Option<String> {
        self.plugin_id.as_ref().and_then(scalar_string)
    }
}

/// A payload that passed the validation gate.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: Option<String>,
    pub plugin_id: String,
    pub event_type: EventType,
    pub user: Map<String, Value>,
    pub install: Map<String, Value>,
    pub email: String,
    pub external_user_id: Option<String>,
    pub is_premium: bool,
    pub is_marketing_allowed: bool,
}

/// Renders ids that may arrive as JSON strings or numbers.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Loose boolean reading for flags that arrive as `true`, `1` or `"1"`.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

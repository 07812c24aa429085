//! Backend configuration records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::types::BackendKind;

/// Id of the generated local backend
pub const DEFAULT_LOCAL_ID: &str = "local";

/// Declarative definition of one backend, as persisted in `storages.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique, stable registry key
    pub id: String,

    /// Storage kind (`local`, `s3`, `gdrive`, `sftp`, `nfs`, `redis`).
    /// Kept as text so unknown kinds survive a load/persist cycle.
    pub kind: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default)]
    pub is_default: bool,

    /// Kind-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, kind: BackendKind) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: kind.as_str().to_string(),
            icon: None,
            is_default: false,
            parameters: BTreeMap::new(),
        }
    }

    /// Local backend rooted at `root`
    pub fn local(id: impl Into<String>, root: impl Into<String>) -> Self {
        Self::new(id, BackendKind::Local).with_param("root", root.into())
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Parse the kind. Unknown kinds are `Unsupported`.
    pub fn backend_kind(&self) -> StorageResult<BackendKind> {
        self.kind
            .parse()
            .map_err(|_| StorageError::Unsupported(format!("unknown backend kind: {}", self.kind)))
    }

    /// Icon to display: configured, or the kind's default
    pub fn icon(&self) -> String {
        self.icon.clone().unwrap_or_else(|| match self.backend_kind() {
            Ok(kind) => kind.default_icon().to_string(),
            Err(_) => "storage".to_string(),
        })
    }

    /// String parameter; numbers and booleans are rendered as text.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Required string parameter
    pub fn require(&self, key: &str) -> StorageResult<String> {
        self.param_str(key).ok_or_else(|| {
            StorageError::InvalidConfig(format!(
                "backend '{}' ({}) is missing parameter '{}'",
                self.id, self.kind, key
            ))
        })
    }

    /// Boolean parameter, accepting `true`/`"true"`. Absent is `false`.
    pub fn param_bool(&self, key: &str) -> bool {
        match self.parameters.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        }
    }

    /// Port-like parameter given as number or text
    pub fn param_u16(&self, key: &str) -> StorageResult<Option<u16>> {
        match self.param_str(key) {
            None => Ok(None),
            Some(text) => text.parse().map(Some).map_err(|_| {
                StorageError::InvalidConfig(format!(
                    "backend '{}': parameter '{}' is not a valid port: {}",
                    self.id, key, text
                ))
            }),
        }
    }

    /// Operator-supplied network endpoint to validate, if this kind has one
    /// and it is set.
    pub fn endpoint(&self) -> Option<String> {
        let kind = self.backend_kind().ok()?;
        self.param_str(kind.endpoint_parameter()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camel_case_round_trip() {
        let raw = json!({
            "id": "nas",
            "kind": "sftp",
            "displayName": "NAS",
            "isDefault": true,
            "parameters": { "host": "files.example.com", "port": 2222, "username": "me" }
        });
        let config: BackendConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.display_name, "NAS");
        assert!(config.is_default);
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Sftp);
        assert_eq!(config.param_u16("port").unwrap(), Some(2222));
        assert_eq!(config.endpoint().as_deref(), Some("files.example.com"));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["displayName"], "NAS");
        assert_eq!(back["isDefault"], true);
    }

    #[test]
    fn test_unknown_kind_deserializes_but_does_not_parse() {
        let config: BackendConfig =
            serde_json::from_value(json!({ "id": "x", "kind": "ftp" })).unwrap();
        assert!(matches!(config.backend_kind(), Err(StorageError::Unsupported(_))));
        assert!(config.endpoint().is_none());
    }

    #[test]
    fn test_require_reports_key() {
        let config = BackendConfig::new("bucket", BackendKind::S3);
        let err = config.require("bucket").unwrap_err();
        assert!(err.to_string().contains("'bucket'"));
    }

    #[test]
    fn test_param_bool_forms() {
        let config = BackendConfig::new("n", BackendKind::Nfs)
            .with_param("readOnly", "true")
            .with_param("allowHttp", true);
        assert!(config.param_bool("readOnly"));
        assert!(config.param_bool("allowHttp"));
        assert!(!config.param_bool("missing"));
    }
}

//! API trigger configuration and payload typing.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// HTTP method an API trigger calls its endpoint with.
///
/// Parsing is case-insensitive; the canonical form is upper case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Whether requests with this method carry a body.
    #[must_use]
    pub const fn has_body(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ValidationError::InvalidMethod {
                method: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Declared type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFieldType {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl PayloadFieldType {
    /// Whether `value` has this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for PayloadFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(name)
    }
}

/// Outbound call made when an API trigger executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Absolute URL called on execution.
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Default request body, replaced wholesale by an execute-time payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Fields every payload must carry, with their types.
    #[serde(default)]
    pub payload_types: BTreeMap<String, PayloadFieldType>,
}

impl ApiConfig {
    /// Creates a config calling `endpoint` with `method` and no defaults.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            payload: Map::new(),
            headers: BTreeMap::new(),
            payload_types: BTreeMap::new(),
        }
    }

    /// Validates the endpoint and the default payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the endpoint is not an absolute URL
    /// with a host, or the default payload does not satisfy `payload_types`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let url = Url::parse(&self.endpoint).map_err(|e| ValidationError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ValidationError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "missing host".to_string(),
            });
        }

        self.check_payload(&self.payload)
    }

    /// Picks the payload for one execution: the override when given,
    /// otherwise the configured default.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the chosen payload does not satisfy
    /// `payload_types`.
    pub fn resolve_payload(
        &self,
        override_payload: Option<Map<String, Value>>,
    ) -> Result<Map<String, Value>, ValidationError> {
        let payload = override_payload.unwrap_or_else(|| self.payload.clone());
        self.check_payload(&payload)?;
        Ok(payload)
    }

    fn check_payload(&self, payload: &Map<String, Value>) -> Result<(), ValidationError> {
        for (field, expected) in &self.payload_types {
            let Some(value) = payload.get(field) else {
                return Err(ValidationError::PayloadFieldMissing {
                    field: field.clone(),
                });
            };
            if !expected.matches(value) {
                return Err(ValidationError::PayloadFieldType {
                    field: field.clone(),
                    expected: *expected,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn typed_config() -> ApiConfig {
        let mut config = ApiConfig::new("https://hooks.example.com/notify", HttpMethod::Post);
        config
            .payload_types
            .insert("user_id".to_string(), PayloadFieldType::Number);
        config
            .payload_types
            .insert("tags".to_string(), PayloadFieldType::Array);
        config.payload.insert("user_id".to_string(), json!(7));
        config.payload.insert("tags".to_string(), json!(["a"]));
        config
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("get".parse::<HttpMethod>(), Ok(HttpMethod::Get));
        assert_eq!("Delete".parse::<HttpMethod>(), Ok(HttpMethod::Delete));
        assert!(matches!(
            "PATCH".parse::<HttpMethod>(),
            Err(ValidationError::InvalidMethod { .. })
        ));

        let method: HttpMethod = serde_json::from_value(json!("put")).expect("lower case");
        assert_eq!(method, HttpMethod::Put);
        assert_eq!(serde_json::to_value(method).expect("serialize"), json!("PUT"));
    }

    #[test]
    fn endpoint_requires_scheme_and_host() {
        assert!(ApiConfig::new("https://example.com/x", HttpMethod::Get)
            .validate()
            .is_ok());

        for bad in ["example.com/path", "not a url", "mailto:ops@example.com"] {
            let err = ApiConfig::new(bad, HttpMethod::Get)
                .validate()
                .expect_err(bad);
            assert!(matches!(err, ValidationError::InvalidEndpoint { .. }), "{bad}");
        }
    }

    #[test]
    fn default_payload_checked_against_types() {
        let mut config = typed_config();
        assert!(config.validate().is_ok());

        config.payload.insert("user_id".to_string(), json!("seven"));
        assert_eq!(
            config.validate(),
            Err(ValidationError::PayloadFieldType {
                field: "user_id".to_string(),
                expected: PayloadFieldType::Number,
            })
        );
    }

    #[test]
    fn override_payload_replaces_default() {
        let config = typed_config();

        let default = config.resolve_payload(None).expect("default is valid");
        assert_eq!(default.get("user_id"), Some(&json!(7)));

        let mut custom = Map::new();
        custom.insert("user_id".to_string(), json!(42));
        custom.insert("tags".to_string(), json!([]));
        custom.insert("extra".to_string(), json!(true));
        let resolved = config.resolve_payload(Some(custom)).expect("override is valid");
        assert_eq!(resolved.get("user_id"), Some(&json!(42)));
        assert_eq!(resolved.get("extra"), Some(&json!(true)));

        let mut missing = Map::new();
        missing.insert("user_id".to_string(), json!(1));
        assert_eq!(
            config.resolve_payload(Some(missing)),
            Err(ValidationError::PayloadFieldMissing {
                field: "tags".to_string()
            })
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ApiConfig =
            serde_json::from_value(json!({"endpoint": "http://localhost:9000/hook"}))
                .expect("deserialize");
        assert_eq!(config.method, HttpMethod::Post);
        assert!(config.payload.is_empty());
        assert!(config.headers.is_empty());
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Round-trip bound for a single meter request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Field carrying the meter's serial number.
pub const EQUIPMENT_ID: &str = "Equipment_Id";

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("No response from smart gateway {url}: {reason}")]
    ConnectionFailure { url: String, reason: String },
    #[error("Malformed response from smart gateway: {0}")]
    MalformedResponse(String),
    #[error("Response does not contain '{0}' attribute")]
    MissingField(&'static str),
    #[error("Field '{field}' is not numeric: {value}")]
    MalformedField { field: String, value: String },
    #[error("Cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// One decoded JSON document from the smart gateway's `/smartmeter/api/read`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MeterReading(Map<String, Value>);

impl MeterReading {
    /// Decodes a response body, rejecting empty bodies and anything that is
    /// not a non-empty JSON object.
    pub fn from_body(body: &[u8]) -> Result<Self, MeterError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(MeterError::MalformedResponse("empty body".to_string()));
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| MeterError::MalformedResponse(format!("invalid JSON: {e}")))?;
        Self::try_from(value)
    }

    /// Numeric value of `field`. Absent and `null` fields are `None`;
    /// numeric strings such as `"231.4"` are accepted.
    pub fn number(&self, field: &str) -> Result<Option<f64>, MeterError> {
        let malformed = |value: &Value| MeterError::MalformedField {
            field: field.to_string(),
            value: value.to_string(),
        };
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value @ Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| malformed(value)),
            Some(value @ Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| malformed(value)),
            Some(value) => Err(malformed(value)),
        }
    }

    /// Numeric value of `field`, with missing fields read as zero.
    pub fn number_or_zero(&self, field: &str) -> Result<f64, MeterError> {
        Ok(self.number(field)?.unwrap_or_default())
    }

    pub fn equipment_id(&self) -> Result<String, MeterError> {
        match self.0.get(EQUIPMENT_ID) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(MeterError::MissingField(EQUIPMENT_ID)),
        }
    }
}

impl TryFrom<Value> for MeterReading {
    type Error = MeterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) if !fields.is_empty() => Ok(Self(fields)),
            Value::Object(_) => Err(MeterError::MalformedResponse(
                "empty JSON object".to_string(),
            )),
            other => Err(MeterError::MalformedResponse(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

/// Anything that can produce a fresh meter reading on demand.
#[async_trait]
pub trait MeterSource: Send + Sync {
    async fn fetch(&self) -> Result<MeterReading, MeterError>;
}

/// HTTP client for the smart gateway's local JSON API.
pub struct MeterClient {
    endpoint: String,
    client: reqwest::Client,
}

impl MeterClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, MeterError> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connection_failure(&self, reason: impl Into<String>) -> MeterError {
        MeterError::ConnectionFailure {
            url: self.endpoint.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MeterSource for MeterClient {
    async fn fetch(&self) -> Result<MeterReading, MeterError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.connection_failure("request timed out")
                } else {
                    self.connection_failure(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.connection_failure(format!("HTTP status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.connection_failure(e.to_string()))?;
        MeterReading::from_body(&body)
    }
}

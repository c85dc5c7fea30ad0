//! Data passed between steps.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::step::StepError;

/// The value a step receives as input and returns as its result.
///
/// Every step result is journaled as-is, so a saga can be rebuilt and its
/// compensations run from persisted state alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepPayload(serde_json::Value);

impl StepPayload {
    /// A payload carrying nothing.
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    /// Serializes a typed value into a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, StepError> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Deserializes the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for StepPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ChannelResult {
        channel_order_no: String,
        payment_url: Option<String>,
    }

    #[test]
    fn typed_values_survive_the_payload() {
        let result = ChannelResult {
            channel_order_no: "ch_123".to_string(),
            payment_url: Some("https://pay.example/ch_123".to_string()),
        };
        let payload = StepPayload::encode(&result).unwrap();
        assert_eq!(payload.as_value()["channel_order_no"], "ch_123");
        assert_eq!(payload.decode::<ChannelResult>().unwrap(), result);
    }

    #[test]
    fn decoding_the_wrong_shape_is_permanent() {
        let payload = StepPayload::from(serde_json::json!({"unexpected": 1}));
        let err = payload.decode::<ChannelResult>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_payload_is_null() {
        assert!(StepPayload::empty().is_empty());
        assert!(StepPayload::default().is_empty());
        assert_eq!(
            serde_json::to_string(&StepPayload::empty()).unwrap(),
            "null"
        );
    }
}

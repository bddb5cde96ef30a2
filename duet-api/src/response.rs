//! Server response envelope.

use serde::{Deserialize, Serialize};

use duet_core::error::{DuetError, DuetResult};

/// Standard response envelope of the pairing backend.
///
/// ```json
/// { "success": true, "data": { ... }, "message": null }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T = serde_json::Value> {
    /// Whether the call succeeded.
    pub success: bool,
    /// Response payload (type varies by endpoint).
    pub data: Option<T>,
    /// Human-readable message, usually present on failure.
    #[serde(default)]
    pub message: Option<String>,
    /// Machine-readable error code.
    #[serde(default, rename = "errorCode")]
    pub error_code: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Error message if this is a failed response.
    pub fn error_message(&self) -> Option<String> {
        if self.success {
            None
        } else {
            Some(
                self.message
                    .clone()
                    .or_else(|| self.error_code.clone())
                    .unwrap_or_else(|| "request failed".to_string()),
            )
        }
    }

    /// Unwrap the payload, turning a failed envelope into an error.
    pub fn into_data(self, what: &str) -> DuetResult<T> {
        if let Some(message) = self.error_message() {
            return Err(DuetError::ServerError {
                status: 200,
                message,
            });
        }
        self.data
            .ok_or_else(|| DuetError::Serialization(format!("missing {what} data")))
    }

    /// Check success without caring about the payload.
    pub fn ensure_success(&self) -> DuetResult<()> {
        match self.error_message() {
            Some(message) => Err(DuetError::ServerError {
                status: 200,
                message,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let json = r#"{"success":true,"data":{"hasKey":true}}"#;
        let resp: ApiResponse = serde_json::from_str(json).unwrap();
        assert!(resp.error_message().is_none());
        assert_eq!(resp.into_data("key").unwrap()["hasKey"], true);
    }

    #[test]
    fn test_failure_envelope() {
        let json = r#"{"success":false,"data":null,"message":"couple not found","errorCode":"C404"}"#;
        let resp: ApiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error_message().unwrap(), "couple not found");
        assert!(resp.ensure_success().is_err());
    }

    #[test]
    fn test_missing_data_is_an_error() {
        let resp: ApiResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(matches!(
            resp.into_data("key"),
            Err(DuetError::Serialization(_))
        ));
    }
}

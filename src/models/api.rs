use serde::{Deserialize, Serialize};

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process is serving
    pub status: String,
    /// Configured `SERVICE_NAME`
    pub service: String,
}

impl HealthResponse {
    pub fn healthy(service: impl Into<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            service: service.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_shape() {
        let body = serde_json::to_value(HealthResponse::healthy("portfolio-webapp")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"status": "healthy", "service": "portfolio-webapp"})
        );
    }
}

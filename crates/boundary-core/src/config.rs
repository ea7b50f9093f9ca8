use crate::error::BoundaryError;
use crate::verify::FreshnessPolicy;
use crate::writer::ExecutionMode;
use serde::{Deserialize, Serialize};

/// Execution boundary configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    pub execution_mode: ExecutionMode,
    pub freshness: FreshnessPolicy,
    /// Receipts retained per provider for idempotent replay.
    pub idempotency_cache_capacity: usize,
}

impl BoundaryConfig {
    pub fn live() -> Self {
        Self {
            execution_mode: ExecutionMode::Live,
            ..Self::default()
        }
    }

    pub fn with_freshness(mut self, freshness: FreshnessPolicy) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.idempotency_cache_capacity = capacity;
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self, BoundaryError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| BoundaryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BoundaryError> {
        if self.idempotency_cache_capacity == 0 {
            return Err(BoundaryError::Config(
                "idempotency_cache_capacity must be at least 1".to_string(),
            ));
        }
        if !self.freshness.is_valid() {
            return Err(BoundaryError::Config(
                "staleness limits must be non-negative and in range".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::DryRun,
            freshness: FreshnessPolicy::default(),
            idempotency_cache_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn defaults_to_dry_run() {
        let config = BoundaryConfig::default();
        assert_eq!(config.execution_mode, ExecutionMode::DryRun);
        assert_eq!(config.idempotency_cache_capacity, 1024);
        assert_eq!(
            config.freshness.max_staleness_for("any"),
            Duration::minutes(5)
        );
    }

    #[test]
    fn loads_partial_json() {
        let config = BoundaryConfig::from_json_str(
            r#"{
                "execution_mode": "live",
                "freshness": {
                    "default_max_staleness_secs": 900,
                    "provider_overrides_secs": {"mock_payments": 90}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Live);
        assert_eq!(config.idempotency_cache_capacity, 1024);
        assert_eq!(
            config.freshness.max_staleness_for("mock_payments"),
            Duration::seconds(90)
        );
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            BoundaryConfig::from_json_str(r#"{"idempotency_cache_capacity": 0}"#),
            Err(BoundaryError::Config(_))
        ));
        assert!(BoundaryConfig::from_json_str(r#"{"execution_mode": "yolo"}"#).is_err());
        assert!(matches!(
            BoundaryConfig::from_json_str(
                r#"{"freshness": {"default_max_staleness_secs": -1}}"#
            ),
            Err(BoundaryError::Config(_))
        ));
    }
}

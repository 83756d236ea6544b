//! Producer watermark record.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::ConfigId;
use crate::time::EpochMillis;

/// One `producer_config` document: the timestamp up to which work has been
/// converted into jobs for a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerConfig {
    pub config_id: ConfigId,
    pub last_produced_timestamp: EpochMillis,
}

impl ProducerConfig {
    pub fn new(config_id: ConfigId, last_produced_timestamp: EpochMillis) -> Self {
        Self {
            config_id,
            last_produced_timestamp,
        }
    }

    /// Validate a watermark move from `expected_old` to `new_value`.
    ///
    /// The watermark never moves backwards.
    pub fn check_advance(expected_old: EpochMillis, new_value: EpochMillis) -> DomainResult<()> {
        if new_value < expected_old {
            return Err(DomainError::invariant(format!(
                "watermark cannot regress from {expected_old} to {new_value}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_may_stay_or_grow() {
        assert!(ProducerConfig::check_advance(1_000, 1_000).is_ok());
        assert!(ProducerConfig::check_advance(1_000, 2_000).is_ok());
    }

    #[test]
    fn watermark_cannot_regress() {
        assert!(matches!(
            ProducerConfig::check_advance(2_000, 1_999),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn serializes_with_collection_field_names() {
        let cfg = ProducerConfig::new(ConfigId::from_raw("1"), 1_759_740_104_824);
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["configId"], "1");
        assert_eq!(json["lastProducedTimestamp"], 1_759_740_104_824_i64);
    }
}

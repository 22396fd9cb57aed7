//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the values it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::ONE_SEC_MS;
use crate::pricing::{FareModel, FeeSchedule};

/// Default time a driver has to answer an offer.
const DEFAULT_OFFER_TTL_SECS: u64 = 30;

/// Longest answer window a config may ask for: one day.
const MAX_OFFER_TTL_SECS: u64 = 24 * 60 * 60;

/// Default candidate search radius: 20 H3 res-9 rings, roughly 6km.
const DEFAULT_SEARCH_RADIUS_CELLS: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds a driver has to accept or reject an offer.
    pub offer_ttl_secs: u64,
    /// Max H3 grid distance (res 9 rings) between pickup and candidate drivers.
    pub search_radius_cells: u32,
    /// Offers a single ride may generate before dispatch gives up on it.
    pub max_offers_per_ride: usize,
    /// Re-reads allowed after a lost version compare-and-swap.
    pub max_cas_retries: usize,
    /// When an already-offered ride runs out of candidates, expire it instead of
    /// leaving it for the caller's retry policy.
    pub expire_on_exhaustion: bool,
    pub fees: FeeSchedule,
    pub fares: FareModel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            offer_ttl_secs: DEFAULT_OFFER_TTL_SECS,
            search_radius_cells: DEFAULT_SEARCH_RADIUS_CELLS,
            max_offers_per_ride: 10,
            max_cas_retries: 8,
            expire_on_exhaustion: true,
            fees: FeeSchedule::default(),
            fares: FareModel::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offer_ttl_secs == 0 {
            return Err(ConfigError::Invalid("offer_ttl_secs must be positive".into()));
        }
        if self.offer_ttl_secs > MAX_OFFER_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "offer_ttl_secs must be at most {MAX_OFFER_TTL_SECS}"
            )));
        }
        if self.max_offers_per_ride == 0 {
            return Err(ConfigError::Invalid("max_offers_per_ride must be positive".into()));
        }
        self.fees.validate()?;
        self.fares.validate()
    }

    pub fn offer_ttl_ms(&self) -> u64 {
        self.offer_ttl_secs.saturating_mul(ONE_SEC_MS)
    }

    pub fn with_offer_ttl_secs(mut self, secs: u64) -> Self {
        self.offer_ttl_secs = secs;
        self
    }

    /// Search for drivers within this H3 grid distance of the pickup.
    pub fn with_search_radius_cells(mut self, radius: u32) -> Self {
        self.search_radius_cells = radius;
        self
    }

    pub fn with_max_offers_per_ride(mut self, max: usize) -> Self {
        self.max_offers_per_ride = max;
        self
    }

    pub fn with_expire_on_exhaustion(mut self, expire: bool) -> Self {
        self.expire_on_exhaustion = expire;
        self
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_fares(mut self, fares: FareModel) -> Self {
        self.fares = fares;
        self
    }
}

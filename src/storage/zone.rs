//! Zone configs and the system config view: per-span size and load
//! thresholds plus static split boundaries.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::RwLock;

use crate::kvpb::{Key, Span};
use crate::utils::{KvError, RwLockExt};

use serde::{Deserialize, Serialize};

/// Configuration of the ranges inside a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Ranges below this size are merge candidates.
    pub range_min_bytes: i64,

    /// Ranges above this size are split.
    pub range_max_bytes: i64,

    pub num_replicas: usize,

    /// Requests per second above which a range is split by load; zero
    /// disables load-based splitting.
    pub qps_split_threshold: f64,
}

#[allow(clippy::derivable_impls)]
impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            range_min_bytes: 128 << 10,
            range_max_bytes: 512 << 10,
            num_replicas: 3,
            qps_split_threshold: 2500.0,
        }
    }
}

impl ZoneConfig {
    pub fn to_toml(&self) -> Result<String, KvError> {
        Ok(toml::to_string(self)?)
    }

    pub fn from_toml(s: &str) -> Result<Self, KvError> {
        let config: ZoneConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KvError> {
        if self.range_max_bytes <= 0 || self.range_min_bytes < 0 {
            return Err(KvError::msg(format!(
                "invalid range size bounds [{}, {}]",
                self.range_min_bytes, self.range_max_bytes
            )));
        }
        if self.range_min_bytes >= self.range_max_bytes {
            return Err(KvError::msg(format!(
                "range_min_bytes {} must be below range_max_bytes {}",
                self.range_min_bytes, self.range_max_bytes
            )));
        }
        if self.num_replicas == 0 {
            return Err(KvError::msg("num_replicas must be positive"));
        }
        Ok(())
    }
}

struct SystemConfigState {
    default_zone: ZoneConfig,

    /// Zones overriding the default over a span; later entries win.
    zones: Vec<(Span, ZoneConfig)>,

    /// Keys every range boundary must respect.
    split_keys: BTreeSet<Key>,
}

/// Cluster-wide system config, shared by every store.
pub struct SystemConfig {
    state: RwLock<SystemConfigState>,
}

impl SystemConfig {
    pub fn new(default_zone: ZoneConfig) -> Self {
        SystemConfig {
            state: RwLock::new(SystemConfigState {
                default_zone,
                zones: Vec::new(),
                split_keys: BTreeSet::new(),
            }),
        }
    }

    pub fn set_default_zone(&self, zone: ZoneConfig) {
        self.state.write_locked().default_zone = zone;
    }

    /// Overrides the zone of a span; its bounds become split keys.
    pub fn set_zone(&self, span: Span, zone: ZoneConfig) {
        let mut state = self.state.write_locked();
        state.split_keys.insert(span.key.clone());
        if !span.end_key.is_empty() {
            state.split_keys.insert(span.end_key.clone());
        }
        state.zones.push((span, zone));
    }

    pub fn add_split_key(&self, key: impl Into<Key>) {
        self.state.write_locked().split_keys.insert(key.into());
    }

    pub fn zone_for_key(&self, key: &[u8]) -> ZoneConfig {
        let state = self.state.read_locked();
        state
            .zones
            .iter()
            .rev()
            .find(|(span, _)| span.contains_key(key))
            .map(|(_, z)| z.clone())
            .unwrap_or_else(|| state.default_zone.clone())
    }

    /// First split key strictly inside `(start, end)`.
    pub fn compute_split_key(&self, start: &[u8], end: &[u8]) -> Option<Key> {
        let state = self.state.read_locked();
        state
            .split_keys
            .range::<[u8], _>((Bound::Excluded(start), Bound::Excluded(end)))
            .next()
            .cloned()
    }

    pub fn needs_split(&self, start: &[u8], end: &[u8]) -> bool {
        self.compute_split_key(start, end).is_some()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self::new(ZoneConfig::default())
    }
}

/// Helper for tests and the server binary: zone with the given bounds.
pub fn zone_with_bounds(min_bytes: i64, max_bytes: i64) -> ZoneConfig {
    ZoneConfig {
        range_min_bytes: min_bytes,
        range_max_bytes: max_bytes,
        ..Default::default()
    }
}

#[cfg(test)]
mod zone_tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn toml_roundtrip() -> Result<(), KvError> {
        let zone = ZoneConfig {
            range_min_bytes: 10,
            range_max_bytes: 1000,
            num_replicas: 5,
            qps_split_threshold: 0.0,
        };
        let s = zone.to_toml()?;
        assert_eq!(ZoneConfig::from_toml(&s)?, zone);
        // partial documents fall back to defaults
        let partial = ZoneConfig::from_toml("num_replicas = 1")?;
        assert_eq!(partial.num_replicas, 1);
        assert_eq!(partial.range_max_bytes, ZoneConfig::default().range_max_bytes);
        assert!(ZoneConfig::from_toml("range_min_bytes = 9999999999").is_err());
        Ok(())
    }

    #[test]
    fn split_keys_and_overrides() {
        let cfg = SystemConfig::default();
        cfg.set_zone(Span::range("d", "f"), zone_with_bounds(1, 2));
        cfg.add_split_key("x");
        assert_eq!(cfg.zone_for_key(b"e").range_max_bytes, 2);
        assert_eq!(cfg.zone_for_key(b"a"), ZoneConfig::default());
        assert_eq!(cfg.compute_split_key(b"a", b"z"), Some(Bytes::from("d")));
        assert_eq!(cfg.compute_split_key(b"d", b"z"), Some(Bytes::from("f")));
        assert_eq!(cfg.compute_split_key(b"f", b"x"), None);
        assert!(!cfg.needs_split(b"x", b"z"));
    }
}

use serde::{Deserialize, Serialize};

/// Share of the alias traffic served by one published version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionTraffic {
    pub version: String,
    pub percent: f64,
}

impl VersionTraffic {
    pub fn new(version: impl Into<String>, percent: f64) -> Self {
        Self {
            version: version.into(),
            percent,
        }
    }
}

/// Routing of the function alias: the primary version plus at most one
/// additional weighted version.
///
/// Serialized as `{"primary": {...}, "secondary": {...}}` so it can be kept
/// in deployment metadata and restored on rollback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTrafficConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<VersionTraffic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<VersionTraffic>,
}

impl RoutingTrafficConfig {
    pub fn all_to(version: impl Into<String>) -> Self {
        Self {
            primary: Some(VersionTraffic::new(version, 100.0)),
            secondary: None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Route `percent` to `version`.
    ///
    /// The previous primary becomes the secondary with the remaining share.
    /// When `version` already is the primary only the existing secondary is
    /// rebalanced. Returns false when there is no primary to start from.
    pub fn configure(&mut self, version: &str, percent: u32) -> bool {
        let Some(primary) = self.primary.take() else {
            return false;
        };
        let rest = 100.0 - f64::from(percent.min(100));
        self.primary = Some(VersionTraffic::new(version, f64::from(percent.min(100))));
        if primary.version != version {
            self.secondary = Some(VersionTraffic::new(primary.version, rest));
        } else if let Some(secondary) = self.secondary.as_mut() {
            secondary.percent = rest;
        }
        true
    }
}

/// Alias weight (0.0..=1.0) to percent
pub fn weight_to_percent(weight: f64) -> f64 {
    weight * 100.0
}

/// Percent to alias weight (0.0..=1.0)
pub fn percent_to_weight(percent: f64) -> f64 {
    percent / 100.0
}

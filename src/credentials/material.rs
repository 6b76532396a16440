use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key material for one chat account, persisted as the primary credential artifact.
///
/// The transport owns the meaning of `keys`; the store only moves the
/// material between memory, disk and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Empty material for an unpaired device
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Material for a device that completed pairing
    pub fn paired(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            registered: true,
            keys: BTreeMap::new(),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(name.into(), value.into());
        self.updated_at = Some(Utc::now());
        self
    }

    pub fn is_registered(&self) -> bool {
        self.registered && self.account_id.is_some()
    }
}

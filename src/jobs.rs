//! Job payloads and their per-kind rules.
//!
//! A [`Job`] ties a payload type to the queue it is published on, the
//! validation it must pass before publishing, and the dedup key guarding it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::dedup::DedupKey;

/// A payload that can be enqueued through the [`Producer`](crate::Producer).
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue the job is published on.
    const QUEUE: &'static str;

    /// Check and normalize the payload before it is published.
    fn validate(&mut self) -> Result<(), Rejected> {
        Ok(())
    }

    /// Key of the marker guarding this entity, if the kind is deduplicated.
    fn dedup_key(&self) -> Option<DedupKey> {
        None
    }

    /// Whether this particular payload must be published even if a marker exists.
    fn bypasses_dedup(&self) -> bool {
        false
    }
}

/// Reason a job was refused before publishing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("invalid {kind} id: {id}")]
    InvalidId { kind: &'static str, id: String },
    #[error("bots can't queue refreshes")]
    Bot,
}

pub const APPS: &str = "apps";
pub const PACKAGES: &str = "packages";
pub const BUNDLES: &str = "bundles";
pub const PLAYERS: &str = "players";
pub const GROUPS: &str = "groups";
pub const CHANGES: &str = "changes";

/// Refresh one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessage {
    pub id: u32,
    /// Set when triggered by the change feed; such refreshes skip the dedup check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<u32>,
}

impl Job for AppMessage {
    const QUEUE: &'static str = APPS;

    fn validate(&mut self) -> Result<(), Rejected> {
        non_zero("app", self.id)
    }

    fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey::new("app", self.id))
    }

    fn bypasses_dedup(&self) -> bool {
        self.change_number.is_some()
    }
}

/// Refresh one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMessage {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<u32>,
}

impl Job for PackageMessage {
    const QUEUE: &'static str = PACKAGES;

    fn validate(&mut self) -> Result<(), Rejected> {
        non_zero("package", self.id)
    }

    fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey::new("package", self.id))
    }

    fn bypasses_dedup(&self) -> bool {
        self.change_number.is_some()
    }
}

/// Refresh one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMessage {
    pub id: u32,
}

impl Job for BundleMessage {
    const QUEUE: &'static str = BUNDLES;

    fn validate(&mut self) -> Result<(), Rejected> {
        non_zero("bundle", self.id)
    }

    fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey::new("bundle", self.id))
    }
}

/// Refresh one player profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerMessage {
    /// 64-bit SteamID. A 32-bit account id is accepted and converted.
    pub id: u64,
    #[serde(default)]
    pub skip_groups: bool,
    #[serde(default)]
    pub skip_achievements: bool,
    /// User agent of the web request that asked for the refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Job for PlayerMessage {
    const QUEUE: &'static str = PLAYERS;

    fn validate(&mut self) -> Result<(), Rejected> {
        reject_bots(self.user_agent.as_deref())?;
        self.id = steam_id(self.id).ok_or_else(|| Rejected::InvalidId {
            kind: "player",
            id: self.id.to_string(),
        })?;
        Ok(())
    }

    fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey::new("player", self.id))
    }
}

/// Refresh one Steam group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Numeric group id, kept as text since 64-bit ids are common.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Job for GroupMessage {
    const QUEUE: &'static str = GROUPS;

    fn validate(&mut self) -> Result<(), Rejected> {
        reject_bots(self.user_agent.as_deref())?;
        let valid = (1..=18).contains(&self.id.len()) && self.id.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(Rejected::InvalidId {
                kind: "group",
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey::new("group", &self.id))
    }
}

/// A batch from the change feed: entity id to change number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesMessage {
    #[serde(default)]
    pub app_ids: BTreeMap<u32, u32>,
    #[serde(default)]
    pub package_ids: BTreeMap<u32, u32>,
}

impl Job for ChangesMessage {
    const QUEUE: &'static str = CHANGES;
}

fn non_zero(kind: &'static str, id: u32) -> Result<(), Rejected> {
    if id == 0 {
        return Err(Rejected::InvalidId {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

const CRAWLERS: &[&str] = &[
    "bot", "crawl", "slurp", "spider", "google", "msn", "bing", "yahoo", "jeeves", "facebook",
];

/// Whether a user agent looks like a crawler.
pub fn is_bot(user_agent: &str) -> bool {
    let user_agent = user_agent.to_ascii_lowercase();
    CRAWLERS.iter().any(|needle| user_agent.contains(needle))
}

fn reject_bots(user_agent: Option<&str>) -> Result<(), Rejected> {
    match user_agent {
        Some(agent) if is_bot(agent) => Err(Rejected::Bot),
        _ => Ok(()),
    }
}

// Public universe, individual account, desktop instance.
const INDIVIDUAL_BASE: u64 = 0x0110_0001_0000_0000;

/// Normalize a player id to a 64-bit individual SteamID.
///
/// Returns `None` for ids that are neither a 32-bit account id nor an
/// individual SteamID.
pub fn steam_id(id: u64) -> Option<u64> {
    match id {
        0 => None,
        account if account <= u64::from(u32::MAX) => Some(INDIVIDUAL_BASE + account),
        full if (INDIVIDUAL_BASE + 1..=INDIVIDUAL_BASE + u64::from(u32::MAX)).contains(&full) => Some(full),
        _ => None,
    }
}

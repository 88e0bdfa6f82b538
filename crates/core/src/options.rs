//! Options accepted by the find family of store operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a fetched collection lands in the type cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Replace the cached list+map and mark the type complete.
    #[default]
    All,
    /// Merge into the cache without clearing it or marking it complete.
    Multi,
    /// Decorate and return, cache untouched.
    None,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindOptions {
    /// Bypass the cache and refetch.
    pub force: bool,
    pub load: LoadMode,
    /// `field path -> value`, sent as `filter=<path>=<value>`.
    pub filter: BTreeMap<String, String>,
    pub limit: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    /// Start a watch after a cached load.
    pub watch: bool,
    /// Narrow the follow-up watch to one namespace.
    pub watch_namespace: Option<String>,
    /// Re-issue the watch even if it is started or in error.
    pub force_watch: bool,
    /// Explicit URL overriding the schema's collection link.
    pub url: Option<String>,
    /// Follow `has_more` cursors until the collection is complete.
    pub depaginate: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            force: false,
            load: LoadMode::All,
            filter: BTreeMap::new(),
            limit: None,
            sort_by: None,
            sort_order: SortOrder::Asc,
            watch: true,
            watch_namespace: None,
            force_watch: false,
            url: None,
            depaginate: true,
        }
    }
}

impl FindOptions {
    pub fn forced() -> Self {
        Self { force: true, ..Self::default() }
    }
}

//! Interfaces to systems outside the runtime

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::personas::PersonaRecord;
use crate::routing::RouteTableConfig;

/// Supplies persona records and the path table, at startup and on reload
pub trait ConfigSource: Send + Sync {
    fn persona_records(&self) -> Result<Vec<PersonaRecord>>;

    fn route_table(&self) -> Result<RouteTableConfig>;
}

/// Fetches a user's account data from the owning service
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<BTreeMap<String, Value>>;
}

/// What an opaque entry parameter decodes to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryParams {
    #[serde(default, alias = "UserId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "Path")]
    pub path: Option<String>,
}

/// Decrypts the opaque parameter a host page passes when opening a chat
pub trait ParamDecoder: Send + Sync {
    fn decode(&self, param: &str) -> Result<EntryParams>;
}

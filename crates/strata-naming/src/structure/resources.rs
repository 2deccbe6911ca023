//! Resource kinds stored per project

#![allow(missing_docs)]

use super::Resource;
use serde::{Deserialize, Serialize};

macro_rules! resource {
    ($ty:ident, $path:literal) => {
        impl Resource for $ty {
            const PATH_VARIABLE: &'static str = $path;

            fn id(&self) -> &str {
                &self.id
            }

            fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

/// Key/value database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Database {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Database path or pattern
    #[serde(rename = "match")]
    pub matcher: String,
    pub regex: bool,
    pub local: bool,
    pub min: u64,
    pub max: u64,
    pub size: u64,
}
resource!(Database, "databases");

/// Domain with its certificate settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub fqdn: String,
    pub cert_type: String,
    pub cert_file: String,
    pub key_file: String,
}
resource!(Domain, "domains");

/// Serverless function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Function {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Trigger kind, e.g. `http` or `pubsub`
    #[serde(rename = "type")]
    pub trigger: String,
    pub method: String,
    pub domains: Vec<String>,
    pub paths: Vec<String>,
    pub source: String,
    pub call: String,
    /// Milliseconds
    pub timeout: u64,
    /// Bytes
    pub memory: u64,
    pub secure: bool,
}
resource!(Function, "functions");

/// Code library built from a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Library {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub provider: String,
    pub repo_id: String,
    pub repo_name: String,
    pub branch: String,
}
resource!(Library, "libraries");

/// Pub/sub channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Messaging {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(rename = "match")]
    pub matcher: String,
    pub regex: bool,
    pub local: bool,
    pub mqtt: bool,
    pub websocket: bool,
}
resource!(Messaging, "messaging");

/// Named protocol service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub protocol: String,
}
resource!(Service, "services");

/// Smart operator run ahead of other resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmartOp {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub source: String,
    pub call: String,
    pub timeout: u64,
    pub memory: u64,
}
resource!(SmartOp, "smartops");

/// Object storage bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Storage {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(rename = "match")]
    pub matcher: String,
    pub regex: bool,
    /// `object` or `streaming`
    #[serde(rename = "type")]
    pub kind: String,
    pub public: bool,
    pub size: u64,
    pub ttl: u64,
}
resource!(Storage, "storages");

/// Static website served from a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Website {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub domains: Vec<String>,
    pub paths: Vec<String>,
    pub provider: String,
    pub repo_id: String,
    pub repo_name: String,
    pub branch: String,
}
resource!(Website, "websites");

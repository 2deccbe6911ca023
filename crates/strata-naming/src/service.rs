//! Server side of the naming protocol
//!
//! [`NamingService`] answers the naming RPC surface from one replicated
//! store. Values are stored as JSON under the canonical key of their path.
//! Fetching a path with no value of its own assembles a nested map from the
//! keys below it, so `fetch(/a)` after `push(/a/b, 1)` yields `{"b": 1}`.

use crate::client::command;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_core::effects::{body, Body, BodyExt, RequestHandler};
use strata_core::{DatabaseStats, Path, Result, StrataError, Value};
use strata_kvdb::ReplicaDatabase;
use tracing::debug;

/// Naming request handler backed by a replica
pub struct NamingService {
    database: Arc<ReplicaDatabase>,
}

impl NamingService {
    /// Serve naming requests from `database`
    pub fn new(database: Arc<ReplicaDatabase>) -> Self {
        Self { database }
    }

    /// Backing replica
    pub fn database(&self) -> &Arc<ReplicaDatabase> {
        &self.database
    }

    async fn push(&self, request: &Body) -> Result<Body> {
        let path = path_field(request)?;
        if path.is_empty() {
            return Err(StrataError::invalid("cannot push to the empty path"));
        }
        let data = request.field("data")?;
        self.database
            .put(&path.to_key(), serde_json::to_vec(data)?)
            .await?;
        debug!(path = %path, "Pushed");
        Ok(body([("pushed", Value::from(true))]))
    }

    async fn fetch(&self, request: &Body) -> Result<Body> {
        let path = path_field(request)?;
        let object = if path.is_empty() {
            self.assemble(&path).await?
        } else {
            match self.database.get(&path.to_key()).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes)?,
                Err(err) if err.is_not_found() => self.assemble(&path).await?,
                Err(err) => return Err(err),
            }
        };
        Ok(body([("object", object)]))
    }

    /// Nested map of every value stored below `path`, or null
    async fn assemble(&self, path: &Path) -> Result<Value> {
        let prefix = if path.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", path.to_key())
        };
        let mut keys = self.database.list(&prefix).await?;
        if keys.is_empty() {
            return Ok(Value::null());
        }
        // Shallow keys first so deeper ones nest into them
        keys.sort();

        let mut root = BTreeMap::new();
        for key in keys {
            let child = Path::parse(&key);
            let Some(rest) = child.strip_prefix(path) else {
                continue;
            };
            let value = match self.database.get(&key).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes)?,
                // Deleted while listing
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            insert_nested(&mut root, rest, value);
        }
        Ok(Value::from(root))
    }

    async fn lookup(&self, request: &Body) -> Result<Body> {
        let prefix = request.string_array("prefix")?;
        let mut keys = if request.bool_field("regex")? {
            self.database.list_regex("/", &prefix).await?
        } else {
            self.database.list(&Path::from(prefix).to_key()).await?
        };
        keys.sort();
        Ok(body([("keys", Value::from(keys))]))
    }

    async fn list(&self, request: &Body) -> Result<Body> {
        let depth = request.int_field("depth")?;
        let depth = usize::try_from(depth)
            .map_err(|_| StrataError::invalid(format!("invalid depth {depth}")))?;
        let keys: BTreeSet<String> = self
            .database
            .list("/")
            .await?
            .iter()
            .map(|key| Path::parse(key).truncate(depth).to_key())
            .collect();
        Ok(body([("keys", Value::from(keys.into_iter().collect::<Vec<_>>()))]))
    }

    fn stats(&self, request: &Body) -> Result<Body> {
        let action = request
            .field("action")?
            .as_str()
            .ok_or_else(|| StrataError::invalid("field `action` is not a string"))?;
        if action != command::STATS_DB {
            return Err(StrataError::invalid(format!("unknown stats action `{action}`")));
        }
        let stats = DatabaseStats::from_store(&self.database.stats()).encode()?;
        Ok(body([("stats", Value::from(stats))]))
    }
}

#[async_trait]
impl RequestHandler for NamingService {
    async fn handle(&self, name: &str, request: Body) -> Result<Body> {
        match name {
            command::PUSH => self.push(&request).await,
            command::FETCH => self.fetch(&request).await,
            command::LOOKUP => self.lookup(&request).await,
            command::LIST => self.list(&request).await,
            command::STATS => self.stats(&request),
            other => Err(StrataError::invalid(format!("unknown command `{other}`"))),
        }
    }
}

fn path_field(request: &Body) -> Result<Path> {
    Ok(Path::from(request.string_array("path")?))
}

/// Store `value` at `segments` below `map`, turning leaves in the way into maps
fn insert_nested(map: &mut BTreeMap<String, Value>, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.clone(), value);
        return;
    }
    let slot = map
        .entry(first.clone())
        .or_insert_with(|| Value::Map(BTreeMap::new()));
    if !matches!(slot, Value::Map(_)) {
        *slot = Value::Map(BTreeMap::new());
    }
    if let Value::Map(child) = slot {
        insert_nested(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_insertion_builds_maps() {
        let mut root = BTreeMap::new();
        insert_nested(&mut root, &["a".into(), "b".into()], Value::from(1));
        insert_nested(&mut root, &["a".into(), "c".into()], Value::from(2));
        insert_nested(&mut root, &["d".into()], Value::from("x"));

        let a = root["a"].as_map().unwrap();
        assert_eq!(a["b"], Value::from(1));
        assert_eq!(a["c"], Value::from(2));
        assert_eq!(root["d"], Value::from("x"));
    }

    #[test]
    fn deeper_keys_replace_leaves() {
        let mut root = BTreeMap::new();
        insert_nested(&mut root, &["a".into()], Value::from(1));
        insert_nested(&mut root, &["a".into(), "b".into()], Value::from(2));
        assert_eq!(root["a"].get("b"), Some(&Value::from(2)));
    }
}

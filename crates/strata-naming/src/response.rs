//! Fetched values bound to their path and client

use crate::client::NamingClient;
use crate::keys::{current_path, IndexEntry};
use serde::de::DeserializeOwned;
use strata_core::{Path, Result, StrataError, Value};
use tracing::debug;

/// A fetched value together with the path it came from
#[derive(Clone)]
pub struct ResponseObject {
    path: Path,
    value: Value,
    client: NamingClient,
}

impl std::fmt::Debug for ResponseObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseObject")
            .field("path", &self.path)
            .field("value", &self.value)
            .finish()
    }
}

impl ResponseObject {
    pub(crate) fn new(path: Path, value: Value, client: NamingClient) -> Self {
        Self {
            path,
            value,
            client,
        }
    }

    /// Path the value was fetched from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw value
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Take the raw value
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Value with nested path references flattened to their key strings
    pub fn interface(&self) -> Value {
        self.value.flatten()
    }

    /// Decode into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.value.decode()
    }

    /// Resolve an index of resource keys to the live keys of the first
    /// branch in `branches` whose current commit can be read.
    ///
    /// All index entries must belong to one project.
    pub async fn current(&self, branches: &[&str]) -> Result<Vec<Path>> {
        let entries = self.index_entries()?;
        let Some(project) = entries.first().map(|entry| entry.project.clone()) else {
            return Err(StrataError::not_found(format!(
                "index at {} is empty",
                self.path
            )));
        };
        if let Some(stray) = entries.iter().find(|entry| entry.project != project) {
            return Err(StrataError::consistency(format!(
                "unexpected project `{}` in index at {}, expected `{project}`",
                stray.project, self.path
            )));
        }

        for branch in branches {
            let commit = match self.client.fetch(&current_path(&project, branch)).await {
                Ok(pointer) => match pointer.value().as_str() {
                    Some(commit) if !commit.is_empty() => commit.to_string(),
                    _ => {
                        debug!(project = %project, branch = %branch, "Branch has no current commit");
                        continue;
                    }
                },
                Err(err) => {
                    debug!(project = %project, branch = %branch, error = %err, "Reading current commit failed");
                    continue;
                }
            };
            return Ok(entries
                .iter()
                .map(|entry| entry.at(branch, &commit))
                .collect());
        }

        Err(StrataError::not_found(format!(
            "no current paths for project `{project}` on branches {branches:?}"
        )))
    }

    fn index_entries(&self) -> Result<Vec<IndexEntry>> {
        let keys = self.interface().as_string_array().ok_or_else(|| {
            StrataError::malformed(format!(
                "value at {} is not a list of resource keys",
                self.path
            ))
        })?;
        keys.iter().map(|key| IndexEntry::parse(key)).collect()
    }
}

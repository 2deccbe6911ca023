//! Typed, project-scoped views over versioned resources
//!
//! An [`Accessor`] is bound to one resource kind through its
//! [`Resource::PATH_VARIABLE`]. Scoping it to a project and branch yields a
//! [`Scope`], which reads the branch's current commit and lists resources
//! stored at
//!
//! ```text
//! projects/{project}/branches/{branch}/commit/{commit}/[applications/{app}/]{PATH_VARIABLE}/{id}
//! ```
//!
//! Global resources live at project level, relative ones under an
//! application; `all` is the union, global first.

mod resources;

pub use resources::{
    Database, Domain, Function, Library, Messaging, Service, SmartOp, Storage, Website,
};

use crate::client::NamingClient;
use crate::keys::{commit_base, current_path};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use strata_core::{Path, Result, StrataError, Value};
use tracing::debug;

/// Field every stored resource carries its id in
pub const ID_FIELD: &str = "id";

/// A kind of project resource
pub trait Resource: DeserializeOwned + Send + Sync + 'static {
    /// Path segment grouping resources of this kind
    const PATH_VARIABLE: &'static str;

    /// Resource id
    fn id(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str;
}

/// Entry point of typed lookups for one resource kind
pub struct Accessor<T> {
    client: NamingClient,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _kind: PhantomData,
        }
    }
}

impl<T: Resource> Accessor<T> {
    pub(crate) fn new(client: NamingClient) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    /// Project-level and application-level resources together
    pub fn all(&self, project: &str, application: &str, branch: &str) -> Scope<T> {
        self.scope(project, branch, Some(application), Extent::All)
    }

    /// Project-level resources only
    pub fn global(&self, project: &str, branch: &str) -> Scope<T> {
        self.scope(project, branch, None, Extent::Global)
    }

    /// Resources of one application only
    pub fn relative(&self, project: &str, application: &str, branch: &str) -> Scope<T> {
        self.scope(project, branch, Some(application), Extent::Relative)
    }

    fn scope(
        &self,
        project: &str,
        branch: &str,
        application: Option<&str>,
        extent: Extent,
    ) -> Scope<T> {
        Scope {
            client: self.client.clone(),
            project: project.to_string(),
            branch: branch.to_string(),
            application: application.map(str::to_string),
            extent,
            _kind: PhantomData,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    All,
    Global,
    Relative,
}

/// Resources of one kind within a project, branch and optional application
pub struct Scope<T> {
    client: NamingClient,
    project: String,
    branch: String,
    application: Option<String>,
    extent: Extent,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> Scope<T> {
    /// Commit the branch currently points at
    pub async fn commit(&self) -> Result<String> {
        let pointer = self
            .client
            .fetch(&current_path(&self.project, &self.branch))
            .await?;
        match pointer.value().as_str() {
            Some(commit) if !commit.is_empty() => Ok(commit.to_string()),
            _ => Err(StrataError::not_found(format!(
                "no current commit for project `{}` on branch `{}`",
                self.project, self.branch
            ))),
        }
    }

    /// Every resource in scope, global ones first, each group ordered by id
    pub async fn list(&self) -> Result<Vec<T>> {
        let commit = self.commit().await?;
        let mut resources = Vec::new();
        for base in self.bases(&commit) {
            resources.extend(self.list_at(&base.join(T::PATH_VARIABLE)).await?);
        }
        Ok(resources)
    }

    /// Resource with the given id
    pub async fn get_by_id(&self, id: &str) -> Result<T> {
        self.find(|resource| resource.id() == id, || format!("id `{id}`"))
            .await
    }

    /// First resource with the given name
    pub async fn get_by_name(&self, name: &str) -> Result<T> {
        self.find(|resource| resource.name() == name, || format!("name `{name}`"))
            .await
    }

    async fn find(
        &self,
        matches: impl Fn(&T) -> bool,
        describe: impl FnOnce() -> String,
    ) -> Result<T> {
        self.list()
            .await?
            .into_iter()
            .find(|resource| matches(resource))
            .ok_or_else(|| {
                StrataError::not_found(format!(
                    "no {} with {} in project `{}`",
                    T::PATH_VARIABLE,
                    describe(),
                    self.project
                ))
            })
    }

    fn bases(&self, commit: &str) -> Vec<Path> {
        let global = || commit_base(&self.project, &self.branch, commit, None);
        let relative = || {
            self.application
                .as_deref()
                .map(|app| commit_base(&self.project, &self.branch, commit, Some(app)))
        };
        match self.extent {
            Extent::Global => vec![global()],
            Extent::Relative => relative().into_iter().collect(),
            Extent::All => std::iter::once(global()).chain(relative()).collect(),
        }
    }

    async fn list_at(&self, path: &Path) -> Result<Vec<T>> {
        let object = self.client.fetch(path).await?;
        let value = object.value();
        if value.is_null() {
            debug!(path = %path, "No resources stored");
            return Ok(Vec::new());
        }
        let entries = value.as_map().ok_or_else(|| {
            StrataError::malformed(format!("resources at {path} are not a map"))
        })?;

        entries
            .iter()
            .map(|(id, entry)| with_id(id, entry).decode())
            .collect()
    }
}

/// `entry` with its id field filled from the key when absent
fn with_id(id: &str, entry: &Value) -> Value {
    match entry {
        Value::Map(fields) if !fields.contains_key(ID_FIELD) => {
            let mut fields = fields.clone();
            fields.insert(ID_FIELD.to_string(), Value::from(id));
            Value::Map(fields)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_ids_are_taken_from_the_key() {
        let entry = Value::from(BTreeMap::from([(
            "name".to_string(),
            Value::from("site"),
        )]));
        let website: Website = with_id("w1", &entry).decode().unwrap();
        assert_eq!(website.id, "w1");
        assert_eq!(website.name, "site");
    }

    #[test]
    fn stored_ids_win() {
        let entry = Value::from(BTreeMap::from([
            ("id".to_string(), Value::from("stored")),
            ("name".to_string(), Value::from("db")),
        ]));
        let database: Database = with_id("key", &entry).decode().unwrap();
        assert_eq!(database.id, "stored");
    }
}

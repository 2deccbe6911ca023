//! Key layout of versioned project resources
//!
//! ```text
//! projects/{project}/branches/{branch}/current
//! projects/{project}/branches/{branch}/commit/{commit}/[applications/{app}/]{resourceType}/{id}
//! ```
//!
//! The `current` key holds the commit a branch currently points at. Index
//! entries are resource keys written at some commit; resolving them against
//! another branch substitutes that branch and its current commit.

use std::fmt;
use strata_core::{Path, Result, StrataError};

/// Leading segment of every project key
pub const PROJECTS: &str = "projects";
/// Segment introducing the branch name
pub const BRANCHES: &str = "branches";
/// Segment introducing the commit id
pub const COMMIT: &str = "commit";
/// Segment introducing the application id
pub const APPLICATIONS: &str = "applications";
/// Name of the branch pointer key
pub const CURRENT: &str = "current";

/// Key of the commit pointer for `branch` of `project`
pub fn current_path(project: &str, branch: &str) -> Path {
    Path::from([PROJECTS, project, BRANCHES, branch, CURRENT])
}

/// Root of the resources at `commit`, optionally scoped to an application
pub fn commit_base(project: &str, branch: &str, commit: &str, application: Option<&str>) -> Path {
    let base = Path::from([PROJECTS, project, BRANCHES, branch, COMMIT, commit]);
    match application {
        Some(app) => base.join(APPLICATIONS).join(app),
        None => base,
    }
}

/// Key of one resource
pub fn resource_path(
    project: &str,
    branch: &str,
    commit: &str,
    application: Option<&str>,
    resource_type: &str,
    id: &str,
) -> Path {
    commit_base(project, branch, commit, application)
        .join(resource_type)
        .join(id)
}

/// A resource key parsed back into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Project id
    pub project: String,
    /// Branch the key was written on
    pub branch: String,
    /// Commit the key was written at
    pub commit: String,
    /// Application, for application-scoped resources
    pub application: Option<String>,
    /// Path variable of the resource kind, e.g. `functions`
    pub resource_type: String,
    /// Resource id
    pub resource: String,
}

impl IndexEntry {
    /// Parse a resource key
    pub fn parse(key: &str) -> Result<Self> {
        let path = Path::parse(key);
        let segments: Vec<&str> = path.segments().iter().map(String::as_str).collect();
        let invalid = || StrataError::malformed(format!("`{key}` is not a resource key"));

        let (project, branch, commit, rest) = match segments.as_slice() {
            [PROJECTS, project, BRANCHES, branch, COMMIT, commit, rest @ ..] => {
                (*project, *branch, *commit, rest)
            }
            _ => return Err(invalid()),
        };
        let (application, resource_type, resource) = match rest {
            [resource_type, resource] => (None, *resource_type, *resource),
            [APPLICATIONS, app, resource_type, resource] => {
                (Some((*app).to_string()), *resource_type, *resource)
            }
            _ => return Err(invalid()),
        };

        Ok(Self {
            project: project.to_string(),
            branch: branch.to_string(),
            commit: commit.to_string(),
            application,
            resource_type: resource_type.to_string(),
            resource: resource.to_string(),
        })
    }

    /// The same resource on `branch` at `commit`
    pub fn at(&self, branch: &str, commit: &str) -> Path {
        resource_path(
            &self.project,
            branch,
            commit,
            self.application.as_deref(),
            &self.resource_type,
            &self.resource,
        )
    }

    /// Key this entry was parsed from
    pub fn path(&self) -> Path {
        self.at(&self.branch, &self.commit)
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn layout() {
        assert_eq!(
            current_path("p1", "main").to_key(),
            "/projects/p1/branches/main/current"
        );
        assert_eq!(
            resource_path("p1", "main", "c1", Some("app"), "functions", "f1").to_key(),
            "/projects/p1/branches/main/commit/c1/applications/app/functions/f1"
        );
    }

    #[test]
    fn parse_global_and_application_keys() {
        let global = IndexEntry::parse("/projects/p1/branches/main/commit/c1/websites/w1").unwrap();
        assert_eq!(global.application, None);
        assert_eq!(global.resource_type, "websites");
        assert_eq!(global.at("dev", "c9").to_key(), "/projects/p1/branches/dev/commit/c9/websites/w1");

        let scoped =
            IndexEntry::parse("projects/p1/branches/main/commit/c1/applications/a1/functions/f1")
                .unwrap();
        assert_eq!(scoped.application.as_deref(), Some("a1"));
        assert_eq!(scoped.path(), Path::parse(&scoped.to_string()));
    }

    #[test]
    fn rejects_other_shapes() {
        assert_matches!(
            IndexEntry::parse("/projects/p1/branches/main/current"),
            Err(StrataError::MalformedResponse { .. })
        );
        assert_matches!(
            IndexEntry::parse("/projects/p1/branches/main/commit/c1/applications/a1/functions"),
            Err(StrataError::MalformedResponse { .. })
        );
        assert!(IndexEntry::parse("").is_err());
    }
}

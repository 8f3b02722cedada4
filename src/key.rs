//! Cache key construction.
//!
//! Keys have the shape `{provider}/{owner}/{repo}[/{path}][#{ref}]`.  A single
//! trailing `/` on `path` is dropped so `libs/core/` and `libs/core` share an
//! entry.  Separator characters inside `path` or `ref` are not escaped.

use serde::Deserialize;

/// Optional location of the manifest inside a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ManifestQuery {
    /// Commit, branch or tag.  Defaults to the repository's default branch.
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    /// Directory holding the `package.json`, relative to the repo root.
    #[serde(default)]
    pub path: Option<String>,
}

impl ManifestQuery {
    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// `path` with one trailing slash removed; `None` when absent or empty.
    pub fn normalized_path(&self) -> Option<&str> {
        let path = self.path.as_deref().filter(|p| !p.is_empty())?;
        Some(path.strip_suffix('/').unwrap_or(path))
    }

    /// `ref`, treating an empty string as absent.
    pub fn git_ref(&self) -> Option<&str> {
        self.git_ref.as_deref().filter(|r| !r.is_empty())
    }
}

/// Build the cache key for a manifest lookup.
pub fn cache_key(provider: &str, owner: &str, repo: &str, query: &ManifestQuery) -> String {
    let mut key = format!("{provider}/{owner}/{repo}");
    if let Some(path) = query.normalized_path() {
        key.push('/');
        key.push_str(path);
    }
    if let Some(git_ref) = query.git_ref() {
        key.push('#');
        key.push_str(git_ref);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_repo_key() {
        assert_eq!(
            cache_key("gh", "acme", "widgets", &ManifestQuery::default()),
            "gh/acme/widgets"
        );
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let with_slash = ManifestQuery::default().with_path("libs/core/");
        let without = ManifestQuery::default().with_path("libs/core");
        assert_eq!(
            cache_key("gh", "o", "r", &with_slash),
            cache_key("gh", "o", "r", &without)
        );
        assert_eq!(cache_key("gh", "o", "r", &without), "gh/o/r/libs/core");
    }

    #[test]
    fn only_one_trailing_slash_is_stripped() {
        let query = ManifestQuery::default().with_path("libs//");
        assert_eq!(cache_key("gh", "o", "r", &query), "gh/o/r/libs/");
    }

    #[test]
    fn ref_is_appended_after_hash() {
        let query = ManifestQuery::default().with_ref("main");
        assert_eq!(cache_key("gh", "o", "r", &query), "gh/o/r#main");
    }

    #[test]
    fn path_and_ref_combine() {
        let query = ManifestQuery::default()
            .with_path("packages/ui/")
            .with_ref("v1.2.0");
        assert_eq!(cache_key("gh", "o", "r", &query), "gh/o/r/packages/ui#v1.2.0");
    }

    #[test]
    fn empty_components_are_ignored() {
        let query = ManifestQuery {
            git_ref: Some(String::new()),
            path: Some(String::new()),
        };
        assert_eq!(cache_key("gh", "o", "r", &query), "gh/o/r");
    }

    #[test]
    fn distinct_targets_do_not_collide() {
        let keys = [
            cache_key("gh", "o", "r", &ManifestQuery::default()),
            cache_key("gh", "o", "r", &ManifestQuery::default().with_ref("dev")),
            cache_key("gh", "o", "r", &ManifestQuery::default().with_path("dev")),
            cache_key("gh", "o", "r2", &ManifestQuery::default()),
            cache_key("gh", "o2", "r", &ManifestQuery::default()),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn query_deserializes_ref_field() {
        let query: ManifestQuery =
            serde_json::from_str(r#"{"ref":"main","path":"libs"}"#).unwrap();
        assert_eq!(query.git_ref(), Some("main"));
        assert_eq!(query.normalized_path(), Some("libs"));
    }
}

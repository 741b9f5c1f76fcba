//! Project registration requests.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use servcur_state::{ProjectKey, ProjectKind};

use super::error::{CoreError, CoreResult};

/// Credentials for fetching a project's sources.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitAuth {
    #[default]
    None,
    /// Access token spliced into the clone URL as percent-encoded userinfo.
    Token(String),
}

impl fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitAuth::None => f.write_str("None"),
            GitAuth::Token(_) => f.write_str("Token(***)"),
        }
    }
}

impl GitAuth {
    /// Clone URL with credentials applied.
    pub fn apply(&self, https_url: &str) -> CoreResult<String> {
        let rest = https_url
            .strip_prefix("https://")
            .ok_or_else(|| CoreError::InvalidRequest("not an https git url".to_string()))?;
        match self {
            GitAuth::None => Ok(https_url.to_string()),
            GitAuth::Token(token) => {
                // Drop any userinfo already present in the authority.
                let authority_end = rest.find('/').unwrap_or(rest.len());
                let rest = match rest[..authority_end].rfind('@') {
                    Some(at) => &rest[at + 1..],
                    None => rest,
                };
                Ok(format!("https://{}@{rest}", urlencoding::encode(token)))
            }
        }
    }

    /// Replace the secret in `text` so it can be logged or returned.
    pub fn redact(&self, text: &str) -> String {
        match self {
            GitAuth::Token(token) if !token.is_empty() => text
                .replace(token.as_str(), "***")
                .replace(urlencoding::encode(token).as_ref(), "***"),
            _ => text.to_string(),
        }
    }
}

/// Request to declare a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub branch: String,
    /// Source repository; without one the checkout directory starts empty.
    #[serde(default)]
    pub https_url: Option<String>,
    #[serde(default)]
    pub auth: GitAuth,
    #[serde(default)]
    pub kind: ProjectKind,
}

impl NewProject {
    pub fn key(&self) -> ProjectKey {
        ProjectKey::new(&self.name, &self.branch)
    }

    pub fn validate(&self) -> CoreResult<()> {
        validate_key(&self.name, &self.branch)?;
        if let Some(url) = &self.https_url {
            if !url.starts_with("https://") || url.len() == "https://".len() {
                return Err(CoreError::InvalidRequest(
                    "not an https git url".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Check that `(name, branch)` is safe to use as a path and as git arguments.
pub fn validate_key(name: &str, branch: &str) -> CoreResult<()> {
    if name.trim().is_empty() || branch.trim().is_empty() {
        return Err(CoreError::InvalidRequest(
            "project name and branch must not be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(CoreError::InvalidRequest(format!(
            "invalid project name: {name}"
        )));
    }
    if name.contains("..") || branch.contains("..") || branch.contains('\\') {
        return Err(CoreError::InvalidRequest(format!(
            "invalid project key: {name}/{branch}"
        )));
    }
    if name.starts_with('-') || branch.starts_with('-') {
        return Err(CoreError::InvalidRequest(format!(
            "project name and branch must not start with '-': {name}/{branch}"
        )));
    }
    if !is_relative_segments(name) || !is_relative_segments(branch) {
        return Err(CoreError::InvalidRequest(format!(
            "project name and branch must be plain relative paths: {name}/{branch}"
        )));
    }
    Ok(())
}

/// Every component is a normal segment, so joining it under a base directory
/// stays below that directory. Rejects absolute paths, `.`, and empty
/// segments such as `a//b` or a trailing `/`.
fn is_relative_segments(s: &str) -> bool {
    let path = Path::new(s);
    path.components().all(|c| matches!(c, Component::Normal(_)))
        && s.split('/').all(|segment| !segment.is_empty() && segment != ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_project(name: &str, branch: &str, url: Option<&str>) -> NewProject {
        NewProject {
            name: name.to_string(),
            branch: branch.to_string(),
            https_url: url.map(str::to_string),
            auth: GitAuth::None,
            kind: ProjectKind::default(),
        }
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(new_project("web", "main", None).validate().is_ok());
        assert!(new_project("web", "feature/x", None).validate().is_ok());
        for (name, branch) in [
            ("", "main"),
            ("web", " "),
            ("a/b", "main"),
            ("a\\b", "main"),
            ("..", "main"),
            ("web", "../etc"),
            ("web", "--upload-pack=x"),
            ("web", "/tmp/victim"),
            ("/tmp", "main"),
            ("web", "."),
            ("web", "a/./b"),
            ("web", "a//b"),
            ("web", "feature/"),
        ] {
            let err = new_project(name, branch, None).validate().unwrap_err();
            assert_eq!(err.kind(), crate::domain::ErrorKind::InvalidRequest, "{name}/{branch}");
        }
    }

    #[test]
    fn rejects_non_https_urls() {
        assert!(new_project("web", "main", Some("https://git.example.com/web.git"))
            .validate()
            .is_ok());
        assert!(new_project("web", "main", Some("git@github.com:x/y.git"))
            .validate()
            .is_err());
        assert!(new_project("web", "main", Some("http://x/y")).validate().is_err());
    }

    #[test]
    fn token_is_spliced_into_authority() {
        let auth = GitAuth::Token("s3cret".into());
        assert_eq!(
            auth.apply("https://github.com/acme/web.git").unwrap(),
            "https://s3cret@github.com/acme/web.git"
        );
        assert_eq!(
            auth.apply("https://old@github.com/acme/web.git").unwrap(),
            "https://s3cret@github.com/acme/web.git"
        );
        assert_eq!(
            GitAuth::None.apply("https://github.com/a.git").unwrap(),
            "https://github.com/a.git"
        );
    }

    #[test]
    fn token_is_percent_encoded_in_userinfo() {
        let auth = GitAuth::Token("ab@c:d/e".into());
        assert_eq!(
            auth.apply("https://github.com/acme/web.git").unwrap(),
            "https://ab%40c%3Ad%2Fe@github.com/acme/web.git"
        );
        let msg = auth.redact("fatal: https://ab%40c%3Ad%2Fe@github.com/acme/web.git");
        assert_eq!(msg, "fatal: https://***@github.com/acme/web.git");
    }

    #[test]
    fn token_never_appears_in_debug_or_redacted_text() {
        let auth = GitAuth::Token("s3cret".into());
        assert!(!format!("{auth:?}").contains("s3cret"));
        let msg = auth.redact("fatal: could not read https://s3cret@github.com/a.git");
        assert!(!msg.contains("s3cret"));
        assert!(msg.contains("***@github.com"));
    }

    #[test]
    fn auth_and_kind_default_when_omitted() {
        let p: NewProject =
            serde_json::from_str(r#"{"name":"web","branch":"main"}"#).unwrap();
        assert_eq!(p.auth, GitAuth::None);
        assert_eq!(p.kind, ProjectKind::default());

        let p: NewProject = serde_json::from_str(
            r#"{"name":"web","branch":"main","auth":{"token":"t"},"kind":{"type":"DockerFile","run_after_build":true}}"#,
        )
        .unwrap();
        assert_eq!(p.auth, GitAuth::Token("t".into()));
        assert!(p.kind.builds_then_runs());
    }
}

//! Path bookkeeping for a session: remote root, local root, project folder.

use serde::{Deserialize, Serialize};

pub const DEFAULT_REMOTE_ROOT: &str = "~/raylink";
pub const DEFAULT_PROJECT: &str = "UnnamedProject";

/// Roots and project sub-folder of a session, stored without trailing separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPaths {
    remote_root: String,
    local_root: String,
    project: String,
    upload_root: Option<String>,
}

impl SessionPaths {
    pub fn new(
        remote_root: impl AsRef<str>,
        local_root: impl AsRef<str>,
        project: impl AsRef<str>,
    ) -> Self {
        let remote_root = normalize_remote(remote_root.as_ref());
        let local_root = normalize_local(local_root.as_ref());
        let project = project.as_ref().trim().trim_matches(|c| c == '/' || c == '\\');
        Self {
            remote_root: if remote_root.is_empty() {
                DEFAULT_REMOTE_ROOT.to_string()
            } else {
                remote_root
            },
            local_root,
            project: if project.is_empty() {
                DEFAULT_PROJECT.to_string()
            } else {
                project.replace('\\', "/")
            },
            upload_root: None,
        }
    }

    /// Explicit root for uploads; `remote_home` is used when unset.
    pub fn with_upload_root(mut self, upload_root: Option<&str>) -> Self {
        self.upload_root = upload_root
            .map(normalize_remote)
            .filter(|root| !root.is_empty());
        self
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    pub fn local_root(&self) -> &str {
        &self.local_root
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// `remote_root/project`
    pub fn remote_home(&self) -> String {
        join_remote(&self.remote_root, &self.project)
    }

    /// `local_root/project`, using the platform separator.
    pub fn local_home(&self) -> String {
        let sep = std::path::MAIN_SEPARATOR;
        if self.local_root.is_empty() {
            return self.project.replace('/', &sep.to_string());
        }
        format!(
            "{}{}{}",
            self.local_root,
            sep,
            self.project.replace('/', &sep.to_string())
        )
    }

    pub fn upload_home(&self) -> String {
        match &self.upload_root {
            Some(root) => join_remote(root, &self.project),
            None => self.remote_home(),
        }
    }
}

impl Default for SessionPaths {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_default();
        let local_root = if home.is_empty() {
            "raylink".to_string()
        } else {
            format!("{home}{}raylink", std::path::MAIN_SEPARATOR)
        };
        Self::new(DEFAULT_REMOTE_ROOT, local_root, DEFAULT_PROJECT)
    }
}

/// Forward slashes, no trailing slash (except for `/` itself).
pub fn normalize_remote(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    if path == "/" {
        return path;
    }
    path.trim_end_matches('/').to_string()
}

/// No trailing separator of either kind.
pub fn normalize_local(path: &str) -> String {
    let path = path.trim();
    if path == "/" {
        return path.to_string();
    }
    path.trim_end_matches(['/', '\\']).to_string()
}

/// Join a remote directory and a relative name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        return name.to_string();
    }
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Quote a path or word for a POSIX shell.
///
/// A leading `~` or `~/` stays unquoted so the remote shell expands it.
pub fn shell_quote(value: &str) -> String {
    if value == "~" {
        return "~".to_string();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        if rest.is_empty() {
            return "~/".to_string();
        }
        return format!("~/{}", single_quote(rest));
    }
    single_quote(value)
}

/// Quote arbitrary text as one literal shell word, no expansion at all.
pub fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

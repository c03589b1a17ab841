use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use super::models::GameSpec;
use crate::config::GitConfig;

/// Commit message used when a spec's folder is removed.
pub const REMOVE_COMMIT_TEMPLATE: &str = "Removed game folder for deleted spec: %s (ID: %s)";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(
        "git repository is not configured (GIT_REPO_PATH, GIT_REPO_URL and GIT_TOKEN are required)"
    )]
    NotConfigured,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Invalid repository URL: {0}")]
    Url(String),
}

/// Side effects against the shared games repository.
#[async_trait]
pub trait RepoDriver: Send + Sync {
    fn is_configured(&self) -> bool;

    fn repo_path(&self) -> &Path;

    /// Public repository URL without a trailing `.git`.
    fn repo_url(&self) -> String;

    /// Web URL of a spec's folder on the default branch.
    fn browse_url(&self, spec_id: &str) -> String {
        format!("{}/tree/main/{}", self.repo_url(), spec_id)
    }

    async fn initialize_repo(&self) -> Result<(), RepoError>;

    /// Write `{repo}/{spec_id}/README.md` and return the folder path.
    async fn create_game_folder(&self, spec: &GameSpec) -> Result<PathBuf, RepoError>;

    async fn commit_and_push(&self, spec_id: &str, title: &str) -> Result<(), RepoError>;

    async fn remove_game_folders(&self, spec_id: &str, title: &str) -> Result<(), RepoError>;
}

/// [`RepoDriver`] backed by the `git` binary.
///
/// The checkout is shared by every worker, so each public operation holds
/// `lock` for its whole duration.
pub struct GitRepo {
    config: GitConfig,
    lock: Mutex<()>,
}

impl GitRepo {
    pub fn new(config: GitConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    /// Remote URL with credentials in the userinfo part (`username:token`,
    /// or `token:` without a username), percent-encoded. URLs that cannot
    /// carry credentials, such as `file://` remotes, are returned as-is.
    fn authenticated_url(&self) -> Result<String, RepoError> {
        if self.config.token.is_empty() {
            return Ok(self.config.repo_url.clone());
        }
        let mut url = reqwest::Url::parse(&self.config.repo_url)
            .map_err(|e| RepoError::Url(format!("{}: {}", self.config.repo_url, e)))?;
        if url.cannot_be_a_base() || url.host_str().is_none_or(str::is_empty) {
            return Ok(self.config.repo_url.clone());
        }

        let (user, password) = match &self.config.username {
            Some(user) => (user.as_str(), Some(self.config.token.as_str())),
            None => (self.config.token.as_str(), None),
        };
        if url.set_username(user).is_err() || url.set_password(password).is_err() {
            return Ok(self.config.repo_url.clone());
        }
        if password.is_some() {
            return Ok(url.into());
        }

        // An empty password keeps git from prompting for one.
        let userinfo = format!("{}://{}@", url.scheme(), url.username());
        let full = url.to_string();
        match full.strip_prefix(&userinfo) {
            Some(rest) => Ok(format!("{}://{}:@{}", url.scheme(), url.username(), rest)),
            None => Ok(full),
        }
    }

    fn redact(&self, text: &str) -> String {
        let token = &self.config.token;
        if token.is_empty() {
            return text.to_string();
        }
        let mut redacted = text.replace(token, "***");
        // The remote URL carries the percent-encoded form.
        let encoded = reqwest::Url::parse("https://redact.invalid")
            .ok()
            .and_then(|mut url| {
                url.set_password(Some(token)).ok()?;
                url.password().map(str::to_string)
            })
            .filter(|encoded| encoded != token);
        if let Some(encoded) = encoded {
            redacted = redacted.replace(&encoded, "***");
        }
        redacted
    }

    /// Run git in the checkout; non-zero exit becomes `RepoError::Command`.
    async fn git(&self, args: &[&str]) -> Result<String, RepoError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.config.repo_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| RepoError::Io {
                path: self.config.repo_path.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RepoError::Command {
                command: self.redact(&format!("git {}", args.join(" "))),
                stderr: self.redact(String::from_utf8_lossy(&output.stderr).trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn git_succeeds(&self, args: &[&str]) -> bool {
        self.git(args).await.is_ok()
    }

    /// Try each argument list in turn, returning the last error if all fail.
    async fn git_first_success(&self, attempts: &[&[&str]]) -> Result<(), RepoError> {
        let mut last_err = None;
        for args in attempts {
            match self.git(args).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!(error = %e, "git attempt failed, trying fallback");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Best-effort sync with the remote before writing.
    async fn pull_from_remote(&self) {
        if !self.git_succeeds(&["remote", "get-url", "origin"]).await {
            return;
        }
        if !self.git_succeeds(&["rev-parse", "HEAD"]).await {
            return;
        }
        if let Err(e) = self
            .git_first_success(&[
                &["pull", "origin", "main"],
                &["pull", "origin", "master"],
                &["pull"],
            ])
            .await
        {
            tracing::warn!(error = %e, "Failed to pull latest changes, continuing");
        }
    }

    async fn has_staged_changes(&self) -> bool {
        !self.git_succeeds(&["diff", "--cached", "--quiet"]).await
    }
}

#[async_trait]
impl RepoDriver for GitRepo {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn repo_path(&self) -> &Path {
        &self.config.repo_path
    }

    fn repo_url(&self) -> String {
        self.config
            .repo_url
            .trim_end_matches(".git")
            .to_string()
    }

    async fn initialize_repo(&self) -> Result<(), RepoError> {
        if !self.is_configured() {
            return Err(RepoError::NotConfigured);
        }
        let _guard = self.lock.lock().await;
        let path = &self.config.repo_path;

        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| RepoError::Io {
                path: path.clone(),
                source,
            })?;

        let auth_url = self.authenticated_url()?;
        if !path.join(".git").exists() {
            self.git(&["init"]).await?;
            // Unborn branch, so this works whatever init.defaultBranch says.
            if let Err(e) = self.git(&["symbolic-ref", "HEAD", "refs/heads/main"]).await {
                tracing::warn!(error = %e, "Failed to point HEAD at main; keeping the default branch");
            }
            self.git(&["remote", "add", "origin", &auth_url]).await?;
            tracing::info!(path = %path.display(), "Initialized games repository");
        } else if self.git(&["remote", "set-url", "origin", &auth_url]).await.is_err() {
            self.git(&["remote", "add", "origin", &auth_url]).await?;
        }

        if let Some(user) = &self.config.username {
            let email = format!("{}@users.noreply.github.com", user);
            self.git(&["config", "user.name", user]).await?;
            self.git(&["config", "user.email", &email]).await?;
        }
        Ok(())
    }

    async fn create_game_folder(&self, spec: &GameSpec) -> Result<PathBuf, RepoError> {
        let _guard = self.lock.lock().await;
        let folder = self.config.repo_path.join(&spec.id);

        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|source| RepoError::Io {
                path: folder.clone(),
                source,
            })?;

        let readme_path = folder.join("README.md");
        if let Err(e) = tokio::fs::write(&readme_path, render_readme(spec)).await {
            tracing::warn!(path = %readme_path.display(), error = %e, "Failed to write README.md");
        }
        Ok(folder)
    }

    async fn commit_and_push(&self, spec_id: &str, title: &str) -> Result<(), RepoError> {
        let _guard = self.lock.lock().await;

        self.pull_from_remote().await;
        self.git(&["add", spec_id]).await?;

        if self.has_staged_changes().await {
            let message = render_commit_message(&self.config.commit_message_template, title, spec_id);
            self.git(&["commit", "-m", &message]).await?;
        } else {
            tracing::info!(spec_id, "Game folder unchanged, nothing to commit");
        }

        self.git_first_success(&[
            &["push", "origin", "main"],
            &["push", "origin", "master"],
            &["push", "-u", "origin", "main"],
        ])
        .await
    }

    async fn remove_game_folders(&self, spec_id: &str, title: &str) -> Result<(), RepoError> {
        if !self.is_configured() {
            return Err(RepoError::NotConfigured);
        }
        let _guard = self.lock.lock().await;

        self.pull_from_remote().await;

        let folder = self.config.repo_path.join(spec_id);
        if !folder.exists() {
            tracing::info!(spec_id, "Game folder does not exist, nothing to remove");
            return Ok(());
        }
        tokio::fs::remove_dir_all(&folder)
            .await
            .map_err(|source| RepoError::Io {
                path: folder.clone(),
                source,
            })?;

        self.git(&["add", "-A"]).await?;
        if !self.has_staged_changes().await {
            tracing::info!(spec_id, "No changes to commit after removing game folder");
            return Ok(());
        }

        let message = render_commit_message(REMOVE_COMMIT_TEMPLATE, title, spec_id);
        self.git(&["commit", "-m", &message]).await?;

        if self.config.auto_push {
            self.git_first_success(&[&["push", "origin", "main"], &["push", "origin", "master"]])
                .await?;
            tracing::info!(spec_id, "Pushed game folder removal");
        } else {
            tracing::info!(spec_id, "Auto-push disabled, removal committed locally only");
        }
        Ok(())
    }
}

/// Substitute `%s` placeholders with the title, then the ID. Placeholders
/// beyond the second are left untouched.
pub fn render_commit_message(template: &str, title: &str, id: &str) -> String {
    let mut out = String::with_capacity(template.len() + title.len() + id.len());
    let mut args = [title, id].into_iter();
    let mut parts = template.split("%s").peekable();
    while let Some(part) = parts.next() {
        out.push_str(part);
        if parts.peek().is_some() {
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str("%s"),
            }
        }
    }
    out
}

fn render_readme(spec: &GameSpec) -> String {
    let mut readme = format!(
        "# {}\n\n**Game ID:** {}\n**Generated:** {}\n\n",
        spec.title,
        spec.id,
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );

    if !spec.spec_markdown.is_empty() {
        readme.push_str("## Game Specification\n\n");
        readme.push_str(&spec.spec_markdown);
        readme.push_str("\n\n");
    }

    if !spec.spec_json.is_null() {
        let pretty = serde_json::to_string_pretty(&spec.spec_json)
            .unwrap_or_else(|_| spec.spec_json.to_string());
        readme.push_str("## Game Configuration (JSON)\n\n```json\n");
        readme.push_str(&pretty);
        readme.push_str("\n```\n\n");
    }
    readme
}

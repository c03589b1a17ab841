//! In-process doubles for the outbound seams, shared by the coordinator and
//! router tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::agent::{AgentSession, CodingAgent};
use super::gateway::{
    GenerateSpecRequest, GeneratedSpec, SearchRequest, SimilarityIndex, SpecGenerator,
    UpsertRequest,
};
use super::git::{RepoDriver, RepoError};
use super::models::{GameSpec, SimilarSpec};
use crate::errors::FactoryError;

pub struct MockGenerator {
    pub spec: Mutex<Option<GeneratedSpec>>,
    pub fail: bool,
}

impl MockGenerator {
    pub fn returning(title: &str, spec_json: serde_json::Value) -> Self {
        Self {
            spec: Mutex::new(Some(GeneratedSpec {
                title: title.to_string(),
                spec_markdown: format!("# {}", title),
                spec_json,
            })),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            spec: Mutex::new(None),
            fail: true,
        }
    }
}

#[async_trait]
impl SpecGenerator for MockGenerator {
    async fn generate_spec(&self, _req: &GenerateSpecRequest) -> Result<GeneratedSpec, FactoryError> {
        if self.fail {
            return Err(FactoryError::upstream("spec generator", "returned 503"));
        }
        self.spec
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FactoryError::upstream("spec generator", "no spec configured"))
    }
}

#[derive(Default)]
pub struct MockIndex {
    pub hits: Mutex<Vec<SimilarSpec>>,
    pub searches: Mutex<Vec<SearchRequest>>,
    pub upserts: Mutex<Vec<UpsertRequest>>,
    pub deletes: Mutex<Vec<String>>,
    pub fail_upsert: bool,
    pub fail_delete: bool,
}

impl MockIndex {
    pub fn with_hits(hits: Vec<SimilarSpec>) -> Self {
        Self {
            hits: Mutex::new(hits),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SimilarityIndex for MockIndex {
    async fn search(&self, req: &SearchRequest) -> Result<Vec<SimilarSpec>, FactoryError> {
        self.searches.lock().unwrap().push(req.clone());
        Ok(self.hits.lock().unwrap().clone())
    }

    async fn upsert(&self, req: &UpsertRequest) -> Result<(), FactoryError> {
        if self.fail_upsert {
            return Err(FactoryError::upstream("similarity gateway", "upsert returned 500"));
        }
        self.upserts.lock().unwrap().push(req.clone());
        Ok(())
    }

    async fn delete(&self, spec_id: &str) -> Result<(), FactoryError> {
        if self.fail_delete {
            return Err(FactoryError::upstream("similarity gateway", "delete returned 500"));
        }
        self.deletes.lock().unwrap().push(spec_id.to_string());
        Ok(())
    }
}

/// Records every call; individual operations can be made to fail.
pub struct MockRepo {
    pub configured: bool,
    pub root: PathBuf,
    pub fail_push: bool,
    pub fail_remove: bool,
    /// Time `commit_and_push` spends "pushing" after recording the call.
    pub push_delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl MockRepo {
    pub fn configured() -> Self {
        Self {
            configured: true,
            root: PathBuf::from("/srv/games"),
            fail_push: false,
            fail_remove: false,
            push_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            root: PathBuf::new(),
            ..Self::configured()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepoDriver for MockRepo {
    fn is_configured(&self) -> bool {
        self.configured
    }

    fn repo_path(&self) -> &Path {
        &self.root
    }

    fn repo_url(&self) -> String {
        "https://github.com/acme/games".to_string()
    }

    async fn initialize_repo(&self) -> Result<(), RepoError> {
        self.calls.lock().unwrap().push("init".to_string());
        Ok(())
    }

    async fn create_game_folder(&self, spec: &GameSpec) -> Result<PathBuf, RepoError> {
        self.calls.lock().unwrap().push(format!("folder:{}", spec.id));
        Ok(self.root.join(&spec.id))
    }

    async fn commit_and_push(&self, spec_id: &str, _title: &str) -> Result<(), RepoError> {
        self.calls.lock().unwrap().push(format!("push:{}", spec_id));
        if !self.push_delay.is_zero() {
            tokio::time::sleep(self.push_delay).await;
        }
        if self.fail_push {
            return Err(RepoError::Command {
                command: "git push origin main".to_string(),
                stderr: "remote rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn remove_game_folders(&self, spec_id: &str, _title: &str) -> Result<(), RepoError> {
        self.calls.lock().unwrap().push(format!("remove:{}", spec_id));
        if self.fail_remove {
            return Err(RepoError::Command {
                command: "git commit".to_string(),
                stderr: "nothing".to_string(),
            });
        }
        Ok(())
    }
}

pub struct MockAgent {
    pub fail: bool,
    pub sessions: Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn ok() -> Self {
        Self {
            fail: false,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }
}

#[async_trait]
impl CodingAgent for MockAgent {
    async fn create_session(&self, spec_id: &str, _title: &str) -> Result<AgentSession, FactoryError> {
        if self.fail {
            return Err(FactoryError::upstream("coding agent", "returned status 500"));
        }
        self.sessions.lock().unwrap().push(spec_id.to_string());
        Ok(AgentSession {
            session_id: format!("sess-{}", spec_id),
            url: None,
        })
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("https://app.devin.ai/sessions/{}", session_id)
    }
}

pub fn sample_spec_json() -> serde_json::Value {
    json!({
        "genre": "arcade",
        "duration_sec": 90,
        "controls": ["left", "right"],
        "mechanics": ["dodge", "score"],
        "constraints": {"max_players": 1},
    })
}

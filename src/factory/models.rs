use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Spec lifecycle state ──────────────────────────────────────────────

/// Pipeline stage of a game spec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpecState {
    Creating,
    GitIniting,
    GitInited,
    CodeGenerating,
    CodeGenerated,
}

impl SpecState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::GitIniting => "git_initing",
            Self::GitInited => "git_inited",
            Self::CodeGenerating => "code_generating",
            Self::CodeGenerated => "code_generated",
        }
    }

    /// Edges the tracker accepts. The forward chain is
    /// `creating → git_initing → git_inited → code_generating → code_generated`;
    /// any state past `git_initing` may also return to it when a code job is retried.
    pub fn can_transition_to(&self, next: SpecState) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::GitIniting)
                | (Self::GitIniting, Self::GitInited)
                | (Self::GitInited, Self::CodeGenerating)
                | (Self::CodeGenerating, Self::CodeGenerated)
                | (Self::GitInited, Self::GitIniting)
                | (Self::CodeGenerating, Self::GitIniting)
                | (Self::CodeGenerated, Self::GitIniting)
        )
    }
}

impl std::fmt::Display for SpecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "git_initing" => Ok(Self::GitIniting),
            "git_inited" => Ok(Self::GitInited),
            "code_generating" => Ok(Self::CodeGenerating),
            "code_generated" => Ok(Self::CodeGenerated),
            _ => Err(format!("Invalid spec state: {}", s)),
        }
    }
}

// ── Game specs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSpec {
    pub id: String,
    pub title: String,
    pub brief: String,
    pub spec_markdown: String,
    pub spec_json: serde_json::Value,
    pub spec_hash: String,
    pub genre: Option<String>,
    pub duration_sec: Option<i64>,
    pub state: SpecState,
    pub devin_session_id: Option<String>,
    pub created_at: String,
}

/// Row shape for `GET /api/specs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSpecSummary {
    pub id: String,
    pub title: String,
    pub brief: String,
    pub state: SpecState,
    pub created_at: String,
}

/// Everything needed to insert a freshly generated spec.
#[derive(Debug, Clone)]
pub struct NewGameSpec {
    pub id: String,
    pub title: String,
    pub brief: String,
    pub spec_markdown: String,
    pub spec_json: serde_json::Value,
    pub spec_hash: String,
}

impl NewGameSpec {
    pub fn genre(&self) -> Option<String> {
        self.spec_json
            .get("genre")
            .and_then(|g| g.as_str())
            .map(str::to_string)
    }

    pub fn duration_sec(&self) -> Option<i64> {
        self.spec_json.get("duration_sec").and_then(|d| {
            d.as_i64()
                .or_else(|| d.as_f64().map(|f| f.round() as i64))
        })
    }
}

/// One entry of a spec's state audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: i64,
    pub game_spec_id: String,
    pub state_before: Option<SpecState>,
    pub state_after: SpecState,
    pub detail: Option<String>,
    pub created_at: String,
}

// ── Spec generation jobs ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpecJobStatus {
    Queued,
    Running,
    Duplicate,
    Completed,
    Failed,
}

impl SpecJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Duplicate => "DUPLICATE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for SpecJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "DUPLICATE" => Ok(Self::Duplicate),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid spec job status: {}", s)),
        }
    }
}

/// A near-duplicate candidate as reported by the similarity gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarSpec {
    pub id: String,
    pub title: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecJob {
    pub id: String,
    pub status: SpecJobStatus,
    pub brief: String,
    pub constraints: Option<serde_json::Value>,
    pub result_spec_id: Option<String>,
    pub duplicate_of: Vec<String>,
    pub duplicate_list: Vec<SimilarSpec>,
    pub score_similarity: Option<f64>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

// ── Code generation jobs ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodeJobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl CodeJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for CodeJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid code job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeJob {
    #[serde(rename = "job_id")]
    pub id: String,
    pub game_spec_id: Option<String>,
    pub game_spec: serde_json::Value,
    pub output_path: Option<String>,
    pub status: CodeJobStatus,
    pub progress: i32,
    pub artifact_url: Option<String>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub started_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A single status/progress write against a code job. `logs` replaces the
/// stored array wholesale.
#[derive(Debug, Clone)]
pub struct CodeJobUpdate {
    pub status: CodeJobStatus,
    pub progress: i32,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub artifact_url: Option<String>,
    pub output_path: Option<String>,
}

impl CodeJobUpdate {
    pub fn new(status: CodeJobStatus, progress: i32, logs: Vec<String>) -> Self {
        Self {
            status,
            progress: progress.clamp(0, 100),
            logs,
            error: None,
            artifact_url: None,
            output_path: None,
        }
    }

    pub fn failed(progress: i32, error: impl Into<String>, logs: Vec<String>) -> Self {
        let mut update = Self::new(CodeJobStatus::Failed, progress, logs);
        update.error = Some(error.into());
        update
    }
}

// ── API view types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSpecDetail {
    #[serde(flatten)]
    pub spec: GameSpec,
    pub state_logs: Vec<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devin_session_url: Option<String>,
}

//! Delegation of game implementation to an external coding agent.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::errors::FactoryError;

const SERVICE: &str = "coding agent";

/// A session created on the agent platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait CodingAgent: Send + Sync {
    /// Ask the agent to implement the game in `{repo}/{spec_id}`.
    async fn create_session(&self, spec_id: &str, title: &str) -> Result<AgentSession, FactoryError>;

    /// Browser URL for a stored session ID.
    fn session_url(&self, session_id: &str) -> String;
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    prompt: &'a str,
    idempotent: bool,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: Option<serde_json::Value>,
    url: Option<String>,
}

/// Devin sessions API client.
pub struct DevinClient {
    client: reqwest::Client,
    config: AgentConfig,
    repo_url: String,
}

impl DevinClient {
    /// `repo_url` is the public games repository, quoted in the task prompt.
    pub fn new(config: AgentConfig, repo_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build coding agent HTTP client")?;
        Ok(Self {
            client,
            config,
            repo_url: repo_url.trim_end_matches(".git").to_string(),
        })
    }
}

#[async_trait]
impl CodingAgent for DevinClient {
    async fn create_session(&self, spec_id: &str, title: &str) -> Result<AgentSession, FactoryError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| FactoryError::Configuration("DEVIN_API_KEY is required".into()))?;
        if self.repo_url.is_empty() {
            return Err(FactoryError::Configuration("GIT_REPO_URL is required".into()));
        }

        let prompt = build_prompt(&self.repo_url, spec_id, title);
        let resp = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&CreateSessionRequest {
                prompt: &prompt,
                idempotent: true,
            })
            .send()
            .await
            .map_err(|e| FactoryError::upstream(SERVICE, format!("session request failed: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FactoryError::upstream(SERVICE, format!("failed to read response: {}", e)))?;
        tracing::debug!(status = %status, body = %body, "Coding agent response");

        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            return Err(FactoryError::upstream(
                SERVICE,
                format!("returned status {}: {}", status, body.trim()),
            ));
        }

        let parsed: CreateSessionResponse = serde_json::from_str(&body)
            .map_err(|e| FactoryError::upstream(SERVICE, format!("invalid response: {}", e)))?;
        let session_id = match parsed.session_id {
            Some(serde_json::Value::String(id)) => id,
            Some(_) => {
                return Err(FactoryError::upstream(SERVICE, "session_id is not a string"));
            }
            None => return Err(FactoryError::upstream(SERVICE, "session_id missing from response")),
        };
        let session_id = session_id
            .strip_prefix("devin-")
            .unwrap_or(&session_id)
            .to_string();

        tracing::info!(spec_id, session_id = %session_id, "Created coding agent session");
        Ok(AgentSession {
            session_id,
            url: parsed.url,
        })
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/{}", self.config.session_base_url.trim_end_matches('/'), session_id)
    }
}

fn build_prompt(repo_url: &str, spec_id: &str, title: &str) -> String {
    format!(
        "Please work on the game project in folder {id}.

This folder contains a README.md file that describes the complete game specification and requirements.

Your tasks:
1. Navigate to the {id} folder in the repository
2. Read the README.md file to understand the game specification
3. Implement the complete game based on the specification in the README
4. Create all necessary HTML, CSS, and JavaScript files for the game
5. Ensure the game is fully functional and meets all requirements specified in the README
6. Test the game thoroughly to ensure it works correctly
7. Create a new branch for your implementation (e.g., implement/game-{id})
8. Commit your implementation to the new branch with descriptive commit messages
9. Open a pull request to merge your implementation into the main branch
10. Include screenshots or a demo video in the pull request description

Repository: {repo}
Game Title: {title}
Game Spec ID: {id}

IMPORTANT: Do NOT commit directly to the main branch. Always create a feature branch and submit a pull request for review.",
        id = spec_id,
        repo = repo_url,
        title = title,
    )
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::code_jobs::CodeJobCoordinator;
use super::db::DbHandle;
use super::gateway::{
    GenerateSpecRequest, SearchRequest, SimilarityIndex, SpecGenerator, UpsertRequest,
    fingerprint, spec_hash,
};
use super::models::{NewGameSpec, SimilarSpec, SpecJob, SpecJobStatus};
use super::ws::{WsMessage, broadcast_message};
use crate::config::GatewayConfig;
use crate::errors::FactoryError;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSpecJob {
    #[serde(default)]
    pub brief: String,
    pub constraints: Option<serde_json::Value>,
}

/// Result of a spec generation request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status")]
pub enum SpecJobOutcome {
    #[serde(rename = "COMPLETED")]
    Completed {
        job_id: String,
        result_spec_id: String,
    },
    #[serde(rename = "DUPLICATE")]
    Duplicate {
        job_id: String,
        duplicate_list: Vec<SimilarSpec>,
    },
}

/// Public view of a spec job for `GET /api/spec-jobs/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct SpecJobView {
    pub job_id: String,
    pub status: SpecJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_spec_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub duplicate_list: Vec<SimilarSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<SpecJob> for SpecJobView {
    fn from(job: SpecJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result_spec_id: job.result_spec_id,
            duplicate_list: job.duplicate_list,
            error: job.error,
        }
    }
}

/// Brief → generated spec → similarity check → persisted spec, inline in
/// the calling request.
pub struct SpecJobCoordinator {
    db: DbHandle,
    generator: Arc<dyn SpecGenerator>,
    index: Arc<dyn SimilarityIndex>,
    code_jobs: Arc<CodeJobCoordinator>,
    ws_tx: broadcast::Sender<String>,
    top_k: usize,
    threshold: f64,
}

impl SpecJobCoordinator {
    pub fn new(
        db: DbHandle,
        generator: Arc<dyn SpecGenerator>,
        index: Arc<dyn SimilarityIndex>,
        code_jobs: Arc<CodeJobCoordinator>,
        ws_tx: broadcast::Sender<String>,
        gateway: &GatewayConfig,
    ) -> Self {
        Self {
            db,
            generator,
            index,
            code_jobs,
            ws_tx,
            top_k: gateway.top_k,
            threshold: gateway.threshold,
        }
    }

    pub async fn create(&self, req: CreateSpecJob) -> Result<SpecJobOutcome, FactoryError> {
        let brief = req.brief.trim().to_string();
        if brief.is_empty() {
            return Err(FactoryError::InvalidInput("brief is required".into()));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        {
            let (id, brief, constraints) = (job_id.clone(), brief.clone(), req.constraints.clone());
            self.db
                .call(move |db| {
                    db.create_spec_job(&id, &brief, constraints.as_ref())?;
                    db.mark_spec_job_running(&id)
                })
                .await
                .map_err(FactoryError::Database)?;
        }
        tracing::info!(job_id = %job_id, "Spec job started");

        match self.run(&job_id, brief, req.constraints).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let (id, message) = (job_id.clone(), err.to_string());
                if let Err(e) = self
                    .db
                    .call(move |db| db.mark_spec_job_failed(&id, &message))
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark spec job failed");
                }
                tracing::warn!(job_id = %job_id, error = %err, "Spec job failed");
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        job_id: &str,
        brief: String,
        constraints: Option<serde_json::Value>,
    ) -> Result<SpecJobOutcome, FactoryError> {
        let generated = self
            .generator
            .generate_spec(&GenerateSpecRequest {
                brief: brief.clone(),
                constraints,
            })
            .await?;

        let text = fingerprint(&generated.title, &generated.spec_json);
        let candidates = self
            .index
            .search(&SearchRequest {
                text: text.clone(),
                top_k: self.top_k,
                threshold: self.threshold,
            })
            .await?;

        // The gateway's first entry decides; the list is not re-sorted.
        if let Some(top) = candidates.first()
            && top.score >= self.threshold
        {
            let (id, list) = (job_id.to_string(), candidates.clone());
            self.db
                .call(move |db| db.mark_spec_job_duplicate(&id, &list))
                .await
                .map_err(FactoryError::Database)?;
            tracing::info!(job_id, duplicate_of = %top.id, score = top.score, "Spec is a near-duplicate");
            return Ok(SpecJobOutcome::Duplicate {
                job_id: job_id.to_string(),
                duplicate_list: candidates,
            });
        }

        let new_spec = NewGameSpec {
            id: uuid::Uuid::new_v4().to_string(),
            title: generated.title.clone(),
            brief,
            spec_markdown: generated.spec_markdown,
            spec_hash: spec_hash(&generated.spec_json)?,
            spec_json: generated.spec_json,
        };
        let spec_id = new_spec.id.clone();
        let inserted = self
            .db
            .call(move |db| db.insert_game_spec(&new_spec))
            .await
            .map_err(FactoryError::Database)?;
        if inserted.is_none() {
            return Err(FactoryError::Conflict(
                "a game spec with identical content already exists".into(),
            ));
        }
        broadcast_message(
            &self.ws_tx,
            &WsMessage::SpecCreated {
                spec_id: spec_id.clone(),
                title: generated.title.clone(),
            },
        );

        self.index
            .upsert(&UpsertRequest {
                spec_id: spec_id.clone(),
                text,
                payload: serde_json::json!({ "title": generated.title }),
            })
            .await?;

        let (id, sid) = (job_id.to_string(), spec_id.clone());
        self.db
            .call(move |db| db.mark_spec_job_completed(&id, &sid))
            .await
            .map_err(FactoryError::Database)?;
        tracing::info!(job_id, spec_id = %spec_id, "Spec job completed");

        let code_jobs = Arc::clone(&self.code_jobs);
        let trigger_id = spec_id.clone();
        tokio::spawn(async move {
            if let Err(e) = code_jobs.submit_for_spec(&trigger_id).await {
                tracing::warn!(spec_id = %trigger_id, error = %e, "Failed to queue code generation");
            }
        });

        Ok(SpecJobOutcome::Completed {
            job_id: job_id.to_string(),
            result_spec_id: spec_id,
        })
    }

    pub async fn get(&self, job_id: &str) -> Result<SpecJobView, FactoryError> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.get_spec_job(&id))
            .await
            .map_err(FactoryError::Database)?
            .map(SpecJobView::from)
            .ok_or_else(|| FactoryError::not_found("Spec job", job_id))
    }
}

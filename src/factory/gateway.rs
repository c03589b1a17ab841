//! Clients for the spec-generation and similarity service.
//!
//! Both capabilities are served by the same HTTP backend (`LLM_BACKEND_URL`),
//! so [`LlmGateway`] implements both traits. The coordinators only see the
//! traits, which keeps them testable without a network.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::models::SimilarSpec;
use crate::config::GatewayConfig;
use crate::errors::FactoryError;

const GENERATOR: &str = "spec generator";
const SIMILARITY: &str = "similarity gateway";

#[derive(Debug, Clone, Serialize)]
pub struct GenerateSpecRequest {
    pub brief: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedSpec {
    pub title: String,
    pub spec_markdown: String,
    pub spec_json: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub text: String,
    pub top_k: usize,
    pub threshold: f64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    similar: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    spec_id: String,
    #[serde(default)]
    title: String,
    score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertRequest {
    pub spec_id: String,
    pub text: String,
    pub payload: serde_json::Value,
}

/// Turns a brief into a full game spec document.
#[async_trait]
pub trait SpecGenerator: Send + Sync {
    async fn generate_spec(&self, req: &GenerateSpecRequest) -> Result<GeneratedSpec, FactoryError>;
}

/// Nearest-neighbour index over spec fingerprints.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Candidates in the order the index ranks them.
    async fn search(&self, req: &SearchRequest) -> Result<Vec<SimilarSpec>, FactoryError>;
    async fn upsert(&self, req: &UpsertRequest) -> Result<(), FactoryError>;
    async fn delete(&self, spec_id: &str) -> Result<(), FactoryError>;
}

/// reqwest client for the LLM/vector backend.
pub struct LlmGateway {
    client: reqwest::Client,
    base_url: String,
}

impl LlmGateway {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build gateway HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a transport failure or non-2xx status into an `Upstream` error.
async fn check_status(
    service: &'static str,
    what: &str,
    result: reqwest::Result<reqwest::Response>,
) -> Result<reqwest::Response, FactoryError> {
    let resp = result.map_err(|e| FactoryError::upstream(service, format!("{} failed: {}", what, e)))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FactoryError::upstream(
            service,
            format!("{} returned {}: {}", what, status, body.trim()),
        ));
    }
    Ok(resp)
}

#[async_trait]
impl SpecGenerator for LlmGateway {
    async fn generate_spec(&self, req: &GenerateSpecRequest) -> Result<GeneratedSpec, FactoryError> {
        let result = self
            .client
            .post(self.url("/llm/generate-spec"))
            .json(req)
            .send()
            .await;
        let resp = check_status(GENERATOR, "generate-spec", result).await?;
        resp.json::<GeneratedSpec>()
            .await
            .map_err(|e| FactoryError::upstream(GENERATOR, format!("invalid generate-spec response: {}", e)))
    }
}

#[async_trait]
impl SimilarityIndex for LlmGateway {
    async fn search(&self, req: &SearchRequest) -> Result<Vec<SimilarSpec>, FactoryError> {
        let result = self
            .client
            .post(self.url("/vector/search"))
            .json(req)
            .send()
            .await;
        let resp = check_status(SIMILARITY, "vector search", result).await?;
        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| FactoryError::upstream(SIMILARITY, format!("invalid search response: {}", e)))?;
        Ok(body
            .similar
            .into_iter()
            .map(|hit| SimilarSpec {
                id: hit.spec_id,
                title: hit.title,
                score: hit.score,
            })
            .collect())
    }

    async fn upsert(&self, req: &UpsertRequest) -> Result<(), FactoryError> {
        let result = self
            .client
            .post(self.url("/vector/upsert"))
            .json(req)
            .send()
            .await;
        check_status(SIMILARITY, "vector upsert", result).await?;
        Ok(())
    }

    async fn delete(&self, spec_id: &str) -> Result<(), FactoryError> {
        let result = self
            .client
            .delete(self.url(&format!("/vector/spec/{}", spec_id)))
            .send()
            .await;
        check_status(SIMILARITY, "vector delete", result).await?;
        Ok(())
    }
}

// ── Fingerprint + hash ────────────────────────────────────────────────

/// Text indexed for similarity search: the title plus the gameplay-defining
/// fields of the spec document.
pub fn fingerprint(title: &str, spec_json: &serde_json::Value) -> String {
    format!(
        "{}\ncontrols:{}\nmechanics:{}\nconstraints:{}",
        title,
        render_field(spec_json.get("controls")),
        render_field(spec_json.get("mechanics")),
        render_field(spec_json.get("constraints")),
    )
}

fn render_field(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| render_field(Some(item)))
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    }
}

/// Hex SHA-256 of the canonical (sorted-key, compact) serialization.
pub fn spec_hash(spec_json: &serde_json::Value) -> Result<String, FactoryError> {
    let mut canonical = String::new();
    write_canonical(spec_json, &mut canonical)
        .context("Failed to serialize spec_json for hashing")?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Compact JSON with object keys sorted at every depth, independent of the
/// map ordering serde_json was built with.
fn write_canonical(value: &serde_json::Value, out: &mut String) -> serde_json::Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{delete, post};
    use axum::{Json, Router, http::StatusCode};
    use serde_json::json;
    use std::time::Duration;

    async fn mock_backend(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn gateway(base_url: String) -> LlmGateway {
        LlmGateway::new(&GatewayConfig {
            base_url,
            timeout: Duration::from_secs(5),
            ..GatewayConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_fingerprint_renders_named_fields() {
        let spec = json!({
            "controls": ["left", "right"],
            "mechanics": "dodge",
            "constraints": {"max_players": 1},
        });
        assert_eq!(
            fingerprint("Dodge Rush", &spec),
            "Dodge Rush\ncontrols:left, right\nmechanics:dodge\nconstraints:{\"max_players\":1}"
        );
    }

    #[test]
    fn test_fingerprint_missing_fields_are_empty() {
        let spec = json!({"controls": null});
        assert_eq!(fingerprint("T", &spec), "T\ncontrols:\nmechanics:\nconstraints:");
    }

    #[test]
    fn test_spec_hash_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":[1,2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#).unwrap();
        let ha = spec_hash(&a).unwrap();
        assert_eq!(ha, spec_hash(&b).unwrap());
        assert_eq!(ha.len(), 64);
        assert_ne!(ha, spec_hash(&json!({"a": [1, 2], "b": 2})).unwrap());
    }

    #[test]
    fn test_spec_hash_sorts_nested_keys_before_hashing() {
        let mut inner = serde_json::Map::new();
        inner.insert("y".into(), json!([true, null]));
        inner.insert("x".into(), json!(1));
        let mut outer = serde_json::Map::new();
        outer.insert("zeta".into(), json!("z\"q"));
        outer.insert("alpha".into(), serde_json::Value::Object(inner));

        let expected = r#"{"alpha":{"x":1,"y":[true,null]},"zeta":"z\"q"}"#;
        assert_eq!(
            spec_hash(&serde_json::Value::Object(outer)).unwrap(),
            hex::encode(Sha256::digest(expected.as_bytes()))
        );
    }

    #[tokio::test]
    async fn test_generate_spec_decodes_response() {
        let router = Router::new().route(
            "/llm/generate-spec",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["brief"], "dodge blocks");
                Json(json!({
                    "title": "Dodge Rush",
                    "spec_markdown": "# Dodge Rush",
                    "spec_json": {"genre": "arcade"},
                }))
            }),
        );
        let gw = gateway(mock_backend(router).await);

        let spec = gw
            .generate_spec(&GenerateSpecRequest {
                brief: "dodge blocks".into(),
                constraints: None,
            })
            .await
            .unwrap();
        assert_eq!(spec.title, "Dodge Rush");
        assert_eq!(spec.spec_json["genre"], "arcade");
    }

    #[tokio::test]
    async fn test_generate_spec_non_2xx_is_upstream_error() {
        let router = Router::new().route(
            "/llm/generate-spec",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
        );
        let gw = gateway(mock_backend(router).await);

        let err = gw
            .generate_spec(&GenerateSpecRequest {
                brief: "x".into(),
                constraints: None,
            })
            .await
            .unwrap_err();
        match err {
            FactoryError::Upstream { service, message } => {
                assert_eq!(service, "spec generator");
                assert!(message.contains("503"));
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_keeps_gateway_order() {
        let router = Router::new().route(
            "/vector/search",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["top_k"], 5);
                Json(json!({"similar": [
                    {"spec_id": "a", "title": "A", "score": 0.80},
                    {"spec_id": "b", "title": "B", "score": 0.95},
                ]}))
            }),
        );
        let gw = gateway(mock_backend(router).await);

        let hits = gw
            .search(&SearchRequest {
                text: "t".into(),
                top_k: 5,
                threshold: 0.86,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].score, 0.95);
    }

    #[tokio::test]
    async fn test_upsert_and_delete_hit_vector_routes() {
        let router = Router::new()
            .route("/vector/upsert", post(|| async { StatusCode::OK }))
            .route(
                "/vector/spec/{id}",
                delete(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    if id == "gone" {
                        StatusCode::NOT_FOUND
                    } else {
                        StatusCode::OK
                    }
                }),
            );
        let gw = gateway(mock_backend(router).await);

        gw.upsert(&UpsertRequest {
            spec_id: "s1".into(),
            text: "t".into(),
            payload: json!({"title": "T"}),
        })
        .await
        .unwrap();
        gw.delete("s1").await.unwrap();
        assert!(matches!(
            gw.delete("gone").await,
            Err(FactoryError::Upstream { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_upstream_error() {
        let gw = gateway("http://127.0.0.1:1".into());
        let err = gw.delete("s1").await.unwrap_err();
        assert!(matches!(err, FactoryError::Upstream { service: "similarity gateway", .. }));
    }
}

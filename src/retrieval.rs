use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Scores candidate documents against a query.
#[allow(async_fn_in_trait)]
pub trait SimilarityScorer {
    /// One score per document, in document order.
    async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<f64>>;
}

/// Client for the hosted sentence-similarity model.
pub struct RetrievalClient {
    client: Client,
    url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SimilarityResponse {
    Wrapped { similarities: Vec<f64> },
    Bare(Vec<f64>),
}

impl RetrievalClient {
    pub fn new(url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            api_token,
        }
    }
}

impl SimilarityScorer for RetrievalClient {
    async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<f64>> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&json!({
                "inputs": {
                    "sentences": docs,
                    "source_sentence": query,
                    "parameters": {},
                }
            }));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HarnessError::RetrievalService(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HarnessError::RetrievalService(format!("{status}: {body}")));
        }

        let similarities = match response
            .json::<SimilarityResponse>()
            .await
            .map_err(|e| HarnessError::RetrievalService(format!("unreadable response: {e}")))?
        {
            SimilarityResponse::Wrapped { similarities } | SimilarityResponse::Bare(similarities) => {
                similarities
            }
        };

        if similarities.len() != docs.len() {
            return Err(HarnessError::RetrievalService(format!(
                "expected {} scores, got {}",
                docs.len(),
                similarities.len()
            )));
        }
        debug!(docs = docs.len(), "candidates scored");
        Ok(similarities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::Value;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/dmr")
    }

    #[tokio::test]
    async fn sends_sentences_and_reads_similarities() {
        let app = Router::new().route(
            "/dmr",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["inputs"]["source_sentence"], "open the docs");
                assert_eq!(body["inputs"]["parameters"], serde_json::json!({}));
                let n = body["inputs"]["sentences"].as_array().unwrap().len();
                let scores: Vec<f64> = (0..n).map(|i| i as f64 / 10.0).collect();
                Json(serde_json::json!({ "similarities": scores }))
            }),
        );
        let client = RetrievalClient::new(serve(app).await, None);
        let scores = client
            .score("open the docs", &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.0, 0.1, 0.2]);
    }

    #[tokio::test]
    async fn accepts_a_bare_score_list() {
        let app = Router::new().route("/dmr", post(|| async { Json(serde_json::json!([0.5])) }));
        let client = RetrievalClient::new(serve(app).await, Some("token".into()));
        assert_eq!(client.score("q", &["d".into()]).await.unwrap(), vec![0.5]);
    }

    #[tokio::test]
    async fn non_success_status_is_a_retrieval_error() {
        let app = Router::new().route(
            "/dmr",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "loading") }),
        );
        let client = RetrievalClient::new(serve(app).await, None);
        match client.score("q", &["d".into()]).await {
            Err(HarnessError::RetrievalService(msg)) => assert!(msg.contains("503")),
            other => panic!("expected RetrievalService, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn misaligned_scores_are_rejected() {
        let app = Router::new().route(
            "/dmr",
            post(|| async { Json(serde_json::json!({ "similarities": [0.1] })) }),
        );
        let client = RetrievalClient::new(serve(app).await, None);
        let result = client.score("q", &["a".into(), "b".into()]).await;
        assert!(matches!(result, Err(HarnessError::RetrievalService(_))));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_retrieval_error() {
        let client = RetrievalClient::new("http://127.0.0.1:9/dmr", None);
        let result = client.score("q", &["a".into()]).await;
        assert!(matches!(result, Err(HarnessError::RetrievalService(_))));
    }
}

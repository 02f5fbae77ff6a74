/// Optional external task service
///
/// The engine can ask an external service what it makes of an unusual
/// situation, but the answer is advisory only: every failure mode (absent,
/// slow, malformed) collapses to `None` and control behavior is identical
/// with or without it.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::AdvisorConfig;

const REQUEST_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Recommendation {
    pub summary: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait TaskAdvisor: Send + Sync {
    async fn propose(&self, task: &str, context: &serde_json::Value) -> Option<Recommendation>;
}

/// The built-in fallback: no service, no recommendation.
pub struct NoAdvisor;

#[async_trait]
impl TaskAdvisor for NoAdvisor {
    async fn propose(&self, _task: &str, _context: &serde_json::Value) -> Option<Recommendation> {
        None
    }
}

/// Thin HTTP client for a configured advisory endpoint.
pub struct HttpAdvisor {
    url: String,
    client: reqwest::Client,
}

impl HttpAdvisor {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_DEADLINE)
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

#[async_trait]
impl TaskAdvisor for HttpAdvisor {
    async fn propose(&self, task: &str, context: &serde_json::Value) -> Option<Recommendation> {
        let body = serde_json::json!({ "task": task, "context": context });
        let response = match self.client.post(&self.url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "advisor unreachable");
                return None;
            }
        };
        match response.json::<Recommendation>().await {
            Ok(r) => Some(r),
            Err(e) => {
                debug!(error = %e, "advisor answer unusable");
                None
            }
        }
    }
}

pub fn from_config(config: &AdvisorConfig) -> Arc<dyn TaskAdvisor> {
    match &config.url {
        Some(url) => Arc::new(HttpAdvisor::new(url.clone())),
        None => Arc::new(NoAdvisor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_always_declines() {
        let advisor = NoAdvisor;
        let answer = advisor.propose("overheat_review", &serde_json::json!({})).await;
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn unreachable_service_degrades_to_none() {
        // TEST-NET address: nothing listens there.
        let advisor = HttpAdvisor::new("http://192.0.2.1:9/propose".to_string());
        let answer = advisor.propose("overheat_review", &serde_json::json!({"t": 1})).await;
        assert_eq!(answer, None, "network failure must look like no advice");
    }

    #[test]
    fn config_selects_the_backend() {
        let none = from_config(&AdvisorConfig { url: None });
        let some = from_config(&AdvisorConfig { url: Some("http://localhost/x".to_string()) });
        // Both are valid advisors; behavior differences only matter online.
        let _ = (none, some);
    }
}

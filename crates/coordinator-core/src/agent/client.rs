//! HTTP client for a worker's calls to the coordinator's REST API
//! (SPEC_FULL §6). A thin `reqwest` wrapper; every method maps one request
//! to one route and deserializes its JSON response, matching the shape
//! `original_source/.../agent_client.py`'s `requests.post` calls use against
//! the Flask orchestrator.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use coordinator_db::models::Task;

use crate::notify::TaskEvent;

/// Response to `POST /agent/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub config: serde_json::Value,
}

/// Response to `POST /agent/heartbeat`. Extended (additively) with any
/// notifications that were pending for this worker, folding the original's
/// separate Redis pub/sub listener into the heartbeat round trip rather than
/// holding a second long-lived connection.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

/// Response to `POST /task/claim`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimResponse {
    pub task: Option<Task>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for `POST /task/complete`.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteRequest {
    pub agent_id: String,
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

/// Client for a single worker's coordinator calls.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), http: reqwest::Client::new() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    pub async fn register(&self, session_tag: &str) -> Result<RegisterResponse> {
        self.http
            .post(self.url("/agent/register"))
            .json(&serde_json::json!({ "sessionTag": session_tag }))
            .send()
            .await
            .context("register request failed")?
            .error_for_status()
            .context("register returned an error status")?
            .json()
            .await
            .context("failed to decode register response")
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<HeartbeatResponse> {
        self.http
            .post(self.url("/agent/heartbeat"))
            .json(&serde_json::json!({ "agentId": agent_id }))
            .send()
            .await
            .context("heartbeat request failed")?
            .error_for_status()
            .context("heartbeat returned an error status")?
            .json()
            .await
            .context("failed to decode heartbeat response")
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        self.http
            .post(self.url("/agent/unregister"))
            .json(&serde_json::json!({ "agentId": agent_id }))
            .send()
            .await
            .context("unregister request failed")?
            .error_for_status()
            .context("unregister returned an error status")?;
        Ok(())
    }

    pub async fn claim_task(&self, agent_id: &str) -> Result<ClaimResponse> {
        self.http
            .post(self.url("/task/claim"))
            .json(&serde_json::json!({ "agentId": agent_id }))
            .send()
            .await
            .context("claim request failed")?
            .error_for_status()
            .context("claim returned an error status")?
            .json()
            .await
            .context("failed to decode claim response")
    }

    pub async fn complete_task(&self, req: &CompleteRequest) -> Result<()> {
        self.http
            .post(self.url("/task/complete"))
            .json(req)
            .send()
            .await
            .context("complete request failed")?
            .error_for_status()
            .context("complete returned an error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let client = CoordinatorClient::new("http://localhost:8080/");
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }
}

//! HTTP quality gate client.

use async_trait::async_trait;
use conveyor_core::ports::{QualityGate, QualityGateRequest, QualityVerdict};
use conveyor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateConfig {
    /// Endpoint that accepts analysis submissions.
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

#[derive(Serialize)]
struct Submission<'a> {
    run_id: String,
    job: &'a str,
    project: &'a str,
    sha: &'a str,
    sources: &'a [String],
    coverage_report: Option<String>,
}

/// Submits sources and coverage to an analysis service and maps its verdict.
///
/// The service answers `{"verdict": "pass"}`, `{"verdict": "fail", "reason": ...}`
/// or `{"verdict": "timeout"}`.
pub struct HttpQualityGate {
    client: reqwest::Client,
    config: QualityGateConfig,
}

impl HttpQualityGate {
    pub fn new(config: QualityGateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl QualityGate for HttpQualityGate {
    async fn submit(&self, request: &QualityGateRequest) -> Result<QualityVerdict> {
        let body = Submission {
            run_id: request.run_id.to_string(),
            job: &request.job,
            project: &request.project,
            sha: &request.sha,
            sources: &request.sources,
            coverage_report: request
                .coverage_report
                .as_ref()
                .map(|p| p.display().to_string()),
        };

        let mut call = self.client.post(&self.config.url).json(&body);
        if let Some(token) = &self.config.token {
            call = call.bearer_auth(token);
        }
        let response = match call.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(job = %request.job, "Quality gate did not answer in time");
                return Ok(QualityVerdict::Timeout);
            }
            Err(e) => return Err(Error::Api(format!("quality gate request failed: {e}"))),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api(format!("quality gate returned {status}")));
        }
        let verdict: QualityVerdict = response
            .json()
            .await
            .map_err(|e| Error::Api(format!("invalid quality gate response: {e}")))?;
        debug!(job = %request.job, ?verdict, "Quality gate verdict");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ids::RunId;
    use std::path::PathBuf;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> QualityGateRequest {
        QualityGateRequest {
            run_id: RunId::new(),
            job: "sonar".to_string(),
            project: "acme/webapp".to_string(),
            sha: "abc123".to_string(),
            sources: vec!["src/".to_string()],
            coverage_report: Some(PathBuf::from("/ws/coverage.xml")),
        }
    }

    fn gate(server: &MockServer) -> HttpQualityGate {
        HttpQualityGate::new(QualityGateConfig {
            url: format!("{}/analysis", server.uri()),
            token: Some("secret".to_string()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fail_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analysis"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"verdict": "fail", "reason": "coverage 41%"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let verdict = gate(&server).submit(&request()).await.unwrap();
        assert_eq!(
            verdict,
            QualityVerdict::Fail {
                reason: "coverage 41%".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_pass_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"verdict": "pass"})))
            .mount(&server)
            .await;
        assert_eq!(gate(&server).submit(&request()).await.unwrap(), QualityVerdict::Pass);
    }

    #[tokio::test]
    async fn test_server_error_is_api_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = gate(&server).submit(&request()).await.unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use kanbot_core::{AgentGateway, GatewayError, SpawnReceipt, SpawnRequest};
use kanbot_settings::GatewaySettings;

use crate::envelope::{InvokeBody, InvokeEnvelope};

const INVOKE_PATH: &str = "/tools/invoke";
const HEALTH_PATH: &str = "/health";
const MAX_REASON_LEN: usize = 512;

/// HTTP client for the agent gateway. One attempt per call; retries belong
/// to the caller.
pub struct HttpGateway {
    client: Client,
    invoke_url: String,
    health_url: String,
    token: Option<SecretString>,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            invoke_url: format!("{base}{INVOKE_PATH}"),
            health_url: format!("{base}{HEALTH_PATH}"),
            token,
            timeout,
        })
    }

    pub fn from_settings(settings: &GatewaySettings) -> Result<Self, reqwest::Error> {
        Self::new(
            &settings.base_url,
            settings.token.clone(),
            Duration::from_millis(settings.spawn_timeout_ms),
        )
    }

    fn transport_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Unreachable(err.to_string())
        }
    }

    async fn decode(&self, resp: Response) -> Result<InvokeEnvelope, GatewayError> {
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            let reason: String = text.chars().take(MAX_REASON_LEN).collect();
            return Err(GatewayError::from_status(status.as_u16(), reason));
        }

        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::MalformedResponse(format!("undecodable envelope: {e}")))
    }
}

#[async_trait]
impl AgentGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(task_id = request.task_id().get(), agent = %request.agent_id))]
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnReceipt, GatewayError> {
        let mut req = self
            .client
            .post(&self.invoke_url)
            .header("accept", "application/json")
            .json(&InvokeBody::from(request));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        let envelope = self.decode(resp).await?;
        if let Some(summary) = envelope.summary() {
            debug!(summary, "gateway summary");
        }
        envelope.into_receipt()
    }

    async fn health_check(&self) -> bool {
        let mut req = self.client.get(&self.health_url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "gateway health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanbot_core::{AgentId, TaskContext, TaskId};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> SpawnRequest {
        SpawnRequest {
            agent_id: AgentId::from_raw("architect"),
            context: TaskContext {
                task_id: TaskId::new(14),
                title: "Design API".into(),
                instructions: "Draft the schema".into(),
            },
        }
    }

    fn gateway(server: &MockServer, timeout: Duration) -> HttpGateway {
        HttpGateway::new(&server.uri(), Some(SecretString::from("t0ken")), timeout).unwrap()
    }

    #[tokio::test]
    async fn spawn_success_extracts_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/invoke"))
            .and(header("authorization", "Bearer t0ken"))
            .and(body_partial_json(json!({ "agentId": "architect", "context": { "taskId": 14 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {
                    "content": [{ "type": "text", "text": "spawned something" }],
                    "details": {
                        "status": "accepted",
                        "runId": "r1",
                        "childSessionKey": "agent:architect:subagent:99"
                    }
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = gateway(&server, Duration::from_secs(2))
            .spawn(&request())
            .await
            .unwrap();
        assert_eq!(receipt.session_key.as_str(), "agent:architect:subagent:99");
        assert_eq!(receipt.run_id.unwrap().as_str(), "r1");
    }

    #[tokio::test]
    async fn ok_false_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/invoke"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "ok": false, "error": "unknown agent" })),
            )
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_secs(2))
            .spawn(&request())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Rejected { status: None, reason: "unknown agent".into() });
    }

    #[tokio::test]
    async fn server_error_is_rejected_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_secs(2))
            .spawn(&request())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::from_status(500, "boom".into()));
    }

    #[tokio::test]
    async fn missing_details_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": { "content": [{ "type": "text", "text": "childSessionKey: agent:x:1" }] }
            })))
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_secs(2))
            .spawn(&request())
            .await
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_secs(2))
            .spawn(&request())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "malformed-response");
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({ "ok": true })),
            )
            .mount(&server)
            .await;

        let err = gateway(&server, Duration::from_millis(100))
            .spawn(&request())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout(Duration::from_millis(100)));
        assert_eq!(err.error_kind(), "unreachable");
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let gw = HttpGateway::new("http://127.0.0.1:1", None, Duration::from_secs(1)).unwrap();
        let err = gw.spawn(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!gw.health_check().await);
    }

    #[tokio::test]
    async fn health_check_follows_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(gateway(&server, Duration::from_secs(1)).health_check().await);

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        assert!(!gateway(&down, Duration::from_secs(1)).health_check().await);
    }

    #[test]
    fn urls_are_joined_without_double_slash() {
        let gw = HttpGateway::new("http://gw:18789/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(gw.invoke_url, "http://gw:18789/tools/invoke");
        assert_eq!(gw.health_url, "http://gw:18789/health");
    }
}

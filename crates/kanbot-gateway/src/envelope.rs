//! Wire types for the gateway's `/tools/invoke` endpoint.
//!
//! A successful response nests the structured spawn result two levels down:
//!
//! ```json
//! {
//!   "ok": true,
//!   "result": {
//!     "content": [{ "type": "text", "text": "Spawned architect (run r1)" }],
//!     "details": { "status": "accepted", "runId": "r1", "childSessionKey": "agent:architect:subagent:99" }
//!   }
//! }
//! ```
//!
//! `content` is a human summary whose wording the gateway is free to change.
//! Only `details` is read for structured fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kanbot_core::{GatewayError, RunId, SessionKey, SpawnReceipt, SpawnRequest, TaskContext};

/// Request body for `POST /tools/invoke`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeBody<'a> {
    pub agent_id: &'a str,
    pub context: &'a TaskContext,
}

impl<'a> From<&'a SpawnRequest> for InvokeBody<'a> {
    fn from(request: &'a SpawnRequest) -> Self {
        Self {
            agent_id: request.agent_id.as_str(),
            context: &request.context,
        }
    }
}

/// Top-level response envelope.
#[derive(Clone, Debug, Deserialize)]
pub struct InvokeEnvelope {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<InvokeResult>,
    /// Free-form on failure: a string or an object with a `message`.
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InvokeResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub details: Option<SpawnDetails>,
}

/// Display-only summary block.
#[derive(Clone, Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnDetails {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub child_session_key: Option<String>,
}

impl InvokeEnvelope {
    /// First text block of `result.content`, for logs only.
    pub fn summary(&self) -> Option<&str> {
        self.result
            .as_ref()?
            .content
            .iter()
            .find_map(|block| block.text.as_deref())
    }

    /// Validate the envelope and pull out the spawn receipt.
    pub fn into_receipt(self) -> Result<SpawnReceipt, GatewayError> {
        if !self.ok {
            return Err(GatewayError::Rejected {
                status: None,
                reason: self
                    .error
                    .as_ref()
                    .map(describe_error)
                    .unwrap_or_else(|| "ok=false".to_string()),
            });
        }

        let result = self.result.ok_or_else(|| {
            GatewayError::MalformedResponse("ok=true without result".into())
        })?;
        let details = result.details.ok_or_else(|| {
            GatewayError::MalformedResponse("result.details missing".into())
        })?;
        let session_key = details
            .child_session_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::MalformedResponse("result.details.childSessionKey missing".into())
            })?;

        Ok(SpawnReceipt {
            status: details.status.unwrap_or_else(|| "unknown".to_string()),
            run_id: details.run_id.filter(|id| !id.is_empty()).map(RunId::from_raw),
            session_key: SessionKey::from_raw(session_key),
        })
    }
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

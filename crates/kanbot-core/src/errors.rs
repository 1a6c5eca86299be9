use std::time::Duration;

/// Why a spawn request did not produce a session.
///
/// `Unreachable` and `Timeout` share the `unreachable` classification;
/// `MalformedResponse` is kept apart from `Rejected` because it means the
/// gateway's response contract drifted, not that it declined the request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("gateway timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway rejected spawn{}: {reason}", status_suffix(.status))]
    Rejected { status: Option<u16>, reason: String },

    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
}

impl GatewayError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }

    /// Contract drift with the gateway; reported louder than a rejection.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::MalformedResponse(_))
    }

    /// Short classification string for logging and the task's `spawn_error`.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => "unreachable",
            Self::Rejected { .. } => "rejected",
            Self::MalformedResponse(_) => "malformed-response",
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        Self::Rejected {
            status: Some(status),
            reason: body,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

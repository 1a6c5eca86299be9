use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use kanbot_core::{AgentGateway, GatewayError, RunId, SessionKey, SpawnReceipt, SpawnRequest};

/// Pre-programmed outcome for one spawn call.
pub enum MockSpawn {
    Accept {
        session_key: String,
        run_id: Option<String>,
    },
    Error(GatewayError),
    /// Wait a duration, then resolve the inner outcome.
    Delay(Duration, Box<MockSpawn>),
}

impl MockSpawn {
    pub fn accepted(session_key: &str) -> Self {
        Self::Accept {
            session_key: session_key.to_string(),
            run_id: None,
        }
    }

    pub fn accepted_with_run(session_key: &str, run_id: &str) -> Self {
        Self::Accept {
            session_key: session_key.to_string(),
            run_id: Some(run_id.to_string()),
        }
    }

    pub fn delayed(delay: Duration, inner: MockSpawn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Gateway stand-in that plays back scripted outcomes in order and records
/// every request it sees.
pub struct MockGateway {
    script: Mutex<VecDeque<MockSpawn>>,
    requests: Mutex<Vec<SpawnRequest>>,
    call_count: AtomicUsize,
    healthy: AtomicBool,
}

impl MockGateway {
    pub fn new(script: Vec<MockSpawn>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnReceipt, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let mut next = self.script.lock().pop_front().ok_or_else(|| GatewayError::Rejected {
            status: None,
            reason: format!("MockGateway: no response configured for call {idx}"),
        })?;

        loop {
            match next {
                MockSpawn::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    next = *inner;
                }
                MockSpawn::Error(err) => return Err(err),
                MockSpawn::Accept {
                    session_key,
                    run_id,
                } => {
                    return Ok(SpawnReceipt {
                        status: "accepted".to_string(),
                        run_id: run_id.map(RunId::from_raw),
                        session_key: SessionKey::from_raw(session_key),
                    })
                }
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

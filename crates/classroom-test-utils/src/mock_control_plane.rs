//! Mock control plane for session testing.
//!
//! Configurable to:
//! - answer `enter` with a given payload, or reject it
//! - fail any other operation with a given error
//! - hold calls of one operation in flight until released
//!
//! Every call is recorded before it is held, so a test can observe an
//! in-flight call and then decide when it completes.
//!
//! # Example
//!
//! ```rust,ignore
//! use classroom_test_utils::MockControlPlane;
//!
//! let control_plane = MockControlPlane::builder()
//!     .enter_with(enter_response("s1"))
//!     .hold("upsert_stream")
//!     .build();
//!
//! // ... issue a publish, then:
//! control_plane.wait_for_calls("upsert_stream", 1).await;
//! control_plane.release("upsert_stream");
//! ```

use async_trait::async_trait;
use classroom_session::control_plane::{
    CallContext, ControlPlane, ControlPlaneRequest, ControlPlaneResponse, EnterResponse,
};
use classroom_session::EduError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// One recorded control-plane call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub ctx: CallContext,
    pub request: ControlPlaneRequest,
}

/// Mock control plane.
pub struct MockControlPlane {
    enter: Mutex<Result<EnterResponse, EduError>>,
    failures: Mutex<HashMap<&'static str, EduError>>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockControlPlane {
    /// Create a MockControlPlane builder.
    #[must_use]
    pub fn builder() -> MockControlPlaneBuilder {
        MockControlPlaneBuilder::default()
    }

    /// Control plane that accepts every call, assigning stream id `s1`.
    #[must_use]
    pub fn accepting() -> Arc<Self> {
        Self::builder().build()
    }

    /// Replace the `enter` outcome for subsequent joins.
    pub fn set_enter(&self, outcome: Result<EnterResponse, EduError>) {
        *self.enter.lock().unwrap() = outcome;
    }

    /// Fail every later call of `operation`.
    pub fn fail(&self, operation: &'static str, error: EduError) {
        self.failures.lock().unwrap().insert(operation, error);
    }

    /// Let later calls of `operation` succeed again.
    pub fn recover(&self, operation: &'static str) {
        self.failures.lock().unwrap().remove(operation);
    }

    /// Hold every later call of `operation` until [`Self::release`].
    pub fn hold(&self, operation: &'static str) {
        self.gates
            .lock()
            .unwrap()
            .insert(operation, Arc::new(Semaphore::new(0)));
    }

    /// Let every held call of `operation` complete.
    pub fn release(&self, operation: &'static str) {
        if let Some(gate) = self.gates.lock().unwrap().remove(operation) {
            gate.close();
        }
    }

    /// Every call so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests of one operation, in arrival order.
    #[must_use]
    pub fn requests(&self, operation: &str) -> Vec<ControlPlaneRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.request.operation() == operation)
            .map(|call| call.request.clone())
            .collect()
    }

    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        self.requests(operation).len()
    }

    /// Wait until at least `count` calls of `operation` were made.
    pub async fn wait_for_calls(&self, operation: &str, count: usize) -> bool {
        crate::wait_until(|| self.call_count(operation) >= count).await
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn execute(
        &self,
        ctx: CallContext,
        request: ControlPlaneRequest,
    ) -> Result<ControlPlaneResponse, EduError> {
        let operation = request.operation();
        self.calls.lock().unwrap().push(RecordedCall {
            ctx,
            request: request.clone(),
        });

        let gate = self.gates.lock().unwrap().get(operation).cloned();
        if let Some(gate) = gate {
            // Closed on release; the error just means "go ahead"
            let _ = gate.acquire().await;
        }

        if let Some(error) = self.failures.lock().unwrap().get(operation).cloned() {
            return Err(error);
        }

        match request {
            ControlPlaneRequest::Enter { .. } => {
                self.enter.lock().unwrap().clone().map(ControlPlaneResponse::Entered)
            }
            _ => Ok(ControlPlaneResponse::Done),
        }
    }
}

/// Builder for MockControlPlane configuration.
#[derive(Default)]
pub struct MockControlPlaneBuilder {
    enter: Option<Result<EnterResponse, EduError>>,
    failures: HashMap<&'static str, EduError>,
    held: Vec<&'static str>,
}

impl MockControlPlaneBuilder {
    /// Answer `enter` with this payload.
    #[must_use]
    pub fn enter_with(mut self, response: EnterResponse) -> Self {
        self.enter = Some(Ok(response));
        self
    }

    /// Reject `enter` with this error.
    #[must_use]
    pub fn reject_enter(mut self, error: EduError) -> Self {
        self.enter = Some(Err(error));
        self
    }

    /// Answer `enter` with an empty stream id (no role slot left).
    #[must_use]
    pub fn role_full(self) -> Self {
        self.enter_with(crate::fixtures::enter_response(""))
    }

    /// Fail every call of `operation`.
    #[must_use]
    pub fn fail(mut self, operation: &'static str, error: EduError) -> Self {
        self.failures.insert(operation, error);
        self
    }

    /// Hold calls of `operation` until released.
    #[must_use]
    pub fn hold(mut self, operation: &'static str) -> Self {
        self.held.push(operation);
        self
    }

    /// Build the MockControlPlane.
    #[must_use]
    pub fn build(self) -> Arc<MockControlPlane> {
        let mock = MockControlPlane {
            enter: Mutex::new(
                self.enter
                    .unwrap_or_else(|| Ok(crate::fixtures::enter_response("s1"))),
            ),
            failures: Mutex::new(self.failures),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        };
        for operation in self.held {
            mock.hold(operation);
        }
        Arc::new(mock)
    }
}

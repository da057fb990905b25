//! Mock implementations for testing

use async_trait::async_trait;
use irods_core::{ExternalCredential, SecurityContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// First token sent by a mock context, followed by the principal
pub const CLIENT_TOKEN_PREFIX: &str = "mock-init:";

/// Token the mock server answers with to complete a context
pub const SERVER_TOKEN: &[u8] = b"mock-accept";

/// External credential that runs a two-message handshake understood by
/// the mock server
#[derive(Debug, Clone)]
pub struct MockCredential {
    principal: String,
    contexts: Arc<AtomicUsize>,
    last_server: Arc<Mutex<Option<String>>>,
}

impl MockCredential {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            contexts: Arc::new(AtomicUsize::new(0)),
            last_server: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of contexts started with this credential
    pub fn context_count(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }

    /// Server principal the last context was started for
    pub fn last_server_name(&self) -> Option<String> {
        self.last_server.lock().clone()
    }
}

impl ExternalCredential for MockCredential {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn init_context(&self, server_name: &str) -> irods_core::Result<Box<dyn SecurityContext>> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        *self.last_server.lock() = Some(server_name.to_string());
        Ok(Box::new(MockContext {
            principal: self.principal.clone(),
            established: false,
        }))
    }
}

struct MockContext {
    principal: String,
    established: bool,
}

#[async_trait]
impl SecurityContext for MockContext {
    async fn step(&mut self, input: Option<&[u8]>) -> irods_core::Result<Option<Vec<u8>>> {
        match input {
            None => Ok(Some(
                format!("{}{}", CLIENT_TOKEN_PREFIX, self.principal).into_bytes(),
            )),
            Some(token) if token == SERVER_TOKEN => {
                self.established = true;
                Ok(None)
            }
            Some(other) => Err(irods_core::Error::SecurityContext(format!(
                "unexpected server token of {} bytes",
                other.len()
            ))),
        }
    }

    fn is_established(&self) -> bool {
        self.established
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_context_handshake() {
        let credential = MockCredential::new("alice@EXAMPLE.ORG");
        let mut context = credential.init_context("irods/server@EXAMPLE.ORG").unwrap();
        assert_eq!(credential.context_count(), 1);
        assert_eq!(
            credential.last_server_name().as_deref(),
            Some("irods/server@EXAMPLE.ORG")
        );

        let first = context.step(None).await.unwrap().unwrap();
        assert_eq!(first, b"mock-init:alice@EXAMPLE.ORG");
        assert!(!context.is_established());

        assert!(context.step(Some(SERVER_TOKEN)).await.unwrap().is_none());
        assert!(context.is_established());
    }

    #[tokio::test]
    async fn test_mock_context_rejects_unknown_token() {
        let credential = MockCredential::new("alice");
        let mut context = credential.init_context("server").unwrap();
        assert!(context.step(Some(b"garbage")).await.is_err());
    }
}

//! Scriptable in-memory backend for tests.
//!
//! Every call is recorded. A call is answered either from a canned response
//! registered beforehand with [`MockBackend::when`], or it stays pending until
//! the test answers it with [`MockBackend::respond`] / [`MockBackend::fail`].
//! Pending calls let a test observe cache and view state before a response
//! arrives.

use super::{Backend, Method};
use crate::error::{Error, Result};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type Reply = Result<Option<Value>>;

/// A call the backend received.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

struct Canned {
    method: Method,
    url: String,
    reply: Reply,
}

struct PendingCall {
    method: Method,
    url: String,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct MockState {
    canned: VecDeque<Canned>,
    pending: VecDeque<PendingCall>,
    calls: Vec<RecordedCall>,
}

/// Scriptable backend.
///
/// # Example
///
/// ```no_run
/// use entity_sync::backend::{Backend, Method, MockBackend};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = MockBackend::new();
///
///     // Answered immediately
///     backend.when(Method::Get, "/api/people").respond(json!([{"id": 1}]));
///     let body = backend.call(Method::Get, "/api/people", None).await?;
///     assert_eq!(body, Some(json!([{"id": 1}])));
///
///     // Answered later
///     let call = backend.call(Method::Get, "/api/people/1", None);
///     backend.respond(Method::Get, "/api/people/1", json!({"id": 1}))?;
///     assert!(call.await?.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

/// Canned response under construction, see [`MockBackend::when`].
pub struct Stub<'a> {
    backend: &'a MockBackend,
    method: Method,
    url: String,
}

impl Stub<'_> {
    /// Answer the next matching call with `body`.
    pub fn respond(self, body: Value) {
        self.reply(Ok(Some(body)));
    }

    /// Answer the next matching call with no body.
    pub fn respond_empty(self) {
        self.reply(Ok(None));
    }

    /// Fail the next matching call with a transport failure.
    pub fn fail(self, message: &str) {
        self.reply(Err(Error::TransportFailure(message.to_string())));
    }

    fn reply(self, reply: Reply) {
        self.backend.lock().canned.push_back(Canned {
            method: self.method,
            url: self.url,
            reply,
        });
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot canned response for the next matching call.
    pub fn when(&self, method: Method, url: &str) -> Stub<'_> {
        Stub {
            backend: self,
            method,
            url: url.to_string(),
        }
    }

    /// Answer the oldest pending matching call with `body`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Other` if no matching call is pending.
    pub fn respond(&self, method: Method, url: &str, body: Value) -> Result<()> {
        self.answer(method, url, Ok(Some(body)))
    }

    /// Answer the oldest pending matching call with no body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Other` if no matching call is pending.
    pub fn respond_empty(&self, method: Method, url: &str) -> Result<()> {
        self.answer(method, url, Ok(None))
    }

    /// Fail the oldest pending matching call with a transport failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::Other` if no matching call is pending.
    pub fn fail(&self, method: Method, url: &str, message: &str) -> Result<()> {
        self.answer(
            method,
            url,
            Err(Error::TransportFailure(message.to_string())),
        )
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of calls received for `method` and `url`.
    pub fn calls_to(&self, method: Method, url: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.url == url)
            .count()
    }

    /// Number of calls still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn answer(&self, method: Method, url: &str, reply: Reply) -> Result<()> {
        let mut state = self.lock();
        let index = state
            .pending
            .iter()
            .position(|p| p.method == method && p.url == url)
            .ok_or_else(|| Error::Other(format!("no pending {} {}", method, url)))?;
        let call = state.pending.remove(index).ok_or_else(|| {
            Error::Other(format!("pending {} {} vanished", method, url))
        })?;
        drop(state);

        // The caller may have dropped its future; that is not an error here.
        let _ = call.reply.send(reply);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MockBackend {
    fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            method,
            url: url.to_string(),
            body,
        });

        if let Some(index) = state
            .canned
            .iter()
            .position(|c| c.method == method && c.url == url)
        {
            if let Some(canned) = state.canned.remove(index) {
                debug!("✓ Mock {} {} -> canned", method, url);
                return future::ready(canned.reply).boxed();
            }
        }

        let (tx, rx) = oneshot::channel();
        state.pending.push_back(PendingCall {
            method,
            url: url.to_string(),
            reply: tx,
        });
        debug!("» Mock {} {} -> pending", method, url);

        async move {
            rx.await.unwrap_or_else(|_| {
                Err(Error::TransportFailure(
                    "mock backend dropped the request".to_string(),
                ))
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_canned_response_is_consumed_once() {
        let backend = MockBackend::new();
        backend
            .when(Method::Get, "/api/people")
            .respond(json!([{"id": 1}]));

        let first = backend
            .call(Method::Get, "/api/people", None)
            .await
            .expect("Call failed");
        assert_eq!(first, Some(json!([{"id": 1}])));

        let _second = backend.call(Method::Get, "/api/people", None);
        assert_eq!(backend.pending(), 1);
        assert_eq!(backend.calls_to(Method::Get, "/api/people"), 2);
    }

    #[tokio::test]
    async fn test_pending_call_answered_later() {
        let backend = MockBackend::new();

        let call = backend.call(Method::Post, "/api/people", Some(json!({"first_name": "Joe"})));
        assert_eq!(backend.pending(), 1);

        backend
            .respond(Method::Post, "/api/people", json!({"id": 7}))
            .expect("Respond failed");

        assert_eq!(call.await.expect("Call failed"), Some(json!({"id": 7})));
        assert_eq!(
            backend.calls(),
            vec![RecordedCall {
                method: Method::Post,
                url: "/api/people".to_string(),
                body: Some(json!({"first_name": "Joe"})),
            }]
        );
    }

    #[tokio::test]
    async fn test_failures() {
        let backend = MockBackend::new();
        backend.when(Method::Delete, "/api/people/1").fail("500");

        let err = backend
            .call(Method::Delete, "/api/people/1", None)
            .await
            .unwrap_err();
        assert_eq!(err, Error::TransportFailure("500".to_string()));

        let call = backend.call(Method::Get, "/api/people/2", None);
        backend
            .fail(Method::Get, "/api/people/2", "timeout")
            .expect("Fail failed");
        assert!(call.await.unwrap_err().is_transport());
    }

    #[test]
    fn test_respond_without_pending_call() {
        let backend = MockBackend::new();
        let err = backend
            .respond_empty(Method::Get, "/api/people")
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }
}

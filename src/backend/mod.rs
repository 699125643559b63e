//! Backend callers: the transport that performs the actual request.
//!
//! A backend receives a method, a URL (`namespace` or `namespace/id`) and an
//! optional JSON body, and resolves to the response body. The cache never
//! inspects status codes or headers; anything the transport considers a
//! failure must surface as `Err(Error::TransportFailure(..))`.

use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub mod mock;

pub use mock::{MockBackend, RecordedCall};

/// Request method of a backend call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Trait for backend callers.
///
/// `call` is invoked synchronously when a request is issued and must only
/// build the future; it must not call back into the cache. The returned
/// future is driven on the current tokio runtime.
///
/// # Returns
/// - `Ok(Some(body))` - Response body
/// - `Ok(None)` - Response without a body (e.g. `204 No Content`)
///
/// # Errors
/// Resolves to `Err(Error::TransportFailure)` when the call fails.
pub trait Backend: Send + Sync {
    fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>>>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        (**self).call(method, url, body)
    }
}

/// Backend built from a closure.
///
/// # Example
///
/// ```ignore
/// use entity_sync::backend::{FnBackend, Method};
///
/// let backend = FnBackend::new(|method: Method, url: String, body| async move {
///     my_http_client.send(method, &url, body).await
/// });
/// ```
pub struct FnBackend<F> {
    call: F,
}

impl<F> FnBackend<F> {
    pub fn new(call: F) -> Self {
        FnBackend { call }
    }
}

impl<F, Fut> Backend for FnBackend<F>
where
    F: Fn(Method, String, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        (self.call)(method, url.to_string(), body).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::Post.to_string(), "POST");
        assert_eq!(Method::Put.to_string(), "PUT");
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }

    #[tokio::test]
    async fn test_fn_backend_forwards_call() {
        let backend = FnBackend::new(|method: Method, url: String, body: Option<Value>| async move {
            Ok::<_, Error>(Some(
                json!({ "method": method.to_string(), "url": url, "body": body }),
            ))
        });

        let body = backend
            .call(Method::Put, "/api/people/3", Some(json!({"first_name": "Test"})))
            .await
            .expect("Call failed");

        assert_eq!(
            body,
            Some(json!({
                "method": "PUT",
                "url": "/api/people/3",
                "body": {"first_name": "Test"}
            }))
        );
    }

    #[tokio::test]
    async fn test_arc_backend_delegates() {
        let backend: Arc<dyn Backend> = Arc::new(FnBackend::new(
            |_: Method, url: String, _: Option<Value>| async move {
                Err::<Option<Value>, _>(Error::TransportFailure(format!("{} unreachable", url)))
            },
        ));

        let err = backend.call(Method::Get, "/api/people", None).await.unwrap_err();
        assert!(err.is_transport());
    }
}

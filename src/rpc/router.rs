//! Inbound method handler registration.
//!
//! Request handlers are invoked synchronously in arrival order and return a
//! future; the synchronous part may inspect or mutate session state before
//! any other message is looked at, while the returned future runs
//! concurrently with later messages. Notification handlers run to completion
//! in arrival order since they can change the meaning of later messages.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::rpc::protocol::ResponseError;

/// Result type of request handlers.
pub type HandlerResult = Result<Value, ResponseError>;

/// How the session ended, decided by the `exit` notification or the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// `shutdown` was answered before `exit`.
    Clean,
    /// `exit` arrived without a prior `shutdown`.
    ExitWithoutShutdown,
    /// The channel failed or closed unexpectedly.
    TransportFailure,
}

impl ExitStatus {
    /// Process exit code for this status.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::ExitWithoutShutdown => 1,
            Self::TransportFailure => 2,
        }
    }
}

/// Boxes a handler future, fixing its output to [`HandlerResult`].
pub fn boxed<F>(fut: F) -> BoxFuture<'static, HandlerResult>
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    Box::pin(fut)
}

type RequestHandler =
    Box<dyn Fn(Option<Value>, CancellationToken) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type NotificationHandler = Box<dyn Fn(Option<Value>) -> ControlFlow<ExitStatus> + Send + Sync>;
type RequestGate = Box<dyn Fn(&str) -> Result<(), ResponseError> + Send + Sync>;

/// Method-name dispatch table.
#[derive(Default)]
pub struct Router {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
    gate: Option<RequestGate>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request handler, replacing any previous one.
    pub fn request<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>, CancellationToken) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        let method = method.into();
        if self.requests.insert(method.clone(), Box::new(handler)).is_some() {
            tracing::warn!(method = %method, "Request handler replaced");
        }
        self
    }

    /// Installs a check run on every request before method lookup. An error
    /// becomes the response, whether or not the method is registered.
    pub fn gate<F>(&mut self, gate: F) -> &mut Self
    where
        F: Fn(&str) -> Result<(), ResponseError> + Send + Sync + 'static,
    {
        self.gate = Some(Box::new(gate));
        self
    }

    /// Registers a notification handler, replacing any previous one.
    pub fn notification<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>) -> ControlFlow<ExitStatus> + Send + Sync + 'static,
    {
        let method = method.into();
        if self
            .notifications
            .insert(method.clone(), Box::new(handler))
            .is_some()
        {
            tracing::warn!(method = %method, "Notification handler replaced");
        }
        self
    }

    /// Returns true if a request handler is registered for `method`.
    #[must_use]
    pub fn handles_request(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    /// Starts handling a request; unknown methods resolve to "method not found".
    pub(crate) fn dispatch_request(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> BoxFuture<'static, HandlerResult> {
        if let Some(Err(err)) = self.gate.as_ref().map(|gate| gate(method)) {
            return boxed(async move { Err(err) });
        }
        match self.requests.get(method) {
            Some(handler) => handler(params, token),
            None => {
                let err = ResponseError::method_not_found(method);
                boxed(async move { Err(err) })
            }
        }
    }

    /// Handles a notification to completion.
    pub(crate) fn dispatch_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> ControlFlow<ExitStatus> {
        match self.notifications.get(method) {
            Some(handler) => handler(params),
            None if method.starts_with("$/") => ControlFlow::Continue(()),
            None => {
                tracing::warn!(method = %method, "Dropping unhandled notification");
                ControlFlow::Continue(())
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut requests: Vec<_> = self.requests.keys().collect();
        requests.sort();
        let mut notifications: Vec<_> = self.notifications.keys().collect();
        notifications.sort();
        f.debug_struct("Router")
            .field("requests", &requests)
            .field("notifications", &notifications)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::ErrorCode;

    #[tokio::test]
    async fn unknown_request_is_method_not_found() {
        let router = Router::new();
        let err = router
            .dispatch_request("textDocument/hover", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound.code());
        assert!(err.message.contains("textDocument/hover"));
    }

    #[tokio::test]
    async fn registered_request_receives_params() {
        let mut router = Router::new();
        router.request("echo", |params, _token| {
            boxed(async move { Ok(params.unwrap_or(Value::Null)) })
        });
        assert!(router.handles_request("echo"));
        let result = router
            .dispatch_request("echo", Some(serde_json::json!([1, 2])), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn gate_runs_before_method_lookup() {
        let mut router = Router::new();
        router
            .request("open", |_, _| boxed(async { Ok(Value::Null) }))
            .gate(|method| {
                if method == "open" {
                    Ok(())
                } else {
                    Err(ResponseError::from_code(ErrorCode::ServerNotInitialized))
                }
            });

        let ok = router.dispatch_request("open", None, CancellationToken::new()).await;
        assert_eq!(ok.unwrap(), Value::Null);
        let err = router
            .dispatch_request("never/registered", None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerNotInitialized.code());
    }

    #[test]
    fn notification_can_break_the_loop() {
        let mut router = Router::new();
        router.notification("exit", |_| ControlFlow::Break(ExitStatus::Clean));
        assert_eq!(
            router.dispatch_notification("exit", None),
            ControlFlow::Break(ExitStatus::Clean)
        );
        assert_eq!(
            router.dispatch_notification("$/progress", None),
            ControlFlow::Continue(())
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_ne!(ExitStatus::ExitWithoutShutdown.code(), 0);
        assert_ne!(ExitStatus::TransportFailure.code(), 0);
    }
}

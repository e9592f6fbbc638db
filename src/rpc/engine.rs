//! Request/response correlation, cancellation and batch handling.
//!
//! The engine owns two tables:
//!
//! - the **in-flight table**: inbound request id → cancellation token, so
//!   `$/cancelRequest` can reach the running handler
//! - the **pending table** (inside [`Peer`]): outbound request id → waiter,
//!   so responses from the client resolve [`Peer::call`]
//!
//! Both tables are guarded by their own lock and are only touched briefly;
//! handler futures run outside of them.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::rpc::protocol::{
    parse_message, ErrorCode, Incoming, Message, Notification, Outcome, Request, RequestId,
    Response, ResponseError,
};
use crate::rpc::router::{ExitStatus, Router};

/// Method name of the cancellation notification.
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

#[derive(Debug, Deserialize)]
struct CancelParams {
    id: RequestId,
}

type Waiter = oneshot::Sender<Result<Value, ResponseError>>;

struct PeerInner {
    outgoing: mpsc::UnboundedSender<Value>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, Waiter>>,
}

/// Handle for sending messages to the client. Cheap to clone.
///
/// Every message goes through one queue drained by a single writer task,
/// so frames from concurrent producers never interleave.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Creates a peer handle and the receiving end of its outgoing queue.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let peer = Self {
            inner: Arc::new(PeerInner {
                outgoing,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        };
        (peer, rx)
    }

    /// Queues a raw JSON message. Returns false once the writer is gone.
    pub fn send(&self, value: Value) -> bool {
        self.inner.outgoing.send(value).is_ok()
    }

    /// Sends a notification (fire-and-forget).
    pub fn notify(&self, method: &str, params: Option<Value>) -> bool {
        match serde_json::to_value(Notification::new(method, params)) {
            Ok(value) => self.send(value),
            Err(e) => {
                tracing::error!(method = %method, error = %e, "Failed to serialise notification");
                false
            }
        }
    }

    /// Sends a request and waits for the correlated response.
    ///
    /// Ids are locally generated, monotonically increasing integers and are
    /// never reused.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Response`] if the client answers with an error and
    /// [`RpcError::Disconnected`] if the connection closes first.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            peer: self,
            id,
        };

        let request = Request::new(RequestId::Number(id), method, params);
        let sent = serde_json::to_value(&request)
            .map(|value| self.send(value))
            .unwrap_or(false);
        if !sent {
            return Err(RpcError::Disconnected);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(RpcError::Response(error)),
            Err(_) => Err(RpcError::Disconnected),
        }
    }

    /// Routes a response from the client to its waiting caller.
    ///
    /// Responses whose id matches nothing outstanding are logged and
    /// discarded.
    pub(crate) fn complete(&self, response: Response) {
        let waiter = match &response.id {
            Some(RequestId::Number(n)) => self.inner.pending.lock().remove(n),
            _ => None,
        };
        let Some(waiter) = waiter else {
            tracing::debug!(id = ?response.id, "Discarding response with no matching request");
            return;
        };
        let result = match response.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(error),
        };
        // The caller may have given up already.
        let _ = waiter.send(result);
    }

    /// Fails every outstanding call with [`RpcError::Disconnected`].
    pub(crate) fn fail_pending(&self) {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Dropping outstanding outgoing requests");
        }
    }

    /// Number of outgoing requests still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn send_response(&self, response: &Response) {
        match serde_json::to_value(response) {
            Ok(value) => {
                if !self.send(value) {
                    tracing::debug!(id = ?response.id, "Writer closed, response dropped");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialise response"),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry when the caller stops waiting.
struct PendingGuard<'a> {
    peer: &'a Peer,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.peer.inner.pending.lock().remove(&self.id);
    }
}

/// The JSON-RPC engine: decodes frames, dispatches through the [`Router`]
/// and correlates responses.
pub struct RpcEngine {
    router: Router,
    peer: Peer,
    inflight: Arc<Mutex<HashMap<RequestId, CancellationToken>>>,
}

impl RpcEngine {
    /// Creates an engine over a frozen router.
    #[must_use]
    pub fn new(router: Router, peer: Peer) -> Self {
        Self {
            router,
            peer,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The outgoing handle.
    #[must_use]
    pub const fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Number of inbound requests that have not been answered yet.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Signals the cancellation token of an in-flight request.
    ///
    /// Returns false when the id is unknown (already answered or never
    /// seen); that is not an error.
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.inflight.lock().get(id) {
            Some(token) => {
                tracing::debug!(id = %id, "Cancelling request");
                token.cancel();
                true
            }
            None => {
                tracing::debug!(id = %id, "Cancellation target not in flight");
                false
            }
        }
    }

    /// Cancels every in-flight request.
    pub fn cancel_all(&self) {
        for token in self.inflight.lock().values() {
            token.cancel();
        }
    }

    /// Handles one received frame.
    ///
    /// Returns `Break` when a handler ended the session.
    pub fn handle_frame(&self, body: &[u8]) -> ControlFlow<ExitStatus> {
        let incoming = match parse_message(body) {
            Ok(incoming) => incoming,
            Err(error) => {
                tracing::warn!(error = ?error.error_object(), "Rejecting malformed message");
                self.peer.send_response(&error);
                return ControlFlow::Continue(());
            }
        };

        match incoming {
            Incoming::Single(msg) => {
                let (reply, flow) = self.handle_message(msg);
                if let Some(reply) = reply {
                    let peer = self.peer.clone();
                    tokio::spawn(async move {
                        let response = reply.await;
                        peer.send_response(&response);
                    });
                }
                flow
            }
            Incoming::Batch(items) => self.handle_batch(items),
        }
    }

    /// Processes a batch in array order. Replies, if any, go out as one
    /// array in the order their requests appeared.
    fn handle_batch(&self, items: Vec<Result<Message, Response>>) -> ControlFlow<ExitStatus> {
        let mut replies: Vec<BoxFuture<'static, Response>> = Vec::new();
        let mut flow = ControlFlow::Continue(());

        for item in items {
            match item {
                Ok(msg) => {
                    let (reply, item_flow) = self.handle_message(msg);
                    replies.extend(reply);
                    if item_flow.is_break() {
                        flow = item_flow;
                        break;
                    }
                }
                Err(error) => replies.push(Box::pin(future::ready(error))),
            }
        }

        if !replies.is_empty() {
            let peer = self.peer.clone();
            tokio::spawn(async move {
                let responses = future::join_all(replies).await;
                let values: Result<Vec<Value>, _> =
                    responses.iter().map(serde_json::to_value).collect();
                match values {
                    Ok(values) => {
                        if !peer.send(Value::Array(values)) {
                            tracing::debug!("Writer closed, batch response dropped");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to serialise batch response"),
                }
            });
        }
        flow
    }

    fn handle_message(
        &self,
        msg: Message,
    ) -> (Option<BoxFuture<'static, Response>>, ControlFlow<ExitStatus>) {
        match msg {
            Message::Request(req) => (Some(self.start_request(req)), ControlFlow::Continue(())),
            Message::Notification(notif) if notif.method == CANCEL_REQUEST => {
                match notif.params.map(serde_json::from_value::<CancelParams>) {
                    Some(Ok(params)) => {
                        self.cancel(&params.id);
                    }
                    _ => tracing::warn!("Ignoring malformed $/cancelRequest"),
                }
                (None, ControlFlow::Continue(()))
            }
            Message::Notification(notif) => {
                tracing::trace!(method = %notif.method, "Notification");
                let flow = self
                    .router
                    .dispatch_notification(&notif.method, notif.params);
                (None, flow)
            }
            Message::Response(resp) => {
                self.peer.complete(resp);
                (None, ControlFlow::Continue(()))
            }
        }
    }

    /// Registers the request in the in-flight table and starts its handler.
    ///
    /// The returned future always resolves to exactly one response: the
    /// handler's, or "request cancelled" if the token fires first.
    fn start_request(&self, req: Request) -> BoxFuture<'static, Response> {
        let id = req.id;
        let token = CancellationToken::new();
        {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(&id) {
                tracing::warn!(id = %id, "Duplicate request id while still in flight");
                return Box::pin(future::ready(Response::invalid_request(
                    Some(id),
                    "request id is already in flight",
                )));
            }
            inflight.insert(id.clone(), token.clone());
        }

        tracing::debug!(id = %id, method = %req.method, "Request");
        let handler = self
            .router
            .dispatch_request(&req.method, req.params, token.clone());
        let inflight = Arc::clone(&self.inflight);

        Box::pin(async move {
            let result = tokio::select! {
                biased;
                result = handler => result,
                () = token.cancelled() => Err(ResponseError::from_code(ErrorCode::RequestCancelled)),
            };
            inflight.lock().remove(&id);
            Response::from_result(id, result)
        })
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("router", &self.router)
            .field("inflight", &self.inflight_count())
            .finish_non_exhaustive()
    }
}

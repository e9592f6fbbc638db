//! Session lifecycle and request routing.
//!
//! This module implements the session lifecycle:
//!
//! 1. **Initialisation**: the client sends `initialize`; the server answers
//!    with the merged capabilities of every registered part
//! 2. **Operation**: document notifications mutate the store, feature
//!    requests are routed to the owning part
//! 3. **Shutdown**: `shutdown` stops all work, `exit` ends the process
//!
//! Requests other than `initialize` and `shutdown` are rejected with
//! "server not initialized" before the handshake and with "invalid request"
//! after `shutdown`, whether or not a part owns the method. `shutdown` is
//! accepted once, initialised or not.

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::diagnostics::DiagnosticsScheduler;
use crate::documents::DocumentStore;
use crate::error::DocumentError;
use crate::parts::{Registry, RequestContext};
use crate::rpc::protocol::{ErrorCode, ResponseError};
use crate::rpc::router::{boxed, ExitStatus, HandlerResult, Router};
use crate::rpc::Peer;
use crate::types::{
    ClientInfo, DidChangeConfigurationParams, DidChangeTextDocumentParams,
    DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, InitializeParams, WillSaveTextDocumentParams, WorkspaceFolder,
};

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "parley-ls";

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `initialize`.
    Uninitialized,
    /// Handshake done; normal operation.
    Initialized,
    /// `shutdown` answered; waiting for `exit`.
    ShuttingDown,
}

/// Workspace information received from the client.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    /// Open workspace folders.
    pub folders: Vec<WorkspaceFolder>,
    /// Latest settings from `initializationOptions` or
    /// `workspace/didChangeConfiguration`.
    pub settings: Value,
    /// Capabilities the client announced.
    pub client_capabilities: Value,
    /// Client name and version, if sent.
    pub client_info: Option<ClientInfo>,
}

/// One client session.
pub struct Session {
    state: Mutex<SessionState>,
    workspace: Mutex<Workspace>,
    documents: Arc<DocumentStore>,
    registry: Arc<Registry>,
    scheduler: DiagnosticsScheduler,
    peer: Peer,
    /// Cancelled by `shutdown`; aborts every running feature request.
    shutdown: CancellationToken,
}

impl Session {
    /// Creates a session over already wired components.
    #[must_use]
    pub fn new(
        documents: Arc<DocumentStore>,
        registry: Arc<Registry>,
        scheduler: DiagnosticsScheduler,
        peer: Peer,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::Uninitialized),
            workspace: Mutex::new(Workspace::default()),
            documents,
            registry,
            scheduler,
            peer,
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Returns true once `shutdown` has been answered.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.state() == SessionState::ShuttingDown
    }

    /// A copy of the workspace information.
    #[must_use]
    pub fn workspace(&self) -> Workspace {
        self.workspace.lock().clone()
    }

    /// The document store.
    #[must_use]
    pub const fn documents(&self) -> &Arc<DocumentStore> {
        &self.documents
    }

    /// Builds the inbound method table for this session.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new();

        let this = Arc::clone(self);
        router.gate(move |method| match method {
            "initialize" | "shutdown" => Ok(()),
            _ => this.require_initialized(),
        });

        let this = Arc::clone(self);
        router.request("initialize", move |params, _| this.initialize(params));
        let this = Arc::clone(self);
        router.request("shutdown", move |_, _| this.shutdown());
        let this = Arc::clone(self);
        router.request("textDocument/willSaveWaitUntil", move |params, _| {
            this.will_save_wait_until(params)
        });

        let this = Arc::clone(self);
        router.notification("initialized", move |_| {
            if this.state() == SessionState::Initialized {
                tracing::info!("Client initialised");
            }
            ControlFlow::Continue(())
        });
        let this = Arc::clone(self);
        router.notification("exit", move |_| ControlFlow::Break(this.exit()));

        self.document_notifications(&mut router);
        self.workspace_notifications(&mut router);

        for method in self.registry.methods() {
            let this = Arc::clone(self);
            let owned = method.to_string();
            router.request(method, move |params, token| this.feature(&owned, params, token));
        }

        router
    }

    fn document_notifications(self: &Arc<Self>, router: &mut Router) {
        let this = Arc::clone(self);
        router.notification("textDocument/didOpen", move |params| {
            this.notify(params, |this, p: DidOpenTextDocumentParams| {
                let doc = p.text_document;
                this.documents
                    .open(&doc.uri, doc.text, doc.version, &doc.language_id)
            })
        });

        let this = Arc::clone(self);
        router.notification("textDocument/didChange", move |params| {
            this.notify(params, |this, p: DidChangeTextDocumentParams| {
                this.documents.apply_change(
                    &p.text_document.uri,
                    &p.content_changes,
                    p.text_document.version,
                )
            })
        });

        let this = Arc::clone(self);
        router.notification("textDocument/didClose", move |params| {
            this.notify(params, |this, p: DidCloseTextDocumentParams| {
                this.documents.close(&p.text_document.uri)
            })
        });

        let this = Arc::clone(self);
        router.notification("textDocument/didSave", move |params| {
            this.notify(params, |this, p: DidSaveTextDocumentParams| {
                this.documents.save(&p.text_document.uri, p.text)
            })
        });

        let this = Arc::clone(self);
        router.notification("textDocument/willSave", move |params| {
            this.notify(params, |_, p: WillSaveTextDocumentParams| {
                tracing::trace!(uri = %p.text_document.uri, reason = p.reason, "Will save");
                Ok(())
            })
        });
    }

    fn workspace_notifications(self: &Arc<Self>, router: &mut Router) {
        let this = Arc::clone(self);
        router.notification("workspace/didChangeWorkspaceFolders", move |params| {
            this.notify(params, |this, p: DidChangeWorkspaceFoldersParams| {
                let mut workspace = this.workspace.lock();
                workspace
                    .folders
                    .retain(|folder| !p.event.removed.iter().any(|r| r.uri == folder.uri));
                for added in p.event.added {
                    if !workspace.folders.iter().any(|f| f.uri == added.uri) {
                        workspace.folders.push(added);
                    }
                }
                tracing::debug!(folders = workspace.folders.len(), "Workspace folders changed");
                Ok(())
            })
        });

        let this = Arc::clone(self);
        router.notification("workspace/didChangeConfiguration", move |params| {
            this.notify(params, |this, p: DidChangeConfigurationParams| {
                this.workspace.lock().settings = p.settings;
                tracing::debug!("Configuration changed");
                Ok(())
            })
        });
    }

    /// Runs a notification body if the session accepts notifications.
    ///
    /// Malformed params and document errors are logged and dropped.
    fn notify<P, F>(&self, params: Option<Value>, body: F) -> ControlFlow<ExitStatus>
    where
        P: DeserializeOwned,
        F: FnOnce(&Self, P) -> Result<(), DocumentError>,
    {
        let state = self.state();
        if state != SessionState::Initialized {
            tracing::debug!(state = ?state, "Dropping notification outside of normal operation");
            return ControlFlow::Continue(());
        }
        let params = match serde_json::from_value(params.unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping notification with malformed params");
                return ControlFlow::Continue(());
            }
        };
        if let Err(e) = body(self, params) {
            tracing::warn!(error = %e, "Document notification rejected");
        }
        ControlFlow::Continue(())
    }

    /// Ensures the session is in normal operation. Checked for every request
    /// except `initialize` and `shutdown`, before method lookup.
    fn require_initialized(&self) -> Result<(), ResponseError> {
        match self.state() {
            SessionState::Initialized => Ok(()),
            SessionState::Uninitialized => Err(ResponseError::from_code(ErrorCode::ServerNotInitialized)),
            SessionState::ShuttingDown => Err(ResponseError::with_message(
                ErrorCode::InvalidRequest,
                "Server is shutting down",
            )),
        }
    }

    fn initialize(&self, params: Option<Value>) -> futures::future::BoxFuture<'static, HandlerResult> {
        let result = self.handle_initialize(params);
        boxed(async move { result })
    }

    fn handle_initialize(&self, params: Option<Value>) -> HandlerResult {
        let mut state = self.state.lock();
        if *state != SessionState::Uninitialized {
            return Err(ResponseError::with_message(
                ErrorCode::InvalidRequest,
                "initialize may only be sent once",
            ));
        }

        let params: InitializeParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| ResponseError::invalid_params(e.to_string()))?;

        let folders = match params.workspace_folders {
            Some(folders) => folders,
            None => params
                .root_uri
                .map(|uri| {
                    let name = uri
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    vec![WorkspaceFolder { uri, name }]
                })
                .unwrap_or_default(),
        };

        tracing::info!(
            client = ?params.client_info.as_ref().map(|c| &c.name),
            process_id = ?params.process_id,
            folders = folders.len(),
            "Initialising session"
        );

        *self.workspace.lock() = Workspace {
            folders,
            settings: params.initialization_options.unwrap_or(Value::Null),
            client_capabilities: params.capabilities,
            client_info: params.client_info,
        };
        *state = SessionState::Initialized;

        Ok(json!({
            "capabilities": self.registry.capabilities(),
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        }))
    }

    fn shutdown(&self) -> futures::future::BoxFuture<'static, HandlerResult> {
        let result = {
            let mut state = self.state.lock();
            if *state == SessionState::ShuttingDown {
                Err(ResponseError::with_message(
                    ErrorCode::InvalidRequest,
                    "shutdown may only be sent once",
                ))
            } else {
                tracing::info!(from = ?*state, "Shutdown requested");
                *state = SessionState::ShuttingDown;
                Ok(Value::Null)
            }
        };
        if result.is_ok() {
            self.shutdown.cancel();
            self.scheduler.shutdown();
        }
        boxed(async move { result })
    }

    fn exit(&self) -> ExitStatus {
        if self.shutdown_requested() {
            tracing::info!("Exit after shutdown");
            ExitStatus::Clean
        } else {
            tracing::warn!("Exit without prior shutdown");
            ExitStatus::ExitWithoutShutdown
        }
    }

    fn will_save_wait_until(&self, params: Option<Value>) -> futures::future::BoxFuture<'static, HandlerResult> {
        let result =
            serde_json::from_value::<WillSaveTextDocumentParams>(params.unwrap_or(Value::Null))
                .map(|_| json!([]))
                .map_err(|e| ResponseError::invalid_params(e.to_string()));
        boxed(async move { result })
    }

    /// Routes a feature request to its owning part.
    fn feature(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> futures::future::BoxFuture<'static, HandlerResult> {
        let ctx = RequestContext {
            documents: Arc::clone(&self.documents),
            token: token.clone(),
            peer: self.peer.clone(),
        };
        let Some(running) = self.registry.dispatch(method, params, ctx) else {
            let err = ResponseError::method_not_found(method);
            return boxed(async move { Err(err) });
        };

        let shutdown = self.shutdown.clone();
        boxed(async move {
            tokio::select! {
                biased;
                result = running => result.map_err(ResponseError::from),
                () = shutdown.cancelled() => {
                    token.cancel();
                    Err(ResponseError::from_code(ErrorCode::RequestCancelled))
                }
            }
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .field("documents", &self.documents)
            .finish_non_exhaustive()
    }
}

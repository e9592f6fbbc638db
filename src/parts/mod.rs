//! The capability registry.
//!
//! A "part" is an independently written provider that plugs into the
//! session. There are two kinds:
//!
//! - [`FeatureProvider`]: owns a set of request methods (hover, completion,
//!   commands, ...) and may subscribe to document lifecycle events
//! - [`DiagnosticsProvider`]: produces findings for one document snapshot;
//!   every matching provider runs for every diagnostic pass
//!
//! Parts are registered through a [`RegistryBuilder`] during startup and
//! frozen into an immutable [`Registry`] before the first message is read.

pub mod commands;
pub mod words;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::documents::{DocumentEvent, DocumentListener, DocumentSnapshot, DocumentStore, EventMask};
use crate::error::{ProviderError, RegistryError};
use crate::rpc::Peer;
use crate::types::Diagnostic;

/// Methods the session answers itself; providers cannot claim them.
pub const RESERVED_METHODS: &[&str] = &[
    "initialize",
    "shutdown",
    "textDocument/willSaveWaitUntil",
];

/// Everything a feature request handler may use.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Read access to open documents.
    pub documents: Arc<DocumentStore>,
    /// Signalled on `$/cancelRequest` or shutdown.
    pub token: CancellationToken,
    /// For server-to-client calls and notifications.
    pub peer: Peer,
}

/// A provider of request/response features.
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    /// Name used in logs and registration errors.
    fn name(&self) -> &str;

    /// Request methods this provider answers.
    fn methods(&self) -> Vec<String>;

    /// Fragment merged into the server capabilities, e.g.
    /// `{"hoverProvider": true}`.
    fn capabilities(&self) -> Value {
        Value::Null
    }

    /// Lifecycle events delivered to [`FeatureProvider::on_event`].
    fn events(&self) -> EventMask {
        EventMask::empty()
    }

    /// Answers one request.
    async fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, ProviderError>;

    /// Reacts to a subscribed lifecycle event.
    async fn on_event(&self, _event: &DocumentEvent) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// A source of diagnostics.
#[async_trait]
pub trait DiagnosticsProvider: Send + Sync {
    /// Name used for logging and as the default `source` of findings.
    fn name(&self) -> &str;

    /// Language ids this provider applies to. Empty means all.
    fn languages(&self) -> &[String] {
        &[]
    }

    /// Analyses one snapshot.
    ///
    /// Long-running providers should check `token` at natural suspension
    /// points and return [`ProviderError::Cancelled`] once it fires.
    async fn collect(
        &self,
        document: &DocumentSnapshot,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, ProviderError>;
}

/// Returns true if a provider with this language list applies to `language_id`.
pub(crate) fn applies_to(languages: &[String], language_id: &str) -> bool {
    languages.is_empty() || languages.iter().any(|l| l == language_id)
}

/// One registrable part.
#[derive(Clone)]
pub enum Part {
    Feature(Arc<dyn FeatureProvider>),
    Diagnostics(Arc<dyn DiagnosticsProvider>),
}

/// Collects parts before the session starts.
#[derive(Default)]
pub struct RegistryBuilder {
    features: Vec<Arc<dyn FeatureProvider>>,
    diagnostics: Vec<Arc<dyn DiagnosticsProvider>>,
    methods: HashMap<String, Arc<dyn FeatureProvider>>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a part.
    ///
    /// # Errors
    ///
    /// Returns an error if a feature provider claims a method that is
    /// reserved or already owned by another provider. The builder is left
    /// unchanged in that case.
    pub fn register(&mut self, part: Part) -> Result<&mut Self, RegistryError> {
        match part {
            Part::Feature(provider) => {
                let methods = provider.methods();
                for method in &methods {
                    if RESERVED_METHODS.contains(&method.as_str()) {
                        return Err(RegistryError::ReservedMethod {
                            method: method.clone(),
                            provider: provider.name().to_string(),
                        });
                    }
                    if let Some(existing) = self.methods.get(method) {
                        return Err(RegistryError::DuplicateMethod {
                            method: method.clone(),
                            existing: existing.name().to_string(),
                            provider: provider.name().to_string(),
                        });
                    }
                }
                tracing::debug!(provider = %provider.name(), methods = ?methods, "Registered feature provider");
                for method in methods {
                    self.methods.insert(method, Arc::clone(&provider));
                }
                self.features.push(provider);
            }
            Part::Diagnostics(provider) => {
                tracing::debug!(provider = %provider.name(), "Registered diagnostics provider");
                self.diagnostics.push(provider);
            }
        }
        Ok(self)
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> Registry {
        let subscribers = self
            .features
            .iter()
            .filter(|provider| !provider.events().is_empty())
            .map(|provider| Subscriber {
                events: provider.events(),
                provider: Arc::clone(provider),
                queue: OnceLock::new(),
            })
            .collect();
        Registry {
            features: self.features,
            diagnostics: self.diagnostics,
            methods: self.methods,
            subscribers,
        }
    }
}

/// A feature provider's event queue. The worker task draining it starts
/// with the first event, so events reach the provider in store order.
struct Subscriber {
    events: EventMask,
    provider: Arc<dyn FeatureProvider>,
    queue: OnceLock<mpsc::UnboundedSender<DocumentEvent>>,
}

impl Subscriber {
    fn deliver(&self, handle: &tokio::runtime::Handle, event: &DocumentEvent) {
        let queue = self.queue.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<DocumentEvent>();
            let provider = Arc::clone(&self.provider);
            handle.spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = provider.on_event(&event).await {
                        tracing::warn!(
                            provider = %provider.name(),
                            uri = %event.uri(),
                            error = %e,
                            "Provider failed to handle document event"
                        );
                    }
                }
            });
            tx
        });
        if queue.send(event.clone()).is_err() {
            tracing::debug!(provider = %self.provider.name(), "Event worker gone, event dropped");
        }
    }
}

/// The frozen set of parts for one session.
pub struct Registry {
    features: Vec<Arc<dyn FeatureProvider>>,
    diagnostics: Vec<Arc<dyn DiagnosticsProvider>>,
    methods: HashMap<String, Arc<dyn FeatureProvider>>,
    subscribers: Vec<Subscriber>,
}

impl Registry {
    /// All request methods owned by providers, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// The diagnostics providers, in registration order.
    #[must_use]
    pub fn diagnostics(&self) -> &[Arc<dyn DiagnosticsProvider>] {
        &self.diagnostics
    }

    /// Resolves a request to its provider and starts it.
    ///
    /// Returns `None` if no provider owns `method`.
    pub fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Option<BoxFuture<'static, Result<Value, ProviderError>>> {
        let provider = Arc::clone(self.methods.get(method)?);
        let method = method.to_string();
        Some(Box::pin(async move { provider.handle(&method, params, ctx).await }))
    }

    /// The server capabilities: document sync settings merged with every
    /// provider's fragment.
    #[must_use]
    pub fn capabilities(&self) -> Value {
        let mut caps = json!({
            "textDocumentSync": {
                "openClose": true,
                "change": 2,
                "willSave": true,
                "willSaveWaitUntil": true,
                "save": { "includeText": true }
            }
        });
        for provider in &self.features {
            merge_json(&mut caps, provider.capabilities());
        }
        caps
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let features: Vec<_> = self.features.iter().map(|p| p.name().to_string()).collect();
        let diagnostics: Vec<_> = self.diagnostics.iter().map(|p| p.name().to_string()).collect();
        f.debug_struct("Registry")
            .field("features", &features)
            .field("diagnostics", &diagnostics)
            .finish()
    }
}

impl DocumentListener for Registry {
    /// Queues the event for every subscribed feature provider. Each provider
    /// sees its events in order; a failure is logged and affects no other
    /// provider.
    fn on_event(&self, event: &DocumentEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(uri = %event.uri(), "No runtime to deliver document event");
            return;
        };
        for subscriber in &self.subscribers {
            if subscriber.events.contains(event.kind()) {
                subscriber.deliver(&handle, event);
            }
        }
    }
}

/// Deep-merges `patch` into `base`. Objects merge key by key, arrays are
/// concatenated, anything else is replaced.
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(patch)) => base.extend(patch),
        (base, patch) => *base = patch,
    }
}

/// Deserialises request params, mapping failures to invalid params.
///
/// # Errors
///
/// Returns [`ProviderError::InvalidParams`] if `params` is missing or does
/// not have the expected shape.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, ProviderError> {
    let params = params.unwrap_or(Value::Object(Map::new()));
    serde_json::from_value(params).map_err(|e| ProviderError::invalid_params(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    struct Fixed {
        name: &'static str,
        methods: Vec<String>,
        caps: Value,
        seen: Mutex<Vec<DocumentEvent>>,
        fail: bool,
    }

    impl Fixed {
        fn new(name: &'static str, methods: &[&str], caps: Value) -> Self {
            Self {
                name,
                methods: methods.iter().map(ToString::to_string).collect(),
                caps,
                seen: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl FeatureProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn methods(&self) -> Vec<String> {
            self.methods.clone()
        }

        fn capabilities(&self) -> Value {
            self.caps.clone()
        }

        fn events(&self) -> EventMask {
            EventMask::CHANGE
        }

        async fn handle(
            &self,
            method: &str,
            _params: Option<Value>,
            _ctx: RequestContext,
        ) -> Result<Value, ProviderError> {
            Ok(json!({ "provider": self.name, "method": method }))
        }

        async fn on_event(&self, event: &DocumentEvent) -> Result<(), ProviderError> {
            self.seen.lock().push(event.clone());
            if self.fail {
                return Err(ProviderError::failed("boom"));
            }
            Ok(())
        }
    }

    fn ctx() -> RequestContext {
        let (peer, _rx) = Peer::new();
        RequestContext {
            documents: Arc::new(DocumentStore::new()),
            token: CancellationToken::new(),
            peer,
        }
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Part::Feature(Arc::new(Fixed::new("a", &["textDocument/hover"], Value::Null))))
            .unwrap();
        let err = builder
            .register(Part::Feature(Arc::new(Fixed::new("b", &["textDocument/hover"], Value::Null))))
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::DuplicateMethod {
                method: "textDocument/hover".to_string(),
                existing: "a".to_string(),
                provider: "b".to_string(),
            }
        );
    }

    #[test]
    fn reserved_method_is_rejected() {
        let mut builder = RegistryBuilder::new();
        let result = builder.register(Part::Feature(Arc::new(Fixed::new("a", &["shutdown"], Value::Null))));
        assert!(matches!(result, Err(RegistryError::ReservedMethod { .. })));
    }

    #[test]
    fn capabilities_are_merged() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Part::Feature(Arc::new(Fixed::new(
                "a",
                &["textDocument/hover"],
                json!({ "hoverProvider": true, "executeCommandProvider": { "commands": ["x"] } }),
            ))))
            .unwrap()
            .register(Part::Feature(Arc::new(Fixed::new(
                "b",
                &["workspace/symbol"],
                json!({ "executeCommandProvider": { "commands": ["y"] } }),
            ))))
            .unwrap();
        let caps = builder.build().capabilities();
        assert_eq!(caps["hoverProvider"], true);
        assert_eq!(caps["executeCommandProvider"]["commands"], json!(["x", "y"]));
        assert_eq!(caps["textDocumentSync"]["change"], 2);
        assert_eq!(caps["textDocumentSync"]["save"]["includeText"], true);
    }

    #[tokio::test]
    async fn dispatch_resolves_single_provider() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Part::Feature(Arc::new(Fixed::new("a", &["textDocument/hover"], Value::Null))))
            .unwrap();
        let registry = builder.build();
        assert_eq!(registry.methods(), vec!["textDocument/hover"]);

        let result = registry.dispatch("textDocument/hover", None, ctx()).unwrap().await.unwrap();
        assert_eq!(result["provider"], "a");
        assert!(registry.dispatch("textDocument/completion", None, ctx()).is_none());
    }

    #[tokio::test]
    async fn event_fan_out_isolates_failures() {
        let mut failing = Fixed::new("failing", &["a"], Value::Null);
        failing.fail = true;
        let failing = Arc::new(failing);
        let healthy = Arc::new(Fixed::new("healthy", &["b"], Value::Null));

        let mut builder = RegistryBuilder::new();
        builder.register(Part::Feature(failing.clone())).unwrap();
        builder.register(Part::Feature(healthy.clone())).unwrap();
        let registry = builder.build();

        let event = DocumentEvent::Changed {
            uri: "file:///a.txt".to_string(),
            version: 2,
        };
        registry.on_event(&event);
        // Not subscribed to OPEN.
        registry.on_event(&DocumentEvent::Opened {
            uri: "file:///a.txt".to_string(),
            version: 1,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*failing.seen.lock(), vec![event.clone()]);
        assert_eq!(*healthy.seen.lock(), vec![event]);
    }

    /// Subscribes to changes and closes; slow to handle changes.
    struct SlowOnChange {
        seen: Mutex<Vec<DocumentEvent>>,
    }

    #[async_trait]
    impl FeatureProvider for SlowOnChange {
        fn name(&self) -> &str {
            "slow"
        }

        fn methods(&self) -> Vec<String> {
            Vec::new()
        }

        fn events(&self) -> EventMask {
            EventMask::CHANGE | EventMask::CLOSE
        }

        async fn handle(
            &self,
            _method: &str,
            _params: Option<Value>,
            _ctx: RequestContext,
        ) -> Result<Value, ProviderError> {
            Ok(Value::Null)
        }

        async fn on_event(&self, event: &DocumentEvent) -> Result<(), ProviderError> {
            if matches!(event, DocumentEvent::Changed { .. }) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_each_provider_in_order() {
        let slow = Arc::new(SlowOnChange {
            seen: Mutex::new(Vec::new()),
        });
        let mut builder = RegistryBuilder::new();
        builder.register(Part::Feature(slow.clone())).unwrap();
        let registry = builder.build();

        let changed = DocumentEvent::Changed {
            uri: "file:///a.txt".to_string(),
            version: 2,
        };
        let closed = DocumentEvent::Closed {
            uri: "file:///a.txt".to_string(),
        };
        registry.on_event(&changed);
        registry.on_event(&closed);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*slow.seen.lock(), vec![changed, closed]);
    }

    #[test]
    fn language_filter() {
        assert!(applies_to(&[], "anything"));
        let langs = vec!["plaintext".to_string()];
        assert!(applies_to(&langs, "plaintext"));
        assert!(!applies_to(&langs, "rust"));
    }

    #[test]
    fn parse_params_reports_invalid_params() {
        #[derive(serde::Deserialize)]
        struct P {
            #[allow(dead_code)]
            uri: String,
        }
        let err = parse_params::<P>(Some(json!({ "nope": 1 }))).err().unwrap();
        assert!(matches!(err, ProviderError::InvalidParams { .. }));
    }
}

//! Debounced, supersede-aware diagnostics scheduling.
//!
//! Each open URI has its own small state machine:
//!
//! ```text
//!            change                 debounce expires
//!   Idle ───────────────► Scheduled ─────────────────► Running
//!    ▲                      ▲  │ change (restart)         │ │ change
//!    │                      └──┘                          │ └──────► Scheduled (old run superseded)
//!    └──────────────────── published ◄────────────────────┘
//! ```
//!
//! Every change bumps a per-URI generation counter and cancels the token of
//! the previous run. A run publishes only if its generation is still the
//! current one when it finishes, and the check and the send happen under
//! the same lock that change events take. A superseded run can therefore
//! never publish after its successor.
//!
//! Closing a document removes its state and cancels any run; nothing is
//! published for a closed document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::documents::{DocumentEvent, DocumentListener, DocumentSnapshot, DocumentStore};
use crate::error::ProviderError;
use crate::parts::{applies_to, DiagnosticsProvider};
use crate::rpc::Peer;
use crate::types::{Diagnostic, DocumentUri, PublishDiagnosticsParams};

/// Method of the outgoing diagnostics notification.
pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

/// How the result sets of several providers are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// All findings of all providers, in provider registration order.
    #[default]
    Concatenate,
    /// The findings of the first provider (in registration order) that
    /// reported any.
    FirstNonEmpty,
}

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Quiet period after the last change before a run starts.
    pub debounce: Duration,
    /// Liveness bound for a single provider call. `None` waits forever.
    pub provider_timeout: Option<Duration>,
    /// Result merge policy.
    pub merge: MergePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            provider_timeout: Some(Duration::from_secs(30)),
            merge: MergePolicy::Concatenate,
        }
    }
}

/// Observable phase of a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug)]
struct UriState {
    generation: u64,
    version: i32,
    phase: Phase,
    token: CancellationToken,
}

struct Inner {
    documents: Arc<DocumentStore>,
    providers: Vec<Arc<dyn DiagnosticsProvider>>,
    peer: Peer,
    config: SchedulerConfig,
    states: Mutex<HashMap<DocumentUri, UriState>>,
    shutdown: CancellationToken,
}

/// Runs diagnostics providers in response to document events.
///
/// Subscribe it to the [`DocumentStore`] to drive it.
#[derive(Clone)]
pub struct DiagnosticsScheduler {
    inner: Arc<Inner>,
}

impl DiagnosticsScheduler {
    /// Creates a scheduler publishing through `peer`.
    #[must_use]
    pub fn new(
        documents: Arc<DocumentStore>,
        providers: Vec<Arc<dyn DiagnosticsProvider>>,
        peer: Peer,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                documents,
                providers,
                peer,
                config,
                states: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The current phase of `uri`, or `None` if the scheduler does not
    /// track it.
    #[must_use]
    pub fn phase(&self, uri: &str) -> Option<Phase> {
        self.inner.states.lock().get(uri).map(|s| s.phase)
    }

    /// Starts (or restarts) the debounce for `uri` at `version`.
    ///
    /// Any scheduled or running pass for the URI is superseded.
    pub fn schedule(&self, uri: &str, version: i32) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(uri = %uri, "No runtime to schedule diagnostics on");
            return;
        };

        let (generation, token) = {
            let mut states = self.inner.states.lock();
            let state = states.entry(uri.to_string()).or_insert_with(|| UriState {
                generation: 0,
                version,
                phase: Phase::Idle,
                token: CancellationToken::new(),
            });
            if state.phase == Phase::Running {
                tracing::debug!(uri = %uri, superseded = state.version, version, "Superseding diagnostics run");
            }
            state.token.cancel();
            state.generation += 1;
            state.version = version;
            state.phase = Phase::Scheduled;
            state.token = self.inner.shutdown.child_token();
            (state.generation, state.token.clone())
        };

        let inner = Arc::clone(&self.inner);
        let uri = uri.to_string();
        handle.spawn(async move {
            inner.run(uri, version, generation, token).await;
        });
    }

    /// Forgets `uri`, cancelling any pending or running pass.
    pub fn close(&self, uri: &str) {
        if let Some(state) = self.inner.states.lock().remove(uri) {
            state.token.cancel();
            tracing::debug!(uri = %uri, "Diagnostics cancelled for closed document");
        }
    }

    /// Cancels every pass and refuses new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let count = {
            let mut states = self.inner.states.lock();
            let count = states.len();
            states.clear();
            count
        };
        tracing::debug!(documents = count, "Diagnostics scheduler shut down");
    }
}

impl std::fmt::Debug for DiagnosticsScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsScheduler")
            .field("providers", &self.inner.providers.len())
            .field("config", &self.inner.config)
            .field("tracked", &self.inner.states.lock().len())
            .finish()
    }
}

impl DocumentListener for DiagnosticsScheduler {
    fn on_event(&self, event: &DocumentEvent) {
        match event {
            DocumentEvent::Opened { uri, version } | DocumentEvent::Changed { uri, version } => {
                self.schedule(uri, *version);
            }
            DocumentEvent::Closed { uri } => self.close(uri),
            DocumentEvent::Saved { .. } => {}
        }
    }
}

impl Inner {
    /// One pass: debounce, collect, publish if still current.
    async fn run(&self, uri: DocumentUri, version: i32, generation: u64, token: CancellationToken) {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(self.config.debounce) => {}
        }

        if !self.transition(&uri, generation, Phase::Running) {
            return;
        }

        let Some(snapshot) = self.documents.snapshot(&uri) else {
            return;
        };
        if snapshot.version != version {
            // A newer change is already scheduled.
            return;
        }

        let providers = self
            .providers
            .iter()
            .filter(|p| applies_to(p.languages(), &snapshot.language_id));
        let collect = join_all(providers.map(|p| self.collect_one(p.as_ref(), &snapshot, &token)));
        // Providers may ignore the token; a superseded run drops them here.
        let results = tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(uri = %uri, version, "Abandoning superseded diagnostics run");
                return;
            }
            results = collect => results,
        };
        let diagnostics = merge(results, self.config.merge);

        let mut states = self.states.lock();
        match states.get_mut(&uri) {
            Some(state) if state.generation == generation && !token.is_cancelled() => {
                state.phase = Phase::Idle;
                tracing::debug!(uri = %uri, version, count = diagnostics.len(), "Publishing diagnostics");
                let params = PublishDiagnosticsParams {
                    uri,
                    version,
                    diagnostics,
                };
                match serde_json::to_value(&params) {
                    Ok(params) => {
                        self.peer.notify(PUBLISH_DIAGNOSTICS, Some(params));
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to serialise diagnostics"),
                }
            }
            _ => tracing::debug!(uri = %uri, version, "Discarding superseded diagnostics"),
        }
    }

    /// Moves the URI to `phase` if `generation` is still current.
    fn transition(&self, uri: &str, generation: u64, phase: Phase) -> bool {
        match self.states.lock().get_mut(uri) {
            Some(state) if state.generation == generation => {
                state.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Runs one provider. Failures are logged and yield `None`.
    async fn collect_one(
        &self,
        provider: &dyn DiagnosticsProvider,
        snapshot: &DocumentSnapshot,
        token: &CancellationToken,
    ) -> Option<Vec<Diagnostic>> {
        let collect = provider.collect(snapshot, token);
        let result = match self.config.provider_timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.unwrap_or_else(|_| {
                Err(ProviderError::TimedOut {
                    millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }),
            None => collect.await,
        };

        match result {
            Ok(mut diagnostics) => {
                for diagnostic in &mut diagnostics {
                    diagnostic
                        .source
                        .get_or_insert_with(|| provider.name().to_string());
                }
                Some(diagnostics)
            }
            Err(ProviderError::Cancelled) => {
                tracing::trace!(provider = %provider.name(), uri = %snapshot.uri, "Provider cancelled");
                None
            }
            Err(e) => {
                tracing::warn!(
                    provider = %provider.name(),
                    uri = %snapshot.uri,
                    version = snapshot.version,
                    error = %e,
                    "Diagnostics provider failed"
                );
                None
            }
        }
    }
}

fn merge(results: Vec<Option<Vec<Diagnostic>>>, policy: MergePolicy) -> Vec<Diagnostic> {
    let mut sets = results.into_iter().flatten();
    match policy {
        MergePolicy::Concatenate => sets.flatten().collect(),
        MergePolicy::FirstNonEmpty => sets.find(|set| !set.is_empty()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;
    use crate::types::{DiagnosticSeverity, Range, TextDocumentContentChangeEvent};

    const URI: &str = "file:///a.txt";

    /// Reports one finding per call, tagged with the document text, after
    /// an optional delay that ignores cancellation.
    struct Echo {
        name: &'static str,
        delay: Duration,
        languages: Vec<String>,
        calls: Mutex<Vec<i32>>,
    }

    impl Echo {
        fn new(name: &'static str, delay: Duration) -> Self {
            Self {
                name,
                delay,
                languages: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DiagnosticsProvider for Echo {
        fn name(&self) -> &str {
            self.name
        }

        fn languages(&self) -> &[String] {
            &self.languages
        }

        async fn collect(
            &self,
            document: &DocumentSnapshot,
            _token: &CancellationToken,
        ) -> Result<Vec<Diagnostic>, ProviderError> {
            self.calls.lock().push(document.version);
            tokio::time::sleep(self.delay).await;
            Ok(vec![Diagnostic::new(
                Range::default(),
                DiagnosticSeverity::Information,
                document.text.to_string(),
            )])
        }
    }

    struct Failing;

    #[async_trait]
    impl DiagnosticsProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn collect(
            &self,
            _document: &DocumentSnapshot,
            _token: &CancellationToken,
        ) -> Result<Vec<Diagnostic>, ProviderError> {
            Err(ProviderError::failed("analyser crashed"))
        }
    }

    struct Hang;

    #[async_trait]
    impl DiagnosticsProvider for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        async fn collect(
            &self,
            _document: &DocumentSnapshot,
            _token: &CancellationToken,
        ) -> Result<Vec<Diagnostic>, ProviderError> {
            futures::future::pending().await
        }
    }

    struct Empty;

    #[async_trait]
    impl DiagnosticsProvider for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        async fn collect(
            &self,
            _document: &DocumentSnapshot,
            _token: &CancellationToken,
        ) -> Result<Vec<Diagnostic>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn setup(
        providers: Vec<Arc<dyn DiagnosticsProvider>>,
        config: SchedulerConfig,
    ) -> (Arc<DocumentStore>, DiagnosticsScheduler, mpsc::UnboundedReceiver<Value>) {
        let documents = Arc::new(DocumentStore::new());
        let (peer, rx) = Peer::new();
        let scheduler = DiagnosticsScheduler::new(Arc::clone(&documents), providers, peer, config);
        documents.subscribe(Arc::new(scheduler.clone()));
        (documents, scheduler, rx)
    }

    fn change(documents: &DocumentStore, text: &str, version: i32) {
        let edit = TextDocumentContentChangeEvent {
            range: None,
            text: text.to_string(),
        };
        documents.apply_change(URI, &[edit], version).unwrap();
    }

    fn published(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<PublishDiagnosticsParams> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(msg["method"], PUBLISH_DIAGNOSTICS);
            out.push(serde_json::from_value(msg["params"].clone()).unwrap());
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_are_coalesced() {
        let echo = Arc::new(Echo::new("echo", Duration::ZERO));
        let (documents, _scheduler, mut rx) = setup(vec![echo.clone()], SchedulerConfig::default());

        documents.open(URI, "a", 1, "plaintext").unwrap();
        change(&documents, "ab", 2);
        change(&documents, "abc", 3);
        settle().await;

        let sets = published(&mut rx);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].version, 3);
        assert_eq!(sets[0].diagnostics[0].message, "abc");
        assert_eq!(sets[0].diagnostics[0].source.as_deref(), Some("echo"));
        assert_eq!(*echo.calls.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_run_is_never_published() {
        let slow = Arc::new(Echo::new("slow", Duration::from_millis(500)));
        let (documents, scheduler, mut rx) = setup(vec![slow.clone()], SchedulerConfig::default());

        documents.open(URI, "foo", 1, "plaintext").unwrap();
        // Past the debounce, while version 1 is running.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.phase(URI), Some(Phase::Running));
        change(&documents, "foobar", 2);
        assert_eq!(scheduler.phase(URI), Some(Phase::Scheduled));
        settle().await;

        let sets = published(&mut rx);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].version, 2);
        assert_eq!(*slow.calls.lock(), vec![1, 2]);
        assert_eq!(scheduler.phase(URI), Some(Phase::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn close_suppresses_publication() {
        let slow = Arc::new(Echo::new("slow", Duration::from_millis(500)));
        let (documents, scheduler, mut rx) = setup(vec![slow], SchedulerConfig::default());

        documents.open(URI, "foo", 1, "plaintext").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        documents.close(URI).unwrap();
        settle().await;

        assert!(published(&mut rx).is_empty());
        assert_eq!(scheduler.phase(URI), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_provider_does_not_block_others() {
        let providers: Vec<Arc<dyn DiagnosticsProvider>> =
            vec![Arc::new(Failing), Arc::new(Echo::new("echo", Duration::ZERO))];
        let (documents, _scheduler, mut rx) = setup(providers, SchedulerConfig::default());

        documents.open(URI, "text", 1, "plaintext").unwrap();
        settle().await;

        let sets = published(&mut rx);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].diagnostics.len(), 1);
        assert_eq!(sets[0].diagnostics[0].source.as_deref(), Some("echo"));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_provider_times_out() {
        let providers: Vec<Arc<dyn DiagnosticsProvider>> =
            vec![Arc::new(Hang), Arc::new(Echo::new("echo", Duration::ZERO))];
        let config = SchedulerConfig {
            provider_timeout: Some(Duration::from_secs(1)),
            ..SchedulerConfig::default()
        };
        let (documents, _scheduler, mut rx) = setup(providers, config);

        documents.open(URI, "text", 1, "plaintext").unwrap();
        settle().await;

        let sets = published(&mut rx);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].diagnostics.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_non_empty_policy() {
        let providers: Vec<Arc<dyn DiagnosticsProvider>> = vec![
            Arc::new(Empty),
            Arc::new(Echo::new("first", Duration::ZERO)),
            Arc::new(Echo::new("second", Duration::ZERO)),
        ];
        let config = SchedulerConfig {
            merge: MergePolicy::FirstNonEmpty,
            ..SchedulerConfig::default()
        };
        let (documents, _scheduler, mut rx) = setup(providers, config);

        documents.open(URI, "x", 1, "plaintext").unwrap();
        settle().await;

        let sets = published(&mut rx);
        assert_eq!(sets[0].diagnostics.len(), 1);
        assert_eq!(sets[0].diagnostics[0].source.as_deref(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn providers_are_filtered_by_language() {
        let mut rust_only = Echo::new("rust-only", Duration::ZERO);
        rust_only.languages = vec!["rust".to_string()];
        let rust_only = Arc::new(rust_only);
        let (documents, _scheduler, mut rx) = setup(vec![rust_only.clone()], SchedulerConfig::default());

        documents.open(URI, "x", 1, "plaintext").unwrap();
        settle().await;

        let sets = published(&mut rx);
        assert_eq!(sets.len(), 1);
        assert!(sets[0].diagnostics.is_empty());
        assert!(rust_only.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_and_refuses_work() {
        let slow = Arc::new(Echo::new("slow", Duration::from_millis(500)));
        let (documents, scheduler, mut rx) = setup(vec![slow.clone()], SchedulerConfig::default());

        documents.open(URI, "foo", 1, "plaintext").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown();
        change(&documents, "foobar", 2);
        settle().await;

        assert!(published(&mut rx).is_empty());
        assert_eq!(*slow.calls.lock(), vec![1]);
    }

    /// Hangs on version 1 without looking at the token; counts live calls.
    struct StubbornFirst {
        live: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct LiveGuard(Arc<std::sync::atomic::AtomicUsize>);

    impl Drop for LiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DiagnosticsProvider for StubbornFirst {
        fn name(&self) -> &str {
            "stubborn"
        }

        async fn collect(
            &self,
            document: &DocumentSnapshot,
            _token: &CancellationToken,
        ) -> Result<Vec<Diagnostic>, ProviderError> {
            self.live.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _guard = LiveGuard(Arc::clone(&self.live));
            if document.version == 1 {
                futures::future::pending::<()>().await;
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_run_drops_providers_that_ignore_the_token() {
        let live = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let provider = Arc::new(StubbornFirst {
            live: Arc::clone(&live),
        });
        let config = SchedulerConfig {
            provider_timeout: None,
            ..SchedulerConfig::default()
        };
        let (documents, scheduler, mut rx) = setup(vec![provider], config);

        documents.open(URI, "foo", 1, "plaintext").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(scheduler.phase(URI), Some(Phase::Running));
        assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 1);

        change(&documents, "foobar", 2);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let sets = published(&mut rx);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].version, 2);
        assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_drops_running_providers() {
        let live = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let provider = Arc::new(StubbornFirst {
            live: Arc::clone(&live),
        });
        let config = SchedulerConfig {
            provider_timeout: None,
            ..SchedulerConfig::default()
        };
        let (documents, _scheduler, mut rx) = setup(vec![provider], config);

        documents.open(URI, "foo", 1, "plaintext").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        documents.close(URI).unwrap();
        settle().await;

        assert!(published(&mut rx).is_empty());
        assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn merge_policies() {
        let a = Diagnostic::new(Range::default(), DiagnosticSeverity::Error, "a");
        let b = Diagnostic::new(Range::default(), DiagnosticSeverity::Error, "b");
        let results = vec![None, Some(vec![]), Some(vec![a.clone()]), Some(vec![b.clone()])];
        assert_eq!(merge(results.clone(), MergePolicy::Concatenate), vec![a.clone(), b]);
        assert_eq!(merge(results, MergePolicy::FirstNonEmpty), vec![a]);
    }
}

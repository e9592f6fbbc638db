//! Server wiring and main loop.
//!
//! [`Server`] assembles the parts into one session: the document store feeds
//! the diagnostics scheduler and the registry, the session owns the method
//! table, and the RPC engine sits between the framed transport and the
//! session. A single writer task owns the output so frames never interleave.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::diagnostics::{DiagnosticsScheduler, SchedulerConfig};
use crate::documents::{DocumentListener, DocumentStore};
use crate::error::{RegistryError, TransportError};
use crate::parts::commands::CommandPart;
use crate::parts::words::{register_word_count, ShortWords, WordsProvider};
use crate::parts::{Part, RegistryBuilder};
use crate::rpc::router::ExitStatus;
use crate::rpc::transport::{FrameReader, FrameWriter, Framing};
use crate::rpc::{Peer, RpcEngine};
use crate::session::Session;

/// How long teardown waits for cancelled requests to produce their replies.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds the registry with the reference parts.
///
/// # Errors
///
/// Returns an error if two parts claim the same method.
pub fn default_registry(config: &Config) -> Result<RegistryBuilder, RegistryError> {
    let mut commands = CommandPart::new();
    register_word_count(&mut commands);

    let mut builder = RegistryBuilder::new();
    builder
        .register(Part::Feature(Arc::new(WordsProvider::new())))?
        .register(Part::Feature(Arc::new(commands)))?
        .register(Part::Diagnostics(Arc::new(ShortWords::new(
            config.words.min_word_length,
        ))))?;
    Ok(builder)
}

/// One language server session over a byte channel.
pub struct Server {
    registry: RegistryBuilder,
    scheduler: SchedulerConfig,
    framing: Framing,
}

impl Server {
    /// Creates a server from a populated registry.
    #[must_use]
    pub fn new(registry: RegistryBuilder, scheduler: SchedulerConfig, framing: Framing) -> Self {
        Self {
            registry,
            scheduler,
            framing,
        }
    }

    /// Creates a server with the reference parts, configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        Ok(Self::new(
            default_registry(config)?,
            config.diagnostics.scheduler(),
            config.transport.framing.into(),
        ))
    }

    /// Runs the session until `exit`, end of input, a transport failure or
    /// a termination signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<ExitStatus, TransportError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.run_until(reader, writer, shutdown_signal()).await
    }

    /// Runs the session until `exit`, end of input, a transport failure or
    /// `stop` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    pub async fn run_until<R, W, S>(
        self,
        reader: R,
        writer: W,
        stop: S,
    ) -> Result<ExitStatus, TransportError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let (peer, outgoing) = Peer::new();
        let registry = Arc::new(self.registry.build());
        let documents = Arc::new(DocumentStore::new());
        let scheduler = DiagnosticsScheduler::new(
            Arc::clone(&documents),
            registry.diagnostics().to_vec(),
            peer.clone(),
            self.scheduler,
        );
        documents.subscribe(Arc::new(scheduler.clone()));
        documents.subscribe(Arc::clone(&registry) as Arc<dyn DocumentListener>);

        tracing::debug!(registry = ?registry, framing = ?self.framing, "Session wired");

        let session = Session::new(documents, registry, scheduler.clone(), peer.clone());
        let engine = RpcEngine::new(session.router(), peer.clone());

        let closing = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(
            FrameWriter::new(writer, self.framing),
            outgoing,
            closing.clone(),
        ));

        let mut reader = FrameReader::new(reader, self.framing);
        tokio::pin!(stop);

        let outcome = loop {
            tokio::select! {
                () = &mut stop => {
                    tracing::info!("Stop requested, ending session");
                    break Ok(ExitStatus::Clean);
                }

                frame = reader.read_frame() => match frame {
                    Ok(Some(body)) => {
                        if let ControlFlow::Break(status) = engine.handle_frame(&body) {
                            break Ok(status);
                        }
                    }
                    Ok(None) if session.shutdown_requested() => {
                        tracing::info!("Client disconnected after shutdown");
                        break Ok(ExitStatus::Clean);
                    }
                    Ok(None) => {
                        tracing::warn!("Client disconnected without shutdown");
                        break Ok(ExitStatus::TransportFailure);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Transport failure");
                        break Err(e);
                    }
                },
            }
        };

        engine.cancel_all();
        scheduler.shutdown();
        peer.fail_pending();

        // Cancelled requests still owe the client a reply.
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while engine.inflight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::task::yield_now().await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(inflight = engine.inflight_count(), "Requests still running at teardown");
        }

        closing.cancel();
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Writer failed");
                if outcome.is_ok() {
                    return Err(e);
                }
            }
            Err(e) => tracing::error!(error = %e, "Writer task panicked"),
        }

        if let Ok(status) = &outcome {
            tracing::info!(status = ?status, "Session ended");
        }
        outcome
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("scheduler", &self.scheduler)
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

/// Drains the outgoing queue into the transport.
///
/// Once `closing` fires, whatever is already queued is written and the
/// write half is shut down.
async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outgoing: mpsc::UnboundedReceiver<Value>,
    closing: CancellationToken,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let value = tokio::select! {
            biased;
            value = outgoing.recv() => value,
            () = closing.cancelled() => outgoing.try_recv().ok(),
        };
        let Some(value) = value else {
            break;
        };
        let body = match serde_json::to_vec(&value) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialise outgoing message");
                continue;
            }
        };
        writer.write_frame(&body).await?;
    }
    writer.shutdown().await
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = signal(SignalKind::interrupt())
        .and_then(|sigint| signal(SignalKind::terminate()).map(|sigterm| (sigint, sigterm)));
    let (mut sigint, mut sigterm) = match signals {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "Signal handlers unavailable");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }

        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Resolves on Ctrl+C.
#[cfg(windows)]
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(e) => {
            tracing::warn!(error = %e, "Signal handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

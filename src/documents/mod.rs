//! The authoritative store of open documents.
//!
//! The store owns the text and version of every open document. Providers
//! never see the live text; they receive a [`DocumentSnapshot`] that is
//! immutable and cheap to clone.
//!
//! Every successful mutation is followed by a [`DocumentEvent`] delivered
//! synchronously to each subscribed [`DocumentListener`], in mutation order.
//! Listeners are called after the store lock is released, so they may take
//! snapshots.

mod position;

pub use position::{offset_at, position_at};

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::error::DocumentError;
use crate::types::{DocumentUri, TextDocumentContentChangeEvent};

bitflags! {
    /// Document lifecycle events a provider subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        const OPEN = 1;
        const CHANGE = 1 << 1;
        const SAVE = 1 << 2;
        const CLOSE = 1 << 3;
    }
}

/// A document lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    Opened { uri: DocumentUri, version: i32 },
    Changed { uri: DocumentUri, version: i32 },
    Saved { uri: DocumentUri, version: i32 },
    Closed { uri: DocumentUri },
}

impl DocumentEvent {
    /// URI of the affected document.
    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Self::Opened { uri, .. }
            | Self::Changed { uri, .. }
            | Self::Saved { uri, .. }
            | Self::Closed { uri } => uri,
        }
    }

    /// The mask bit for this event.
    #[must_use]
    pub const fn kind(&self) -> EventMask {
        match self {
            Self::Opened { .. } => EventMask::OPEN,
            Self::Changed { .. } => EventMask::CHANGE,
            Self::Saved { .. } => EventMask::SAVE,
            Self::Closed { .. } => EventMask::CLOSE,
        }
    }
}

/// Receives document events.
pub trait DocumentListener: Send + Sync {
    fn on_event(&self, event: &DocumentEvent);
}

/// An immutable view of a document at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub uri: DocumentUri,
    pub language_id: String,
    pub version: i32,
    pub text: Arc<str>,
}

#[derive(Debug)]
struct TextDocument {
    language_id: String,
    version: i32,
    text: Arc<str>,
}

/// Open documents keyed by URI.
#[derive(Default)]
pub struct DocumentStore {
    documents: Mutex<HashMap<DocumentUri, TextDocument>>,
    listeners: RwLock<Vec<Arc<dyn DocumentListener>>>,
}

impl DocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener for every subsequent event.
    pub fn subscribe(&self, listener: Arc<dyn DocumentListener>) {
        self.listeners.write().push(listener);
    }

    /// Opens a document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::AlreadyOpen`] if the URI is already open.
    pub fn open(
        &self,
        uri: &str,
        text: impl Into<Arc<str>>,
        version: i32,
        language_id: &str,
    ) -> Result<(), DocumentError> {
        {
            let mut documents = self.documents.lock();
            if documents.contains_key(uri) {
                return Err(DocumentError::AlreadyOpen {
                    uri: uri.to_string(),
                });
            }
            documents.insert(
                uri.to_string(),
                TextDocument {
                    language_id: language_id.to_string(),
                    version,
                    text: text.into(),
                },
            );
        }
        tracing::debug!(uri = %uri, version, language_id = %language_id, "Document opened");
        self.publish(&DocumentEvent::Opened {
            uri: uri.to_string(),
            version,
        });
        Ok(())
    }

    /// Applies a batch of edits that takes the document to `new_version`.
    ///
    /// Edits are applied in array order, each against the text produced by
    /// the previous one. The batch is atomic: on error nothing changes.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotOpen`] for unknown URIs,
    /// [`DocumentError::VersionMismatch`] unless `new_version` is exactly
    /// one greater than the stored version, and
    /// [`DocumentError::InvalidRange`] for a range whose start lies after
    /// its end.
    pub fn apply_change(
        &self,
        uri: &str,
        edits: &[TextDocumentContentChangeEvent],
        new_version: i32,
    ) -> Result<(), DocumentError> {
        {
            let mut documents = self.documents.lock();
            let document = documents.get_mut(uri).ok_or_else(|| DocumentError::NotOpen {
                uri: uri.to_string(),
            })?;

            let expected = document.version.saturating_add(1);
            if new_version != expected {
                return Err(DocumentError::VersionMismatch {
                    uri: uri.to_string(),
                    expected,
                    got: new_version,
                });
            }

            let text = apply_edits(&document.text, edits).ok_or_else(|| {
                DocumentError::InvalidRange {
                    uri: uri.to_string(),
                }
            })?;
            document.text = text.into();
            document.version = new_version;
        }
        tracing::trace!(uri = %uri, version = new_version, edits = edits.len(), "Document changed");
        self.publish(&DocumentEvent::Changed {
            uri: uri.to_string(),
            version: new_version,
        });
        Ok(())
    }

    /// Records a save, optionally resynchronising the full text.
    ///
    /// The version does not change. If `text` differs from the stored text
    /// a change event is published before the save event.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotOpen`] for unknown URIs.
    pub fn save(&self, uri: &str, text: Option<String>) -> Result<(), DocumentError> {
        let (version, replaced) = {
            let mut documents = self.documents.lock();
            let document = documents.get_mut(uri).ok_or_else(|| DocumentError::NotOpen {
                uri: uri.to_string(),
            })?;
            let replaced = match text {
                Some(text) if *document.text != *text => {
                    tracing::warn!(uri = %uri, version = document.version, "Saved text differs from synchronised text");
                    document.text = text.into();
                    true
                }
                _ => false,
            };
            (document.version, replaced)
        };

        if replaced {
            self.publish(&DocumentEvent::Changed {
                uri: uri.to_string(),
                version,
            });
        }
        self.publish(&DocumentEvent::Saved {
            uri: uri.to_string(),
            version,
        });
        Ok(())
    }

    /// Closes a document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotOpen`] for unknown URIs.
    pub fn close(&self, uri: &str) -> Result<(), DocumentError> {
        if self.documents.lock().remove(uri).is_none() {
            return Err(DocumentError::NotOpen {
                uri: uri.to_string(),
            });
        }
        tracing::debug!(uri = %uri, "Document closed");
        self.publish(&DocumentEvent::Closed {
            uri: uri.to_string(),
        });
        Ok(())
    }

    /// Returns the current text and version of a document.
    #[must_use]
    pub fn snapshot(&self, uri: &str) -> Option<DocumentSnapshot> {
        self.documents.lock().get(uri).map(|doc| DocumentSnapshot {
            uri: uri.to_string(),
            language_id: doc.language_id.clone(),
            version: doc.version,
            text: Arc::clone(&doc.text),
        })
    }

    /// Returns true if the URI is open.
    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        self.documents.lock().contains_key(uri)
    }

    /// Number of open documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    /// Returns true if no document is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    fn publish(&self, event: &DocumentEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("open", &self.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// Applies edits in order. Returns `None` if any range is inverted.
fn apply_edits(text: &str, edits: &[TextDocumentContentChangeEvent]) -> Option<String> {
    let mut text = text.to_string();
    for edit in edits {
        match edit.range {
            None => text.clone_from(&edit.text),
            Some(range) => {
                if range.start > range.end {
                    return None;
                }
                let start = offset_at(&text, range.start);
                let end = offset_at(&text, range.end).max(start);
                text.replace_range(start..end, &edit.text);
            }
        }
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, Range};

    fn full(text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: None,
            text: text.to_string(),
        }
    }

    fn edit(start: (u32, u32), end: (u32, u32), text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range::new(
                Position::new(start.0, start.1),
                Position::new(end.0, end.1),
            )),
            text: text.to_string(),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DocumentEvent>>);

    impl DocumentListener for Recorder {
        fn on_event(&self, event: &DocumentEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn open_then_snapshot() {
        let store = DocumentStore::new();
        store.open("file:///a.txt", "foo", 1, "plaintext").unwrap();
        let snap = store.snapshot("file:///a.txt").unwrap();
        assert_eq!(&*snap.text, "foo");
        assert_eq!(snap.version, 1);
        assert_eq!(snap.language_id, "plaintext");
    }

    #[test]
    fn double_open_is_rejected() {
        let store = DocumentStore::new();
        store.open("file:///a.txt", "", 1, "plaintext").unwrap();
        assert_eq!(
            store.open("file:///a.txt", "", 1, "plaintext"),
            Err(DocumentError::AlreadyOpen {
                uri: "file:///a.txt".to_string()
            })
        );
    }

    #[test]
    fn versions_must_increase_by_one() {
        let store = DocumentStore::new();
        store.open("file:///a.txt", "a", 1, "plaintext").unwrap();
        for version in 2..10 {
            store.apply_change("file:///a.txt", &[full("b")], version).unwrap();
        }
        assert_eq!(store.snapshot("file:///a.txt").unwrap().version, 9);

        for bad in [9, 11, 1] {
            let err = store.apply_change("file:///a.txt", &[full("c")], bad).unwrap_err();
            assert_eq!(
                err,
                DocumentError::VersionMismatch {
                    uri: "file:///a.txt".to_string(),
                    expected: 10,
                    got: bad,
                }
            );
        }
        assert_eq!(&*store.snapshot("file:///a.txt").unwrap().text, "b");
    }

    #[test]
    fn incremental_edits_apply_in_order() {
        let store = DocumentStore::new();
        store.open("file:///a.txt", "hello\nworld\n", 1, "plaintext").unwrap();
        store
            .apply_change(
                "file:///a.txt",
                &[
                    edit((0, 0), (0, 5), "goodbye"),
                    // Interpreted against "goodbye\nworld\n".
                    edit((0, 7), (1, 0), " "),
                    edit((0, 13), (0, 13), "!"),
                ],
                2,
            )
            .unwrap();
        assert_eq!(&*store.snapshot("file:///a.txt").unwrap().text, "goodbye world!\n");
    }

    #[test]
    fn edit_past_end_appends() {
        let store = DocumentStore::new();
        store.open("file:///a.txt", "foo", 1, "plaintext").unwrap();
        store
            .apply_change("file:///a.txt", &[edit((5, 0), (5, 0), "\nbar")], 2)
            .unwrap();
        assert_eq!(&*store.snapshot("file:///a.txt").unwrap().text, "foo\nbar");
    }

    #[test]
    fn inverted_range_leaves_document_untouched() {
        let store = DocumentStore::new();
        store.open("file:///a.txt", "foo\nbar", 1, "plaintext").unwrap();
        let err = store
            .apply_change(
                "file:///a.txt",
                &[edit((0, 0), (0, 1), "x"), edit((1, 2), (0, 1), "y")],
                2,
            )
            .unwrap_err();
        assert!(matches!(err, DocumentError::InvalidRange { .. }));
        let snap = store.snapshot("file:///a.txt").unwrap();
        assert_eq!(&*snap.text, "foo\nbar");
        assert_eq!(snap.version, 1);
    }

    #[test]
    fn listeners_see_events_in_order() {
        let store = DocumentStore::new();
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());

        store.open("file:///a.txt", "foo", 1, "plaintext").unwrap();
        store.apply_change("file:///a.txt", &[full("foobar")], 2).unwrap();
        store.save("file:///a.txt", Some("foobar".to_string())).unwrap();
        store.save("file:///a.txt", Some("other".to_string())).unwrap();
        store.close("file:///a.txt").unwrap();
        assert!(store.apply_change("file:///a.txt", &[full("x")], 3).is_err());

        let uri = "file:///a.txt".to_string();
        assert_eq!(
            *recorder.0.lock(),
            vec![
                DocumentEvent::Opened { uri: uri.clone(), version: 1 },
                DocumentEvent::Changed { uri: uri.clone(), version: 2 },
                DocumentEvent::Saved { uri: uri.clone(), version: 2 },
                DocumentEvent::Changed { uri: uri.clone(), version: 2 },
                DocumentEvent::Saved { uri: uri.clone(), version: 2 },
                DocumentEvent::Closed { uri },
            ]
        );
    }

    #[test]
    fn close_unknown_document_is_error() {
        let store = DocumentStore::new();
        assert!(matches!(
            store.close("file:///nope"),
            Err(DocumentError::NotOpen { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn event_masks() {
        let event = DocumentEvent::Changed {
            uri: "u".to_string(),
            version: 2,
        };
        assert_eq!(event.kind(), EventMask::CHANGE);
        assert!((EventMask::OPEN | EventMask::CHANGE).contains(event.kind()));
        assert_eq!(event.uri(), "u");
    }
}

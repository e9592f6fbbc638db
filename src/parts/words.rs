//! Reference providers for plain-text "words" documents.
//!
//! A word is a run of `\w` characters. The providers here are deliberately
//! simple; they exist so the server is useful on its own and so every
//! extension point of the registry has a real implementation behind it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::documents::{offset_at, position_at, DocumentEvent, DocumentSnapshot, EventMask};
use crate::error::{DocumentError, ProviderError};
use crate::parts::commands::CommandPart;
use crate::parts::{parse_params, DiagnosticsProvider, FeatureProvider, RequestContext};
use crate::types::{
    Diagnostic, DiagnosticSeverity, DocumentUri, Position, Range, TextDocumentPositionParams,
};

/// Diagnostic code of short-word findings.
pub const SHORT_WORD_CODE: &str = "short-word";

const HOVER: &str = "textDocument/hover";
const COMPLETION: &str = "textDocument/completion";
const DOCUMENT_SYMBOL: &str = "textDocument/documentSymbol";

// LSP enum values.
const COMPLETION_KIND_TEXT: u32 = 1;
const SYMBOL_KIND_MODULE: u32 = 2;

/// The compiled word pattern; `None` if the regex engine rejected it.
fn word_regex() -> Option<&'static Regex> {
    static WORD: OnceLock<Option<Regex>> = OnceLock::new();
    WORD.get_or_init(|| {
        Regex::new(r"\w+")
            .map_err(|e| tracing::error!(error = %e, "Word pattern failed to compile"))
            .ok()
    })
    .as_ref()
}

/// Byte ranges and text of every word in `text`.
fn words(text: &str) -> impl Iterator<Item = (usize, usize, &str)> {
    word_regex()
        .into_iter()
        .flat_map(move |re| re.find_iter(text))
        .map(|m| (m.start(), m.end(), m.as_str()))
}

/// The word touching `offset`, including a cursor right after its last
/// character.
fn word_at(text: &str, offset: usize) -> Option<(usize, usize, &str)> {
    words(text).find(|&(start, end, _)| start <= offset && offset <= end)
}

fn range_of(text: &str, start: usize, end: usize) -> Range {
    Range::new(position_at(text, start), position_at(text, end))
}

/// Flags every word shorter than a minimum length.
#[derive(Debug, Clone)]
pub struct ShortWords {
    min_length: usize,
    languages: Vec<String>,
}

impl ShortWords {
    /// Creates the provider for all languages.
    #[must_use]
    pub const fn new(min_length: usize) -> Self {
        Self {
            min_length,
            languages: Vec::new(),
        }
    }

    /// Restricts the provider to the given language ids.
    #[must_use]
    pub fn for_languages(mut self, languages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl DiagnosticsProvider for ShortWords {
    fn name(&self) -> &str {
        "short-words"
    }

    fn languages(&self) -> &[String] {
        &self.languages
    }

    async fn collect(
        &self,
        document: &DocumentSnapshot,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let mut findings = Vec::new();
        for (line_no, line) in document.text.split('\n').enumerate() {
            if token.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            if line_no % 1024 == 1023 {
                tokio::task::yield_now().await;
            }

            let line = line.strip_suffix('\r').unwrap_or(line);
            for (start, end, word) in words(line) {
                let len = word.chars().count();
                if len >= self.min_length {
                    continue;
                }
                let line_no = u32::try_from(line_no).unwrap_or(u32::MAX);
                let range = Range::new(
                    Position::new(line_no, utf16_len(&line[..start])),
                    Position::new(line_no, utf16_len(&line[..end])),
                );
                findings.push(
                    Diagnostic::new(
                        range,
                        DiagnosticSeverity::Warning,
                        format!(
                            "'{word}' is shorter than {} characters",
                            self.min_length
                        ),
                    )
                    .with_code(SHORT_WORD_CODE),
                );
            }
        }
        Ok(findings)
    }
}

fn utf16_len(s: &str) -> u32 {
    u32::try_from(s.encode_utf16().count()).unwrap_or(u32::MAX)
}

type WordCounts = HashMap<String, usize>;

/// Hover, completion and outline for words documents.
///
/// Occurrence counts are cached per document version and dropped when the
/// document changes or closes.
#[derive(Debug, Default)]
pub struct WordsProvider {
    counts: Mutex<HashMap<DocumentUri, (i32, Arc<WordCounts>)>>,
}

impl WordsProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self, snapshot: &DocumentSnapshot) -> Arc<WordCounts> {
        if let Some((version, counts)) = self.counts.lock().get(&snapshot.uri) {
            if *version == snapshot.version {
                return Arc::clone(counts);
            }
        }
        let mut counts = WordCounts::new();
        for (_, _, word) in words(&snapshot.text) {
            *counts.entry(word.to_string()).or_default() += 1;
        }
        let counts = Arc::new(counts);
        self.counts
            .lock()
            .insert(snapshot.uri.clone(), (snapshot.version, Arc::clone(&counts)));
        counts
    }

    /// Number of cached documents.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.counts.lock().len()
    }

    fn hover(&self, snapshot: &DocumentSnapshot, position: Position) -> Value {
        let text = &snapshot.text;
        let Some((start, end, word)) = word_at(text, offset_at(text, position)) else {
            return Value::Null;
        };
        let count = self.counts(snapshot).get(word).copied().unwrap_or(0);
        let plural = if count == 1 { "" } else { "s" };
        json!({
            "contents": {
                "kind": "plaintext",
                "value": format!("{word}: {count} occurrence{plural}"),
            },
            "range": range_of(text, start, end),
        })
    }

    fn completion(snapshot: &DocumentSnapshot, position: Position) -> Value {
        let text = &snapshot.text;
        let offset = offset_at(text, position);
        let prefix = word_at(text, offset)
            .filter(|&(start, _, _)| start < offset)
            .map_or("", |(start, _, _)| &text[start..offset]);

        let candidates: BTreeSet<&str> = words(text)
            .map(|(_, _, word)| word)
            .filter(|word| word.starts_with(prefix) && *word != prefix)
            .collect();
        let items: Vec<Value> = candidates
            .into_iter()
            .map(|word| json!({ "label": word, "kind": COMPLETION_KIND_TEXT }))
            .collect();
        json!({ "isIncomplete": false, "items": items })
    }

    fn document_symbols(snapshot: &DocumentSnapshot) -> Value {
        let text = &snapshot.text;
        let mut symbols = Vec::new();
        let mut line_start = 0;
        for line in text.split_inclusive('\n') {
            let content = line.trim_end_matches(['\n', '\r']);
            if let Some(heading) = content.strip_prefix("# ") {
                let name = heading.trim();
                if !name.is_empty() {
                    let name_start = line_start + (content.len() - heading.len());
                    symbols.push(json!({
                        "name": name,
                        "kind": SYMBOL_KIND_MODULE,
                        "range": range_of(text, line_start, line_start + content.len()),
                        "selectionRange": range_of(text, name_start, name_start + heading.trim_end().len()),
                    }));
                }
            }
            line_start += line.len();
        }
        Value::Array(symbols)
    }
}

#[async_trait]
impl FeatureProvider for WordsProvider {
    fn name(&self) -> &str {
        "words"
    }

    fn methods(&self) -> Vec<String> {
        vec![
            HOVER.to_string(),
            COMPLETION.to_string(),
            DOCUMENT_SYMBOL.to_string(),
        ]
    }

    fn capabilities(&self) -> Value {
        json!({
            "hoverProvider": true,
            "completionProvider": { "resolveProvider": false },
            "documentSymbolProvider": true,
        })
    }

    fn events(&self) -> EventMask {
        EventMask::CHANGE | EventMask::CLOSE
    }

    async fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, ProviderError> {
        match method {
            HOVER | COMPLETION => {
                let params: TextDocumentPositionParams = parse_params(params)?;
                let snapshot = open_snapshot(&ctx, &params.text_document.uri)?;
                if method == HOVER {
                    Ok(self.hover(&snapshot, params.position))
                } else {
                    Ok(Self::completion(&snapshot, params.position))
                }
            }
            DOCUMENT_SYMBOL => {
                #[derive(serde::Deserialize)]
                #[serde(rename_all = "camelCase")]
                struct Params {
                    text_document: crate::types::TextDocumentIdentifier,
                }
                let params: Params = parse_params(params)?;
                let snapshot = open_snapshot(&ctx, &params.text_document.uri)?;
                Ok(Self::document_symbols(&snapshot))
            }
            other => Err(ProviderError::failed(format!("unsupported method {other}"))),
        }
    }

    async fn on_event(&self, event: &DocumentEvent) -> Result<(), ProviderError> {
        match event {
            DocumentEvent::Changed { uri, .. } | DocumentEvent::Closed { uri } => {
                self.counts.lock().remove(uri);
            }
            DocumentEvent::Opened { .. } | DocumentEvent::Saved { .. } => {}
        }
        Ok(())
    }
}

fn open_snapshot(ctx: &RequestContext, uri: &str) -> Result<DocumentSnapshot, ProviderError> {
    ctx.documents.snapshot(uri).ok_or_else(|| {
        DocumentError::NotOpen {
            uri: uri.to_string(),
        }
        .into()
    })
}

/// Registers the `wordCount` command: `[uri] -> {uri, version, words}`.
pub fn register_word_count(commands: &mut CommandPart) -> String {
    commands.register("wordCount", word_count)
}

fn word_count(args: Vec<Value>, ctx: RequestContext) -> BoxFuture<'static, Result<Value, ProviderError>> {
    Box::pin(async move {
        let uri = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::invalid_params("wordCount expects a document URI"))?;
        let snapshot = open_snapshot(&ctx, uri)?;
        Ok::<_, ProviderError>(json!({
            "uri": snapshot.uri,
            "version": snapshot.version,
            "words": words(&snapshot.text).count(),
        }))
    })
}

#[cfg(test)]
mod tests {
    use crate::documents::DocumentStore;
    use crate::parts::commands::EXECUTE_COMMAND;
    use crate::rpc::Peer;

    use super::*;

    fn snap(text: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            uri: "file:///a.txt".to_string(),
            language_id: "plaintext".to_string(),
            version: 1,
            text: text.into(),
        }
    }

    fn ctx_with(text: &str) -> RequestContext {
        let documents = Arc::new(DocumentStore::new());
        documents.open("file:///a.txt", text, 1, "plaintext").unwrap();
        let (peer, _rx) = Peer::new();
        RequestContext {
            documents,
            token: CancellationToken::new(),
            peer,
        }
    }

    #[test]
    fn word_pattern_compiles_and_splits_on_non_word_characters() {
        assert!(word_regex().is_some());
        let found: Vec<_> = words("héllo, wörld_2!").collect();
        assert_eq!(found, vec![(0, 6, "héllo"), (8, 16, "wörld_2")]);
    }

    fn at(line: u32, character: u32) -> Value {
        json!({
            "textDocument": { "uri": "file:///a.txt" },
            "position": { "line": line, "character": character }
        })
    }

    #[tokio::test]
    async fn short_words_are_flagged() {
        let provider = ShortWords::new(3);
        let findings = provider
            .collect(&snap("a foo\r\nbar is"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].range, Range::new(Position::new(0, 0), Position::new(0, 1)));
        assert_eq!(findings[1].range, Range::new(Position::new(1, 4), Position::new(1, 6)));
        assert_eq!(findings[1].severity, Some(DiagnosticSeverity::Warning));
        assert_eq!(findings[1].code.as_deref(), Some(SHORT_WORD_CODE));
    }

    #[tokio::test]
    async fn foobar_has_no_findings() {
        let findings = ShortWords::new(3)
            .collect(&snap("foobar"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn cancelled_collect_stops() {
        let token = CancellationToken::new();
        token.cancel();
        let result = ShortWords::new(3).collect(&snap("a b c"), &token).await;
        assert_eq!(result, Err(ProviderError::Cancelled));
    }

    #[test]
    fn language_restriction() {
        let provider = ShortWords::new(3).for_languages(["plaintext"]);
        assert_eq!(provider.languages(), ["plaintext".to_string()]);
    }

    #[tokio::test]
    async fn hover_counts_occurrences() {
        let provider = WordsProvider::new();
        let ctx = ctx_with("foo  bar\nfoo");
        let hover = provider.handle(HOVER, Some(at(1, 3)), ctx.clone()).await.unwrap();
        assert_eq!(hover["contents"]["value"], "foo: 2 occurrences");
        assert_eq!(hover["range"]["start"], json!({ "line": 1, "character": 0 }));
        assert_eq!(provider.cached(), 1);

        let bar = provider.handle(HOVER, Some(at(0, 6)), ctx.clone()).await.unwrap();
        assert_eq!(bar["contents"]["value"], "bar: 1 occurrence");

        let between = provider.handle(HOVER, Some(at(0, 4)), ctx).await.unwrap();
        assert!(between.is_null());
    }

    #[tokio::test]
    async fn completion_uses_typed_prefix() {
        let provider = WordsProvider::new();
        let ctx = ctx_with("alpha alpine beta al");
        let result = provider.handle(COMPLETION, Some(at(0, 20)), ctx).await.unwrap();
        let labels: Vec<_> = result["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["label"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(labels, vec!["alpha", "alpine"]);
    }

    #[tokio::test]
    async fn headings_become_symbols() {
        let provider = WordsProvider::new();
        let ctx = ctx_with("# Intro\ntext\n# Usage  \n#notheading\n");
        let result = provider
            .handle(DOCUMENT_SYMBOL, Some(json!({ "textDocument": { "uri": "file:///a.txt" } })), ctx)
            .await
            .unwrap();
        let symbols = result.as_array().unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0]["name"], "Intro");
        assert_eq!(symbols[1]["name"], "Usage");
        assert_eq!(symbols[1]["range"]["start"]["line"], 2);
        assert_eq!(symbols[1]["selectionRange"]["start"]["character"], 2);
        assert_eq!(symbols[1]["selectionRange"]["end"]["character"], 7);
    }

    #[tokio::test]
    async fn unknown_document_fails() {
        let provider = WordsProvider::new();
        let ctx = ctx_with("x");
        let params = json!({
            "textDocument": { "uri": "file:///missing.txt" },
            "position": { "line": 0, "character": 0 }
        });
        let err = provider.handle(HOVER, Some(params), ctx).await.unwrap_err();
        assert!(matches!(err, ProviderError::Failed { .. }));
    }

    #[tokio::test]
    async fn change_event_drops_cache() {
        let provider = WordsProvider::new();
        provider.counts(&snap("foo"));
        assert_eq!(provider.cached(), 1);
        provider
            .on_event(&DocumentEvent::Changed {
                uri: "file:///a.txt".to_string(),
                version: 2,
            })
            .await
            .unwrap();
        assert_eq!(provider.cached(), 0);
    }

    #[tokio::test]
    async fn word_count_command() {
        let mut commands = CommandPart::with_prefix("p");
        let name = register_word_count(&mut commands);
        assert_eq!(name, "p.wordCount");

        let result = commands
            .handle(
                EXECUTE_COMMAND,
                Some(json!({ "command": name, "arguments": ["file:///a.txt"] })),
                ctx_with("one two three"),
            )
            .await
            .unwrap();
        assert_eq!(result["words"], 3);
        assert_eq!(result["version"], 1);

        let err = commands
            .handle(EXECUTE_COMMAND, Some(json!({ "command": "p.wordCount" })), ctx_with(""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidParams { .. }));
    }
}

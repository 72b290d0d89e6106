//! Semantic token cache with full and delta reconciliation.
//!
//! Each document has at most one token request in flight. Delta results are
//! spliced into the cached integer stream; any sign that the server and the
//! cache disagree discards the cache and asks for a full reload instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Integers per encoded token.
const TOKEN_WIDTH: usize = 5;

/// Type and modifier names the server uses to interpret token integers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemanticTokenLegend {
    pub token_types: Vec<String>,
    pub token_modifiers: Vec<String>,
}

impl SemanticTokenLegend {
    /// Parse `SemanticTokensLegend`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let names = |key: &str| -> Option<Vec<String>> {
            value
                .get(key)?
                .as_array()?
                .iter()
                .map(|v| v.as_str().map(String::from))
                .collect()
        };
        Some(Self {
            token_types: names("tokenTypes")?,
            token_modifiers: names("tokenModifiers").unwrap_or_default(),
        })
    }

    fn type_name(&self, index: u32) -> Option<&str> {
        self.token_types.get(index as usize).map(String::as_str)
    }

    fn modifier_names(&self, bits: u32) -> Vec<String> {
        self.token_modifiers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < 32 && bits & (1 << i) != 0)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

/// One token at an absolute position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticToken {
    pub line: u32,
    pub start: u32,
    pub length: u32,
    pub token_type: u32,
    pub modifiers: u32,
    /// Legend name of `token_type`, when a legend is known.
    pub type_name: Option<String>,
    pub modifier_names: Vec<String>,
}

/// Decode the relative integer stream into absolute tokens.
///
/// A trailing partial group is ignored.
#[must_use]
pub fn decode(data: &[u32], legend: Option<&SemanticTokenLegend>) -> Vec<SemanticToken> {
    let mut line = 0u32;
    let mut start = 0u32;
    data.chunks_exact(TOKEN_WIDTH)
        .map(|chunk| {
            let (delta_line, delta_start) = (chunk[0], chunk[1]);
            if delta_line > 0 {
                line = line.saturating_add(delta_line);
                start = delta_start;
            } else {
                start = start.saturating_add(delta_start);
            }
            SemanticToken {
                line,
                start,
                length: chunk[2],
                token_type: chunk[3],
                modifiers: chunk[4],
                type_name: legend.and_then(|l| l.type_name(chunk[3])).map(String::from),
                modifier_names: legend.map(|l| l.modifier_names(chunk[4])).unwrap_or_default(),
            }
        })
        .collect()
}

/// One `SemanticTokensEdit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEdit {
    pub start: usize,
    pub delete_count: usize,
    pub data: Vec<u32>,
}

/// Why a delta could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drift {
    StartOutOfRange { start: usize, len: usize },
    DeleteOutOfRange { end: usize, len: usize },
    Overlap { start: usize, previous_end: usize },
}

/// Splice sorted edits into `old`, walking both in one pass.
fn splice(old: &[u32], edits: &mut [TokenEdit]) -> Result<Vec<u32>, Drift> {
    edits.sort_by_key(|e| e.start);
    let len = old.len();
    let mut out = Vec::with_capacity(len);
    let mut cursor = 0;
    for edit in edits.iter_mut() {
        if edit.start > len {
            return Err(Drift::StartOutOfRange {
                start: edit.start,
                len,
            });
        }
        let end = edit.start.saturating_add(edit.delete_count);
        if end > len {
            return Err(Drift::DeleteOutOfRange { end, len });
        }
        if edit.start < cursor {
            return Err(Drift::Overlap {
                start: edit.start,
                previous_end: cursor,
            });
        }
        out.extend_from_slice(&old[cursor..edit.start]);
        out.append(&mut edit.data);
        cursor = end;
    }
    out.extend_from_slice(&old[cursor..]);
    Ok(out)
}

fn parse_data(value: Option<&Value>) -> Vec<u32> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_edits(value: &Value) -> Option<Vec<TokenEdit>> {
    value
        .as_array()?
        .iter()
        .map(|edit| {
            Some(TokenEdit {
                start: usize::try_from(edit.get("start")?.as_u64()?).ok()?,
                delete_count: usize::try_from(edit.get("deleteCount")?.as_u64()?).ok()?,
                data: parse_data(edit.get("data")),
            })
        })
        .collect()
}

/// Cached token stream for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCache {
    pub result_id: Option<String>,
    pub data: Vec<u32>,
    /// Document version the stream describes.
    pub version: i32,
}

/// Shape of the next token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRequest {
    Full,
    Delta { previous_result_id: String },
}

impl TokenRequest {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Full => crate::capabilities::SEMANTIC_TOKENS_FULL,
            Self::Delta { .. } => crate::capabilities::SEMANTIC_TOKENS_DELTA,
        }
    }
}

/// What a token response did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Cache replaced or patched; re-render with these tokens.
    Updated(Vec<SemanticToken>),
    /// Cache was out of sync and has been discarded; issue a full request.
    NeedsFullReload,
    /// Response no longer matches anything we track.
    Discarded,
}

#[derive(Debug, Clone)]
struct InFlight {
    /// Document version the request was issued for.
    version: i32,
    /// Cache version a delta will be applied against.
    base_version: Option<i32>,
}

#[derive(Debug, Default)]
struct FileTokens {
    cache: Option<TokenCache>,
    in_flight: Option<InFlight>,
    requested_again: bool,
}

#[derive(Debug, Default)]
pub struct SemanticTokenReconciler {
    files: HashMap<PathBuf, FileTokens>,
    legend: Option<SemanticTokenLegend>,
}

impl SemanticTokenReconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a full token stream. `None` when the cache is already
    /// current or a request is in flight (it will be re-issued on
    /// completion).
    pub fn request_full(&mut self, path: &Path, version: i32) -> Option<TokenRequest> {
        self.plan(path, version, false, false)
    }

    /// Ask for a delta against the cached result, falling back to a full
    /// request without a cached `resultId`.
    pub fn request_delta(&mut self, path: &Path, version: i32) -> Option<TokenRequest> {
        self.plan(path, version, true, false)
    }

    /// Like [`Self::request_delta`] (or a full request when `delta` is
    /// false) but issued even when the cache claims
    /// to be current, for server-initiated refreshes.
    pub fn refresh(&mut self, path: &Path, version: i32, delta: bool) -> Option<TokenRequest> {
        self.plan(path, version, delta, true)
    }

    fn plan(&mut self, path: &Path, version: i32, delta: bool, force: bool) -> Option<TokenRequest> {
        let file = self.files.entry(path.to_path_buf()).or_default();
        if file.in_flight.is_some() {
            file.requested_again = true;
            return None;
        }
        if !force && file.cache.as_ref().is_some_and(|c| c.version == version) {
            return None;
        }
        let previous = file
            .cache
            .as_ref()
            .filter(|_| delta)
            .and_then(|c| c.result_id.clone().map(|id| (id, c.version)));
        let (request, base_version) = match previous {
            Some((previous_result_id, base)) => (TokenRequest::Delta { previous_result_id }, Some(base)),
            None => (TokenRequest::Full, None),
        };
        file.in_flight = Some(InFlight {
            version,
            base_version,
        });
        file.requested_again = false;
        Some(request)
    }

    /// Whether a token request for `path` is awaiting its response.
    #[must_use]
    pub fn in_flight(&self, path: &Path) -> bool {
        self.files.get(path).is_some_and(|f| f.in_flight.is_some())
    }

    /// Clear the in-flight marker after a failed request. Returns whether
    /// another request was asked for meanwhile.
    pub fn request_failed(&mut self, path: &Path) -> bool {
        let Some(file) = self.files.get_mut(path) else {
            return false;
        };
        file.in_flight = None;
        std::mem::take(&mut file.requested_again)
    }

    /// Handle the result of a request issued by [`Self::request_full`] or
    /// [`Self::request_delta`]. Servers may answer a delta request with a
    /// full result; both shapes are accepted.
    pub fn complete(&mut self, path: &Path, result: &Value) -> TokenOutcome {
        let Some(in_flight) = self.files.get_mut(path).and_then(|f| f.in_flight.take()) else {
            return TokenOutcome::Discarded;
        };
        let result_id = result
            .get("resultId")
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(edits) = result.get("edits") {
            let Some(edits) = parse_edits(edits) else {
                tracing::warn!(path = %path.display(), "Malformed semantic token delta");
                self.discard(path);
                return TokenOutcome::NeedsFullReload;
            };
            let Some(base) = in_flight.base_version else {
                tracing::warn!(path = %path.display(), "Delta received for a full token request");
                self.discard(path);
                return TokenOutcome::NeedsFullReload;
            };
            self.apply_delta(path, edits, result_id, base, in_flight.version)
        } else {
            self.apply_full(path, parse_data(result.get("data")), result_id, in_flight.version)
        }
    }

    /// Replace the cache with a full token stream.
    pub fn apply_full(
        &mut self,
        path: &Path,
        data: Vec<u32>,
        result_id: Option<String>,
        version: i32,
    ) -> TokenOutcome {
        let file = self.files.entry(path.to_path_buf()).or_default();
        let tokens = decode(&data, self.legend.as_ref());
        file.cache = Some(TokenCache {
            result_id,
            data,
            version,
        });
        TokenOutcome::Updated(tokens)
    }

    /// Splice a delta computed against the cache at `base_version`.
    ///
    /// An empty edit list leaves the stream and `resultId` untouched and
    /// marks the cache current for `version`.
    pub fn apply_delta(
        &mut self,
        path: &Path,
        mut edits: Vec<TokenEdit>,
        result_id: Option<String>,
        base_version: i32,
        version: i32,
    ) -> TokenOutcome {
        let Some(cache) = self.files.get_mut(path).and_then(|f| f.cache.as_mut()) else {
            tracing::debug!(path = %path.display(), "Token delta without a cached stream");
            return TokenOutcome::NeedsFullReload;
        };
        if cache.version != base_version {
            tracing::warn!(
                path = %path.display(),
                cached = cache.version,
                base = base_version,
                "Token cache version does not match delta base; reloading"
            );
            self.discard(path);
            return TokenOutcome::NeedsFullReload;
        }
        if edits.is_empty() {
            cache.version = version;
            return TokenOutcome::Updated(decode(&cache.data, self.legend.as_ref()));
        }
        match splice(&cache.data, &mut edits) {
            Ok(data) => {
                cache.data = data;
                cache.result_id = result_id;
                cache.version = version;
                TokenOutcome::Updated(decode(&cache.data, self.legend.as_ref()))
            }
            Err(drift) => {
                tracing::warn!(path = %path.display(), ?drift, "Semantic token delta out of sync; reloading");
                self.discard(path);
                TokenOutcome::NeedsFullReload
            }
        }
    }

    /// Whether a request was asked for while one was in flight. Clears
    /// the flag.
    pub fn take_rerequest(&mut self, path: &Path) -> bool {
        self.files
            .get_mut(path)
            .is_some_and(|f| std::mem::take(&mut f.requested_again))
    }

    fn discard(&mut self, path: &Path) {
        if let Some(file) = self.files.get_mut(path) {
            file.cache = None;
        }
    }

    /// Install a new legend. Returns every cached document re-decoded
    /// when the legend actually changed.
    pub fn set_legend(&mut self, legend: Option<SemanticTokenLegend>) -> Vec<(PathBuf, Vec<SemanticToken>)> {
        if self.legend == legend {
            return Vec::new();
        }
        self.legend = legend;
        let mut rendered: Vec<(PathBuf, Vec<SemanticToken>)> = self
            .files
            .iter()
            .filter_map(|(path, f)| {
                f.cache
                    .as_ref()
                    .map(|c| (path.clone(), decode(&c.data, self.legend.as_ref())))
            })
            .collect();
        rendered.sort_by(|a, b| a.0.cmp(&b.0));
        rendered
    }

    #[must_use]
    pub fn legend(&self) -> Option<&SemanticTokenLegend> {
        self.legend.as_ref()
    }

    #[must_use]
    pub fn cache(&self, path: &Path) -> Option<&TokenCache> {
        self.files.get(path).and_then(|f| f.cache.as_ref())
    }

    /// Decoded tokens for `path` from the current cache.
    #[must_use]
    pub fn tokens(&self, path: &Path) -> Option<Vec<SemanticToken>> {
        self.cache(path).map(|c| decode(&c.data, self.legend.as_ref()))
    }

    /// Drop the cache so the next request is a full one.
    pub fn invalidate(&mut self, path: &Path) {
        self.discard(path);
    }

    /// Forget a closed document.
    pub fn remove(&mut self, path: &Path) {
        self.files.remove(path);
    }

    /// Forget everything, including the legend.
    pub fn clear(&mut self) {
        self.files.clear();
        self.legend = None;
    }
}

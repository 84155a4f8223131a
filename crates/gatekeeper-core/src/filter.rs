//! Filters applied to client → endpoint data.
//!
//! A filter looks at one chunk and returns a [`Verdict`]. Filters run in the
//! order they were attached, each seeing the output of the previous one. A
//! `Pass` verdict leaves the data untouched (no copy is made). A `Stop`
//! verdict ends the session before the chunk reaches the endpoint.
//!
//! A filter that fails with a [`FilterFault`] does not end the session: the
//! chain stops there and the data as transformed so far is relayed.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Outcome of running one filter over a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Leave the chunk as is.
    Pass,
    /// Replace the chunk with these bytes.
    Replace(Vec<u8>),
    /// Terminate the session; the chunk is dropped.
    Stop,
}

/// Unexpected failure inside a filter.
#[derive(Debug, thiserror::Error)]
#[error("filter {filter} failed: {reason}")]
pub struct FilterFault {
    pub filter: String,
    pub reason: String,
}

impl FilterFault {
    pub fn new(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

/// A pure transform over client-originated bytes.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, chunk: &[u8]) -> Result<Verdict, FilterFault>;
}

impl<F> Filter for F
where
    F: Fn(&[u8]) -> Result<Verdict, FilterFault> + Send + Sync,
{
    fn name(&self) -> &str {
        "closure"
    }

    fn apply(&self, chunk: &[u8]) -> Result<Verdict, FilterFault> {
        self(chunk)
    }
}

/// Returned by [`FilterChain::run`] when a filter asked for termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stopped {
    pub filter: String,
}

/// Result of running the whole chain over one chunk.
#[derive(Debug)]
pub struct ChainOutput<'a> {
    pub data: Cow<'a, [u8]>,
    /// Set when a filter faulted and the rest of the chain was skipped.
    pub fault: Option<FilterFault>,
}

/// Ordered list of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: impl Filter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    pub fn push_shared(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run every filter over `chunk`, in order.
    pub fn run<'a>(&self, chunk: &'a [u8]) -> Result<ChainOutput<'a>, Stopped> {
        let mut data = Cow::Borrowed(chunk);

        for filter in &self.filters {
            match filter.apply(&data) {
                Ok(Verdict::Pass) => {}
                Ok(Verdict::Replace(bytes)) => data = Cow::Owned(bytes),
                Ok(Verdict::Stop) => {
                    return Err(Stopped {
                        filter: filter.name().to_string(),
                    })
                }
                Err(fault) => return Ok(ChainOutput { data, fault: Some(fault) }),
            }
        }

        Ok(ChainOutput { data, fault: None })
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ── Stock filters ─────────────────────────────────────────────────────────────

/// Removes carriage returns (DOS → Unix line endings).
#[derive(Debug, Clone, Copy, Default)]
pub struct StripCarriageReturns;

impl Filter for StripCarriageReturns {
    fn name(&self) -> &str {
        "strip-cr"
    }

    fn apply(&self, chunk: &[u8]) -> Result<Verdict, FilterFault> {
        if !chunk.contains(&b'\r') {
            return Ok(Verdict::Pass);
        }
        Ok(Verdict::Replace(
            chunk.iter().copied().filter(|&b| b != b'\r').collect(),
        ))
    }
}

/// Ends the session when a short chunk is exactly one of the keywords.
///
/// Only chunks up to [`KeywordIntercept::MAX_LEN`] bytes are inspected, which
/// covers interactive command input. Matching ignores surrounding whitespace
/// and ASCII case.
#[derive(Debug, Clone)]
pub struct KeywordIntercept {
    keywords: Vec<String>,
}

impl KeywordIntercept {
    pub const MAX_LEN: usize = 10;

    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| {
                    let k: String = k.into();
                    k.trim().to_ascii_lowercase()
                })
                .collect(),
        }
    }
}

impl Default for KeywordIntercept {
    fn default() -> Self {
        Self::new(["quit", "exit"])
    }
}

impl Filter for KeywordIntercept {
    fn name(&self) -> &str {
        "keyword-intercept"
    }

    fn apply(&self, chunk: &[u8]) -> Result<Verdict, FilterFault> {
        if chunk.len() > Self::MAX_LEN {
            return Ok(Verdict::Pass);
        }
        let word = chunk.trim_ascii();
        if self
            .keywords
            .iter()
            .any(|k| word.eq_ignore_ascii_case(k.as_bytes()))
        {
            return Ok(Verdict::Stop);
        }
        Ok(Verdict::Pass)
    }
}

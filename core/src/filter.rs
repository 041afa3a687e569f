//! Per-group ingress filter programs.
//!
//! A filter is a boolean accept/reject over the raw captured bytes,
//! evaluated before the classifier chain. A failing filter discards the
//! frame for that group only; other groups still evaluate it independently.

use regex::bytes::RegexSet;

/// A boolean accept/reject program over raw frame bytes.
pub trait FilterProgram: Send + Sync {
    fn accept(&self, payload: &[u8]) -> bool;
}

impl<F> FilterProgram for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn accept(&self, payload: &[u8]) -> bool {
        self(payload)
    }
}

/// Pattern-set filter: accepts a frame when any pattern matches the
/// payload. The set compiles into a single DFA, so matching cost is
/// independent of the number of patterns.
pub struct RegexSetFilter {
    set: RegexSet,
}

impl RegexSetFilter {
    pub fn new<I, S>(patterns: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(RegexSetFilter {
            set: RegexSet::new(patterns)?,
        })
    }
}

impl FilterProgram for RegexSetFilter {
    fn accept(&self, payload: &[u8]) -> bool {
        self.set.is_match(payload)
    }
}

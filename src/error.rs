use thiserror::Error;

use crate::domain::ContentId;
use crate::source::SourceError;

/// Failures surfaced to the serving path.
///
/// A missing entry is not an error: `get` reports it as `Ok(None)` and the
/// caller decides the fallback (usually a 404). Store and transport faults
/// are absorbed while a previously published version exists; only a cold
/// lookup with nothing to fall back on propagates `Source`.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The read deadline expired before a cold fill completed. Distinct
    /// from "not published" so callers can answer 503 instead of 404.
    #[error("published-content read timed out for node {id}")]
    Timeout { id: ContentId },

    /// The content store failed and no previously published version of the
    /// requested entry exists.
    #[error(transparent)]
    Source(#[from] SourceError),
}

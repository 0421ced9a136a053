//! Error aggregation scope.
//!
//! Operations run through [`ErrorSentry::capture`] keep going when one of
//! them fails; each failure is reported on the `error_sentry` tracing target
//! with the scope's tags and a fresh event id, and kept for the caller.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use super::PipelineError;

/// Reports emitted per scope; later errors are still collected.
pub const REPORT_LIMIT: usize = 10;

/// One captured failure.
#[derive(Debug)]
pub struct CapturedError {
    pub event_id: Uuid,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct ErrorSentry {
    tags: BTreeMap<String, String>,
    captured: Vec<CapturedError>,
    reported: usize,
}

impl ErrorSentry {
    pub fn new<K, V>(tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            captured: Vec::new(),
            reported: 0,
        }
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Run `op`, recording its error if any. Returns the value on success.
    pub fn capture<T, F>(&mut self, op: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, PipelineError>,
    {
        match op() {
            Ok(value) => Some(value),
            Err(error) => {
                self.record(error);
                None
            }
        }
    }

    /// Record an error that was produced outside [`capture`](Self::capture).
    pub fn record(&mut self, error: PipelineError) {
        let event_id = Uuid::new_v4();
        if self.reported < REPORT_LIMIT {
            self.reported += 1;
            tracing::error!(
                target: "error_sentry",
                %event_id,
                tags = %TagList(&self.tags),
                kind = error.kind(),
                error = %error,
                "captured error"
            );
        } else if self.reported == REPORT_LIMIT {
            self.reported += 1;
            tracing::warn!(
                target: "error_sentry",
                tags = %TagList(&self.tags),
                "report limit reached, further errors are only counted"
            );
        }
        self.captured.push(CapturedError { event_id, error });
    }

    pub fn errors(&self) -> &[CapturedError] {
        &self.captured
    }

    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    /// `Ok` if nothing was captured, otherwise every error in capture order.
    pub fn into_result(self) -> Result<(), Vec<CapturedError>> {
        if self.captured.is_empty() {
            Ok(())
        } else {
            Err(self.captured)
        }
    }
}

struct TagList<'a>(&'a BTreeMap<String, String>);

impl fmt::Display for TagList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

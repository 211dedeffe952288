//! Error types shared by drivers, readers, writers and the pipeline engine.

use thiserror::Error;

/// Errors produced by the library.
#[derive(Debug, Error)]
pub enum Error {
    // ── Driver selection ─────────────────────────────────────────────────────
    /// No registered driver matches the descriptor.
    #[error("No driver can open '{descriptor}'")]
    NoDriverFound { descriptor: String },

    /// Descriptor could not be parsed into path / layer parts.
    #[error("Invalid descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    // ── Sources ──────────────────────────────────────────────────────────────
    /// The file or connection behind a descriptor does not exist.
    #[error("Source '{descriptor}' does not exist")]
    SourceNotFound { descriptor: String },

    /// A multi-layer source was opened without a layer and no default applies.
    #[error("Can't detect default layer in '{descriptor}'. Layers available are: {}", .available.join(", "))]
    AmbiguousLayer {
        descriptor: String,
        available: Vec<String>,
    },

    /// A record or field that could not be decoded.
    ///
    /// Readers log this and keep going; it only escapes when a whole batch is unusable.
    #[error("Malformed record in '{descriptor}' (record {index}): {reason}")]
    MalformedRecord {
        descriptor: String,
        index: u64,
        reason: String,
    },

    // ── Pipeline ─────────────────────────────────────────────────────────────
    /// A mapping or reducer stage returned an error.
    #[error("Stage '{stage}' failed: {cause:#}")]
    Stage { stage: String, cause: anyhow::Error },

    /// Engine plumbing failure (worker panic, queue closed unexpectedly).
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    // ── Wrapped ──────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Original error raised inside a stage, if this is a stage failure.
    pub fn stage_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Stage { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Whether the error is a recoverable per-record condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::MalformedRecord { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_layer_lists_options() {
        let err = Error::AmbiguousLayer {
            descriptor: "data.sqlite".to_string(),
            available: vec!["roads".to_string(), "rivers".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("data.sqlite"));
        assert!(msg.contains("roads, rivers"));
    }

    #[test]
    fn test_stage_cause_is_preserved() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom on batch {0}")]
        struct Boom(usize);

        let err = Error::Stage {
            stage: "explode".to_string(),
            cause: anyhow::Error::new(Boom(3)),
        };

        let cause = err.stage_cause().unwrap();
        assert_eq!(cause.downcast_ref::<Boom>().unwrap().0, 3);
        assert!(err.to_string().contains("boom on batch 3"));
    }

    #[test]
    fn test_recoverable() {
        let err = Error::MalformedRecord {
            descriptor: "a.csv".to_string(),
            index: 4,
            reason: "bad WKT".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(!Error::Pipeline("x".to_string()).is_recoverable());
    }
}

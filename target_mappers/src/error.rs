//! The mapper error taxonomy.

use thiserror::Error;

/// How many per-item messages are reported verbatim before the rest
/// collapse into a `+N more` summary.
const VERBATIM_MESSAGES: usize = 5;

/// Everything a mapper can fail with. The processor pattern-matches on
/// this to decide between retrying the batch, rejecting the record, and
/// killing the shard.
#[derive(Debug, Error)]
pub enum MapperError {
    /// Missing or invalid configuration, or a config-invariant violated
    /// at runtime. Fatal; never retried.
    #[error("invalid mapper configuration: {message}")]
    Config { message: String },

    /// A cell or metadata type the sink cannot handle. Fails the record
    /// and therefore the batch; the checkpoint does not advance.
    #[error("unsupported {kind} value for {context}")]
    UnsupportedType { kind: String, context: String },

    /// A transport failure that outlived its retry budget. The batch is
    /// retried from the next fetch.
    #[error("transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The transport accepted some items of a batch and rejected others.
    #[error("partial failure: {failed} of {total} items failed: {}", messages.join("; "))]
    PartialFailure {
        total: usize,
        failed: usize,
        messages: Vec<String>,
    },

    /// The transport rejected every item of a batch.
    #[error("total failure: all {total} items failed: {}", messages.join("; "))]
    TotalFailure { total: usize, messages: Vec<String> },

    /// Anything else; fatal to the shard.
    #[error("fatal mapper failure: {message}")]
    Fatal { message: String },
}

impl MapperError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn unsupported(kind: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnsupportedType {
            kind: kind.into(),
            context: context.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Builds the batch-granular error for `failed` of `total` items,
    /// with messages summarized past the verbatim budget.
    pub fn batch_failure(total: usize, failure_messages: Vec<String>) -> Self {
        let failed = failure_messages.len();
        let messages = summarize_messages(failure_messages);
        if failed >= total {
            Self::TotalFailure { total, messages }
        } else {
            Self::PartialFailure {
                total,
                failed,
                messages,
            }
        }
    }

    /// Whether the processor should retry the batch at the next fetch
    /// (as opposed to killing the shard).
    pub fn is_batch_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. }
                | Self::PartialFailure { .. }
                | Self::TotalFailure { .. }
                | Self::UnsupportedType { .. }
        )
    }
}

impl From<stream_config::ConfigError> for MapperError {
    fn from(e: stream_config::ConfigError) -> Self {
        Self::Config {
            message: e.to_string(),
        }
    }
}

/// First [`VERBATIM_MESSAGES`] messages verbatim, the remainder
/// summarized as `+N more`.
pub fn summarize_messages(mut messages: Vec<String>) -> Vec<String> {
    if messages.len() > VERBATIM_MESSAGES {
        let remainder = messages.len() - VERBATIM_MESSAGES;
        messages.truncate(VERBATIM_MESSAGES);
        messages.push(format!("+{remainder} more"));
    }
    messages
}

// ABOUTME: Error taxonomy for the exchange engine
// ABOUTME: Fatal errors abort a run; recoverable ones travel as events instead

use thiserror::Error;
use uuid::Uuid;

use super::row::MappingError;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that abort an exchange run.
///
/// Business-rule violations and unknown entity names never show up here: they
/// are reported through the event sink and the run carries on.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Reading from or writing to either store failed.
    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A source row could not be mapped onto its destination record.
    #[error("mapping error in {entity}{}", uid_suffix(.uid))]
    Mapping {
        entity: String,
        uid: Option<Uuid>,
        #[source]
        source: MappingError,
    },
}

impl ExchangeError {
    pub fn transport(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ExchangeError::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn mapping(entity: &str, uid: Option<Uuid>, source: MappingError) -> Self {
        ExchangeError::Mapping {
            entity: entity.to_string(),
            uid,
            source,
        }
    }
}

fn uid_suffix(uid: &Option<Uuid>) -> String {
    uid.map(|u| format!(" (uid {})", u)).unwrap_or_default()
}

/// Attach transport context to store results, in the manner of `anyhow::Context`.
pub trait TransportContext<T> {
    fn transport_context<F, C>(self, context: F) -> ExchangeResult<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> TransportContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn transport_context<F, C>(self, context: F) -> ExchangeResult<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| ExchangeError::transport(context(), e))
    }
}

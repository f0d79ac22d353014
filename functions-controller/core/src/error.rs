use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reconciliation error taxonomy.
///
/// Every variant is requeued with backoff; the distinction governs how the
/// failure is reported. A transient failure is expected to clear on its own,
/// while a configuration error or an ownership conflict requires an external
/// actor to fix the root cause -- which may itself arrive as a later update,
/// so there is no give-up-forever state.
#[derive(Debug, Error)]
pub enum Error {
    /// A remote API call failed or was rejected with a conflict.
    #[error("api request failed: {0}")]
    Transient(#[source] anyhow::Error),

    /// A required input is absent or mistyped.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A child resource is controlled by another owner and must not be
    /// mutated.
    #[error("{kind} {namespace}/{name} is not controlled by {owner}")]
    OwnerConflict {
        kind: &'static str,
        namespace: String,
        name: String,
        owner: String,
    },
}

impl Error {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

//! Correlation id propagation shared by outbound RPC calls and published messages.

use std::fmt;
use std::future::Future;

use uuid::Uuid;

/// Metadata key carrying the correlation id on RPC calls and broker messages.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

tokio::task_local! {
    static CURRENT: CorrelationId;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

/// Run `future` with `id` as the ambient correlation id.
///
/// Every RPC call made and every message published while the future runs
/// carries this id, unless the call sets one explicitly.
pub async fn with_correlation_id<F>(id: CorrelationId, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(id, future).await
}

/// The correlation id scoped by [`with_correlation_id`], if any.
pub fn current_correlation_id() -> Option<CorrelationId> {
    CURRENT.try_with(|id| id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_id_is_visible_inside_and_gone_outside() {
        assert!(current_correlation_id().is_none());

        let seen = with_correlation_id(CorrelationId::new("req-42"), async {
            current_correlation_id()
        })
        .await;

        assert_eq!(seen, Some(CorrelationId::new("req-42")));
        assert!(current_correlation_id().is_none());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}

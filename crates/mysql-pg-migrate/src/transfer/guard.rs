//! Resume-safety probe run before every transfer.
//!
//! A destination table that already holds a row is treated as fully loaded
//! by an earlier attempt. A probe that cannot answer is treated the same way,
//! trading a possibly skipped table for never loading a table twice.

use tracing::{info, warn};

use crate::core::traits::TargetSession;

/// Why a task was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyLoaded,
    ProbeFailed(String),
}

/// Outcome of the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    Skip(SkipReason),
}

impl GuardDecision {
    pub fn proceeds(&self) -> bool {
        matches!(self, GuardDecision::Proceed)
    }
}

/// Probe `schema.table` on the held session.
pub async fn check<T: TargetSession>(session: &mut T, schema: &str, table: &str) -> GuardDecision {
    match session.table_has_rows(schema, table).await {
        Ok(false) => GuardDecision::Proceed,
        Ok(true) => {
            info!("{}: destination already has rows, skipping", table);
            GuardDecision::Skip(SkipReason::AlreadyLoaded)
        }
        Err(e) => {
            warn!(
                "{}: existence probe failed, treating as already loaded: {}",
                table, e
            );
            GuardDecision::Skip(SkipReason::ProbeFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::TargetPool;
    use crate::testing::FakeTarget;

    #[tokio::test]
    async fn test_empty_table_proceeds() {
        let target = FakeTarget::new(1);
        let mut session = target.session().await.unwrap();
        assert!(check(&mut session, "public", "orders").await.proceeds());
    }

    #[tokio::test]
    async fn test_loaded_table_is_skipped() {
        let target = FakeTarget::new(1).with_rows("orders", 1);
        let mut session = target.session().await.unwrap();
        assert_eq!(
            check(&mut session, "public", "orders").await,
            GuardDecision::Skip(SkipReason::AlreadyLoaded)
        );
    }

    #[tokio::test]
    async fn test_probe_error_is_treated_as_loaded() {
        let target = FakeTarget::new(1);
        target.fail_probe_for("orders");
        let mut session = target.session().await.unwrap();
        let decision = check(&mut session, "public", "orders").await;
        assert!(matches!(
            decision,
            GuardDecision::Skip(SkipReason::ProbeFailed(_))
        ));
    }
}

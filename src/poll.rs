//! Pieces shared by the polling loops: the observer hook and best-effort
//! broadcast

use std::sync::Arc;

use crate::gateway::{BlockHeight, GatewayError, LedgerGateway};

/// One iteration of a polling loop, as reported to a [`PollObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollAttempt {
    /// 1-based iteration counter
    pub attempt: u64,
    /// Block height the iteration read at
    pub block: BlockHeight,
    /// Re-broadcasts issued so far
    pub rebroadcasts: u64,
}

/// Callback invoked once per poll iteration
pub type PollObserver = Arc<dyn Fn(&PollAttempt) + Send + Sync>;

/// Result of a broadcast whose failure is tolerated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Sent,
    /// The gateway refused or failed; the payload may still have landed
    Ignored(GatewayError),
}

impl BroadcastOutcome {
    /// Whether the gateway accepted the payload
    pub fn is_sent(&self) -> bool {
        matches!(self, BroadcastOutcome::Sent)
    }
}

/// Broadcast `payload`, downgrading any failure to [`BroadcastOutcome::Ignored`]
pub async fn broadcast_best_effort(gateway: &dyn LedgerGateway, payload: &[u8]) -> BroadcastOutcome {
    match gateway.broadcast(payload).await {
        Ok(()) => BroadcastOutcome::Sent,
        Err(e) => {
            tracing::warn!("Broadcast failed, relying on polling: {}", e);
            BroadcastOutcome::Ignored(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedGateway;

    #[tokio::test]
    async fn test_failure_is_ignored() {
        let gw = ScriptedGateway::new();
        gw.fail_broadcasts(1);
        let first = broadcast_best_effort(&gw, b"x").await;
        assert!(matches!(first, BroadcastOutcome::Ignored(GatewayError::Transport(_))));
        assert!(broadcast_best_effort(&gw, b"x").await.is_sent());
        assert_eq!(gw.broadcast_count(), 2);
    }
}

//! Active/passive replication target resolution
//!
//! A remote copy group (RCG) spans a local and a remote array. Before
//! exporting a replicated volume the orchestrator has to know which side
//! currently serves I/O. Both arrays are asked for their view of the group;
//! either may be unreachable.
//!
//! There is no external arbiter: a read of both sides can race with a
//! failover in flight. Ambiguous pairings surface as
//! `Error::StateInTransition` and are left to the caller to retry.

use crate::backend::mediator::ArrayMediator;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RcgRole {
    Primary,
    Secondary,
    PrimaryReversed,
}

/// One array's view of a remote copy group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcgState {
    pub role: RcgRole,
    pub role_reversed: bool,
}

impl RcgState {
    pub fn new(role: RcgRole, role_reversed: bool) -> Self {
        Self {
            role,
            role_reversed,
        }
    }

    fn is(&self, role: RcgRole, role_reversed: bool) -> bool {
        self.role == role && self.role_reversed == role_reversed
    }

    /// Whether this side alone can be trusted to be the active one
    fn claims_primary(&self) -> bool {
        matches!(self.role, RcgRole::Primary | RcgRole::PrimaryReversed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveArray {
    Local,
    Remote,
}

/// Name of the remote-side group paired with `local`
pub fn remote_rcg_name(local: &str) -> String {
    format!("{}.r", local)
}

/// Decide the active array from the two (possibly missing) views
pub fn resolve(
    rcg: &str,
    local: Option<RcgState>,
    remote: Option<RcgState>,
) -> Result<ActiveArray> {
    use RcgRole::*;

    match (local, remote) {
        (Some(l), Some(r)) => {
            if l.is(Primary, false) && r.is(Secondary, false) {
                Ok(ActiveArray::Local)
            } else if l.is(Primary, false) && r.is(PrimaryReversed, true) {
                // failover in progress or complete
                Ok(ActiveArray::Remote)
            } else if r.is(Primary, true) && l.is(Secondary, true) {
                // recovered with roles reversed
                Ok(ActiveArray::Remote)
            } else {
                Err(Error::StateInTransition(rcg.to_string()))
            }
        }
        (Some(l), None) if l.claims_primary() => Ok(ActiveArray::Local),
        (None, Some(r)) if r.claims_primary() => Ok(ActiveArray::Remote),
        _ => Err(Error::CannotDetermineActive(rcg.to_string())),
    }
}

/// Fetch one side's state; an unreachable array counts as no answer
async fn fetch_state(mediator: &dyn ArrayMediator, rcg: &str) -> Result<Option<RcgState>> {
    match mediator.get_rcg(rcg).await {
        Ok(state) => Ok(state),
        Err(Error::BackendUnavailable(reason)) => {
            tracing::warn!(
                "Array {} unreachable while resolving {}: {}",
                mediator.array_name(),
                rcg,
                reason
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Query both arrays and resolve which one is active
pub async fn resolve_active(
    local: &dyn ArrayMediator,
    remote: &dyn ArrayMediator,
    local_rcg: &str,
    remote_rcg: &str,
) -> Result<ActiveArray> {
    let (local_state, remote_state) = tokio::join!(
        fetch_state(local, local_rcg),
        fetch_state(remote, remote_rcg)
    );
    let active = resolve(local_rcg, local_state?, remote_state?)?;
    tracing::debug!("RCG {} active array: {:?}", local_rcg, active);
    Ok(active)
}

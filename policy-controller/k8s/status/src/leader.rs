use kubert::lease::Claim;
use std::sync::Arc;
use tokio::sync::watch;

/// Whether this replica may write to the cluster.
///
/// Without leader election every replica is the leader.
#[derive(Clone, Debug)]
pub struct Leadership {
    claims: Option<watch::Receiver<Arc<Claim>>>,
    name: String,
}

impl Leadership {
    pub fn elected(claims: watch::Receiver<Arc<Claim>>, name: impl ToString) -> Self {
        Self {
            claims: Some(claims),
            name: name.to_string(),
        }
    }

    pub fn always(name: impl ToString) -> Self {
        Self {
            claims: None,
            name: name.to_string(),
        }
    }

    pub fn is_leader(&self) -> bool {
        match &self.claims {
            Some(claims) => claims.borrow().is_current_for(&self.name),
            None => true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

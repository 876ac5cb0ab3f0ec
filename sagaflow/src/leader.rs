use std::sync::atomic::{AtomicBool, Ordering};

/// Answer to "may this replica sweep right now". Re-checked at the top of
/// every scanner pass, so leadership handed to another replica takes effect
/// within one interval. How leadership is decided (static config, lease,
/// external election) is the embedder's business.
pub trait LeaderGuard: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Guard backed by a flag the embedder flips. Single-replica deployments
/// construct it with `true` and never touch it again.
#[derive(Debug, Default)]
pub struct StaticLeader(AtomicBool);

impl StaticLeader {
    pub fn new(leader: bool) -> Self {
        Self(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

impl LeaderGuard for StaticLeader {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

//! Server drain: close sessions, stop background tasks, bound the wait.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

/// Outcome of one drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions closed by the drain.
    pub closed_sessions: usize,
    /// Tasks that finished inside the grace period.
    pub finished_tasks: usize,
    /// Tasks aborted once the grace period ran out.
    pub aborted_tasks: usize,
    /// Whether the grace period ran out first.
    pub timed_out: bool,
}

/// Owns the token every listener, the dispatch loop and the sweeper watch.
#[derive(Default)]
pub struct Drain {
    token: CancellationToken,
}

impl Drain {
    /// Fresh, not yet draining.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to each background task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once [`Drain::run`] has started.
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sessions first so clients see a close frame before listeners go away.
    pub async fn run(&self, registry: &ConnectionRegistry, handles: Vec<JoinHandle<()>>, grace: Duration) -> DrainReport {
        let sessions = registry.all();
        let closed_sessions = sessions.len();
        for connection in sessions {
            connection.close();
        }
        self.token.cancel();

        let total = handles.len();
        info!(sessions = closed_sessions, tasks = total, grace_ms = grace.as_millis(), "draining");
        let mut pending = handles;
        let joined = tokio::time::timeout(grace, async {
            while let Some(handle) = pending.last_mut() {
                let _ = handle.await;
                let _ = pending.pop();
            }
        })
        .await;
        if joined.is_ok() {
            return DrainReport {
                closed_sessions,
                finished_tasks: total,
                aborted_tasks: 0,
                timed_out: false,
            };
        }

        // Past the grace period nothing gets to keep running.
        let aborted_tasks = pending.iter().filter(|handle| !handle.is_finished()).count();
        for handle in &pending {
            handle.abort();
        }
        for handle in pending {
            let _ = handle.await;
        }
        let finished_tasks = total - aborted_tasks;
        warn!(?grace, aborted = aborted_tasks, "drain grace period elapsed, remaining tasks aborted");
        DrainReport {
            closed_sessions,
            finished_tasks,
            aborted_tasks,
            timed_out: true,
        }
    }
}

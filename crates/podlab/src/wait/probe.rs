use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use podlab_common::kube_utils::{poll_until, PollState, PollTimeout};

use super::{WaitTarget, DEFAULT_TIMEOUT};

/// Waits until the workload's ready-replica count equals its desired count
#[derive(Clone, Debug)]
pub struct ReadinessProbeWait {
    /// Deadline
    pub timeout: Duration,
    /// Interval between status reads
    pub poll_interval: Duration,
}

impl Default for ReadinessProbeWait {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ReadinessProbeWait {
    /// A workload that was seen and then vanished ends the wait early;
    /// one that has not shown up yet is still pending.
    pub(super) async fn wait(
        &self,
        target: &dyn WaitTarget,
        timeout: Duration,
    ) -> Result<Duration, PollTimeout> {
        let seen = AtomicBool::new(false);

        poll_until(timeout, self.poll_interval, || {
            let seen = &seen;
            async move {
                match target.replica_status().await? {
                    None if seen.load(Ordering::SeqCst) => {
                        Ok(PollState::Gone("workload was deleted".to_string()))
                    }
                    None => Ok(PollState::Pending("workload not found yet".to_string())),
                    Some(status) => {
                        seen.store(true, Ordering::SeqCst);
                        if status.is_ready() {
                            Ok(PollState::Ready)
                        } else {
                            Ok(PollState::Pending(status.to_string()))
                        }
                    }
                }
            }
        })
        .await
    }
}

use std::time::Duration;

use regex::{Regex, RegexBuilder};

use podlab_common::kube_utils::{poll_until, PollState, PollTimeout};
use podlab_common::Error;

use super::WaitTarget;

const LOG_TAIL_CHARS: usize = 500;

/// Waits until the workload's logs match a pattern enough times
#[derive(Clone, Debug)]
pub struct LogMessageWait {
    /// Multi-line pattern
    pub pattern: Regex,
    /// Required number of matches
    pub times: usize,
    /// Deadline
    pub timeout: Duration,
    /// Interval between log reads
    pub poll_interval: Duration,
}

impl LogMessageWait {
    /// Match `pattern` once; `^` and `$` anchor at line boundaries
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let pattern = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|e| Error::validation_for_field("log_pattern", e.to_string()))?;
        Ok(Self {
            pattern,
            times: 1,
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        })
    }

    /// Require `times` matches (at least one)
    pub fn times(mut self, times: usize) -> Self {
        self.times = times.max(1);
        self
    }

    pub(super) async fn wait(
        &self,
        target: &dyn WaitTarget,
        timeout: Duration,
    ) -> Result<Duration, PollTimeout> {
        poll_until(timeout, self.poll_interval, || async {
            let Some(logs) = target.logs().await? else {
                return Ok(PollState::Pending("no logs yet".to_string()));
            };
            let matches = self.pattern.find_iter(&logs).count();
            if matches >= self.times {
                Ok(PollState::Ready)
            } else {
                Ok(PollState::Pending(format!(
                    "matched {} of {} times; log tail: {}",
                    matches,
                    self.times,
                    tail(&logs, LOG_TAIL_CHARS)
                )))
            }
        })
        .await
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

use std::time::Duration;

use podlab_common::kube_utils::{poll_until, PollState, PollTimeout};
use podlab_common::Error;

use super::{WaitTarget, DEFAULT_TIMEOUT};
use crate::cluster::ExecCommand;

const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Waits until a command run inside the workload exits zero
#[derive(Clone, Debug)]
pub struct CommandWait {
    /// What to run
    pub command: ExecCommand,
    /// Deadline
    pub timeout: Duration,
    /// Interval between runs
    pub poll_interval: Duration,
}

impl CommandWait {
    /// Run `command` in the workload's default container
    pub fn new<I, S>(command: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = ExecCommand::new(command);
        if command.command.is_empty() {
            return Err(Error::validation_for_field("command", "command must not be empty"));
        }
        Ok(Self {
            command,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_millis(500),
        })
    }

    /// Run in `container` instead
    pub fn in_container(mut self, container: impl Into<String>) -> Self {
        self.command = self.command.in_container(container);
        self
    }

    pub(super) async fn wait(
        &self,
        target: &dyn WaitTarget,
        timeout: Duration,
    ) -> Result<Duration, PollTimeout> {
        poll_until(timeout, self.poll_interval, || async {
            // The pod may not accept exec yet; keep trying until the deadline
            let result = match target.exec(&self.command).await {
                Ok(result) => result,
                Err(e) => return Ok(PollState::Pending(format!("exec failed: {}", e))),
            };
            if result.is_success() {
                return Ok(PollState::Ready);
            }
            let mut state = format!("exit code {}", result.exit_code);
            if !result.stderr.is_empty() {
                state.push_str(&format!("; stderr: {}", preview(&result.stderr)));
            }
            if !result.stdout.is_empty() {
                state.push_str(&format!("; stdout: {}", preview(&result.stdout)));
            }
            Ok(PollState::Pending(state))
        })
        .await
    }
}

fn preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= OUTPUT_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::super::tests::FakeTarget;
    use super::super::WaitStrategy;
    use super::*;
    use crate::cluster::ExecResult;

    fn failed(code: i32, stderr: &str) -> ExecResult {
        ExecResult {
            exit_code: code,
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ready_once_the_command_succeeds() {
        let target = FakeTarget::with_statuses(vec![]);
        *target.exec_results.lock().unwrap() =
            vec![failed(2, "no response"), failed(2, "no response"), ExecResult::default()];

        let strategy = WaitStrategy::command(["pg_isready", "-U", "postgres"])
            .unwrap()
            .with_timeout(Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(5));
        assert!(strategy.wait_until_ready(&target).await.is_ok());

        let ran = target.executed.lock().unwrap();
        assert_eq!(ran.len(), 3);
        assert_eq!(ran[0].display(), "pg_isready -U postgres");
    }

    #[tokio::test]
    async fn timeout_reports_the_last_exit_code_and_output() {
        let target = FakeTarget::with_statuses(vec![]);
        *target.exec_results.lock().unwrap() = vec![failed(1, "redis not loaded\n")];

        let strategy = WaitStrategy::command(["redis-cli", "ping"])
            .unwrap()
            .with_timeout(Duration::from_millis(30))
            .with_poll_interval(Duration::from_millis(5));
        let err = strategy.wait_until_ready(&target).await.unwrap_err();
        assert_eq!(err.last_state, "exit code 1; stderr: redis not loaded");
        assert_eq!(err.strategy, "command 'redis-cli ping'");
    }

    #[tokio::test]
    async fn exec_errors_keep_polling() {
        // No scripted results: the fake reports that exec is unavailable
        let target = FakeTarget::with_statuses(vec![]);
        let strategy = WaitStrategy::command(["true"])
            .unwrap()
            .with_timeout(Duration::from_millis(30))
            .with_poll_interval(Duration::from_millis(5));
        let err = strategy.wait_until_ready(&target).await.unwrap_err();
        assert!(err.last_state.starts_with("exec failed:"), "{}", err.last_state);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandWait::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn long_output_is_cut() {
        let long = "x".repeat(300);
        let cut = preview(&long);
        assert_eq!(cut.chars().count(), OUTPUT_PREVIEW_CHARS + 3);
        assert!(cut.ends_with("..."));
    }
}

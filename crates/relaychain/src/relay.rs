//! Top level: open both address chains and relay between them once.

use crate::config::{DirectionMode, RelayConfig};
use crate::direction::Direction;
use crate::driver::DriverEnv;
use crate::engine::{SessionSummary, TransferSession};
use crate::error::RelayError;
use crate::opener::ChainOpener;
use crate::reaper::ReaperHandle;
use crate::shutdown;

#[derive(Debug, Clone)]
pub struct Relay {
    opener: ChainOpener,
    config: RelayConfig,
}

impl Relay {
    /// Child-process addresses need a `reaper`; everything else works without.
    pub fn new(config: RelayConfig, reaper: Option<ReaperHandle>) -> Self {
        let opener = ChainOpener::new(DriverEnv {
            reaper,
            config: config.clone(),
        });
        Self { opener, config }
    }

    /// Direction the first address is opened with.
    pub fn first_direction(&self) -> Direction {
        match self.config.direction {
            DirectionMode::Bidirectional => Direction::ReadWrite,
            DirectionMode::LeftToRight => Direction::Read,
            DirectionMode::RightToLeft => Direction::Write,
        }
    }

    /// Open `first`, then `second` to complement it, and relay until done.
    pub fn run(&self, first: &str, second: &str) -> Result<SessionSummary, RelayError> {
        let mut a = self
            .opener
            .open_chain(first, self.first_direction())
            .map_err(|source| RelayError::Open { index: 1, source })?;

        let b = match self.opener.open_chain(second, a.direction().reverse()) {
            Ok(b) => b,
            Err(source) => {
                shutdown::close(&mut a);
                return Err(RelayError::Open { index: 2, source });
            }
        };

        Ok(TransferSession::new(a, b, &self.config).run()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Outcome;
    use crate::reaper;
    use std::time::Duration;

    fn config() -> RelayConfig {
        RelayConfig::default().with_close_wait(Duration::from_millis(200))
    }

    #[test]
    fn copies_file_to_file_unidirectionally() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        let dst = dir.path().join("out");
        std::fs::write(&src, "hello").unwrap();

        let relay = Relay::new(config().with_direction(DirectionMode::LeftToRight), None);
        let summary = relay
            .run(&format!("OPEN:{}", src.display()), &format!("CREATE:{}", dst.display()))
            .unwrap();

        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(summary.bytes_a_to_b, 5);
        assert!(!summary.io_error);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hello");
    }

    #[test]
    fn reverse_mode_opens_first_write_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        let dst = dir.path().join("out");
        std::fs::write(&src, "back").unwrap();

        let relay = Relay::new(config().with_direction(DirectionMode::RightToLeft), None);
        assert_eq!(relay.first_direction(), Direction::Write);
        let summary = relay
            .run(&format!("CREATE:{}", dst.display()), &format!("OPEN:{}", src.display()))
            .unwrap();
        assert_eq!(summary.bytes_b_to_a, 4);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "back");
    }

    #[test]
    fn failed_second_address_reports_its_index() {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(config(), None);
        let missing = dir.path().join("missing");
        let err = relay
            .run("PIPE", &format!("OPEN:{}", missing.display()))
            .unwrap_err();
        assert!(matches!(err, RelayError::Open { index: 2, .. }), "{err}");
    }

    #[test]
    fn unknown_keyword_fails_before_anything_opens() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never");
        let relay = Relay::new(config(), None);
        let err = relay
            .run("BOGUS:x junk", &format!("CREATE:{}", out.display()))
            .unwrap_err();
        match err {
            RelayError::Open { index: 1, source } => assert!(!source.is_retryable()),
            other => panic!("unexpected error {other}"),
        }
        assert!(!out.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_output_is_drained_after_exit() {
        let (reaper, _task) = reaper::spawn();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        let second = format!("CREATE:{}", dst.display());

        let relay = Relay::new(config().with_direction(DirectionMode::LeftToRight), Some(reaper));
        let summary = tokio::task::spawn_blocking(move || relay.run("SYSTEM:printf 0123456789", &second))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(summary.bytes_a_to_b, 10);
        assert_eq!(summary.final_eof[0], crate::endpoint::EOF_ENDED);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "0123456789");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exec_through_a_chain_hop() {
        let (reaper, _task) = reaper::spawn();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        let second = format!("CREATE:{}", dst.display());

        let relay = Relay::new(config().with_direction(DirectionMode::LeftToRight), Some(reaper));
        let summary = tokio::task::spawn_blocking(move || relay.run("TEST|SYSTEM:echo hi", &second))
            .await
            .unwrap()
            .unwrap();

        assert!(!summary.io_error);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hi\n");
    }
}

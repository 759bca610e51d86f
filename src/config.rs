//! Tail configuration.

use std::io::SeekFrom;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ratelimiter::LeakyBucket;

/// Default stat period for the polling watcher.
pub const POLL_DURATION: Duration = Duration::from_millis(250);

/// Options controlling how a file is tailed.
///
/// The defaults read an existing file from the start, once, with no line
/// size cap.
#[derive(Clone, Debug)]
pub struct Config {
    /// Where to begin reading on the first open. `None` reads from the start
    /// of the file; pass `SeekFrom::End(0)` to only see new data.
    pub location: Option<SeekFrom>,

    /// On rotation, wait for a new file under the same name and keep going.
    /// Requires `follow`.
    pub re_open: bool,

    /// Fail construction if the file is absent.
    pub must_exist: bool,

    /// Use the polling watcher instead of kernel notifications.
    pub poll: bool,

    /// Stat period for the polling watcher.
    pub poll_interval: Duration,

    /// The target is a non-seekable stream; disables seeking and rotation
    /// handling, and EOF is terminal.
    pub pipe: bool,

    /// Keep reading after EOF, waiting for new data.
    pub follow: bool,

    /// Longest record emitted in one piece, in bytes; 0 disables the cap.
    /// Longer lines are emitted as consecutive fragments.
    pub max_line_size: usize,

    /// Only emit lines that were newline-terminated when read; partial data
    /// is held back until its newline arrives or the file rotates.
    pub complete_lines: bool,

    /// Per-record rate limiter; one unit is poured per emitted record.
    pub rate_limiter: Option<LeakyBucket>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            location: None,
            re_open: false,
            must_exist: false,
            poll: false,
            poll_interval: POLL_DURATION,
            pipe: false,
            follow: false,
            max_line_size: 0,
            complete_lines: false,
            rate_limiter: None,
        }
    }
}

impl Config {
    /// Rejects option combinations the engine cannot honor.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.re_open && !self.follow {
            return Err(Error::Config("re_open requires follow".into()));
        }

        if self.pipe {
            match self.location {
                None | Some(SeekFrom::Start(0)) => {}
                _ => return Err(Error::Config("cannot seek within a pipe".into())),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_re_open_without_follow() {
        let config = Config {
            re_open: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn accepts_re_open_with_follow() {
        let config = Config {
            re_open: true,
            follow: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_seek_on_pipe() {
        let config = Config {
            pipe: true,
            location: Some(SeekFrom::End(0)),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            pipe: true,
            location: Some(SeekFrom::Start(0)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}

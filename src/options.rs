//! Tunables of the flashing and restore flows.
//!
//! Both option sets derive [`clap::Args`] so a command line front end can
//! flatten them; [`Default`] gives the timings real hardware needs.

use std::num::ParseIntError;
use std::time::Duration;

use crate::serial::DEFAULT_BAUD_RATE;

/// Parse a number of milliseconds.
pub fn parse_millis(value: &str) -> Result<Duration, ParseIntError> {
    value.parse().map(Duration::from_millis)
}

/// Timing and retry policy of [`Flasher`](crate::flasher::Flasher).
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct FlashOptions {
    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    /// Polls made while waiting for the DFU device or the serial port
    #[arg(long, default_value_t = 10)]
    pub poll_attempts: u32,

    /// Milliseconds between polls
    #[arg(long = "poll-interval-ms", value_parser = parse_millis, default_value = "1000")]
    pub poll_interval: Duration,

    /// Milliseconds between entering CLI mode and requesting the bootloader
    #[arg(long = "settle-ms", value_parser = parse_millis, default_value = "400")]
    pub settle_delay: Duration,

    /// Milliseconds to wait for each MSP response
    #[arg(long = "request-timeout-ms", value_parser = parse_millis, default_value = "2000")]
    pub request_timeout: Duration,

    /// Milliseconds to wait for the custom-defaults reset acknowledgement
    #[arg(long = "ack-timeout-ms", value_parser = parse_millis, default_value = "1000")]
    pub ack_timeout: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            poll_attempts: 10,
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_millis(400),
            request_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(1),
        }
    }
}

/// Timing of [`restore_backup`](crate::backup::restore_backup).
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct RestoreOptions {
    /// Milliseconds between entering CLI mode and the first command
    #[arg(id = "restore_settle_delay", long = "restore-settle-ms", value_parser = parse_millis, default_value = "400")]
    pub settle_delay: Duration,

    /// Milliseconds between backup lines
    #[arg(long = "line-delay-ms", value_parser = parse_millis, default_value = "10")]
    pub line_delay: Duration,

    /// Milliseconds to wait before sending `save`
    #[arg(long = "pre-save-ms", value_parser = parse_millis, default_value = "1000")]
    pub pre_save_delay: Duration,

    /// Milliseconds to collect the response to `save`
    #[arg(long = "save-window-ms", value_parser = parse_millis, default_value = "500")]
    pub save_window: Duration,

    /// Milliseconds to wait before retrying a failed `save`
    #[arg(long = "save-retry-ms", value_parser = parse_millis, default_value = "1000")]
    pub save_retry_delay: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(400),
            line_delay: Duration::from_millis(10),
            pre_save_delay: Duration::from_secs(1),
            save_window: Duration::from_millis(500),
            save_retry_delay: Duration::from_secs(1),
        }
    }
}

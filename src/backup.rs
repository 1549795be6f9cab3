//! # Restore a configuration backup over the CLI
//!
//! A backup is the text produced by the firmware's `diff` or `dump`
//! commands: one CLI command per line, with `#` comment lines. Restoring
//! replays every command line and finishes with `save`, which reboots the
//! device.

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::flasher::{ENTER_CLI, poll_until};
use crate::msplink::MspLink;
use crate::options::{FlashOptions, RestoreOptions};
use crate::serial::SerialPorts;

/// Command persisting the configuration.
pub const SAVE: &[u8] = b"save\n";
/// Marker the CLI prints on a failed command.
pub const ERROR_MARKER: &str = "ERROR";

/// What a restore did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Command lines written.
    pub lines_sent: usize,
    /// Non-empty device output, in order.
    pub responses: Vec<String>,
    /// Whether `save` had to be sent twice.
    pub save_retried: bool,
}

/// Command lines of a backup: blank lines and `#` comments dropped.
pub fn backup_commands(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Replay `backup` on the device at `port`
///
/// Waits for the port like the flashing session does, enters CLI mode, sends
/// each command line, then `save`. When the output collected after `save`
/// contains [`ERROR_MARKER`], `save` is sent once more.
///
/// # Arguments
///
/// * `ports` - Serial collaborator
/// * `port` - Name of the device's serial port
/// * `backup` - Backup text
/// * `flash` - Baud rate and port polling policy
/// * `options` - Restore timings
pub async fn restore_backup<S: SerialPorts>(
    ports: &S,
    port: &str,
    backup: &str,
    flash: &FlashOptions,
    options: &RestoreOptions,
) -> anyhow::Result<RestoreReport> {
    let what = format!("serial port {port}");
    poll_until(&what, flash.poll_attempts, flash.poll_interval, || ports.is_present(port)).await?;

    let stream = ports.open(port, flash.baud_rate).with_context(|| format!("open {port}"))?;
    let mut link = MspLink::new(stream);
    let mut report = RestoreReport::default();

    link.send_raw(ENTER_CLI).await?;
    tokio::time::sleep(options.settle_delay).await;

    for line in backup_commands(backup) {
        link.send_raw(format!("{line}\n").as_bytes()).await?;
        report.lines_sent += 1;
        let response = drain(&mut link, options.line_delay).await?;
        record(&mut report, response);
    }

    tokio::time::sleep(options.pre_save_delay).await;
    link.send_raw(SAVE).await?;
    let response = drain(&mut link, options.save_window).await?;
    let failed = response.contains(ERROR_MARKER);
    record(&mut report, response);

    if failed {
        tracing::warn!("save reported an error, retrying");
        tokio::time::sleep(options.save_retry_delay).await;
        link.send_raw(SAVE).await?;
        report.save_retried = true;
        let response = drain(&mut link, options.save_window).await?;
        record(&mut report, response);
    }

    tracing::info!(lines = report.lines_sent, "restore backup done");
    Ok(report)
}

fn record(report: &mut RestoreReport, response: String) {
    if !response.trim().is_empty() {
        tracing::info!("{}", response.trim_end());
        report.responses.push(response);
    }
}

// Collect whatever the device prints within `window`.
async fn drain<T>(link: &mut MspLink<T>, window: Duration) -> std::io::Result<String>
where
    T: AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let port = link.get_mut();
    let deadline = tokio::time::Instant::now() + window;
    let mut collected = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match tokio::time::timeout_at(deadline, port.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    struct OnePort {
        stream: Mutex<VecDeque<DuplexStream>>,
    }

    impl SerialPorts for OnePort {
        type Port = DuplexStream;

        fn available(&self) -> crate::error::Result<Vec<String>> {
            Ok(vec!["ttyACM0".into()])
        }

        fn open(&self, _name: &str, _baud_rate: u32) -> crate::error::Result<DuplexStream> {
            Ok(self.stream.lock().unwrap().pop_front().expect("opened twice"))
        }
    }

    fn fast() -> (FlashOptions, RestoreOptions) {
        let flash = FlashOptions { poll_attempts: 1, ..FlashOptions::default() };
        let restore = RestoreOptions {
            settle_delay: Duration::from_millis(1),
            line_delay: Duration::from_millis(5),
            pre_save_delay: Duration::from_millis(1),
            save_window: Duration::from_millis(30),
            save_retry_delay: Duration::from_millis(1),
        };
        (flash, restore)
    }

    const BACKUP: &str = "# diff all\n\n# version\nset gyro_lpf1_static_hz = 0\r\nfeature -AIRMODE\n\nsave\n";

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let commands: Vec<_> = backup_commands(BACKUP).collect();
        assert_eq!(commands, ["set gyro_lpf1_static_hz = 0", "feature -AIRMODE", "save"]);
    }

    #[tokio::test]
    async fn restore_sends_cli_entry_lines_and_save() {
        let (host, mut device) = duplex(1024);
        let ports = OnePort { stream: Mutex::new(VecDeque::from([host])) };
        let (flash, restore) = fast();

        let report = restore_backup(&ports, "ttyACM0", "# c\nset a = 1\nset b = 2\n", &flash, &restore)
            .await
            .unwrap();
        drop(ports);

        let mut sent = String::new();
        device.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "#\nset a = 1\nset b = 2\nsave\n");
        assert_eq!(report.lines_sent, 2);
        assert!(!report.save_retried);
        assert!(report.responses.is_empty());
    }

    #[tokio::test]
    async fn failed_save_is_retried_once() {
        let (host, mut device) = duplex(1024);
        let ports = OnePort { stream: Mutex::new(VecDeque::from([host])) };
        let (flash, restore) = fast();

        let fake = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 64];
            let mut answered = false;
            loop {
                let n = device.read(&mut buf).await.unwrap();
                if n == 0 {
                    return String::from_utf8(seen).unwrap();
                }
                seen.extend_from_slice(&buf[..n]);
                if !answered && seen.ends_with(SAVE) {
                    answered = true;
                    device.write_all(b"ERROR: EEPROM busy\r\n").await.unwrap();
                }
            }
        });

        let report = restore_backup(&ports, "ttyACM0", "set a = 1\n", &flash, &restore).await.unwrap();
        drop(ports);

        assert!(report.save_retried);
        assert_eq!(report.responses, ["ERROR: EEPROM busy\r\n"]);
        assert_eq!(fake.await.unwrap(), "#\nset a = 1\nsave\nsave\n");
    }

    #[tokio::test]
    async fn missing_port_is_device_absent() {
        let ports = OnePort { stream: Mutex::new(VecDeque::new()) };
        let (flash, restore) = fast();
        let err = restore_backup(&ports, "ttyUSB9", "set a = 1\n", &flash, &restore).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::Error>(),
            Some(crate::error::Error::DeviceAbsent { .. })
        ));
    }
}

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use bfflash::backup::restore_backup;
use bfflash::build_info::{BuildInfoCache, BuildMetadataSource, HexFileName, JsonDirSource, stable_releases};
use bfflash::flasher::{DefaultsOutcome, FlashOutcome};
use bfflash::serial::SerialPorts;
use bfflash::{Error, FirmwareImage, FlashOptions, Flasher, MspLink, RestoreOptions, SystemSerialPorts, UsbDfu};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

/// Command line Betaflight flasher
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Intel HEX firmware file
    #[arg(short = 'f', long)]
    hex: Option<PathBuf>,

    /// Configuration backup to restore after flashing
    #[arg(short = 'c', long)]
    cfg: Option<PathBuf>,

    /// Serial port of the flight controller, asked for when missing
    #[arg(short, long)]
    port: Option<String>,

    /// Firmware target, e.g. SPEEDYBEEF7V3
    #[arg(short, long)]
    target: Option<String>,

    /// Firmware release, e.g. 4.5.1
    #[arg(short, long)]
    release: Option<String>,

    /// Directory holding build metadata (targets/ and builds/)
    #[arg(long, default_value = "metadata")]
    metadata_dir: PathBuf,

    /// Build metadata cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[command(flatten)]
    flash: FlashOptions,

    #[command(flatten)]
    restore: RestoreOptions,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(Error::DeviceAbsent { what, .. }) = e.downcast_ref::<Error>() {
                eprintln!("ERROR not found {what}");
            } else {
                eprintln!("ERROR: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let ports = SystemSerialPorts;
    let mut port = args.port.clone();

    if let Some(hex) = &args.hex {
        if !hex.is_file() {
            bail!("file not found: {}", hex.display());
        }
        let port_name = match port.take() {
            Some(p) => p,
            None => select_port(&ports)?,
        };
        flash(&args, hex, &port_name).await?;
        port = Some(port_name);
    }

    if let Some(cfg) = &args.cfg {
        let backup = std::fs::read_to_string(cfg).with_context(|| format!("read {}", cfg.display()))?;
        let port_name = match port {
            Some(p) => p,
            None => select_port(&ports)?,
        };
        let spinner = spinner("Restoring backup…");
        let report = restore_backup(&ports, &port_name, &backup, &args.flash, &args.restore).await;
        spinner.finish_and_clear();
        let report = report?;
        println!("--------------------");
        println!("Restore backup done! {} lines", report.lines_sent);
    }

    Ok(())
}

async fn flash(args: &Args, hex: &Path, port: &str) -> anyhow::Result<()> {
    let name = HexFileName::parse(hex);
    let source = JsonDirSource::new(&args.metadata_dir);

    let target = match name.target.or_else(|| args.target.clone()) {
        Some(t) => t,
        None => detect_target(port, &args.flash).await?,
    };
    let release = match name.release.or_else(|| args.release.clone()) {
        Some(r) => r,
        None => select_release(&source, &target)?,
    };

    let cache_dir = args.cache_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("bf_flash"));
    let build_info = BuildInfoCache::new(cache_dir)
        .get_or_fetch(&source, &target, &release)
        .with_context(|| format!("impossible to get information about target: {target} {release}"))?;

    let image = FirmwareImage::load(hex)?;
    let mut flasher = Flasher::new(UsbDfu::new(), SystemSerialPorts, port, args.flash.clone());

    let spinner = spinner("Flashing…");
    let report = flasher.run(image, &build_info).await;
    spinner.finish_and_clear();
    let report = report?;

    match &report.flash {
        FlashOutcome::Flashed => println!("Flash done!"),
        FlashOutcome::Failed(e) => eprintln!("ERROR flash failed: {e}"),
    }
    let device = &report.device;
    println!(
        "{} / {} / {} / {}",
        device.target_name, device.board_name, device.flight_controller_version, device.build_info
    );
    match report.defaults {
        DefaultsOutcome::Applied { .. } => println!("Set defaults done!"),
        DefaultsOutcome::NotSupported => println!("Custom defaults not supported!"),
    }
    Ok(())
}

async fn detect_target(port: &str, options: &FlashOptions) -> anyhow::Result<String> {
    let stream = SystemSerialPorts.open(port, options.baud_rate)?;
    let mut link = MspLink::new(stream);
    let board = link.detect_board_name(options.request_timeout).await.context("detecting target")?;
    if board.is_empty() {
        bail!("target is not specified");
    }
    Ok(board)
}

fn spinner(message: &'static str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn prompt(question: &str) -> anyhow::Result<String> {
    print!("{question}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn select_port(ports: &SystemSerialPorts) -> anyhow::Result<String> {
    loop {
        let names = ports.available()?;
        for (i, name) in names.iter().enumerate() {
            println!("{} - {}", i + 1, name);
        }
        let answer = prompt("Select port or (R) for refresh: ")?;
        if answer.eq_ignore_ascii_case("r") {
            continue;
        }
        return answer
            .parse::<usize>()
            .ok()
            .and_then(|n| names.get(n.checked_sub(1)?).cloned())
            .context("serial port is not specified");
    }
}

fn select_release(source: &impl BuildMetadataSource, target: &str) -> anyhow::Result<String> {
    let releases = stable_releases(&source.releases(target).with_context(|| format!("load releases for target: {target}"))?);
    if releases.is_empty() {
        bail!("no stable releases for target: {target}");
    }
    for (i, release) in releases.iter().enumerate() {
        println!("{} - {}", i + 1, release.release);
    }
    let answer = prompt("Select release: ")?;
    answer
        .parse::<usize>()
        .ok()
        .and_then(|n| releases.get(n.checked_sub(1)?))
        .map(|r| r.release.clone())
        .with_context(|| format!("release for target {target} is not selected"))
}

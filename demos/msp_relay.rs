// Relay bytes between two serial ports, capturing each direction to a file
// Used to record the MSP traffic between a configurator and a flight controller

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bfflash::serial::{DEFAULT_BAUD_RATE, SerialPorts};
use bfflash::SystemSerialPorts;
use clap::Parser;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

/// Bidirectional serial relay with capture
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Port of the configurator side
    #[arg(long, default_value = "/dev/ttyAMA0")]
    src: String,

    /// Port of the flight controller
    #[arg(long, default_value = "/dev/ttyACM0")]
    dst: String,

    /// Baud rate of both ports
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// Directory receiving src2dst.dat and dst2src.dat
    #[arg(long, default_value = ".")]
    capture_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let ports = SystemSerialPorts;
    let (src_rx, src_tx) = tokio::io::split(ports.open(&args.src, args.baud_rate)?);
    let (dst_rx, dst_tx) = tokio::io::split(ports.open(&args.dst, args.baud_rate)?);

    let running = Arc::new(AtomicBool::new(true));
    let forward = tokio::spawn(relay(
        "src2dst",
        src_rx,
        dst_tx,
        File::create(args.capture_dir.join("src2dst.dat")).await?,
        running.clone(),
    ));
    let backward = tokio::spawn(relay(
        "dst2src",
        dst_rx,
        src_tx,
        File::create(args.capture_dir.join("dst2src.dat")).await?,
        running.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            running.store(false, Ordering::Relaxed);
        }
        _ = backward => {}
    }
    // Shutdown: the forward task may be blocked reading a silent port.
    forward.abort();
    Ok(())
}

async fn relay<R, W>(name: &'static str, mut from: R, mut to: W, mut capture: File, running: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while running.load(Ordering::Relaxed) {
        let result = async {
            let byte = from.read_u8().await?;
            to.write_all(&[byte]).await?;
            capture.write_all(&[byte]).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::error!(direction = name, error = %e, "relay stopped");
            running.store(false, Ordering::Relaxed);
        }
    }
    let _ = capture.sync_all().await;
}

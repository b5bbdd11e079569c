use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::ProgressBar;
use tracing::{error, info, warn};

use nrf_legacy_dfu::init_packet::InitPacket;
use nrf_legacy_dfu::transport_btleplug::DfuTransportBtleplug;
use nrf_legacy_dfu::{dfu_run, CancelToken, DfuConfig, DfuError, FirmwareImage, UpdateSource};

/// Update firmware on nRF51 legacy BLE DFU targets
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Send an application image to a DFU target
    Update(UpdateArgs),
    /// Generate an init packet (.dat) for a binary image
    GenDat {
        /// Application image (.bin or .hex)
        image: PathBuf,
        /// Output init packet path
        dat: PathBuf,
    },
}

#[derive(clap::Args)]
struct UpdateArgs {
    /// DFU target address, or its advertised name
    #[arg(short, long)]
    address: String,

    /// Application image (.bin or .hex)
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Init packet (.dat)
    #[arg(short, long)]
    dat: Option<PathBuf>,

    /// Distribution archive holding image and init packet
    #[arg(short, long)]
    zip: Option<PathBuf>,

    /// Bytes per data packet
    #[arg(long, default_value_t = 20)]
    payload_size: usize,

    /// Packets between receipt notifications
    #[arg(long, default_value_t = 10)]
    receipt_interval: u16,

    /// Seconds to wait for a notification
    #[arg(long, default_value_t = 30)]
    notify_timeout: u64,

    /// Seconds to scan for and connect to the target
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds to wait for a write response
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,

    /// Milliseconds between validation and activation
    #[arg(long, default_value_t = 1000)]
    settle_delay: u64,

    /// Reset the target if the update fails
    #[arg(long)]
    reset_on_error: bool,
}

impl UpdateArgs {
    fn config(&self) -> DfuConfig {
        DfuConfig {
            payload_size: self.payload_size,
            receipt_interval: self.receipt_interval,
            notify_timeout: Duration::from_secs(self.notify_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            write_timeout: Duration::from_secs(self.write_timeout),
            settle_delay: Duration::from_millis(self.settle_delay),
            reset_on_error: self.reset_on_error,
        }
    }
}

async fn update(args: UpdateArgs) -> ExitCode {
    let config = args.config();
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::from(2);
    }
    // all local input is read before the target is touched
    let loaded = UpdateSource::from_args(args.file, args.dat, args.zip).and_then(|source| source.load());
    let (image, descriptor) = match loaded {
        Ok(files) => files,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let transport = match DfuTransportBtleplug::new().await {
        Ok(t) => t,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting update");
            on_interrupt.cancel();
        }
    });

    let bar = ProgressBar::new(0);
    match dfu_run(&transport, &args.address, &image, &descriptor, config, cancel, bar).await {
        Ok(()) => {
            info!("DFU complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn gen_dat(image: PathBuf, dat: PathBuf) -> Result<(), DfuError> {
    let image = FirmwareImage::load(image)?;
    let packet = InitPacket::for_image(&image)?;
    std::fs::write(&dat, packet.to_descriptor()?.as_bytes())?;
    info!(path = %dat.display(), crc = %format!("{:#06x}", packet.crc), "Wrote init packet");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install log subscriber");
    }

    match args.command {
        Command::Update(update_args) => update(update_args).await,
        Command::GenDat { image, dat } => match gen_dat(image, dat) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                ExitCode::from(2)
            }
        },
    }
}

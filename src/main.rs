//! Miner daemon: bring up the chain, connect to the pool, run the pipeline.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use bitaxe_miner::asic::chain::{Chain, ChainConfig, StrappedReset, INITIAL_BAUD};
use bitaxe_miner::asic::protocol::FrameCodec;
use bitaxe_miner::asic::AsicModel;
use bitaxe_miner::pipeline::Pipeline;
use bitaxe_miner::settings::{self, FileSettings, Settings};
use bitaxe_miner::stratum_v1::{ClientConfig, PoolEndpoint};
use bitaxe_miner::tracing::prelude::*;

#[derive(Parser, Debug)]
#[command(
    name = "bitaxe-miner",
    version,
    about = "Mining pipeline core for BM13xx boards"
)]
struct Options {
    /// Serial device connected to the ASIC chain.
    #[arg(long, default_value = "/dev/ttyS1")]
    serial: String,

    /// Settings file.
    #[arg(long, default_value = "settings.json")]
    settings: std::path::PathBuf,

    /// Pool host; overrides and persists to settings.
    #[arg(long)]
    pool: Option<String>,

    /// Pool port; overrides and persists to settings.
    #[arg(long)]
    pool_port: Option<u16>,

    /// Worker username; overrides and persists to settings.
    #[arg(long)]
    user: Option<String>,

    /// Worker password; overrides and persists to settings.
    #[arg(long)]
    pass: Option<String>,

    /// Chip model (BM1366, BM1368, BM1370, BM1397); overrides settings.
    #[arg(long)]
    model: Option<String>,

    /// Target hash frequency in MHz; overrides settings.
    #[arg(long)]
    frequency: Option<u16>,

    /// Number of chips the board is built with.
    #[arg(long, default_value_t = 1)]
    chips: u16,

    /// Share difficulty to suggest to the pool.
    #[arg(long)]
    suggest_difficulty: Option<f64>,

    /// Consecutive fallback-pool failures before retrying the primary.
    #[arg(long, default_value_t = 5)]
    fallback_failure_limit: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bitaxe_miner::tracing::init_journald_or_stdout();
    let options = Options::parse();

    info!("Welcome to the bitaxe - hack the planet!");

    let settings: Arc<dyn Settings> =
        Arc::new(FileSettings::open(&options.settings).context("open settings store")?);

    // CLI overrides persist, like a save from the configuration surface.
    if let Some(pool) = &options.pool {
        settings.set_string(settings::keys::STRATUM_URL, pool);
    }
    if let Some(port) = options.pool_port {
        settings.set_u16(settings::keys::STRATUM_PORT, port);
    }
    if let Some(user) = &options.user {
        settings.set_string(settings::keys::STRATUM_USER, user);
    }
    if let Some(pass) = &options.pass {
        settings.set_string(settings::keys::STRATUM_PASS, pass);
    }
    if let Some(model) = &options.model {
        model
            .parse::<AsicModel>()
            .map_err(|_| anyhow::anyhow!("unknown chip model: {model}"))?;
        settings.set_string(settings::keys::ASIC_MODEL, model);
    }
    if let Some(frequency) = options.frequency {
        settings.set_u16(settings::keys::ASIC_FREQUENCY, frequency);
    }
    settings.ensure_overheat_mode();

    let model = settings.asic_model();
    let frequency = settings.asic_frequency();
    let status = settings::new_status(settings.as_ref());

    // The chain wakes up at the power-on baud; bring-up raises it.
    let port = tokio_serial::new(&options.serial, INITIAL_BAUD)
        .open_native_async()
        .with_context(|| format!("open serial device {}", options.serial))?;
    let transport = Framed::new(port, FrameCodec);

    let chain = Chain::bring_up(
        transport,
        StrappedReset,
        model,
        ChainConfig {
            frequency_mhz: frequency as f32,
            expected_chips: options.chips,
            asic_difficulty: None,
        },
    )
    .await
    .context("chain bring-up")?;
    info!(chips = chain.chip_count(), %model, "Chain initialized");

    let client_config = ClientConfig {
        primary: PoolEndpoint {
            host: settings.stratum_url(),
            port: settings.stratum_port(),
            username: settings.stratum_user(),
            password: settings.stratum_pass(),
        },
        fallback: PoolEndpoint {
            host: settings.fallback_stratum_url(),
            port: settings.fallback_stratum_port(),
            username: settings.fallback_stratum_user(),
            password: settings.fallback_stratum_pass(),
        },
        user_agent: format!("bitaxe/{}/{}", model, env!("CARGO_PKG_VERSION")),
        suggested_difficulty: options.suggest_difficulty,
        fallback_failure_limit: options.fallback_failure_limit,
    };

    let shutdown = CancellationToken::new();
    let pipeline = Pipeline::spawn(
        chain,
        client_config,
        Arc::clone(&settings),
        status,
        shutdown.clone(),
    );

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    shutdown.cancel();
    pipeline.wait().await;
    info!("Exiting.");

    Ok(())
}

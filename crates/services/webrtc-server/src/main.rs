//! WebRTC server binary entry point
//!
//! Serves the mirrorcast signaling endpoint and browser client.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:8000, discard inbound media
//! cargo run -p mirrorcast-server
//!
//! # Record every session under ./recordings, debug logging
//! cargo run -p mirrorcast-server -- --record-to ./recordings -v
//!
//! # Loop a raw µ-law file as the audio reply, block instead of dropping frames
//! cargo run -p mirrorcast-server -- \
//!   --capture file:./hold-music.ulaw \
//!   --backpressure block \
//!   --relay-queue 256
//! ```

use clap::Parser;
use mirrorcast_webrtc::{
    router, BackpressurePolicy, CaptureConfig, ConfiguredCapture, RelayConfig, ServerConfig,
    SessionRegistry, SignalingService, WebRtcTransportFactory,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time allowed for closing sessions after Ctrl+C before the process is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// mirrorcast WebRTC server
///
/// Answers browser offers over HTTP and mirrors their media back: video is
/// relayed to the sender, audio is answered with a local capture source.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host for HTTP server
    #[arg(long, default_value = "0.0.0.0", env = "MIRRORCAST_HOST")]
    host: IpAddr,

    /// Port for HTTP server
    #[arg(long, default_value_t = 8000, env = "MIRRORCAST_PORT")]
    port: u16,

    /// Write received media to files in this directory
    #[arg(long, env = "MIRRORCAST_RECORD_TO")]
    record_to: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "MIRRORCAST_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// Audio reply source: 'tone', 'tone:<hz>', 'file:<path>' or 'none'
    #[arg(long, default_value = "tone", env = "MIRRORCAST_CAPTURE")]
    capture: CaptureConfig,

    /// Per-consumer relay queue depth in frames
    #[arg(long, default_value_t = 64, env = "MIRRORCAST_RELAY_QUEUE")]
    relay_queue: usize,

    /// What a full relay queue does: 'drop' or 'block'
    #[arg(long, default_value = "drop", env = "MIRRORCAST_BACKPRESSURE")]
    backpressure: BackpressurePolicy,

    /// Upper bound on ICE gathering before answering, in milliseconds
    #[arg(long, default_value_t = 5000, env = "MIRRORCAST_ICE_TIMEOUT_MS")]
    ice_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            record_to: self.record_to,
            verbose: self.verbose,
            stun_servers: self.stun_servers,
            capture: self.capture,
            relay: RelayConfig {
                queue_capacity: self.relay_queue,
                backpressure: self.backpressure,
            },
            ice_gathering_timeout_ms: self.ice_timeout_ms,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let config = Args::parse().into_config();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        eprintln!(
            "\n🛑 [{}] Ctrl+C received! Initiating shutdown...",
            timestamp
        );

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("   [SIGNAL] ⚠️  Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        // Give sessions a moment to close
        std::thread::spawn(move || {
            std::thread::sleep(SHUTDOWN_GRACE);
            eprintln!(
                "⚠️  [WATCHDOG] Graceful shutdown timeout ({}s), forcing exit",
                SHUTDOWN_GRACE.as_secs()
            );
            std::process::exit(0);
        });
    })?;

    // Create multi-threaded tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("webrtc-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config, shutdown_flag))
}

async fn async_main(
    config: ServerConfig,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(config.verbose);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind_addr(),
        record_to = ?config.record_to,
        capture = ?config.capture,
        relay_queue = config.relay.queue_capacity,
        backpressure = ?config.relay.backpressure,
        "mirrorcast WebRTC server starting"
    );

    let factory = Arc::new(WebRtcTransportFactory::new(&config)?);
    let capture = Arc::new(ConfiguredCapture::new(config.capture.clone()));
    let registry = SessionRegistry::new();
    let addr = config.bind_addr();

    let service = Arc::new(SignalingService::new(
        config,
        factory,
        capture,
        registry.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Signaling endpoint listening on http://{}", addr);
    info!("Server running. Press Ctrl+C to shutdown.");

    let shutdown_future = async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Shutdown signal received, stopping HTTP server...");
    };

    axum::serve(listener, router(Arc::clone(&service)))
        .with_graceful_shutdown(shutdown_future)
        .await?;

    // Every live session is closed before the process exits
    registry.close_all().await;
    info!("mirrorcast WebRTC server shut down gracefully");

    Ok(())
}

fn init_tracing(verbose: u8) {
    // RUST_LOG wins over -v
    let default_directive = if verbose > 0 {
        "debug,webrtc=info,webrtc_ice=info,webrtc_dtls=info,webrtc_srtp=info"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

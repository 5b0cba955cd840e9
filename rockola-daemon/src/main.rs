use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::filter::LevelFilter;
use tracing::{info, warn, debug, error};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use rockola_common::{Request, Response};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod config;
mod connection;
mod connectivity;
mod controller;
mod metrics;
mod playback;
mod registration;

use connection::ConnectionManager;
use connectivity::ConnectivityMonitor;
use controller::QueueController;
use metrics::SessionMetrics;
use playback::{GstPlayer, PlaybackSurface};
use registration::Registrar;

use chrono::Local;

struct CustomTimer;

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

use clap::Parser;

type Command = (Request, oneshot::Sender<Response>);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// 1 = warn, 2 = info, 3 = debug, 4 = trace. Also writes a log file.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
    log: Option<u8>,

    /// Control socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

type LogGuards = (
    Option<tracing_appender::non_blocking::WorkerGuard>,
    Option<tracing_appender::non_blocking::WorkerGuard>,
);

fn init_logging(log_level: Option<u8>) -> anyhow::Result<LogGuards> {
    let filter = match log_level {
        Some(1) => LevelFilter::WARN,
        Some(3) => LevelFilter::DEBUG,
        Some(4) => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(filter.into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("rustls=warn".parse()?)
        .add_directive("tungstenite=warn".parse()?);

    let Some(level) = log_level else {
        let stdout_layer = subscriber_fmt::layer()
            .with_writer(std::io::stdout)
            .with_timer(CustomTimer);

        Registry::default()
            .with(env_filter)
            .with(stdout_layer)
            .init();
        info!("Rockola Daemon starting...");
        return Ok((None, None));
    };

    let log_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
        .join("rockola").join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_path = log_dir.join(format!("rockola-daemon-{}.log", timestamp));
    let file = std::fs::File::create(&log_path)?;
    println!("Logging to file: {}", log_path.display());
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = subscriber_fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_timer(CustomTimer);

    let stdout_layer = subscriber_fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_timer(CustomTimer);

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    info!("Rockola Daemon starting... (Level {}, File: {})", level, log_dir.display());
    Ok((Some(file_guard), Some(stdout_guard)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1. Initialize Logging
    let _guards = init_logging(args.log)?;

    // 2. Load Configuration
    let config = match config::Config::load().await {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Failed to load configuration: {}. Using defaults.", e);
            config::Config::default()
        }
    };
    let station_id = config
        .server
        .station_id
        .clone()
        .context("No station configured: set station-id in the [server] section")?;
    if config.server.access_token.is_none() {
        warn!("No access token configured, registration requests will be unauthenticated");
    }

    // 3. Initialize GStreamer
    gstreamer::init()?;
    info!("GStreamer initialized.");

    let metrics = Arc::new(SessionMetrics::new());
    let cancel = CancellationToken::new();

    // 4. Playback surface and controller
    let (playback_tx, mut playback_rx) = mpsc::unbounded_channel();
    let player = GstPlayer::new(&config.playback, playback_tx)?;
    let mut controller = QueueController::new(player, metrics.clone());

    // 5. Connectivity monitor
    let (net_tx, mut net_rx) = mpsc::channel::<bool>(8);
    let monitor = ConnectivityMonitor::new(config.probe_url(), config.connectivity.clone())?;
    let monitor_task = tokio::spawn(monitor.run(net_tx, cancel.child_token()));

    // 6. Push channel
    let (item_tx, mut item_rx) = mpsc::channel(64);
    let registrar = Registrar::new(
        &config.server.base_url,
        &station_id,
        config.server.access_token.clone(),
        config.connection.register_timeout,
    )?;
    let url = connection::socket_url(&config.server.base_url, &config.server.socket_path)?;
    let (manager, identity_rx) = ConnectionManager::new(url, registrar, config.connection.clone(), metrics.clone());
    let connection_task = tokio::spawn(manager.run(item_tx, cancel.child_token()));

    info!("[QUEUE] Station {} ready", station_id);

    // 7. Control socket
    let socket_path = args.socket.unwrap_or_else(rockola_common::default_socket_path);
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    spawn_ipc_listener(&socket_path, cmd_tx)?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        warn!("Received shutdown signal, cleaning up...");
        shutdown_signal.cancel();
    });

    let mut metrics_interval = tokio::time::interval(Duration::from_secs(300));
    metrics_interval.tick().await;

    loop {
        tokio::select! {
            Some(item) = item_rx.recv() => controller.enqueue(item),
            Some(online) = net_rx.recv() => controller.set_connectivity(online),
            Some(event) = playback_rx.recv() => {
                debug!("[PLAYBACK] Event {:?}", event);
                controller.handle_playback_event(event);
            }
            Some((req, resp_tx)) = cmd_rx.recv() => {
                let logout = matches!(req, Request::Logout);
                let response = handle_command(req, &mut controller, &identity_rx);
                let _ = resp_tx.send(response);
                if logout {
                    info!("[IPC] Logout requested");
                    break;
                }
            }
            _ = metrics_interval.tick() => metrics.log_summary(),
            _ = shutdown.cancelled() => break,
        }
    }

    // Teardown first so nothing plays after the station is unregistered
    controller.teardown();
    cancel.cancel();
    if tokio::time::timeout(config.connection.register_timeout * 2, connection_task).await.is_err() {
        error!("[SOCKET] Connection manager did not stop in time");
    }
    let _ = monitor_task.await;
    let _ = std::fs::remove_file(&socket_path);

    metrics.log_summary();
    info!("Rockola Daemon stopped.");
    Ok(())
}

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

fn spawn_ipc_listener(socket_path: &Path, cmd_tx: mpsc::UnboundedSender<Command>) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind control socket {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(socket_path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(socket_path, perms);
        }
    }
    info!("[IPC] Listening on {}", socket_path.display());

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    // e.g. EMFILE: give in-flight connections a chance to close
                    warn!("[IPC] Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                const MAX_MESSAGE_SIZE: usize = 8192;
                let mut buf = [0u8; MAX_MESSAGE_SIZE];
                let n = match stream.read(&mut buf).await {
                    Ok(n) if n > 0 && n < MAX_MESSAGE_SIZE => n,
                    _ => return,
                };
                let response = match std::str::from_utf8(&buf[..n])
                    .map_err(|e| e.to_string())
                    .and_then(|s| serde_json::from_str::<Request>(s.trim()).map_err(|e| e.to_string()))
                {
                    Ok(req) => {
                        let (resp_tx, resp_rx) = oneshot::channel();
                        if cmd_tx.send((req, resp_tx)).is_err() {
                            return;
                        }
                        match resp_rx.await {
                            Ok(response) => response,
                            Err(_) => return,
                        }
                    }
                    Err(e) => {
                        debug!("[IPC] Rejected request: {}", e);
                        Response::Error(format!("invalid request: {}", e))
                    }
                };
                if let Ok(json) = serde_json::to_string(&response) {
                    let _ = stream.write_all(json.as_bytes()).await;
                }
            });
        }
    });
    Ok(())
}

fn handle_command<S: PlaybackSurface>(
    req: Request,
    controller: &mut QueueController<S>,
    identity: &watch::Receiver<Option<String>>,
) -> Response {
    match req {
        Request::Status => Response::Status(controller.status(identity.borrow().clone())),
        Request::Queue => Response::Queue(controller.backlog().cloned().collect()),
        Request::Enqueue { item } => {
            info!("[IPC] Enqueue {} ({})", item.title, item.video_id);
            controller.enqueue(item);
            Response::Ok
        }
        Request::Logout => Response::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rockola-test-{}-{}.sock", std::process::id(), name))
    }

    async fn roundtrip(path: &Path, request: &str) -> String {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn control_socket_forwards_requests_to_the_loop() {
        let path = socket_path("forward");
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        spawn_ipc_listener(&path, cmd_tx).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let event_loop = tokio::spawn(async move {
            let (req, resp_tx) = cmd_rx.recv().await.unwrap();
            assert!(matches!(req, Request::Queue));
            resp_tx.send(Response::Queue(Vec::new())).unwrap();
        });

        let response = roundtrip(&path, "{\"method\":\"queue\"}\n").await;
        let parsed: Response = serde_json::from_str(&response).unwrap();
        assert!(matches!(parsed, Response::Queue(items) if items.is_empty()));
        event_loop.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn control_socket_rejects_malformed_requests() {
        let path = socket_path("malformed");
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        spawn_ipc_listener(&path, cmd_tx).unwrap();

        let response = roundtrip(&path, "{\"method\":\"dance\"}").await;
        let parsed: Response = serde_json::from_str(&response).unwrap();
        assert!(matches!(parsed, Response::Error(msg) if msg.starts_with("invalid request")));
        assert!(cmd_rx.try_recv().is_err());
        let _ = std::fs::remove_file(&path);
    }
}

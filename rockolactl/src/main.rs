use clap::{Parser, Subcommand};
use rockola_common::{QueueItem, Request, Response, StatusInfo};
use tokio::net::UnixStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser)]
#[command(
    name = "rockolactl",
    version,
    disable_version_flag = true,
    about = "Rockola control utility - inspect and drive the venue player",
    long_about = r#"
Rockola Control Utility (rockolactl)
════════════════════════════════════

A CLI tool to talk to a running rockola-daemon.

Station, server and playback settings live in the config file at
~/.config/rockola/config.toml

EXAMPLES:
  rockolactl status                          Show what is playing
  rockolactl queue                           List waiting requests
  rockolactl enqueue ~/clips/intro.mp4       Play a local clip next in line
  rockolactl logout                          Stop playback and unregister

CONFIG:
  ~/.config/rockola/config.toml
"#,
    after_help = "Use 'rockolactl <command> --help' for more info on a specific command."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path (defaults to XDG_RUNTIME_DIR/rockola.sock or /tmp/rockola-{USER}.sock)
    #[arg(short, long, global = true)]
    socket: Option<String>,

    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show playback state, connectivity and session counters
    #[command(visible_alias = "st")]
    Status,

    /// List requests waiting behind the current one
    #[command(visible_alias = "q")]
    Queue,

    /// Add a request locally, as if a station had sent it
    Enqueue {
        /// Playback URL or local file path
        url: String,

        /// Display title (defaults to the URL)
        #[arg(short, long)]
        title: Option<String>,

        /// Request identifier
        #[arg(long, default_value = "local")]
        video_id: String,

        /// Thumbnail URL shown by station-side clients
        #[arg(long, default_value = "")]
        thumbnail: String,

        /// Station the request is attributed to
        #[arg(long, default_value = "local")]
        station: String,
    },

    /// Tear down playback, unregister the station and stop the daemon
    Logout,

    /// Validate configuration file without starting daemon
    #[command(name = "check-config", visible_alias = "cc")]
    CheckConfig,
}

fn check_config() -> anyhow::Result<()> {
    let config_path = dirs::config_dir()
        .map(|p| p.join("rockola").join("config.toml"))
        .unwrap_or_else(|| std::path::PathBuf::from("config.toml"));

    if !config_path.exists() {
        println!("✓ No config file found at {:?} (using defaults)", config_path);
        return Ok(());
    }

    let content = std::fs::read_to_string(&config_path)?;
    match toml::from_str::<toml::Table>(&content) {
        Ok(table) => {
            let station = table
                .get("server")
                .and_then(|s| s.get("station-id"))
                .and_then(|v| v.as_str());
            println!("✓ Configuration valid: {:?}", config_path);
            match station {
                Some(id) => println!("  station-id = {}", id),
                None => println!("  ! no station-id set in [server], the daemon will refuse to start"),
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn print_status(status: StatusInfo) {
    println!("State:       {}", status.phase);
    println!("Network:     {}", if status.is_online { "online" } else { "offline" });
    println!(
        "Connection:  {}",
        status.connection_id.as_deref().unwrap_or("disconnected")
    );
    match &status.current {
        Some(item) => {
            let progress = match (status.position_ms, status.duration_ms) {
                (Some(pos), Some(dur)) => format!(" [{} / {}]", format_ms(pos), format_ms(dur)),
                (Some(pos), None) => format!(" [{}]", format_ms(pos)),
                _ => String::new(),
            };
            println!("Now playing: {} ({}){}", item.title, item.video_id, progress);
            println!("  Station:   {}", item.station_id);
            println!("  Source:    {}", item.playback_url);
            if !status.is_playing {
                println!("  (paused)");
            }
        }
        None => println!("Now playing: nothing"),
    }
    println!("Queued:      {}", status.backlog_len);
    println!();
    println!(
        "Played {} | Failed {} | Stale events {} | Reconnects {} | Offline {}",
        status.stats.items_played,
        status.stats.load_failures,
        status.stats.stale_events_discarded,
        status.stats.reconnects,
        status.stats.offline_transitions
    );
}

fn print_queue(items: Vec<QueueItem>) {
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }
    println!("{:<4} | {:<12} | {:<40} | {:<10}", "#", "Request", "Title", "Station");
    println!("{}", "-".repeat(74));
    for (i, item) in items.iter().enumerate() {
        println!(
            "{:<4} | {:<12} | {:<40} | {:<10}",
            i + 1,
            item.video_id,
            item.title,
            item.station_id
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::CheckConfig => return check_config(),
        Commands::Status => Request::Status,
        Commands::Queue => Request::Queue,
        Commands::Logout => Request::Logout,
        Commands::Enqueue { url, title, video_id, thumbnail, station } => Request::Enqueue {
            item: QueueItem {
                station_id: station,
                video_id,
                title: title.unwrap_or_else(|| url.clone()),
                thumbnail_url: thumbnail,
                playback_url: url,
            },
        },
    };

    let socket_path = cli.socket.unwrap_or_else(|| {
        rockola_common::default_socket_path()
            .to_string_lossy()
            .to_string()
    });

    // Connect to daemon
    match UnixStream::connect(&socket_path).await {
        Ok(mut stream) => {
            let req_json = serde_json::to_string(&request)?;
            stream.write_all(req_json.as_bytes()).await?;
            stream.write_all(b"\n").await?;

            let mut response = String::new();
            stream.read_to_string(&mut response).await?;

            if response.is_empty() {
                println!("OK");
                return Ok(());
            }
            match serde_json::from_str::<Response>(&response) {
                Ok(Response::Status(status)) => print_status(status),
                Ok(Response::Queue(items)) => print_queue(items),
                Ok(Response::Ok) => println!("OK"),
                Ok(Response::Error(e)) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
                Err(_) => println!("{}", response),
            }
        }
        Err(e) => {
            eprintln!("Failed to connect to daemon at {}: {}", socket_path, e);
            eprintln!("Is rockola-daemon running?");
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_ms(0), "0:00");
        assert_eq!(format_ms(61_500), "1:01");
        assert_eq!(format_ms(3_600_000), "60:00");
    }

    #[test]
    fn enqueue_builds_local_request() {
        let cli = Cli::parse_from(["rockolactl", "enqueue", "/srv/clip.mp4", "--title", "Intro"]);
        let Commands::Enqueue { url, title, video_id, thumbnail, station } = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(url, "/srv/clip.mp4");
        assert_eq!(title.as_deref(), Some("Intro"));
        assert_eq!(video_id, "local");
        assert!(thumbnail.is_empty());
        assert_eq!(station, "local");
    }

    #[test]
    fn aliases_resolve() {
        assert!(matches!(Cli::parse_from(["rockolactl", "st"]).command, Commands::Status));
        assert!(matches!(Cli::parse_from(["rockolactl", "q"]).command, Commands::Queue));
    }
}

//! Command-line client for `sdrbus-broker`'s Unix-domain control socket.
//!
//! There is no admin HTTP surface in front of the broker — the CLI dials
//! the socket directly and speaks the same length-prefixed JSON frames any
//! addon would. The wire-level subcommands (`cmd`, `pub`, `sub`, `list`,
//! `load addon`, `unload addon`) cover the broker's full control-plane
//! vocabulary.

use std::io::Write as _;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use sdrbus_protocol::{send_frame, FrameReader, RecvOutcome};

/// How long a one-shot command waits for replies before giving up.
const REPLY_WINDOW: Duration = Duration::from_millis(1500);

#[derive(Parser, Debug)]
#[command(name = "sdrbus-cli", about = "sdrbus broker control client")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to the broker's control socket.
    #[arg(short, long, default_value = "/tmp/.sdrbus-broker.sock", global = true)]
    socket: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a raw cli-control command string (e.g. "feeds", "plugins").
    Cmd { text: String },
    /// Publish a UTF-8 payload to a feed.
    Pub { feed: String, data: String },
    /// Subscribe to one or more feeds and print frames as they arrive.
    Sub { feeds: Vec<String> },
    /// List feeds, loaded addons, or discoverable addons.
    List { what: String },
    /// Load an addon by name or path.
    Load { addon: String, name: String },
    /// Unload an addon by name.
    Unload { addon: String, name: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let stream = UnixStream::connect(&args.socket)
        .map_err(|e| anyhow::anyhow!("connect {}: {}", args.socket, e))?;
    stream.set_nonblocking(true)?;
    let fd = stream.as_raw_fd();

    match &args.command {
        Commands::Cmd { text } => send_command(fd, text)?,
        Commands::Pub { feed, data } => {
            let msg = json!({ "type": "publish", "feed": feed, "data": data, "encoding": "utf8" });
            send_frame(fd, msg.to_string().as_bytes(), &[])?;
        }
        Commands::Sub { feeds } => {
            for feed in feeds {
                let msg = json!({ "type": "subscribe", "feed": feed });
                send_frame(fd, msg.to_string().as_bytes(), &[])?;
            }
            eprintln!("[sdrbus-cli] subscribed to {} feed(s). Ctrl+C to stop.", feeds.len());
            return subscribe_loop(fd);
        }
        Commands::List { what } => {
            let verb = match what.as_str() {
                "feeds" => "feeds",
                "addons" => "plugins",
                "available-addons" => "available-addons",
                other => anyhow::bail!("unknown list target: {other}"),
            };
            send_command(fd, verb)?;
        }
        Commands::Load { addon, name } => {
            anyhow::ensure!(addon == "addon", "expected `load addon <name>`");
            send_command(fd, &format!("load {name}"))?;
        }
        Commands::Unload { addon, name } => {
            anyhow::ensure!(addon == "addon", "expected `unload addon <name>`");
            send_command(fd, &format!("unload {name}"))?;
        }
    }

    print_replies(fd)
}

fn send_command(fd: std::os::fd::RawFd, text: &str) -> anyhow::Result<()> {
    let msg = json!({ "type": "command", "feed": "cli-control", "data": text });
    send_frame(fd, msg.to_string().as_bytes(), &[])?;
    Ok(())
}

/// Print every reply frame that arrives within [`REPLY_WINDOW`] of the last
/// one, then exit 0 if at least one reply was printed, else 1.
fn print_replies(fd: std::os::fd::RawFd) -> anyhow::Result<()> {
    let mut reader = FrameReader::new();
    let mut printed = false;
    loop {
        match reader.recv_frame(fd, REPLY_WINDOW) {
            Ok(RecvOutcome::Frame { payload, .. }) => {
                let mut out = std::io::stdout();
                out.write_all(&payload)?;
                out.write_all(b"\n")?;
                printed = true;
            }
            Ok(RecvOutcome::Timeout) => break,
            Ok(RecvOutcome::Eof) => break,
            Err(_) => break,
        }
    }
    std::process::exit(if printed { 0 } else { 1 });
}

fn subscribe_loop(fd: std::os::fd::RawFd) -> anyhow::Result<()> {
    let mut reader = FrameReader::new();
    loop {
        match reader.recv_frame(fd, Duration::from_millis(2000)) {
            Ok(RecvOutcome::Frame { payload, .. }) => {
                let feed = sdrbus_protocol::json_probe::get_string_field(&payload, "feed");
                let line = String::from_utf8_lossy(&payload);
                match feed {
                    Some(tag) => println!("[{tag}] {line}"),
                    None => println!("{line}"),
                }
            }
            Ok(RecvOutcome::Timeout) => continue,
            Ok(RecvOutcome::Eof) => anyhow::bail!("broker closed the connection"),
            Err(e) => anyhow::bail!("read error: {e}"),
        }
    }
}

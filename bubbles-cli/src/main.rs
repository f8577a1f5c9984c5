//! Bubbles command line: run a relay, or join a room as a headless participant.
//!
//! ```bash
//! bubbles server --bind 0.0.0.0:4444
//! bubbles client --endpoint relay.local --room lobby --autopilot
//! bubbles client --endpoint relay.local --room lobby --secure \
//!     --ca ca.pem --cert client.pem --key client.key
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use bubbles_engine::{
    CredentialBundle, EngineConfig, LifecycleState, RelayServer, ServerConfig, ServerTls,
    Session, SessionEndpoint, SessionEvent,
};
use clap::{Args, Parser, Subcommand};
use log::info;

/// Shared-canvas bubbles relay and client.
#[derive(Parser)]
#[command(name = "bubbles", version, about, long_about = None)]
struct Cli {
    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay.
    Server(ServerArgs),

    /// Join a room and print the roster periodically.
    Client(ClientArgs),
}

/// PEM files for mutual TLS. All three or none.
#[derive(Args, Clone)]
struct TlsFiles {
    /// Certificate authority (PEM)
    #[arg(long, requires_all = ["cert", "key"])]
    ca: Option<PathBuf>,
    /// Own certificate chain (PEM)
    #[arg(long, requires_all = ["ca", "key"])]
    cert: Option<PathBuf>,
    /// Own private key (PEM)
    #[arg(long, requires_all = ["ca", "cert"])]
    key: Option<PathBuf>,
}

impl TlsFiles {
    fn load(&self) -> Result<Option<CredentialBundle>, Box<dyn Error>> {
        let (Some(ca), Some(cert), Some(key)) = (&self.ca, &self.cert, &self.key) else {
            return Ok(None);
        };
        Ok(Some(CredentialBundle::new(
            std::fs::read_to_string(ca)?,
            std::fs::read_to_string(cert)?,
            std::fs::read_to_string(key)?,
        )))
    }
}

#[derive(Args)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:4444")]
    bind: String,

    /// Maximum members per room
    #[arg(long, default_value_t = 64)]
    max_peers: usize,

    /// Close connections silent for this many seconds
    #[arg(long, default_value_t = 30)]
    idle_timeout_secs: u64,

    /// Refuse compressed position payloads
    #[arg(long)]
    no_compression: bool,

    /// Worker threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[command(flatten)]
    tls: TlsFiles,
}

#[derive(Args)]
struct ClientArgs {
    /// Relay address, `host[:port]`
    #[arg(long)]
    endpoint: String,

    #[arg(long)]
    room: String,

    /// Use mutual TLS (requires --ca, --cert and --key)
    #[arg(long)]
    secure: bool,

    /// Ask for compressed position payloads
    #[arg(long)]
    compressed: bool,

    /// Move automatically
    #[arg(long)]
    autopilot: bool,

    /// Initial logical position, `x,y`
    #[arg(long, value_parser = parse_pair, default_value = "0,0")]
    position: (i32, i32),

    /// Viewport used to print pixel positions, `width,height`
    #[arg(long, value_parser = parse_pair, default_value = "1920,1080")]
    frame: (i32, i32),

    /// Milliseconds between roster dumps
    #[arg(long, default_value_t = 1000)]
    dump_interval_ms: u64,

    /// Leave after this many seconds (0 = stay until the session ends)
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,

    #[command(flatten)]
    tls: TlsFiles,
}

fn parse_pair(s: &str) -> Result<(i32, i32), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `a,b`, got {s:?}"))?;
    let parse = |v: &str| v.trim().parse::<i32>().map_err(|e| format!("{v:?}: {e}"));
    Ok((parse(a)?, parse(b)?))
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Server(args) => run_server(args),
        Commands::Client(args) => run_client(args),
    }
}

fn run_server(args: ServerArgs) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        allow_compression: !args.no_compression,
        ..ServerConfig::default()
    };
    let server = match args.tls.load()? {
        Some(credentials) => RelayServer::with_tls(config, ServerTls::new(&credentials)?),
        None => RelayServer::new(config),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.threads.max(1))
        .thread_name("bubbles-relay")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let bound = server.bind().await?;
        tokio::select! {
            result = bound.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        }
        Ok::<_, Box<dyn Error>>(())
    })?;

    let stats = server.stats();
    info!(
        "Served {} connections, {} joins ({} rejected), {} messages, {} malformed",
        stats.total_connections,
        stats.total_joins,
        stats.rejected_joins,
        stats.total_messages,
        stats.malformed_frames
    );
    Ok(())
}

fn run_client(args: ClientArgs) -> Result<(), Box<dyn Error>> {
    let credentials = match (args.secure, args.tls.load()?) {
        (true, None) => return Err("--secure needs --ca, --cert and --key".into()),
        (_, credentials) => credentials.unwrap_or_default(),
    };
    let endpoint = SessionEndpoint::new(&args.endpoint, &args.room)
        .secure(args.secure)
        .compressed(args.compressed)
        .autopilot(args.autopilot);

    let session = Session::new(EngineConfig::default())?;
    let mut events = session
        .take_event_rx()
        .ok_or("event channel already taken")?;
    session.set_frame(args.frame.0, args.frame.1);
    session.move_to(args.position.0, args.position.1);
    session.start(&endpoint, &credentials)?;
    info!(
        "Joined {:?} as {} (color #{:06x})",
        args.room,
        session.id(),
        session.local_color()
    );

    let interval = Duration::from_millis(args.dump_interval_ms.max(50));
    let deadline = (args.duration_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(args.duration_secs));

    while session.state() == LifecycleState::Running {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(interval);

        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::Failed { reason } => log::error!("Session failed: {reason}"),
                SessionEvent::Reconnected => info!("Re-joined the room"),
                SessionEvent::AutopilotMoved { x, y } => log::debug!("Autopilot at ({x}, {y})"),
                SessionEvent::Redraw => {}
            }
        }
        dump_roster(&session)?;
    }

    let state = session.state();
    session.stop();
    match session.last_error() {
        Some(e) if state == LifecycleState::Failed => Err(e.into()),
        _ => Ok(()),
    }
}

/// One plot cycle, printed instead of drawn.
fn dump_roster(session: &Session) -> Result<(), Box<dyn Error>> {
    let frame = session.frame();
    let me = session.local_participant();
    let (px, py) = frame.to_pixels(me.x, me.y);
    println!(
        "me      ({:>5}, {:>5})  px ({:>5}, {:>5})  #{:06x}",
        me.x, me.y, px, py, session.plot_my_color()
    );

    session.plot_start()?;
    let mut count = 0;
    while !session.plot_end()? {
        let (x, y) = (session.plot_x()?, session.plot_y()?);
        let (px, py) = frame.to_pixels(x, y);
        println!(
            "peer {count:<2} ({x:>5}, {y:>5})  px ({px:>5}, {py:>5})  #{:06x}",
            session.plot_color()?
        );
        count += 1;
        session.plot_next()?;
    }
    session.plot_done()?;
    println!("-- {count} other participant(s)");
    Ok(())
}

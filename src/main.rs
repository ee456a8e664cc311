use clap::{App, Arg, ArgMatches, SubCommand};
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use mitmcore::policy::{PolicyError, PolicyState, PolicyStore};
use nfcgate_proxy::events::{self, EventSink, DEFAULT_SINK_CAPACITY};
use nfcgate_proxy::http::{self, HttpState};
use nfcgate_proxy::server::{self, Phase, ServerConfig};

#[derive(Debug)]
enum AppError {
    Config(String),
    Key(String),
    Bind(String),
    Runtime(String),
}

impl AppError {
    fn code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Key(_) => 3,
            AppError::Bind(_) => 4,
            AppError::Runtime(_) => 1,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "configuration error: {}", msg),
            AppError::Key(msg) => write!(f, "key error: {}", msg),
            AppError::Bind(msg) => write!(f, "bind error: {}", msg),
            AppError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

fn initialize_logging(level: LevelFilter) {
    let stdout = ConsoleAppender::builder().build();
    let stdout_append_name = "stdout";

    let config = Config::builder()
        .appender(Appender::builder().build(stdout_append_name, Box::new(stdout)))
        .build(Root::builder().appender(stdout_append_name).build(level))
        .unwrap();

    let _handle = log4rs::init_config(config).unwrap();
}

fn run() -> Result<(), AppError> {
    let matches = App::new("nfcgate-proxy")
        .version("0.1")
        .about("MITM relay proxy between NFC relay clients and a payment backend")
        .subcommand(
            SubCommand::with_name("serve")
                .about("Run the TCP and HTTP relay front ends")
                .arg(
                    Arg::with_name("tcp-port")
                        .long("tcp-port")
                        .value_name("PORT")
                        .help("TCP relay port")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("http-port")
                        .long("http-port")
                        .value_name("PORT")
                        .help("HTTP relay port")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .value_name("PATH")
                        .help("Policy bootstrap file (JSON)")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("key")
                        .long("key")
                        .value_name("PATH")
                        .help("RSA private key (PEM), overrides the bootstrap file")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("host")
                        .long("host")
                        .value_name("ADDR")
                        .help("Bind address, default 0.0.0.0")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("max-sessions")
                        .long("max-sessions")
                        .value_name("N")
                        .help("Simultaneous TCP session ceiling, default 50")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("log-level")
                        .long("log-level")
                        .value_name("LEVEL")
                        .help("off|error|warn|info|debug|trace, default info")
                        .takes_value(true),
                ),
        )
        .get_matches();

    match matches.subcommand_matches("serve") {
        Some(serve_matches) => serve(serve_matches),
        None => Err(AppError::Config(
            "no subcommand given, see nfcgate-proxy --help".to_string(),
        )),
    }
}

fn serve(matches: &ArgMatches) -> Result<(), AppError> {
    let level = matches
        .value_of("log-level")
        .unwrap_or("info")
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Config("invalid log level".to_string()))?;
    initialize_logging(level);

    let tcp_port = parse_port(matches, "tcp-port")?;
    let http_port = parse_port(matches, "http-port")?;
    let host = matches.value_of("host").unwrap_or("0.0.0.0").to_string();

    let mut config = ServerConfig::default();
    if let Some(raw) = matches.value_of("max-sessions") {
        config.max_sessions = raw
            .parse()
            .map_err(|_| AppError::Config(format!("invalid session ceiling {:?}", raw)))?;
    }

    let config_path = matches.value_of("config").unwrap();
    let raw = fs::read_to_string(config_path)
        .map_err(|err| AppError::Config(format!("{}: {}", config_path, err)))?;
    let mut state: PolicyState = serde_json::from_str(&raw)
        .map_err(|err| AppError::Config(format!("{}: {}", config_path, err)))?;

    if let Some(key_path) = matches.value_of("key") {
        state.private_key_path = Some(PathBuf::from(key_path));
    }

    let policy = Arc::new(PolicyStore::new(state).map_err(|err| match err {
        PolicyError::Key(key_err) => AppError::Key(key_err.to_string()),
        other => AppError::Config(other.to_string()),
    })?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Runtime(err.to_string()))?;

    runtime.block_on(serve_async(host, tcp_port, http_port, policy, config))
}

async fn serve_async(
    host: String,
    tcp_port: u16,
    http_port: u16,
    policy: Arc<PolicyStore>,
    config: ServerConfig,
) -> Result<(), AppError> {
    let tcp_listener = TcpListener::bind((host.as_str(), tcp_port))
        .await
        .map_err(|err| AppError::Bind(format!("TCP {}:{}: {}", host, tcp_port, err)))?;
    let http_listener = TcpListener::bind((host.as_str(), http_port))
        .await
        .map_err(|err| AppError::Bind(format!("HTTP {}:{}: {}", host, http_port, err)))?;

    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    let sink = EventSink::new(DEFAULT_SINK_CAPACITY);

    let drain_task = tokio::spawn(events::run_drain(sink.clone(), phase_rx.clone()));

    let http_state = Arc::new(HttpState {
        policy: Arc::clone(&policy),
        semaphore: Semaphore::new(32),
    });
    let http_task = tokio::spawn(http::run_http(http_listener, http_state, phase_rx.clone()));

    let grace = config.grace_period;
    let tcp_task = tokio::spawn(server::run_tcp(tcp_listener, policy, sink, config, phase_rx));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining sessions");
            let _ = phase_tx.send(Phase::Draining);
            tokio::time::sleep(grace).await;
            let _ = phase_tx.send(Phase::Closing);
        }
    });

    let _ = tcp_task.await;
    let _ = http_task.await;
    let _ = drain_task.await;

    info!("proxy stopped");
    Ok(())
}

fn parse_port(matches: &ArgMatches, name: &str) -> Result<u16, AppError> {
    let raw = matches.value_of(name).unwrap();
    raw.parse()
        .map_err(|_| AppError::Config(format!("invalid {} {:?}", name, raw)))
}

fn main() {
    std::process::exit(match run() {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            eprintln!("nfcgate-proxy: {}", err);
            err.code()
        }
    });
}

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

use mitmcore::frame::{encode_frame, Md5Checksum, SESSION_ID_LEN};
use mitmcore::policy::PolicyStore;
use mitmcore::process::ErrorCode;

use crate::events::EventSink;
use crate::session::{error_frame, handle_session, SessionLimits};

/// Server lifecycle. Draining stops the accept loops; Closing tells live
/// sessions to say goodbye and return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_sessions: usize,
    pub grace_period: Duration,
    pub limits: SessionLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_sessions: 50,
            grace_period: Duration::from_secs(5),
            limits: SessionLimits::default(),
        }
    }
}

/// Accept loop: one pipeline task per connection up to the session ceiling;
/// accepts beyond it get an immediate ERROR frame and a close.
pub async fn run_tcp(
    listener: TcpListener,
    policy: Arc<PolicyStore>,
    sink: EventSink,
    config: ServerConfig,
    phase: watch::Receiver<Phase>,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_sessions));
    let mut sessions: JoinSet<()> = JoinSet::new();
    let mut phase_rx = phase.clone();

    match listener.local_addr() {
        Ok(addr) => info!("TCP relay listening on {}", addr),
        Err(_) => info!("TCP relay listening"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        match Arc::clone(&semaphore).try_acquire_owned() {
                            Ok(permit) => {
                                let policy = Arc::clone(&policy);
                                let sink = sink.clone();
                                let limits = config.limits.clone();
                                let phase = phase.clone();
                                sessions.spawn(async move {
                                    handle_session(stream, addr.to_string(), policy, sink, limits, phase).await;
                                    drop(permit);
                                });
                            }
                            Err(_) => {
                                warn!("session ceiling of {} reached, rejecting {}", config.max_sessions, addr);
                                tokio::spawn(reject_session(stream));
                            }
                        }
                    }
                    Err(err) => error!("accept failed: {}", err),
                }
            }
            changed = phase_rx.changed() => {
                if changed.is_err() || *phase_rx.borrow() != Phase::Running {
                    info!("stopped accepting new sessions");
                    break;
                }
            }
        }
    }

    // Sessions observe the Closing phase themselves; give them the grace
    // period plus slack before aborting what is left.
    let drained = timeout(config.grace_period + Duration::from_secs(2), async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!("sessions still live after the grace period, aborting them");
        sessions.shutdown().await;
    }

    info!("TCP relay stopped");
}

async fn reject_session(mut stream: TcpStream) {
    let frame = encode_frame(
        &error_frame(
            [0u8; SESSION_ID_LEN],
            ErrorCode::ResourceExhausted,
            "session limit reached",
        ),
        &Md5Checksum,
    );
    let _ = timeout(Duration::from_secs(2), stream.write_all(&frame)).await;
    let _ = stream.shutdown().await;
}

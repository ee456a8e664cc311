use chrono::{DateTime, Utc};
use hexplay::HexViewBuilder;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

use mitmcore::frame::{
    decode_frame, encode_frame, FrameChecksum, FrameError, Md5Checksum, MessageKind, Wrapper,
    FRAME_MAGIC, FRAME_OVERHEAD, MAX_FRAME_REMAINDER, SESSION_ID_LEN,
};
use mitmcore::policy::{PolicyPatch, PolicyStore};
use mitmcore::process::{error_payload, process_nfc_payload, ErrorCode};

use crate::events::EventSink;
use crate::server::Phase;

#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Wall-clock budget for processing one frame.
    pub frame_budget: Duration,
    /// Idle connections beyond this are closed.
    pub idle_timeout: Duration,
    /// Outbound writes beyond this drop the frame.
    pub write_deadline: Duration,
    /// Consecutive checksum mismatches before the session is closed.
    pub checksum_close_after: u32,
    /// Bounded per-session event ring.
    pub event_ring: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits {
            frame_budget: Duration::from_millis(250),
            idle_timeout: Duration::from_secs(120),
            write_deadline: Duration::from_secs(5),
            checksum_close_after: 5,
            event_ring: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Established,
}

/// Per-connection scratch: identity, start time and a bounded ring of the
/// last processed frames and actions, drained to the event sink on close.
pub struct SessionContext {
    pub peer: String,
    pub started_at: DateTime<Utc>,
    session_id: Option<[u8; SESSION_ID_LEN]>,
    events: VecDeque<String>,
    ring: usize,
}

impl SessionContext {
    fn new(peer: String, ring: usize) -> SessionContext {
        SessionContext {
            peer,
            started_at: Utc::now(),
            session_id: None,
            events: VecDeque::with_capacity(ring),
            ring,
        }
    }

    fn record(&mut self, detail: String) {
        if self.events.len() == self.ring {
            self.events.pop_front();
        }
        self.events.push_back(detail);
    }

    fn note_session_id(&mut self, wrapper: &Wrapper) {
        if self.session_id.is_none() {
            self.session_id = Some(wrapper.session_id);
        }
    }

    fn wire_session_id(&self) -> [u8; SESSION_ID_LEN] {
        self.session_id.unwrap_or([0u8; SESSION_ID_LEN])
    }

    fn label(&self) -> String {
        match &self.session_id {
            Some(id) => hex::encode_upper(id),
            None => self.peer.clone(),
        }
    }

    fn drain_to(self, sink: &EventSink) {
        let label = self.label();
        for event in self.events {
            sink.push(&label, event);
        }
    }
}

enum WriteFailure {
    Deadline,
    Io(std::io::Error),
}

/// Per-connection pipeline loop: Opening until INIT, then frame dispatch
/// until the transport closes, the idle timer fires, checksum failures pile
/// up or the server shuts down. Frames of one session are processed and
/// answered strictly in order.
pub async fn handle_session<S>(
    stream: S,
    peer: String,
    policy: Arc<PolicyStore>,
    sink: EventSink,
    limits: SessionLimits,
    mut phase: watch::Receiver<Phase>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let checksum = Md5Checksum;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut ctx = SessionContext::new(peer.clone(), limits.event_ring);
    let mut state = SessionState::Opening;
    let mut checksum_failures = 0u32;
    let mut key_missing_logged = false;

    info!("relay session from {}", peer);
    ctx.record("connected".to_string());

    'session: loop {
        let frame_bytes = tokio::select! {
            read = timeout(limits.idle_timeout, read_frame_bytes(&mut reader)) => {
                match read {
                    Err(_) => {
                        info!("{} idle for {:?}, closing", peer, limits.idle_timeout);
                        ctx.record("idle timeout".to_string());
                        break 'session;
                    }
                    Ok(Err(err)) => {
                        debug!("{} read failed: {}", peer, err);
                        break 'session;
                    }
                    Ok(Ok(None)) => {
                        debug!("{} closed by peer", peer);
                        break 'session;
                    }
                    Ok(Ok(Some(bytes))) => bytes,
                }
            }
            changed = phase.changed() => {
                if changed.is_err() || *phase.borrow() == Phase::Closing {
                    let goodbye = error_frame(
                        ctx.wire_session_id(),
                        ErrorCode::ShuttingDown,
                        "proxy shutting down",
                    );
                    let _ = write_with_deadline(&mut writer, &goodbye, &checksum, limits.write_deadline).await;
                    ctx.record("shutdown".to_string());
                    break 'session;
                }
                continue 'session;
            }
        };

        trace!(
            "{} inbound frame ({} bytes):\n{}",
            peer,
            frame_bytes.len(),
            HexViewBuilder::new(&frame_bytes).finish()
        );

        let wrapper = match decode_frame(&frame_bytes, &checksum) {
            Ok(wrapper) => {
                checksum_failures = 0;
                wrapper
            }
            Err(FrameError::ChecksumMismatch { carried, computed }) => {
                checksum_failures += 1;
                warn!(
                    "{} checksum mismatch (carried {}, computed {}), {} consecutive",
                    peer, carried, computed, checksum_failures
                );
                ctx.record(format!("checksum mismatch #{}", checksum_failures));
                if checksum_failures >= limits.checksum_close_after {
                    warn!("{} closing after {} checksum mismatches", peer, checksum_failures);
                    break 'session;
                }
                continue 'session;
            }
            Err(err) => {
                warn!("{} undecodable frame: {}", peer, err);
                ctx.record(format!("frame error: {}", err));
                let response =
                    error_frame(ctx.wire_session_id(), ErrorCode::FrameError, &err.to_string());
                if write_with_deadline(&mut writer, &response, &checksum, limits.write_deadline)
                    .await
                    .is_err()
                {
                    break 'session;
                }
                continue 'session;
            }
        };

        ctx.note_session_id(&wrapper);

        let response = match state {
            SessionState::Opening => {
                if wrapper.kind == MessageKind::Init {
                    state = SessionState::Established;
                    info!("{} session {} established", peer, wrapper.session_hex());
                    ctx.record("established".to_string());
                    wrapper.clone()
                } else {
                    warn!("{} sent {} before INIT", peer, wrapper.kind);
                    error_frame(wrapper.session_id, ErrorCode::FrameError, "INIT expected")
                }
            }
            SessionState::Established => match wrapper.kind {
                MessageKind::NfcData | MessageKind::Emulation => {
                    ctx.record(format!(
                        "{} frame, {} payload bytes",
                        wrapper.kind,
                        wrapper.payload.len()
                    ));
                    process_frame(
                        &wrapper,
                        &policy,
                        limits.frame_budget,
                        &peer,
                        &mut key_missing_logged,
                    )
                    .await
                }
                MessageKind::Config => {
                    apply_config(&wrapper, &policy, &peer, &mut ctx);
                    wrapper.clone()
                }
                MessageKind::Relay => {
                    ctx.record(format!("relayed {} payload bytes", wrapper.payload.len()));
                    wrapper.clone()
                }
                // HEARTBEAT answers HEARTBEAT; everything else passes
                // through with a recomputed checksum.
                _ => wrapper.clone(),
            },
        };

        match write_with_deadline(&mut writer, &response, &checksum, limits.write_deadline).await {
            Ok(()) => {}
            Err(WriteFailure::Deadline) => {
                warn!("{} write deadline exceeded, frame dropped", peer);
                ctx.record("write deadline exceeded, frame dropped".to_string());
                let notice =
                    error_frame(wrapper.session_id, ErrorCode::Timeout, "write deadline exceeded");
                if write_with_deadline(&mut writer, &notice, &checksum, limits.write_deadline)
                    .await
                    .is_err()
                {
                    break 'session;
                }
            }
            Err(WriteFailure::Io(err)) => {
                debug!("{} write failed: {}", peer, err);
                break 'session;
            }
        }
    }

    info!("{} session closed", peer);
    ctx.record("closed".to_string());
    ctx.drain_to(&sink);
}

async fn process_frame(
    wrapper: &Wrapper,
    policy: &Arc<PolicyStore>,
    budget: Duration,
    peer: &str,
    key_missing_logged: &mut bool,
) -> Wrapper {
    let snapshot = policy.read();
    let key_missing = snapshot.key.is_none() && snapshot.policy.mitm_enabled;
    let payload = wrapper.payload.clone();

    let task = tokio::task::spawn_blocking(move || process_nfc_payload(&payload, &snapshot));

    match timeout(budget, task).await {
        Err(_) => {
            warn!("{} frame budget exceeded, dropping frame", peer);
            error_frame(wrapper.session_id, ErrorCode::Timeout, "frame budget exceeded")
        }
        Ok(Err(join_err)) => {
            warn!("{} processing task failed: {}", peer, join_err);
            error_frame(wrapper.session_id, ErrorCode::Internal, "processing task failed")
        }
        Ok(Ok(Ok(outcome))) => {
            if key_missing && !*key_missing_logged {
                info!("{} no signing key loaded, responses are unsigned", peer);
                *key_missing_logged = true;
            }
            if outcome.high_risk {
                warn!("{} relaying a high-risk combination", peer);
            }
            Wrapper::new(wrapper.session_id, wrapper.kind, outcome.response.to_bytes())
        }
        Ok(Ok(Err(err))) => {
            warn!("{} NFC data rejected: {}", peer, err);
            error_frame(wrapper.session_id, err.wire_code(), &err.to_string())
        }
    }
}

fn apply_config(wrapper: &Wrapper, policy: &Arc<PolicyStore>, peer: &str, ctx: &mut SessionContext) {
    match serde_json::from_slice::<PolicyPatch>(&wrapper.payload) {
        Ok(patch) => {
            let patch = patch.config_frame_allowed();
            if patch.is_empty() {
                debug!("{} CONFIG frame carried no applicable fields", peer);
                return;
            }
            match policy.update(&patch) {
                Ok(()) => {
                    info!("{} CONFIG applied", peer);
                    ctx.record("config applied".to_string());
                }
                Err(err) => warn!("{} CONFIG rejected: {}", peer, err),
            }
        }
        Err(err) => warn!("{} CONFIG payload is not valid JSON: {}", peer, err),
    }
}

pub fn error_frame(
    session_id: [u8; SESSION_ID_LEN],
    code: ErrorCode,
    message: &str,
) -> Wrapper {
    Wrapper::new(session_id, MessageKind::Error, error_payload(code, message))
}

/// Read one length-delimited frame, rescanning for the magic so frame-level
/// garbage costs a frame, not the connection. `None` means a clean close.
async fn read_frame_bytes<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut window = [0u8; 4];
        let mut filled = 0usize;
        let mut skipped = 0usize;

        loop {
            if filled == 4 {
                if window == FRAME_MAGIC {
                    break;
                }
                window.rotate_left(1);
                filled = 3;
                skipped += 1;
            }

            let mut byte = [0u8; 1];
            match reader.read_exact(&mut byte).await {
                Ok(_) => {
                    window[filled] = byte[0];
                    filled += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err),
            }
        }

        if skipped > 0 {
            warn!("skipped {} bytes resynchronizing to the frame magic", skipped);
        }

        let mut length = [0u8; 4];
        match reader.read_exact(&mut length).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        let remainder = u32::from_be_bytes(length) as usize;
        if remainder < FRAME_OVERHEAD || remainder > MAX_FRAME_REMAINDER {
            warn!("frame length {} out of range, rescanning", remainder);
            continue;
        }

        let mut rest = vec![0u8; remainder];
        match reader.read_exact(&mut rest).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        let mut frame = Vec::with_capacity(8 + remainder);
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.extend_from_slice(&length);
        frame.extend_from_slice(&rest);
        return Ok(Some(frame));
    }
}

async fn write_with_deadline<W>(
    writer: &mut W,
    wrapper: &Wrapper,
    checksum: &dyn FrameChecksum,
    deadline: Duration,
) -> Result<(), WriteFailure>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(wrapper, checksum);

    match timeout(deadline, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    {
        Err(_) => Err(WriteFailure::Deadline),
        Ok(Err(err)) => Err(WriteFailure::Io(err)),
        Ok(Ok(())) => Ok(()),
    }
}

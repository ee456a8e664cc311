#![allow(dead_code)]

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mitmcore::frame::{
    decode_frame, encode_frame, Md5Checksum, MessageKind, Wrapper, SESSION_ID_LEN,
};
use mitmcore::policy::{PolicyState, PolicyStore};
use nfcgate_proxy::events::EventSink;
use nfcgate_proxy::server::Phase;
use nfcgate_proxy::session::{handle_session, SessionLimits};

pub fn session_id(seed: u8) -> [u8; SESSION_ID_LEN] {
    [seed; SESSION_ID_LEN]
}

pub fn wrapper(seed: u8, kind: MessageKind, payload: &[u8]) -> Wrapper {
    Wrapper::new(session_id(seed), kind, payload.to_vec())
}

pub async fn send(client: &mut DuplexStream, wrapper: &Wrapper) {
    let bytes = encode_frame(wrapper, &Md5Checksum);
    client.write_all(&bytes).await.unwrap();
}

pub async fn send_raw(client: &mut DuplexStream, bytes: &[u8]) {
    client.write_all(bytes).await.unwrap();
}

pub async fn recv(client: &mut DuplexStream) -> Wrapper {
    decode_frame(&recv_bytes(client).await, &Md5Checksum).unwrap()
}

pub async fn recv_bytes(client: &mut DuplexStream) -> Vec<u8> {
    let mut header = [0u8; 8];
    client.read_exact(&mut header).await.unwrap();

    let remainder = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut rest = vec![0u8; remainder];
    client.read_exact(&mut rest).await.unwrap();

    let mut frame = header.to_vec();
    frame.extend_from_slice(&rest);
    frame
}

pub struct SessionHarness {
    pub client: DuplexStream,
    pub task: JoinHandle<()>,
    pub phase_tx: watch::Sender<Phase>,
    pub sink: EventSink,
    pub policy: Arc<PolicyStore>,
}

/// Spin up one session pipeline over an in-memory duplex transport.
pub fn spawn_session(state: PolicyState, limits: SessionLimits) -> SessionHarness {
    let policy = Arc::new(PolicyStore::new(state).unwrap());
    spawn_session_with(Arc::clone(&policy), limits)
}

pub fn spawn_session_with(policy: Arc<PolicyStore>, limits: SessionLimits) -> SessionHarness {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    let sink = EventSink::new(256);

    let task = tokio::spawn(handle_session(
        server,
        "test-peer".to_string(),
        Arc::clone(&policy),
        sink.clone(),
        limits,
        phase_rx,
    ));

    SessionHarness {
        client,
        task,
        phase_tx,
        sink,
        policy,
    }
}

/// INIT handshake: send INIT, expect the echo, leave the session
/// established.
pub async fn establish(harness: &mut SessionHarness, seed: u8) {
    let init = wrapper(seed, MessageKind::Init, br#"{"device":"test"}"#);
    send(&mut harness.client, &init).await;
    let echo = recv(&mut harness.client).await;
    assert_eq!(echo.kind, MessageKind::Init);
    assert_eq!(echo.session_id, session_id(seed));
}

pub fn nfc_payload(tlv_hex: &str, seq: usize) -> Vec<u8> {
    format!(r#"{{"raw_tlv_hex":"{}","seq":{}}}"#, tlv_hex, seq).into_bytes()
}

pub fn response_json(wrapper: &Wrapper) -> serde_json::Value {
    serde_json::from_slice(&wrapper.payload).unwrap()
}

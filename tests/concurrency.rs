mod common;

use common::*;
use mitmcore::frame::MessageKind;
use mitmcore::policy::{PolicyState, PolicyStore};
use nfcgate_proxy::session::SessionLimits;
use std::sync::Arc;

// One distinct card per session so cross-talk would be visible in the
// outputs.
static CARDS: [&str; 4] = [
    "5A0841111111111111119F070100",
    "5A0855555555555544449F070108",
    "5A0837000000000000009F070100",
    "5A0862000011111111119F0701009F350122",
];

const FRAMES_PER_SESSION: usize = 6;

async fn run_session(policy: Arc<PolicyStore>, seed: u8, tlv_hex: &str) -> Vec<Vec<u8>> {
    let mut harness = spawn_session_with(policy, SessionLimits::default());
    establish(&mut harness, seed).await;

    let mut responses = Vec::new();
    for seq in 0..FRAMES_PER_SESSION {
        let request = wrapper(seed, MessageKind::NfcData, &nfc_payload(tlv_hex, seq));
        send(&mut harness.client, &request).await;
        responses.push(recv_bytes(&mut harness.client).await);
    }

    drop(harness.client);
    harness.task.await.unwrap();
    responses
}

/// K parallel sessions sending M frames each must produce byte-for-byte the
/// same outputs as the same sessions run alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_sessions_match_single_session_reference() {
    let policy = Arc::new(PolicyStore::new(PolicyState::default()).unwrap());

    // reference: each session run on its own
    let mut reference = Vec::new();
    for (i, card) in CARDS.iter().enumerate() {
        reference.push(run_session(Arc::clone(&policy), i as u8 + 1, card).await);
    }

    // same sessions, all at once
    let mut tasks = Vec::new();
    for (i, card) in CARDS.iter().enumerate() {
        let policy = Arc::clone(&policy);
        tasks.push(tokio::spawn(async move {
            run_session(policy, i as u8 + 1, card).await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let parallel = task.await.unwrap();
        assert_eq!(
            parallel, reference[i],
            "session {} diverged under concurrency",
            i
        );
    }
}

/// Shared policy reads under concurrent sessions see a coherent snapshot:
/// every response is either fully modified or fully untouched, never a mix.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn policy_snapshot_is_atomic_per_frame() {
    let policy = Arc::new(PolicyStore::new(PolicyState::default()).unwrap());

    let mut harness = spawn_session_with(Arc::clone(&policy), SessionLimits::default());
    establish(&mut harness, 9).await;

    let flipper = {
        let policy = Arc::clone(&policy);
        tokio::spawn(async move {
            for i in 0..40 {
                let patch = mitmcore::policy::PolicyPatch {
                    bypass_pin: Some(i % 2 == 0),
                    ..Default::default()
                };
                policy.update(&patch).unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
    };

    for seq in 0..20usize {
        let request = wrapper(9, MessageKind::NfcData, &nfc_payload(CARDS[0], seq));
        send(&mut harness.client, &request).await;
        let response = recv(&mut harness.client).await;
        assert_eq!(response.kind, MessageKind::NfcData);
        let body = response_json(&response);
        let modified = body["modified_tlv_hex"].as_str().unwrap();

        let has_cvm = modified.contains("9F34031F0300");
        let has_ctq = modified.contains("9F6C020000");
        // both PIN-bypass edits come from one snapshot: present together or
        // absent together
        assert_eq!(has_cvm, has_ctq, "frame {} saw a torn policy", seq);
        // the unconditional edits are always there
        assert!(modified.contains("95058000000000"));
    }

    flipper.await.unwrap();
}

//! Crash recovery between two gateways: transfers interrupted at known
//! points, then repaired by the client's or the server's crash manager.

mod common;

use std::time::Duration;

use satp_protocol::config::{SessionPolicy, SATP_VERSION};
use satp_protocol::crypto::{sign_object, GatewayKeypair};
use satp_protocol::log::{LocalLog, LogOperation, RemoteLog, LOG_TYPE_TRANSFER};
use satp_protocol::messages::{
    MessageType, Payload, RecoverRequest, RollbackRequest, SatpMessage, SignedLogEntry,
    TransferCommenceRequest,
};
use satp_protocol::orchestrator::MessageHandler;
use satp_protocol::recovery::RecoveryReport;
use satp_protocol::session::SessionState;
use satp_protocol::SatpError;

use common::*;

fn failed_session_id(err: SatpError) -> String {
    match err {
        SatpError::RetryExhausted { session_id, .. } => session_id,
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
}

/// Sessions go stale quickly, so the server's scan takes them over.
fn short_policy() -> SessionPolicy {
    let mut policy = policy();
    policy.max_timeout_ms = 300;
    policy
}

async fn wait_until_stale() {
    tokio::time::sleep(Duration::from_millis(350)).await;
}

/// A message for `session_id` between A and B, signed by `sender_id`.
fn signed_by(sender_id: &str, keypair: &GatewayKeypair, session_id: &str, payload: Payload) -> SatpMessage {
    let mut message = SatpMessage {
        version: SATP_VERSION.into(),
        message_type: payload.message_type(),
        session_id: session_id.into(),
        context_id: "ctx-1".into(),
        sequence_number: 99,
        client_pubkey: keypair_a().public_key(),
        server_pubkey: keypair_b().public_key(),
        sender_gateway_id: sender_id.into(),
        hash_previous_message: String::new(),
        payload,
        signature: None,
    };
    sign_object(keypair, &mut message).unwrap();
    message
}

fn error_kind(reply: &SatpMessage) -> &str {
    match &reply.payload {
        Payload::Error(error) => &error.kind,
        other => panic!("expected an error reply, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Before the point of no return
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_after_lock_is_rolled_back() {
    let bed = Testbed::new();
    bed.net.drop_messages("gw-b", MessageType::LockAssertionRequest);

    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());
    // Escrow taken, nothing minted yet.
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 900);
    assert_eq!(bed.besu.bridge_balance(TOKEN), 100);

    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.detected, vec![session_id.clone()]);
    assert_eq!(report.rolled_back, vec![session_id.clone()]);
    assert!(report.pending.is_empty());

    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.besu.allowance_of(ALICE, TOKEN), 100);
    assert_eq!(bed.besu.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 0);

    assert_eq!(
        bed.a.session_status(&session_id).unwrap().state,
        SessionState::RolledBack
    );
    assert!(!bed.a.crash_manager().is_tracked(&session_id));
    assert_eq!(bed.a.monitor().rollbacks.get(), 1);
}

#[tokio::test]
async fn rollback_is_not_repeated() {
    let bed = Testbed::new();
    bed.net.drop_messages("gw-b", MessageType::LockAssertionRequest);
    bed.a.transact(transfer(100)).await.unwrap_err();

    bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    let again = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(again, RecoveryReport::default());

    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.a.monitor().rollbacks.get(), 1);
}

#[tokio::test]
async fn rolled_back_session_refuses_further_requests() {
    let bed = Testbed::new();
    bed.net.drop_messages("gw-b", MessageType::LockAssertionRequest);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());
    bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(
        bed.b.session_status(&session_id).unwrap().state,
        SessionState::RolledBack
    );

    let late = signed_by(
        "gw-a",
        &keypair_a(),
        &session_id,
        Payload::TransferCommenceRequest(TransferCommenceRequest {}),
    );
    let reply = bed.b.handle(late).await;
    assert_eq!(error_kind(&reply), "session_closed");
    assert_eq!(
        bed.b.session_status(&session_id).unwrap().state,
        SessionState::RolledBack
    );
}

#[tokio::test]
async fn rollback_waits_for_an_unreachable_counterparty() {
    let bed = Testbed::new();
    bed.net.drop_messages("gw-b", MessageType::CommitPreparationRequest);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());

    // Commit preparation was requested, so the server may have minted: the
    // client cannot unlock alone.
    bed.net.set_reachable("gw-b", false);
    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.pending, vec![session_id.clone()]);
    assert!(bed.a.crash_manager().is_tracked(&session_id));
    assert_eq!(bed.besu.bridge_balance(TOKEN), 100);

    bed.net.heal("gw-b");
    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_back, vec![session_id]);
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);
}

// ---------------------------------------------------------------------------
// Past the point of no return
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_after_burn_is_rolled_forward() {
    let bed = Testbed::new();
    bed.net.drop_messages("gw-b", MessageType::CommitFinalAssertionRequest);

    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());
    // Burned on Besu, minted but not yet assigned on Fabric.
    assert_eq!(bed.besu.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 100);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 0);

    bed.net.heal("gw-b");
    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_forward, vec![session_id.clone()]);

    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 900);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);
    assert_eq!(
        bed.a.session_status(&session_id).unwrap().state,
        SessionState::Completed
    );
    assert_eq!(
        bed.b.session_status(&session_id).unwrap().state,
        SessionState::Completed
    );
    assert_eq!(bed.a.monitor().roll_forwards.get(), 1);
}

#[tokio::test]
async fn third_gateway_cannot_roll_back_or_feed_logs() {
    let mut server = config_b(policy());
    server.known_gateways.push(identity_c());
    let bed = Testbed::with_configs(config_a(policy()), server);
    bed.net.drop_messages("gw-b", MessageType::CommitFinalAssertionRequest);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());
    assert_eq!(bed.besu.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 100);

    // Gateway C is known to B and signs correctly, but is not A.
    let rollback = signed_by(
        "gw-c",
        &keypair_c(),
        &session_id,
        Payload::RollbackRequest(RollbackRequest {
            reason: "recovery".into(),
        }),
    );
    let reply = bed.b.handle(rollback).await;
    assert_eq!(error_kind(&reply), "validation");
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 100);

    let log = LocalLog::new(session_id.clone(), LOG_TYPE_TRANSFER, LogOperation::Done, "{}".into(), 1);
    let proof = RemoteLog::sign(&log, &keypair_c()).unwrap();
    let recover = signed_by(
        "gw-c",
        &keypair_c(),
        &session_id,
        Payload::RecoverRequest(RecoverRequest {
            logs: vec![SignedLogEntry { log, proof }],
        }),
    );
    let reply = bed.b.handle(recover).await;
    assert_eq!(error_kind(&reply), "validation");
    assert!(bed
        .b
        .manager()
        .logs()
        .read_remote_by_session(&session_id)
        .unwrap()
        .is_empty());

    // The real client still finishes the transfer.
    bed.net.heal("gw-b");
    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_forward, vec![session_id]);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);
}

// ---------------------------------------------------------------------------
// Server-side recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_burns_its_mint_when_the_client_never_burned() {
    let bed = Testbed::with_policy(short_policy());
    // B mints, but A never learns of it.
    bed.net.drop_replies("gw-b", MessageType::CommitReadyResponse);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());
    assert_eq!(bed.besu.bridge_balance(TOKEN), 100);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 100);

    wait_until_stale().await;
    let report = bed.b.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.detected, vec![session_id.clone()]);
    assert_eq!(report.rolled_back, vec![session_id.clone()]);

    // B asked A to unlock before burning its own mint.
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.besu.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 0);
    assert_eq!(
        bed.a.session_status(&session_id).unwrap().state,
        SessionState::RolledBack
    );
    assert_eq!(
        bed.b.session_status(&session_id).unwrap().state,
        SessionState::RolledBack
    );
    assert_eq!(bed.b.monitor().rollbacks.get(), 1);
}

#[tokio::test]
async fn server_assigns_when_the_client_already_burned() {
    let bed = Testbed::with_policy(short_policy());
    bed.net.drop_messages("gw-b", MessageType::CommitFinalAssertionRequest);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());

    wait_until_stale().await;
    let report = bed.b.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_forward, vec![session_id.clone()]);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);
    assert_eq!(
        bed.b.session_status(&session_id).unwrap().state,
        SessionState::Completed
    );

    // The client's own roll forward replays the commit tail against the
    // closed session without moving funds twice.
    bed.net.heal("gw-b");
    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_forward, vec![session_id.clone()]);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 900);
    assert_eq!(
        bed.a.session_status(&session_id).unwrap().state,
        SessionState::Completed
    );
}

#[tokio::test]
async fn server_waits_while_the_client_is_unreachable() {
    let bed = Testbed::with_policy(short_policy());
    bed.net.drop_replies("gw-b", MessageType::CommitReadyResponse);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());

    wait_until_stale().await;
    bed.net.set_reachable("gw-a", false);
    let report = bed.b.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.pending, vec![session_id.clone()]);
    assert!(bed.b.crash_manager().is_tracked(&session_id));
    // Without the client's log B cannot tell whether A burned.
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 100);
    assert_eq!(bed.besu.bridge_balance(TOKEN), 100);

    bed.net.heal("gw-a");
    let report = bed.b.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_back, vec![session_id.clone()]);
    assert!(!bed.b.crash_manager().is_tracked(&session_id));
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);
}

// ---------------------------------------------------------------------------
// Scan robustness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreadable_session_does_not_stop_the_scan() {
    let bed = Testbed::new();
    let broken = LocalLog::new("broken", LOG_TYPE_TRANSFER, LogOperation::Init, "not json".into(), 1);
    bed.a.manager().logs().append(&broken).unwrap();

    bed.net.drop_messages("gw-b", MessageType::LockAssertionRequest);
    let session_id = failed_session_id(bed.a.transact(transfer(100)).await.unwrap_err());

    let report = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_back, vec![session_id]);
    assert!(!bed.a.crash_manager().is_tracked("broken"));
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);

    let again = bed.a.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(again, RecoveryReport::default());
}

// ---------------------------------------------------------------------------
// Restart & scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restarted_gateway_recovers_from_its_log() {
    let dir = tempfile::tempdir().unwrap();
    let bed = Testbed::new();
    bed.net.drop_messages("gw-b", MessageType::LockAssertionRequest);

    // A gateway with a durable log fails mid-transfer, then goes away.
    let durable = gateway_a(&bed.net, &bed.besu, policy(), sled_at(&dir.path().join("log")));
    let session_id = failed_session_id(durable.transact(transfer(100)).await.unwrap_err());
    durable.shutdown().await.unwrap();
    drop(durable);
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 900);

    // Same identity, same ledger, same log directory.
    let restarted = gateway_a(&bed.net, &bed.besu, policy(), sled_at(&dir.path().join("log")));
    assert!(restarted.manager().get_session(&session_id).is_none());
    let report = restarted.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(report.rolled_back, vec![session_id.clone()]);

    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(
        restarted.session_status(&session_id).unwrap().state,
        SessionState::RolledBack
    );
    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn scheduler_start_and_stop_are_idempotent() {
    let bed = Testbed::new();
    let crash_manager = bed.a.crash_manager();

    crash_manager.stop_scheduler().await;
    assert!(!crash_manager.is_scheduler_running().await);

    crash_manager.start_scheduler().await;
    crash_manager.start_scheduler().await;
    assert!(crash_manager.is_scheduler_running().await);

    crash_manager.stop_scheduler().await;
    crash_manager.stop_scheduler().await;
    assert!(!crash_manager.is_scheduler_running().await);
}

#[tokio::test]
async fn scheduler_repairs_sessions_on_its_own() {
    let mut policy = policy();
    policy.max_timeout_ms = 300;
    let bed = Testbed::with_policy(policy);
    bed.net.drop_messages("gw-b", MessageType::LockAssertionRequest);
    bed.a.transact(transfer(100)).await.unwrap_err();

    let crash_manager = bed.a.crash_manager().clone();
    crash_manager.start_scheduler().await;

    let mut restored = false;
    for _ in 0..100 {
        if bed.besu.balance_of(ALICE, TOKEN) == 1_000 {
            restored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    crash_manager.stop_scheduler().await;
    assert!(restored, "scheduled scan never rolled the session back");
}

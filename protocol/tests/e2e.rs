//! End-to-end transfers between two gateways.
//!
//! Each test builds its own pair of gateways over the in-process network,
//! each with a temporary log store, so nothing is shared between tests.

mod common;

use std::time::{Duration, Instant};

use satp_protocol::config::SATP_VERSION;
use satp_protocol::crosschain::LeafRegistry;
use satp_protocol::messages::{MessageType, NewSessionRequest, Payload, SatpMessage};
use satp_protocol::orchestrator::MessageHandler;
use satp_protocol::session::SessionState;
use satp_protocol::{Gateway, SatpError};

use common::*;

// ---------------------------------------------------------------------------
// 1. Happy Path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn besu_to_fabric_transfer_completes() {
    let bed = Testbed::new();

    let response = bed.a.transact(transfer(100)).await.unwrap();
    assert_eq!(response.status, SessionState::Completed);

    // Sender debited, beneficiary credited, nothing left in escrow.
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 900);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
    assert_eq!(bed.besu.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.bridge_balance(TOKEN), 0);

    let client = bed.a.session_status(&response.session_id).unwrap();
    assert_eq!(client.state, SessionState::Completed);
    assert_eq!(client.completed_stages, 4);
    let server = bed.b.session_status(&response.session_id).unwrap();
    assert_eq!(server.state, SessionState::Completed);
    assert_eq!(server.last_sequence_number, client.last_sequence_number);

    assert_eq!(bed.a.monitor().sessions_completed.get(), 1);
    assert_eq!(bed.b.monitor().sessions_completed.get(), 1);
    assert_eq!(bed.a.monitor().sessions_failed.get(), 0);
}

#[tokio::test]
async fn completed_session_is_readable_from_the_log() {
    let bed = Testbed::new();
    let response = bed.a.transact(transfer(100)).await.unwrap();

    bed.a.manager().remove_session(&response.session_id);
    let status = bed.a.session_status(&response.session_id).unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(status.amount, 100);

    let by_context = bed.b.sessions_by_context("ctx-1");
    assert_eq!(by_context.len(), 1);
    assert_eq!(by_context[0].session_id, response.session_id);
}

#[tokio::test]
async fn destination_gateway_prunes_closed_sessions() {
    let mut server = config_b(policy());
    server.completed_session_ttl_ms = 0;
    let bed = Testbed::with_configs(config_a(policy()), server);

    let first = bed.a.transact(transfer(50)).await.unwrap();
    assert_eq!(bed.b.manager().active_session_count(), 1);

    // The next inbound request clears the first session out.
    let second = bed.a.transact(transfer(50)).await.unwrap();
    assert!(bed.b.manager().get_session(&first.session_id).is_none());
    assert_eq!(bed.b.manager().active_session_count(), 1);

    // So does a crash scan, with no traffic at all.
    bed.b.crash_manager().check_and_resolve_crashes().await.unwrap();
    assert_eq!(bed.b.manager().active_session_count(), 0);

    let status = bed.b.session_status(&second.session_id).unwrap();
    assert_eq!(status.state, SessionState::Completed);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
}

// ---------------------------------------------------------------------------
// 2. Rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_rejects_before_anything_is_logged() {
    let bed = Testbed::new();

    let mut mismatched = transfer(100);
    mismatched.receiver_amount = 99;
    assert!(matches!(
        bed.a.transact(mismatched).await,
        Err(SatpError::Validation(_))
    ));

    let mut unknown_destination = transfer(100);
    unknown_destination.receiver_asset.network = "polygon".into();
    assert!(matches!(
        bed.a.transact(unknown_destination).await,
        Err(SatpError::Validation(_))
    ));

    let mut blank_context = transfer(100);
    blank_context.context_id = "  ".into();
    assert!(matches!(
        bed.a.transact(blank_context).await,
        Err(SatpError::Validation(_))
    ));

    assert!(bed.a.manager().logs().session_ids().unwrap().is_empty());
    assert_eq!(bed.a.monitor().sessions_started.get(), 0);
}

#[tokio::test]
async fn gateway_serving_both_networks_refuses_the_transfer() {
    let bed = Testbed::new();
    let both = Gateway::from_parts(
        &config_a(policy()),
        keypair_a(),
        bed.net.clone(),
        LeafRegistry::new().with(bed.besu.clone()).with(bed.fabric.clone()),
        temporary_log(),
    )
    .unwrap();

    let err = both.transact(transfer(100)).await.unwrap_err();
    assert!(
        matches!(&err, SatpError::Validation(reason) if reason.contains("its own counterparty")),
        "unexpected error: {err:?}"
    );
    assert!(both.manager().logs().session_ids().unwrap().is_empty());
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 0);
}

#[tokio::test]
async fn amount_above_allowance_exhausts_retries_without_moving_funds() {
    let bed = Testbed::new();

    let err = bed.a.transact(transfer(500)).await.unwrap_err();
    let SatpError::RetryExhausted { last_error, .. } = err else {
        panic!("expected retry exhaustion, got {err:?}");
    };
    assert!(matches!(*last_error, SatpError::Ledger(_)));

    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
    assert_eq!(bed.besu.allowance_of(ALICE, TOKEN), 100);
    assert_eq!(bed.besu.bridge_balance(TOKEN), 0);
    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 0);
    assert_eq!(bed.a.manager().active_session_count(), 0);
    assert_eq!(bed.a.monitor().sessions_failed.get(), 1);
}

#[tokio::test]
async fn unreachable_counterparty_fails_within_the_budget() {
    let bed = Testbed::with_policy(satp_protocol::config::SessionPolicy {
        max_retries: 3,
        max_timeout_ms: 100,
        attempt_timeout_ms: 50,
        retry_backoff_ms: 5,
    });
    bed.net.set_reachable("gw-b", false);

    let started = Instant::now();
    let err = bed.a.transact(transfer(100)).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    let SatpError::RetryExhausted { session_id, attempts, .. } = err else {
        panic!("expected retry exhaustion, got {err:?}");
    };
    assert!(attempts <= 4);
    assert!(bed.a.manager().get_session(&session_id).is_none());
    assert_eq!(
        bed.a.session_status(&session_id).unwrap().state,
        SessionState::Failed
    );
    assert_eq!(bed.besu.balance_of(ALICE, TOKEN), 1_000);
}

// ---------------------------------------------------------------------------
// 3. Isolation & Redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_transfers_stay_independent() {
    let bed = Testbed::new();
    bed.besu.credit("carol", TOKEN, 50);
    bed.besu.approve("carol", TOKEN, 50);

    let (first, second) = tokio::join!(
        bed.a.transact(transfer(100)),
        bed.a.transact(transfer_between("carol", "dave", 50)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.session_id, second.session_id);

    assert_eq!(bed.fabric.balance_of(BOB, TOKEN), 100);
    assert_eq!(bed.fabric.balance_of("dave", TOKEN), 50);
    assert_eq!(bed.besu.balance_of("carol", TOKEN), 0);

    // Each gateway keeps its own metrics.
    assert_eq!(bed.a.monitor().sessions_started.get(), 2);
    assert_eq!(bed.b.monitor().sessions_started.get(), 0);
    assert_eq!(bed.b.monitor().sessions_completed.get(), 2);
}

#[tokio::test]
async fn duplicate_delivery_gets_the_cached_reply() {
    let bed = Testbed::new();
    let request = SatpMessage {
        version: SATP_VERSION.into(),
        message_type: MessageType::NewSessionRequest,
        session_id: "dup-1".into(),
        context_id: "ctx-dup".into(),
        sequence_number: 1,
        client_pubkey: keypair_a().public_key(),
        server_pubkey: keypair_b().public_key(),
        sender_gateway_id: String::new(),
        hash_previous_message: String::new(),
        payload: Payload::NewSessionRequest(NewSessionRequest {
            sender_gateway_network_id: BESU.into(),
            recipient_gateway_network_id: FABRIC.into(),
            max_retries: 3,
            max_timeout_ms: 2_000,
        }),
        signature: None,
    };
    let request = bed.a.manager().orchestrator().sign_message(request).unwrap();

    let first = bed.b.handle(request.clone()).await;
    let second = bed.b.handle(request).await;
    assert_eq!(first.message_type, MessageType::NewSessionResponse);
    assert_eq!(first, second);

    let status = bed.b.session_status("dup-1").unwrap();
    assert_eq!(status.last_sequence_number, 1);
}

#[tokio::test]
async fn forged_request_is_answered_with_an_error() {
    let bed = Testbed::new();
    let mut request = SatpMessage {
        version: SATP_VERSION.into(),
        message_type: MessageType::NewSessionRequest,
        session_id: "forged".into(),
        context_id: "ctx".into(),
        sequence_number: 1,
        client_pubkey: keypair_a().public_key(),
        server_pubkey: keypair_b().public_key(),
        sender_gateway_id: String::new(),
        hash_previous_message: String::new(),
        payload: Payload::NewSessionRequest(NewSessionRequest {
            sender_gateway_network_id: BESU.into(),
            recipient_gateway_network_id: FABRIC.into(),
            max_retries: 3,
            max_timeout_ms: 2_000,
        }),
        signature: None,
    };
    request = bed.a.manager().orchestrator().sign_message(request).unwrap();
    request.sequence_number = 2;

    let reply = bed.b.handle(request).await;
    assert_eq!(reply.message_type, MessageType::Error);
    assert!(bed.b.manager().get_session("forged").is_none());
}

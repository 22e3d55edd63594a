//! Client side of a transfer: validation, the stage driver and the commit
//! tail shared with recovery.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manager::SatpManager;
use super::request::{TransactRequest, TransactResponse};
use super::retry::{with_retries, RetryBudget};
use super::SatpError;
use crate::crosschain::{LedgerEffect, LedgerOperation};
use crate::identity::GatewayIdentity;
use crate::log::{LogOperation, LOG_TYPE_TRANSFER, LOG_TYPE_TRANSFER_COMPLETE};
use crate::messages::{
    CommitFinalAssertionRequest, CommitPreparationRequest, LockAssertionRequest, MessageType,
    NewSessionRequest, Payload, PreTransferRequest, SatpMessage, TransferCommenceRequest,
    TransferCompleteRequest, TransferProposalRequest,
};
use crate::session::{Role, Session, SessionParams, SessionState, SharedSession};

impl SatpManager {
    // -----------------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------------

    /// Run a transfer to completion as the client gateway.
    ///
    /// Validation failures return before anything is logged. Once the
    /// session exists, a failure that exhausts the retry budget marks it
    /// `Failed`, writes its `transfer/fail` entry and removes it from the
    /// active map; the crash manager decides later whether to roll it back.
    pub async fn transact(&self, request: TransactRequest) -> Result<TransactResponse, SatpError> {
        self.prune_completed();
        let (server, mut params) = self.validate_transact(&request)?;

        // Each leg needs its own wrapped-asset id on its ledger.
        let session_id = Uuid::new_v4().to_string();
        for (asset, leg) in [
            (params.sender_asset.as_mut(), "source"),
            (params.receiver_asset.as_mut(), "receiver"),
        ] {
            if let Some(asset) = asset.filter(|a| a.token_id.is_empty()) {
                asset.token_id = format!("{}-{}", session_id, leg);
            }
        }
        let session = Session::with_id(&session_id, &request.context_id, Role::Client, &params);
        let shared = self.insert_session(session);
        self.monitor().sessions_started.inc();
        info!(
            session_id = %session_id,
            context_id = %request.context_id,
            counterparty = %server.id,
            amount = request.source_amount,
            "transfer started"
        );

        let started = Instant::now();
        let budget = RetryBudget::new(
            params.max_retries,
            Duration::from_millis(params.max_timeout_ms),
            self.policy(),
        );
        let outcome = match self.log_current(&shared, Role::Client, LOG_TYPE_TRANSFER, LogOperation::Init) {
            Ok(_) => self.run_client(&shared, &server.id, &budget).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.monitor()
                    .transfer_latency_seconds
                    .observe(elapsed.as_secs_f64());
                self.monitor().sessions_completed.inc();
                info!(session_id = %session_id, elapsed_ms = elapsed.as_millis() as u64, "transfer completed");
                Ok(TransactResponse {
                    session_id,
                    status: SessionState::Completed,
                })
            }
            Err(e) if shared.lock().is_recovering() => {
                warn!(session_id = %session_id, "transfer handed over to recovery: {}", e);
                Err(e)
            }
            Err(e) => {
                self.fail_session(&shared, Role::Client, &e);
                Err(e)
            }
        }
    }

    fn validate_transact(
        &self,
        request: &TransactRequest,
    ) -> Result<(GatewayIdentity, SessionParams), SatpError> {
        let invalid = |msg: String| -> Result<(GatewayIdentity, SessionParams), SatpError> {
            Err(SatpError::Validation(msg))
        };
        if request.context_id.trim().is_empty() {
            return invalid("context_id is required".into());
        }
        if request.sender.is_empty() || request.receiver.is_empty() {
            return invalid("sender and receiver are required".into());
        }
        if request.source_amount == 0 || request.receiver_amount == 0 {
            return invalid("amounts must be positive".into());
        }
        if request.source_amount != request.receiver_amount {
            return invalid(format!(
                "source amount {} differs from receiver amount {}",
                request.source_amount, request.receiver_amount
            ));
        }
        let source_network = &request.source_asset.network;
        let destination_network = &request.receiver_asset.network;
        if !self.ledgers().serves(source_network) {
            return invalid(format!("no local ledger for source network {}", source_network));
        }
        if self.ledgers().serves(destination_network) {
            return invalid(format!(
                "destination network {} is served by this gateway, which cannot be its own counterparty",
                destination_network
            ));
        }
        let server = self
            .orchestrator()
            .gateway_for_network(destination_network)
            .cloned()
            .ok_or_else(|| {
                SatpError::Validation(format!(
                    "no known gateway for destination network {}",
                    destination_network
                ))
            })?;

        let mut sender_asset = request.source_asset.clone();
        sender_asset.amount = request.source_amount;
        sender_asset.owner = request.sender.clone();
        let mut receiver_asset = request.receiver_asset.clone();
        receiver_asset.amount = request.receiver_amount;
        receiver_asset.owner = request.receiver.clone();

        let mut params = SessionParams::new(
            self.orchestrator().public_key(),
            server.pubkey.clone(),
            source_network.clone(),
            destination_network.clone(),
        )
        .with_policy(self.policy());
        params.sender_asset = Some(sender_asset);
        params.receiver_asset = Some(receiver_asset);
        params.originator = request.sender.clone();
        params.beneficiary = request.receiver.clone();
        Ok((server, params))
    }

    // -----------------------------------------------------------------------
    // Stage driver
    // -----------------------------------------------------------------------

    async fn run_client(
        &self,
        session: &SharedSession,
        server_id: &str,
        budget: &RetryBudget,
    ) -> Result<(), SatpError> {
        let data = session.lock().client_data()?.clone();
        let (sender_asset, receiver_asset) = match (&data.sender_asset, &data.receiver_asset) {
            (Some(s), Some(r)) => (s.clone(), r.clone()),
            _ => return Err(SatpError::Validation("session has no assets".into())),
        };
        let network = data.sender_gateway_network_id.clone();

        // Stage 0
        let new_session = NewSessionRequest {
            sender_gateway_network_id: data.sender_gateway_network_id.clone(),
            recipient_gateway_network_id: data.recipient_gateway_network_id.clone(),
            max_retries: data.max_retries,
            max_timeout_ms: data.max_timeout_ms,
        };
        self.exchange(session, server_id, budget, Payload::NewSessionRequest(new_session), None)
            .await?;
        let pre_transfer = PreTransferRequest {
            sender_asset: sender_asset.clone(),
            receiver_asset: receiver_asset.clone(),
            originator: data.originator.clone(),
            beneficiary: data.beneficiary.clone(),
        };
        self.exchange(session, server_id, budget, Payload::PreTransferRequest(pre_transfer), None)
            .await?;
        self.ledger_step(session, Role::Client, &network, LedgerEffect::Wrap(sender_asset.clone()), Some(budget))
            .await?;

        // Stage 1
        let proposal = TransferProposalRequest {
            originator: data.originator.clone(),
            beneficiary: data.beneficiary.clone(),
            sender_gateway_network_id: data.sender_gateway_network_id.clone(),
            recipient_gateway_network_id: data.recipient_gateway_network_id.clone(),
            token_type: sender_asset.token_type.clone(),
            amount: sender_asset.amount,
        };
        self.exchange(
            session,
            server_id,
            budget,
            Payload::TransferProposalRequest(proposal),
            Some(SessionState::TransferProposed),
        )
        .await?;
        self.exchange(
            session,
            server_id,
            budget,
            Payload::TransferCommenceRequest(TransferCommenceRequest {}),
            None,
        )
        .await?;

        // Stage 2
        let lock = self
            .ledger_step(
                session,
                Role::Client,
                &network,
                LedgerEffect::Lock {
                    asset_id: sender_asset.token_id.clone(),
                    amount: sender_asset.amount,
                },
                Some(budget),
            )
            .await?;
        let assertion = LockAssertionRequest {
            asset_id: sender_asset.token_id.clone(),
            amount: sender_asset.amount,
            lock_tx_id: lock.tx_id,
        };
        self.exchange(
            session,
            server_id,
            budget,
            Payload::LockAssertionRequest(assertion),
            Some(SessionState::Locked),
        )
        .await?;

        // Stage 3
        self.exchange(
            session,
            server_id,
            budget,
            Payload::CommitPreparationRequest(CommitPreparationRequest {}),
            Some(SessionState::CommitPreparing),
        )
        .await?;
        let burn = self
            .ledger_step(
                session,
                Role::Client,
                &network,
                LedgerEffect::Burn {
                    asset_id: sender_asset.token_id.clone(),
                    amount: sender_asset.amount,
                },
                Some(budget),
            )
            .await?;
        self.finish_commit(session, server_id, budget, burn.tx_id).await
    }

    /// Everything after the client burn: the final assertion, the
    /// completion exchange and the terminal log entry. Steps whose hashes
    /// are already recorded are skipped, so recovery can call this to roll
    /// a session forward.
    pub(crate) async fn finish_commit(
        &self,
        session: &SharedSession,
        server_id: &str,
        budget: &RetryBudget,
        burn_tx_id: String,
    ) -> Result<(), SatpError> {
        let (asserted, completed) = {
            let guard = session.lock();
            let data = guard.client_data()?;
            (
                data.hash_of(MessageType::CommitFinalAcknowledgementReceipt).is_some(),
                data.hash_of(MessageType::TransferCompleteResponse).is_some(),
            )
        };
        if !asserted {
            self.exchange(
                session,
                server_id,
                budget,
                Payload::CommitFinalAssertionRequest(CommitFinalAssertionRequest { burn_tx_id }),
                None,
            )
            .await?;
        }
        if !completed {
            self.exchange(
                session,
                server_id,
                budget,
                Payload::TransferCompleteRequest(TransferCompleteRequest {}),
                Some(SessionState::Completed),
            )
            .await?;
        }
        self.commit(session, Role::Client, LOG_TYPE_TRANSFER_COMPLETE, None, |data| {
            data.state = SessionState::Completed;
            Ok(())
        })?;
        session.lock().set_state(SessionState::Completed);
        Ok(())
    }

    /// Roll a client session forward from its burn, repeating the burn if
    /// its receipt never made it to the log. Used by the crash manager once
    /// the point of no return is behind the session.
    pub(crate) async fn resume_commit(&self, session: &SharedSession) -> Result<(), SatpError> {
        let data = {
            let mut guard = session.lock();
            let data = guard.client_data_mut()?;
            data.retry_count = 0;
            data.clone()
        };
        let server = self.orchestrator().get_counterparty(&data)?.id.clone();
        let budget = RetryBudget::new(
            data.max_retries,
            Duration::from_millis(data.max_timeout_ms),
            self.policy(),
        );
        info!(session_id = %data.id, counterparty = %server, "resuming commit");

        let burn_tx_id = match data.receipts.get(&LedgerOperation::Burn.to_string()) {
            Some(tx_id) => tx_id.clone(),
            None => {
                let asset = data.sender_asset.as_ref().ok_or_else(|| {
                    SatpError::Transact(format!("session {} has no sender asset", data.id))
                })?;
                let effect = LedgerEffect::Burn {
                    asset_id: asset.token_id.clone(),
                    amount: asset.amount,
                };
                self.ledger_step(session, Role::Client, &data.sender_gateway_network_id, effect, Some(&budget))
                    .await?
                    .tx_id
            }
        };
        self.finish_commit(session, &server, &budget, burn_tx_id).await
    }

    // -----------------------------------------------------------------------
    // One request/response step
    // -----------------------------------------------------------------------

    /// Send one stage request and record both hashes.
    ///
    /// The request is built, signed and logged `{type}/init` once; retries
    /// and resumed sessions resend the same signed message. The reply must
    /// be the expected positive reply, echo the request's sequence number
    /// and chain the request's hash. Both hashes (and `next_state`, if any)
    /// are committed under `{type}/done`.
    async fn exchange(
        &self,
        session: &SharedSession,
        server_id: &str,
        budget: &RetryBudget,
        payload: Payload,
        next_state: Option<SessionState>,
    ) -> Result<SatpMessage, SatpError> {
        let message_type = payload.message_type();
        let request = self.outbound_message(session, payload)?;
        let request_hash = request.hash()?;

        let (sent, sent_hash) = (&request, &request_hash);
        let reply = with_retries(
            session,
            Role::Client,
            budget,
            self.monitor(),
            message_type.log_type(),
            move |timeout| async move {
                let reply = self.orchestrator().send_message(server_id, sent, timeout).await?;
                self.monitor().record_message("sent", message_type);
                check_reply(sent, sent_hash, &reply)?;
                Ok(reply)
            },
        )
        .await?;

        let reply_hash = reply.hash()?;
        let reply_type = reply.message_type;
        self.commit(session, Role::Client, message_type.log_type(), None, |data| {
            data.set_hash(message_type, request_hash.clone())?;
            data.set_hash(reply_type, reply_hash.clone())?;
            if let Some(state) = next_state {
                data.state = state;
            }
            Ok(())
        })?;
        debug!(
            session_id = %request.session_id,
            stage = message_type.stage().unwrap_or_default(),
            message_type = %message_type,
            "step complete"
        );
        Ok(reply)
    }

    /// The signed request for `payload`'s type: the one already sent for
    /// this session, or a new one under the next sequence number.
    fn outbound_message(&self, session: &SharedSession, payload: Payload) -> Result<SatpMessage, SatpError> {
        let message_type = payload.message_type();
        if let Some(existing) = session.lock().outbound(message_type).cloned() {
            return Ok(existing);
        }

        let (unsigned, snapshot) = {
            let mut guard = session.lock();
            let data = guard.client_data_mut()?;
            data.next_sequence_number();
            (SatpMessage::for_session(data, payload), data.clone())
        };
        let signed = self.orchestrator().sign_message(unsigned)?;
        self.log_step(&snapshot, message_type.log_type(), LogOperation::Init, Some(&signed))?;
        session.lock().remember_outbound(signed.clone());
        Ok(signed)
    }
}

/// Reply checks beyond the signature, which the orchestrator verifies.
fn check_reply(request: &SatpMessage, request_hash: &str, reply: &SatpMessage) -> Result<(), SatpError> {
    if let Payload::TransferProposalReject(reject) = &reply.payload {
        return Err(SatpError::Rejected(format!("transfer proposal rejected: {}", reject.reason)));
    }
    let expected = request.message_type.expected_replies();
    if !expected.contains(&reply.message_type) {
        return Err(SatpError::Rejected(format!(
            "unexpected {} in reply to {}",
            reply.message_type, request.message_type
        )));
    }
    if reply.sequence_number != request.sequence_number {
        return Err(SatpError::Rejected(format!(
            "reply carries sequence {} for request {}",
            reply.sequence_number, request.sequence_number
        )));
    }
    if reply.hash_previous_message != request_hash {
        return Err(SatpError::Rejected(format!(
            "{} does not chain the hash of {}",
            reply.message_type, request.message_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GatewayKeypair;
    use crate::messages::{NewSessionResponse, TransferProposalReject};
    use crate::session::{SessionData, SessionParams};

    fn request() -> SatpMessage {
        let data = SessionData::new(
            "s".into(),
            "c".into(),
            Role::Client,
            &SessionParams::new(
                GatewayKeypair::from_seed(&[1; 32]).public_key(),
                GatewayKeypair::from_seed(&[2; 32]).public_key(),
                "besu",
                "fabric",
            ),
        );
        let mut msg = SatpMessage::for_session(
            &data,
            Payload::NewSessionRequest(NewSessionRequest {
                sender_gateway_network_id: "besu".into(),
                recipient_gateway_network_id: "fabric".into(),
                max_retries: 3,
                max_timeout_ms: 1000,
            }),
        );
        msg.sequence_number = 1;
        msg
    }

    #[test]
    fn accepts_chained_reply() {
        let req = request();
        let reply = SatpMessage::reply_to(
            &req,
            "h".into(),
            Payload::NewSessionResponse(NewSessionResponse { accepted: true }),
        );
        assert!(check_reply(&req, "h", &reply).is_ok());
        assert!(matches!(check_reply(&req, "other", &reply), Err(SatpError::Rejected(_))));

        let mut wrong_seq = reply.clone();
        wrong_seq.sequence_number = 7;
        assert!(matches!(check_reply(&req, "h", &wrong_seq), Err(SatpError::Rejected(_))));
    }

    #[test]
    fn rejects_unexpected_and_negative_replies() {
        let req = request();
        let reject = SatpMessage::reply_to(
            &req,
            "h".into(),
            Payload::TransferProposalReject(TransferProposalReject { reason: "no".into() }),
        );
        assert!(matches!(check_reply(&req, "h", &reject), Err(SatpError::Rejected(_))));
    }
}

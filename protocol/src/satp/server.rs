//! Server side of a transfer: one handler per stage request.
//!
//! Every inbound message goes through the same admission path before its
//! handler runs:
//!
//! 1. shape and signature checks;
//! 2. session lookup (created on `NewSessionRequest`, otherwise the active
//!    map, then the log);
//! 3. duplicate delivery: a request whose digest is already answered gets
//!    the cached reply, with no state change;
//! 4. sessions under recovery or in a terminal state refuse new requests,
//!    except the commit tail on a session the server completed by itself;
//! 5. sequence and hash-chain checks, then an in-flight claim so a
//!    concurrent redelivery cannot run the same step twice.
//!
//! A handler that fails leaves the sequence number unaccepted, so the
//! client's retry of the same message is processed afresh.

use tracing::{debug, info, warn};

use super::manager::SatpManager;
use super::SatpError;
use crate::crosschain::LedgerEffect;
use crate::crypto::hash_object;
use crate::identity::GatewayIdentity;
use crate::log::{LogOperation, LOG_TYPE_TRANSFER, LOG_TYPE_TRANSFER_COMPLETE};
use crate::messages::{
    CommitFinalAcknowledgementReceipt, CommitFinalAssertionRequest, CommitReadyResponse,
    LockAssertionReceipt, LockAssertionRequest, MessageType, NewSessionResponse, Payload,
    PreTransferRequest, PreTransferResponse, SatpMessage, TransferCommenceResponse,
    TransferCompleteResponse, TransferProposalReceipt, TransferProposalReject,
    TransferProposalRequest,
};
use crate::session::{Role, Session, SessionData, SessionParams, SessionState, SharedSession};

impl SatpManager {
    /// Answer one stage request from a client gateway.
    pub async fn handle_message(&self, message: SatpMessage) -> Result<SatpMessage, SatpError> {
        message.check_shape()?;
        let sender = self.orchestrator().verify_inbound(&message)?.clone();
        self.monitor().record_message("received", message.message_type);
        if message.message_type.is_recovery() {
            return Err(SatpError::Validation(format!(
                "{} is not a stage message",
                message.message_type
            )));
        }
        if message.server_pubkey != self.orchestrator().public_key() {
            return Err(SatpError::Validation(format!(
                "{} addressed to another gateway",
                message.message_type
            )));
        }

        self.prune_completed();
        let session = match &message.payload {
            Payload::NewSessionRequest(_) => self.open_server_session(&message, &sender)?,
            _ => self.find_session(&message.session_id)?,
        };
        let request_hash = message.hash()?;
        let admitted = match self.admit(&session, &message, &sender, &request_hash) {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(
                    session_id = %message.session_id,
                    message_type = %message.message_type,
                    sequence = message.sequence_number,
                    kind = e.kind(),
                    "rejected message: {}",
                    e
                );
                return Err(e);
            }
        };
        if let Some(cached) = admitted {
            debug!(
                session_id = %message.session_id,
                message_type = %message.message_type,
                "duplicate delivery, resending cached reply"
            );
            return Ok(cached);
        }

        let claim = InboundClaim(&session);
        let result = self.dispatch(&session, &message, &request_hash).await;
        drop(claim);
        if let Err(e) = &result {
            warn!(
                session_id = %message.session_id,
                message_type = %message.message_type,
                sequence = message.sequence_number,
                "request failed: {}",
                e
            );
        }
        result
    }

    /// Admission checks. Returns the cached reply for a duplicate, or
    /// `None` once the message is claimed for processing.
    fn admit(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        sender: &GatewayIdentity,
        request_hash: &str,
    ) -> Result<Option<SatpMessage>, SatpError> {
        let mut guard = session.lock();
        if let Some(cached) = guard.cached_response(request_hash) {
            return Ok(Some(cached.clone()));
        }
        if guard.is_recovering() {
            return Err(SatpError::Rejected(format!(
                "session {} is under recovery",
                message.session_id
            )));
        }
        // A server that rolled forward on its own still owes the client the
        // commit tail.
        let commit_tail = matches!(
            message.message_type,
            MessageType::CommitFinalAssertionRequest | MessageType::TransferCompleteRequest
        );
        if let Some(state) = guard
            .state()
            .filter(|s| s.is_terminal() && !(commit_tail && *s == SessionState::Completed))
        {
            return Err(SatpError::SessionClosed {
                session_id: message.session_id.clone(),
                state,
            });
        }
        let data = guard.server_data()?;
        if data.client_gateway_pubkey != sender.pubkey || message.client_pubkey != sender.pubkey {
            return Err(SatpError::Validation(format!(
                "gateway {} is not the client of session {}",
                sender.id, message.session_id
            )));
        }
        if message.sequence_number <= data.last_sequence_number {
            return Err(SatpError::StaleMessage {
                session_id: message.session_id.clone(),
                received: message.sequence_number,
                last: data.last_sequence_number,
            });
        }
        let expected = data.previous_hash_for(message.message_type);
        if message.hash_previous_message != expected {
            return Err(SatpError::Rejected(format!(
                "{} does not chain the last recorded hash",
                message.message_type
            )));
        }
        guard.begin_inbound(message.sequence_number)?;
        Ok(None)
    }

    async fn dispatch(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
    ) -> Result<SatpMessage, SatpError> {
        self.log_current(session, Role::Server, message.message_type.log_type(), LogOperation::Exec)?;
        match &message.payload {
            Payload::NewSessionRequest(_) => self.respond(
                session,
                message,
                request_hash,
                Payload::NewSessionResponse(NewSessionResponse { accepted: true }),
                |_| Ok(()),
            ),
            Payload::PreTransferRequest(p) => self.on_pre_transfer(session, message, request_hash, p).await,
            Payload::TransferProposalRequest(p) => self.on_transfer_proposal(session, message, request_hash, p),
            Payload::TransferCommenceRequest(_) => self.respond(
                session,
                message,
                request_hash,
                Payload::TransferCommenceResponse(TransferCommenceResponse {}),
                |_| Ok(()),
            ),
            Payload::LockAssertionRequest(p) => self.on_lock_assertion(session, message, request_hash, p),
            Payload::CommitPreparationRequest(_) => {
                self.on_commit_preparation(session, message, request_hash).await
            }
            Payload::CommitFinalAssertionRequest(p) => {
                self.on_commit_final_assertion(session, message, request_hash, p).await
            }
            Payload::TransferCompleteRequest(_) => self.on_transfer_complete(session, message, request_hash),
            _ => Err(SatpError::Validation(format!(
                "{} is not a request",
                message.message_type
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Session setup
    // -----------------------------------------------------------------------

    /// The session a `NewSessionRequest` refers to: already active, in the
    /// log, or created here.
    fn open_server_session(
        &self,
        message: &SatpMessage,
        sender: &GatewayIdentity,
    ) -> Result<SharedSession, SatpError> {
        if let Some(session) = self.get_session(&message.session_id) {
            return Ok(session);
        }
        if let Some(session) = self.restore_session(&message.session_id)? {
            return Ok(session);
        }
        let Payload::NewSessionRequest(request) = &message.payload else {
            return Err(SatpError::Validation("expected a new session request".into()));
        };
        if !self.ledgers().serves(&request.recipient_gateway_network_id) {
            return Err(SatpError::Validation(format!(
                "this gateway does not serve network {}",
                request.recipient_gateway_network_id
            )));
        }

        let mut params = SessionParams::new(
            sender.pubkey.clone(),
            self.orchestrator().public_key(),
            request.sender_gateway_network_id.clone(),
            request.recipient_gateway_network_id.clone(),
        );
        params.max_retries = request.max_retries;
        params.max_timeout_ms = request.max_timeout_ms;
        let session = Session::with_id(&message.session_id, &message.context_id, Role::Server, &params);
        let shared = self.insert_session(session);
        self.log_current(&shared, Role::Server, LOG_TYPE_TRANSFER, LogOperation::Init)?;
        info!(
            session_id = %message.session_id,
            client = %sender.id,
            "session opened"
        );
        Ok(shared)
    }

    // -----------------------------------------------------------------------
    // Stage handlers
    // -----------------------------------------------------------------------

    async fn on_pre_transfer(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
        request: &PreTransferRequest,
    ) -> Result<SatpMessage, SatpError> {
        let network = {
            let guard = session.lock();
            let data = guard.server_data()?;
            if request.sender_asset.network != data.sender_gateway_network_id
                || request.receiver_asset.network != data.recipient_gateway_network_id
            {
                return Err(SatpError::Validation(
                    "asset networks do not match the session".into(),
                ));
            }
            data.recipient_gateway_network_id.clone()
        };
        if request.sender_asset.amount != request.receiver_asset.amount {
            return Err(SatpError::Validation(format!(
                "sender amount {} differs from receiver amount {}",
                request.sender_asset.amount, request.receiver_asset.amount
            )));
        }

        let wrap = self
            .ledger_step(
                session,
                Role::Server,
                &network,
                LedgerEffect::Wrap(request.receiver_asset.clone()),
                None,
            )
            .await?;
        let response = PreTransferResponse {
            wrapped_token_id: request.receiver_asset.token_id.clone(),
            wrap_tx_id: wrap.tx_id,
        };
        self.respond(session, message, request_hash, Payload::PreTransferResponse(response), |data| {
            data.sender_asset = Some(request.sender_asset.clone());
            data.receiver_asset = Some(request.receiver_asset.clone());
            data.originator = request.originator.clone();
            data.beneficiary = request.beneficiary.clone();
            Ok(())
        })
    }

    fn on_transfer_proposal(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
        claims: &TransferProposalRequest,
    ) -> Result<SatpMessage, SatpError> {
        let mismatch = {
            let guard = session.lock();
            proposal_mismatch(guard.server_data()?, claims)
        };
        if let Some(reason) = mismatch {
            warn!(session_id = %message.session_id, "rejecting transfer proposal: {}", reason);
            return self.respond(
                session,
                message,
                request_hash,
                Payload::TransferProposalReject(TransferProposalReject { reason }),
                |_| Ok(()),
            );
        }
        let receipt = TransferProposalReceipt {
            claims_hash: hash_object(claims)?,
        };
        self.respond(session, message, request_hash, Payload::TransferProposalReceipt(receipt), |data| {
            data.state = SessionState::TransferProposed;
            Ok(())
        })
    }

    fn on_lock_assertion(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
        assertion: &LockAssertionRequest,
    ) -> Result<SatpMessage, SatpError> {
        {
            let guard = session.lock();
            let data = guard.server_data()?;
            let expected_id = data.sender_asset.as_ref().map(|a| a.token_id.as_str());
            if expected_id != Some(assertion.asset_id.as_str()) || assertion.amount != data.amount() {
                return Err(SatpError::Validation(format!(
                    "lock of {} x{} does not match the proposed transfer",
                    assertion.asset_id, assertion.amount
                )));
            }
        }
        let lock_tx_id = assertion.lock_tx_id.clone();
        self.respond(
            session,
            message,
            request_hash,
            Payload::LockAssertionReceipt(LockAssertionReceipt {}),
            |data| {
                data.receipts.insert("counterparty-lock".into(), lock_tx_id.clone());
                data.state = SessionState::Locked;
                Ok(())
            },
        )
    }

    async fn on_commit_preparation(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
    ) -> Result<SatpMessage, SatpError> {
        let (network, asset_id, amount) = destination_leg(&session.lock().server_data()?.clone())?;
        let mint = self
            .ledger_step(session, Role::Server, &network, LedgerEffect::Mint { asset_id, amount }, None)
            .await?;
        let response = CommitReadyResponse {
            mint_tx_id: mint.tx_id,
        };
        self.respond(session, message, request_hash, Payload::CommitReadyResponse(response), |data| {
            data.state = SessionState::CommitPreparing;
            Ok(())
        })
    }

    async fn on_commit_final_assertion(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
        assertion: &CommitFinalAssertionRequest,
    ) -> Result<SatpMessage, SatpError> {
        let data = session.lock().server_data()?.clone();
        let (network, asset_id, amount) = destination_leg(&data)?;
        let assign = self
            .ledger_step(
                session,
                Role::Server,
                &network,
                LedgerEffect::Assign {
                    asset_id,
                    owner: data.beneficiary.clone(),
                    amount,
                },
                None,
            )
            .await?;
        let burn_tx_id = assertion.burn_tx_id.clone();
        let response = CommitFinalAcknowledgementReceipt {
            assign_tx_id: assign.tx_id,
        };
        self.respond(
            session,
            message,
            request_hash,
            Payload::CommitFinalAcknowledgementReceipt(response),
            |data| {
                data.receipts.insert("counterparty-burn".into(), burn_tx_id.clone());
                Ok(())
            },
        )
    }

    fn on_transfer_complete(
        &self,
        session: &SharedSession,
        message: &SatpMessage,
        request_hash: &str,
    ) -> Result<SatpMessage, SatpError> {
        let reply = self.respond(
            session,
            message,
            request_hash,
            Payload::TransferCompleteResponse(TransferCompleteResponse {}),
            |data| {
                data.state = SessionState::Completed;
                Ok(())
            },
        )?;
        self.commit(session, Role::Server, LOG_TYPE_TRANSFER_COMPLETE, None, |data| {
            data.state = SessionState::Completed;
            Ok(())
        })?;
        session.lock().set_state(SessionState::Completed);
        self.monitor().sessions_completed.inc();
        info!(session_id = %message.session_id, "transfer completed");
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Replies
    // -----------------------------------------------------------------------

    /// Sign a reply to `request` and commit it: the request's sequence
    /// number, both hashes and `mutate` go into one `{reply type}/done`
    /// entry that also carries the signed reply. The reply is cached for
    /// duplicate deliveries.
    fn respond<F>(
        &self,
        session: &SharedSession,
        request: &SatpMessage,
        request_hash: &str,
        payload: Payload,
        mutate: F,
    ) -> Result<SatpMessage, SatpError>
    where
        F: Fn(&mut SessionData) -> Result<(), SatpError>,
    {
        let reply = self
            .orchestrator()
            .sign_response(SatpMessage::reply_to(request, request_hash.to_string(), payload))?;
        let reply_hash = reply.hash()?;
        let (request_type, reply_type) = (request.message_type, reply.message_type);
        let sequence = request.sequence_number;

        self.commit(session, Role::Server, reply_type.log_type(), Some(&reply), |data| {
            data.accept_sequence_number(sequence)?;
            data.set_hash(request_type, request_hash.to_string())?;
            data.set_hash(reply_type, reply_hash.clone())?;
            mutate(data)
        })?;
        session
            .lock()
            .remember_response(request_hash.to_string(), reply.clone());
        self.monitor().record_message("sent", reply_type);
        debug!(
            session_id = %request.session_id,
            stage = request_type.stage().unwrap_or_default(),
            message_type = %reply_type,
            "replied"
        );
        Ok(reply)
    }
}

/// Releases a session's in-flight claim, also when the handling future is
/// dropped mid-way (a client timeout over the in-process channel).
struct InboundClaim<'a>(&'a SharedSession);

impl Drop for InboundClaim<'_> {
    fn drop(&mut self) {
        self.0.lock().end_inbound();
    }
}

/// Network, wrapped asset id and amount of the destination leg.
fn destination_leg(data: &SessionData) -> Result<(String, String, u64), SatpError> {
    let asset = data.receiver_asset.as_ref().ok_or_else(|| {
        SatpError::Validation(format!("session {} has no receiver asset", data.id))
    })?;
    Ok((
        data.recipient_gateway_network_id.clone(),
        asset.token_id.clone(),
        asset.amount,
    ))
}

/// Why the claims of a transfer proposal cannot be accepted, if they
/// cannot.
fn proposal_mismatch(data: &SessionData, claims: &TransferProposalRequest) -> Option<String> {
    let (Some(sender), Some(receiver)) = (&data.sender_asset, &data.receiver_asset) else {
        return Some("no assets agreed in stage 0".into());
    };
    if claims.amount != sender.amount || claims.amount != receiver.amount {
        return Some(format!(
            "amount {} does not match the pre-transfer amount {}",
            claims.amount, sender.amount
        ));
    }
    if claims.token_type != sender.token_type {
        return Some(format!("unexpected token type {}", claims.token_type));
    }
    if claims.sender_gateway_network_id != data.sender_gateway_network_id
        || claims.recipient_gateway_network_id != data.recipient_gateway_network_id
    {
        return Some("networks do not match the session".into());
    }
    if claims.originator != data.originator || claims.beneficiary != data.beneficiary {
        return Some("originator or beneficiary does not match the pre-transfer".into());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::crypto::GatewayKeypair;

    fn data() -> SessionData {
        let mut data = SessionData::new(
            "s".into(),
            "c".into(),
            Role::Server,
            &SessionParams::new(
                GatewayKeypair::from_seed(&[1; 32]).public_key(),
                GatewayKeypair::from_seed(&[2; 32]).public_key(),
                "besu",
                "fabric",
            ),
        );
        data.sender_asset = Some(Asset::fungible("s-source", "USDC", 100, "alice", "besu"));
        data.receiver_asset = Some(Asset::fungible("s-receiver", "USDC", 100, "bob", "fabric"));
        data.originator = "alice".into();
        data.beneficiary = "bob".into();
        data
    }

    fn claims() -> TransferProposalRequest {
        TransferProposalRequest {
            originator: "alice".into(),
            beneficiary: "bob".into(),
            sender_gateway_network_id: "besu".into(),
            recipient_gateway_network_id: "fabric".into(),
            token_type: "USDC".into(),
            amount: 100,
        }
    }

    #[test]
    fn matching_claims_are_accepted() {
        assert_eq!(proposal_mismatch(&data(), &claims()), None);
    }

    #[test]
    fn mismatched_claims_are_explained() {
        let mut c = claims();
        c.amount = 500;
        assert!(proposal_mismatch(&data(), &c).unwrap().contains("500"));

        let mut c = claims();
        c.beneficiary = "mallory".into();
        assert!(proposal_mismatch(&data(), &c).is_some());

        let mut bare = data();
        bare.receiver_asset = None;
        assert!(proposal_mismatch(&bare, &claims()).is_some());
    }

    #[test]
    fn destination_leg_uses_receiver_asset() {
        let (network, asset_id, amount) = destination_leg(&data()).unwrap();
        assert_eq!(network, "fabric");
        assert_eq!(asset_id, "s-receiver");
        assert_eq!(amount, 100);
    }
}

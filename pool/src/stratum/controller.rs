/// Stratum protocol engine
///
/// Sits between the transport and the pool: turns inbound frames into typed
/// requests, enforces the protocol rules on its own (hangups, syntax errors,
/// unknown methods) and encodes every reply and push.

use serde_json::{json, Value};
use std::sync::Arc;

use super::protocol::{self, Decoded, JobNotification, StratumError, StratumRequest, StratumResponse};
use super::transport::{Transport, TransportEvent};
use crate::error::{PoolError, Result};
use crate::jobs::Job;
use crate::pow::AddressValidator;

pub struct StratumController {
    transport: Arc<Transport>,
    validator: Arc<dyn AddressValidator>,
}

impl StratumController {
    pub fn new(transport: Arc<Transport>, validator: Arc<dyn AddressValidator>) -> Self {
        Self { transport, validator }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn validate_address(&self, address: &str) -> Result<()> {
        self.validator.validate(address)
    }

    /// Decode one inbound transport event. Anything that is not a valid
    /// request is fully handled here and yields `None`.
    pub async fn route(&self, event: TransportEvent) -> Option<StratumRequest> {
        match event {
            TransportEvent::Message { connection_id, message } => self.route_message(&connection_id, &message).await,
            TransportEvent::Raw { connection_id, .. } => {
                self.drop_violator(&connection_id, PoolError::ProtocolViolation("unparsable frame".into()))
                    .await;
                None
            }
            TransportEvent::Connected { .. } | TransportEvent::Closed { .. } => None,
        }
    }

    async fn route_message(&self, connection_id: &str, message: &Value) -> Option<StratumRequest> {
        match protocol::decode(message) {
            Decoded::Violation(reason) => {
                self.drop_violator(connection_id, PoolError::ProtocolViolation(reason.to_string()))
                    .await;
                None
            }
            Decoded::Invalid { id, message } => {
                self.reject_and_hangup(connection_id, id, message).await;
                None
            }
            Decoded::UnknownMethod { id, method } => {
                tracing::debug!("Unknown method {} from {}", method, connection_id);
                let _ = self.error(connection_id, id, StratumError::INVALID_METHOD).await;
                None
            }
            Decoded::Request(StratumRequest::Login { id, params }) => {
                if let Err(e) = self.validator.validate(&params.login) {
                    tracing::info!("Rejected login {} from {}: {}", params.login, connection_id, e);
                    self.reject_and_hangup(connection_id, id, StratumError::INVALID_LOGIN).await;
                    return None;
                }
                Some(StratumRequest::Login { id, params })
            }
            Decoded::Request(request) => Some(request),
        }
    }

    async fn drop_violator(&self, connection_id: &str, error: PoolError) {
        tracing::debug!("{} from {}, hanging up", error, connection_id);
        self.transport.hangup(connection_id).await;
    }

    async fn reject_and_hangup(&self, connection_id: &str, id: Value, message: &str) {
        let _ = self.error(connection_id, id, message).await;
        self.transport.hangup(connection_id).await;
    }

    pub async fn accept(&self, connection_id: &str) -> bool {
        self.transport.accept(connection_id).await
    }

    pub async fn hangup(&self, connection_id: &str) -> bool {
        self.transport.hangup(connection_id).await
    }

    pub async fn error(&self, connection_id: &str, id: Value, message: &str) -> Result<()> {
        let reply = StratumResponse::error(id, StratumError::unknown(message));
        self.transport.write(connection_id, &reply, true).await
    }

    pub async fn login_accepted(&self, connection_id: &str, id: Value, job: &Job) -> Result<()> {
        let reply = StratumResponse::success(id, protocol::login_result(connection_id, job));
        self.transport.write(connection_id, &reply, true).await
    }

    pub async fn login_rejected(&self, connection_id: &str, id: Value) -> Result<()> {
        self.error(connection_id, id, StratumError::LOGIN_FAILED).await
    }

    pub async fn share_accepted(&self, connection_id: &str, id: Value) -> Result<()> {
        let reply = StratumResponse::success(id, json!({ "status": "OK" }));
        self.transport.write(connection_id, &reply, true).await
    }

    pub async fn share_rejected(&self, connection_id: &str, id: Value, message: &str) -> Result<()> {
        self.error(connection_id, id, message).await
    }

    pub async fn keepalive(&self, connection_id: &str, id: Value) -> Result<()> {
        let reply = StratumResponse::success(id, json!({ "status": "KEEPALIVED" }));
        self.transport.write(connection_id, &reply, true).await
    }

    pub async fn job(&self, connection_id: &str, job: &Job) -> Result<()> {
        self.transport
            .write(connection_id, &JobNotification::new(job), true)
            .await
    }
}

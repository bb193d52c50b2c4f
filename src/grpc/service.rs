//! Keygate service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto;
use super::proto::keygate_server::Keygate;
use crate::edge::{
    EdgeCoordinator, NamespaceRatelimitRequest, NamespaceRef, VerificationCode, VerifyRequest,
};
use crate::ratelimit::{OverrideUpsert, RatelimitOverride};

/// Implementation of the `keygate.v1.Keygate` gRPC interface.
pub struct KeygateService {
    coordinator: Arc<EdgeCoordinator>,
}

impl KeygateService {
    pub fn new(coordinator: Arc<EdgeCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl From<VerificationCode> for proto::VerificationCode {
    fn from(code: VerificationCode) -> Self {
        match code {
            VerificationCode::Valid => proto::VerificationCode::Valid,
            VerificationCode::RateLimited => proto::VerificationCode::RateLimited,
            VerificationCode::UsageExceeded => proto::VerificationCode::UsageExceeded,
            VerificationCode::Disabled => proto::VerificationCode::Disabled,
            VerificationCode::Expired => proto::VerificationCode::Expired,
            VerificationCode::NotFound => proto::VerificationCode::NotFound,
        }
    }
}

impl From<RatelimitOverride> for proto::Override {
    fn from(rule: RatelimitOverride) -> Self {
        Self {
            id: rule.id,
            namespace_id: rule.namespace_id,
            identifier: rule.identifier,
            limit: rule.limit,
            duration: rule.duration,
            async_mode: rule.async_mode,
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        warn!(field, "Rejected request with missing field");
        return Err(Status::invalid_argument(format!("{} is required", field)));
    }
    Ok(())
}

#[tonic::async_trait]
impl Keygate for KeygateService {
    #[instrument(skip(self, request), fields(cost = ?request.get_ref().cost))]
    async fn verify_key(
        &self,
        request: Request<proto::VerifyKeyRequest>,
    ) -> Result<Response<proto::VerifyKeyResponse>, Status> {
        let req = request.into_inner();
        require("key_hash", &req.key_hash)?;

        let mut verify = VerifyRequest::new(req.key_hash).with_cost(req.cost.unwrap_or(1));
        if let Some(namespace) = req.namespace {
            require("namespace.name", &namespace.name)?;
            require("namespace.identifier", &namespace.identifier)?;
            verify.namespace = Some(NamespaceRef {
                name: namespace.name,
                identifier: namespace.identifier,
            });
        }

        let result = self.coordinator.verify(&verify).await?;
        debug!(code = %result.code, key_id = ?result.key_id, "Verification decided");

        Ok(Response::new(proto::VerifyKeyResponse {
            valid: result.valid,
            code: proto::VerificationCode::from(result.code).into(),
            remaining: result.remaining,
            ratelimit: result.ratelimit.map(|state| proto::RatelimitState {
                limit: state.limit,
                remaining: state.remaining,
                reset: state.reset,
            }),
            key_id: result.key_id.unwrap_or_default(),
        }))
    }

    #[instrument(
        skip(self, request),
        fields(namespace = %request.get_ref().namespace, identifier = %request.get_ref().identifier)
    )]
    async fn ratelimit(
        &self,
        request: Request<proto::RatelimitRequest>,
    ) -> Result<Response<proto::RatelimitResponse>, Status> {
        let req = request.into_inner();
        require("workspace_id", &req.workspace_id)?;
        require("namespace", &req.namespace)?;
        require("identifier", &req.identifier)?;
        if req.duration == 0 {
            return Err(Status::invalid_argument("duration must be positive"));
        }

        let result = self
            .coordinator
            .ratelimit(&NamespaceRatelimitRequest {
                workspace_id: req.workspace_id,
                namespace: req.namespace,
                identifier: req.identifier,
                limit: req.limit,
                duration: req.duration,
                cost: req.cost.unwrap_or(1),
                async_mode: req.async_mode,
            })
            .await?;

        Ok(Response::new(proto::RatelimitResponse {
            success: result.success,
            limit: result.limit,
            remaining: result.remaining,
            reset: result.reset,
            override_id: result.override_id.unwrap_or_default(),
        }))
    }

    #[instrument(skip(self, request), fields(key_id = %request.get_ref().key_id))]
    async fn get_key(
        &self,
        request: Request<proto::GetKeyRequest>,
    ) -> Result<Response<proto::GetKeyResponse>, Status> {
        let req = request.into_inner();
        require("key_id", &req.key_id)?;

        let info = self.coordinator.get_key(&req.key_id).await?;
        Ok(Response::new(proto::GetKeyResponse {
            id: info.key.id,
            workspace_id: info.key.workspace_id,
            enabled: info.key.enabled,
            remaining: info.remaining,
            expires: info.key.expires,
        }))
    }

    #[instrument(skip(self, request))]
    async fn get_override(
        &self,
        request: Request<proto::GetOverrideRequest>,
    ) -> Result<Response<proto::OverrideResponse>, Status> {
        let req = request.into_inner();
        require("namespace_id", &req.namespace_id)?;
        require("identifier", &req.identifier)?;

        let rule = self
            .coordinator
            .get_override(&req.namespace_id, &req.identifier)
            .await?;
        Ok(Response::new(proto::OverrideResponse {
            rule: Some(rule.into()),
        }))
    }

    #[instrument(skip(self, request))]
    async fn upsert_override(
        &self,
        request: Request<proto::UpsertOverrideRequest>,
    ) -> Result<Response<proto::OverrideResponse>, Status> {
        let req = request.into_inner();
        let rule = self
            .coordinator
            .upsert_override(OverrideUpsert {
                namespace_id: req.namespace_id,
                identifier: req.identifier,
                limit: req.limit,
                duration: req.duration,
                async_mode: req.async_mode,
            })
            .await?;
        Ok(Response::new(proto::OverrideResponse {
            rule: Some(rule.into()),
        }))
    }

    #[instrument(skip(self, request), fields(id = %request.get_ref().id))]
    async fn delete_override(
        &self,
        request: Request<proto::DeleteOverrideRequest>,
    ) -> Result<Response<proto::DeleteOverrideResponse>, Status> {
        let req = request.into_inner();
        require("id", &req.id)?;

        self.coordinator.delete_override(&req.id).await?;
        Ok(Response::new(proto::DeleteOverrideResponse { deleted: true }))
    }
}

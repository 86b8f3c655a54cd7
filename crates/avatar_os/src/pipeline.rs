#![forbid(unsafe_code)]

use avatar_engines::identity::{bearer_token_from_header, AuthError, CallerIdentity};
use avatar_engines::provisioning::{AgentSpec, ProvisioningError};
use avatar_kernel_contracts::avatar::{
    AgentId, AvatarRequest, KnowledgeId, ProvisioningStage, RecordFailure, RecordId,
};
use avatar_kernel_contracts::FieldViolations;
use avatar_storage::records::StorageError;
use serde_json::Value;

use crate::context::AppContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Authenticating,
    Validating,
    Recording,
    ProvisioningKnowledge,
    ProvisioningAgent,
    Finalizing,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Authenticating => "authenticating",
            PipelineStage::Validating => "validating",
            PipelineStage::Recording => "recording",
            PipelineStage::ProvisioningKnowledge => "provisioning_knowledge",
            PipelineStage::ProvisioningAgent => "provisioning_agent",
            PipelineStage::Finalizing => "finalizing",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("validation failed: {0}")]
    Validation(FieldViolations),
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("record not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

impl From<FieldViolations> for PipelineError {
    fn from(v: FieldViolations) -> Self {
        PipelineError::Validation(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningOutcome {
    pub record_id: RecordId,
    pub knowledge_id: KnowledgeId,
    pub agent_id: AgentId,
}

/// Stages a single run entered, in order, ending in `Done` or `Failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineTrace(Vec<PipelineStage>);

impl PipelineTrace {
    pub fn stages(&self) -> &[PipelineStage] {
        &self.0
    }

    pub fn reached(&self, stage: PipelineStage) -> bool {
        self.0.contains(&stage)
    }

    pub fn last(&self) -> Option<PipelineStage> {
        self.0.last().copied()
    }
}

#[derive(Debug)]
pub struct PipelineRun {
    pub result: Result<ProvisioningOutcome, PipelineError>,
    pub trace: PipelineTrace,
}

/// One request's walk through
/// authenticate → validate → record → knowledge → agent → finalize.
///
/// Each step is its own method taking the previous step's output, so a step
/// can only run once its predecessor has succeeded. Provisioning failures after
/// the record exists mark it `failed`; nothing is rolled back.
#[derive(Debug)]
pub struct ProvisioningPipeline<'a> {
    ctx: &'a AppContext,
    stage: PipelineStage,
    trace: Vec<PipelineStage>,
}

impl<'a> ProvisioningPipeline<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self {
            ctx,
            stage: PipelineStage::Authenticating,
            trace: Vec::with_capacity(8),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn run(mut self, authorization: Option<&str>, body: &Value) -> PipelineRun {
        let result = self.drive(authorization, body);
        match &result {
            Ok(outcome) => {
                self.enter(PipelineStage::Done);
                tracing::info!(
                    record_id = %outcome.record_id,
                    knowledge_id = %outcome.knowledge_id,
                    agent_id = %outcome.agent_id,
                    "avatar provisioned"
                );
            }
            Err(err) => {
                let failed_at = self.stage;
                self.enter(PipelineStage::Failed);
                match err {
                    PipelineError::Internal(detail) => {
                        tracing::error!(stage = failed_at.as_str(), %detail, "avatar pipeline internal failure");
                    }
                    other => {
                        tracing::info!(stage = failed_at.as_str(), error = %other, "avatar pipeline rejected request");
                    }
                }
            }
        }
        PipelineRun {
            result,
            trace: PipelineTrace(self.trace),
        }
    }

    fn drive(
        &mut self,
        authorization: Option<&str>,
        body: &Value,
    ) -> Result<ProvisioningOutcome, PipelineError> {
        let caller = self.authenticate(authorization)?;
        let request = self.validate(body)?;
        let record_id = self.record(&request, &caller)?;
        let knowledge_id = self.provision_knowledge(&record_id, &request)?;
        let agent_id = self.provision_agent(&record_id, &request, &knowledge_id)?;
        self.finalize(record_id, knowledge_id, agent_id)
    }

    pub fn authenticate(
        &mut self,
        authorization: Option<&str>,
    ) -> Result<CallerIdentity, PipelineError> {
        self.enter(PipelineStage::Authenticating);
        let token = bearer_token_from_header(authorization)?;
        Ok(self.ctx.identity.verify(token)?)
    }

    pub fn validate(&mut self, body: &Value) -> Result<AvatarRequest, PipelineError> {
        self.enter(PipelineStage::Validating);
        Ok(AvatarRequest::from_json(body)?)
    }

    pub fn record(
        &mut self,
        request: &AvatarRequest,
        caller: &CallerIdentity,
    ) -> Result<RecordId, PipelineError> {
        self.enter(PipelineStage::Recording);
        Ok(self.ctx.records.create_pending(request, &caller.user_id)?)
    }

    pub fn provision_knowledge(
        &mut self,
        record_id: &RecordId,
        request: &AvatarRequest,
    ) -> Result<KnowledgeId, PipelineError> {
        self.enter(PipelineStage::ProvisioningKnowledge);
        self.ctx
            .provisioning
            .create_knowledge(&request.api_key, &request.knowledge)
            .map_err(|err| self.mark_failed(record_id, ProvisioningStage::Knowledge, None, err))
    }

    pub fn provision_agent(
        &mut self,
        record_id: &RecordId,
        request: &AvatarRequest,
        knowledge_id: &KnowledgeId,
    ) -> Result<AgentId, PipelineError> {
        self.enter(PipelineStage::ProvisioningAgent);
        let spec = AgentSpec {
            source_url: request.avatar_image_url.clone(),
            thumbnail_url: request.cover_image_url.clone(),
            knowledge_id: knowledge_id.clone(),
        };
        self.ctx
            .provisioning
            .create_agent(&request.api_key, &spec)
            .map_err(|err| {
                self.mark_failed(
                    record_id,
                    ProvisioningStage::Agent,
                    Some(knowledge_id.clone()),
                    err,
                )
            })
    }

    pub fn finalize(
        &mut self,
        record_id: RecordId,
        knowledge_id: KnowledgeId,
        agent_id: AgentId,
    ) -> Result<ProvisioningOutcome, PipelineError> {
        self.enter(PipelineStage::Finalizing);
        if let Err(err) =
            self.ctx
                .records
                .mark_created(&record_id, knowledge_id.clone(), agent_id.clone())
        {
            // External resources exist but the record could not say so; keep the
            // ids in the log so the record can be reconciled by hand.
            tracing::error!(
                record_id = %record_id,
                knowledge_id = %knowledge_id,
                agent_id = %agent_id,
                error = %err,
                "failed to mark avatar record created"
            );
            return Err(err.into());
        }
        Ok(ProvisioningOutcome {
            record_id,
            knowledge_id,
            agent_id,
        })
    }

    fn mark_failed(
        &self,
        record_id: &RecordId,
        stage: ProvisioningStage,
        knowledge_id: Option<KnowledgeId>,
        err: ProvisioningError,
    ) -> PipelineError {
        tracing::warn!(
            record_id = %record_id,
            stage = stage.as_str(),
            reason = %err.reason_code(),
            "avatar provisioning call failed"
        );
        let failure = RecordFailure::new(stage, err.reason_code());
        if let Err(store_err) = self.ctx.records.mark_failed(record_id, failure, knowledge_id) {
            tracing::error!(
                record_id = %record_id,
                error = %store_err,
                "failed to mark avatar record failed; record left pending"
            );
        }
        PipelineError::Provisioning(err)
    }

    fn enter(&mut self, stage: PipelineStage) {
        self.stage = stage;
        self.trace.push(stage);
    }
}

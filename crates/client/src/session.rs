//! Upload session orchestrator.
//!
//! A session negotiates the upload method, plans and transfers the chunks
//! with the matching strategy, then finalizes the upload. Status changes,
//! progress and the final outcome are emitted as [`UploadEvent`]s.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use klb_upload_protocol::constants::{HANDLE_COMPLETE_ACTION, s3_session_action};
use klb_upload_protocol::{
    CompletionData, CompletionResult, NegotiateRequest, NegotiationData, NegotiationResult,
    UploadRequest,
};
use klb_upload_transfer::{
    ChunkPlan, ChunkState, ChunkTable, ProgressTracker, RetryPolicy, TransferEngine,
    TransferProgress, UploadSource, plan_direct_put, plan_s3, sha256_hex, validate_plan,
};

use crate::api::ApiClient;
use crate::config::{ClientConfig, HashPolicy};
use crate::error::UploadError;
use crate::s3::{S3Client, S3Object};
use crate::signing::SigningClient;
use crate::strategy::{DirectPutUploader, S3PartUploader};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{CompletionTarget, SessionStatus, UploadEvent};

/// Unframed direct PUT bodies above this size are logged as a warning.
const LARGE_BODY_BYTES: u64 = 512 * 1024 * 1024;

/// Entry point: creates upload sessions sharing one transport.
#[derive(Clone)]
pub struct UploadClient {
    api: ApiClient,
    engine: TransferEngine,
    retry: RetryPolicy,
    hash_policy: HashPolicy,
}

impl UploadClient {
    /// Creates a client over the `reqwest` transport.
    pub fn new(config: &ClientConfig) -> Result<Self, UploadError> {
        let transport = ReqwestTransport::new(config.connect_timeout(), config.request_timeout())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let retry = config.retry.to_policy();
        Self {
            api: ApiClient::new(transport, &config.api_base, config.access_token.clone()),
            engine: TransferEngine::new(config.max_concurrency, retry.clone()),
            retry,
            hash_policy: config.hash_policy,
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Creates a session in [`SessionStatus::Pending`].
    ///
    /// `source` must hold exactly `request.size` bytes.
    pub fn session(&self, request: UploadRequest, source: Arc<dyn UploadSource>) -> UploadSession {
        UploadSession::new(self.clone(), request, source)
    }

    /// Re-issues the completion call of a transferred upload.
    ///
    /// Used after [`UploadError::Completion`]; the session that produced the
    /// target stays in its terminal state.
    pub async fn retry_completion(
        &self,
        target: &CompletionTarget,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult, UploadError> {
        info!(endpoint = %target.endpoint, "retrying upload completion");
        complete_upload(&self.api, target, cancel).await
    }
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    negotiation: Option<NegotiationResult>,
    plan: Option<ChunkPlan>,
    result: Option<CompletionResult>,
}

/// One upload, from negotiation to completion.
pub struct UploadSession {
    id: String,
    client: UploadClient,
    request: UploadRequest,
    source: Arc<dyn UploadSource>,
    state: RwLock<SessionState>,
    chunks: ChunkTable,
    progress: ProgressTracker,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<UploadEvent>>>,
}

impl UploadSession {
    fn new(client: UploadClient, request: UploadRequest, source: Arc<dyn UploadSource>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(256);

        let progress = ProgressTracker::new();
        let tx = events_tx.clone();
        let session_id = id.clone();
        progress.on_progress(Box::new(move |progress: TransferProgress| {
            let _ = tx.try_send(UploadEvent::Progress {
                session_id: session_id.clone(),
                progress,
            });
        }));

        Self {
            id,
            client,
            request,
            source,
            state: RwLock::new(SessionState {
                status: SessionStatus::Pending,
                negotiation: None,
                plan: None,
                result: None,
            }),
            chunks: ChunkTable::new(),
            progress,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &UploadRequest {
        &self.request
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Events are dropped while the channel is full.
    pub fn take_events(&self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn status(&self) -> SessionStatus {
        self.read_state().status
    }

    pub fn progress(&self) -> TransferProgress {
        self.progress.snapshot()
    }

    pub fn chunk_states(&self) -> Vec<ChunkState> {
        self.chunks.snapshot()
    }

    pub fn negotiation(&self) -> Option<NegotiationResult> {
        self.read_state().negotiation.clone()
    }

    pub fn plan(&self) -> Option<ChunkPlan> {
        self.read_state().plan.clone()
    }

    /// Completion result, once the session has succeeded.
    pub fn result(&self) -> Option<CompletionResult> {
        self.read_state().result.clone()
    }

    /// Cancels the session.
    ///
    /// Returns `false` once the session is completing or finished, in which
    /// case nothing changes.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.write_state();
            if !state.status.is_cancellable() {
                return false;
            }
            state.status = SessionStatus::Cancelled;
        }
        self.cancel.cancel();
        info!(session = %self.id, "upload cancelled");
        self.emit(UploadEvent::StatusChanged {
            session_id: self.id.clone(),
            status: SessionStatus::Cancelled,
        });
        true
    }

    /// Runs the upload to completion.
    ///
    /// `negotiation_endpoint` is relative to the API base, or an absolute
    /// URL. A session cancelled before starting yields
    /// [`UploadError::Cancelled`]; any other non-pending session fails with
    /// [`UploadError::InvalidState`].
    pub async fn start(&self, negotiation_endpoint: &str) -> Result<CompletionResult, UploadError> {
        {
            let mut state = self.write_state();
            if state.status == SessionStatus::Cancelled {
                return Err(UploadError::Cancelled);
            }
            if state.status != SessionStatus::Pending {
                return Err(UploadError::InvalidState(format!(
                    "cannot start a session that is {}",
                    state.status
                )));
            }
            state.status = SessionStatus::Negotiating;
        }
        self.emit_status(SessionStatus::Negotiating);
        info!(session = %self.id, file = %self.request.filename, size = self.request.size, "upload started");

        match self.run(negotiation_endpoint).await {
            Ok(result) => {
                self.advance(SessionStatus::Succeeded)?;
                self.write_state().result = Some(result.clone());
                info!(session = %self.id, blob = %result.blob_id, size = result.size_bytes, "upload completed");
                self.emit(UploadEvent::Completed {
                    session_id: self.id.clone(),
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn run(&self, negotiation_endpoint: &str) -> Result<CompletionResult, UploadError> {
        if self.source.len() != self.request.size {
            return Err(UploadError::InvalidPlan(format!(
                "source holds {} bytes but the request declares {}",
                self.source.len(),
                self.request.size
            )));
        }

        let negotiation = self.negotiate(negotiation_endpoint).await?;
        let plan = match &negotiation {
            NegotiationResult::DirectPut { block_size, .. } => {
                plan_direct_put(self.request.size, *block_size)
            }
            NegotiationResult::S3Multipart { .. } => plan_s3(self.request.size),
        };
        validate_plan(&plan)?;
        debug!(session = %self.id, chunks = plan.len(), chunk_size = plan.chunk_size, framing = ?plan.framing, "chunk plan ready");
        {
            let mut state = self.write_state();
            state.negotiation = Some(negotiation.clone());
            state.plan = Some(plan.clone());
        }

        self.advance(SessionStatus::Transferring)?;
        let endpoint = match negotiation {
            NegotiationResult::DirectPut {
                put_url,
                complete_endpoint,
                ..
            } => {
                self.transfer_direct(&plan, put_url).await?;
                complete_endpoint
            }
            NegotiationResult::S3Multipart {
                upload_session_id,
                bucket_host,
                bucket_name,
                region,
                object_key,
            } => {
                let object = S3Object {
                    host: bucket_host,
                    bucket: bucket_name,
                    key: object_key,
                    region,
                };
                self.transfer_s3(&plan, &upload_session_id, object).await?;
                s3_session_action(&upload_session_id, HANDLE_COMPLETE_ACTION)
            }
        };

        let expected_sha256 = match self.client.hash_policy {
            HashPolicy::Verify => Some(sha256_hex(self.source.as_ref()).await?),
            HashPolicy::TrustServer => None,
        };
        let target = CompletionTarget {
            endpoint,
            expected_size: self.request.size,
            mime_type: self.request.mime_type.clone(),
            expected_sha256,
        };

        self.advance(SessionStatus::Completing)?;
        complete_upload(&self.client.api, &target, &self.cancel).await
    }

    async fn negotiate(&self, endpoint: &str) -> Result<NegotiationResult, UploadError> {
        let body = NegotiateRequest::from(&self.request);
        let data: NegotiationData = self
            .client
            .api
            .post(endpoint, &body, &self.cancel)
            .await
            .map_err(UploadError::from_negotiation)?;
        let negotiation = data
            .classify()
            .map_err(|e| UploadError::from_negotiation(e.into()))?;
        info!(session = %self.id, method = %negotiation.method(), "upload negotiated");
        Ok(negotiation)
    }

    async fn transfer_direct(&self, plan: &ChunkPlan, put_url: String) -> Result<(), UploadError> {
        if plan.max_chunk_bytes() > LARGE_BODY_BYTES {
            warn!(
                session = %self.id,
                bytes = plan.max_chunk_bytes(),
                "server sent no block size, the whole file is buffered for a single PUT"
            );
        }
        let uploader = DirectPutUploader::new(
            self.client.api.transport().clone(),
            put_url,
            &self.request.mime_type,
            plan.framing,
        );
        self.client
            .engine
            .run(
                plan,
                self.source.as_ref(),
                &uploader,
                &self.chunks,
                &self.progress,
                &self.cancel,
            )
            .await?;
        Ok(())
    }

    async fn transfer_s3(
        &self,
        plan: &ChunkPlan,
        upload_session_id: &str,
        object: S3Object,
    ) -> Result<(), UploadError> {
        let s3 = S3Client::new(
            self.client.api.transport().clone(),
            SigningClient::new(self.client.api.clone(), upload_session_id),
            object,
            self.client.retry.clone(),
        );
        let upload_id = s3
            .initiate(&self.request.mime_type, &self.cancel)
            .await
            .map_err(|e| e.into_upload_error("initiate"))?;

        let result = self.transfer_parts(&s3, plan, &upload_id).await;
        if let Err(e) = &result {
            // Fresh token: the session token may be the reason we are here.
            let abort_cancel = CancellationToken::new();
            match s3.abort(&upload_id, &abort_cancel).await {
                Ok(()) => info!(session = %self.id, upload_id = %upload_id, error = %e, "multipart upload aborted"),
                Err(abort_err) => {
                    warn!(session = %self.id, upload_id = %upload_id, error = %abort_err, "failed to abort multipart upload")
                }
            }
        }
        result
    }

    async fn transfer_parts(
        &self,
        s3: &S3Client,
        plan: &ChunkPlan,
        upload_id: &str,
    ) -> Result<(), UploadError> {
        let uploader = S3PartUploader::new(s3, upload_id);
        self.client
            .engine
            .run(
                plan,
                self.source.as_ref(),
                &uploader,
                &self.chunks,
                &self.progress,
                &self.cancel,
            )
            .await?;

        let receipts = self.chunks.receipts().ok_or_else(|| {
            UploadError::InvalidState("transfer finished with incomplete parts".into())
        })?;
        let parts = plan
            .chunks
            .iter()
            .zip(receipts)
            .map(|(chunk, receipt)| {
                receipt
                    .etag
                    .map(|etag| (chunk.part_number(), etag))
                    .ok_or_else(|| UploadError::Storage {
                        operation: "upload part",
                        status: None,
                        message: format!("part {} has no ETag", chunk.part_number()),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        s3.complete(upload_id, &parts, &self.cancel)
            .await
            .map_err(|e| e.into_upload_error("complete"))
    }

    /// Moves to `next`. A cancelled session surfaces as `Cancelled`.
    fn advance(&self, next: SessionStatus) -> Result<(), UploadError> {
        {
            let mut state = self.write_state();
            if state.status == SessionStatus::Cancelled {
                return Err(UploadError::Cancelled);
            }
            if !state.status.can_transition_to(next) {
                return Err(UploadError::InvalidState(format!(
                    "cannot move from {} to {next}",
                    state.status
                )));
            }
            state.status = next;
        }
        debug!(session = %self.id, status = %next, "session status changed");
        self.emit_status(next);
        Ok(())
    }

    /// Records a failure and returns the error to surface.
    fn fail(&self, err: UploadError) -> UploadError {
        let status = {
            let mut state = self.write_state();
            if state.status == SessionStatus::Cancelled {
                return UploadError::Cancelled;
            }
            let next = if err.is_cancelled() && state.status.is_cancellable() {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Failed
            };
            if state.status.can_transition_to(next) {
                state.status = next;
            }
            state.status
        };
        self.emit_status(status);
        if status == SessionStatus::Cancelled {
            info!(session = %self.id, "upload cancelled");
        } else {
            error!(session = %self.id, error = %err, "upload failed");
            self.emit(UploadEvent::Failed {
                session_id: self.id.clone(),
                error: err.to_string(),
            });
        }
        err
    }

    fn emit_status(&self, status: SessionStatus) {
        self.emit(UploadEvent::StatusChanged {
            session_id: self.id.clone(),
            status,
        });
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// POSTs the completion endpoint and checks the result against the target.
async fn complete_upload(
    api: &ApiClient,
    target: &CompletionTarget,
    cancel: &CancellationToken,
) -> Result<CompletionResult, UploadError> {
    let data: CompletionData = api
        .post(&target.endpoint, &serde_json::json!({}), cancel)
        .await
        .map_err(|e| UploadError::from_completion(e, target))?;
    let result = data
        .into_result(&target.mime_type)
        .map_err(|e| UploadError::from_completion(e.into(), target))?;

    let mismatch = |message: String| UploadError::Completion {
        message,
        target: Some(Box::new(target.clone())),
    };
    if result.size_bytes != target.expected_size {
        return Err(mismatch(format!(
            "server reports {} bytes, expected {}",
            result.size_bytes, target.expected_size
        )));
    }
    if let Some(expected) = &target.expected_sha256 {
        match &result.sha256 {
            Some(actual) if !actual.eq_ignore_ascii_case(expected) => {
                return Err(mismatch(format!(
                    "server reports SHA-256 {actual}, expected {expected}"
                )));
            }
            Some(_) => {}
            None => warn!(blob = %result.blob_id, "server reported no SHA-256, skipping verification"),
        }
    }
    Ok(result)
}

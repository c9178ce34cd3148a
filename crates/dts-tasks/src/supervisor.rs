use crate::checkpoint;
use crate::task::{EngineContext, TransferTask};
use chrono::Utc;
use dts_core::{DtsError, Endpoint, Registry, Result, TransferStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Client payload of a Create message
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub orcid: String,
    pub source: String,
    pub destination: String,
    pub file_ids: Vec<String>,
}

enum SupervisorRequest {
    Create {
        request: TransferRequest,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Status {
        id: Uuid,
        reply: oneshot::Sender<Result<TransferStatus>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Result<TransferStatus>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Which sub-operation a cancellation worker was pointed at. Only the
/// payload transfer carries the task's file counts; the manifest delivery is
/// a single-file sub-transfer whose counters must never reach the task.
#[derive(Clone, Copy)]
enum CancelTarget {
    /// No endpoint work yet (queued or staging)
    Queued,
    Payload,
    Manifest,
}

/// Final status delivered by a detached cancellation worker
struct CancelOutcome {
    id: Uuid,
    target: CancelTarget,
    status: TransferStatus,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub poll_interval: Duration,
    /// Retention of completed tasks before lazy deletion
    pub delete_after: Duration,
    /// Directory holding the task checkpoint
    pub data_dir: PathBuf,
}

/// Cloneable handle through which clients talk to the supervisor
#[derive(Clone)]
pub struct TaskClient {
    tx: mpsc::Sender<SupervisorRequest>,
}

impl TaskClient {
    pub async fn create(&self, request: TransferRequest) -> Result<Uuid> {
        self.roundtrip(|reply| SupervisorRequest::Create { request, reply })
            .await
    }

    pub async fn status(&self, id: Uuid) -> Result<TransferStatus> {
        self.roundtrip(|reply| SupervisorRequest::Status { id, reply })
            .await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<TransferStatus> {
        self.roundtrip(|reply| SupervisorRequest::Cancel { id, reply })
            .await
    }

    /// Checkpoint the task table and halt the supervisor
    pub async fn stop(&self) -> Result<()> {
        self.roundtrip(|reply| SupervisorRequest::Stop { reply })
            .await
    }

    async fn roundtrip<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<T>>) -> SupervisorRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(message(reply))
            .await
            .map_err(|_| DtsError::Transfer("task supervisor is not running".into()))?;
        response
            .await
            .map_err(|_| DtsError::Transfer("task supervisor dropped the request".into()))?
    }
}

/// Single writer over the task table.
///
/// All task mutation happens on one loop: client messages and poll ticks are
/// serialized through channels, and cancellation workers hand their final
/// statuses back over a channel instead of touching tasks themselves.
pub struct TaskSupervisor;

impl TaskSupervisor {
    /// Load the checkpoint (if any) and start the supervisor and heartbeat
    pub async fn spawn(
        options: SupervisorOptions,
        registry: Arc<Registry>,
        local_endpoint: Arc<dyn Endpoint>,
    ) -> (TaskClient, JoinHandle<()>) {
        let tasks = checkpoint::load(&checkpoint::checkpoint_path(&options.data_dir)).await;
        if !tasks.is_empty() {
            info!("Resuming {} task(s) from checkpoint", tasks.len());
        }
        reconcile_endpoints(&registry).await;

        let ctx = EngineContext {
            registry,
            local_endpoint,
            call_timeout: options.poll_interval,
        };

        let (request_tx, request_rx) = mpsc::channel(64);
        // Capacity 1: a tick that arrives while one is pending coalesces
        let (poll_tx, poll_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();

        let heartbeat_token = CancellationToken::new();
        spawn_heartbeat(options.poll_interval, poll_tx, heartbeat_token.clone());

        let handle = tokio::spawn(run_loop(
            tasks,
            ctx,
            options,
            request_rx,
            poll_rx,
            cancel_rx,
            cancel_tx,
            heartbeat_token,
        ));

        (TaskClient { tx: request_tx }, handle)
    }
}

/// Log transfers the endpoints still consider active, so operators can match
/// them against the resumed task table
async fn reconcile_endpoints(registry: &Arc<Registry>) {
    for (name, endpoint) in registry.endpoints() {
        let listed = tokio::time::timeout(Duration::from_secs(5), endpoint.transfers()).await;
        match listed {
            Ok(Ok(handles)) if handles.is_empty() => {}
            Ok(Ok(handles)) => debug!(
                "Endpoint '{}' reports {} active transfer(s) at startup",
                name,
                handles.len()
            ),
            Ok(Err(e)) => debug!("Endpoint '{}' reconciliation failed: {}", name, e),
            Err(_) => debug!("Endpoint '{}' reconciliation timed out", name),
        }
    }
}

fn spawn_heartbeat(
    interval: Duration,
    poll_tx: mpsc::Sender<()>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = poll_tx.try_send(());
                }
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut tasks: HashMap<Uuid, TransferTask>,
    ctx: EngineContext,
    options: SupervisorOptions,
    mut request_rx: mpsc::Receiver<SupervisorRequest>,
    mut poll_rx: mpsc::Receiver<()>,
    mut cancel_rx: mpsc::UnboundedReceiver<CancelOutcome>,
    cancel_tx: mpsc::UnboundedSender<CancelOutcome>,
    heartbeat_token: CancellationToken,
) {
    let checkpoint_path = checkpoint::checkpoint_path(&options.data_dir);

    loop {
        tokio::select! {
            // Client messages take precedence so their arrival order is the
            // processing order; poll ticks tolerate any interleaving
            biased;

            request = request_rx.recv() => {
                let Some(request) = request else {
                    // Every client handle dropped; checkpoint and bow out
                    if let Err(e) = checkpoint::save(&tasks, &checkpoint_path).await {
                        error!("Checkpoint on shutdown failed: {}", e);
                    }
                    break;
                };
                match request {
                    SupervisorRequest::Create { request, reply } => {
                        let _ = reply.send(handle_create(&mut tasks, &ctx, request));
                    }
                    SupervisorRequest::Status { id, reply } => {
                        let result = tasks
                            .get(&id)
                            .map(|task| task.status.clone())
                            .ok_or(DtsError::TaskNotFound(id));
                        let _ = reply.send(result);
                    }
                    SupervisorRequest::Cancel { id, reply } => {
                        let _ = reply.send(handle_cancel(&mut tasks, &ctx, &cancel_tx, id));
                    }
                    SupervisorRequest::Stop { reply } => {
                        let result = checkpoint::save(&tasks, &checkpoint_path).await;
                        if result.is_ok() {
                            info!("Checkpointed {} task(s) to {}", tasks.len(), checkpoint_path.display());
                        }
                        let _ = reply.send(result);
                        break;
                    }
                }
            }

            Some(outcome) = cancel_rx.recv() => {
                apply_cancel_outcome(&mut tasks, outcome);
            }

            Some(()) = poll_rx.recv() => {
                poll(&mut tasks, &ctx, &options).await;
            }
        }
    }

    heartbeat_token.cancel();
    info!("Task supervisor stopped");
}

fn handle_create(
    tasks: &mut HashMap<Uuid, TransferTask>,
    ctx: &EngineContext,
    request: TransferRequest,
) -> Result<Uuid> {
    if request.file_ids.is_empty() {
        return Err(DtsError::InvalidRequest("no file ids given".into()));
    }
    if request.orcid.is_empty() {
        return Err(DtsError::InvalidRequest("no ORCID given".into()));
    }
    for file_id in &request.file_ids {
        // Ids are endpoint-relative paths; keep them inside the root
        if file_id.starts_with('/') || file_id.split('/').any(|part| part == "..") {
            return Err(DtsError::InvalidRequest(format!(
                "illegal file id '{file_id}'"
            )));
        }
    }
    for database in [&request.source, &request.destination] {
        if !ctx.registry.has_database(database) {
            return Err(DtsError::InvalidRequest(format!(
                "unknown database '{database}'"
            )));
        }
    }

    let task = TransferTask::new(
        request.orcid,
        request.source,
        request.destination,
        request.file_ids,
    );
    let id = task.id;
    info!(
        "Task {}: created ({} -> {}, {} file(s))",
        id,
        task.source,
        task.destination,
        task.file_ids.len()
    );
    tasks.insert(id, task);
    Ok(id)
}

fn handle_cancel(
    tasks: &mut HashMap<Uuid, TransferTask>,
    ctx: &EngineContext,
    cancel_tx: &mpsc::UnboundedSender<CancelOutcome>,
    id: Uuid,
) -> Result<TransferStatus> {
    let Some(task) = tasks.get_mut(&id) else {
        return Err(DtsError::TaskNotFound(id));
    };
    if task.is_terminal() {
        return Err(DtsError::TaskAlreadyTerminal(id));
    }
    if task.canceled {
        // Cancel is idempotent; the first worker is already on it
        return Ok(task.status.clone());
    }

    task.canceled = true;
    let reply = task.status.clone();

    // Map the task to whichever sub-operation is currently active. Staging
    // handles belong to the database, not the endpoint, so a task that has
    // not reached its payload transfer has no endpoint work to cancel.
    let (endpoint, handle, target) = if let Some(handle) = task.payload_transfer {
        match ctx.registry.database(&task.source) {
            Ok(database) => (database.endpoint(), Some(handle), CancelTarget::Payload),
            Err(e) => {
                warn!("Task {}: cancellation cannot resolve source: {}", id, e);
                (ctx.local_endpoint.clone(), None, CancelTarget::Queued)
            }
        }
    } else if let Some(handle) = task.manifest_transfer {
        (ctx.local_endpoint.clone(), Some(handle), CancelTarget::Manifest)
    } else {
        (ctx.local_endpoint.clone(), None, CancelTarget::Queued)
    };

    info!("Task {}: cancellation requested", id);
    let outcomes = cancel_tx.clone();
    tokio::spawn(cancel_worker(id, endpoint, handle, target, outcomes));

    Ok(reply)
}

/// Detached worker: ask the endpoint to cancel, then poll at one-second
/// intervals until it reports a terminal status. Errors are logged only.
async fn cancel_worker(
    id: Uuid,
    endpoint: Arc<dyn Endpoint>,
    handle: Option<Uuid>,
    target: CancelTarget,
    outcomes: mpsc::UnboundedSender<CancelOutcome>,
) {
    let status = match handle {
        None => TransferStatus::failed("transfer canceled"),
        Some(handle) => {
            if let Err(e) = endpoint.cancel(handle).await {
                warn!("Task {}: endpoint cancel failed: {}", id, e);
            }
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                match endpoint.status(handle).await {
                    Ok(status) if status.is_terminal() => break status,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Task {}: status poll during cancellation failed: {}", id, e);
                        break TransferStatus::failed("transfer canceled");
                    }
                }
            }
        }
    };

    let _ = outcomes.send(CancelOutcome { id, target, status });
}

fn apply_cancel_outcome(tasks: &mut HashMap<Uuid, TransferTask>, outcome: CancelOutcome) {
    let Some(task) = tasks.get_mut(&outcome.id) else {
        return;
    };

    task.staging = None;
    task.payload_transfer = None;
    task.manifest_transfer = None;
    if let Some(path) = task.manifest_file.take() {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Cannot remove manifest {}: {}", path.display(), e);
        }
    }

    task.status.code = outcome.status.code;
    task.status.message = outcome
        .status
        .message
        .or_else(|| Some("transfer canceled".into()));
    match outcome.target {
        CancelTarget::Payload => {
            // The canceled sub-transfer carries the task's file counts;
            // every file not transferred by cancellation time is skipped
            task.status.num_files_transferred = outcome.status.num_files_transferred;
            task.status.num_files_skipped = task.status.num_files
                - task.status.num_files_transferred.min(task.status.num_files);
        }
        CancelTarget::Queued => {
            task.status.num_files_skipped = task.status.num_files
                - task.status.num_files_transferred.min(task.status.num_files);
        }
        CancelTarget::Manifest => {
            // The payload already landed in full; the single-file manifest
            // delivery's counters must not overwrite those counts
        }
    }
    task.completion_time = Some(Utc::now());

    info!(
        "Task {}: canceled with status {}",
        outcome.id, task.status.code
    );
}

/// One heartbeat tick: update every live task, then apply retention
async fn poll(
    tasks: &mut HashMap<Uuid, TransferTask>,
    ctx: &EngineContext,
    options: &SupervisorOptions,
) {
    let now = Utc::now();
    let mut expired: Vec<Uuid> = Vec::new();

    let ids: Vec<Uuid> = tasks.keys().copied().collect();
    for id in ids {
        let Some(task) = tasks.get_mut(&id) else {
            continue;
        };

        if let Some(completed) = task.completion_time {
            let age = (now - completed).to_std().unwrap_or_default();
            if age > options.delete_after {
                expired.push(id);
            }
            continue;
        }

        // The cancellation worker owns canceled tasks
        if task.canceled {
            continue;
        }

        let before = task.status.code;
        if let Err(e) = task.update(ctx).await {
            warn!("Task {}: transient error, will retry: {}", id, e);
        }
        let after = task.status.code;
        if before != after {
            info!("Task {}: status {} -> {}", id, before, after);
        }
    }

    for id in expired {
        tasks.remove(&id);
        info!("Task {}: deleted after retention period", id);
    }
}

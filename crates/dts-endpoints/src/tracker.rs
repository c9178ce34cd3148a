use dts_core::{DtsError, Result, TransferStatus, TransferStatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct TrackedTransfer {
    status: TransferStatus,
    canceled: bool,
}

/// Handle table for endpoints that run their transfers in-process.
///
/// Workers update their entry as files complete; `cancel` only raises a flag
/// so it returns promptly, and the worker marks the transfer failed when it
/// next checks.
#[derive(Clone, Default)]
pub(crate) struct TransferTracker {
    transfers: Arc<Mutex<HashMap<Uuid, TrackedTransfer>>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transfer in the `Active` state and return its handle
    pub async fn register(&self, num_files: usize) -> Uuid {
        let handle = Uuid::new_v4();
        let status = TransferStatus {
            code: TransferStatusCode::Active,
            num_files,
            ..Default::default()
        };
        self.transfers.lock().await.insert(
            handle,
            TrackedTransfer {
                status,
                canceled: false,
            },
        );
        handle
    }

    pub async fn status(&self, handle: Uuid) -> Result<TransferStatus> {
        self.transfers
            .lock()
            .await
            .get(&handle)
            .map(|t| t.status.clone())
            .ok_or(DtsError::UnknownTransfer(handle))
    }

    pub async fn cancel(&self, handle: Uuid) -> Result<()> {
        let mut transfers = self.transfers.lock().await;
        let transfer = transfers
            .get_mut(&handle)
            .ok_or(DtsError::UnknownTransfer(handle))?;
        if !transfer.status.is_terminal() {
            transfer.canceled = true;
        }
        Ok(())
    }

    pub async fn is_canceled(&self, handle: Uuid) -> bool {
        self.transfers
            .lock()
            .await
            .get(&handle)
            .map(|t| t.canceled)
            .unwrap_or(false)
    }

    /// Apply a status mutation from a transfer worker
    pub async fn update(&self, handle: Uuid, apply: impl FnOnce(&mut TransferStatus)) {
        if let Some(transfer) = self.transfers.lock().await.get_mut(&handle) {
            apply(&mut transfer.status);
        }
    }

    pub async fn active_handles(&self) -> Vec<Uuid> {
        self.transfers
            .lock()
            .await
            .iter()
            .filter(|(_, t)| !t.status.is_terminal())
            .map(|(handle, _)| *handle)
            .collect()
    }
}

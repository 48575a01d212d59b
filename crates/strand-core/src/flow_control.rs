//! Send-side back-pressure for streaming calls.
//!
//! Every call gets a byte budget (the watermark). A message reserves part of
//! the budget before it is queued for the transport and hands it back once it
//! has been written or discarded, so a writer that outpaces the connection
//! suspends instead of growing the outgoing buffer without bound.

use crate::error::Status;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Default per-call outgoing buffer watermark (64KB)
pub const DEFAULT_SEND_WATERMARK: usize = 64 * 1024;

/// Byte budget for messages that are queued but not yet written
#[derive(Debug, Clone)]
pub struct SendWindow {
    budget: Arc<Semaphore>,
    watermark: u32,
}

/// Budget held by one queued message; returned on drop
#[derive(Debug)]
pub struct SendPermit {
    _permit: OwnedSemaphorePermit,
}

impl SendWindow {
    pub fn new(watermark: usize) -> Self {
        let watermark = watermark.clamp(1, u32::MAX as usize) as u32;
        Self {
            budget: Arc::new(Semaphore::new(watermark as usize)),
            watermark,
        }
    }

    /// Budget a message of `len` bytes costs.
    ///
    /// Messages larger than the watermark cost the whole window, so they are
    /// sent alone rather than never.
    fn cost(&self, len: usize) -> u32 {
        (len.min(self.watermark as usize) as u32).max(1)
    }

    /// Wait until `len` bytes fit under the watermark
    pub async fn reserve(&self, len: usize) -> Result<SendPermit, Status> {
        let permit = Arc::clone(&self.budget)
            .acquire_many_owned(self.cost(len))
            .await
            .map_err(|_| Status::cancelled("send window closed"))?;
        Ok(SendPermit { _permit: permit })
    }

    /// Reserve without waiting; `Ok(None)` when the window is full
    pub fn try_reserve(&self, len: usize) -> Result<Option<SendPermit>, Status> {
        match Arc::clone(&self.budget).try_acquire_many_owned(self.cost(len)) {
            Ok(permit) => Ok(Some(SendPermit { _permit: permit })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(Status::cancelled("send window closed")),
        }
    }

    /// Fail current and future reservations
    pub fn close(&self) {
        self.budget.close();
    }

    pub fn is_closed(&self) -> bool {
        self.budget.is_closed()
    }

    /// Bytes that can be queued right now
    pub fn available(&self) -> usize {
        self.budget.available_permits()
    }

    pub fn watermark(&self) -> usize {
        self.watermark as usize
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_WATERMARK)
    }
}

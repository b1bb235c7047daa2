//! Bounded admission of turns.
//!
//! At most `capacity` turns hold a ticket at any moment; everyone else waits
//! in FIFO order. The ticket is an owned semaphore permit, so it is released
//! when dropped on every exit path of the turn.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::OrchestratorError;

#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of admission; dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
    admitted_at: Instant,
}

impl AdmissionTicket {
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<AdmissionTicket, OrchestratorError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::AdmissionClosed)?;
        Ok(AdmissionTicket {
            _permit: permit,
            admitted_at: Instant::now(),
        })
    }

    /// Refuse all further admissions. Waiters fail with `AdmissionClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

//! Session bookkeeping owned by the server's acceptance side.
//!
//! - `SessionSlot`: at most one benchmark session at a time; a second
//!   request is rejected, never queued.
//! - `ChannelRegistry`: hands the most recently connected acknowledgment
//!   channel to the next session that asks for one.

use crate::error::SessionError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Exclusive slot for the single active session.
#[derive(Debug, Default)]
pub struct SessionSlot {
    active: AtomicBool,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot. Fails with `Busy` while another session holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Result<SessionGuard, SessionError> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy)?;
        debug!("Session slot acquired");
        Ok(SessionGuard {
            slot: Arc::clone(self),
        })
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Holds the session slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SessionGuard {
    slot: Arc<SessionSlot>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.slot.active.store(false, Ordering::Release);
        debug!("Session slot released");
    }
}

/// Most recently connected acknowledgment channel, waiting for a session.
#[derive(Debug)]
pub struct ChannelRegistry<C> {
    slot: Mutex<Option<C>>,
    notify: Notify,
}

impl<C> ChannelRegistry<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    /// Offer a newly accepted channel. Replaces any channel still unclaimed.
    pub fn register(&self, channel: C) {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(channel);
        if previous.is_some() {
            trace!("Replaced unclaimed acknowledgment channel");
        }
        self.notify.notify_one();
    }

    /// Claim the registered channel, waiting up to `wait` for one to arrive.
    pub async fn take(&self, wait: Duration) -> Result<C, SessionError> {
        let deadline = Instant::now() + wait;
        loop {
            let claimed = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(channel) = claimed {
                return Ok(channel);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Err(SessionError::NoChannel);
            }
        }
    }
}

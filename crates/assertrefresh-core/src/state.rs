//! Shared system state and the lock discipline around network calls.
//!
//! Refresh runs with the system-wide state lock held, except while waiting on
//! the network: every transport call goes through `StateGuard::unlocked`,
//! which releases the lock for the duration of the call and takes it back
//! afterwards, whatever the call returned.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::TrustDb;
use crate::error::{RefreshError, Result};
use crate::transport::Transport;
use crate::types::{DeviceContext, UserId, UserIdentity};

/// What refresh needs from the host system's state.
pub trait RefreshState: Send {
    /// The device's trust database.
    fn assertion_db(&self) -> Arc<dyn TrustDb>;

    /// Credentials for a local user, `None` if the id is unknown.
    fn user(&self, id: UserId) -> Option<UserIdentity>;

    /// Transport to use on behalf of the given device.
    fn transport(&self, device: &DeviceContext) -> Arc<dyn Transport>;
}

/// Handle to lock-protected system state.
pub struct SharedState<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> SharedState<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn lock(&self) -> StateGuard<S> {
        let held = Arc::clone(&self.inner).lock_owned().await;
        StateGuard {
            state: Arc::clone(&self.inner),
            held: Some(held),
        }
    }

    pub fn try_lock(&self) -> Option<StateGuard<S>> {
        let held = Arc::clone(&self.inner).try_lock_owned().ok()?;
        Some(StateGuard {
            state: Arc::clone(&self.inner),
            held: Some(held),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// The state lock, held by the current refresh.
pub struct StateGuard<S> {
    state: Arc<Mutex<S>>,
    held: Option<OwnedMutexGuard<S>>,
}

impl<S> StateGuard<S> {
    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    pub fn get(&self) -> Result<&S> {
        self.held.as_deref().ok_or(RefreshError::StateNotLocked)
    }

    pub fn get_mut(&mut self) -> Result<&mut S> {
        self.held.as_deref_mut().ok_or(RefreshError::StateNotLocked)
    }

    /// Await `fut` with the lock released, then re-acquire it.
    ///
    /// If this future is dropped before completing, the lock is taken back
    /// only if it is free at that moment. Otherwise `get` reports
    /// `StateNotLocked` until `relock` is awaited.
    pub async fn unlocked<F: Future>(&mut self, fut: F) -> F::Output {
        self.held = None;
        let relock = Relock { guard: self };
        let out = fut.await;
        relock.finish().await;
        out
    }

    /// Wait for the lock if a cancelled `unlocked` call could not take it back.
    pub async fn relock(&mut self) {
        if self.held.is_none() {
            self.held = Some(Arc::clone(&self.state).lock_owned().await);
        }
    }
}

impl<S: RefreshState> StateGuard<S> {
    /// Credentials for `id`; `0` means anonymous.
    pub fn user(&self, id: UserId) -> Result<Option<UserIdentity>> {
        if id == 0 {
            return Ok(None);
        }
        self.get()?
            .user(id)
            .map(Some)
            .ok_or(RefreshError::UnknownUser(id))
    }
}

struct Relock<'a, S> {
    guard: &'a mut StateGuard<S>,
}

impl<S> Relock<'_, S> {
    async fn finish(self) {
        let held = Arc::clone(&self.guard.state).lock_owned().await;
        self.guard.held = Some(held);
    }
}

impl<S> Drop for Relock<'_, S> {
    fn drop(&mut self) {
        if self.guard.held.is_none() {
            self.guard.held = Arc::clone(&self.guard.state).try_lock_owned().ok();
        }
    }
}

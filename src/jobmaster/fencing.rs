//! Leadership session fencing
//!
//! Every grant, revoke and close advances a per-job generation counter. Work
//! started under a session carries the generation it was started with and is
//! refused once the counter has moved on, even while the process behind it
//! is still shutting down.

use crate::common::{Error, JobId, Result, SessionToken};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Session token paired with the generation it was granted at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencingToken {
    generation: u64,
    session: SessionToken,
}

impl FencingToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> SessionToken {
        self.session
    }
}

/// Per-job generation counter.
///
/// Only the runner mailbox advances it; everyone else compares against it.
#[derive(Debug)]
pub struct SessionFence {
    job_id: JobId,
    generation: AtomicU64,
    current: RwLock<Option<FencingToken>>,
}

impl SessionFence {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            generation: AtomicU64::new(0),
            current: RwLock::new(None),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Install `session` as the current one, invalidating every older token.
    pub fn grant(&self, session: SessionToken) -> FencingToken {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = FencingToken {
            generation,
            session,
        };
        *current = Some(token);
        token
    }

    /// Invalidate every outstanding token without installing a new one.
    pub fn revoke(&self) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *current = None;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<FencingToken> {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_current(&self, token: &FencingToken) -> bool {
        self.generation.load(Ordering::SeqCst) == token.generation
    }

    pub fn check(&self, token: &FencingToken) -> Result<()> {
        if self.is_current(token) {
            Ok(())
        } else {
            Err(Error::StaleSession {
                job_id: self.job_id,
                session: token.session,
            })
        }
    }
}

/// A fencing token bound to the fence that issued it.
///
/// Handed to everything that acts on behalf of one leadership session so it
/// can check, right before acting, that the session is still current.
#[derive(Debug, Clone)]
pub struct SessionGuard {
    token: FencingToken,
    fence: Arc<SessionFence>,
}

impl SessionGuard {
    pub fn new(token: FencingToken, fence: Arc<SessionFence>) -> Self {
        Self { token, fence }
    }

    pub fn job_id(&self) -> JobId {
        self.fence.job_id()
    }

    pub fn token(&self) -> FencingToken {
        self.token
    }

    pub fn session(&self) -> SessionToken {
        self.token.session
    }

    pub fn is_valid(&self) -> bool {
        self.fence.is_current(&self.token)
    }

    pub fn check(&self) -> Result<()> {
        self.fence.check(&self.token)
    }
}

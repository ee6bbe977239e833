//! Per-volume dedup markers for resize workers.
//!
//! A worker must hold a `ClaimGuard` for a volume before mutating it.
//! Dropping the guard releases the claim, so every exit path of a worker
//! gives the volume back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use warpgrid_volume::VolumeId;

#[derive(Default)]
struct Claims {
    /// Claimed identity → token of the current holder.
    held: HashMap<VolumeId, u64>,
    next_token: u64,
}

/// Concurrent set of volumes with a resize in flight.
#[derive(Clone, Default)]
pub struct InFlight {
    claims: Arc<Mutex<Claims>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically claim `id`. Returns `None` if another worker holds it.
    pub fn try_claim(&self, id: &VolumeId) -> Option<ClaimGuard> {
        let mut claims = self.lock();
        if claims.held.contains_key(id) {
            return None;
        }
        claims.next_token += 1;
        let token = claims.next_token;
        claims.held.insert(id.clone(), token);
        Some(ClaimGuard {
            claims: self.clone(),
            id: id.clone(),
            token,
        })
    }

    /// Force-release a claim regardless of holder (volume deleted).
    ///
    /// The outstanding guard, if any, becomes inert and will not release a
    /// claim taken after this call.
    pub fn release(&self, id: &VolumeId) -> bool {
        self.lock().held.remove(id).is_some()
    }

    pub fn is_claimed(&self, id: &VolumeId) -> bool {
        self.lock().held.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof of an exclusive claim on one volume. Releases on drop.
pub struct ClaimGuard {
    claims: InFlight,
    id: VolumeId,
    token: u64,
}

impl ClaimGuard {
    pub fn id(&self) -> &VolumeId {
        &self.id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claims = self.claims.lock();
        if claims.held.get(&self.id) == Some(&self.token) {
            claims.held.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("id", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

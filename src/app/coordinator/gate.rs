//! Per-fingerprint single-flight gate
//!
//! The coordinator serializes work per cache key: the first caller for
//! a fingerprint installs a gate and proceeds; later callers wait for
//! the gate to release, then re-probe the cache, because by wakeup time
//! the prior holder has already populated (or failed to populate) it.
//!
//! A gate is a watch channel used purely as a one-shot completion
//! signal: the holder keeps the sender inside a drop guard, and waiters
//! observe channel closure. Dropping the guard on any exit path wakes
//! every waiter at once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::app::fingerprint::Fingerprint;
use crate::errors::{DownloadError, DownloadResult, Phase, NO_BYTES_RECEIVED};

#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    in_progress: Mutex<HashMap<Fingerprint, watch::Receiver<()>>>,
}

/// Held by the caller that owns the in-flight slot for a fingerprint.
/// Dropping it removes the mapping and wakes all waiters.
#[derive(Debug)]
pub(crate) struct FlightGuard<'a> {
    gates: &'a SingleFlight,
    fingerprint: Fingerprint,
    _release: watch::Sender<()>,
}

impl SingleFlight {
    /// Acquire the gate for `fingerprint`, waiting for any current
    /// holder. Errs with a cancellation in phase `acquire-limiter` if
    /// the cancel signal fires while waiting.
    pub async fn acquire(
        &self,
        fingerprint: Fingerprint,
        cancel: &CancellationToken,
    ) -> DownloadResult<FlightGuard<'_>> {
        let started = Instant::now();
        loop {
            let mut occupied = {
                let mut gates = self.locked();
                match gates.get(&fingerprint) {
                    Some(receiver) => receiver.clone(),
                    None => {
                        let (sender, receiver) = watch::channel(());
                        gates.insert(fingerprint, receiver);
                        return Ok(FlightGuard {
                            gates: self,
                            fingerprint,
                            _release: sender,
                        });
                    }
                }
            };

            tokio::select! {
                // Err means the holder dropped its sender; either way,
                // loop around and re-contend for the slot.
                _ = occupied.changed() => {}
                _ = cancel.cancelled() => {
                    return Err(DownloadError::Cancelled {
                        phase: Phase::AcquireLimiter,
                        elapsed: started.elapsed(),
                        written: NO_BYTES_RECEIVED,
                    });
                }
            }
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<Fingerprint, watch::Receiver<()>>> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.gates.locked().remove(&self.fingerprint);
        // Dropping the sender closes the channel and wakes waiters.
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use anyhow::bail;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;
use crate::config::JobPoolConfig;
use crate::correlation_id::{CorrelationId, SenderId};
use crate::job_pool::{JobPool, SlotRef};
use crate::outcome::ResponseOutcome;
use crate::package::{Package, PackageHeader};
use crate::send_job::SendJobHandle;

/// Why an admission was refused. Both are expected conditions that callers handle the same way:
///  retry later, or report backpressure to their own caller.
#[derive(Clone, Copy, Eq, PartialEq, Debug, thiserror::Error)]
pub enum AdmitRejection {
    /// the pool's active jobs limit is reached
    #[error("send queue is full")]
    QueueIsFull,
    /// a new slot could not be allocated
    #[error("no memory for a new job slot")]
    OutOfMemory,
}

/// The JobManager admits outbound packages into a connection's [`JobPool`], hands them to the
///  transport in FIFO order, and routes incoming responses back to the job that is waiting
///  for them.
///
/// Typical flow:
/// * a sender calls [`JobManager::admit`] and gets a [`SlotRef`] together with the
///   [`SendJobHandle`] to wait on
/// * the transport thread loops over [`JobManager::peek_next`], sends the package, wakes the
///   job's send waiters and calls [`JobManager::retire`]
/// * the receiving side passes response packages to [`JobManager::route_response`]
///
/// Pool operations take the pool's lock only briefly and never block on a job, so jobs can be
///  waited on without holding up the pool.
pub struct JobManager {
    config: JobPoolConfig,
    active_jobs_limit: AtomicUsize,
}

impl JobManager {
    pub fn new(config: JobPoolConfig) -> anyhow::Result<JobManager> {
        config.validate()?;

        Ok(JobManager {
            active_jobs_limit: AtomicUsize::new(config.active_jobs_limit),
            config,
        })
    }

    pub fn config(&self) -> &JobPoolConfig {
        &self.config
    }

    pub fn active_jobs_limit(&self) -> usize {
        self.active_jobs_limit.load(Ordering::Acquire)
    }

    /// Changes the limit for all pools of this manager, effective with the next admission. A
    ///  limit of 0 would refuse every non-urgent admission and is rejected.
    pub fn set_active_jobs_limit(&self, limit: usize) -> anyhow::Result<()> {
        if limit == 0 {
            warn!("rejecting active jobs limit of 0, keeping {}", self.active_jobs_limit());
            bail!("active jobs limit must be at least 1");
        }

        debug!("setting active jobs limit to {}", limit);
        self.active_jobs_limit.store(limit, Ordering::Release);
        Ok(())
    }

    /// Creates the pool for a new connection
    pub fn init_job_pool(&self) -> Arc<JobPool> {
        Arc::new(JobPool::new(Uuid::new_v4(), self.config.optimal_pool_size))
    }

    /// Convenience for [`JobManager::try_admit`] for callers that do not care why an admission
    ///  was rejected
    pub fn admit(&self, pool: &JobPool, header: PackageHeader, package: Package, urgent: bool) -> Option<(SlotRef, SendJobHandle)> {
        self.try_admit(pool, header, package, urgent).ok()
    }

    /// Places a package at the end of the pool's active queue, reusing a free slot if there is
    ///  one and growing the pool otherwise.
    ///
    /// Non-urgent admissions are rejected once the pool has reached the active jobs limit. Urgent
    ///  admissions (control traffic) bypass the limit.
    ///
    /// The returned handle is created while the pool is still locked, so the caller holds on to
    ///  its job even if the transport retires the slot right away.
    ///
    /// After a burst of traffic, a pool that is mostly idle again is trimmed back towards its
    ///  optimal size. Trimming only removes free slots, and never the slot chosen for this
    ///  admission.
    pub fn try_admit(&self, pool: &JobPool, header: PackageHeader, package: Package, urgent: bool) -> Result<(SlotRef, SendJobHandle), AdmitRejection> {
        let mut inner = pool.inner.write().unwrap();

        let (first_free, num_free) = inner.find_free();

        let index = match first_free {
            Some(index) => {
                inner.slot(index).send_job.reinit();

                let num_slots = inner.num_slots();
                if num_slots > self.config.optimal_pool_size {
                    // the chosen slot counts as busy since it is about to be used
                    let num_non_free = num_slots - num_free + 1;
                    if num_non_free <= self.config.optimal_non_free_pool_size {
                        let removed = inner.remove_free_after(index, num_slots - self.config.optimal_pool_size);
                        debug!("job pool {}: trimmed {} free slots, {} slots left", pool.id(), removed, inner.num_slots());
                    }
                }
                index
            }
            None => {
                match inner.add_slot() {
                    Some(index) => {
                        debug!("job pool {}: no free slot, grew to {} slots", pool.id(), inner.num_slots());
                        index
                    }
                    None => {
                        warn!("job pool {}: could not allocate a new slot", pool.id());
                        return Err(AdmitRejection::OutOfMemory);
                    }
                }
            }
        };

        if !urgent && inner.active_count >= self.active_jobs_limit() {
            debug!("job pool {}: rejecting job, {} jobs are active", pool.id(), inner.active_count);
            return Err(AdmitRejection::QueueIsFull);
        }

        let slot_ref = inner.push_active(index, header, package);
        let job = SendJobHandle::new(&inner.slot(index).send_job);
        trace!("job pool {}: admitted {:?} as {:?}, {} jobs active", pool.id(), header.correlation_id, slot_ref, inner.active_count);
        Ok((slot_ref, job))
    }

    /// The oldest job that was admitted and not retired yet
    pub fn peek_next(&self, pool: &JobPool) -> Option<SlotRef> {
        let inner = pool.inner.read().unwrap();
        let head = inner.active_head
            .map(|index| inner.slot_ref(index));
        head
    }

    /// The pool's heartbeat slot. It is never part of the active queue, and retiring it is a no-op.
    pub fn heartbeat(&self, _pool: &JobPool) -> SlotRef {
        SlotRef::Heartbeat
    }

    /// Removes a job from the active queue after the transport has sent it, releasing its
    ///  package. Jobs must be retired in the order they were admitted.
    ///
    /// Retiring the heartbeat slot, an inactive slot or a stale reference does nothing.
    ///
    /// Panics if `slot` is active but not the head of the queue.
    pub fn retire(&self, pool: &JobPool, slot: SlotRef) {
        if slot == SlotRef::Heartbeat {
            return;
        }

        let mut inner = pool.inner.write().unwrap();
        let Some(s) = inner.resolve(slot) else {
            trace!("job pool {}: retiring stale {:?} - ignoring", pool.id(), slot);
            return;
        };
        if !s.is_active {
            return;
        }

        let head = inner.active_head.map(|index| inner.slot_ref(index));
        if head != Some(slot) {
            error!("job pool {}: attempting to retire {:?}, but the head of the active queue is {:?}", pool.id(), slot, head);
            panic!("active jobs must be retired in FIFO order");
        }

        inner.pop_active();
        trace!("job pool {}: retired {:?}, {} jobs active", pool.id(), slot, inner.active_count);
    }

    /// All jobs that still matter to someone: the active queue in FIFO order, followed by jobs
    ///  that were sent already but whose callers still hold a handle (typically waiting for
    ///  a response)
    pub fn list_busy(&self, pool: &JobPool) -> Vec<SlotRef> {
        let inner = pool.inner.read().unwrap();

        let mut result = inner.active_indices()
            .map(|index| inner.slot_ref(index))
            .collect::<Vec<_>>();

        result.extend(inner.slots()
            .filter(|(_, slot)| !slot.is_free() && !slot.is_active)
            .map(|(index, _)| inner.slot_ref(index)));

        result
    }

    /// Finds the job that registered `correlation_id`. Only jobs that a caller still holds a
    ///  handle to are considered.
    pub fn find_by_correlation(&self, pool: &JobPool, correlation_id: CorrelationId) -> Option<SlotRef> {
        let inner = pool.inner.read().unwrap();
        let found = inner.slots()
            .find(|(_, slot)| slot.is_externally_held() && slot.send_job.is_responsible_for(correlation_id))
            .map(|(index, _)| inner.slot_ref(index));
        found
    }

    pub fn find_job_by_response_package(&self, pool: &JobPool, package: &Package) -> Option<SendJobHandle> {
        let slot = self.find_by_correlation(pool, package.header.parent_correlation_id)?;
        self.send_job(pool, slot)
    }

    /// A slot is free if it is not active and nobody holds a handle to its job. Stale references
    ///  are reported as free since their admission is over.
    pub fn is_free(&self, pool: &JobPool, slot: SlotRef) -> bool {
        let inner = pool.inner.read().unwrap();
        let is_free = inner.resolve(slot)
            .map(|s| s.is_free())
            .unwrap_or(true);
        is_free
    }

    /// Creates another handle to the slot's job, e.g. for the transport or for teardown. The slot
    ///  is not reused while a handle exists.
    pub fn send_job(&self, pool: &JobPool, slot: SlotRef) -> Option<SendJobHandle> {
        let inner = pool.inner.read().unwrap();
        let job = inner.resolve(slot)
            .map(|s| SendJobHandle::new(&s.send_job));
        job
    }

    /// The package to transmit for an active slot (or the heartbeat slot)
    pub fn package(&self, pool: &JobPool, slot: SlotRef) -> Option<Package> {
        let inner = pool.inner.read().unwrap();
        let package = inner.resolve(slot)
            .and_then(|s| s.package.clone());
        package
    }

    pub fn header(&self, pool: &JobPool, slot: SlotRef) -> Option<PackageHeader> {
        let inner = pool.inner.read().unwrap();
        let header = inner.resolve(slot)
            .and_then(|s| s.header);
        header
    }

    /// Hands a response package to the job waiting for it, returning `false` if there is none
    pub fn route_response(&self, pool: &JobPool, sender: SenderId, package: Package) -> bool {
        match self.find_job_by_response_package(pool, &package) {
            Some(job) => {
                trace!("job pool {}: routing response for {:?}", pool.id(), package.header.parent_correlation_id);
                job.wake_response_waitings(ResponseOutcome::Success, Some(sender), Some(package));
                true
            }
            None => {
                debug!("job pool {}: no job waiting for response to {:?} - dropping it", pool.id(), package.header.parent_correlation_id);
                false
            }
        }
    }

    /// Fails every busy job of a connection that went away: pending sends and all response
    ///  waiters are woken with `Fail`. The active queue itself is left alone, it goes away
    ///  with the pool.
    pub fn fail_busy_jobs(&self, pool: &JobPool) {
        let busy = self.list_busy(pool);
        debug!("job pool {}: failing {} busy jobs", pool.id(), busy.len());

        for slot in busy {
            if let Some(job) = self.send_job(pool, slot) {
                job.fail_send_if_pending();
                job.wake_response_waitings(ResponseOutcome::Fail, None, None);
            }
        }
    }
}

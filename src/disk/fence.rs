use std::collections::VecDeque;

use super::job::{Job, JobFlags};

/// Outcome of raising a fence on a storage.
#[derive(Debug)]
pub(crate) enum FenceAction {
    /// No jobs outstanding: schedule the fence job immediately, at the
    /// front of the queue.
    PostFence(Job),
    /// Jobs are outstanding: the fence is parked; the caller should push a
    /// flush job to the queue front so dirty state drains and the
    /// outstanding count can reach zero.
    PostFlush,
    /// Another fence is already up; the new fence waits behind it.
    Blocked,
}

/// Jobs released by a completion.
#[derive(Default)]
pub(crate) struct FenceRelease {
    /// Jobs to resubmit through the normal add paths (a parked fence among
    /// them re-raises itself).
    pub resubmit: Vec<Job>,
    /// A fence whose storage just drained; goes to the queue front.
    pub fence_ready: Option<Job>,
}

/// Per-storage mutual-exclusion gate.
///
/// While a fence is up, every new job for the storage parks in `blocked`.
/// The fence job itself runs once `outstanding` reaches zero, at which
/// point it is the only job touching the storage.
#[derive(Default)]
pub(crate) struct JobFence {
    /// Jobs counted as queued-or-executing against this storage.
    outstanding: u32,
    /// Raised fences, including one currently executing.
    fences: u32,
    /// A fence waiting for `outstanding` to drain.
    parked_fence: Option<Job>,
    /// Jobs (and further fences) queued behind the active fence.
    blocked: VecDeque<Job>,
}

impl JobFence {
    /// Admits or parks a regular job. Admitted jobs are counted as
    /// outstanding and marked `IN_PROGRESS`.
    pub fn check(&mut self, mut job: Job) -> Option<Job> {
        if self.fences > 0 {
            self.blocked.push_back(job);
            return None;
        }
        self.outstanding += 1;
        job.flags.insert(JobFlags::IN_PROGRESS);
        Some(job)
    }

    pub fn raise(&mut self, mut job: Job) -> FenceAction {
        job.flags.insert(JobFlags::FENCE);
        if self.fences > 0 {
            // parked fences re-raise themselves on resubmission, so they
            // are not counted as active here
            self.blocked.push_back(job);
            return FenceAction::Blocked;
        }
        self.fences = 1;
        if self.outstanding == 0 {
            self.outstanding = 1;
            job.flags.insert(JobFlags::IN_PROGRESS);
            FenceAction::PostFence(job)
        } else {
            self.parked_fence = Some(job);
            FenceAction::PostFlush
        }
    }

    /// Accounts a finished job. When the completing job was a fence, every
    /// blocked job is handed back for resubmission; when the last regular
    /// job ahead of a parked fence finishes, the fence is released.
    pub fn complete(&mut self, was_fence: bool) -> FenceRelease {
        let mut release = FenceRelease::default();
        debug_assert!(self.outstanding > 0);
        self.outstanding = self.outstanding.saturating_sub(1);

        if was_fence {
            debug_assert!(self.fences > 0);
            self.fences = self.fences.saturating_sub(1);
            release.resubmit = self.blocked.drain(..).collect();
            return release;
        }

        if self.outstanding == 0 {
            if let Some(mut fence) = self.parked_fence.take() {
                self.outstanding = 1;
                fence.flags.insert(JobFlags::IN_PROGRESS);
                release.fence_ready = Some(fence);
            }
        }
        release
    }

    /// Counts a job that must run even while a fence is parked (the flush
    /// job issued alongside it).
    pub fn admit_unfenced(&mut self, mut job: Job) -> Job {
        self.outstanding += 1;
        job.flags.insert(JobFlags::IN_PROGRESS);
        job
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn take_blocked(&mut self) -> Vec<Job> {
        self.blocked.drain(..).collect()
    }
}

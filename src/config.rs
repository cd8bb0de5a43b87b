use anyhow::bail;

#[derive(Debug, Clone)]
pub struct JobPoolConfig {
    /// The number of slots a pool starts with, and the size it is trimmed back to after a burst
    ///  of traffic made it grow.
    pub optimal_pool_size: usize,

    /// Trimming a grown pool only happens while at most this many of its slots are busy, i.e.
    ///  while the pool is mostly idle. Busy slots are never trimmed.
    pub optimal_non_free_pool_size: usize,

    /// This is the maximum number of jobs per pool that are admitted and not yet retired. Further
    ///  non-urgent admissions are rejected until the transport catches up.
    pub active_jobs_limit: usize,
}

impl Default for JobPoolConfig {
    fn default() -> Self {
        JobPoolConfig {
            optimal_pool_size: 32,
            optimal_non_free_pool_size: 16,
            active_jobs_limit: 2000,
        }
    }
}

impl JobPoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.active_jobs_limit == 0 {
            bail!("active jobs limit must be at least 1");
        }
        if self.optimal_non_free_pool_size > self.optimal_pool_size {
            bail!("optimal non-free pool size ({}) must not exceed optimal pool size ({})", self.optimal_non_free_pool_size, self.optimal_pool_size);
        }

        Ok(())
    }
}

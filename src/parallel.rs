//! Bounded parallelism for golden computation and encoding

use rayon::ThreadPoolBuilder;

use crate::error::{MapError, MapResult};

/// Run `job` with at most `max_jobs` rayon workers; 0 uses the global pool
pub fn with_job_limit<R, F>(max_jobs: usize, job: F) -> MapResult<R>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    if max_jobs == 0 {
        return Ok(job());
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(max_jobs)
        .build()
        .map_err(|e| MapError::config(format!("cannot start {} workers: {}", max_jobs, e)))?;
    Ok(pool.install(job))
}

//! The measured traffic loops.
//!
//! Flow control is a pure window calculation: never more than `ring_depth`
//! work requests outstanding, batches of the nominal size while both the
//! window and the remaining iteration budget allow it, and single work
//! requests once either runs short. The batch sizes of a run always sum to
//! exactly the iteration count.

use clippy_utilities::Cast;
use tracing::debug;

use crate::{
    clock::read_cycles,
    completion_queue::{CompletionQueue, WorkCompletion},
    config::Config,
    error::{BenchError, Result},
    posting::{PostingEngine, RecvPoster},
    stats::LatencyStats,
};

/// Size of the next submission, or `None` while the pipeline has no room
/// and nothing is left to post.
pub(crate) fn next_batch(
    posted: u32,
    completed: u32,
    total: u32,
    ring: u32,
    batch: u32,
) -> Option<u32> {
    if posted >= total {
        return None;
    }
    let outstanding = posted.saturating_sub(completed);
    if outstanding >= ring {
        return None;
    }
    if posted.saturating_add(batch) <= total && outstanding.saturating_add(batch) <= ring {
        Some(batch)
    } else {
        Some(1)
    }
}

/// Scratch buffer for one poll call, sized to drain a whole batch at once.
fn completion_buffer(cfg: &Config) -> Vec<WorkCompletion> {
    std::iter::repeat_with(WorkCompletion::default)
        .take(cfg.batch_size.cast::<usize>().max(2))
        .collect()
}

/// Spin until exactly one completion arrives and check its status. Used to
/// absorb the window-bind completion before real counting begins.
pub(crate) fn drain_one(cq: &CompletionQueue) -> Result<()> {
    let mut wc_buf = [WorkCompletion::default()];
    loop {
        let drained = cq
            .poll(&mut wc_buf)
            .map_err(|err| BenchError::data_plane(err.to_string()))?;
        if drained > 0 {
            return wc_buf[0]
                .result()
                .map_err(|err| BenchError::data_plane(format!("window bind failed: {err}")));
        }
    }
}

/// Drive the send pipeline to completion and collect the latency samples.
pub(crate) fn run_sender(
    engine: &mut PostingEngine<'_>,
    cq: &CompletionQueue,
    cfg: &Config,
) -> Result<LatencyStats> {
    let cpi = engine.completions_per_iteration();
    let total = cfg.iterations;
    let ring: u32 = cfg.ring_depth.cast();
    let batch: u32 = cfg.batch_size.cast();
    let mut posted: u32 = 0;
    let mut completions: u64 = 0;
    let target_completions = u64::from(total).saturating_mul(u64::from(cpi));
    let mut stats = LatencyStats::new();
    let mut wc_buf = completion_buffer(cfg);

    while completions < target_completions {
        let completed_iters: u32 = completions
            .checked_div(u64::from(cpi))
            .unwrap_or(0)
            .cast();
        if let Some(n) = next_batch(posted, completed_iters, total, ring, batch) {
            let start = read_cycles();
            engine
                .post_batch(n.cast())
                .map_err(|err| BenchError::data_plane(format!("batch submission failed: {err}")))?;
            let delta = read_cycles().wrapping_sub(start);
            stats.record(n == batch, delta);
            posted = posted.wrapping_add(n);
        }
        let drained = cq
            .poll(&mut wc_buf)
            .map_err(|err| BenchError::data_plane(err.to_string()))?;
        for wc in wc_buf.iter().take(drained) {
            wc.result().map_err(|err| {
                BenchError::data_plane(format!("send completion failed: {err}"))
            })?;
        }
        completions = completions.saturating_add(drained.cast());
    }
    debug!("sender drained {completions} completions over {posted} posted iterations");
    Ok(stats)
}

/// Drain one receive completion per message, keeping the ring topped up.
/// `preposted` receives were armed before the ready barrier.
pub(crate) fn run_receiver(
    poster: &RecvPoster<'_>,
    cq: &CompletionQueue,
    cfg: &Config,
    preposted: u32,
) -> Result<()> {
    let total = cfg.iterations;
    let ring: u32 = cfg.ring_depth.cast();
    let mut posted = preposted;
    let mut completed: u32 = 0;
    let mut wc_buf = completion_buffer(cfg);

    while completed < total {
        let drained = cq
            .poll(&mut wc_buf)
            .map_err(|err| BenchError::data_plane(err.to_string()))?;
        for wc in wc_buf.iter().take(drained) {
            wc.result().map_err(|err| {
                BenchError::data_plane(format!("receive completion failed: {err}"))
            })?;
        }
        completed = completed.wrapping_add(drained.cast());
        let refill = ring
            .saturating_sub(posted.saturating_sub(completed))
            .min(total.saturating_sub(posted));
        if refill > 0 {
            poster
                .post(refill)
                .map_err(|err| BenchError::data_plane(format!("receive refill failed: {err}")))?;
            posted = posted.wrapping_add(refill);
        }
    }
    debug!("receiver drained {completed} completions");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::next_batch;

    #[test]
    fn full_batches_while_room_remains() {
        assert_eq!(next_batch(0, 0, 100, 16, 4), Some(4));
        assert_eq!(next_batch(4, 0, 100, 16, 4), Some(4));
    }

    #[test]
    fn window_exhaustion_blocks_posting() {
        // 16 outstanding fills the ring
        assert_eq!(next_batch(16, 0, 100, 16, 4), None);
        // one completion is not enough room for a full batch
        assert_eq!(next_batch(16, 1, 100, 16, 4), Some(1));
        // four completions reopen the full batch
        assert_eq!(next_batch(16, 4, 100, 16, 4), Some(4));
    }

    #[test]
    fn tail_degrades_to_single_requests() {
        // 2 left of 102 with batch 4: finish one at a time
        assert_eq!(next_batch(100, 98, 102, 16, 4), Some(1));
        assert_eq!(next_batch(101, 99, 102, 16, 4), Some(1));
        assert_eq!(next_batch(102, 100, 102, 16, 4), None);
    }

    #[test]
    fn batches_sum_to_iterations() {
        // simulate a run where completions arrive one per step
        for (total, ring, batch) in [(103_u32, 8_u32, 4_u32), (7, 2, 2), (1, 64, 16), (64, 64, 64)]
        {
            let mut posted = 0_u32;
            let mut completed = 0_u32;
            let mut posted_sum = 0_u32;
            while completed < total {
                if let Some(n) = next_batch(posted, completed, total, ring, batch) {
                    posted += n;
                    posted_sum += n;
                }
                if completed < posted {
                    completed += 1;
                }
            }
            assert_eq!(posted_sum, total, "total={total} ring={ring} batch={batch}");
            assert_eq!(posted, total);
        }
    }

    #[test]
    fn outstanding_never_exceeds_ring() {
        let (total, ring, batch) = (200_u32, 8_u32, 3_u32);
        let mut posted = 0_u32;
        let mut completed = 0_u32;
        while completed < total {
            if let Some(n) = next_batch(posted, completed, total, ring, batch) {
                posted += n;
            }
            assert!(posted - completed <= ring);
            if completed < posted {
                completed += 1;
            }
        }
    }
}

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;

use super::cancel::CancelToken;
use super::chunks::{plan_chunks, Chunk, ChunkPolicy};
use super::progress::{ProgressCallback, ProgressUpdate};
use crate::core::{check_chunk_request, Recording, Traces};
use crate::error::{EngineError, JobContext, Result};
use crate::observability::ExtensionMetrics;

/// Hardware concurrency, or 1 when it cannot be determined.
pub fn default_n_jobs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What part of the recording a run covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkJob {
    segments: Option<Vec<usize>>,
    channels: Option<Vec<usize>>,
    margin: usize,
}

impl ChunkJob {
    /// Every segment, every channel, no margin.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(mut self, segment_index: usize) -> Self {
        self.segments = Some(vec![segment_index]);
        self
    }

    pub fn segments(mut self, segments: Vec<usize>) -> Self {
        self.segments = Some(segments);
        self
    }

    pub fn channels(mut self, channels: Vec<usize>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Extra samples read on both sides of each chunk, clipped at segment bounds.
    pub fn margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }

    fn segment_list(&self, recording: &dyn Recording) -> Vec<usize> {
        self.segments
            .clone()
            .unwrap_or_else(|| (0..recording.num_segments()).collect())
    }
}

/// Chunk description handed to the per-chunk closure. The traces it receives
/// span `chunk.start - margin_left .. chunk.end + margin_right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub chunk: Chunk,
    pub margin_left: usize,
    pub margin_right: usize,
}

impl ChunkMeta {
    /// First sample of the traces, in segment coordinates.
    pub fn traces_start(&self) -> usize {
        self.chunk.start - self.margin_left
    }
}

/// Runs a per-chunk computation over a bounded worker pool and merges the
/// partial results in chunk order.
#[derive(Clone)]
pub struct ChunkExecutor {
    n_jobs: usize,
    policy: ChunkPolicy,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
    context: JobContext,
    metrics: Option<Arc<ExtensionMetrics>>,
}

impl Default for ChunkExecutor {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ChunkExecutor {
    /// `n_jobs == 0` means one worker per available core.
    pub fn new(n_jobs: usize) -> Self {
        Self {
            n_jobs: if n_jobs == 0 { default_n_jobs() } else { n_jobs },
            policy: ChunkPolicy::default(),
            cancel: CancelToken::new(),
            progress: None,
            context: JobContext::default(),
            metrics: None,
        }
    }

    pub fn with_policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ExtensionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// The chunks a run of `job` would process, in merge order.
    pub fn plan(&self, recording: &dyn Recording, job: &ChunkJob) -> Result<Vec<Chunk>> {
        let segments = job.segment_list(recording);
        for &segment in &segments {
            check_chunk_request(recording, segment, job.channels.as_deref(), 0, 0)?;
        }
        let num_channels = job
            .channels
            .as_ref()
            .map(Vec::len)
            .unwrap_or_else(|| recording.num_channels());
        plan_chunks(recording, &self.policy, &segments, num_channels)
    }

    /// Process a single segment.
    pub fn run_segment<P, R, F, M>(
        &self,
        recording: &dyn Recording,
        segment_index: usize,
        f: F,
        merge: M,
    ) -> Result<R>
    where
        P: Send,
        F: Fn(&Traces, &ChunkMeta) -> anyhow::Result<P> + Sync,
        M: FnOnce(Vec<P>) -> R,
    {
        self.run(recording, &ChunkJob::new().segment(segment_index), f, merge)
    }

    /// Execute `f` on every chunk of `job` and hand the partial results to
    /// `merge` sorted by chunk index.
    ///
    /// The first chunk failure stops the pool: queued chunks are dropped,
    /// in-flight ones finish, and `merge` is never called.
    pub fn run<P, R, F, M>(
        &self,
        recording: &dyn Recording,
        job: &ChunkJob,
        f: F,
        merge: M,
    ) -> Result<R>
    where
        P: Send,
        F: Fn(&Traces, &ChunkMeta) -> anyhow::Result<P> + Sync,
        M: FnOnce(Vec<P>) -> R,
    {
        let chunks = self.plan(recording, job)?;
        let total = chunks.len();
        let workers = self.n_jobs.min(total).max(1);

        tracing::debug!(
            context = %self.context,
            chunks = total,
            workers,
            policy = ?self.policy,
            "chunked execution started"
        );

        let process = |chunk: &Chunk| self.process_chunk(recording, job, chunk, &f);

        let mut partials = if workers == 1 {
            self.run_inline(&chunks, &process)?
        } else {
            self.run_pool(&chunks, workers, &process)?
        };

        if partials.len() != total {
            return Err(EngineError::Cancelled {
                context: self.context.clone(),
            });
        }

        partials.sort_unstable_by_key(|(index, _)| *index);
        tracing::debug!(context = %self.context, chunks = total, "chunked execution finished");
        Ok(merge(partials.into_iter().map(|(_, p)| p).collect()))
    }

    fn run_inline<P>(
        &self,
        chunks: &[Chunk],
        process: &(dyn Fn(&Chunk) -> Result<P> + Sync),
    ) -> Result<Vec<(usize, P)>> {
        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled {
                    context: self.context.clone(),
                });
            }
            partials.push((chunk.index, process(chunk)?));
            self.report(partials.len(), chunks.len());
        }
        Ok(partials)
    }

    fn run_pool<P: Send>(
        &self,
        chunks: &[Chunk],
        workers: usize,
        process: &(dyn Fn(&Chunk) -> Result<P> + Sync),
    ) -> Result<Vec<(usize, P)>> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Chunk>();
        for chunk in chunks {
            // receiver is alive, cannot fail
            let _ = job_tx.send(*chunk);
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, Result<P>)>();
        let abort = AtomicBool::new(false);
        let mut partials = Vec::with_capacity(chunks.len());
        let mut first_error: Option<EngineError> = None;

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let abort = &abort;
                let cancel = &self.cancel;

                scope.spawn(move || {
                    for chunk in job_rx.iter() {
                        if abort.load(Ordering::Acquire) || cancel.is_cancelled() {
                            break;
                        }
                        let result = process(&chunk);
                        let failed = result.is_err();
                        if failed {
                            abort.store(true, Ordering::Release);
                        }
                        if result_tx.send((chunk.index, result)).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (index, result) in result_rx.iter() {
                match result {
                    Ok(partial) => {
                        partials.push((index, partial));
                        self.report(partials.len(), chunks.len());
                    }
                    Err(err) => {
                        abort.store(true, Ordering::Release);
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
        });

        if let Some(err) = first_error {
            tracing::warn!(context = %self.context, error = %err, "chunked execution aborted");
            return Err(err);
        }
        if self.cancel.is_cancelled() && partials.len() < chunks.len() {
            return Err(EngineError::Cancelled {
                context: self.context.clone(),
            });
        }
        Ok(partials)
    }

    fn process_chunk<P, F>(
        &self,
        recording: &dyn Recording,
        job: &ChunkJob,
        chunk: &Chunk,
        f: &F,
    ) -> Result<P>
    where
        F: Fn(&Traces, &ChunkMeta) -> anyhow::Result<P> + Sync,
    {
        let fail = |cause: anyhow::Error| EngineError::ChunkComputation {
            context: self.context.clone(),
            segment: chunk.segment_index,
            start: chunk.start,
            end: chunk.end,
            cause,
        };

        let len = recording
            .num_samples(chunk.segment_index)
            .map_err(|e| fail(e.into()))?;
        let lo = chunk.start.saturating_sub(job.margin);
        let hi = chunk.end.saturating_add(job.margin).min(len);
        let traces = recording
            .get_chunk(chunk.segment_index, job.channels.as_deref(), lo, hi)
            .map_err(|e| fail(e.into()))?;
        let meta = ChunkMeta {
            chunk: *chunk,
            margin_left: chunk.start - lo,
            margin_right: hi - chunk.end,
        };

        let partial = match catch_unwind(AssertUnwindSafe(|| f(&traces, &meta))) {
            Ok(Ok(partial)) => partial,
            Ok(Err(cause)) => return Err(fail(cause)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return Err(fail(anyhow!("chunk closure panicked: {message}")));
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_chunk();
        }
        Ok(partial)
    }

    fn report(&self, completed: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(&ProgressUpdate {
                context: self.context.clone(),
                completed,
                total,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InMemoryRecording;

    fn recording(samples: usize) -> InMemoryRecording {
        let data: Vec<f32> = (0..samples).map(|i| i as f32).collect();
        InMemoryRecording::new(1000.0, 1, vec![data]).unwrap()
    }

    #[test]
    fn test_inline_and_pool_agree() {
        let rec = recording(1000);
        let policy = ChunkPolicy::FixedSamples { samples: 64 };
        let collect = |traces: &Traces, meta: &ChunkMeta| -> anyhow::Result<(usize, f64)> {
            Ok((meta.chunk.start, traces.sum()))
        };

        let inline = ChunkExecutor::new(1)
            .with_policy(policy)
            .run(&rec, &ChunkJob::new(), collect, |parts| parts)
            .unwrap();
        let pooled = ChunkExecutor::new(4)
            .with_policy(policy)
            .run(&rec, &ChunkJob::new(), collect, |parts| parts)
            .unwrap();

        assert_eq!(inline, pooled);
        assert_eq!(inline.len(), 16);
        assert!(inline.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_margin_is_clipped_at_bounds() {
        let rec = recording(100);
        let metas = ChunkExecutor::new(2)
            .with_policy(ChunkPolicy::FixedSamples { samples: 50 })
            .run(
                &rec,
                &ChunkJob::new().margin(10),
                |traces, meta| {
                    assert_eq!(
                        traces.num_samples(),
                        meta.chunk.len() + meta.margin_left + meta.margin_right
                    );
                    assert_eq!(traces.sample(0, 0) as usize, meta.traces_start());
                    Ok(*meta)
                },
                |metas| metas,
            )
            .unwrap();

        assert_eq!((metas[0].margin_left, metas[0].margin_right), (0, 10));
        assert_eq!((metas[1].margin_left, metas[1].margin_right), (10, 0));
    }

    #[test]
    fn test_panic_becomes_chunk_error() {
        let rec = recording(10);
        let err = ChunkExecutor::new(1)
            .with_policy(ChunkPolicy::FixedSamples { samples: 5 })
            .run(
                &rec,
                &ChunkJob::new(),
                |_, meta| -> anyhow::Result<()> {
                    if meta.chunk.index == 1 {
                        panic!("bad chunk");
                    }
                    Ok(())
                },
                |_| (),
            )
            .unwrap_err();

        match err {
            EngineError::ChunkComputation {
                start, end, cause, ..
            } => {
                assert_eq!((start, end), (5, 10));
                assert!(cause.to_string().contains("bad chunk"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_channel_fails_before_running() {
        let rec = recording(10);
        let err = ChunkExecutor::new(2)
            .run(
                &rec,
                &ChunkJob::new().channels(vec![3]),
                |_, _| -> anyhow::Result<()> { unreachable!("no chunk may run") },
                |_| (),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownChannel { channel: 3, .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let rec = recording(10);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ChunkExecutor::new(1)
            .with_cancel(cancel)
            .run(&rec, &ChunkJob::new(), |_, _| Ok(()), |_| ())
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }
}

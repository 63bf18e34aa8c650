//! The serialized generation queue.
//!
//! Any number of callers may submit jobs concurrently; exactly one job is
//! ever processed against the backend at a time. The dispatch loop polls on
//! a fixed tick and only dequeues while nothing is in flight; the job itself
//! runs as an independent task so the loop stays responsive to shutdown.

use crate::compositor;
use crate::db::{self, Pool};
use crate::interaction::{FollowUpAction, OriginHandle, ProgressUpdate};
use crate::model::{
    DefaultSettings, ImageGeneration, JobError, JobKind, JobState, SubmitError, BOT_SCOPE,
};
use crate::sd::{SdApi, TextToImageRequest, UpscaleRequest};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

mod progress;
mod prompt;

use progress::PhaseTracker;

/// Maximum number of jobs waiting to be dequeued.
pub const QUEUE_CAPACITY: usize = 100;

/// Grid jobs always ask the backend for four images.
const GRID_ITER_COUNT: i64 = 4;

const UPSCALER: &str = "ESRGAN_4x";
const UPSCALE_RESIZE_FACTOR: i64 = 3;

/// Subseed strength applied when varying a previous image. Small enough to
/// stay recognizably the same picture.
const VARIATION_SUBSEED_STRENGTH: f64 = 0.15;

const DEFAULT_NEGATIVE_PROMPT: &str = "ugly, tiling, poorly drawn hands, poorly drawn feet, \
     poorly drawn face, out of frame, mutation, mutated, extra limbs, extra legs, extra arms, \
     disfigured, deformed, cross-eye, body out of frame, blurry, bad art, bad anatomy, blurred, \
     text, watermark, grainy";

/// A submitted request, owned by the queue until processing completes.
pub struct GenerationJob {
    pub kind: JobKind,
    pub origin: Arc<dyn OriginHandle>,
}

impl GenerationJob {
    pub fn new(kind: JobKind, origin: Arc<dyn OriginHandle>) -> Self {
        Self { kind, origin }
    }
}

/// Tag describing the job currently held by the worker.
#[derive(Debug, Clone)]
struct CurrentJob {
    kind: &'static str,
    interaction_id: String,
}

struct QueueState {
    pending: VecDeque<GenerationJob>,
    current: Option<CurrentJob>,
}

pub struct ImagineQueue {
    pool: Pool,
    sd: Arc<dyn SdApi>,
    state: Mutex<QueueState>,
    defaults: Mutex<Option<DefaultSettings>>,
    poll_interval: Duration,
    progress_interval: Duration,
}

/// Clears the in-flight marker when the processing task ends, including by
/// panic, so the dispatch loop can never deadlock on a dead job.
struct InFlightGuard {
    queue: Arc<ImagineQueue>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(job) = self.queue.state.lock().current.take() {
            debug!(kind = job.kind, interaction = %job.interaction_id, "cleared in-flight job");
        }
    }
}

impl ImagineQueue {
    pub fn new(
        pool: Pool,
        sd: Arc<dyn SdApi>,
        poll_interval: Duration,
        progress_interval: Duration,
    ) -> Self {
        Self {
            pool,
            sd,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
            }),
            defaults: Mutex::new(None),
            poll_interval,
            progress_interval,
        }
    }

    /// Append a job to the pending buffer. Never blocks; returns the 1-based
    /// position in line at the moment of submission.
    pub fn submit(&self, job: GenerationJob) -> Result<usize, SubmitError> {
        let mut state = self.state.lock();
        if state.pending.len() >= QUEUE_CAPACITY {
            return Err(SubmitError::QueueFull);
        }
        state.pending.push_back(job);
        let position = state.pending.len();
        debug!(position, state = JobState::Queued.as_str(), "job submitted");
        Ok(position)
    }

    /// Blocking worker loop; returns when the process receives an interrupt.
    /// Must be invoked exactly once per process lifetime.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        self.run_until(ctrl_c).await
    }

    /// Worker loop gated on an arbitrary shutdown future. An in-flight job
    /// runs to completion; only the dequeueing stops.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => Self::pull_next(&self),
            }
        }
        info!("queue polling stopped");
        Ok(())
    }

    /// Dequeue the oldest pending job unless one is already in flight, and
    /// process it on its own task.
    fn pull_next(queue: &Arc<Self>) {
        let job = {
            let mut state = queue.state.lock();
            if state.current.is_some() {
                return;
            }
            let Some(job) = state.pending.pop_front() else {
                return;
            };
            state.current = Some(CurrentJob {
                kind: job.kind.as_str(),
                interaction_id: job.origin.interaction_id(),
            });
            job
        };

        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            let _guard = InFlightGuard {
                queue: Arc::clone(&queue),
            };
            queue.process_job(job).await;
        });
    }

    #[instrument(skip_all, fields(kind = job.kind.as_str(), interaction = %job.origin.interaction_id()))]
    async fn process_job(&self, job: GenerationJob) {
        info!(state = JobState::Running.as_str(), "processing job");

        let outcome = match &job.kind {
            JobKind::Upscale { index } => self.process_upscale(&job, *index).await,
            _ => self.process_grid_job(&job).await,
        };

        match outcome {
            Ok(()) => info!(state = JobState::Done.as_str(), "job finished"),
            Err(err) => {
                warn!(state = JobState::Failed.as_str(), %err, "job failed");
                let _ = job.origin.fail(&user_message(&job.kind, &err)).await;
            }
        }
    }

    // ---- grid jobs (new request / reroll / variation) ----

    async fn process_grid_job(&self, job: &GenerationJob) -> Result<(), JobError> {
        let mut generation = match &job.kind {
            JobKind::New { prompt } => self.fresh_generation(prompt).await?,
            _ => self.derived_generation(job).await?,
        };

        let origin = &job.origin;
        let message_id = origin
            .announce(&format!(
                "Asked to imagine \"{}\". Currently dreaming it up.",
                generation.prompt
            ))
            .await
            .map_err(JobError::Delivery)?;

        generation.interaction_id = origin.interaction_id();
        generation.message_id = message_id;
        generation.member_id = origin.member_id();
        generation.sort_order = 0;

        // Lead record first; derived jobs later resolve their parameters
        // from it. A failed write must not block this response, but every
        // follow-up on it will come back NotFound.
        if let Err(err) = db::create_generation(&self.pool, &generation).await {
            warn!(?err, "failed to persist lead record");
        }

        let request = txt2img_request(&generation, GRID_ITER_COUNT);
        let response = self
            .with_progress(origin, false, self.sd.text_to_image(&request))
            .await
            .map_err(JobError::Backend)?;

        for (idx, (seed, subseed)) in response
            .seeds
            .iter()
            .zip(response.subseeds.iter())
            .enumerate()
        {
            let record = ImageGeneration {
                id: 0,
                sort_order: idx as i64 + 1,
                seed: *seed,
                subseed: *subseed,
                processed: true,
                created_at: Utc::now(),
                ..generation.clone()
            };
            if let Err(err) = db::create_generation(&self.pool, &record).await {
                warn!(?err, sort_order = record.sort_order, "failed to persist image record");
            }
        }

        let composite = compositor::tile_images(&response.images).map_err(JobError::Backend)?;

        origin
            .finish(
                &format!(
                    "Asked to imagine \"{}\". Here is what I dreamed up.",
                    generation.prompt
                ),
                composite,
                &FollowUpAction::grid(),
            )
            .await
            .map_err(JobError::Delivery)?;
        Ok(())
    }

    /// Parameters for a fresh request: current defaults plus whatever the
    /// prompt itself dictates.
    async fn fresh_generation(&self, raw_prompt: &str) -> Result<ImageGeneration, JobError> {
        let defaults = self.defaults().await.map_err(JobError::Persistence)?;
        let dims = prompt::extract_dimensions(raw_prompt, defaults.width, defaults.height)
            .map_err(JobError::Prompt)?;

        // An aspect ratio that outgrows the defaults runs the base pass at
        // the default size and upscales to the computed target.
        let enable_hr = dims.width > defaults.width || dims.height > defaults.height;
        if enable_hr {
            info!(
                width = dims.width,
                height = dims.height,
                "prompt dimensions exceed defaults; enabling high-res pass"
            );
        }

        Ok(ImageGeneration {
            id: 0,
            interaction_id: String::new(),
            message_id: String::new(),
            member_id: String::new(),
            sort_order: 0,
            prompt: dims.sanitized_prompt,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            width: defaults.width,
            height: defaults.height,
            restore_faces: true,
            enable_hr,
            hires_width: if enable_hr { dims.width } else { 0 },
            hires_height: if enable_hr { dims.height } else { 0 },
            denoising_strength: 0.7,
            batch_count: GRID_ITER_COUNT,
            batch_size: defaults.batch_size,
            seed: -1,
            subseed: -1,
            subseed_strength: 0.0,
            sampler_name: "Euler a".to_string(),
            cfg_scale: 9.0,
            steps: 20,
            processed: false,
            created_at: Utc::now(),
        })
    }

    /// Parameters for a reroll or variation: the referenced record verbatim,
    /// with a fresh subseed (and, for variations, a nudging subseed
    /// strength).
    async fn derived_generation(&self, job: &GenerationJob) -> Result<ImageGeneration, JobError> {
        let index = job.kind.source_index().unwrap_or(0);
        let mut generation = self.previous_generation(job, index).await?;

        generation.id = 0;
        generation.processed = false;
        generation.subseed = -1;
        if matches!(job.kind, JobKind::Variation { .. }) {
            generation.subseed_strength = VARIATION_SUBSEED_STRENGTH;
        }
        Ok(generation)
    }

    async fn previous_generation(
        &self,
        job: &GenerationJob,
        index: i64,
    ) -> Result<ImageGeneration, JobError> {
        let Some(message_id) = job.origin.source_message_id() else {
            return Err(JobError::NotFound {
                message_id: String::new(),
                index,
            });
        };

        debug!(%message_id, index, "resolving source generation");
        db::get_generation_by_message_and_sort(&self.pool, &message_id, index)
            .await
            .map_err(JobError::Persistence)?
            .ok_or(JobError::NotFound { message_id, index })
    }

    // ---- upscale jobs ----

    async fn process_upscale(&self, job: &GenerationJob, index: i64) -> Result<(), JobError> {
        let source = self.previous_generation(job, index).await?;
        let origin = &job.origin;

        origin
            .announce(&format!("Upscaling image #{}. Working on it.", index))
            .await
            .map_err(JobError::Delivery)?;

        let request = UpscaleRequest {
            resize_mode: 0,
            upscaling_resize: UPSCALE_RESIZE_FACTOR,
            upscaler: UPSCALER.to_string(),
            txt2img: txt2img_request(&source, 1),
        };
        let response = self
            .with_progress(origin, true, self.sd.upscale_image(&request))
            .await
            .map_err(JobError::Backend)?;

        // An upscale is terminal; it leaves no record behind.
        origin
            .finish("Here is your upscaled image.", response.image, &[])
            .await
            .map_err(JobError::Delivery)?;
        Ok(())
    }

    // ---- progress reporting ----

    /// Run a backend call with a concurrent progress poller; the poller is
    /// aborted the instant the call returns, success or failure.
    async fn with_progress<T>(
        &self,
        origin: &Arc<dyn OriginHandle>,
        two_phase: bool,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let poller = self.spawn_progress_poller(Arc::clone(origin), two_phase);
        let result = call.await;
        poller.abort();
        result
    }

    fn spawn_progress_poller(
        &self,
        origin: Arc<dyn OriginHandle>,
        two_phase: bool,
    ) -> JoinHandle<()> {
        let sd = Arc::clone(&self.sd);
        let interval = self.progress_interval;
        tokio::spawn(async move {
            let mut tracker = PhaseTracker::new(two_phase);
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sd.current_progress().await {
                    Ok(p) => {
                        let update: ProgressUpdate = tracker.observe(p.progress);
                        let _ = origin.progress(update).await;
                    }
                    Err(err) => debug!(?err, "progress poll failed"),
                }
            }
        })
    }

    // ---- default settings ----

    /// Current defaults; lazily bootstrapped and cached until the next
    /// successful write.
    pub async fn defaults(&self) -> Result<DefaultSettings> {
        if let Some(cached) = self.defaults.lock().clone() {
            return Ok(cached);
        }

        let settings = match db::get_settings_by_scope(&self.pool, BOT_SCOPE).await? {
            Some(settings) => settings,
            None => {
                info!("no default settings stored yet; writing bootstrap values");
                db::upsert_settings(&self.pool, &DefaultSettings::bootstrap(BOT_SCOPE)).await?
            }
        };
        *self.defaults.lock() = Some(settings.clone());
        Ok(settings)
    }

    pub async fn update_default_dimensions(
        &self,
        width: i64,
        height: i64,
    ) -> Result<DefaultSettings> {
        let mut settings = self.defaults().await?;
        settings.width = width;
        settings.height = height;
        let stored = db::upsert_settings(&self.pool, &settings).await?;
        *self.defaults.lock() = Some(stored.clone());
        Ok(stored)
    }

    pub async fn update_default_batch(&self, count: i64, size: i64) -> Result<DefaultSettings> {
        let mut settings = self.defaults().await?;
        settings.batch_count = count;
        settings.batch_size = size;
        let stored = db::upsert_settings(&self.pool, &settings).await?;
        *self.defaults.lock() = Some(stored.clone());
        Ok(stored)
    }
}

fn txt2img_request(generation: &ImageGeneration, n_iter: i64) -> TextToImageRequest {
    TextToImageRequest {
        prompt: generation.prompt.clone(),
        negative_prompt: generation.negative_prompt.clone(),
        width: generation.width,
        height: generation.height,
        restore_faces: generation.restore_faces,
        enable_hr: generation.enable_hr,
        hr_resize_x: generation.hires_width,
        hr_resize_y: generation.hires_height,
        denoising_strength: generation.denoising_strength,
        batch_size: generation.batch_size,
        seed: generation.seed,
        subseed: generation.subseed,
        subseed_strength: generation.subseed_strength,
        sampler_name: generation.sampler_name.clone(),
        cfg_scale: generation.cfg_scale,
        steps: generation.steps,
        n_iter,
    }
}

fn user_message(kind: &JobKind, err: &JobError) -> String {
    match err {
        JobError::NotFound { .. } => {
            "I couldn't find the image you're referring to. It may be too old.".to_string()
        }
        JobError::Prompt(err) => format!("I couldn't make sense of that prompt: {}.", err),
        _ => match kind {
            JobKind::Upscale { .. } => {
                "I'm sorry, but I had a problem upscaling your image.".to_string()
            }
            _ => "I'm sorry, but I had a problem imagining your image.".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::{ProgressResponse, TextToImageResponse, UpscaleResponse};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct NoopOrigin;

    #[async_trait]
    impl OriginHandle for NoopOrigin {
        fn interaction_id(&self) -> String {
            "interaction".into()
        }
        fn member_id(&self) -> String {
            "member".into()
        }
        fn source_message_id(&self) -> Option<String> {
            None
        }
        async fn announce(&self, _text: &str) -> Result<String> {
            Ok("message".into())
        }
        async fn progress(&self, _update: ProgressUpdate) -> Result<()> {
            Ok(())
        }
        async fn finish(
            &self,
            _text: &str,
            _png: Vec<u8>,
            _actions: &[FollowUpAction],
        ) -> Result<()> {
            Ok(())
        }
        async fn fail(&self, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    struct UnreachableSd;

    #[async_trait]
    impl SdApi for UnreachableSd {
        async fn text_to_image(&self, _req: &TextToImageRequest) -> Result<TextToImageResponse> {
            Err(anyhow!("not under test"))
        }
        async fn current_progress(&self) -> Result<ProgressResponse> {
            Err(anyhow!("not under test"))
        }
        async fn upscale_image(&self, _req: &UpscaleRequest) -> Result<UpscaleResponse> {
            Err(anyhow!("not under test"))
        }
    }

    async fn setup_queue() -> ImagineQueue {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        ImagineQueue::new(
            pool,
            Arc::new(UnreachableSd),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
    }

    fn job() -> GenerationJob {
        GenerationJob::new(
            JobKind::New {
                prompt: "a cat".into(),
            },
            Arc::new(NoopOrigin),
        )
    }

    #[tokio::test]
    async fn submit_reports_line_position() {
        let queue = setup_queue().await;
        assert_eq!(queue.submit(job()).unwrap(), 1);
        assert_eq!(queue.submit(job()).unwrap(), 2);
        assert_eq!(queue.submit(job()).unwrap(), 3);
    }

    #[tokio::test]
    async fn submit_fails_when_saturated() {
        let queue = setup_queue().await;
        for _ in 0..QUEUE_CAPACITY {
            queue.submit(job()).unwrap();
        }
        assert!(matches!(queue.submit(job()), Err(SubmitError::QueueFull)));
    }

    #[tokio::test]
    async fn defaults_bootstrap_on_first_access() {
        let queue = setup_queue().await;
        let defaults = queue.defaults().await.unwrap();
        assert_eq!(defaults, DefaultSettings::bootstrap(BOT_SCOPE));

        // The bootstrap row is persisted, not just cached.
        let stored = db::get_settings_by_scope(&queue.pool, BOT_SCOPE)
            .await
            .unwrap()
            .expect("bootstrap row");
        assert_eq!(stored, defaults);
    }

    #[tokio::test]
    async fn settings_updates_persist_and_refresh_cache() {
        let queue = setup_queue().await;

        let updated = queue.update_default_dimensions(1024, 576).await.unwrap();
        assert_eq!((updated.width, updated.height), (1024, 576));
        assert_eq!(queue.defaults().await.unwrap().width, 1024);

        let updated = queue.update_default_batch(2, 2).await.unwrap();
        assert_eq!((updated.batch_count, updated.batch_size), (2, 2));
        // Dimension update survives the batch update.
        assert_eq!(queue.defaults().await.unwrap().height, 576);

        let stored = db::get_settings_by_scope(&queue.pool, BOT_SCOPE)
            .await
            .unwrap()
            .expect("settings row");
        assert_eq!((stored.width, stored.height), (1024, 576));
        assert_eq!((stored.batch_count, stored.batch_size), (2, 2));
    }
}

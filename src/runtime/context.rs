use crate::config::StateHeapSettings;
use crate::error::HeapResult;
use crate::os::OsInterface;
use crate::runtime::queues::builder::QueueBuilder;
use crate::runtime::queues::encoder::{LinearEncoder, RenderEncoder};
use crate::runtime::queues::queue::ComputeQueue;
use crate::runtime::state::platform::PlatformInfo;
use crate::runtime::tracker::FrameTrackerProducer;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

// ===============================================================================================
// Context
// ===============================================================================================

/// Everything queues share: the OS services, the hardware description, the
/// settings and the tracker producer.
///
/// Passed around explicitly; there is no process-wide instance.
#[derive(Debug)]
pub struct RuntimeContext {
    pub os: Arc<dyn OsInterface>,
    pub platform: Arc<PlatformInfo>,
    pub settings: StateHeapSettings,
    pub producer: Arc<FrameTrackerProducer>,
    pub encoder: Arc<dyn RenderEncoder>,
    queues: Mutex<Vec<Weak<Mutex<ComputeQueue>>>>,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(
        os: Arc<dyn OsInterface>,
        platform: PlatformInfo,
        settings: StateHeapSettings,
    ) -> Self {
        let producer = Arc::new(FrameTrackerProducer::new(settings.tracker_slots));
        debug!(
            platform = %platform.name,
            tracker_slots = settings.tracker_slots,
            "runtime context created"
        );
        Self {
            os,
            platform: Arc::new(platform),
            settings,
            producer,
            encoder: Arc::new(LinearEncoder),
            queues: Mutex::new(Vec::new()),
        }
    }

    /// A context configured from `GSH_*` environment variables.
    #[must_use]
    pub fn from_env(os: Arc<dyn OsInterface>, platform: PlatformInfo) -> Self {
        Self::new(os, platform, StateHeapSettings::from_env())
    }

    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn RenderEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// A builder for a queue with non-default settings; pass the result to
    /// [`RuntimeContext::adopt_queue`] to have the context track it.
    #[must_use]
    pub fn queue_builder(&self) -> QueueBuilder<'_> {
        QueueBuilder::new(
            &self.os,
            &self.platform,
            &self.settings,
            &self.producer,
            &self.encoder,
        )
    }

    /// Creates a queue with the context's settings.
    pub fn create_queue(&self) -> HeapResult<Arc<Mutex<ComputeQueue>>> {
        let queue = self.queue_builder().create()?;
        Ok(self.adopt_queue(queue))
    }

    pub fn adopt_queue(&self, queue: ComputeQueue) -> Arc<Mutex<ComputeQueue>> {
        let queue = Arc::new(Mutex::new(queue));
        let mut queues = self.queues.lock();
        queues.retain(|q| q.strong_count() > 0);
        queues.push(Arc::downgrade(&queue));
        queue
    }

    /// Live queues created through this context.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        let mut queues = self.queues.lock();
        queues.retain(|q| q.strong_count() > 0);
        queues.len()
    }

    /// Runs [`ComputeQueue::reclaim`] on every live queue.
    pub fn reclaim_all(&self) -> usize {
        let queues: Vec<_> = self.queues.lock().iter().filter_map(Weak::upgrade).collect();
        queues.iter().map(|q| q.lock().reclaim()).sum()
    }
}

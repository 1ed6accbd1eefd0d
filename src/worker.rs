use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::SummaryOptions;
use crate::error::{Result, SummarizeError};
use crate::host::ModelHost;

/// What the HTTP layer sees of the model.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: String, options: SummaryOptions) -> Result<String>;
}

/// Blocking summarization run on the inference thread.
pub trait SummaryEngine: Send + 'static {
    fn summarize(&mut self, text: &str, options: &SummaryOptions) -> Result<String>;
}

impl SummaryEngine for ModelHost {
    fn summarize(&mut self, text: &str, options: &SummaryOptions) -> Result<String> {
        ModelHost::summarize(self, text, options)
    }
}

struct InferenceTask {
    text: String,
    options: SummaryOptions,
    reply: oneshot::Sender<Result<String>>,
}

/// Owns the engine on a dedicated OS thread so inference never blocks the
/// async runtime. Tasks run one at a time in arrival order.
pub struct InferenceWorker;

impl InferenceWorker {
    pub fn spawn<E: SummaryEngine>(engine: E) -> Result<WorkerHandle> {
        let (sender, receiver) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || run(engine, receiver))?;

        info!("Inference worker started");
        Ok(WorkerHandle { sender })
    }
}

fn run<E: SummaryEngine>(mut engine: E, mut receiver: mpsc::UnboundedReceiver<InferenceTask>) {
    while let Some(task) = receiver.blocking_recv() {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            engine.summarize(&task.text, &task.options)
        }));

        let result = outcome.unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Inference panicked: {}", message);
            Err(SummarizeError::WorkerPanicked(message))
        });

        debug!("Inference task finished in {:?}", started.elapsed());

        // The caller may have disconnected; the work is done regardless.
        if task.reply.send(result).is_err() {
            debug!("Caller went away before the summary was delivered");
        }
    }

    info!("Inference worker stopped");
}

/// Cheap, cloneable sender side of the inference worker.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<InferenceTask>,
}

#[async_trait]
impl Summarizer for WorkerHandle {
    async fn summarize(&self, text: String, options: SummaryOptions) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(InferenceTask {
                text,
                options,
                reply,
            })
            .map_err(|_| SummarizeError::WorkerUnavailable)?;

        response.await.map_err(|_| SummarizeError::WorkerUnavailable)?
    }
}

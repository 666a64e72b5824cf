use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::events::{EventEmitter, ProgressEvent};
use crate::pipeline::{DetonationPipeline, Sample};

/// Buffered events per batch stream before the forwarder waits on the caller
const EVENT_BUFFER: usize = 64;

/// Runs the samples of one submission through the pipeline.
///
/// At most `max_concurrent` sandboxes exist at a time. The returned stream
/// always carries runs in input order: events of a run that is ahead are
/// held back until every earlier run has reported its terminal event.
#[derive(Clone)]
pub struct BatchDriver {
    pipeline: Arc<DetonationPipeline>,
    max_concurrent: usize,
}

impl BatchDriver {
    pub fn new(pipeline: Arc<DetonationPipeline>, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Start the batch and return its ordered event stream.
    ///
    /// Dropping the receiver stops new samples from being started; runs that
    /// already hold a sandbox still finish and clean up.
    pub fn submit(
        &self,
        samples: Vec<Sample>,
        passphrase: Option<String>,
    ) -> mpsc::Receiver<ProgressEvent> {
        let batch_id = Uuid::new_v4();
        let total = samples.len();
        info!(
            batch_id = %batch_id,
            samples = total,
            password = passphrase.is_some(),
            "Starting analysis batch"
        );

        let (out_tx, out_rx) = mpsc::channel(EVENT_BUFFER);
        let (runs_tx, runs_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward_in_order(runs_rx, out_tx.clone()));

        let pipeline = Arc::clone(&self.pipeline);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        tokio::spawn(async move {
            for (index, sample) in samples.into_iter().enumerate() {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                if out_tx.is_closed() {
                    warn!(
                        batch_id = %batch_id,
                        "Caller disconnected; {} of {} samples not started",
                        total - index,
                        total
                    );
                    break;
                }

                let (emitter, run_rx) = EventEmitter::channel();
                if runs_tx.send(run_rx).is_err() {
                    break;
                }

                let run_id = format!("file-{}", index);
                let span = info_span!("run", batch_id = %batch_id, id = %run_id);
                let pipeline = Arc::clone(&pipeline);
                let passphrase = passphrase.clone();

                tokio::spawn(
                    async move {
                        pipeline
                            .run(&run_id, sample, passphrase.as_deref(), &emitter)
                            .await;
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            debug!(batch_id = %batch_id, "All samples dispatched");
        });

        out_rx
    }
}

/// Drain each run's channel to completion before moving to the next one
async fn forward_in_order(
    mut runs: mpsc::UnboundedReceiver<mpsc::UnboundedReceiver<ProgressEvent>>,
    out: mpsc::Sender<ProgressEvent>,
) {
    while let Some(mut run_events) = runs.recv().await {
        while let Some(event) = run_events.recv().await {
            if out.send(event).await.is_err() {
                debug!("Event stream closed by caller");
                return;
            }
        }
    }
}

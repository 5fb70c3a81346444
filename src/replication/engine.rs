use crate::error::generic::CdcResult;
use crate::event::change::DatabaseChange;
use crate::replication::stream::FrameSource;
use futures::future::BoxFuture;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long stop() waits for the background task to finish before
/// cancelling it forcefully.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the pull loop sleeps when no frame is pending. The stop flag
/// is rechecked after every sleep, so this also bounds shutdown latency.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// What happens to the replay position when local processing of a frame
/// fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Acknowledge the frame whether or not it was decoded and accepted by
    /// the sink. A poison record is skipped and the slot never grows
    /// unbounded, at the cost of losing records the sink rejected.
    #[default]
    Always,
    /// Acknowledge only frames the sink accepted. A rejected record is
    /// redelivered when streaming restarts on the slot.
    OnSuccess,
}

/// Handler invoked with each decoded change, serially and in the order the
/// server emitted them.
pub type Sink = Box<dyn FnMut(DatabaseChange) -> CdcResult<()> + Send>;

/// Opens the stream session when the engine transitions to Running. The
/// session is owned by the background task for the rest of its life.
pub type SessionOpener =
    Box<dyn FnOnce() -> BoxFuture<'static, CdcResult<Box<dyn FrameSource>>> + Send>;

/// Drives one background consumption task over one replication slot.
///
/// The task is spawned parked at construction, wakes on [`start`], and
/// exits cooperatively on [`stop`]. An engine is not restartable once
/// stopped.
///
/// [`start`]: ReplicationEngine::start
/// [`stop`]: ReplicationEngine::stop
pub struct ReplicationEngine {
    start_tx: Option<oneshot::Sender<()>>,
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ReplicationEngine {
    /// Provision the parked background task. Nothing is opened until
    /// start() is called. Must run inside a tokio runtime.
    pub fn new(opener: SessionOpener, sink: Sink, ack_policy: AckPolicy) -> Self {
        let (start_tx, start_rx) = oneshot::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let task_flag = Arc::clone(&stop_flag);
        let task = tokio::spawn(run(start_rx, task_flag, opener, sink, ack_policy));

        ReplicationEngine {
            start_tx: Some(start_tx),
            stop_flag,
            task: Some(task),
        }
    }

    /// Wake the background task. Fire-and-forget: connection or loop
    /// failures inside the task are observable only through logs and task
    /// termination.
    pub fn start(&mut self) {
        match self.start_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!("Replication engine was already started or stopped"),
        }
    }

    /// Signal the pull loop to exit and wait for the background task,
    /// bounded by [`STOP_TIMEOUT`]. The engine must not be started again
    /// afterwards.
    pub async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        // A task still parked on the start signal abandons when the sender
        // is dropped.
        self.start_tx.take();

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Replication task ended abnormally: {}", e),
                Err(_) => {
                    task.abort();
                    warn!(
                        "Replication task did not stop within {:?}, cancelled forcefully",
                        STOP_TIMEOUT
                    );
                }
            }
        }
    }
}

async fn run(
    start_rx: oneshot::Receiver<()>,
    stop_flag: Arc<AtomicBool>,
    opener: SessionOpener,
    mut sink: Sink,
    ack_policy: AckPolicy,
) {
    if start_rx.await.is_err() {
        info!("Replication task was released before it was started");
        return;
    }
    if stop_flag.load(Ordering::Acquire) {
        return;
    }

    let mut session = match opener().await {
        Ok(session) => session,
        Err(e) => {
            warn!("Could not open replication stream: {}", e);
            return;
        }
    };
    info!("Connected to replication stream");

    if let Err(e) = consume(session.as_mut(), &stop_flag, &mut sink, ack_policy).await {
        warn!("Replication stream loop ended: {}", e);
    }
    info!("Replication stream consumer stopped");
}

/// The pull loop. Session-level errors are fatal and end the loop;
/// per-frame decode and sink failures are logged and skipped.
async fn consume(
    session: &mut dyn FrameSource,
    stop_flag: &AtomicBool,
    sink: &mut Sink,
    ack_policy: AckPolicy,
) -> CdcResult<()> {
    while !stop_flag.load(Ordering::Acquire) {
        let frame = match session.next_pending().await? {
            Some(frame) => frame,
            None => {
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }
        };

        let delivered = match DatabaseChange::decode(&frame.payload) {
            Ok(change) => match sink(change) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Sink rejected change record: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("Could not decode change record: {}", e);
                false
            }
        };

        if delivered || ack_policy == AckPolicy::Always {
            session.ack(frame.wal_end).await?;
        }
    }
    Ok(())
}

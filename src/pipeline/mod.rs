//! The mining pipeline: four cooperating tasks over two bounded queues.
//!
//! The stratum reader turns pool traffic into session state and queued
//! notifications; the job creator derives ASIC jobs at the chip's cadence;
//! the sender installs jobs in the registry and puts them on the wire; the
//! receiver validates returned nonces and submits qualifying shares.
//!
//! Work abandonment is epoch-based: `clean_jobs` (and any pool change)
//! bumps a monotonic epoch under the shared-state lock and invalidates the
//! registry. Every queued notification, job, and looked-up result carries
//! its epoch; anything stale is dropped before it can reach the pool.

pub mod registry;
pub mod stats;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::asic::chain::{Chain, ChainReceiver, ChainSender, ChainTransport, ResetPin};
use crate::asic::protocol::ResultFrame;
use crate::asic::AsicModel;
use crate::job::builder::JobBuilder;
use crate::job::{increment_bitmask, test_nonce, AsicJob};
use crate::settings::{PoolState, Settings, StatusHandle};
use crate::stratum_v1::{
    ClientCommand, ClientConfig, ClientEvent, MiningNotification, SessionParams, StratumClient,
    SubmitParams,
};
use crate::tracing::prelude::*;
use crate::types::network_difficulty;
use registry::ActiveJobRegistry;
use stats::{BestDifficulty, HashrateTracker, ShareCounters};

/// Notification queue depth: small, latest-wins on clean work.
pub const NOTIFY_QUEUE_DEPTH: usize = 4;

/// Job queue depth: about one notification's worth of derived jobs.
pub const ASIC_JOB_QUEUE_DEPTH: usize = 8;

/// State the four tasks share, guarded by one mutex.
///
/// Critical sections stay short: callers copy what they need and release
/// the lock before hashing or I/O.
pub struct SharedState {
    inner: Mutex<Shared>,
}

struct Shared {
    session: SessionParams,
    registry: ActiveJobRegistry,
    counters: ShareCounters,
    epoch: u64,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Shared {
                session: SessionParams::default(),
                registry: ActiveJobRegistry::new(),
                counters: ShareCounters::default(),
                epoch: 0,
            }),
        }
    }

    /// Current work epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().unwrap().epoch
    }

    /// Abandon all outstanding work: bump the epoch and invalidate the
    /// registry in one critical section. Returns the new epoch.
    pub fn abandon(&self) -> u64 {
        let mut shared = self.inner.lock().unwrap();
        shared.epoch += 1;
        shared.registry.invalidate_all();
        shared.epoch
    }

    /// Snapshot the session parameters.
    pub fn session(&self) -> SessionParams {
        self.inner.lock().unwrap().session.clone()
    }

    pub fn on_subscribed(&self, extranonce1: Vec<u8>, extranonce2_size: usize) {
        let mut shared = self.inner.lock().unwrap();
        shared.session.extranonce1 = extranonce1;
        shared.session.extranonce2_size = extranonce2_size;
    }

    pub fn set_version_mask(&self, mask: u32) {
        self.inner.lock().unwrap().session.version_mask = mask;
    }

    pub fn set_pool_difficulty(&self, difficulty: f64) {
        self.inner.lock().unwrap().session.pool_difficulty = difficulty;
    }

    /// Install a job for dispatch; assigns its registry slot.
    pub fn install(&self, job: AsicJob) -> (u8, Arc<AsicJob>) {
        self.inner.lock().unwrap().registry.install(job)
    }

    /// Copy out the job for a returned result, if its slot is still valid.
    pub fn lookup(&self, local_job_id: u8) -> Option<Arc<AsicJob>> {
        self.inner.lock().unwrap().registry.lookup(local_job_id)
    }

    pub fn record_accepted(&self) -> u64 {
        let mut shared = self.inner.lock().unwrap();
        shared.counters.accepted += 1;
        shared.counters.accepted
    }

    pub fn record_rejected(&self, reason: String) -> u64 {
        let mut shared = self.inner.lock().unwrap();
        shared.counters.rejected += 1;
        shared.counters.last_reject_reason = Some(reason);
        shared.counters.rejected
    }

    pub fn counters(&self) -> ShareCounters {
        self.inner.lock().unwrap().counters.clone()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a result frame against the registry and epoch.
///
/// Returns the originating job and the composed rolled version, or `None`
/// when the result must be discarded (unknown/invalidated slot, or a stale
/// epoch after abandonment).
fn evaluate_result(shared: &SharedState, frame: &ResultFrame) -> Option<(Arc<AsicJob>, u32)> {
    let Some(job) = shared.lookup(frame.job_id_hi()) else {
        warn!(
            job_id = format!("{:02X}", frame.job_id_hi()),
            "Result for invalid job"
        );
        return None;
    };

    if job.epoch < shared.epoch() {
        trace!(
            job_id = format!("{:02X}", frame.job_id_hi()),
            "Discarding result from abandoned work"
        );
        return None;
    }

    // Midstate-format jobs encode which pre-rolled version the nonce came
    // from; full-header chips roll in silicon and report the delta alone.
    let mut version = job.version;
    if job.num_midstates > 1 {
        let rolls = frame.midstate_num.min(job.num_midstates - 1);
        for _ in 0..rolls {
            version = increment_bitmask(version, job.version_mask);
        }
    }

    Some((job, version | frame.version_bits()))
}

/// Stratum reader: applies client events to the session state and feeds
/// the notification queue.
async fn stratum_reader(
    shared: Arc<SharedState>,
    status: StatusHandle,
    mut events: mpsc::Receiver<ClientEvent>,
    notify_tx: mpsc::Sender<(Arc<MiningNotification>, u64)>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match event {
            ClientEvent::Subscribed {
                extranonce1,
                extranonce2_size,
            } => {
                shared.on_subscribed(extranonce1, extranonce2_size);
                status.write().unwrap().pool_state = PoolState::Connected;
            }

            ClientEvent::VersionMaskSet(mask) => {
                shared.set_version_mask(mask);
            }

            ClientEvent::DifficultyChanged(difficulty) => {
                shared.set_pool_difficulty(difficulty);
            }

            ClientEvent::Notification(notification) => {
                // clean_jobs is the abandonment barrier: everything tagged
                // with an earlier epoch dies downstream.
                let epoch = if notification.clean_jobs {
                    shared.abandon()
                } else {
                    shared.epoch()
                };

                if notify_tx
                    .send((Arc::new(notification), epoch))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            ClientEvent::ShareAccepted { job_id } => {
                let accepted = shared.record_accepted();
                status.write().unwrap().shares_accepted = accepted;
                info!(job_id = %job_id, accepted, "Share accepted");
            }

            ClientEvent::ShareRejected { job_id, reason } => {
                let rejected = shared.record_rejected(reason.clone());
                status.write().unwrap().shares_rejected = rejected;
                warn!(job_id = %job_id, reason = %reason, rejected, "Share rejected");
            }

            ClientEvent::Disconnected => {
                // Job ids are meaningless across sessions.
                shared.abandon();
                status.write().unwrap().pool_state = PoolState::Connecting;
            }
        }
    }

    debug!("Stratum reader exiting");
}

/// Job creator: derives jobs from the freshest notification at the chip's
/// cadence.
async fn job_creator(
    shared: Arc<SharedState>,
    model: AsicModel,
    mut notify_rx: mpsc::Receiver<(Arc<MiningNotification>, u64)>,
    job_tx: mpsc::Sender<AsicJob>,
    shutdown: CancellationToken,
) {
    let mut builder = JobBuilder::new(model);
    let mut current: Option<(Arc<MiningNotification>, u64)> = None;
    let mut ticker = tokio::time::interval(model.job_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            incoming = notify_rx.recv() => {
                let Some((notification, epoch)) = incoming else { break };

                // Superseded while queued.
                if epoch < shared.epoch() {
                    trace!(job_id = %notification.job_id, "Dropping stale notification");
                    continue;
                }

                debug!(
                    job_id = %notification.job_id,
                    clean_jobs = notification.clean_jobs,
                    "Working on notification"
                );
                current = Some((notification, epoch));
                ticker.reset();
                if !push_job(&shared, &mut builder, &current, &job_tx).await {
                    break;
                }
            }

            _ = ticker.tick(), if current.is_some() => {
                if let Some((_, epoch)) = &current {
                    if *epoch < shared.epoch() {
                        current = None;
                        continue;
                    }
                }
                if !push_job(&shared, &mut builder, &current, &job_tx).await {
                    break;
                }
            }

            _ = shutdown.cancelled() => break,
        }
    }

    debug!("Job creator exiting");
}

/// Derive and enqueue one job. Returns false when the pipeline is closed.
async fn push_job(
    shared: &SharedState,
    builder: &mut JobBuilder,
    current: &Option<(Arc<MiningNotification>, u64)>,
    job_tx: &mpsc::Sender<AsicJob>,
) -> bool {
    let Some((notification, epoch)) = current else {
        return true;
    };

    let session = shared.session();
    let job = builder.build(notification, &session, *epoch);
    job_tx.send(job).await.is_ok()
}

/// ASIC sender: installs queued jobs in the registry and transmits them.
async fn asic_sender<T: ChainTransport>(
    shared: Arc<SharedState>,
    mut job_rx: mpsc::Receiver<AsicJob>,
    mut sender: ChainSender<T>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            job = job_rx.recv() => {
                let Some(job) = job else { break };

                // Drain-on-abandon: stale jobs die at the queue head.
                if job.epoch < shared.epoch() {
                    trace!(job_id = %job.notification.job_id, "Dropping stale job");
                    continue;
                }

                let (local_job_id, job) = shared.install(job);
                if let Err(err) = sender.send_job(&job, local_job_id).await {
                    error!(error = %err, "Chain send failed");
                    break;
                }
            }

            _ = shutdown.cancelled() => break,
        }
    }

    debug!("ASIC sender exiting");
}

/// ASIC receiver: validates returned nonces, submits qualifying shares,
/// and keeps the mining statistics.
async fn asic_receiver<T: ChainTransport>(
    shared: Arc<SharedState>,
    mut receiver: ChainReceiver<T>,
    commands: mpsc::Sender<ClientCommand>,
    settings: Arc<dyn Settings>,
    status: StatusHandle,
    asic_difficulty: u32,
    shutdown: CancellationToken,
) {
    let mut hashrate = HashrateTracker::new(Instant::now());
    let mut best = BestDifficulty::load(settings.as_ref());

    loop {
        let frame = tokio::select! {
            result = receiver.receive() => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %err, "Chain receive failed");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let Some((job, rolled_version)) = evaluate_result(&shared, &frame) else {
            continue;
        };

        let share_difficulty = test_nonce(&job, frame.nonce, rolled_version);
        info!(
            job_id = format!("{:02X}", frame.job_id_hi()),
            core = format!("{}/{}", frame.core_id(), frame.small_core()),
            nonce = format!("{:08x}", frame.nonce),
            rolled_version = format!("{:08x}", rolled_version),
            difficulty = format!("{:.1}", share_difficulty),
            "Nonce returned"
        );

        let rate = hashrate.record_nonce(asic_difficulty, Instant::now());
        status.write().unwrap().hashrate = rate;
        best.record(
            share_difficulty,
            network_difficulty(job.nbits),
            &settings,
            &status,
        );

        if share_difficulty < job.pool_difficulty {
            trace!(
                difficulty = format!("{:.1}", share_difficulty),
                pool_difficulty = job.pool_difficulty,
                "Nonce below pool difficulty, not submitting"
            );
            continue;
        }

        let submit = SubmitParams {
            // The client stamps the active worker name before sending.
            username: String::new(),
            job_id: job.notification.job_id.clone(),
            extranonce2: job.extranonce2.clone(),
            ntime: job.ntime,
            nonce: frame.nonce,
            version_bits: (job.version_mask != 0)
                .then_some(rolled_version & job.version_mask),
        };
        if commands
            .send(ClientCommand::SubmitShare(submit))
            .await
            .is_err()
        {
            break;
        }
    }

    debug!("ASIC receiver exiting");
}

/// A running pipeline.
pub struct Pipeline {
    tracker: TaskTracker,
}

impl Pipeline {
    /// Spawn the Stratum client and the four pipeline tasks over an
    /// initialized chain.
    pub fn spawn<T, R>(
        chain: Chain<T, R>,
        client_config: ClientConfig,
        settings: Arc<dyn Settings>,
        status: StatusHandle,
        shutdown: CancellationToken,
    ) -> Self
    where
        T: ChainTransport + 'static,
        R: ResetPin + 'static,
    {
        let model = chain.model();
        let asic_difficulty = chain.asic_difficulty();
        let (chain_sender, chain_receiver) = chain.split();

        let shared = Arc::new(SharedState::new());
        let (event_tx, event_rx) = mpsc::channel(100);
        let (command_tx, command_rx) = mpsc::channel(100);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let (job_tx, job_rx) = mpsc::channel(ASIC_JOB_QUEUE_DEPTH);

        status.write().unwrap().pool_state = PoolState::Connecting;

        let client = StratumClient::new(client_config, event_tx, command_rx, shutdown.clone());

        let tracker = TaskTracker::new();
        tracker.spawn(async move {
            if let Err(err) = client.run().await {
                error!(error = %err, "Stratum client halted");
            }
        });
        tracker.spawn(stratum_reader(
            Arc::clone(&shared),
            status.clone(),
            event_rx,
            notify_tx,
            shutdown.clone(),
        ));
        tracker.spawn(job_creator(
            Arc::clone(&shared),
            model,
            notify_rx,
            job_tx,
            shutdown.clone(),
        ));
        tracker.spawn(asic_sender(
            Arc::clone(&shared),
            job_rx,
            chain_sender,
            shutdown.clone(),
        ));
        tracker.spawn(asic_receiver(
            shared,
            chain_receiver,
            command_tx,
            settings,
            status,
            asic_difficulty,
            shutdown,
        ));
        tracker.close();

        Self { tracker }
    }

    /// Wait for every task to finish (after shutdown is signalled).
    pub async fn wait(self) {
        self.tracker.wait().await;
    }
}

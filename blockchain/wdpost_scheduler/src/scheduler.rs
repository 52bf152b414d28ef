// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Subscribes to chain notifications, resolves proving deadlines, and
//! drives the change handler. Also supplies the concrete `WdPoStApi`
//! implementation that performs proof I/O (via the miner collaborator) and
//! records journal events (spec.md §4.6).

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use wdpost_journal::{EventType, EvtCommon, Journal, JournalEvent, SchedulerEvt, SchedulerState};
use wdpost_types::{ChainEpoch, DeadlineInfo, TipSet};

use crate::api::{
    ChainNotifyApi, ChainNotifyStream, GeneratePoStCompleteCb, HeadChangeNotif, MinerInfo,
    StorageMinerApi, SubmitPoStCompleteCb, WdPoStApi,
};
use crate::change_handler::ChangeHandler;
use crate::errors::Error;
use crate::submitter::PostWindowInfo;

/// Delay before re-subscribing after the chain notification stream ends or
/// errors (spec.md §4.6).
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(10);

/// The concrete `WdPoStApi` the scheduler hands to the change handler:
/// proof I/O is delegated to the miner collaborator, and `on_abort`/
/// `fail_post` record journal events built directly from the `ts`/`di`
/// arguments each carries (no separate live-state snapshot is consulted).
struct SchedulerApi<P, M, J> {
    miner: Arc<M>,
    journal: Arc<J>,
    _posts: PhantomData<P>,
}

#[async_trait]
impl<P, M, J> WdPoStApi<P> for SchedulerApi<P, M, J>
where
    P: Clone + Send + Sync + 'static,
    M: StorageMinerApi<P> + 'static,
    J: Journal + 'static,
{
    async fn state_miner_proving_deadline(
        &self,
        tsk: &wdpost_types::TipsetKey,
    ) -> Result<DeadlineInfo, Error> {
        self.miner.state_miner_proving_deadline(tsk).await
    }

    fn start_generate_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        cancel: CancellationToken,
        on_complete: GeneratePoStCompleteCb<P>,
    ) {
        self.miner.start_generate_post(ts, di, cancel, on_complete);
    }

    fn start_submit_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        posts: Vec<P>,
        cancel: CancellationToken,
        on_complete: SubmitPoStCompleteCb,
    ) {
        self.miner.start_submit_post(ts, di, posts, cancel, on_complete);
    }

    fn on_abort(&self, ts: Arc<TipSet>, di: DeadlineInfo) {
        let common = EvtCommon::new(Some(di), ts.epoch(), ts.cids().to_vec());
        self.journal.record_event(
            EventType::Scheduler,
            Box::new(move || JournalEvent::Scheduler(SchedulerEvt { common, state: SchedulerState::Aborted })),
        );
    }

    fn fail_post(&self, err: &anyhow::Error, ts: Arc<TipSet>, di: DeadlineInfo) {
        let common = EvtCommon::new(Some(di), ts.epoch(), ts.cids().to_vec()).with_error(err);
        self.journal.record_event(
            EventType::Scheduler,
            Box::new(move || JournalEvent::Scheduler(SchedulerEvt { common, state: SchedulerState::Faulted })),
        );
    }
}

/// Drives the windowed PoSt scheduler forever: subscribes to chain-head
/// notifications, resolves each `DeadlineInfo`, and feeds the change
/// handler (spec.md §4.6).
pub struct WindowPoStScheduler<P, M, J, C> {
    api: Arc<SchedulerApi<P, M, J>>,
    change: ChangeHandler<P, SchedulerApi<P, M, J>>,
    chain: Arc<C>,
    miner_info: MinerInfo,
}

impl<P, M, J, C> WindowPoStScheduler<P, M, J, C>
where
    P: Clone + Send + Sync + 'static,
    M: StorageMinerApi<P> + 'static,
    J: Journal + 'static,
    C: ChainNotifyApi + 'static,
{
    /// Resolves the miner's registered PoSt proof type and window-PoSt
    /// partition-sector count once, then constructs (but does not yet
    /// start) the prover/submitter pair.
    pub async fn new(miner: Arc<M>, journal: Arc<J>, chain: Arc<C>) -> Result<Self, Error> {
        let miner_info = miner.state_miner_info().await?;
        let api = Arc::new(SchedulerApi { miner, journal, _posts: PhantomData });
        let (change, prove_run, submit_run) = ChangeHandler::new(api.clone());
        ChangeHandler::start(prove_run, submit_run);
        Ok(Self { api, change, chain, miner_info })
    }

    /// The proof type and partition-sector count resolved at construction.
    /// Opaque to this crate; carried only for collaborators that interpret
    /// it (the sealing pipeline, out of scope here).
    pub fn miner_info(&self) -> MinerInfo {
        self.miner_info
    }

    /// Drives the scheduler forever, until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let mut stream = match self.chain.chain_notify().await {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("chain notification subscription failed: {err}; retrying in {RESUBSCRIBE_BACKOFF:?}");
                    Self::backoff(&shutdown).await;
                    continue;
                }
            };

            if !self.seed_from_first_batch(&mut stream, &shutdown).await {
                continue;
            }

            if !self.drain_batches(&mut stream, &shutdown).await {
                continue;
            }
        }
    }

    /// Consumes the first batch, which must contain exactly one `Current`
    /// entry, and seeds the change handler with it. Returns `false` if the
    /// stream ended and the caller should re-subscribe.
    async fn seed_from_first_batch(&self, stream: &mut ChainNotifyStream, shutdown: &CancellationToken) -> bool {
        match stream.recv().await {
            Some(batch) => {
                if let Some(HeadChangeNotif::Current(ts)) = batch.into_iter().next() {
                    self.update(shutdown.child_token(), None, Some(ts)).await;
                }
                true
            }
            None => {
                log::warn!("chain notification stream ended before seeding; retrying in {RESUBSCRIBE_BACKOFF:?}");
                Self::backoff(shutdown).await;
                false
            }
        }
    }

    /// Consumes subsequent batches until the stream ends. Each batch is
    /// reduced to its last revert and last apply entry. Returns `false`
    /// once the stream ends and a re-subscribe backoff has elapsed.
    async fn drain_batches(&self, stream: &mut ChainNotifyStream, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return true;
            }
            match stream.recv().await {
                Some(batch) => {
                    let mut revert = None;
                    let mut advance = None;
                    for notif in batch {
                        match notif {
                            HeadChangeNotif::Revert(ts) => revert = Some(ts),
                            HeadChangeNotif::Apply(ts) => advance = Some(ts),
                            HeadChangeNotif::Current(_) => {}
                        }
                    }
                    self.update(shutdown.child_token(), revert, advance).await;
                }
                None => {
                    log::warn!("chain notification stream ended; re-subscribing in {RESUBSCRIBE_BACKOFF:?}");
                    Self::backoff(shutdown).await;
                    return false;
                }
            }
        }
    }

    async fn backoff(shutdown: &CancellationToken) {
        futures::select! {
            _ = async_std::task::sleep(RESUBSCRIBE_BACKOFF).fuse() => (),
            _ = shutdown.cancelled().fuse() => (),
        }
    }

    /// Resolves the DI for `advance` and forwards to the change handler.
    /// Idempotent against a missing `advance` (logs and returns, spec.md §6
    /// "no new tipset in window post scheduler update") and against a
    /// DI-resolution failure (logs and returns, no handler state changes,
    /// spec.md §6, §7).
    #[tracing::instrument(skip(self, ctx, revert, advance))]
    pub async fn update(&self, ctx: CancellationToken, revert: Option<Arc<TipSet>>, advance: Option<Arc<TipSet>>) {
        let Some(advance) = advance else {
            log::error!("no new tipset in window post scheduler update");
            return;
        };
        let di = match self.api.state_miner_proving_deadline(advance.key()).await {
            Ok(di) => di,
            Err(err) => {
                log::error!("failed to resolve proving deadline: {err}");
                return;
            }
        };
        self.change.update(ctx, revert, advance, di).await;
    }

    /// Observes the submitter's most-recently-processed `{TS, DI}`.
    pub async fn current_ts_di(&self) -> Option<(Arc<TipSet>, DeadlineInfo)> {
        self.change.current_ts_di().await
    }

    pub async fn get_post_window(&self, di_open: ChainEpoch) -> Option<PostWindowInfo> {
        self.change.get_post_window(di_open).await
    }

    /// Cancels both handlers' shutdown contexts, draining their loops.
    pub fn shutdown(&self) {
        self.change.shutdown();
    }
}

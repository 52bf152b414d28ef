// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The narrow interfaces consumed from collaborators outside this crate's
//! scope: the sealing pipeline, the blockchain client, and the address
//! selector (spec.md §1, §6).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wdpost_types::{DeadlineInfo, TipSet, TipsetKey};

use crate::errors::Error;

/// Completion callback for an in-flight proof generation. Must be invoked
/// exactly once.
pub type GeneratePoStCompleteCb<P> = Box<dyn FnOnce(Vec<P>, Option<anyhow::Error>) + Send>;

/// Completion callback for an in-flight proof submission. Must be invoked
/// exactly once.
pub type SubmitPoStCompleteCb = Box<dyn FnOnce(Option<anyhow::Error>) + Send>;

/// Opaque miner registration data resolved once at scheduler construction.
/// The scheduler core never interprets these fields; it only carries them
/// for whoever does (the sealing pipeline, out of scope here).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MinerInfo {
    pub seal_proof_type: u64,
    pub window_post_partition_sectors: u64,
}

/// The miner-facing collaborator: resolves proving deadlines, and starts
/// (without awaiting) proof generation and submission. This is the
/// `storageMinerApi`/sealing-pipeline boundary; none of it is implemented
/// by this crate outside of tests.
#[async_trait]
pub trait StorageMinerApi<P>: Send + Sync
where
    P: Clone + Send + Sync + 'static,
{
    async fn state_miner_info(&self) -> Result<MinerInfo, Error>;

    async fn state_miner_proving_deadline(&self, tsk: &TipsetKey) -> Result<DeadlineInfo, Error>;

    /// Begins asynchronous proof generation for `di` as observed at `ts`.
    /// `cancel` is the caller's own cancellation handle: the callee should
    /// stop work when it fires but is not required to guarantee it has
    /// stopped before `on_complete` runs (cancellation is a hint, spec.md
    /// §5). `on_complete` must fire exactly once regardless.
    fn start_generate_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        cancel: CancellationToken,
        on_complete: GeneratePoStCompleteCb<P>,
    );

    /// Begins asynchronous submission of `posts` for `di`. Same
    /// cancellation/completion contract as `start_generate_post`.
    fn start_submit_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        posts: Vec<P>,
        cancel: CancellationToken,
        on_complete: SubmitPoStCompleteCb,
    );
}

/// The full API surface the prove/submit handlers see, combining the miner
/// collaborator with journal-recording notifications that the scheduler
/// itself supplies (spec.md §6's `onAbort`/`failPost`).
#[async_trait]
pub trait WdPoStApi<P>: Send + Sync
where
    P: Clone + Send + Sync + 'static,
{
    async fn state_miner_proving_deadline(&self, tsk: &TipsetKey) -> Result<DeadlineInfo, Error>;

    fn start_generate_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        cancel: CancellationToken,
        on_complete: GeneratePoStCompleteCb<P>,
    );

    fn start_submit_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        posts: Vec<P>,
        cancel: CancellationToken,
        on_complete: SubmitPoStCompleteCb,
    );

    /// Notifies that an in-progress generation or submission cycle was
    /// aborted; records a journal `Aborted` event.
    fn on_abort(&self, ts: Arc<TipSet>, di: DeadlineInfo);

    /// Notifies of a terminal failure; records a journal `Faulted` event.
    fn fail_post(&self, err: &anyhow::Error, ts: Arc<TipSet>, di: DeadlineInfo);
}

/// One batch entry from the chain notification stream (spec.md §6
/// `ChainNotify`).
#[derive(Clone, Debug)]
pub enum HeadChangeNotif {
    /// The single entry of the very first batch: the chain head as of
    /// subscription time.
    Current(Arc<TipSet>),
    Revert(Arc<TipSet>),
    Apply(Arc<TipSet>),
}

impl HeadChangeNotif {
    pub fn tipset(&self) -> &Arc<TipSet> {
        match self {
            HeadChangeNotif::Current(ts) | HeadChangeNotif::Revert(ts) | HeadChangeNotif::Apply(ts) => ts,
        }
    }
}

/// A chain-head subscription: yields batches of notifications, or an
/// error/`None` on the underlying stream ending, which the scheduler
/// treats as cause to re-subscribe (spec.md §4.6).
#[async_trait]
pub trait ChainNotifyApi: Send + Sync {
    async fn chain_notify(&self) -> Result<ChainNotifyStream, Error>;
}

pub type ChainNotifyStream = Box<dyn ChainNotifyReceiver>;

/// A single batch-at-a-time receiver. Modeled as a trait rather than a
/// concrete channel type so tests can hand in a scripted sequence of
/// batches without spinning up real chain-head plumbing.
#[async_trait]
pub trait ChainNotifyReceiver: Send {
    /// Returns the next batch, or `None` if the stream has ended.
    async fn recv(&mut self) -> Option<Vec<HeadChangeNotif>>;
}

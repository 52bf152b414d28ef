// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Owns a single-slot "current proof in flight" and decides when to start
//! generation (spec.md §4.3).

use std::sync::Arc;

use async_std::channel::{bounded, Receiver, Sender};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use wdpost_types::{next_deadline, DeadlineInfo, TipSet};

use crate::api::WdPoStApi;
use crate::cache::ProofsCache;
use crate::head_change::HeadChange;

/// The prover's at-most-one in-flight generation.
pub struct CurrentPost<P> {
    pub di: DeadlineInfo,
    pub abort: CancellationToken,
    _posts: std::marker::PhantomData<P>,
}

/// Delivered by the external `on_complete` callback when a generation
/// attempt finishes, successfully or not.
pub struct PostResult<P> {
    pub ts: Arc<TipSet>,
    /// Identity of the `CurrentPost` this result belongs to. Compared by
    /// pointer identity against the prover's live `current` slot so that a
    /// late completion from a reorg-aborted attempt can never clobber
    /// freshly-started work (spec.md §3 invariant 7, §8 invariant 6).
    pub curr_post: Arc<CurrentPost<P>>,
    pub posts: Vec<P>,
    pub err: Option<anyhow::Error>,
}

/// The prover's inbound handles, held by whoever forwards head changes to
/// it (the change handler).
#[derive(Clone)]
pub struct ProveHandlerHandle {
    pub hcs: Sender<HeadChange>,
}

pub struct ProveHandler<P, A> {
    api: Arc<A>,
    cache: Arc<ProofsCache<P>>,

    hcs_rx: Receiver<HeadChange>,
    post_results_tx: Sender<PostResult<P>>,
    post_results_rx: Receiver<PostResult<P>>,

    current: Option<Arc<CurrentPost<P>>>,

    shutdown: CancellationToken,

    #[cfg(test)]
    pub processed_head_changes: Option<Sender<()>>,
    #[cfg(test)]
    pub processed_post_results: Option<Sender<()>>,
}

impl<P, A> ProveHandler<P, A>
where
    P: Clone + Send + Sync + 'static,
    A: WdPoStApi<P> + 'static,
{
    pub fn new(
        api: Arc<A>,
        cache: Arc<ProofsCache<P>>,
        shutdown: CancellationToken,
    ) -> (Self, ProveHandlerHandle) {
        // Unbuffered: a send only completes once the run loop is ready to
        // receive it, mirroring the Go source's unbuffered `chan
        // *headChange`.
        let (hcs_tx, hcs_rx) = bounded(0);
        let (post_results_tx, post_results_rx) = bounded(0);
        let handler = Self {
            api,
            cache,
            hcs_rx,
            post_results_tx,
            post_results_rx,
            current: None,
            shutdown,
            #[cfg(test)]
            processed_head_changes: None,
            #[cfg(test)]
            processed_post_results: None,
        };
        (handler, ProveHandlerHandle { hcs: hcs_tx })
    }

    /// Runs the event loop until shutdown. Consumes `self`: once the loop
    /// exits there is nothing left to observe.
    pub async fn run(mut self) {
        loop {
            let hc_fut = self.hcs_rx.recv().fuse();
            let res_fut = self.post_results_rx.recv().fuse();
            let shutdown_fut = self.shutdown.cancelled().fuse();
            futures::pin_mut!(hc_fut, res_fut, shutdown_fut);

            futures::select! {
                _ = shutdown_fut => {
                    if let Some(current) = self.current.take() {
                        current.abort.cancel();
                    }
                    return;
                }
                hc = hc_fut => {
                    match hc {
                        Ok(hc) => {
                            self.process_head_change(&hc.advance, hc.di).await;
                            #[cfg(test)]
                            if let Some(tx) = &self.processed_head_changes {
                                let _ = tx.send(()).await;
                            }
                        }
                        Err(_) => return,
                    }
                }
                res = res_fut => {
                    match res {
                        Ok(res) => {
                            self.process_post_result(res).await;
                            #[cfg(test)]
                            if let Some(tx) = &self.processed_post_results {
                                let _ = tx.send(()).await;
                            }
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }

    async fn process_head_change(&mut self, new_ts: &Arc<TipSet>, mut di: DeadlineInfo) {
        // If the post window has expired, abort the current proof and
        // replace the slot before the abort takes effect, so a late
        // completion cannot clobber whatever starts next.
        if let Some(current) = &self.current {
            if new_ts.epoch() >= current.di.close {
                current.abort.cancel();
                self.current = None;
            }
        }

        // Only generate one proof at a time.
        if self.current.is_some() {
            return;
        }

        // Advance past any deadline whose proof has already been
        // generated.
        while self.cache.get(&di).await.is_some() {
            di = next_deadline(&di);
        }

        // Too early: the chain hasn't reached the challenge height yet.
        if new_ts.epoch() < di.challenge {
            return;
        }

        let abort = CancellationToken::new();
        let current = Arc::new(CurrentPost {
            di,
            abort: abort.clone(),
            _posts: std::marker::PhantomData,
        });
        self.current = Some(current.clone());

        let post_results_tx = self.post_results_tx.clone();
        let ts_for_cb = new_ts.clone();
        self.api.start_generate_post(
            new_ts.clone(),
            di,
            abort,
            Box::new(move |posts, err| {
                let result = PostResult {
                    ts: ts_for_cb,
                    curr_post: current,
                    posts,
                    err,
                };
                async_std::task::spawn(async move {
                    let _ = post_results_tx.send(result).await;
                });
            }),
        );
    }

    async fn process_post_result(&mut self, res: PostResult<P>) {
        let di = res.curr_post.di;
        if let Some(err) = res.err {
            self.api.fail_post(&err, res.ts.clone(), di);
            log::warn!("aborted window post proving (deadline open={})", di.open);
            self.api.on_abort(res.ts, di);

            // Identity comparison: only clear `current` if it hasn't
            // already been replaced by a reorg-triggered reset.
            if let Some(current) = &self.current {
                if Arc::ptr_eq(current, &res.curr_post) {
                    self.current = None;
                }
            }
            return;
        }

        self.current = None;
        self.cache.add(di, res.posts).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_api::TestApi;
    use wdpost_types::{TipsetKey, WPoStProvingPeriodConstants};

    fn ts(epoch: wdpost_types::ChainEpoch) -> Arc<TipSet> {
        Arc::new(TipSet::new(TipsetKey::new(vec![cid::Cid::default()]), epoch))
    }

    fn di_at(index: u64, current_epoch: wdpost_types::ChainEpoch) -> DeadlineInfo {
        DeadlineInfo::new(1000, index, current_epoch, WPoStProvingPeriodConstants::MAINNET)
    }

    /// spec.md §8: `PeriodDeadlines=48, ChallengeWindow=60, ProvingPeriod=2880`;
    /// a fresh DI has `Open=1000, Close=1060, Challenge=980`.
    fn fresh_di(current_epoch: wdpost_types::ChainEpoch) -> DeadlineInfo {
        di_at(0, current_epoch)
    }

    struct Harness {
        handle: ProveHandlerHandle,
        cache: Arc<ProofsCache<u8>>,
        api: TestApi<u8>,
        processed: Receiver<()>,
    }

    async fn spawn() -> Harness {
        let api = TestApi::new();
        let cache = Arc::new(ProofsCache::new());
        let (mut handler, handle) = ProveHandler::new(Arc::new(api.clone()), cache.clone(), CancellationToken::new());
        let (tx, rx) = bounded(1);
        handler.processed_head_changes = Some(tx.clone());
        handler.processed_post_results = Some(tx);
        async_std::task::spawn(handler.run());
        Harness { handle, cache, api, processed: rx }
    }

    async fn feed(h: &Harness, advance: Arc<TipSet>, di: DeadlineInfo) {
        h.handle
            .hcs
            .send(HeadChange { ctx: CancellationToken::new(), revert: None, advance, di })
            .await
            .unwrap();
        h.processed.recv().await.unwrap();
    }

    #[async_std::test]
    async fn too_early_head_change_emits_nothing_then_emits_on_reaching_challenge() {
        let h = spawn().await;

        feed(&h, ts(979), fresh_di(979)).await;
        assert_eq!(h.api.generate_call_count(), 0);

        feed(&h, ts(980), fresh_di(980)).await;
        assert_eq!(h.api.generate_call_count(), 1);
        let (_, di) = &h.api.generate_calls()[0];
        assert_eq!(di.open, 1000);
    }

    #[async_std::test]
    async fn cold_start_happy_path_emits_one_generate_post() {
        let h = spawn().await;
        feed(&h, ts(980), fresh_di(980)).await;
        assert_eq!(h.api.generate_call_count(), 1);

        h.api.complete_generate(0, vec![7u8], None);
        h.processed.recv().await.unwrap();
        assert_eq!(h.cache.get(&fresh_di(980)).await, Some(vec![7u8]));
    }

    #[async_std::test]
    async fn sequential_deadlines_advance_candidate_without_emitting() {
        let h = spawn().await;
        h.cache.add(fresh_di(1000), vec![7u8]).await;

        // di.Open = 1060's Challenge is 1040; advance only reaches 1005.
        feed(&h, ts(1005), fresh_di(1005)).await;
        assert_eq!(h.api.generate_call_count(), 0);
    }

    #[async_std::test]
    async fn stale_post_result_does_not_clobber_fresh_current() {
        let h = spawn().await;
        feed(&h, ts(980), fresh_di(980)).await;
        assert_eq!(h.api.generate_call_count(), 1);

        // Expire the first window; by this height the externally-resolved
        // DI has already advanced to the next deadline index.
        feed(&h, ts(1060), di_at(1, 1060)).await;
        assert_eq!(h.api.generate_call_count(), 2);

        // The stale completion for the replaced (first) attempt arrives
        // late; it must not clear the live `current`.
        h.api.complete_generate(0, vec![], Some(anyhow::anyhow!("canceled")));
        h.processed.recv().await.unwrap();

        // The live (second) generation still completes normally.
        h.api.complete_generate(1, vec![9u8], None);
        h.processed.recv().await.unwrap();
        assert_eq!(h.cache.get(&di_at(1, 1060)).await, Some(vec![9u8]));
    }
}

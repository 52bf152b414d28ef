// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Owns one submission slot per deadline-open epoch and decides when to
//! submit a cached proof (spec.md §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use async_std::channel::{bounded, Receiver, Sender};
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wdpost_types::{ChainEpoch, DeadlineInfo, TipSet};

use crate::api::WdPoStApi;
use crate::cache::ProofsCache;
use crate::head_change::HeadChange;

/// Submission policy constant: an `advance` must clear `di.open +
/// SUBMIT_CONFIDENCE` before a submission is started, to ride out shallow
/// reorgs (spec.md §6 "Constants").
pub const SUBMIT_CONFIDENCE: ChainEpoch = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubmitState {
    Start,
    Submitting,
    Complete,
}

/// Per-deadline submission record. `generation` is an identity token: it is
/// cloned into the completion callback at submit-start and compared on
/// result delivery, so a late completion from a reorg-replaced window can
/// be told apart from the live one without replacing the whole record on
/// every ordinary state transition.
pub struct PostWindow<P> {
    pub ts: Arc<TipSet>,
    pub di: DeadlineInfo,
    pub submit_state: SubmitState,
    pub abort: Option<CancellationToken>,
    generation: Arc<()>,
    _posts: std::marker::PhantomData<P>,
}

impl<P> PostWindow<P> {
    fn fresh(ts: Arc<TipSet>, di: DeadlineInfo) -> Self {
        Self {
            ts,
            di,
            submit_state: SubmitState::Start,
            abort: None,
            generation: Arc::new(()),
            _posts: std::marker::PhantomData,
        }
    }
}

/// A snapshot handed back to external callers of `get_post_window`; unlike
/// the internal `PostWindow` it carries no identity token or abort handle.
#[derive(Clone, Debug)]
pub struct PostWindowInfo {
    pub ts: Arc<TipSet>,
    pub di: DeadlineInfo,
    pub submit_state: SubmitState,
}

impl<P> From<&PostWindow<P>> for PostWindowInfo {
    fn from(pw: &PostWindow<P>) -> Self {
        Self {
            ts: pw.ts.clone(),
            di: pw.di,
            submit_state: pw.submit_state,
        }
    }
}

/// Delivered by the external `on_complete` callback when a submission
/// attempt finishes, successfully or not.
pub struct SubmitResult {
    di_open: ChainEpoch,
    generation: Arc<()>,
    ts: Arc<TipSet>,
    di: DeadlineInfo,
    err: Option<anyhow::Error>,
}

struct CurrentTsDiRequest {
    reply: oneshot::Sender<(Arc<TipSet>, DeadlineInfo)>,
}

struct GetPostWindowRequest {
    di_open: ChainEpoch,
    reply: oneshot::Sender<Option<PostWindowInfo>>,
}

/// The submitter's inbound handles, held by whoever forwards head changes
/// to it (the change handler) and by external callers of the query
/// methods.
#[derive(Clone)]
pub struct SubmitHandlerHandle {
    hcs: Sender<HeadChange>,
    ts_di_reqs: Sender<CurrentTsDiRequest>,
    pw_reqs: Sender<GetPostWindowRequest>,
}

impl SubmitHandlerHandle {
    pub fn hcs(&self) -> Sender<HeadChange> {
        self.hcs.clone()
    }

    /// Observes the submitter's most-recently-processed `{TS, DI}`.
    /// Answered synchronously inside the owning task, per spec.md §4.4.
    pub async fn current_ts_di(&self) -> Option<(Arc<TipSet>, DeadlineInfo)> {
        let (reply, rx) = oneshot::channel();
        self.ts_di_reqs.send(CurrentTsDiRequest { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn get_post_window(&self, di_open: ChainEpoch) -> Option<PostWindowInfo> {
        let (reply, rx) = oneshot::channel();
        self.pw_reqs
            .send(GetPostWindowRequest { di_open, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

pub struct SubmitHandler<P, A> {
    api: Arc<A>,
    cache: Arc<ProofsCache<P>>,

    hcs_rx: Receiver<HeadChange>,
    submit_results_tx: Sender<SubmitResult>,
    submit_results_rx: Receiver<SubmitResult>,
    announce_rx: Receiver<crate::cache::PostInfo<P>>,
    ts_di_reqs_rx: Receiver<CurrentTsDiRequest>,
    pw_reqs_rx: Receiver<GetPostWindowRequest>,

    post_windows: HashMap<ChainEpoch, PostWindow<P>>,
    current: Option<(Arc<TipSet>, DeadlineInfo)>,

    shutdown: CancellationToken,

    #[cfg(test)]
    pub processed_head_changes: Option<Sender<()>>,
    #[cfg(test)]
    pub processed_submit_results: Option<Sender<()>>,
    #[cfg(test)]
    pub processed_post_ready: Option<Sender<()>>,
}

impl<P, A> SubmitHandler<P, A>
where
    P: Clone + Send + Sync + 'static,
    A: WdPoStApi<P> + 'static,
{
    pub fn new(
        api: Arc<A>,
        cache: Arc<ProofsCache<P>>,
        shutdown: CancellationToken,
    ) -> (Self, SubmitHandlerHandle) {
        let (hcs_tx, hcs_rx) = bounded(0);
        let (submit_results_tx, submit_results_rx) = bounded(0);
        let (ts_di_reqs_tx, ts_di_reqs_rx) = bounded(0);
        let (pw_reqs_tx, pw_reqs_rx) = bounded(0);
        let announce_rx = cache.announce_receiver();
        let handler = Self {
            api,
            cache,
            hcs_rx,
            submit_results_tx,
            submit_results_rx,
            announce_rx,
            ts_di_reqs_rx,
            pw_reqs_rx,
            post_windows: HashMap::new(),
            current: None,
            shutdown,
            #[cfg(test)]
            processed_head_changes: None,
            #[cfg(test)]
            processed_submit_results: None,
            #[cfg(test)]
            processed_post_ready: None,
        };
        (
            handler,
            SubmitHandlerHandle {
                hcs: hcs_tx,
                ts_di_reqs: ts_di_reqs_tx,
                pw_reqs: pw_reqs_tx,
            },
        )
    }

    pub async fn run(mut self) {
        loop {
            let hc_fut = self.hcs_rx.recv().fuse();
            let res_fut = self.submit_results_rx.recv().fuse();
            let pi_fut = self.announce_rx.recv().fuse();
            let ts_di_fut = self.ts_di_reqs_rx.recv().fuse();
            let pw_fut = self.pw_reqs_rx.recv().fuse();
            let shutdown_fut = self.shutdown.cancelled().fuse();
            futures::pin_mut!(hc_fut, res_fut, pi_fut, ts_di_fut, pw_fut, shutdown_fut);

            futures::select! {
                _ = shutdown_fut => {
                    for pw in self.post_windows.values() {
                        if let Some(abort) = &pw.abort {
                            abort.cancel();
                        }
                    }
                    return;
                }
                hc = hc_fut => {
                    match hc {
                        Ok(hc) => {
                            self.process_head_change(hc).await;
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
                            self.process_submit_result(res);
                            #[cfg(test)]
                            if let Some(tx) = &self.processed_submit_results {
                                let _ = tx.send(()).await;
                            }
                        }
                        Err(_) => return,
                    }
                }
                pi = pi_fut => {
                    match pi {
                        Ok(pi) => {
                            self.process_post_ready(pi.di.open).await;
                            #[cfg(test)]
                            if let Some(tx) = &self.processed_post_ready {
                                let _ = tx.send(()).await;
                            }
                        }
                        Err(_) => return,
                    }
                }
                req = ts_di_fut => {
                    if let Ok(req) = req {
                        if let Some((ts, di)) = &self.current {
                            let _ = req.reply.send((ts.clone(), *di));
                        }
                    }
                }
                req = pw_fut => {
                    if let Ok(req) = req {
                        let info = self.post_windows.get(&req.di_open).map(PostWindowInfo::from);
                        let _ = req.reply.send(info);
                    }
                }
            }
        }
    }

    async fn process_head_change(&mut self, hc: HeadChange) {
        self.current = Some((hc.advance.clone(), hc.di));

        self.post_windows
            .entry(hc.di.open)
            .or_insert_with(|| PostWindow::fresh(hc.advance.clone(), hc.di));

        let epochs: Vec<ChainEpoch> = self.post_windows.keys().copied().collect();
        for epoch in epochs {
            self.process_head_change_for_pw(hc.revert.as_ref(), &hc.advance, epoch)
                .await;
        }
    }

    async fn process_head_change_for_pw(
        &mut self,
        revert: Option<&Arc<TipSet>>,
        advance: &Arc<TipSet>,
        epoch: ChainEpoch,
    ) {
        let Some(pw) = self.post_windows.get(&epoch) else {
            return;
        };

        let reverted_to_prev_dl = revert.map(|r| r.epoch() < pw.di.open).unwrap_or(false);
        let expired = advance.epoch() >= pw.di.close;

        if pw.submit_state == SubmitState::Submitting && (reverted_to_prev_dl || expired) {
            let old_abort = pw.abort.clone();
            let fresh = PostWindow::fresh(advance.clone(), pw.di);
            self.post_windows.insert(epoch, fresh);
            if let Some(abort) = old_abort {
                abort.cancel();
            }
        } else if pw.submit_state == SubmitState::Complete && reverted_to_prev_dl {
            if let Some(pw) = self.post_windows.get_mut(&epoch) {
                pw.submit_state = SubmitState::Start;
            }
        }

        self.submit_if_ready(advance, epoch).await;
    }

    async fn submit_if_ready(&mut self, advance: &Arc<TipSet>, epoch: ChainEpoch) {
        let di = match self.post_windows.get(&epoch) {
            Some(pw) => pw.di,
            None => return,
        };

        if advance.epoch() >= di.close {
            return;
        }
        if self.post_windows.get(&epoch).map(|pw| pw.submit_state) != Some(SubmitState::Start) {
            return;
        }
        if advance.epoch() < di.open + SUBMIT_CONFIDENCE {
            return;
        }
        let Some(posts) = self.cache.get(&di).await else {
            return;
        };

        if posts.is_empty() {
            if let Some(pw) = self.post_windows.get_mut(&epoch) {
                pw.submit_state = SubmitState::Complete;
            }
            return;
        }

        let abort = CancellationToken::new();
        let generation = {
            let pw = self.post_windows.get_mut(&epoch).expect("checked above");
            pw.submit_state = SubmitState::Submitting;
            pw.abort = Some(abort.clone());
            pw.generation.clone()
        };

        let submit_results_tx = self.submit_results_tx.clone();
        let ts_for_cb = advance.clone();
        self.api.start_submit_post(
            advance.clone(),
            di,
            posts,
            abort,
            Box::new(move |err| {
                let result = SubmitResult {
                    di_open: epoch,
                    generation,
                    ts: ts_for_cb,
                    di,
                    err,
                };
                async_std::task::spawn(async move {
                    let _ = submit_results_tx.send(result).await;
                });
            }),
        );
    }

    async fn process_post_ready(&mut self, di_open: ChainEpoch) {
        let Some((ts, _)) = self.current.clone() else {
            return;
        };
        if self.post_windows.contains_key(&di_open) {
            self.submit_if_ready(&ts, di_open).await;
        }
    }

    fn process_submit_result(&mut self, res: SubmitResult) {
        if let Some(err) = res.err {
            self.api.fail_post(&err, res.ts.clone(), res.di);
            log::warn!("aborted window post submission (deadline open={})", res.di.open);
            self.api.on_abort(res.ts, res.di);

            // Identity comparison: only reset `submit_state` if this window
            // hasn't already been replaced by a reorg-triggered reset.
            if let Some(pw) = self.post_windows.get_mut(&res.di_open) {
                if Arc::ptr_eq(&pw.generation, &res.generation) {
                    pw.submit_state = SubmitState::Start;
                }
            }
            return;
        }

        if let Some(pw) = self.post_windows.get_mut(&res.di_open) {
            if Arc::ptr_eq(&pw.generation, &res.generation) {
                pw.submit_state = SubmitState::Complete;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_api::TestApi;
    use wdpost_types::{TipsetKey, WPoStProvingPeriodConstants};

    fn ts(epoch: ChainEpoch) -> Arc<TipSet> {
        Arc::new(TipSet::new(TipsetKey::new(vec![cid::Cid::default()]), epoch))
    }

    fn di_at(index: u64, current_epoch: ChainEpoch) -> DeadlineInfo {
        DeadlineInfo::new(1000, index, current_epoch, WPoStProvingPeriodConstants::MAINNET)
    }

    /// spec.md §8: a fresh DI has `Open=1000, Close=1060`; `SUBMIT_CONFIDENCE`
    /// clears at epoch 1004.
    fn fresh_di(current_epoch: ChainEpoch) -> DeadlineInfo {
        di_at(0, current_epoch)
    }

    struct Harness {
        handle: SubmitHandlerHandle,
        cache: Arc<ProofsCache<u8>>,
        api: TestApi<u8>,
        processed: Receiver<()>,
    }

    async fn spawn() -> Harness {
        let api = TestApi::new();
        let cache = Arc::new(ProofsCache::new());
        let (mut handler, handle) = SubmitHandler::new(Arc::new(api.clone()), cache.clone(), CancellationToken::new());
        let (tx, rx) = bounded(1);
        handler.processed_head_changes = Some(tx.clone());
        handler.processed_submit_results = Some(tx.clone());
        handler.processed_post_ready = Some(tx);
        async_std::task::spawn(handler.run());
        Harness { handle, cache, api, processed: rx }
    }

    /// Populates the cache directly (bypassing the prover) and drains the
    /// announce echo this produces, whether or not it triggers a submit.
    async fn seed_cache(h: &Harness, di: DeadlineInfo, posts: Vec<u8>) {
        h.cache.add(di, posts).await;
        h.processed.recv().await.unwrap();
    }

    async fn feed(h: &Harness, revert: Option<Arc<TipSet>>, advance: Arc<TipSet>, di: DeadlineInfo) {
        h.handle
            .hcs()
            .send(HeadChange { ctx: CancellationToken::new(), revert, advance, di })
            .await
            .unwrap();
        h.processed.recv().await.unwrap();
    }

    #[async_std::test]
    async fn submits_once_confidence_reached_and_cache_populated() {
        let h = spawn().await;
        seed_cache(&h, fresh_di(1005), vec![7u8]).await;

        feed(&h, None, ts(1005), fresh_di(1005)).await;
        assert_eq!(h.api.submit_call_count(), 1);
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Submitting
        );

        h.api.complete_submit(0, None);
        h.processed.recv().await.unwrap();
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Complete
        );
    }

    #[async_std::test]
    async fn empty_proof_set_completes_without_submitting() {
        let h = spawn().await;
        seed_cache(&h, fresh_di(1005), vec![]).await;

        feed(&h, None, ts(1005), fresh_di(1005)).await;
        assert_eq!(h.api.submit_call_count(), 0);
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Complete
        );
    }

    #[async_std::test]
    async fn reorg_during_submit_replaces_window_and_discards_stale_completion() {
        let h = spawn().await;
        seed_cache(&h, fresh_di(1005), vec![7u8]).await;

        feed(&h, None, ts(1005), fresh_di(1005)).await;
        assert_eq!(h.api.submit_call_count(), 1);

        // A shallow reorg lands behind this window's open; the in-flight
        // submission must be replaced and re-started, not just re-used.
        feed(&h, Some(ts(990)), ts(1006), fresh_di(1006)).await;
        assert_eq!(h.api.submit_call_count(), 2);
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Submitting
        );

        // The stale (pre-reorg) completion arrives late. `fail_post`/
        // `on_abort` still fire unconditionally, but its generation no
        // longer matches the replaced window, so `submit_state` is left
        // alone rather than being reset to `Start`.
        h.api.complete_submit(0, Some(anyhow::anyhow!("canceled")));
        h.processed.recv().await.unwrap();
        assert_eq!(h.api.failure_count(), 1);
        assert_eq!(h.api.abort_count(), 1);
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Submitting
        );

        // The live (post-reorg) submission still completes normally.
        h.api.complete_submit(1, None);
        h.processed.recv().await.unwrap();
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Complete
        );
    }

    #[async_std::test]
    async fn expired_window_is_replaced_and_aborted_without_resubmission() {
        let h = spawn().await;
        seed_cache(&h, fresh_di(1005), vec![7u8]).await;

        feed(&h, None, ts(1005), fresh_di(1005)).await;
        assert_eq!(h.api.submit_call_count(), 1);

        // Advance past this window's close with the next deadline's DI; the
        // expired window is replaced and its in-flight submit aborted, but
        // no new submission is started for it (it's already closed), and
        // the fresh next-deadline window hasn't reached confidence yet.
        feed(&h, None, ts(1060), di_at(1, 1060)).await;
        assert_eq!(h.api.submit_call_count(), 1);
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Start
        );

        // `fail_post`/`on_abort` fire unconditionally even though this
        // completion targets an already-replaced window; only the
        // `submit_state` write is suppressed by the generation mismatch.
        h.api.complete_submit(0, Some(anyhow::anyhow!("canceled")));
        h.processed.recv().await.unwrap();
        assert_eq!(h.api.failure_count(), 1);
        assert_eq!(h.api.abort_count(), 1);
        assert_eq!(h.api.submit_call_count(), 1);
        assert_eq!(
            h.handle.get_post_window(1000).await.unwrap().submit_state,
            SubmitState::Start
        );
    }
}

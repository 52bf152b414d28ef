// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Constructs and supervises the prover and submitter, fanning out head
//! changes to both (spec.md §4.5).

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use wdpost_types::{DeadlineInfo, TipSet};

use crate::api::WdPoStApi;
use crate::cache::ProofsCache;
use crate::head_change::HeadChange;
use crate::prover::{ProveHandler, ProveHandlerHandle};
use crate::submitter::{PostWindowInfo, SubmitHandler, SubmitHandlerHandle};

pub struct ChangeHandler<P, A> {
    shutdown: CancellationToken,
    prove: ProveHandlerHandle,
    submit: SubmitHandlerHandle,
    _api: std::marker::PhantomData<A>,
    _posts: std::marker::PhantomData<P>,
}

impl<P, A> ChangeHandler<P, A>
where
    P: Clone + Send + Sync + 'static,
    A: WdPoStApi<P> + 'static,
{
    /// Constructs the prover and submitter sharing one proofs cache. Call
    /// `start()` to launch their event loops.
    pub fn new(api: Arc<A>) -> (Self, ProveHandlerForRun<P, A>, SubmitHandlerForRun<P, A>) {
        let shutdown = CancellationToken::new();
        let cache = Arc::new(ProofsCache::new());

        let (prove_handler, prove) = ProveHandler::new(api.clone(), cache.clone(), shutdown.child_token());
        let (submit_handler, submit) = SubmitHandler::new(api, cache, shutdown.child_token());

        let handler = Self {
            shutdown,
            prove,
            submit,
            _api: std::marker::PhantomData,
            _posts: std::marker::PhantomData,
        };
        (handler, ProveHandlerForRun(prove_handler), SubmitHandlerForRun(submit_handler))
    }

    /// Launches both event loops as independent tasks. Takes the handler
    /// values returned alongside `new()` so they can only be started once.
    pub fn start(prove_handler: ProveHandlerForRun<P, A>, submit_handler: SubmitHandlerForRun<P, A>) {
        async_std::task::spawn(prove_handler.0.run());
        async_std::task::spawn(submit_handler.0.run());
    }

    /// Resolves the DI for `advance`, then forwards the head change to the
    /// prover and then the submitter. Prover-first ordering is required:
    /// if a generation result is imminent, the submitter must not process
    /// the same head change first and race ahead of prover state.
    pub async fn update(
        &self,
        ctx: CancellationToken,
        revert: Option<Arc<TipSet>>,
        advance: Arc<TipSet>,
        di: DeadlineInfo,
    ) {
        if !di.period_started() {
            return;
        }

        let hc = HeadChange {
            ctx: ctx.clone(),
            revert,
            advance,
            di,
        };

        futures::select! {
            _ = ctx.cancelled().fuse() => return,
            _ = self.shutdown.cancelled().fuse() => return,
            res = self.prove.hcs.send(hc.clone()).fuse() => {
                if res.is_err() {
                    return;
                }
            }
        }

        futures::select! {
            _ = ctx.cancelled().fuse() => (),
            _ = self.shutdown.cancelled().fuse() => (),
            res = self.submit.hcs().send(hc).fuse() => {
                let _ = res;
            }
        }
    }

    /// Cancels both handlers' shutdown contexts, draining their loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Observes the submitter's most-recently-processed `{TS, DI}`.
    pub async fn current_ts_di(&self) -> Option<(Arc<TipSet>, DeadlineInfo)> {
        self.submit.current_ts_di().await
    }

    pub async fn get_post_window(&self, di_open: wdpost_types::ChainEpoch) -> Option<PostWindowInfo> {
        self.submit.get_post_window(di_open).await
    }
}

/// Wraps a constructed `ProveHandler` so it can only be consumed by
/// `ChangeHandler::start`, never polled or inspected directly.
pub struct ProveHandlerForRun<P, A>(ProveHandler<P, A>);

/// Wraps a constructed `SubmitHandler` so it can only be consumed by
/// `ChangeHandler::start`, never polled or inspected directly.
pub struct SubmitHandlerForRun<P, A>(SubmitHandler<P, A>);

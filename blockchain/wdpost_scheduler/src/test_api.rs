// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Mock `WdPoStApi` for exercising the handlers without real proof I/O.
//! Struct used for creating a provider when writing tests involving the
//! windowed PoSt scheduler, following the `TestApi`/`TestApiInner` split of
//! `blockchain/message_pool`'s own test provider: an outer handle cloneable
//! across tasks, an inner lock-guarded state struct.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use wdpost_types::{DeadlineInfo, TipSet, TipsetKey};

use crate::api::{GeneratePoStCompleteCb, SubmitPoStCompleteCb, WdPoStApi};
use crate::errors::Error;

/// `pending_generate`/`pending_submit` are indexed in call order, the same
/// order as `generate_calls`/`submit_calls`: a stale (replaced) attempt and
/// the fresh one that replaced it get distinct slots even when both target
/// the same deadline, so tests can complete either independently.
struct TestApiInner<P> {
    generate_calls: Vec<(Arc<TipSet>, DeadlineInfo)>,
    submit_calls: Vec<(Arc<TipSet>, DeadlineInfo, Vec<P>)>,
    aborts: Vec<(Arc<TipSet>, DeadlineInfo)>,
    failures: Vec<(Arc<TipSet>, DeadlineInfo, String)>,
    pending_generate: Vec<Option<(CancellationToken, GeneratePoStCompleteCb<P>)>>,
    pending_submit: Vec<Option<(CancellationToken, SubmitPoStCompleteCb)>>,
}

impl<P> Default for TestApiInner<P> {
    fn default() -> Self {
        Self {
            generate_calls: Vec::new(),
            submit_calls: Vec::new(),
            aborts: Vec::new(),
            failures: Vec::new(),
            pending_generate: Vec::new(),
            pending_submit: Vec::new(),
        }
    }
}

pub struct TestApi<P> {
    inner: Arc<Mutex<TestApiInner<P>>>,
}

impl<P> Clone for TestApi<P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P> Default for TestApi<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> TestApi<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(TestApiInner::default())) }
    }

    /// Invokes the `on_complete` callback captured from the `call_index`-th
    /// `start_generate_post` call, if it hasn't already been completed.
    pub fn complete_generate(&self, call_index: usize, posts: Vec<P>, err: Option<anyhow::Error>) {
        let pending = self
            .inner
            .lock()
            .pending_generate
            .get_mut(call_index)
            .and_then(|slot| slot.take());
        if let Some((_, on_complete)) = pending {
            on_complete(posts, err);
        }
    }

    /// Invokes the `on_complete` callback captured from the `call_index`-th
    /// `start_submit_post` call, if it hasn't already been completed.
    pub fn complete_submit(&self, call_index: usize, err: Option<anyhow::Error>) {
        let pending = self
            .inner
            .lock()
            .pending_submit
            .get_mut(call_index)
            .and_then(|slot| slot.take());
        if let Some((_, on_complete)) = pending {
            on_complete(err);
        }
    }

    pub fn generate_call_count(&self) -> usize {
        self.inner.lock().generate_calls.len()
    }

    pub fn submit_call_count(&self) -> usize {
        self.inner.lock().submit_calls.len()
    }

    pub fn generate_calls(&self) -> Vec<(Arc<TipSet>, DeadlineInfo)> {
        self.inner.lock().generate_calls.clone()
    }

    pub fn submit_calls(&self) -> Vec<(Arc<TipSet>, DeadlineInfo, Vec<P>)> {
        self.inner.lock().submit_calls.clone()
    }

    pub fn abort_count(&self) -> usize {
        self.inner.lock().aborts.len()
    }

    pub fn failure_count(&self) -> usize {
        self.inner.lock().failures.len()
    }
}

#[async_trait]
impl<P> WdPoStApi<P> for TestApi<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn state_miner_proving_deadline(&self, _tsk: &TipsetKey) -> Result<DeadlineInfo, Error> {
        Err(Error::Other(
            "TestApi does not resolve deadlines; drive handlers directly with a DeadlineInfo".into(),
        ))
    }

    fn start_generate_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        cancel: CancellationToken,
        on_complete: GeneratePoStCompleteCb<P>,
    ) {
        let mut inner = self.inner.lock();
        inner.generate_calls.push((ts, di));
        inner.pending_generate.push(Some((cancel, on_complete)));
    }

    fn start_submit_post(
        &self,
        ts: Arc<TipSet>,
        di: DeadlineInfo,
        posts: Vec<P>,
        cancel: CancellationToken,
        on_complete: SubmitPoStCompleteCb,
    ) {
        let mut inner = self.inner.lock();
        inner.submit_calls.push((ts, di, posts));
        inner.pending_submit.push(Some((cancel, on_complete)));
    }

    fn on_abort(&self, ts: Arc<TipSet>, di: DeadlineInfo) {
        self.inner.lock().aborts.push((ts, di));
    }

    fn fail_post(&self, err: &anyhow::Error, ts: Arc<TipSet>, di: DeadlineInfo) {
        self.inner.lock().failures.push((ts, di, err.to_string()));
    }
}

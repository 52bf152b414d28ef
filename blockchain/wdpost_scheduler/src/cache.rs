// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Mapping from deadline-open epoch to the prepared proof submissions for
//! that deadline, with an announce channel for new entries (spec.md §4.2).

use std::collections::HashMap;

use async_std::channel::{bounded, Receiver, Sender};
use tokio::sync::RwLock;
use wdpost_types::{ChainEpoch, DeadlineInfo};

/// The channel capacity is part of the contract (spec.md §4.2, §5):
/// bounded, never-drop, producer waits briefly rather than losing an
/// announcement.
const ANNOUNCE_CAPACITY: usize = 16;

/// A `{di, posts}` pair announced when the prover completes.
#[derive(Clone, Debug)]
pub struct PostInfo<P> {
    pub di: DeadlineInfo,
    pub posts: Vec<P>,
}

/// Keeps a cache of PoSts for each proving window. Readers and writers may
/// be different tasks; `get`/`add` are both safe to call concurrently.
/// Entries are created once by the prover on success and never mutated
/// thereafter.
///
/// TODO: clear cache entries older than chain finality (spec.md §3, §9 —
/// an allowed maintenance operation, not a correctness requirement).
pub struct ProofsCache<P> {
    cache: RwLock<HashMap<ChainEpoch, Vec<P>>>,
    announce_tx: Sender<PostInfo<P>>,
    announce_rx: Receiver<PostInfo<P>>,
}

impl<P> ProofsCache<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (announce_tx, announce_rx) = bounded(ANNOUNCE_CAPACITY);
        Self {
            cache: RwLock::new(HashMap::new()),
            announce_tx,
            announce_rx,
        }
    }

    /// Inserts `posts` at key `di.open` and announces `{di, posts}` to
    /// every subscriber of `subscribe_announce`. Never blocks on the
    /// consumer beyond the bounded queue filling up.
    pub async fn add(&self, di: DeadlineInfo, posts: Vec<P>) {
        self.cache.write().await.insert(di.open, posts.clone());
        if let Err(err) = self.announce_tx.send(PostInfo { di, posts }).await {
            log::warn!("proofs cache announce channel closed: {err}");
        }
    }

    /// Looks up the cached posts for `di.open`, if any.
    pub async fn get(&self, di: &DeadlineInfo) -> Option<Vec<P>> {
        self.cache.read().await.get(&di.open).cloned()
    }

    /// A handle onto the announce channel's single logical queue (the
    /// submitter is the one intended consumer, per spec.md §4.2; this
    /// channel is MPSC in spirit even though the underlying primitive is
    /// MPMC-capable).
    pub fn announce_receiver(&self) -> Receiver<PostInfo<P>> {
        self.announce_rx.clone()
    }
}

impl<P> Default for ProofsCache<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wdpost_types::WPoStProvingPeriodConstants;

    fn di(open: ChainEpoch) -> DeadlineInfo {
        DeadlineInfo::new(open, 0, open, WPoStProvingPeriodConstants::MAINNET)
    }

    #[async_std::test]
    async fn get_returns_none_before_add_and_some_after() {
        let cache: ProofsCache<u8> = ProofsCache::new();
        let d = di(1000);
        assert!(cache.get(&d).await.is_none());
        cache.add(d, vec![1, 2, 3]).await;
        assert_eq!(cache.get(&d).await, Some(vec![1, 2, 3]));
    }

    #[async_std::test]
    async fn add_announces_exactly_once_per_subscriber() {
        let cache: ProofsCache<u8> = ProofsCache::new();
        let rx = cache.announce_receiver();
        cache.add(di(1000), vec![9]).await;
        let announced = rx.recv().await.expect("announce delivered");
        assert_eq!(announced.di.open, 1000);
        assert_eq!(announced.posts, vec![9]);
        assert!(rx.try_recv().is_err());
    }
}

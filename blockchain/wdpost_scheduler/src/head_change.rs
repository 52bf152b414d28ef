// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wdpost_types::{DeadlineInfo, TipSet};

/// A head-change event fanned out by the change handler to both the prover
/// and the submitter (spec.md §3 `HeadChange event`).
#[derive(Clone)]
pub struct HeadChange {
    /// Cancelled if the caller that triggered this `update` gives up on
    /// it; distinct from either handler's own shutdown token.
    pub ctx: CancellationToken,
    pub revert: Option<Arc<TipSet>>,
    pub advance: Arc<TipSet>,
    pub di: DeadlineInfo,
}

// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Errors that can propagate out of the scheduler's own control flow.
///
/// Proof-generation and proof-submission failures are *not* represented
/// here: per the handlers' contract those are delivered as the `err` field
/// of a `PostResult`/`SubmitResult` and handled by `fail_post`/`on_abort`,
/// never via `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// `StateMinerProvingDeadline` failed; `update` returns this upward
    /// without touching any handler state.
    #[error("failed to resolve proving deadline: {0}")]
    DeadlineResolution(String),
    /// The chain notification subscription errored or closed.
    #[error("chain notification stream error: {0}")]
    ChainNotify(String),
    #[error("{0}")]
    Other(String),
}

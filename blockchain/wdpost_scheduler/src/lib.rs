// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Windowed PoSt scheduler core: the prove/submit pipeline that decides
//! when to generate and submit Proof-of-Spacetime, driven by chain-head
//! change notifications.

mod cache;
mod change_handler;
mod errors;
mod head_change;
mod prover;
mod scheduler;
mod submitter;

pub mod api;
pub mod test_api;

pub use cache::{PostInfo, ProofsCache};
pub use change_handler::{ChangeHandler, ProveHandlerForRun, SubmitHandlerForRun};
pub use errors::Error;
pub use head_change::HeadChange;
pub use prover::{CurrentPost, PostResult, ProveHandler, ProveHandlerHandle};
pub use scheduler::WindowPoStScheduler;
pub use submitter::{PostWindow, PostWindowInfo, SubmitHandler, SubmitHandlerHandle, SubmitState, SUBMIT_CONFIDENCE};

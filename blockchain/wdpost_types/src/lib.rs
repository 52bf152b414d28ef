// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain-head and deadline-arithmetic types shared by the windowed PoSt
//! scheduler crates. These are value types only: no I/O, no locking.

mod deadline;
mod tipset;

pub use deadline::*;
pub use tipset::*;

// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use serde::{Deserialize, Serialize};

/// A chain epoch: a monotonically increasing integer chain height.
pub type ChainEpoch = i64;

/// The CIDs that identify a tipset, usable as a map key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipsetKey(Vec<Cid>);

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self(cids)
    }

    pub fn cids(&self) -> &[Cid] {
        &self.0
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "}}")
    }
}

/// An immutable snapshot of the chain head. Opaque to the scheduler beyond
/// its height and its key identity, per the data model's `TipSet` entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TipSet {
    key: TipsetKey,
    epoch: ChainEpoch,
}

impl TipSet {
    pub fn new(key: TipsetKey, epoch: ChainEpoch) -> Self {
        Self { key, epoch }
    }

    /// The chain height at which this tipset was produced.
    pub fn epoch(&self) -> ChainEpoch {
        self.epoch
    }

    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    pub fn cids(&self) -> &[Cid] {
        self.key.cids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tipset_exposes_epoch_and_key() {
        let key = TipsetKey::new(vec![Cid::default(), Cid::default()]);
        let ts = TipSet::new(key.clone(), 1000);
        assert_eq!(ts.epoch(), 1000);
        assert_eq!(ts.key(), &key);
        assert_eq!(ts.cids(), key.cids());
    }
}

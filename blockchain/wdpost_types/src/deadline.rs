// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

use crate::ChainEpoch;

/// Protocol constants governing the shape of a proving period, bundled
/// together so that a `DeadlineInfo` is always derived from one consistent
/// set (networks other than mainnet may run a different proving period
/// geometry, the way `forest_networks` parameterizes other protocol
/// constants per network).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WPoStProvingPeriodConstants {
    /// Number of deadlines in a proving period.
    pub period_deadlines: u64,
    /// Length, in epochs, of a full proving period.
    pub proving_period: ChainEpoch,
    /// Length, in epochs, of a single deadline's challenge window.
    pub challenge_window: ChainEpoch,
    /// Number of epochs before the window opens at which the challenge is
    /// drawn.
    pub challenge_lookback: ChainEpoch,
    /// Number of epochs before a deadline opens after which fault
    /// declarations for it are rejected.
    pub fault_declaration_cutoff: ChainEpoch,
}

impl WPoStProvingPeriodConstants {
    /// Mainnet-shaped constants: 48 deadlines per proving period of 2880
    /// epochs (one day at 30s/epoch), a 60 epoch challenge window.
    pub const MAINNET: Self = Self {
        period_deadlines: 48,
        proving_period: 2880,
        challenge_window: 60,
        challenge_lookback: 20,
        fault_declaration_cutoff: 70,
    };
}

/// Describes the current proving window of the miner. DIs are value
/// objects: comparing two `DeadlineInfo`s for equality compares every
/// field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineInfo {
    /// First epoch of the proving period (<= current_epoch).
    pub period_start: ChainEpoch,
    /// Which of `period_deadlines` deadlines this is.
    pub index: u64,
    /// Epoch at which this window opens, inclusive.
    pub open: ChainEpoch,
    /// Epoch at which this window closes, exclusive.
    pub close: ChainEpoch,
    /// Earliest epoch at which a proof for this window is meaningful.
    pub challenge: ChainEpoch,
    /// First epoch at which a fault declaration for this window is
    /// rejected.
    pub fault_cutoff: ChainEpoch,
    /// Epoch at which this `DeadlineInfo` was computed.
    pub current_epoch: ChainEpoch,
    /// The constants this `DeadlineInfo` was derived against.
    pub constants: WPoStProvingPeriodConstants,
}

impl DeadlineInfo {
    /// Derives `open`/`close`/`challenge`/`fault_cutoff` for deadline
    /// `index` of the proving period starting at `period_start`.
    pub fn new(
        period_start: ChainEpoch,
        index: u64,
        current_epoch: ChainEpoch,
        constants: WPoStProvingPeriodConstants,
    ) -> Self {
        let deadline_open = period_start + (index as ChainEpoch) * constants.challenge_window;
        Self {
            period_start,
            index,
            open: deadline_open,
            close: deadline_open + constants.challenge_window,
            challenge: deadline_open - constants.challenge_lookback,
            fault_cutoff: deadline_open - constants.fault_declaration_cutoff,
            current_epoch,
            constants,
        }
    }

    /// Whether the proving period this deadline belongs to has actually
    /// begun, i.e. there is anything to prove yet.
    pub fn period_started(&self) -> bool {
        self.current_epoch >= self.period_start
    }
}

/// Computes the `DeadlineInfo` for the deadline following `current`,
/// carrying `current_epoch` through unchanged. Pure, no I/O.
pub fn next_deadline(current: &DeadlineInfo) -> DeadlineInfo {
    let mut period_start = current.period_start;
    let mut index = current.index + 1;
    if index == current.constants.period_deadlines {
        index = 0;
        period_start += current.constants.proving_period;
    }
    DeadlineInfo::new(period_start, index, current.current_epoch, current.constants)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constants() -> WPoStProvingPeriodConstants {
        WPoStProvingPeriodConstants {
            period_deadlines: 48,
            proving_period: 2880,
            challenge_window: 60,
            challenge_lookback: 20,
            fault_declaration_cutoff: 70,
        }
    }

    #[test]
    fn fresh_deadline_matches_boundary_scenario_fixture() {
        // spec.md §8: PeriodDeadlines=48, ChallengeWindow=60, ProvingPeriod=2880.
        // A fresh DI has Open=1000, Close=1060, Challenge=980.
        let di = DeadlineInfo::new(1000, 0, 980, constants());
        assert_eq!(di.open, 1000);
        assert_eq!(di.close, 1060);
        assert_eq!(di.challenge, 980);
        assert!(di.period_started());
    }

    #[test]
    fn next_deadline_advances_index_within_period() {
        let di = DeadlineInfo::new(1000, 0, 980, constants());
        let next = next_deadline(&di);
        assert_eq!(next.index, 1);
        assert_eq!(next.period_start, 1000);
        assert_eq!(next.open, 1060);
        assert_eq!(next.current_epoch, di.current_epoch);
    }

    #[test]
    fn next_deadline_wraps_period_after_final_index() {
        let c = constants();
        let last = DeadlineInfo::new(1000, c.period_deadlines - 1, 980, c);
        let wrapped = next_deadline(&last);
        assert_eq!(wrapped.index, 0);
        assert_eq!(wrapped.period_start, 1000 + c.proving_period);
    }

    #[test]
    fn full_period_round_trip_returns_index_to_start_and_advances_period_start() {
        // spec.md §8: nextDeadline applied PeriodDeadlines times advances
        // PeriodStart by exactly ProvingPeriod and returns Index to its
        // starting value.
        let c = constants();
        let mut di = DeadlineInfo::new(1000, 5, 980, c);
        let start_index = di.index;
        let start_period = di.period_start;
        for _ in 0..c.period_deadlines {
            di = next_deadline(&di);
        }
        assert_eq!(di.index, start_index);
        assert_eq!(di.period_start, start_period + c.proving_period);
    }
}

// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Journal event schema recorded by the windowed PoSt scheduler's outer
//! collaborators. The schema itself is fixed by the scheduler's contract
//! with its journal; recording and persistence are the journal
//! implementation's job (forest has no dedicated journal crate of its own,
//! so this follows the `log`-crate conventions used throughout
//! `blockchain/message_pool` and `blockchain/chain` instead).

use cid::Cid;
use serde::{Deserialize, Serialize};
use wdpost_types::{ChainEpoch, DeadlineInfo};

/// The event categories a `Journal` implementation may register or filter
/// on, mirroring the Go source's `evtTypeWdPoSt*` iota constants.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Scheduler,
    ProofsProcessed,
    RecoveriesProcessed,
    FaultsProcessed,
}

/// Fields common to every windowed PoSt journal event.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvtCommon {
    pub deadline: Option<DeadlineInfo>,
    pub height: Option<ChainEpoch>,
    pub tipset: Vec<Cid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvtCommon {
    pub fn new(deadline: Option<DeadlineInfo>, height: ChainEpoch, tipset: Vec<Cid>) -> Self {
        Self {
            deadline,
            height: Some(height),
            tipset,
            error: None,
        }
    }

    pub fn with_error(mut self, err: impl ToString) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Recorded when a WdPoSt cycle for a deadline begins, aborts, terminates
/// abnormally, or succeeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Started,
    Aborted,
    Faulted,
    Succeeded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerEvt {
    #[serde(flatten)]
    pub common: EvtCommon,
    pub state: SchedulerState,
}

/// One partition covered by a processed proof. Opaque beyond its index:
/// the sector/partition bookkeeping it stands in for is out of scope for
/// the scheduler core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoStPartition {
    pub index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofsProcessedEvt {
    #[serde(flatten)]
    pub common: EvtCommon,
    pub partitions: Vec<PoStPartition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_cid: Option<Cid>,
}

/// An opaque recovery or fault declaration, identified only by sector
/// number: declaration semantics belong to the sealing-sector state
/// machine, out of scope here (spec.md §1's non-goal on fault-recovery
/// declarations beyond notifying the journal).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub sector_number: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveriesProcessedEvt {
    #[serde(flatten)]
    pub common: EvtCommon,
    pub declarations: Vec<Declaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_cid: Option<Cid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultsProcessedEvt {
    #[serde(flatten)]
    pub common: EvtCommon,
    pub declarations: Vec<Declaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_cid: Option<Cid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JournalEvent {
    Scheduler(SchedulerEvt),
    ProofsProcessed(ProofsProcessedEvt),
    RecoveriesProcessed(RecoveriesProcessedEvt),
    FaultsProcessed(FaultsProcessedEvt),
}

/// Records windowed PoSt journal events. Implementations decide whether
/// and how an event type is persisted; `record_event` must not block the
/// caller on slow I/O.
pub trait Journal: Send + Sync {
    fn record_event(&self, event_type: EventType, build: Box<dyn FnOnce() -> JournalEvent + Send>);
}

/// A `Journal` that logs every recorded event as a single JSON line via
/// the `log` crate, at `info` level. Suitable for a daemon that ships logs
/// to a collector rather than a dedicated journal store.
#[derive(Default)]
pub struct LogJournal;

impl Journal for LogJournal {
    fn record_event(&self, event_type: EventType, build: Box<dyn FnOnce() -> JournalEvent + Send>) {
        let event = build();
        match serde_json::to_string(&event) {
            Ok(json) => log::info!(target: "wdpost::journal", "{:?} {}", event_type, json),
            Err(err) => log::warn!("failed to serialize journal event: {err}"),
        }
    }
}

impl std::fmt::Debug for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Scheduler => "wdpost/scheduler",
            EventType::ProofsProcessed => "wdpost/proofs_processed",
            EventType::RecoveriesProcessed => "wdpost/recoveries_processed",
            EventType::FaultsProcessed => "wdpost/faults_processed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_journal_records_without_panicking() {
        let journal = LogJournal;
        journal.record_event(
            EventType::Scheduler,
            Box::new(|| {
                JournalEvent::Scheduler(SchedulerEvt {
                    common: EvtCommon::new(None, 1000, vec![]),
                    state: SchedulerState::Started,
                })
            }),
        );
    }

    #[test]
    fn evt_common_carries_error_string() {
        let common = EvtCommon::new(None, 1000, vec![]).with_error("boom");
        assert_eq!(common.error.as_deref(), Some("boom"));
    }
}

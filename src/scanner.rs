//! Candidate scanner & validator
//!
//! Finds an undocumented boolean configuration cell by experiment. Each
//! candidate is a hypothesis: flip it, let the target react, and look for
//! the expected effect. Rejected hypotheses are rolled back to the exact
//! value observed before the test. A failure while testing one candidate
//! never ends the scan.
//!
//! ```text
//! Idle -> ScanningKnownAddresses -> ScanningDataSections -> Exhausted
//!              |                           |
//!              +---------> Accepted <------+
//! ```
//!
//! `Cancelled` is reachable from either scanning state.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::{StaticAddress, VirtualAddress};
use crate::memory::{MemoryAccess, PAGE_SIZE};
use crate::pe::MemoryRegion;
use crate::signal::CancelToken;
use crate::store::{PersistedConfig, PersistenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    ScanningKnownAddresses,
    ScanningDataSections,
    Accepted,
    Exhausted,
    Cancelled,
    /// The effect was already present before any toggle; nothing to find
    NotNeeded,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Accepted | ScanState::Exhausted | ScanState::Cancelled | ScanState::NotNeeded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Untested,
    RejectedNotBoolean,
    RejectedNoEffect,
    /// The address faulted on read
    RejectedUnreadable,
    /// The toggle did not take effect in memory
    RejectedWriteFailed,
    Accepted,
}

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Persisted,
    Known,
    DataSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAddress {
    pub address: VirtualAddress,
    /// Value read before the test; `None` if unreadable
    pub observed_value: Option<u32>,
    /// Position in the pass
    pub tested_at: usize,
    pub source: CandidateSource,
    pub outcome: CandidateOutcome,
}

/// Whether the sought effect is visible right now
pub trait EffectCheck {
    fn effect_observed(&self) -> bool;
}

/// Operator cancellation, sampled once per candidate
pub trait AbortSource {
    fn should_abort(&self) -> bool;

    /// Let the target react for `duration`. Returns `true` if aborted meanwhile.
    fn pause(&self, duration: Duration) -> bool {
        std::thread::sleep(duration);
        self.should_abort()
    }
}

/// Nudges the target to re-read its settings after a toggle
pub trait ApplyHook {
    fn apply(&self);
}

/// Cancel token plus an optional live key-state sample
pub struct ScanAbort {
    cancel: CancelToken,
    key_pressed: Option<fn() -> bool>,
}

impl ScanAbort {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            key_pressed: None,
        }
    }

    pub fn with_key(cancel: CancelToken, key_pressed: fn() -> bool) -> Self {
        Self {
            cancel,
            key_pressed: Some(key_pressed),
        }
    }
}

impl AbortSource for ScanAbort {
    fn should_abort(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if self.key_pressed.is_some_and(|pressed| pressed()) {
            info!("Abort key pressed, cancelling scan");
            self.cancel.cancel();
            return true;
        }
        false
    }

    fn pause(&self, duration: Duration) -> bool {
        self.cancel.wait(duration) || self.should_abort()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Upper bound on candidates tested in one pass
    pub max_candidates: usize,
    /// Time the target gets to react to a toggle
    pub settle: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_candidates: 4096,
            settle: Duration::from_millis(50),
        }
    }
}

/// Everything one pass needs to know about the target
#[derive(Debug, Clone, Default)]
pub struct ScanInputs {
    /// Live base of the module the addresses belong to
    pub module_base: VirtualAddress,
    /// Address saved by an earlier successful pass, already translated
    pub persisted: Option<VirtualAddress>,
    /// Addresses that worked on other builds, already translated
    pub known: Vec<VirtualAddress>,
    /// Module sections; only writable data sections are scanned
    pub regions: Vec<MemoryRegion>,
    /// Located apply-settings function, recorded alongside an acceptance
    pub apply_function: Option<VirtualAddress>,
}

/// Outcome of one pass
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub state: ScanState,
    pub accepted: Option<VirtualAddress>,
    pub candidates: Vec<CandidateAddress>,
}

pub struct CandidateScanner<'a> {
    memory: &'a dyn MemoryAccess,
    check: &'a dyn EffectCheck,
    abort: &'a dyn AbortSource,
    apply: Option<&'a dyn ApplyHook>,
    store: Option<&'a dyn PersistenceStore>,
    config: ScanConfig,
    state: ScanState,
    seen: HashSet<VirtualAddress>,
    candidates: Vec<CandidateAddress>,
}

impl<'a> CandidateScanner<'a> {
    pub fn new(
        memory: &'a dyn MemoryAccess,
        check: &'a dyn EffectCheck,
        abort: &'a dyn AbortSource,
        config: ScanConfig,
    ) -> Self {
        Self {
            memory,
            check,
            abort,
            apply: None,
            store: None,
            config,
            state: ScanState::Idle,
            seen: HashSet::new(),
            candidates: Vec::new(),
        }
    }

    pub fn with_apply(mut self, apply: &'a dyn ApplyHook) -> Self {
        self.apply = Some(apply);
        self
    }

    pub fn with_store(mut self, store: &'a dyn PersistenceStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Run one pass to a terminal state
    pub fn run(mut self, inputs: &ScanInputs) -> ScanReport {
        if self.check.effect_observed() {
            info!("Effect already present, skipping scan");
            return self.finish(ScanState::NotNeeded, None);
        }

        self.state = ScanState::ScanningKnownAddresses;
        let known = inputs
            .persisted
            .iter()
            .map(|a| (*a, CandidateSource::Persisted))
            .chain(inputs.known.iter().map(|a| (*a, CandidateSource::Known)));
        for (address, source) in known {
            if let Some(terminal) = self.step(address, source, inputs) {
                return terminal;
            }
        }

        self.state = ScanState::ScanningDataSections;
        let queue = self.collect_data_candidates(&inputs.regions);
        info!("Queued {} data-section candidates", queue.len());
        for address in queue {
            if let Some(terminal) = self.step(address, CandidateSource::DataSection, inputs) {
                return terminal;
            }
        }

        info!(
            "Scan exhausted after {} candidates without an effect",
            self.candidates.len()
        );
        self.finish(ScanState::Exhausted, None)
    }

    /// Test one candidate; `Some` when the pass has reached a terminal state
    fn step(
        &mut self,
        address: VirtualAddress,
        source: CandidateSource,
        inputs: &ScanInputs,
    ) -> Option<ScanReport> {
        if self.candidates.len() >= self.config.max_candidates {
            return Some(self.finish(ScanState::Exhausted, None));
        }
        if self.abort.should_abort() {
            return Some(self.finish(ScanState::Cancelled, None));
        }
        if !self.seen.insert(address) {
            return None;
        }

        let (observed_value, outcome) = self.test(address);
        let tested_at = self.candidates.len();
        self.candidates.push(CandidateAddress {
            address,
            observed_value,
            tested_at,
            source,
            outcome,
        });

        match outcome {
            CandidateOutcome::Accepted => {
                self.persist(address, inputs);
                Some(self.finish(ScanState::Accepted, Some(address)))
            }
            // Interrupted mid-test; already rolled back
            CandidateOutcome::Untested => Some(self.finish(ScanState::Cancelled, None)),
            _ => None,
        }
    }

    fn test(&self, address: VirtualAddress) -> (Option<u32>, CandidateOutcome) {
        let value = match self.memory.read_u32(address) {
            Ok(v) => v,
            Err(e) => {
                debug!("Candidate {} unreadable: {}", address, e);
                return (None, CandidateOutcome::RejectedUnreadable);
            }
        };
        if value > 1 {
            return (Some(value), CandidateOutcome::RejectedNotBoolean);
        }

        if let Err(e) = self.memory.write_u32(address, value ^ 1) {
            debug!("Candidate {} toggle failed: {}", address, e);
            self.restore(address, value);
            return (Some(value), CandidateOutcome::RejectedWriteFailed);
        }

        if let Some(apply) = self.apply {
            apply.apply();
        }

        if self.abort.pause(self.config.settle) {
            self.restore(address, value);
            return (Some(value), CandidateOutcome::Untested);
        }

        if self.check.effect_observed() {
            info!("Candidate {} accepted ({} -> {})", address, value, value ^ 1);
            return (Some(value), CandidateOutcome::Accepted);
        }

        self.restore(address, value);
        (Some(value), CandidateOutcome::RejectedNoEffect)
    }

    fn restore(&self, address: VirtualAddress, value: u32) {
        if let Err(e) = self.memory.write_u32(address, value) {
            warn!("Failed to restore {} to {}: {}", address, value, e);
        }
        if let Some(apply) = self.apply {
            apply.apply();
        }
    }

    fn persist(&self, address: VirtualAddress, inputs: &ScanInputs) {
        let Some(store) = self.store else {
            return;
        };
        let config = PersistedConfig::new(
            StaticAddress::from_live(address, inputs.module_base),
            inputs
                .apply_function
                .map(|f| StaticAddress::from_live(f, inputs.module_base)),
        );
        if let Err(e) = store.save(&config) {
            warn!("Failed to persist accepted address {}: {}", address, e);
        }
    }

    /// Boolean-shaped cells of the writable data sections, in ascending
    /// address order within ascending section order
    fn collect_data_candidates(&self, regions: &[MemoryRegion]) -> Vec<VirtualAddress> {
        let budget = self.config.max_candidates.saturating_sub(self.candidates.len());
        let mut queue = Vec::new();

        for region in regions.iter().filter(|r| r.is_writable_data()) {
            let mut page = region.base.page_floor(PAGE_SIZE);
            while page < region.end() {
                let next = page.add(PAGE_SIZE);
                let start = page.max(region.base);
                let end = next.min(region.end());

                if !self.memory.is_readable(start) {
                    debug!("Skipping unreadable page {} in {}", page, region.section_name);
                    page = next;
                    continue;
                }
                let Ok(bytes) = self.memory.read(start, end.offset_from(start)) else {
                    page = next;
                    continue;
                };

                let first = start.value().next_multiple_of(4) - start.value();
                for offset in (first..bytes.len().saturating_sub(3)).step_by(4) {
                    let value = u32::from_le_bytes([
                        bytes[offset],
                        bytes[offset + 1],
                        bytes[offset + 2],
                        bytes[offset + 3],
                    ]);
                    let address = start.add(offset);
                    if value <= 1 && !self.seen.contains(&address) {
                        queue.push(address);
                        if queue.len() >= budget {
                            return queue;
                        }
                    }
                }
                page = next;
            }
        }
        queue
    }

    fn finish(&mut self, state: ScanState, accepted: Option<VirtualAddress>) -> ScanReport {
        debug!("Scan state {:?} -> {:?}", self.state, state);
        self.state = state;
        ScanReport {
            state,
            accepted,
            candidates: std::mem::take(&mut self.candidates),
        }
    }
}

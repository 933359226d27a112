// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registry of named scheduling domains with reference counting
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below, lifecycle tests in `tests/domains.rs`
//!
//! PUBLIC API:
//!   - DomainRegistry::{add_domain, remove_domain, lookup_by_id, lookup_by_name}
//!   - DomainRegistry::{domain_get, domain_put, domain_count}
//!   - DomainRef: counted handle; dropping it is `domain_put`
//!   - DomainSlots: active/shadow slots held by the controller
//!
//! INVARIANTS:
//!   - An indexed domain carries the registry's own reference (`ref_count >= 1`)
//!   - Lookups bump the count under the index lock, so removal never races a fresh get
//!   - Removal requires `ref_count == 1` and no active/shadow slot naming the domain
//!   - Runlist sub-domains are released exactly once, when the count reaches zero

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Result, SchedError};
use crate::hal::{RunlistDomain, SchedHal};

/// Longest accepted domain name in bytes.
pub const DOMAIN_NAME_MAX: usize = 32;

/// Unique, monotonically assigned domain identifier. Zero is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DomainId(pub u64);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Policy used to order work inside a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscheduler {
    /// Round-robin built into the host hardware.
    #[default]
    HostRoundRobin,
}

/// Timing parameters supplied by `add_domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainParams {
    pub name: String,
    pub timeslice_ns: u64,
    pub preempt_grace_ns: u64,
}

/// A scheduling domain. Owned by the registry, shared through [`DomainRef`].
#[derive(Debug)]
pub struct Domain {
    id: DomainId,
    params: DomainParams,
    subscheduler: Subscheduler,
    refs: AtomicU32,
    runlist_domains: Mutex<Vec<RunlistDomain>>,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn timeslice_ns(&self) -> u64 {
        self.params.timeslice_ns
    }

    pub fn preempt_grace_ns(&self) -> u64 {
        self.params.preempt_grace_ns
    }

    pub fn subscheduler(&self) -> Subscheduler {
        self.subscheduler
    }

    /// Current logical reference count (registry reference included).
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Snapshot of the per-runlist sub-domains, ordered by runlist.
    pub fn runlist_domains(&self) -> Vec<RunlistDomain> {
        self.runlist_domains.lock().clone()
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "domain {} '{}' timeslice={}ns preempt_grace={}ns subsched={:?} refs={}",
            self.id,
            self.params.name,
            self.params.timeslice_ns,
            self.params.preempt_grace_ns,
            self.subscheduler,
            self.ref_count(),
        )
    }
}

/// Non-owning active/shadow slots. Zero encodes "none".
#[derive(Debug, Default)]
pub struct DomainSlots {
    active: AtomicU64,
    shadow: AtomicU64,
}

impl DomainSlots {
    pub fn active(&self) -> Option<DomainId> {
        decode_slot(self.active.load(Ordering::Acquire))
    }

    pub fn shadow(&self) -> Option<DomainId> {
        decode_slot(self.shadow.load(Ordering::Acquire))
    }

    /// True when either slot names `id`.
    pub fn references(&self, id: DomainId) -> bool {
        self.active() == Some(id) || self.shadow() == Some(id)
    }

    fn store_active(&self, id: Option<DomainId>) {
        self.active.store(encode_slot(id), Ordering::Release);
    }

    fn store_shadow(&self, id: Option<DomainId>) {
        self.shadow.store(encode_slot(id), Ordering::Release);
    }
}

fn encode_slot(id: Option<DomainId>) -> u64 {
    id.map_or(0, |id| id.0)
}

fn decode_slot(raw: u64) -> Option<DomainId> {
    (raw != 0).then_some(DomainId(raw))
}

/// Outcome of [`DomainRegistry::promote_shadow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSwap {
    pub active: DomainId,
    pub previous: Option<DomainId>,
}

/// Counted handle to a live [`Domain`]. Cloning is `domain_get`, dropping is `domain_put`.
pub struct DomainRef {
    domain: Arc<Domain>,
    registry: Arc<RegistryInner>,
}

impl DomainRef {
    fn acquire(domain: &Arc<Domain>, registry: &Arc<RegistryInner>) -> Self {
        domain.refs.fetch_add(1, Ordering::AcqRel);
        Self { domain: Arc::clone(domain), registry: Arc::clone(registry) }
    }
}

impl core::ops::Deref for DomainRef {
    type Target = Domain;

    fn deref(&self) -> &Domain {
        &self.domain
    }
}

impl Clone for DomainRef {
    fn clone(&self) -> Self {
        Self::acquire(&self.domain, &self.registry)
    }
}

impl Drop for DomainRef {
    fn drop(&mut self) {
        self.registry.release(&self.domain);
    }
}

impl fmt::Debug for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainRef")
            .field("id", &self.domain.id)
            .field("refs", &self.domain.ref_count())
            .finish()
    }
}

#[derive(Default)]
struct Index {
    by_id: BTreeMap<DomainId, Arc<Domain>>,
    by_name: HashMap<String, DomainId>,
}

struct RegistryInner {
    hal: Arc<dyn SchedHal>,
    id_counter: AtomicU64,
    index: Mutex<Index>,
}

impl RegistryInner {
    fn release(&self, domain: &Domain) {
        let prev = domain.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "domain {} refcount underflow", domain.id);
        if prev == 1 {
            self.destroy(domain);
        }
    }

    fn destroy(&self, domain: &Domain) {
        let subs = core::mem::take(&mut *domain.runlist_domains.lock());
        for rl in subs {
            self.hal.free_runlist_domain(rl);
        }
        debug!("domain: destroyed {}", domain.id);
    }
}

/// Creates, indexes and retires domains.
pub struct DomainRegistry {
    inner: Arc<RegistryInner>,
}

impl DomainRegistry {
    pub fn new(hal: Arc<dyn SchedHal>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hal,
                id_counter: AtomicU64::new(0),
                index: Mutex::new(Index::default()),
            }),
        }
    }

    /// Registers a new domain and returns its id.
    pub fn add_domain(&self, name: &str, timeslice_ns: u64, preempt_grace_ns: u64) -> Result<DomainId> {
        if name.is_empty() || name.len() > DOMAIN_NAME_MAX {
            return Err(SchedError::InvalidArgument);
        }
        let mut index = self.inner.index.lock();
        if index.by_name.contains_key(name) {
            warn!("domain: '{name}' already exists");
            return Err(SchedError::DuplicateName);
        }
        index.by_name.try_reserve(1).map_err(|_| SchedError::OutOfMemory)?;

        // Adds serialize on the index lock; the id is committed only once the
        // runlist sub-domains exist.
        let id = DomainId(self.inner.id_counter.load(Ordering::Relaxed) + 1);
        let runlist_domains = self.alloc_runlist_domains(id, name)?;
        self.inner.id_counter.store(id.0, Ordering::Relaxed);
        let domain = Arc::new(Domain {
            id,
            params: DomainParams { name: name.to_owned(), timeslice_ns, preempt_grace_ns },
            subscheduler: Subscheduler::HostRoundRobin,
            refs: AtomicU32::new(1),
            runlist_domains: Mutex::new(runlist_domains),
        });
        index.by_name.insert(name.to_owned(), id);
        index.by_id.insert(id, domain);
        info!("domain: added {id} '{name}' timeslice={timeslice_ns}ns grace={preempt_grace_ns}ns");
        Ok(id)
    }

    fn alloc_runlist_domains(&self, id: DomainId, name: &str) -> Result<Vec<RunlistDomain>> {
        let count = self.inner.hal.runlist_count();
        let mut subs = Vec::new();
        subs.try_reserve_exact(count as usize).map_err(|_| SchedError::OutOfMemory)?;
        for runlist_id in 0..count {
            match self.inner.hal.alloc_runlist_domain(runlist_id, id, name) {
                Ok(rl) => subs.push(rl),
                Err(err) => {
                    warn!("domain: runlist {runlist_id} sub-domain for {id} failed: {err}");
                    for rl in subs {
                        self.inner.hal.free_runlist_domain(rl);
                    }
                    return Err(err);
                }
            }
        }
        Ok(subs)
    }

    /// Retires an idle domain. `Busy` while referenced or named by a slot.
    pub fn remove_domain(&self, id: DomainId, slots: &DomainSlots) -> Result<()> {
        let mut index = self.inner.index.lock();
        let domain = index.by_id.get(&id).ok_or(SchedError::NotFound)?;
        if slots.references(id) {
            warn!("domain: {id} is resident in a scheduler slot");
            return Err(SchedError::Busy);
        }
        if domain.ref_count() > 1 {
            warn!("domain: {id} still has {} references", domain.ref_count() - 1);
            return Err(SchedError::Busy);
        }
        let domain = index.by_id.remove(&id).ok_or(SchedError::NotFound)?;
        index.by_name.remove(domain.name());
        drop(index);
        info!("domain: removed {id} '{}'", domain.name());
        self.inner.release(&domain);
        Ok(())
    }

    pub fn lookup_by_id(&self, id: DomainId) -> Result<DomainRef> {
        let index = self.inner.index.lock();
        let domain = index.by_id.get(&id).ok_or(SchedError::NotFound)?;
        Ok(DomainRef::acquire(domain, &self.inner))
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<DomainRef> {
        let index = self.inner.index.lock();
        let id = index.by_name.get(name).ok_or(SchedError::NotFound)?;
        let domain = index.by_id.get(id).ok_or(SchedError::NotFound)?;
        Ok(DomainRef::acquire(domain, &self.inner))
    }

    /// Takes an additional reference.
    pub fn domain_get(&self, domain: &DomainRef) -> DomainRef {
        domain.clone()
    }

    /// Drops a reference; the last one destroys an unindexed domain.
    pub fn domain_put(&self, domain: DomainRef) {
        drop(domain);
    }

    pub fn domain_count(&self) -> u32 {
        self.inner.index.lock().by_id.len() as u32
    }

    /// Ids of live domains in ascending order.
    pub fn iter_ids(&self) -> Vec<DomainId> {
        self.inner.index.lock().by_id.keys().copied().collect()
    }

    /// Points the shadow slot at a live domain.
    pub fn set_shadow(&self, slots: &DomainSlots, id: DomainId) -> Result<()> {
        let index = self.inner.index.lock();
        if !index.by_id.contains_key(&id) {
            return Err(SchedError::NotFound);
        }
        slots.store_shadow(Some(id));
        Ok(())
    }

    /// Swaps the active and shadow slots after re-validating the shadow domain.
    ///
    /// Runs under the index lock so a concurrent `remove_domain` never observes
    /// the outgoing domain in neither slot.
    pub fn promote_shadow(&self, slots: &DomainSlots) -> Option<SlotSwap> {
        let index = self.inner.index.lock();
        let next = slots.shadow()?;
        if !index.by_id.contains_key(&next) {
            warn!("domain: shadow {next} vanished; clearing slot");
            slots.store_shadow(None);
            return None;
        }
        let previous = slots.active();
        slots.store_active(Some(next));
        slots.store_shadow(previous);
        Some(SlotSwap { active: next, previous })
    }

    /// Empties the shadow slot if it still names `id`.
    pub fn discard_shadow(&self, slots: &DomainSlots, id: DomainId) -> bool {
        let _index = self.inner.index.lock();
        if slots.shadow() != Some(id) {
            return false;
        }
        slots.store_shadow(None);
        true
    }

    /// Reads `(active, shadow)` as one consistent pair.
    pub fn slot_snapshot(&self, slots: &DomainSlots) -> (Option<DomainId>, Option<DomainId>) {
        let _index = self.inner.index.lock();
        (slots.active(), slots.shadow())
    }

    /// Clears both slots.
    pub fn clear_slots(&self, slots: &DomainSlots) {
        let _index = self.inner.index.lock();
        slots.store_active(None);
        slots.store_shadow(None);
    }

    /// Unindexes every domain for device teardown. Destruction of domains
    /// still held elsewhere is deferred to their last `domain_put`.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<Domain>> = {
            let mut index = self.inner.index.lock();
            index.by_name.clear();
            core::mem::take(&mut index.by_id).into_values().collect()
        };
        let count = drained.len();
        for domain in drained {
            self.inner.release(&domain);
        }
        count
    }

    /// Debug-logs a domain's parameters.
    pub fn print_domain(&self, domain: &Domain) {
        debug!("{domain}");
        for rl in domain.runlist_domains() {
            debug!("  runlist {} handle={:#x}", rl.runlist_id, rl.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HwStatus;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHal {
        live: AtomicUsize,
        fail_on: Mutex<Option<u32>>,
    }

    impl SchedHal for CountingHal {
        fn runlist_count(&self) -> u32 {
            2
        }

        fn alloc_runlist_domain(&self, runlist_id: u32, domain: DomainId, _name: &str) -> Result<RunlistDomain> {
            if *self.fail_on.lock() == Some(runlist_id) {
                return Err(SchedError::OutOfMemory);
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(RunlistDomain { runlist_id, handle: (domain.0 << 8) | u64::from(runlist_id) })
        }

        fn free_runlist_domain(&self, _rl: RunlistDomain) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }

        fn apply_domain(&self, _domain: &Domain) -> Result<()> {
            Ok(())
        }

        fn hw_status(&self) -> HwStatus {
            HwStatus::default()
        }
    }

    #[test]
    fn ids_start_at_one_and_are_unique() {
        let reg = DomainRegistry::new(Arc::new(CountingHal::default()));
        assert_eq!(reg.add_domain("a", 1, 1).unwrap(), DomainId(1));
        assert_eq!(reg.add_domain("b", 1, 1).unwrap(), DomainId(2));
        assert_eq!(reg.iter_ids(), vec![DomainId(1), DomainId(2)]);
    }

    #[test]
    fn name_bounds_enforced() {
        let reg = DomainRegistry::new(Arc::new(CountingHal::default()));
        assert_eq!(reg.add_domain("", 1, 1).unwrap_err(), SchedError::InvalidArgument);
        let long = "x".repeat(DOMAIN_NAME_MAX + 1);
        assert_eq!(reg.add_domain(&long, 1, 1).unwrap_err(), SchedError::InvalidArgument);
        assert!(reg.add_domain(&"y".repeat(DOMAIN_NAME_MAX), 1, 1).is_ok());
    }

    #[test]
    fn failed_subdomain_alloc_unwinds() {
        let hal = Arc::new(CountingHal { live: AtomicUsize::new(0), fail_on: Mutex::new(Some(1)) });
        let reg = DomainRegistry::new(hal.clone());
        assert_eq!(reg.add_domain("a", 1, 1).unwrap_err(), SchedError::OutOfMemory);
        assert_eq!(hal.live.load(Ordering::SeqCst), 0);
        assert_eq!(reg.domain_count(), 0);
    }

    #[test]
    fn failed_add_does_not_consume_an_id() {
        let hal = Arc::new(CountingHal { live: AtomicUsize::new(0), fail_on: Mutex::new(Some(0)) });
        let reg = DomainRegistry::new(hal.clone());
        assert_eq!(reg.add_domain("a", 1, 1).unwrap_err(), SchedError::OutOfMemory);
        assert_eq!(reg.add_domain("a", 1, 1).unwrap_err(), SchedError::OutOfMemory);
        *hal.fail_on.lock() = None;
        assert_eq!(reg.add_domain("a", 1, 1).unwrap(), DomainId(1));
        assert_eq!(reg.add_domain("b", 1, 1).unwrap(), DomainId(2));
    }

    #[test]
    fn drain_defers_destruction_to_last_holder() {
        let hal = Arc::new(CountingHal::default());
        let reg = DomainRegistry::new(hal.clone());
        let id = reg.add_domain("a", 1, 1).unwrap();
        let held = reg.lookup_by_id(id).unwrap();
        assert_eq!(reg.drain(), 1);
        assert_eq!(hal.live.load(Ordering::SeqCst), 2);
        assert_eq!(held.ref_count(), 1);
        reg.domain_put(held);
        assert_eq!(hal.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn promote_swaps_slots() {
        let reg = DomainRegistry::new(Arc::new(CountingHal::default()));
        let slots = DomainSlots::default();
        let a = reg.add_domain("a", 1, 1).unwrap();
        let b = reg.add_domain("b", 1, 1).unwrap();
        reg.set_shadow(&slots, a).unwrap();
        assert_eq!(reg.promote_shadow(&slots), Some(SlotSwap { active: a, previous: None }));
        reg.set_shadow(&slots, b).unwrap();
        assert_eq!(reg.promote_shadow(&slots), Some(SlotSwap { active: b, previous: Some(a) }));
        assert_eq!(slots.active(), Some(b));
        assert_eq!(slots.shadow(), Some(a));
        assert_eq!(reg.remove_domain(a, &slots).unwrap_err(), SchedError::Busy);
        assert_eq!(reg.slot_snapshot(&slots), (Some(b), Some(a)));
    }

    #[test]
    fn discard_shadow_only_clears_the_named_domain() {
        let reg = DomainRegistry::new(Arc::new(CountingHal::default()));
        let slots = DomainSlots::default();
        let a = reg.add_domain("a", 1, 1).unwrap();
        let b = reg.add_domain("b", 1, 1).unwrap();
        reg.set_shadow(&slots, a).unwrap();
        assert!(!reg.discard_shadow(&slots, b));
        assert_eq!(slots.shadow(), Some(a));
        assert!(reg.discard_shadow(&slots, a));
        assert_eq!(reg.slot_snapshot(&slots), (None, None));
        reg.remove_domain(a, &slots).unwrap();
    }
}

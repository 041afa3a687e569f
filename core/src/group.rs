//! Capture groups: membership, access policy, per-group filter, classifier
//! chain and vlan filtering.
//!
//! A group is the unit of traffic selection and load splitting. Consumers
//! join a group with a class mask; frames matching the group's bindings are
//! filtered, classified and fanned out among the members eligible for the
//! resulting class. Hot-path state is read through `Arc` snapshots so the
//! control plane can swap it without stalling producers; old snapshots are
//! reclaimed when the last in-flight reader drops its clone.

use std::array;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;

use crate::classify::ClassifierChain;
use crate::error::{Error, Result};
use crate::filter::FilterProgram;
use crate::stats::{StatCounters, Stats};
use crate::utils::bits;

/// Maximum capture groups.
pub const MAX_GROUPS: usize = 64;

/// Classes per group; consumer class masks are 32 bits wide.
pub const MAX_CLASSES: usize = 32;

/// Access policy, fixed when the first member claims the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Unclaimed; joining with a concrete policy claims the group.
    #[default]
    Undefined,
    /// Only the claiming consumer may be a member.
    Private,
    /// New members need the owner's admission.
    Restricted,
    /// Anyone may join.
    Shared,
}

/// Per-vlan-id membership bitmap: ids 1..=4094 plus slot 0 for untagged
/// traffic.
struct VlanSet {
    words: [AtomicU64; 64],
}

impl VlanSet {
    fn new() -> Self {
        VlanSet {
            words: array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn contains(&self, vid: u16) -> bool {
        let vid = vid as usize & 0xfff;
        self.words[vid / 64].load(Ordering::Relaxed) & (1 << (vid % 64)) != 0
    }

    fn set(&self, vid: u16, on: bool) {
        let vid = vid as usize & 0xfff;
        let bit = 1u64 << (vid % 64);
        if on {
            self.words[vid / 64].fetch_or(bit, Ordering::Relaxed);
        } else {
            self.words[vid / 64].fetch_and(!bit, Ordering::Relaxed);
        }
    }

    fn clear(&self) {
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }
}

struct Membership {
    policy: GroupPolicy,
    owner: Option<usize>,
    members: u64,
}

pub(crate) struct Group {
    /// Per-class consumer bitmaps, indexed by class number.
    sock_mask: [AtomicU64; MAX_CLASSES],
    filter: RwLock<Option<Arc<dyn FilterProgram>>>,
    chain: RwLock<Arc<ClassifierChain>>,
    vlan_enabled: AtomicBool,
    vlan: VlanSet,
    pub(crate) stats: StatCounters,
    membership: Mutex<Membership>,
}

impl Group {
    fn new() -> Self {
        Group {
            sock_mask: array::from_fn(|_| AtomicU64::new(0)),
            filter: RwLock::new(None),
            chain: RwLock::new(ClassifierChain::empty()),
            vlan_enabled: AtomicBool::new(false),
            vlan: VlanSet::new(),
            stats: StatCounters::new(),
            membership: Mutex::new(Membership {
                policy: GroupPolicy::Undefined,
                owner: None,
                members: 0,
            }),
        }
    }

    #[inline]
    pub(crate) fn snapshot_filter(&self) -> Option<Arc<dyn FilterProgram>> {
        self.filter.read().unwrap().clone()
    }

    #[inline]
    pub(crate) fn snapshot_chain(&self) -> Arc<ClassifierChain> {
        self.chain.read().unwrap().clone()
    }

    #[inline]
    pub(crate) fn vlan_filter_enabled(&self) -> bool {
        self.vlan_enabled.load(Ordering::Relaxed)
    }

    /// Vlan admission for a frame; `vid` 0 means untagged.
    #[inline]
    pub(crate) fn vlan_pass(&self, vid: u16) -> bool {
        self.vlan.contains(vid)
    }

    /// Consumers bound to the given class.
    #[inline]
    pub(crate) fn class_consumers(&self, class: usize) -> u64 {
        self.sock_mask[class & (MAX_CLASSES - 1)].load(Ordering::Relaxed)
    }

    /// Union of the consumer bitmaps of every class named in `class_mask`.
    pub(crate) fn eligible(&self, class_mask: u32) -> u64 {
        let mut out = 0u64;
        for class in bits(class_mask as u64) {
            out |= self.sock_mask[class].load(Ordering::Relaxed);
        }
        out
    }
}

/// The fixed table of capture groups.
pub(crate) struct GroupTable {
    groups: Vec<Group>,
}

impl GroupTable {
    pub(crate) fn new() -> Self {
        GroupTable {
            groups: (0..MAX_GROUPS).map(|_| Group::new()).collect(),
        }
    }

    pub(crate) fn get(&self, gid: usize) -> Result<&Group> {
        self.groups.get(gid).ok_or(Error::InvalidGroup(gid))
    }

    /// Joins `consumer` to a group with the given class mask, claiming the
    /// group if it is still unclaimed. With `gid` unset, the first group
    /// that can be claimed or joined under `policy` is picked.
    pub(crate) fn join(
        &self,
        gid: Option<usize>,
        consumer: usize,
        class_mask: u32,
        policy: GroupPolicy,
    ) -> Result<usize> {
        if class_mask == 0 {
            return Err(Error::InvalidClassMask);
        }
        if policy == GroupPolicy::Undefined {
            return Err(Error::InvalidConfig(
                "cannot join with the undefined policy".to_owned(),
            ));
        }
        match gid {
            Some(gid) => {
                self.join_one(gid, consumer, class_mask, policy)?;
                Ok(gid)
            }
            None => {
                // automatic selection claims a fresh group, never an
                // existing one
                for gid in 0..MAX_GROUPS {
                    if self.groups[gid].membership.lock().unwrap().policy
                        != GroupPolicy::Undefined
                    {
                        continue;
                    }
                    if self.join_one(gid, consumer, class_mask, policy).is_ok() {
                        return Ok(gid);
                    }
                }
                Err(Error::GroupsExhausted)
            }
        }
    }

    fn join_one(
        &self,
        gid: usize,
        consumer: usize,
        class_mask: u32,
        policy: GroupPolicy,
    ) -> Result<()> {
        let group = self.get(gid)?;
        let mut m = group.membership.lock().unwrap();
        match m.policy {
            GroupPolicy::Undefined => {
                m.policy = policy;
                m.owner = Some(consumer);
                log::debug!("group {gid} claimed by consumer {consumer} ({policy:?})");
            }
            GroupPolicy::Private => {
                if m.owner != Some(consumer) {
                    return Err(Error::PermissionDenied(gid));
                }
            }
            current @ (GroupPolicy::Restricted | GroupPolicy::Shared) => {
                if policy != current {
                    return Err(Error::PermissionDenied(gid));
                }
                if current == GroupPolicy::Restricted
                    && m.owner != Some(consumer)
                    && m.members & (1 << consumer) == 0
                {
                    return Err(Error::PermissionDenied(gid));
                }
            }
        }
        m.members |= 1 << consumer;
        drop(m);
        let bit = 1u64 << consumer;
        for class in bits(class_mask as u64) {
            group.sock_mask[class].fetch_or(bit, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Removes `consumer` from the group. Returns true when the group was
    /// destroyed (last member left); statistics survive destruction.
    pub(crate) fn leave(&self, gid: usize, consumer: usize) -> Result<bool> {
        let group = self.get(gid)?;
        let mut m = group.membership.lock().unwrap();
        if m.members & (1 << consumer) == 0 {
            return Err(Error::NotMember(gid));
        }
        m.members &= !(1 << consumer);
        let bit = !(1u64 << consumer);
        for class in &group.sock_mask {
            class.fetch_and(bit, Ordering::Relaxed);
        }
        if m.members != 0 {
            return Ok(false);
        }
        m.policy = GroupPolicy::Undefined;
        m.owner = None;
        drop(m);
        *group.filter.write().unwrap() = None;
        *group.chain.write().unwrap() = ClassifierChain::empty();
        group.vlan_enabled.store(false, Ordering::Relaxed);
        group.vlan.clear();
        log::debug!("group {gid} destroyed");
        Ok(true)
    }

    /// Drops `consumer` from every group it belongs to; returns the mask of
    /// groups destroyed by its departure.
    pub(crate) fn leave_all(&self, consumer: usize) -> u64 {
        let mut destroyed = 0u64;
        for gid in 0..MAX_GROUPS {
            if self.is_member(gid, consumer) {
                if let Ok(true) = self.leave(gid, consumer) {
                    destroyed |= 1 << gid;
                }
            }
        }
        destroyed
    }

    pub(crate) fn is_member(&self, gid: usize, consumer: usize) -> bool {
        match self.groups.get(gid) {
            Some(g) => g.membership.lock().unwrap().members & (1 << consumer) != 0,
            None => false,
        }
    }

    /// Whether `consumer` may inspect the group (statistics reads). Shared
    /// and unclaimed groups are open to everyone.
    pub(crate) fn can_access(&self, gid: usize, consumer: usize) -> Result<bool> {
        let group = self.get(gid)?;
        let m = group.membership.lock().unwrap();
        Ok(match m.policy {
            GroupPolicy::Undefined | GroupPolicy::Shared => true,
            _ => m.owner == Some(consumer) || m.members & (1 << consumer) != 0,
        })
    }

    pub(crate) fn set_filter(&self, gid: usize, filter: Option<Arc<dyn FilterProgram>>) -> Result<()> {
        *self.get(gid)?.filter.write().unwrap() = filter;
        Ok(())
    }

    /// Replaces one chain level, building a fresh chain snapshot.
    pub(crate) fn set_stage(
        &self,
        gid: usize,
        level: usize,
        stage: Option<Arc<dyn crate::classify::ClassifierStage>>,
    ) -> Result<()> {
        let group = self.get(gid)?;
        let mut chain = group.chain.write().unwrap();
        *chain = chain.with_stage(level, stage)?;
        Ok(())
    }

    pub(crate) fn reset_chain(&self, gid: usize) -> Result<()> {
        *self.get(gid)?.chain.write().unwrap() = ClassifierChain::empty();
        Ok(())
    }

    pub(crate) fn set_vlan_filter_enabled(&self, gid: usize, enabled: bool) -> Result<()> {
        let group = self.get(gid)?;
        group.vlan_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            group.vlan.clear();
        }
        Ok(())
    }

    /// Admits or evicts a vlan id. `vid` 0 is untagged traffic, -1 selects
    /// every tagged id at once.
    pub(crate) fn set_vlan_filter(&self, gid: usize, vid: i32, on: bool) -> Result<()> {
        let group = self.get(gid)?;
        if !group.vlan_filter_enabled() {
            return Err(Error::VlanFiltersDisabled(gid));
        }
        match vid {
            -1 => {
                for v in 1..=4094u16 {
                    group.vlan.set(v, on);
                }
            }
            0..=4094 => group.vlan.set(vid as u16, on),
            _ => return Err(Error::InvalidVlanId(vid)),
        }
        Ok(())
    }

    pub(crate) fn stats(&self, gid: usize) -> Result<Stats> {
        Ok(self.get(gid)?.stats.read())
    }
}

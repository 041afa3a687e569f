//! The capture engine: consumer registry, group wiring and the control
//! surface behind [`ConsumerHandle`].

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::classify::{StageBuilder, StageFactory};
use crate::config::EngineConfig;
use crate::devmap::{DeviceMap, MapUpdate};
use crate::dispatch::LocalContext;
use crate::error::{Error, Result};
use crate::filter::FilterProgram;
use crate::frame::Frame;
use crate::group::{GroupPolicy, GroupTable};
use crate::ring::{CapturedBatch, SlotRing};
use crate::stats::{StatCounters, Stats};
use crate::utils::bits;

/// Maximum concurrently registered consumers.
pub const MAX_CONSUMERS: usize = 64;

struct ConsumerSettings {
    caplen: usize,
    slots: usize,
    offset: usize,
}

pub(crate) struct Consumer {
    id: usize,
    settings: Mutex<ConsumerSettings>,
    /// Shared with the ring so a timestamping toggle applies immediately.
    tstamp: Arc<AtomicBool>,
    ring: RwLock<Option<Arc<SlotRing>>>,
    pub(crate) stats: StatCounters,
}

impl Consumer {
    #[inline]
    pub(crate) fn ring(&self) -> Option<Arc<SlotRing>> {
        self.ring.read().unwrap().clone()
    }
}

/// The engine proper. Shared between the receive contexts feeding frames in
/// and the consumer handles reading them out.
pub struct Engine {
    pub(crate) config: EngineConfig,
    consumers: Vec<RwLock<Option<Arc<Consumer>>>>,
    pub(crate) groups: GroupTable,
    pub(crate) devmap: DeviceMap,
    factory: StageFactory,
    /// Count of consumers with timestamping on; frames are stamped at
    /// ingress only while it is positive.
    tstamp_toggle: AtomicI32,
    pub(crate) kernel_tx: Option<Box<dyn Fn(Frame) + Send + Sync>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::build(config, None)
    }

    /// Like [`Engine::new`], with a callback receiving the direct-captured
    /// frames that classification routed back to the network stack.
    pub fn with_kernel_forward(
        config: EngineConfig,
        forward: impl Fn(Frame) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        Self::build(config, Some(Box::new(forward)))
    }

    fn build(
        config: EngineConfig,
        kernel_tx: Option<Box<dyn Fn(Frame) + Send + Sync>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        log::info!(
            "engine up: caplen {}, queue_slots {}, prefetch {}",
            config.caplen,
            config.queue_slots,
            config.prefetch_len
        );
        Ok(Arc::new(Engine {
            config,
            consumers: (0..MAX_CONSUMERS).map(|_| RwLock::new(None)).collect(),
            groups: GroupTable::new(),
            devmap: DeviceMap::new(),
            factory: StageFactory::with_builtins(),
            tstamp_toggle: AtomicI32::new(0),
            kernel_tx,
        }))
    }

    /// A receive context for one producer CPU.
    pub fn local(&self, cpu: usize) -> LocalContext {
        LocalContext::new(cpu, self.config.prefetch_len)
    }

    /// Whether a driver should divert frames from this interface straight
    /// into the engine.
    pub fn direct_capture(&self, if_index: u32) -> bool {
        self.config.direct_capture && self.devmap.monitored(if_index)
    }

    /// Registers a named classifier stage builder alongside the builtins.
    pub fn register_classifier(&self, name: &str, builder: StageBuilder) {
        self.factory.register(name, builder);
    }

    #[inline]
    pub(crate) fn tstamp_enabled(&self) -> bool {
        self.tstamp_toggle.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn consumer(&self, id: usize) -> Result<Arc<Consumer>> {
        self.consumers
            .get(id)
            .and_then(|slot| slot.read().unwrap().clone())
            .ok_or(Error::UnknownConsumer(id))
    }

    /// Claims a free consumer id and hands back its handle. The consumer is
    /// registered but not enabled; no queue exists yet.
    pub fn create_consumer(self: &Arc<Self>) -> Result<ConsumerHandle> {
        for (id, slot) in self.consumers.iter().enumerate() {
            let mut slot = slot.write().unwrap();
            if slot.is_none() {
                *slot = Some(Arc::new(Consumer {
                    id,
                    settings: Mutex::new(ConsumerSettings {
                        caplen: self.config.caplen,
                        slots: self.config.queue_slots,
                        offset: 0,
                    }),
                    tstamp: Arc::new(AtomicBool::new(false)),
                    ring: RwLock::new(None),
                    stats: StatCounters::new(),
                }));
                log::info!("[pq|{id}] consumer created");
                return Ok(ConsumerHandle {
                    engine: self.clone(),
                    id,
                });
            }
        }
        Err(Error::ConsumerExhausted)
    }

    fn release_consumer(&self, id: usize) {
        let consumer = match self.consumers.get(id) {
            Some(slot) => slot.write().unwrap().take(),
            None => None,
        };
        let consumer = match consumer {
            Some(c) => c,
            None => return,
        };
        if consumer.tstamp.swap(false, Ordering::AcqRel) {
            self.tstamp_toggle.fetch_sub(1, Ordering::AcqRel);
        }
        *consumer.ring.write().unwrap() = None;
        for gid in bits(self.groups.leave_all(id)) {
            self.devmap.clear_group(gid);
        }
        log::info!("[pq|{id}] consumer released");
    }

    pub(crate) fn enable(&self, id: usize) -> Result<()> {
        let consumer = self.consumer(id)?;
        let mut ring = consumer.ring.write().unwrap();
        if ring.is_some() {
            return Ok(());
        }
        let s = consumer.settings.lock().unwrap();
        *ring = Some(SlotRing::new(
            s.slots,
            s.caplen,
            s.offset,
            self.config.timestamp_format,
            consumer.tstamp.clone(),
        )?);
        log::debug!("[pq|{id}] enabled: {} slots, caplen {}", s.slots, s.caplen);
        Ok(())
    }

    pub(crate) fn disable(&self, id: usize) -> Result<()> {
        *self.consumer(id)?.ring.write().unwrap() = None;
        Ok(())
    }

    fn reconfigure<F>(&self, id: usize, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ConsumerSettings),
    {
        let consumer = self.consumer(id)?;
        if consumer.ring.read().unwrap().is_some() {
            return Err(Error::InvalidConfig(format!(
                "consumer {id} must be disabled to change queue settings"
            )));
        }
        apply(&mut *consumer.settings.lock().unwrap());
        Ok(())
    }

    pub(crate) fn set_caplen(&self, id: usize, caplen: usize) -> Result<()> {
        if caplen == 0 || caplen > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!("caplen {caplen} out of range")));
        }
        self.reconfigure(id, |s| s.caplen = caplen)
    }

    pub(crate) fn set_slots(&self, id: usize, slots: usize) -> Result<()> {
        if slots == 0 || slots > crate::ring::MAX_RING_SLOTS {
            return Err(Error::InvalidConfig(format!("slots {slots} out of range")));
        }
        self.reconfigure(id, |s| s.slots = slots)
    }

    pub(crate) fn set_offset(&self, id: usize, offset: usize) -> Result<()> {
        if offset > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!("offset {offset} out of range")));
        }
        self.reconfigure(id, |s| s.offset = offset)
    }

    pub(crate) fn set_tstamp(&self, id: usize, on: bool) -> Result<()> {
        let consumer = self.consumer(id)?;
        let prev = consumer.tstamp.swap(on, Ordering::AcqRel);
        if prev != on {
            let delta = if on { 1 } else { -1 };
            self.tstamp_toggle.fetch_add(delta, Ordering::AcqRel);
        }
        Ok(())
    }

    pub(crate) fn join_group(
        &self,
        id: usize,
        gid: Option<usize>,
        class_mask: u32,
        policy: GroupPolicy,
    ) -> Result<usize> {
        self.consumer(id)?;
        self.groups.join(gid, id, class_mask, policy)
    }

    pub(crate) fn leave_group(&self, id: usize, gid: usize) -> Result<()> {
        if self.groups.leave(gid, id)? {
            self.devmap.clear_group(gid);
        }
        Ok(())
    }

    fn member_of(&self, id: usize, gid: usize) -> Result<()> {
        self.groups.get(gid)?;
        if !self.groups.is_member(gid, id) {
            return Err(Error::NotMember(gid));
        }
        Ok(())
    }

    pub(crate) fn bind(
        &self,
        id: usize,
        gid: usize,
        if_index: Option<u32>,
        hw_queue: Option<u8>,
    ) -> Result<()> {
        self.member_of(id, gid)?;
        self.devmap.update(MapUpdate::Set, if_index, hw_queue, gid);
        Ok(())
    }

    pub(crate) fn unbind(
        &self,
        id: usize,
        gid: usize,
        if_index: Option<u32>,
        hw_queue: Option<u8>,
    ) -> Result<()> {
        self.member_of(id, gid)?;
        self.devmap.update(MapUpdate::Reset, if_index, hw_queue, gid);
        Ok(())
    }

    pub(crate) fn set_classifier(
        &self,
        id: usize,
        gid: usize,
        level: usize,
        name: &str,
        context: Option<&[u8]>,
    ) -> Result<()> {
        self.member_of(id, gid)?;
        let stage = self.factory.build(name, context)?;
        self.groups.set_stage(gid, level, Some(stage))
    }

    pub(crate) fn reset_group(&self, id: usize, gid: usize) -> Result<()> {
        self.member_of(id, gid)?;
        self.groups.reset_chain(gid)?;
        self.groups.set_filter(gid, None)
    }

    pub(crate) fn set_filter(
        &self,
        id: usize,
        gid: usize,
        filter: Option<Arc<dyn FilterProgram>>,
    ) -> Result<()> {
        self.member_of(id, gid)?;
        self.groups.set_filter(gid, filter)
    }

    pub(crate) fn set_vlan_filter_enabled(
        &self,
        id: usize,
        gid: usize,
        enabled: bool,
    ) -> Result<()> {
        self.member_of(id, gid)?;
        self.groups.set_vlan_filter_enabled(gid, enabled)
    }

    pub(crate) fn set_vlan_filter(
        &self,
        id: usize,
        gid: usize,
        vid: i32,
        on: bool,
    ) -> Result<()> {
        self.member_of(id, gid)?;
        self.groups.set_vlan_filter(gid, vid, on)
    }

    pub(crate) fn stats(&self, id: usize) -> Result<Stats> {
        Ok(self.consumer(id)?.stats.read())
    }

    pub(crate) fn group_stats(&self, id: usize, gid: usize) -> Result<Stats> {
        if !self.groups.can_access(gid, id)? {
            return Err(Error::PermissionDenied(gid));
        }
        self.groups.stats(gid)
    }

    pub(crate) fn groups_of(&self, id: usize) -> u64 {
        let mut mask = 0u64;
        for gid in 0..crate::group::MAX_GROUPS {
            if self.groups.is_member(gid, id) {
                mask |= 1 << gid;
            }
        }
        mask
    }
}

/// Owned view of one registered consumer. Dropping the handle releases the
/// id, destroys the queue and leaves every joined group.
pub struct ConsumerHandle {
    engine: Arc<Engine>,
    id: usize,
}

impl ConsumerHandle {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Allocates the slot queue and starts accepting frames.
    pub fn enable(&self) -> Result<()> {
        self.engine.enable(self.id)
    }

    /// Destroys the queue; pending frames are discarded. Group membership
    /// is untouched.
    pub fn disable(&self) -> Result<()> {
        self.engine.disable(self.id)
    }

    pub fn set_caplen(&self, caplen: usize) -> Result<()> {
        self.engine.set_caplen(self.id, caplen)
    }

    pub fn set_slots(&self, slots: usize) -> Result<()> {
        self.engine.set_slots(self.id, slots)
    }

    pub fn set_offset(&self, offset: usize) -> Result<()> {
        self.engine.set_offset(self.id, offset)
    }

    pub fn set_timestamping(&self, on: bool) -> Result<()> {
        self.engine.set_tstamp(self.id, on)
    }

    pub fn join_group(
        &self,
        gid: Option<usize>,
        class_mask: u32,
        policy: GroupPolicy,
    ) -> Result<usize> {
        self.engine.join_group(self.id, gid, class_mask, policy)
    }

    pub fn leave_group(&self, gid: usize) -> Result<()> {
        self.engine.leave_group(self.id, gid)
    }

    pub fn bind(&self, gid: usize, if_index: Option<u32>, hw_queue: Option<u8>) -> Result<()> {
        self.engine.bind(self.id, gid, if_index, hw_queue)
    }

    pub fn unbind(&self, gid: usize, if_index: Option<u32>, hw_queue: Option<u8>) -> Result<()> {
        self.engine.unbind(self.id, gid, if_index, hw_queue)
    }

    pub fn set_classifier(
        &self,
        gid: usize,
        level: usize,
        name: &str,
        context: Option<&[u8]>,
    ) -> Result<()> {
        self.engine.set_classifier(self.id, gid, level, name, context)
    }

    pub fn reset_group(&self, gid: usize) -> Result<()> {
        self.engine.reset_group(self.id, gid)
    }

    pub fn set_filter(&self, gid: usize, filter: Option<Arc<dyn FilterProgram>>) -> Result<()> {
        self.engine.set_filter(self.id, gid, filter)
    }

    pub fn set_vlan_filter_enabled(&self, gid: usize, enabled: bool) -> Result<()> {
        self.engine.set_vlan_filter_enabled(self.id, gid, enabled)
    }

    pub fn set_vlan_filter(&self, gid: usize, vid: i32, on: bool) -> Result<()> {
        self.engine.set_vlan_filter(self.id, gid, vid, on)
    }

    pub fn stats(&self) -> Result<Stats> {
        self.engine.stats(self.id)
    }

    pub fn group_stats(&self, gid: usize) -> Result<Stats> {
        self.engine.group_stats(self.id, gid)
    }

    pub fn groups(&self) -> u64 {
        self.engine.groups_of(self.id)
    }

    /// Takes the current queue epoch, parking up to `timeout` first when it
    /// is empty. The returned batch may still be empty on timeout.
    pub fn read(&mut self, timeout: Duration) -> Result<CapturedBatch<'_>> {
        let ring = self
            .engine
            .consumer(self.id)?
            .ring()
            .ok_or(Error::NotEnabled(self.id))?;
        if ring.pending() == 0 {
            ring.wait(timeout);
        }
        Ok(CapturedBatch::take(ring))
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.engine.release_consumer(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::CLASS_DEFAULT;

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig {
            queue_slots: 8,
            caplen: 64,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn consumer_ids_are_reused_after_drop() {
        let e = engine();
        let a = e.create_consumer().unwrap();
        let b = e.create_consumer().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        drop(a);
        let c = e.create_consumer().unwrap();
        assert_eq!(c.id(), 0);
    }

    #[test]
    fn read_requires_an_enabled_queue() {
        let e = engine();
        let mut c = e.create_consumer().unwrap();
        assert!(matches!(
            c.read(Duration::from_millis(1)),
            Err(Error::NotEnabled(0))
        ));
        c.enable().unwrap();
        assert!(c.read(Duration::from_millis(1)).unwrap().is_empty());
    }

    #[test]
    fn queue_settings_are_frozen_while_enabled() {
        let e = engine();
        let c = e.create_consumer().unwrap();
        c.set_slots(4).unwrap();
        c.enable().unwrap();
        assert!(c.set_slots(16).is_err());
        assert!(c.set_caplen(128).is_err());
        c.disable().unwrap();
        c.set_caplen(128).unwrap();
    }

    #[test]
    fn timestamp_toggle_counts_consumers() {
        let e = engine();
        let a = e.create_consumer().unwrap();
        let b = e.create_consumer().unwrap();
        assert!(!e.tstamp_enabled());
        a.set_timestamping(true).unwrap();
        b.set_timestamping(true).unwrap();
        assert!(e.tstamp_enabled());
        a.set_timestamping(false).unwrap();
        assert!(e.tstamp_enabled());
        // repeated disables do not drive the toggle negative
        a.set_timestamping(false).unwrap();
        drop(b);
        assert!(!e.tstamp_enabled());
    }

    #[test]
    fn dropping_a_handle_cleans_its_groups_and_bindings() {
        let e = engine();
        let c = e.create_consumer().unwrap();
        let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Private).unwrap();
        c.bind(gid, Some(1), None).unwrap();
        assert_ne!(e.devmap.groups(1, 0), 0);
        drop(c);
        assert_eq!(e.devmap.groups(1, 0), 0);
        assert!(!e.groups.is_member(gid, 0));
    }

    #[test]
    fn binding_requires_membership() {
        let e = engine();
        let a = e.create_consumer().unwrap();
        let b = e.create_consumer().unwrap();
        let gid = a.join_group(None, CLASS_DEFAULT, GroupPolicy::Private).unwrap();
        assert!(matches!(b.bind(gid, Some(1), None), Err(Error::NotMember(_))));
    }

    #[test]
    fn group_stats_respect_policy() {
        let e = engine();
        let a = e.create_consumer().unwrap();
        let b = e.create_consumer().unwrap();
        let gid = a.join_group(None, CLASS_DEFAULT, GroupPolicy::Private).unwrap();
        assert!(a.group_stats(gid).is_ok());
        assert!(matches!(b.group_stats(gid), Err(Error::PermissionDenied(_))));
    }

    #[test]
    fn direct_capture_tracks_bindings() {
        let e = Engine::new(EngineConfig {
            direct_capture: true,
            queue_slots: 8,
            ..Default::default()
        })
        .unwrap();
        assert!(!e.direct_capture(3));
        let c = e.create_consumer().unwrap();
        let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Private).unwrap();
        c.bind(gid, Some(3), None).unwrap();
        assert!(e.direct_capture(3));
    }
}

//! End-to-end pipeline tests: producer contexts in, consumer queues out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use packetq_core::classify::{Action, ClassifierStage, Scratch, CLASS_DEFAULT};
use packetq_core::config::EngineConfig;
use packetq_core::frame::{Frame, VlanTag};
use packetq_core::group::GroupPolicy;
use packetq_core::Engine;

const DEV: u32 = 3;

fn engine(config: EngineConfig) -> Arc<Engine> {
    Engine::new(config).unwrap()
}

fn frame(byte: u8) -> Frame {
    Frame::new(DEV, 0, vec![byte; 16])
}

#[test]
fn frames_reach_a_bound_consumer() {
    let e = engine(EngineConfig {
        prefetch_len: 4,
        ..Default::default()
    });
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();

    let mut rx = e.local(0);
    for i in 0..3u8 {
        assert!(e.receive(&mut rx, frame(i)));
    }
    e.flush(&mut rx);

    let batch = c.read(Duration::from_millis(10)).unwrap();
    assert_eq!(batch.len(), 3);
    for (i, slot) in batch.iter().enumerate() {
        assert_eq!(slot.payload, &[i as u8; 16][..]);
        assert_eq!(slot.header.if_index, DEV);
        assert_eq!(slot.header.group_id, gid as u32);
        assert_eq!(slot.header.wire_len, 16);
    }
    drop(batch);

    let stats = c.stats().unwrap();
    assert_eq!((stats.recv, stats.lost, stats.drop), (3, 0, 0));
    let gstats = c.group_stats(gid).unwrap();
    assert_eq!((gstats.recv, gstats.drop), (3, 0));
}

#[test]
fn frames_for_unbound_devices_go_nowhere() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, Frame::new(DEV + 1, 0, vec![0; 16]));
    e.flush(&mut rx);

    assert!(c.read(Duration::from_millis(5)).unwrap().is_empty());
    assert_eq!(c.stats().unwrap().recv, 0);
    assert_eq!(c.group_stats(gid).unwrap().recv, 0);
}

#[test]
fn queue_overflow_is_counted_as_lost() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(2).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();

    let mut rx = e.local(0);
    for i in 0..5u8 {
        e.receive(&mut rx, frame(i));
    }
    e.flush(&mut rx);

    let stats = c.stats().unwrap();
    assert_eq!((stats.recv, stats.lost), (2, 3));
    // the group saw every frame; loss is a consumer-side condition
    assert_eq!(c.group_stats(gid).unwrap().recv, 5);
    assert_eq!(c.read(Duration::from_millis(5)).unwrap().len(), 2);
}

#[test]
fn flow_control_discards_at_ingress_after_overflow() {
    let e = engine(EngineConfig {
        flow_control: 3,
        ..Default::default()
    });
    let c = e.create_consumer().unwrap();
    c.set_slots(1).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();

    let mut rx = e.local(0);
    assert!(e.receive(&mut rx, frame(0)));
    // second frame overflows the one-slot queue and arms the valve
    assert!(e.receive(&mut rx, frame(1)));
    for i in 2..5u8 {
        assert!(!e.receive(&mut rx, frame(i)));
    }
    // valve exhausted, frames flow again
    assert!(e.receive(&mut rx, frame(5)));
}

#[test]
fn drop_stage_discards_and_counts() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();
    c.set_classifier(gid, 0, "drop", None).unwrap();

    let mut rx = e.local(0);
    for i in 0..4u8 {
        e.receive(&mut rx, frame(i));
    }
    e.flush(&mut rx);

    assert!(c.read(Duration::from_millis(5)).unwrap().is_empty());
    assert_eq!(c.stats().unwrap().recv, 0);
    let gstats = c.group_stats(gid).unwrap();
    assert_eq!((gstats.recv, gstats.drop), (4, 4));
}

#[test]
fn stolen_frames_vanish_without_drop_accounting() {
    let counter = Arc::new(AtomicUsize::new(0));
    let forwarded = counter.clone();
    let e = Engine::with_kernel_forward(EngineConfig::default(), move |_| {
        forwarded.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();
    c.set_classifier(gid, 0, "steal", None).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, frame(0).with_direct());
    e.flush(&mut rx);

    assert!(c.read(Duration::from_millis(5)).unwrap().is_empty());
    let gstats = c.group_stats(gid).unwrap();
    assert_eq!((gstats.recv, gstats.drop), (1, 0));
    // stolen frames never reach the stack either
    assert_eq!(counter.load(Ordering::Relaxed), 0);
}

#[test]
fn to_kernel_forwards_only_direct_frames() {
    let counter = Arc::new(AtomicUsize::new(0));
    let forwarded = counter.clone();
    let e = Engine::with_kernel_forward(EngineConfig::default(), move |_| {
        forwarded.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();
    c.set_classifier(gid, 0, "to-kernel", None).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, frame(0).with_direct());
    e.receive(&mut rx, frame(1));
    e.flush(&mut rx);

    // both frames were also delivered normally
    assert_eq!(c.read(Duration::from_millis(5)).unwrap().len(), 2);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

struct FirstByte;

impl ClassifierStage for FirstByte {
    fn name(&self) -> &str {
        "first-byte"
    }

    fn apply(&self, frame: &Frame, _prev: Action, _scratch: &mut Scratch) -> Action {
        Action::steer(CLASS_DEFAULT, frame.payload()[0] as u32)
    }
}

fn build_first_byte(_ctx: Option<&[u8]>) -> anyhow::Result<Arc<dyn ClassifierStage>> {
    Ok(Arc::new(FirstByte))
}

#[test]
fn steering_splits_load_deterministically() {
    let e = engine(EngineConfig {
        prefetch_len: 64,
        ..Default::default()
    });
    e.register_classifier("first-byte", build_first_byte);

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let c = e.create_consumer().unwrap();
        c.set_slots(64).unwrap();
        c.enable().unwrap();
        c.join_group(Some(0), CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
        consumers.push(c);
    }
    consumers[0].bind(0, Some(DEV), None).unwrap();
    consumers[0].set_classifier(0, 0, "first-byte", None).unwrap();

    for round in 0..2u64 {
        let mut rx = e.local(0);
        for i in 0..100u8 {
            e.receive(&mut rx, frame(i));
        }
        e.flush(&mut rx);

        // the hash is the first payload byte, so the split is exact
        for (n, c) in consumers.iter_mut().enumerate() {
            assert_eq!(
                c.stats().unwrap().recv,
                25 * (round + 1),
                "consumer {n}, round {round}"
            );
            let batch = c.read(Duration::from_millis(5)).unwrap();
            assert_eq!(batch.len(), 25);
            // every frame this consumer got folds to its own index
            for slot in batch.iter() {
                assert_eq!(slot.payload[0] as usize % 4, n);
            }
        }
    }
}

#[test]
fn broadcast_reaches_every_member() {
    let e = engine(EngineConfig::default());
    let mut a = e.create_consumer().unwrap();
    let mut b = e.create_consumer().unwrap();
    for c in [&a, &b] {
        c.set_slots(8).unwrap();
        c.enable().unwrap();
        c.join_group(Some(0), CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    }
    a.bind(0, Some(DEV), None).unwrap();
    a.set_classifier(0, 0, "broadcast", None).unwrap();

    let mut rx = e.local(0);
    for i in 0..3u8 {
        e.receive(&mut rx, frame(i));
    }
    e.flush(&mut rx);

    assert_eq!(a.read(Duration::from_millis(5)).unwrap().len(), 3);
    assert_eq!(b.read(Duration::from_millis(5)).unwrap().len(), 3);
    assert_eq!(e.local(1).cpu(), 1);
}

#[test]
fn counters_conserve_frames() {
    let e = engine(EngineConfig {
        prefetch_len: 32,
        ..Default::default()
    });
    let a = e.create_consumer().unwrap();
    let b = e.create_consumer().unwrap();
    for c in [&a, &b] {
        // tiny queues so some frames are lost
        c.set_slots(4).unwrap();
        c.enable().unwrap();
        c.join_group(Some(0), CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    }
    a.bind(0, Some(DEV), None).unwrap();
    a.set_classifier(0, 0, "steer-rss", None).unwrap();

    let total = 50u8;
    let mut rx = e.local(0);
    for i in 0..total {
        e.receive(&mut rx, Frame::new(DEV, 0, vec![i, i ^ 0x5a, 7, i]));
    }
    e.flush(&mut rx);

    let ga = a.group_stats(0).unwrap();
    assert_eq!(ga.recv, total as u64);
    let sa = a.stats().unwrap();
    let sb = b.stats().unwrap();
    // steering picks exactly one consumer per frame
    assert_eq!(sa.recv + sa.lost + sb.recv + sb.lost + ga.drop, total as u64);
    assert!(sa.lost + sb.lost > 0);
}

#[test]
fn vlan_filter_admits_configured_ids() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();
    c.set_vlan_filter_enabled(gid, true).unwrap();
    c.set_vlan_filter(gid, 100, true).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, frame(0).with_vlan(VlanTag::new(100, 0)));
    e.receive(&mut rx, frame(1).with_vlan(VlanTag::new(200, 0)));
    e.receive(&mut rx, frame(2));
    e.flush(&mut rx);

    let batch = c.read(Duration::from_millis(5)).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.slot(0).header.vlan_tci, VlanTag::new(100, 0).tci());
    drop(batch);
    assert_eq!(c.group_stats(gid).unwrap().drop, 2);

    // vid 0 admits untagged traffic
    c.set_vlan_filter(gid, 0, true).unwrap();
    e.receive(&mut rx, frame(3));
    e.flush(&mut rx);
    assert_eq!(c.read(Duration::from_millis(5)).unwrap().len(), 1);
}

#[test]
fn payload_filter_gates_delivery() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();
    let filter = packetq_core::filter::RegexSetFilter::new(["^GET /"]).unwrap();
    c.set_filter(gid, Some(Arc::new(filter))).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, Frame::new(DEV, 0, b"GET /index HTTP/1.1".to_vec()));
    e.receive(&mut rx, Frame::new(DEV, 0, b"POST /form HTTP/1.1".to_vec()));
    e.flush(&mut rx);

    let batch = c.read(Duration::from_millis(5)).unwrap();
    assert_eq!(batch.len(), 1);
    assert!(batch.slot(0).payload.starts_with(b"GET /"));
    drop(batch);
    let gstats = c.group_stats(gid).unwrap();
    assert_eq!((gstats.recv, gstats.drop), (2, 1));
}

#[test]
fn timestamping_follows_the_consumer_toggle() {
    let e = engine(EngineConfig::default());
    let mut a = e.create_consumer().unwrap();
    let mut b = e.create_consumer().unwrap();
    for c in [&a, &b] {
        c.set_slots(8).unwrap();
        c.enable().unwrap();
        c.join_group(Some(0), CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    }
    a.bind(0, Some(DEV), None).unwrap();
    a.set_timestamping(true).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, frame(0));
    e.flush(&mut rx);

    let batch = a.read(Duration::from_millis(5)).unwrap();
    assert!(batch.slot(0).header.tstamp_sec > 0);
    drop(batch);
    // the same frame lands unstamped in the queue of a consumer that
    // never asked for timestamps
    let batch = b.read(Duration::from_millis(5)).unwrap();
    assert_eq!(batch.slot(0).header.tstamp_sec, 0);
}

#[test]
fn overlapping_groups_deliver_once_per_consumer() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(8).unwrap();
    c.enable().unwrap();
    let g1 = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    let g2 = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    assert_ne!(g1, g2);
    c.bind(g1, Some(DEV), None).unwrap();
    c.bind(g2, Some(DEV), None).unwrap();

    let mut rx = e.local(0);
    e.receive(&mut rx, frame(0));
    e.flush(&mut rx);

    assert_eq!(c.read(Duration::from_millis(5)).unwrap().len(), 1);
    assert_eq!(c.stats().unwrap().recv, 1);
    // both groups evaluated the frame independently
    assert_eq!(c.group_stats(g1).unwrap().recv, 1);
    assert_eq!(c.group_stats(g2).unwrap().recv, 1);
}

#[test]
fn parked_reader_is_woken_by_traffic() {
    let e = engine(EngineConfig::default());
    let mut c = e.create_consumer().unwrap();
    c.set_slots(4).unwrap();
    c.enable().unwrap();
    let gid = c.join_group(None, CLASS_DEFAULT, GroupPolicy::Shared).unwrap();
    c.bind(gid, Some(DEV), None).unwrap();

    let producer = {
        let e = e.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut rx = e.local(1);
            for i in 0..2u8 {
                e.receive(&mut rx, frame(i));
            }
            e.flush(&mut rx);
        })
    };

    let batch = c.read(Duration::from_secs(5)).unwrap();
    assert!(!batch.is_empty());
    drop(batch);
    producer.join().unwrap();
}

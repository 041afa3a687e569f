//! The per-CPU receive pipeline: batching, group matching, classification
//! and fan-out into consumer queues.
//!
//! Producers feed frames through [`Engine::receive`] using a [`LocalContext`]
//! owned by their CPU. Frames accumulate into a prefetch batch; a full batch
//! is classified once per matching group and the selected frames are written
//! into the consumer queues in a single burst per consumer, so a frame
//! reaches each consumer at most once however many groups picked it.

use crate::classify::Scratch;
use crate::engine::{Engine, MAX_CONSUMERS};
use crate::frame::{Batch, Direction, Frame, Timestamp};
use crate::utils::{bits, fold, premix};

/// Per-producer working state. One per receive CPU; never shared.
pub struct LocalContext {
    cpu: usize,
    batch: Batch,
    /// Cache of the last eligible set expanded into `sock_idx`.
    eligible_mask: u64,
    sock_cnt: usize,
    sock_idx: [usize; MAX_CONSUMERS],
    /// Frames left to discard after a queue overflow armed the valve.
    flowctrl: u32,
    scratch: Scratch,
}

impl LocalContext {
    pub(crate) fn new(cpu: usize, prefetch: usize) -> Self {
        LocalContext {
            cpu,
            batch: Batch::new(prefetch),
            eligible_mask: 0,
            sock_cnt: 0,
            sock_idx: [0; MAX_CONSUMERS],
            flowctrl: 0,
            scratch: Scratch::default(),
        }
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl Engine {
    /// Accepts one frame into the context's batch, running the pipeline if
    /// the batch fills up. Returns false when the frame was discarded before
    /// entering the pipeline (direction policy or flow control).
    pub fn receive(&self, local: &mut LocalContext, mut frame: Frame) -> bool {
        let wanted = match frame.direction() {
            Direction::Incoming => self.config.capture.incoming,
            Direction::Outgoing => self.config.capture.outgoing,
            Direction::Loopback => self.config.capture.loopback,
        };
        if !wanted {
            return false;
        }
        if local.flowctrl > 0 {
            local.flowctrl -= 1;
            return false;
        }
        if self.config.vlan_untag {
            frame.clear_vlan();
        }
        if self.tstamp_enabled() && frame.timestamp().is_none() {
            frame.set_timestamp(Timestamp::now());
        }
        frame.ann.group_mask = 0;
        frame.ann.gid = 0;
        frame.ann.stolen = false;
        frame.ann.to_kernel = false;

        local.batch.push(frame);
        if local.batch.is_full() {
            self.process_batch(local);
        }
        true
    }

    /// Runs the pipeline over a partially filled batch. Producers call this
    /// when their poll cycle goes idle.
    pub fn flush(&self, local: &mut LocalContext) {
        if !local.batch.is_empty() {
            self.process_batch(local);
        }
    }

    fn process_batch(&self, local: &mut LocalContext) {
        let LocalContext {
            cpu,
            batch,
            eligible_mask,
            sock_cnt,
            sock_idx,
            flowctrl,
            scratch,
        } = local;
        let cpu = *cpu;

        // resolve device bindings once per frame
        let mut group_union = 0u64;
        for frame in batch.frames_mut() {
            let mask = self.devmap.groups(frame.if_index(), frame.hw_queue());
            frame.ann.group_mask = mask;
            group_union |= mask;
        }

        // per-consumer bitmask of batch positions to deliver
        let mut sock_queue = [0u64; MAX_CONSUMERS];
        let mut socket_union = 0u64;

        for gid in bits(group_union) {
            let group = match self.groups.get(gid) {
                Ok(g) => g,
                Err(_) => continue,
            };
            let filter = group.snapshot_filter();
            let chain = group.snapshot_chain();
            let vlan_on = group.vlan_filter_enabled();

            for (n, frame) in batch.frames_mut().iter_mut().enumerate() {
                if frame.ann.group_mask & (1 << gid) == 0 || frame.ann.stolen {
                    continue;
                }
                group.stats.recv.inc(cpu);

                if let Some(filter) = &filter {
                    if !filter.accept(frame.payload()) {
                        group.stats.drop.inc(cpu);
                        continue;
                    }
                }
                if vlan_on {
                    let vid = frame.vlan().map(|v| v.vid()).unwrap_or(0);
                    if !group.vlan_pass(vid) {
                        group.stats.drop.inc(cpu);
                        continue;
                    }
                }

                let sock_mask = if chain.is_empty() {
                    group.class_consumers(0)
                } else {
                    scratch.reset();
                    scratch.state = frame.ann.state;
                    let action = chain.eval(frame, scratch);
                    frame.ann.state = scratch.state;
                    if action.is_steal() {
                        frame.ann.stolen = true;
                        continue;
                    }
                    if action.sends_to_kernel() {
                        frame.ann.to_kernel = true;
                    }
                    if action.is_drop() {
                        group.stats.drop.inc(cpu);
                        continue;
                    }
                    let eligible = group.eligible(action.class_mask());
                    if eligible == 0 {
                        continue;
                    }
                    if action.is_clone() || eligible.count_ones() == 1 {
                        eligible
                    } else {
                        if *eligible_mask != eligible {
                            *eligible_mask = eligible;
                            *sock_cnt = 0;
                            for c in bits(eligible) {
                                sock_idx[*sock_cnt] = c;
                                *sock_cnt += 1;
                            }
                        }
                        let pick = fold(premix(action.hash()), *sock_cnt as u32) as usize;
                        1u64 << sock_idx[pick]
                    }
                };

                if sock_mask != 0 {
                    frame.ann.gid = gid as u32;
                    for c in bits(sock_mask) {
                        sock_queue[c] |= 1 << n;
                    }
                    socket_union |= sock_mask;
                }
            }
        }

        // one burst per consumer, however many groups selected the frames
        let frames = batch.frames();
        for c in bits(socket_union) {
            let mask = sock_queue[c];
            let burst = bits(mask).filter(|&n| !frames[n].ann.stolen).count();
            if burst == 0 {
                continue;
            }
            let consumer = match self.consumer(c) {
                Ok(consumer) => consumer,
                Err(_) => continue,
            };
            match consumer.ring() {
                Some(ring) => {
                    let selected = bits(mask)
                        .filter(|&n| !frames[n].ann.stolen)
                        .map(|n| &frames[n]);
                    let sent = ring.enqueue_batch(selected, burst);
                    consumer.stats.recv.add(cpu, sent as u64);
                    if sent < burst {
                        consumer.stats.lost.add(cpu, (burst - sent) as u64);
                        if self.config.flow_control > 0 {
                            *flowctrl = self.config.flow_control;
                        }
                    }
                }
                None => consumer.stats.lost.add(cpu, burst as u64),
            }
        }

        for frame in batch.drain() {
            if frame.ann.stolen {
                continue;
            }
            if frame.ann.to_kernel && frame.ann.direct {
                if let Some(forward) = &self.kernel_tx {
                    forward(frame);
                }
            }
        }
    }
}

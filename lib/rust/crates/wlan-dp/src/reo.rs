// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! REO (reorder engine) command plumbing and the asynchronous release of
//! retired reorder-queue descriptors.
//!
//! Hardware may hold cached references into a queue descriptor after the
//! host stops using it, so retired descriptors are not freed inline.
//! They sit on a free list until an update command invalidating the queue
//! has completed and a cache flush has been issued; only the flush
//! completion releases the memory (optionally after a further deferred
//! grace period).

use {
    crate::{
        error::{Error, Result},
        mac::MacAddr,
        rx_tid::PnSize,
        soc::DpSoc,
    },
    log::{debug, error, info, warn},
    parking_lot::Mutex,
    std::{
        collections::{HashMap, VecDeque},
        time::{Duration, Instant},
    },
};

/// Queue descriptors must sit on a hardware cache-line-sized boundary.
pub const QDESC_ALIGN: usize = 128;

const QDESC_HDR_SIZE: usize = 256;
const QDESC_PER_MPDU: usize = 48;

/// Completion status reported by the REO ring for commands that requested
/// one. `Drain` means the command was flushed out during ring teardown and
/// never reached hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReoStatus {
    Success,
    Drain,
    Failure,
}

/// In-place update of an existing reorder queue. `None` fields are left
/// untouched by hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueUpdate {
    pub ba_window_size: Option<u16>,
    pub ssn: Option<u16>,
    pub valid: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReoCommand {
    UpdateRxQueue { paddr: u64, update: QueueUpdate },
    FlushCache { paddr: u64 },
    GetQueueStats { paddr: u64 },
}

impl ReoCommand {
    pub fn paddr(&self) -> u64 {
        match self {
            ReoCommand::UpdateRxQueue { paddr, .. }
            | ReoCommand::FlushCache { paddr }
            | ReoCommand::GetQueueStats { paddr } => *paddr,
        }
    }
}

/// Invoked when the ring reports completion of a command that asked for
/// status.
pub type ReoCompletion = Box<dyn FnOnce(&DpSoc, ReoStatus) + Send>;

/// Returned by [`ReoRing::send`] when the command ring is full. Hands the
/// command and its completion back so the caller can retry later.
pub struct RingFull {
    pub cmd: ReoCommand,
    pub done: Option<ReoCompletion>,
}

impl std::fmt::Debug for RingFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingFull").field("cmd", &self.cmd).finish()
    }
}

/// The REO command ring. Implementations must not invoke `done`
/// synchronously from within `send`; the caller may hold datapath locks.
pub trait ReoRing: Send + Sync {
    fn send(&self, cmd: ReoCommand, done: Option<ReoCompletion>) -> std::result::Result<(), RingFull>;
}

/// Translates host buffers into bus addresses the hardware can follow.
pub trait DescMemory: Send + Sync {
    fn map(&self, buf: &[u8]) -> u64;
}

/// Mapper for platforms where the hardware sees host virtual addresses
/// directly (simulation and tests).
pub struct IdentityMemory;

impl DescMemory for IdentityMemory {
    fn map(&self, buf: &[u8]) -> u64 {
        buf.as_ptr() as u64
    }
}

/// An aligned, hardware-visible reorder queue descriptor. Owns its backing
/// storage; dropping it releases the memory.
pub struct QueueDescriptor {
    buf: Vec<u8>,
    offset: usize,
    size: usize,
    paddr: u64,
}

impl QueueDescriptor {
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn hdr_mut(&mut self) -> &mut [u8] {
        let start = self.offset;
        &mut self.buf[start..start + QDESC_HDR_SIZE]
    }
}

impl std::fmt::Debug for QueueDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDescriptor")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("size", &self.size)
            .finish()
    }
}

fn qdesc_size(ba_window_size: u16) -> usize {
    QDESC_HDR_SIZE + usize::from(ba_window_size.max(1)) * QDESC_PER_MPDU
}

/// Allocate and initialize a reorder queue descriptor for the given window.
///
/// When a minimum bus address is configured, allocations that map below it
/// are held aside and retried a bounded number of times so the allocator
/// cannot hand back the same rejected block.
pub(crate) fn alloc_qdesc(
    mem: &dyn DescMemory,
    ba_window_size: u16,
    pn_size: PnSize,
    min_paddr: Option<u64>,
    max_tries: usize,
) -> Result<QueueDescriptor> {
    let size = qdesc_size(ba_window_size);
    let mut rejected = Vec::new();
    for _ in 0..max_tries.max(1) {
        let buf = vec![0u8; size + QDESC_ALIGN];
        let misalign = buf.as_ptr() as usize % QDESC_ALIGN;
        let offset = (QDESC_ALIGN - misalign) % QDESC_ALIGN;
        let paddr = mem.map(&buf[offset..offset + size]);
        if let Some(min) = min_paddr {
            if paddr < min {
                debug!("qdesc at {:#x} below {:#x}, retrying", paddr, min);
                rejected.push(buf);
                continue;
            }
        }
        let mut desc = QueueDescriptor { buf, offset, size, paddr };
        init_qdesc_hdr(&mut desc, ba_window_size, pn_size);
        drop(rejected);
        return Ok(desc);
    }
    error!("failed to place qdesc above {:#x?} after {} tries", min_paddr, max_tries);
    Err(Error::NoMemory)
}

/// Write the static portion of the descriptor header: window size and the
/// PN check width for the queue.
fn init_qdesc_hdr(desc: &mut QueueDescriptor, ba_window_size: u16, pn_size: PnSize) {
    let hdr = desc.hdr_mut();
    hdr[0..2].copy_from_slice(&ba_window_size.to_le_bytes());
    hdr[2] = match pn_size {
        PnSize::None => 0,
        PnSize::Pn24 => 1,
        PnSize::Pn48 => 2,
        PnSize::Pn128 => 3,
    };
}

/// A retired descriptor waiting for its invalidation/flush sequence.
#[derive(Debug)]
pub(crate) struct ReoFreeDesc {
    pub peer_mac: MacAddr,
    pub tid: u8,
    pub free_ts: Instant,
    /// The invalidating update command could not be queued; it must be
    /// resent before the flush.
    pub resend_update_cmd: bool,
    pub qdesc: QueueDescriptor,
}

/// Free-list state owned by the SoC.
#[derive(Default)]
pub(crate) struct ReoDescLists {
    pub free_list: Mutex<VecDeque<ReoFreeDesc>>,
    /// Descriptors whose flush command is in flight, keyed by bus address.
    pub pending_flush: Mutex<HashMap<u64, ReoFreeDesc>>,
    /// Flushed descriptors held for the configured grace period.
    pub deferred: Mutex<VecDeque<(Instant, QueueDescriptor)>>,
}

impl DpSoc {
    /// Retire a reorder queue descriptor. Queues it on the free list and
    /// issues the invalidating update; the actual release happens from the
    /// update/flush completion chain.
    pub(crate) fn reo_desc_free(&self, mut desc: ReoFreeDesc) {
        let state = self.state();
        let mut list = state.reo_lists.free_list.lock();
        let cmd = ReoCommand::UpdateRxQueue {
            paddr: desc.qdesc.paddr(),
            update: QueueUpdate { valid: Some(false), ..Default::default() },
        };
        let done: ReoCompletion = Box::new(|soc, status| soc.on_rx_tid_delete_done(status));
        if let Err(_full) = state.reo.send(cmd, Some(done)) {
            state.stats.reo_cmd_send_fail_inc();
            desc.resend_update_cmd = true;
            error!(
                "reo ring full, deferring queue invalidation for peer {} tid {}",
                desc.peer_mac, desc.tid
            );
        }
        list.push_back(desc);
    }

    /// Completion of an invalidating queue update. Walks the free list and
    /// flushes descriptors that are old enough, or any backlog beyond the
    /// batch threshold, bounded per invocation.
    pub(crate) fn on_rx_tid_delete_done(&self, status: ReoStatus) {
        let state = self.state();
        match status {
            ReoStatus::Success => {}
            ReoStatus::Drain => {
                state.stats.reo_cmd_drain_inc();
                info!("rx queue invalidation drained during teardown");
            }
            ReoStatus::Failure => {
                error!("rx queue invalidation failed in hardware");
            }
        }

        let batch = state.config.reo_free_batch_size.max(1);
        let defer = Duration::from_millis(state.config.reo_desc_free_defer_ms);
        let mut list = state.reo_lists.free_list.lock();
        let mut processed = 0;
        while processed < batch {
            let (aged, overflow) = match list.front() {
                Some(front) => (front.free_ts.elapsed() >= defer, list.len() > batch),
                None => break,
            };
            if !aged && !overflow {
                break;
            }
            let mut desc = match list.pop_front() {
                Some(desc) => desc,
                None => break,
            };
            processed += 1;

            if desc.resend_update_cmd {
                let cmd = ReoCommand::UpdateRxQueue {
                    paddr: desc.qdesc.paddr(),
                    update: QueueUpdate { valid: Some(false), ..Default::default() },
                };
                let done: ReoCompletion = Box::new(|soc, status| soc.on_rx_tid_delete_done(status));
                match state.reo.send(cmd, Some(done)) {
                    Ok(()) => {
                        desc.resend_update_cmd = false;
                        list.push_back(desc);
                    }
                    Err(_full) => {
                        state.stats.reo_cmd_send_fail_inc();
                        list.push_front(desc);
                        break;
                    }
                }
                continue;
            }

            let paddr = desc.qdesc.paddr();
            state.reo_lists.pending_flush.lock().insert(paddr, desc);
            let done: ReoCompletion =
                Box::new(move |soc, status| soc.on_reo_desc_flushed(paddr, status));
            if let Err(_full) = state.reo.send(ReoCommand::FlushCache { paddr }, Some(done)) {
                state.stats.reo_cmd_send_fail_inc();
                // Take the descriptor back and stop for this cycle.
                if let Some(desc) = state.reo_lists.pending_flush.lock().remove(&paddr) {
                    list.push_front(desc);
                }
                break;
            }
        }
        drop(list);
        self.drain_deferred_qdescs();
    }

    /// Completion of a cache flush for a retired descriptor; releases the
    /// memory, or parks it on the deferred list when a grace period is
    /// configured.
    pub(crate) fn on_reo_desc_flushed(&self, paddr: u64, status: ReoStatus) {
        let state = self.state();
        let desc = match state.reo_lists.pending_flush.lock().remove(&paddr) {
            Some(desc) => desc,
            None => {
                warn!("flush completion for unknown qdesc {:#x}", paddr);
                return;
            }
        };
        match status {
            ReoStatus::Success => {}
            ReoStatus::Drain => {
                state.stats.reo_cmd_drain_inc();
                info!("cache flush drained for peer {} tid {}", desc.peer_mac, desc.tid);
            }
            ReoStatus::Failure => {
                error!("cache flush failed for peer {} tid {}", desc.peer_mac, desc.tid);
            }
        }
        match state.config.reo_desc_deferred_free_ms {
            Some(_) => {
                state.reo_lists.deferred.lock().push_back((Instant::now(), desc.qdesc));
                self.drain_deferred_qdescs();
            }
            None => drop(desc.qdesc),
        }
    }

    /// Release deferred descriptors whose grace period has elapsed.
    pub(crate) fn drain_deferred_qdescs(&self) {
        let state = self.state();
        let grace = match state.config.reo_desc_deferred_free_ms {
            Some(ms) => Duration::from_millis(ms),
            None => return,
        };
        let mut deferred = state.reo_lists.deferred.lock();
        while let Some((ts, _)) = deferred.front() {
            if ts.elapsed() < grace {
                break;
            }
            deferred.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn reo_list_sizes(&self) -> (usize, usize, usize) {
        let state = self.state();
        (
            state.reo_lists.free_list.lock().len(),
            state.reo_lists.pending_flush.lock().len(),
            state.reo_lists.deferred.lock().len(),
        )
    }
}

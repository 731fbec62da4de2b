// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-chip SoC object: owns every datapath table and the handles to
//! firmware and the REO command ring. [`DpSoc`] is a cheap clone-able
//! handle; all state lives behind one `Arc`.

use {
    crate::{
        ast::AstTable,
        config::SocConfig,
        error::{Error, Result},
        fw::FirmwareOps,
        mac::MacAddr,
        mlo::MloContext,
        peer::{Peer, PeerHash},
        reo::{DescMemory, ReoDescLists, ReoRing},
    },
    log::{info, warn},
    parking_lot::Mutex,
    std::sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Sta,
    Ap,
}

/// A virtual device (one BSS worth of state). Peers are parented to
/// exactly one vdev for their whole lifetime.
pub struct Vdev {
    pub(crate) vdev_id: u8,
    pub(crate) pdev_id: u8,
    pub(crate) mac: MacAddr,
    pub(crate) opmode: OpMode,
    pub(crate) peers: Mutex<Vec<Arc<Peer>>>,
    pub(crate) num_peers: AtomicUsize,
    /// Set while firmware owns a peer during a roam handoff; queue writes
    /// for that peer are rejected until the new map event lands.
    pub(crate) roaming_peer_mac: Mutex<Option<MacAddr>>,
}

impl Vdev {
    pub fn id(&self) -> u8 {
        self.vdev_id
    }

    pub fn pdev_id(&self) -> u8 {
        self.pdev_id
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn opmode(&self) -> OpMode {
        self.opmode
    }

    pub fn num_peers(&self) -> usize {
        self.num_peers.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Vdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdev")
            .field("vdev_id", &self.vdev_id)
            .field("pdev_id", &self.pdev_id)
            .field("mac", &self.mac)
            .field("opmode", &self.opmode)
            .field("num_peers", &self.num_peers())
            .finish()
    }
}

/// Error and anomaly counters. Monotonic; read via [`DpSoc::stats`].
#[derive(Default)]
pub(crate) struct SocStats {
    ast_added: AtomicU64,
    ast_deleted: AtomicU64,
    ast_map_err: AtomicU64,
    ast_mismatch: AtomicU64,
    reo_cmd_send_fail: AtomicU64,
    reo_cmd_drain: AtomicU64,
    invalid_state_change: AtomicU64,
    peer_map_err: AtomicU64,
}

macro_rules! stat_inc {
    ($($field:ident => $method:ident),* $(,)?) => {
        impl SocStats {
            $(pub(crate) fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            })*
        }
    };
}

stat_inc! {
    ast_added => ast_added_inc,
    ast_deleted => ast_deleted_inc,
    ast_map_err => ast_map_err_inc,
    ast_mismatch => ast_mismatch_inc,
    reo_cmd_send_fail => reo_cmd_send_fail_inc,
    reo_cmd_drain => reo_cmd_drain_inc,
    invalid_state_change => invalid_state_change_inc,
    peer_map_err => peer_map_err_inc,
}

/// Point-in-time copy of the SoC counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocStatsSnapshot {
    pub ast_added: u64,
    pub ast_deleted: u64,
    pub ast_map_err: u64,
    pub ast_mismatch: u64,
    pub reo_cmd_send_fail: u64,
    pub reo_cmd_drain: u64,
    pub invalid_state_change: u64,
    pub peer_map_err: u64,
}

pub(crate) struct SocState {
    pub(crate) config: SocConfig,
    pub(crate) chip_id: u8,
    pub(crate) fw: Arc<dyn FirmwareOps>,
    pub(crate) reo: Arc<dyn ReoRing>,
    pub(crate) mem: Arc<dyn DescMemory>,
    pub(crate) peer_hash: Mutex<PeerHash>,
    pub(crate) mld_hash: Mutex<PeerHash>,
    /// Firmware peer id -> peer; the slot holds its own reference.
    pub(crate) id_map: Mutex<Vec<Option<Arc<Peer>>>>,
    /// MLD-level peer id -> MLD peer; ids carry the ML valid bit and live
    /// outside the flat id map.
    pub(crate) ml_id_map: Mutex<std::collections::HashMap<u16, Arc<Peer>>>,
    pub(crate) vdevs: Mutex<Vec<Arc<Vdev>>>,
    pub(crate) ast: Mutex<AstTable>,
    pub(crate) reo_lists: ReoDescLists,
    pub(crate) stats: SocStats,
    pub(crate) mlo: Option<Arc<MloContext>>,
}

/// Handle to one chip's datapath state.
#[derive(Clone)]
pub struct DpSoc {
    inner: Arc<SocState>,
}

impl DpSoc {
    pub fn new(
        config: SocConfig,
        chip_id: u8,
        fw: Arc<dyn FirmwareOps>,
        reo: Arc<dyn ReoRing>,
        mem: Arc<dyn DescMemory>,
        mlo: Option<Arc<MloContext>>,
    ) -> DpSoc {
        let id_map = Mutex::new((0..config.max_peer_id).map(|_| None).collect());
        let ast = Mutex::new(AstTable::new(config.max_ast_entries));
        let inner = Arc::new(SocState {
            config,
            chip_id,
            fw,
            reo,
            mem,
            peer_hash: Mutex::new(PeerHash::new()),
            mld_hash: Mutex::new(PeerHash::new()),
            id_map,
            ml_id_map: Mutex::new(std::collections::HashMap::new()),
            vdevs: Mutex::new(Vec::new()),
            ast,
            reo_lists: ReoDescLists::default(),
            stats: SocStats::default(),
            mlo: mlo.clone(),
        });
        if let Some(ctx) = mlo {
            ctx.register(chip_id, Arc::downgrade(&inner));
        }
        info!("dp soc attached: chip {}", chip_id);
        DpSoc { inner }
    }

    pub(crate) fn state(&self) -> &SocState {
        &self.inner
    }

    pub(crate) fn from_state(state: Arc<SocState>) -> DpSoc {
        DpSoc { inner: state }
    }

    pub fn chip_id(&self) -> u8 {
        self.inner.chip_id
    }

    pub fn vdev_attach(
        &self,
        vdev_id: u8,
        pdev_id: u8,
        mac: MacAddr,
        opmode: OpMode,
    ) -> Result<Arc<Vdev>> {
        let mut vdevs = self.inner.vdevs.lock();
        if vdevs.iter().any(|v| v.vdev_id == vdev_id) {
            return Err(Error::AlreadyExists);
        }
        let vdev = Arc::new(Vdev {
            vdev_id,
            pdev_id,
            mac,
            opmode,
            peers: Mutex::new(Vec::new()),
            num_peers: AtomicUsize::new(0),
            roaming_peer_mac: Mutex::new(None),
        });
        vdevs.push(vdev.clone());
        info!("vdev {} attached: {} {:?} pdev {}", vdev_id, mac, opmode, pdev_id);
        Ok(vdev)
    }

    /// Detach an empty vdev. Every peer must be deleted and finalized
    /// first.
    pub fn vdev_detach(&self, vdev_id: u8) -> Result {
        let mut vdevs = self.inner.vdevs.lock();
        let idx = vdevs.iter().position(|v| v.vdev_id == vdev_id).ok_or(Error::NotFound)?;
        let remaining = vdevs[idx].num_peers();
        if remaining > 0 {
            warn!("vdev {} detach with {} peers outstanding", vdev_id, remaining);
            return Err(Error::Busy);
        }
        vdevs.remove(idx);
        info!("vdev {} detached", vdev_id);
        Ok(())
    }

    pub fn vdev(&self, vdev_id: u8) -> Option<Arc<Vdev>> {
        self.inner.vdevs.lock().iter().find(|v| v.vdev_id == vdev_id).cloned()
    }

    /// Mark (or clear) the peer currently handed to firmware for a roam.
    pub fn set_vdev_roaming_peer(&self, vdev_id: u8, mac: Option<MacAddr>) -> Result {
        let vdev = self.vdev(vdev_id).ok_or(Error::NotFound)?;
        *vdev.roaming_peer_mac.lock() = mac;
        Ok(())
    }

    pub fn stats(&self) -> SocStatsSnapshot {
        let s = &self.inner.stats;
        SocStatsSnapshot {
            ast_added: s.ast_added.load(Ordering::Relaxed),
            ast_deleted: s.ast_deleted.load(Ordering::Relaxed),
            ast_map_err: s.ast_map_err.load(Ordering::Relaxed),
            ast_mismatch: s.ast_mismatch.load(Ordering::Relaxed),
            reo_cmd_send_fail: s.reo_cmd_send_fail.load(Ordering::Relaxed),
            reo_cmd_drain: s.reo_cmd_drain.load(Ordering::Relaxed),
            invalid_state_change: s.invalid_state_change.load(Ordering::Relaxed),
            peer_map_err: s.peer_map_err.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DpSoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpSoc").field("chip_id", &self.inner.chip_id).finish()
    }
}

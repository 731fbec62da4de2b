// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Peer objects and the tables that index them.
//!
//! A peer is created by the control plane, becomes usable once firmware
//! maps it to a peer id, and is torn down in two phases: a logical delete
//! initiated by the host, then a firmware unmap confirming that hardware
//! holds no further references. The object itself is reference counted;
//! per-module counters exist purely to attribute leaks.

use {
    crate::{
        error::{Error, Result},
        fw::{PeerMapEvent, PeerUnmapEvent},
        mac::MacAddr,
        mlo::LinkTable,
        reo::ReoFreeDesc,
        rx_tid::{BaAggregate, PnSize, RxTid},
        soc::{DpSoc, Vdev},
        MAX_TIDS, PEER_ID_INVALID,
    },
    log::{debug, error, info, warn},
    parking_lot::Mutex,
    std::{
        fmt,
        sync::{
            atomic::{AtomicU16, AtomicU32, Ordering},
            Arc,
        },
        time::Instant,
    },
};

/// Modules that may hold peer references. Used only to attribute reference
/// counts; lifetime is governed by the total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleId {
    Config = 0,
    Htt,
    Ast,
    Rx,
    Cdp,
    Cm,
    Mlo,
    Misc,
}

impl ModuleId {
    pub(crate) const COUNT: usize = 8;

    fn idx(self) -> usize {
        self as usize
    }
}

/// Lifecycle states, in transition order. Lookup paths treat anything at
/// or past `LogicalDelete` as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Init,
    Active,
    LogicalDelete,
    Inactive,
    Freed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    Legacy,
    /// One link of a multi-link association; RX reorder state lives on the
    /// MLD peer it points at.
    MloLink,
    /// The MLD-level aggregate peer.
    Mld,
}

pub struct Peer {
    mac: MacAddr,
    vdev: Arc<Vdev>,
    peer_type: PeerType,
    chip_id: u8,
    bss_peer: bool,
    peer_id: AtomicU16,
    state: Mutex<PeerState>,
    ref_cnt: AtomicU32,
    mod_refs: [AtomicU32; ModuleId::COUNT],
    pub(crate) ast_list: Mutex<Vec<crate::ast::AstEntryId>>,
    pub(crate) tids: [Mutex<RxTid>; MAX_TIDS],
    pub(crate) ba: Mutex<BaAggregate>,
    pub(crate) security: Mutex<PnSize>,
    /// For link peers: the MLD peer owning the shared RX state.
    pub(crate) mld: Mutex<Option<Arc<Peer>>>,
    /// For MLD peers: the registered links.
    pub(crate) links: Mutex<LinkTable>,
}

impl Peer {
    fn new(
        mac: MacAddr,
        vdev: Arc<Vdev>,
        peer_type: PeerType,
        chip_id: u8,
        max_mlo_links: usize,
    ) -> Arc<Peer> {
        let bss_peer = mac == vdev.mac;
        let mod_refs = std::array::from_fn(|_| AtomicU32::new(0));
        let peer = Peer {
            mac,
            vdev,
            peer_type,
            chip_id,
            bss_peer,
            peer_id: AtomicU16::new(PEER_ID_INVALID),
            state: Mutex::new(PeerState::Init),
            ref_cnt: AtomicU32::new(1),
            mod_refs,
            ast_list: Mutex::new(Vec::new()),
            tids: std::array::from_fn(|tid| Mutex::new(RxTid::new(tid as u8))),
            ba: Mutex::new(BaAggregate::default()),
            security: Mutex::new(PnSize::None),
            mld: Mutex::new(None),
            links: Mutex::new(LinkTable::new(max_mlo_links)),
        };
        peer.mod_refs[ModuleId::Config.idx()].store(1, Ordering::Relaxed);
        Arc::new(peer)
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn vdev(&self) -> &Arc<Vdev> {
        &self.vdev
    }

    pub fn vdev_id(&self) -> u8 {
        self.vdev.vdev_id
    }

    pub(crate) fn chip_id(&self) -> u8 {
        self.chip_id
    }

    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    pub fn is_bss_peer(&self) -> bool {
        self.bss_peer
    }

    /// The firmware peer id, or `PEER_ID_INVALID` while unmapped.
    pub fn peer_id(&self) -> u16 {
        self.peer_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_peer_id(&self, id: u16) {
        self.peer_id.store(id, Ordering::Release);
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn total_refs(&self) -> u32 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn mod_ref_count(&self, mod_id: ModuleId) -> u32 {
        self.mod_refs[mod_id.idx()].load(Ordering::Acquire)
    }

    pub fn set_pn_size(&self, pn: PnSize) {
        *self.security.lock() = pn;
    }

    /// Take a reference unless the count already dropped to zero.
    pub(crate) fn get_ref(self: &Arc<Peer>, mod_id: ModuleId) -> bool {
        let mut cur = self.ref_cnt.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.ref_cnt.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.mod_refs[mod_id.idx()].fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("mac", &self.mac)
            .field("vdev_id", &self.vdev.vdev_id)
            .field("peer_id", &self.peer_id())
            .field("type", &self.peer_type)
            .field("state", &self.state())
            .field("refs", &self.total_refs())
            .finish()
    }
}

/// A counted peer reference attributed to a module. Dropping it releases
/// the reference; the last release finalizes the peer.
pub struct PeerRef {
    soc: DpSoc,
    peer: Arc<Peer>,
    mod_id: ModuleId,
}

impl PeerRef {
    pub(crate) fn new(soc: DpSoc, peer: Arc<Peer>, mod_id: ModuleId) -> PeerRef {
        PeerRef { soc, peer, mod_id }
    }

    pub fn module_id(&self) -> ModuleId {
        self.mod_id
    }

    pub(crate) fn arc(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub(crate) fn soc(&self) -> &DpSoc {
        &self.soc
    }
}

impl std::ops::Deref for PeerRef {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Clone for PeerRef {
    fn clone(&self) -> PeerRef {
        // Cannot fail, the count is at least one while `self` lives.
        let ok = Peer::get_ref(&self.peer, self.mod_id);
        debug_assert!(ok);
        PeerRef { soc: self.soc.clone(), peer: self.peer.clone(), mod_id: self.mod_id }
    }
}

impl Drop for PeerRef {
    fn drop(&mut self) {
        let soc = self.soc.clone();
        soc.peer_unref(&self.peer, self.mod_id);
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRef").field("peer", &*self.peer).field("mod", &self.mod_id).finish()
    }
}

/// MAC-keyed hash table. Buckets preserve insertion order so that lookups
/// with duplicate MACs across vdevs stay deterministic.
pub(crate) struct PeerHash {
    bins: Vec<Vec<Arc<Peer>>>,
}

impl PeerHash {
    pub(crate) fn new() -> PeerHash {
        PeerHash { bins: (0..256).map(|_| Vec::new()).collect() }
    }

    fn bin(&self, mac: MacAddr) -> &Vec<Arc<Peer>> {
        &self.bins[mac.xor_fold() as usize]
    }

    fn bin_mut(&mut self, mac: MacAddr) -> &mut Vec<Arc<Peer>> {
        &mut self.bins[mac.xor_fold() as usize]
    }

    pub(crate) fn insert(&mut self, peer: Arc<Peer>) {
        self.bin_mut(peer.mac()).push(peer);
    }

    pub(crate) fn remove(&mut self, peer: &Arc<Peer>) -> bool {
        let bin = self.bin_mut(peer.mac());
        let before = bin.len();
        bin.retain(|p| !Arc::ptr_eq(p, peer));
        bin.len() != before
    }
}

impl DpSoc {
    /// Wrap `peer` in a counted reference, or `None` if it is already on
    /// its way out.
    pub(crate) fn take_peer_ref(&self, peer: &Arc<Peer>, mod_id: ModuleId) -> Option<PeerRef> {
        if Peer::get_ref(peer, mod_id) {
            Some(PeerRef::new(self.clone(), peer.clone(), mod_id))
        } else {
            None
        }
    }

    /// Create a peer on `vdev_id` in the `Init` state. The returned
    /// reference is the creation hold; pass it to [`DpSoc::peer_delete`]
    /// to tear the peer down.
    pub fn peer_create(
        &self,
        vdev_id: u8,
        mac: MacAddr,
        peer_type: PeerType,
    ) -> Result<PeerRef> {
        let state = self.state();
        let vdev = self.vdev(vdev_id).ok_or(Error::NotFound)?;
        if mac.is_zero() || mac.is_bcast() {
            return Err(Error::InvalidArgument("peer mac"));
        }
        let existing = match peer_type {
            PeerType::Mld => self.mld_peer_find(mac, ModuleId::Config),
            _ => self.peer_find(mac, Some(vdev_id), ModuleId::Config),
        };
        if existing.is_some() {
            return Err(Error::AlreadyExists);
        }

        let peer =
            Peer::new(mac, vdev.clone(), peer_type, state.chip_id, state.config.max_mlo_links);
        match peer_type {
            PeerType::Mld => state.mld_hash.lock().insert(peer.clone()),
            _ => state.peer_hash.lock().insert(peer.clone()),
        }
        vdev.peers.lock().push(peer.clone());
        vdev.num_peers.fetch_add(1, Ordering::AcqRel);
        info!("peer create: {} vdev {} type {:?}", mac, vdev_id, peer_type);

        // Mirror the peer's own address into the AST. MLD peers have no
        // hardware presence of their own.
        if peer_type != PeerType::Mld {
            let ast_type = if peer.is_bss_peer() {
                crate::ast::AstType::SelfEntry
            } else if vdev.opmode == crate::soc::OpMode::Sta {
                crate::ast::AstType::StaBss
            } else {
                crate::ast::AstType::Static
            };
            if let Err(e) = self.add_ast_inner(&peer, mac, ast_type, 0) {
                warn!("self ast add failed for {}: {}", mac, e);
            }
        }
        Ok(PeerRef::new(self.clone(), peer, ModuleId::Config))
    }

    /// Find a live peer by MAC, optionally constrained to one vdev. Peers
    /// past logical delete are not returned.
    pub fn peer_find(
        &self,
        mac: MacAddr,
        vdev_id: Option<u8>,
        mod_id: ModuleId,
    ) -> Option<PeerRef> {
        let state = self.state();
        let hash = state.peer_hash.lock();
        for peer in hash.bin(mac) {
            if peer.mac() != mac {
                continue;
            }
            if let Some(v) = vdev_id {
                if peer.vdev_id() != v {
                    continue;
                }
            }
            if peer.state() >= PeerState::LogicalDelete {
                continue;
            }
            if let Some(r) = self.take_peer_ref(peer, mod_id) {
                return Some(r);
            }
        }
        None
    }

    /// Find a live MLD peer by its MLD MAC.
    pub fn mld_peer_find(&self, mac: MacAddr, mod_id: ModuleId) -> Option<PeerRef> {
        let state = self.state();
        let hash = state.mld_hash.lock();
        for peer in hash.bin(mac) {
            if peer.mac() == mac && peer.state() < PeerState::LogicalDelete {
                if let Some(r) = self.take_peer_ref(peer, mod_id) {
                    return Some(r);
                }
            }
        }
        None
    }

    /// Id-map lookup filtered by lifecycle state.
    pub fn peer_get_ref_by_id(&self, peer_id: u16, mod_id: ModuleId) -> Option<PeerRef> {
        let r = self.peer_get_ref_by_id_any(peer_id, mod_id)?;
        if r.state() >= PeerState::LogicalDelete {
            return None;
        }
        Some(r)
    }

    /// Id-map lookup regardless of state, for teardown paths that must
    /// still reach a logically deleted peer.
    pub fn peer_get_ref_by_id_any(&self, peer_id: u16, mod_id: ModuleId) -> Option<PeerRef> {
        let state = self.state();
        let map = state.id_map.lock();
        let peer = map.get(peer_id as usize)?.as_ref()?;
        self.take_peer_ref(peer, mod_id)
    }

    /// Snapshot references to every live peer on a vdev.
    pub fn vdev_peers(&self, vdev_id: u8, mod_id: ModuleId) -> Vec<PeerRef> {
        let vdev = match self.vdev(vdev_id) {
            Some(v) => v,
            None => return Vec::new(),
        };
        let peers: Vec<Arc<Peer>> = vdev.peers.lock().clone();
        peers
            .iter()
            .filter(|p| p.state() < PeerState::LogicalDelete)
            .filter_map(|p| self.take_peer_ref(p, mod_id))
            .collect()
    }

    /// Apply a lifecycle transition. Invalid transitions are logged and
    /// counted but still take effect; the event path must keep moving even
    /// when firmware surprises us.
    pub(crate) fn peer_update_state(&self, peer: &Peer, new: PeerState) {
        let mut state = peer.state.lock();
        let old = *state;
        let valid = match new {
            PeerState::Init => false,
            PeerState::Active => matches!(old, PeerState::Init | PeerState::Active),
            PeerState::LogicalDelete => matches!(old, PeerState::Init | PeerState::Active),
            PeerState::Inactive => matches!(old, PeerState::LogicalDelete),
            PeerState::Freed => {
                matches!(old, PeerState::Init | PeerState::LogicalDelete | PeerState::Inactive)
            }
        };
        if !valid {
            self.state().stats.invalid_state_change_inc();
            error!("peer {}: invalid state change {:?} -> {:?}", peer.mac(), old, new);
        }
        *state = new;
        debug!("peer {}: state {:?} -> {:?}", peer.mac(), old, new);
    }

    /// Firmware mapped a peer (or, with `is_wds`, added a hardware AST
    /// entry to an already mapped peer).
    pub fn rx_peer_map_handler(&self, ev: PeerMapEvent) -> Result {
        let state = self.state();
        if ev.peer_id as usize >= state.config.max_peer_id {
            state.stats.peer_map_err_inc();
            return Err(Error::InvalidArgument("peer id out of range"));
        }

        if ev.is_wds {
            let peer = self.peer_get_ref_by_id(ev.peer_id, ModuleId::Ast).ok_or_else(|| {
                error!("wds map for unknown peer id {}", ev.peer_id);
                Error::NotFound
            })?;
            return self.map_ast(peer.arc(), ev.mac, ev.hw_peer_id, ev.ast_hash, crate::ast::AstType::Wds);
        }

        info!(
            "peer map: {} vdev {} peer_id {} hw {}",
            ev.mac, ev.vdev_id, ev.peer_id, ev.hw_peer_id
        );
        let peer = self.peer_find(ev.mac, Some(ev.vdev_id), ModuleId::Htt).ok_or_else(|| {
            // Covers both truly unknown peers and ones already logically
            // deleted; a map for either is a firmware-side race.
            state.stats.peer_map_err_inc();
            error!("peer map for unknown/deleted peer {} vdev {}", ev.mac, ev.vdev_id);
            Error::NotFound
        })?;

        {
            let mut id_map = state.id_map.lock();
            match &id_map[ev.peer_id as usize] {
                Some(existing) if Arc::ptr_eq(existing, peer.arc()) => {
                    debug!("duplicate peer map for {} id {}", ev.mac, ev.peer_id);
                    return Ok(());
                }
                Some(_) => {
                    state.stats.peer_map_err_inc();
                    error!("peer id {} already mapped to another peer", ev.peer_id);
                    return Err(Error::AlreadyExists);
                }
                None => {}
            }
            // The id-map slot holds its own reference until unmap.
            let ok = Peer::get_ref(peer.arc(), ModuleId::Htt);
            debug_assert!(ok);
            id_map[ev.peer_id as usize] = Some(peer.arc().clone());
        }
        peer.set_peer_id(ev.peer_id);
        self.peer_update_state(&peer, PeerState::Active);

        // A completed map ends any roam handoff bookkeeping for this peer.
        let vdev = peer.vdev();
        let mut roaming = vdev.roaming_peer_mac.lock();
        if *roaming == Some(ev.mac) {
            *roaming = None;
        }
        drop(roaming);

        if let Err(e) =
            self.map_ast(peer.arc(), ev.mac, ev.hw_peer_id, ev.ast_hash, crate::ast::AstType::Static)
        {
            warn!("self ast map failed for {}: {}", ev.mac, e);
        }

        // The non-QoS TID and TID 0 must be able to receive from the
        // moment the peer is mapped; other TIDs wait for ADDBA.
        for tid in [crate::NON_QOS_TID, 0] {
            if let Err(e) = self.rx_tid_setup(&peer, tid, 1, 0) {
                warn!("rx tid {} init failed for {}: {}", tid, ev.mac, e);
            }
        }
        Ok(())
    }

    /// Firmware unmapped a peer (or, with `is_wds`, confirmed deletion of
    /// a single hardware AST entry).
    pub fn rx_peer_unmap_handler(&self, ev: PeerUnmapEvent) {
        let state = self.state();
        let peer = match self.peer_get_ref_by_id_any(ev.peer_id, ModuleId::Htt) {
            Some(p) => p,
            None => {
                warn!("unmap for unknown peer id {}", ev.peer_id);
                return;
            }
        };

        if ev.is_wds {
            if let Err(e) = self.ast_free_by_mac(ev.mac) {
                warn!("wds unmap for {}: {}", ev.mac, e);
            }
            return;
        }

        info!("peer unmap: {} peer_id {}", ev.mac, ev.peer_id);

        // Firmware reports how many forwarding entries died with the peer;
        // disagreement means the host and firmware AST views diverged.
        let host_count = self.ast_flush_wds_entries(peer.arc());
        if host_count != ev.free_wds_count {
            state.stats.ast_mismatch_inc();
            error!(
                "peer {}: wds entry count mismatch, host {} fw {}",
                ev.mac, host_count, ev.free_wds_count
            );
        }
        // Remaining (self/static) entries die with the hardware peer.
        self.ast_free_peer_entries(peer.arc());

        let held = {
            let mut id_map = state.id_map.lock();
            id_map[ev.peer_id as usize].take()
        };
        peer.set_peer_id(PEER_ID_INVALID);
        self.peer_update_state(&peer, PeerState::Inactive);
        match held {
            Some(arc) => self.peer_unref(&arc, ModuleId::Htt),
            None => warn!("unmap for never-mapped peer id {}", ev.peer_id),
        }
    }

    /// Logically delete a peer. Consumes the creation hold; the object is
    /// finalized once firmware unmaps it and all other references drop.
    pub fn peer_delete(&self, peer: PeerRef) -> Result {
        info!("peer delete: {} vdev {}", peer.mac(), peer.vdev_id());
        self.peer_update_state(&peer, PeerState::LogicalDelete);
        self.peer_rx_cleanup(peer.arc());
        self.ast_delete_peer_entries(peer.arc());
        if peer.peer_id() != PEER_ID_INVALID {
            self.state().fw.peer_delete(peer.vdev_id(), peer.mac());
        }
        // Dropping the creation hold; never-mapped peers finalize here.
        drop(peer);
        Ok(())
    }

    pub(crate) fn peer_unref(&self, peer: &Arc<Peer>, mod_id: ModuleId) {
        let prev_mod = peer.mod_refs[mod_id.idx()].fetch_sub(1, Ordering::AcqRel);
        if prev_mod == 0 {
            peer.mod_refs[mod_id.idx()].fetch_add(1, Ordering::AcqRel);
            error!("peer {}: unbalanced unref for {:?}", peer.mac(), mod_id);
            return;
        }
        let prev = peer.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            self.peer_finalize(peer);
        }
    }

    /// Last reference gone: unlink from every table and release anything
    /// the peer still owns.
    fn peer_finalize(&self, peer: &Arc<Peer>) {
        let state = self.state();
        match peer.peer_type() {
            PeerType::Mld => {
                state.mld_hash.lock().remove(peer);
            }
            _ => {
                state.peer_hash.lock().remove(peer);
            }
        }
        let vdev = peer.vdev();
        vdev.peers.lock().retain(|p| !Arc::ptr_eq(p, peer));
        vdev.num_peers.fetch_sub(1, Ordering::AcqRel);

        // Any reorder queue still held goes through the async free path so
        // hardware cache state is handled identically to a normal delete.
        for tid in 0..MAX_TIDS {
            let mut rx_tid = peer.tids[tid].lock();
            if let Some(qdesc) = rx_tid.qdesc.take() {
                drop(rx_tid);
                self.reo_desc_free(ReoFreeDesc {
                    peer_mac: peer.mac(),
                    tid: tid as u8,
                    free_ts: Instant::now(),
                    resend_update_cmd: false,
                    qdesc,
                });
            }
        }

        self.peer_update_state(peer, PeerState::Freed);
        info!("peer freed: {}", peer.mac());
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            fw::{PeerMapEvent, PeerUnmapEvent},
            test_utils::{attach_sta_vdev, create_and_map_peer, mac, soc, FwCall},
        },
        assert_matches::assert_matches,
    };

    fn map_event(m: MacAddr, vdev_id: u8, peer_id: u16, hw: u16) -> PeerMapEvent {
        PeerMapEvent { peer_id, hw_peer_id: hw, vdev_id, mac: m, is_wds: false, ast_hash: 7 }
    }

    fn unmap_event(m: MacAddr, peer_id: u16) -> PeerUnmapEvent {
        PeerUnmapEvent { peer_id, vdev_id: 0, mac: m, is_wds: false, free_wds_count: 0 }
    }

    #[test]
    fn lifecycle_create_map_delete_unmap() {
        let (soc, fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        assert_eq!(peer.state(), PeerState::Init);
        assert_eq!(peer.peer_id(), PEER_ID_INVALID);

        soc.rx_peer_map_handler(map_event(mac(2), 0, 5, 100)).expect("map");
        assert_eq!(peer.state(), PeerState::Active);
        assert_eq!(peer.peer_id(), 5);

        let weak = Arc::downgrade(peer.arc());
        soc.peer_delete(peer).expect("delete");
        {
            let p = weak.upgrade().expect("still mapped");
            assert_eq!(p.state(), PeerState::LogicalDelete);
        }
        assert!(fw.calls().contains(&FwCall::PeerDelete { vdev_id: 0, peer_mac: mac(2) }));

        soc.rx_peer_unmap_handler(unmap_event(mac(2), 5));
        // Unmap released the last references; the object is gone.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn never_mapped_peer_frees_on_delete() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        let weak = Arc::downgrade(peer.arc());
        soc.peer_delete(peer).expect("delete");
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn find_skips_logically_deleted_peer() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        assert!(soc.peer_find(mac(2), Some(0), ModuleId::Misc).is_some());
        assert!(soc.peer_get_ref_by_id(5, ModuleId::Misc).is_some());

        soc.peer_delete(peer).expect("delete");
        assert!(soc.peer_find(mac(2), Some(0), ModuleId::Misc).is_none());
        assert!(soc.peer_get_ref_by_id(5, ModuleId::Misc).is_none());
        // Teardown paths can still reach it.
        assert!(soc.peer_get_ref_by_id_any(5, ModuleId::Misc).is_some());

        soc.rx_peer_unmap_handler(unmap_event(mac(2), 5));
    }

    #[test]
    fn module_refs_are_attributed() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        assert_eq!(peer.mod_ref_count(ModuleId::Config), 1);
        assert_eq!(peer.mod_ref_count(ModuleId::Htt), 1); // id-map hold

        let extra = soc.peer_find(mac(2), Some(0), ModuleId::Rx).expect("find");
        assert_eq!(extra.mod_ref_count(ModuleId::Rx), 1);
        assert_eq!(extra.total_refs(), 3);
        drop(extra);
        assert_eq!(peer.mod_ref_count(ModuleId::Rx), 0);
        assert_eq!(peer.total_refs(), 2);

        soc.peer_delete(peer).expect("delete");
        soc.rx_peer_unmap_handler(unmap_event(mac(2), 5));
    }

    #[test]
    fn cloned_ref_keeps_peer_alive_past_unmap() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        let held = soc.peer_find(mac(2), Some(0), ModuleId::Cm).expect("find");
        let weak = Arc::downgrade(held.arc());

        soc.peer_delete(peer).expect("delete");
        soc.rx_peer_unmap_handler(unmap_event(mac(2), 5));
        // Still alive through the Cm hold.
        {
            let p = weak.upgrade().expect("held");
            assert_eq!(p.state(), PeerState::Inactive);
        }
        drop(held);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn map_provisions_default_reorder_queues() {
        let (soc, fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let _peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        soc.rx_peer_map_handler(map_event(mac(2), 0, 5, 100)).expect("map");
        let tids: Vec<u8> = fw
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                FwCall::ReorderQueueSetup { ba_window_size: 1, tid, .. } => Some(tid),
                _ => None,
            })
            .collect();
        assert!(tids.contains(&0));
        assert!(tids.contains(&crate::NON_QOS_TID));
    }

    #[test]
    fn map_rejects_out_of_range_id() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let _peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        assert_matches!(
            soc.rx_peer_map_handler(map_event(mac(2), 0, u16::MAX - 1, 1)),
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(soc.stats().peer_map_err, 1);
    }

    #[test]
    fn map_for_deleted_peer_is_rejected() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        // Delete before the map event arrives.
        soc.peer_delete(peer).expect("delete");
        assert_matches!(soc.rx_peer_map_handler(map_event(mac(2), 0, 5, 1)), Err(Error::NotFound));
    }

    #[test]
    fn duplicate_map_is_idempotent() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        let refs = peer.total_refs();
        soc.rx_peer_map_handler(map_event(mac(2), 0, 5, 100)).expect("remap");
        assert_eq!(peer.total_refs(), refs);
        soc.peer_delete(peer).expect("delete");
        soc.rx_peer_unmap_handler(unmap_event(mac(2), 5));
    }

    #[test]
    fn map_conflicting_id_is_rejected() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let a = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        let _b = soc.peer_create(0, mac(3), PeerType::Legacy).expect("create");
        assert_matches!(
            soc.rx_peer_map_handler(map_event(mac(3), 0, 5, 101)),
            Err(Error::AlreadyExists)
        );
        soc.peer_delete(a).expect("delete");
        soc.rx_peer_unmap_handler(unmap_event(mac(2), 5));
    }

    #[test]
    fn unmap_unknown_id_is_tolerated() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        soc.rx_peer_unmap_handler(unmap_event(mac(9), 42));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let _peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        assert_matches!(
            soc.peer_create(0, mac(2), PeerType::Legacy),
            Err(Error::AlreadyExists)
        );
    }

    #[test]
    fn invalid_transition_is_counted_but_applied() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = soc.peer_create(0, mac(2), PeerType::Legacy).expect("create");
        // Inactive straight from Init is not a legal step.
        soc.peer_update_state(&peer, PeerState::Inactive);
        assert_eq!(peer.state(), PeerState::Inactive);
        assert_eq!(soc.stats().invalid_state_change, 1);
    }

    #[test]
    fn vdev_peers_snapshot() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let a = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        let _b = create_and_map_peer(&soc, 0, mac(3), 6, 101);
        assert_eq!(soc.vdev_peers(0, ModuleId::Misc).len(), 2);
        soc.peer_delete(a).expect("delete");
        assert_eq!(soc.vdev_peers(0, ModuleId::Misc).len(), 1);
    }
}

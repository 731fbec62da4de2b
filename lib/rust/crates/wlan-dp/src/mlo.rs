// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-link operation: the cross-chip SoC directory, per-MLD link
//! tables, and ML peer id handling.
//!
//! An MLD peer aggregates one link peer per participating radio. Link
//! peers keep their own hardware identity (peer id, AST entries) while the
//! shared RX reorder state lives on the MLD peer. ML-level peer ids carry
//! a tag bit so they can never collide with per-chip ids.

use {
    crate::{
        error::{Error, Result},
        fw::{MloPeerMapEvent, MloPeerUnmapEvent},
        mac::MacAddr,
        peer::{ModuleId, Peer, PeerRef, PeerState, PeerType},
        soc::{DpSoc, SocState},
    },
    log::{error, info, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU16, Ordering},
            Arc, Weak,
        },
    },
};

/// Tag bit distinguishing MLD-level peer ids from per-chip ids.
pub const ML_PEER_ID_VALID: u16 = 0x2000;

pub fn is_ml_peer_id(peer_id: u16) -> bool {
    peer_id & ML_PEER_ID_VALID != 0
}

/// One registered link of an MLD peer.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub link_id: u8,
    pub chip_id: u8,
    pub vdev_id: u8,
    pub mac: MacAddr,
    pub(crate) peer: Weak<Peer>,
}

/// Fixed-width link table carried by every peer; only MLD peers populate
/// it.
#[derive(Debug)]
pub(crate) struct LinkTable {
    slots: Vec<Option<LinkInfo>>,
}

impl LinkTable {
    pub(crate) fn new(max_links: usize) -> LinkTable {
        LinkTable { slots: (0..max_links).map(|_| None).collect() }
    }

    fn slot_for(&self, link_id: u8) -> Option<usize> {
        self.slots.iter().position(|s| s.as_ref().map(|l| l.link_id) == Some(link_id))
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn links(&self) -> Vec<LinkInfo> {
        self.slots.iter().filter_map(|s| s.clone()).collect()
    }
}

/// Directory of every attached SoC, shared across chips in a multi-link
/// group. Holds weak handles so a detached chip does not linger.
pub struct MloContext {
    socs: Mutex<HashMap<u8, Weak<SocState>>>,
    next_ml_id: AtomicU16,
}

impl Default for MloContext {
    fn default() -> Self {
        MloContext { socs: Mutex::new(HashMap::new()), next_ml_id: AtomicU16::new(1) }
    }
}

impl MloContext {
    pub fn new() -> Arc<MloContext> {
        Arc::new(MloContext::default())
    }

    pub(crate) fn register(&self, chip_id: u8, state: Weak<SocState>) {
        self.socs.lock().insert(chip_id, state);
    }

    pub fn soc(&self, chip_id: u8) -> Option<DpSoc> {
        self.socs.lock().get(&chip_id)?.upgrade().map(DpSoc::from_state)
    }

    fn live_socs(&self) -> Vec<DpSoc> {
        self.socs.lock().values().filter_map(|w| w.upgrade()).map(DpSoc::from_state).collect()
    }

    /// Allocate an MLD-level peer id with the ML tag bit set.
    pub fn alloc_ml_peer_id(&self) -> u16 {
        let n = self.next_ml_id.fetch_add(1, Ordering::AcqRel);
        (n & (ML_PEER_ID_VALID - 1)) | ML_PEER_ID_VALID
    }
}

impl DpSoc {
    /// Register `link` as link `link_id` of `mld`. The MLD holds the link
    /// via a weak handle; the link holds its MLD strongly, so the MLD
    /// outlives every link.
    pub fn mld_add_link(&self, mld: &PeerRef, link: &PeerRef, link_id: u8) -> Result {
        if mld.peer_type() != PeerType::Mld {
            return Err(Error::InvalidArgument("not an mld peer"));
        }
        if link.peer_type() != PeerType::MloLink {
            return Err(Error::InvalidArgument("not a link peer"));
        }
        {
            let mut links = mld.arc().links.lock();
            if links.slot_for(link_id).is_some() {
                return Err(Error::AlreadyExists);
            }
            let slot = links.free_slot().ok_or(Error::NoResources)?;
            links.slots[slot] = Some(LinkInfo {
                link_id,
                chip_id: link.chip_id(),
                vdev_id: link.vdev_id(),
                mac: link.mac(),
                peer: Arc::downgrade(link.arc()),
            });
        }
        // The MLD reference held by this link; released in mld_del_link.
        // Cannot fail, the caller's reference keeps the count nonzero.
        let ok = Peer::get_ref(mld.arc(), ModuleId::Mlo);
        debug_assert!(ok);
        *link.arc().mld.lock() = Some(mld.arc().clone());
        info!("mld {}: link {} added ({})", mld.mac(), link_id, link.mac());
        Ok(())
    }

    /// Unregister link `link_id` from `mld` and return how many links
    /// remain. The caller deletes the MLD peer once the count hits zero.
    pub fn mld_del_link(&self, mld: &PeerRef, link_id: u8) -> Result<usize> {
        if mld.peer_type() != PeerType::Mld {
            return Err(Error::InvalidArgument("not an mld peer"));
        }
        let info = {
            let mut links = mld.arc().links.lock();
            let slot = links.slot_for(link_id).ok_or(Error::NotFound)?;
            links.slots[slot].take()
        };
        let remaining = mld.arc().links.lock().count();
        if let Some(info) = info {
            if let Some(link) = info.peer.upgrade() {
                *link.mld.lock() = None;
            }
            self.peer_unref(mld.arc(), ModuleId::Mlo);
        }
        info!("mld {}: link {} removed, {} remaining", mld.mac(), link_id, remaining);
        Ok(remaining)
    }

    /// Live link peers of an MLD.
    pub fn get_link_peers(&self, mld: &Arc<Peer>) -> Vec<Arc<Peer>> {
        mld.links.lock().links().into_iter().filter_map(|l| l.peer.upgrade()).collect()
    }

    /// (vdev, link MAC) pairs for firmware operations that must reach
    /// every link of the MLD.
    pub(crate) fn link_peer_endpoints(&self, mld: &Arc<Peer>) -> Vec<(u8, MacAddr)> {
        mld.links.lock().links().into_iter().map(|l| (l.vdev_id, l.mac)).collect()
    }

    /// Resolve a peer id that may belong to any chip in the group: the ML
    /// id space first, then the local chip, then the other chips.
    pub fn get_tgt_peer_by_id(&self, peer_id: u16, mod_id: ModuleId) -> Option<PeerRef> {
        if is_ml_peer_id(peer_id) {
            return self.ml_peer_get_ref(peer_id, mod_id);
        }
        if let Some(r) = self.peer_get_ref_by_id(peer_id, mod_id) {
            return Some(r);
        }
        let ctx = self.state().mlo.as_ref()?;
        for soc in ctx.live_socs() {
            if soc.chip_id() == self.chip_id() {
                continue;
            }
            if let Some(r) = soc.peer_get_ref_by_id(peer_id, mod_id) {
                return Some(r);
            }
        }
        None
    }

    /// As [`DpSoc::get_tgt_peer_by_id`], keyed by MAC.
    pub fn get_tgt_peer_by_mac(&self, mac: MacAddr, mod_id: ModuleId) -> Option<PeerRef> {
        if let Some(r) = self.peer_find(mac, None, mod_id) {
            return Some(r);
        }
        let ctx = self.state().mlo.as_ref()?;
        for soc in ctx.live_socs() {
            if soc.chip_id() == self.chip_id() {
                continue;
            }
            if let Some(r) = soc.peer_find(mac, None, mod_id) {
                return Some(r);
            }
        }
        None
    }

    fn ml_peer_get_ref(&self, ml_peer_id: u16, mod_id: ModuleId) -> Option<PeerRef> {
        let state = self.state();
        let map = state.ml_id_map.lock();
        let peer = map.get(&ml_peer_id)?;
        if peer.state() >= PeerState::LogicalDelete {
            return None;
        }
        self.take_peer_ref(peer, mod_id)
    }

    /// Firmware associated an ML peer id with an MLD MAC.
    pub fn mlo_peer_map_handler(&self, ev: MloPeerMapEvent) -> Result {
        let state = self.state();
        if !is_ml_peer_id(ev.ml_peer_id) {
            error!("ml peer map with untagged id {:#x}", ev.ml_peer_id);
            state.stats.peer_map_err_inc();
            return Err(Error::InvalidArgument("ml peer id missing tag bit"));
        }
        let mld = self.mld_peer_find(ev.mld_mac, ModuleId::Mlo).ok_or_else(|| {
            state.stats.peer_map_err_inc();
            error!("ml peer map for unknown mld {}", ev.mld_mac);
            Error::NotFound
        })?;
        {
            let mut map = state.ml_id_map.lock();
            match map.get(&ev.ml_peer_id) {
                Some(existing) if Arc::ptr_eq(existing, mld.arc()) => return Ok(()),
                Some(_) => {
                    state.stats.peer_map_err_inc();
                    error!("ml peer id {:#x} already mapped", ev.ml_peer_id);
                    return Err(Error::AlreadyExists);
                }
                None => {}
            }
            let ok = Peer::get_ref(mld.arc(), ModuleId::Mlo);
            debug_assert!(ok);
            map.insert(ev.ml_peer_id, mld.arc().clone());
        }
        mld.arc().set_peer_id(ev.ml_peer_id);
        self.peer_update_state(&mld, PeerState::Active);
        info!("ml peer map: {} id {:#x}", ev.mld_mac, ev.ml_peer_id);
        Ok(())
    }

    /// Firmware released an ML peer id.
    pub fn mlo_peer_unmap_handler(&self, ev: MloPeerUnmapEvent) {
        let state = self.state();
        let held = state.ml_id_map.lock().remove(&ev.ml_peer_id);
        let mld = match held {
            Some(p) => p,
            None => {
                warn!("ml peer unmap for unknown id {:#x}", ev.ml_peer_id);
                return;
            }
        };
        mld.set_peer_id(crate::PEER_ID_INVALID);
        self.peer_update_state(&mld, PeerState::Inactive);
        info!("ml peer unmap: {} id {:#x}", mld.mac(), ev.ml_peer_id);
        self.peer_unref(&mld, ModuleId::Mlo);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            rx_tid::BaStatus,
            test_utils::{attach_sta_vdev, create_and_map_peer, mac, soc_with_mlo, FwCall},
            SocConfig,
        },
        assert_matches::assert_matches,
    };

    fn mld_with_two_links(
        soc: &DpSoc,
    ) -> (PeerRef, PeerRef, PeerRef) {
        attach_sta_vdev(soc, 0, mac(1));
        attach_sta_vdev(soc, 1, mac(4));
        let mld = soc.peer_create(0, mac(20), PeerType::Mld).expect("mld");
        let link0 = soc.peer_create_link(0, mac(2), 5, 100);
        let link1 = soc.peer_create_link(1, mac(3), 6, 101);
        soc.mld_add_link(&mld, &link0, 0).expect("link 0");
        soc.mld_add_link(&mld, &link1, 1).expect("link 1");
        (mld, link0, link1)
    }

    // Small shim so the helper above reads cleanly.
    impl DpSoc {
        fn peer_create_link(&self, vdev_id: u8, m: MacAddr, peer_id: u16, hw: u16) -> PeerRef {
            let peer = self.peer_create(vdev_id, m, PeerType::MloLink).expect("create link");
            self.rx_peer_map_handler(crate::fw::PeerMapEvent {
                peer_id,
                hw_peer_id: hw,
                vdev_id,
                mac: m,
                is_wds: false,
                ast_hash: 7,
            })
            .expect("map link");
            peer
        }
    }

    #[test]
    fn ml_peer_ids_carry_tag_bit() {
        let ctx = MloContext::new();
        let a = ctx.alloc_ml_peer_id();
        let b = ctx.alloc_ml_peer_id();
        assert!(is_ml_peer_id(a));
        assert!(is_ml_peer_id(b));
        assert_ne!(a, b);
        assert!(!is_ml_peer_id(5));
    }

    #[test]
    fn link_registration_and_teardown() {
        let ctx = MloContext::new();
        let (soc, _fw, _ring) = soc_with_mlo(SocConfig::default(), ctx, 0);
        let (mld, link0, _link1) = mld_with_two_links(&soc);

        assert_eq!(soc.get_link_peers(mld.arc()).len(), 2);
        assert!(Arc::ptr_eq(
            link0.arc().mld.lock().as_ref().expect("mld set"),
            mld.arc()
        ));

        assert_matches!(soc.mld_add_link(&mld, &link0, 0), Err(Error::AlreadyExists));
        assert_eq!(soc.mld_del_link(&mld, 0).expect("del"), 1);
        assert!(link0.arc().mld.lock().is_none());
        assert_eq!(soc.mld_del_link(&mld, 1).expect("del"), 0);
        assert_matches!(soc.mld_del_link(&mld, 1), Err(Error::NotFound));
        // All links gone; the MLD can be deleted.
        soc.peer_delete(mld).expect("delete mld");
    }

    #[test]
    fn link_table_capacity_enforced() {
        let ctx = MloContext::new();
        let config = SocConfig { max_mlo_links: 1, ..SocConfig::default() };
        let (soc, _fw, _ring) = soc_with_mlo(config, ctx, 0);
        attach_sta_vdev(&soc, 0, mac(1));
        let mld = soc.peer_create(0, mac(20), PeerType::Mld).expect("mld");
        let link0 = soc.peer_create_link(0, mac(2), 5, 100);
        let link1 = soc.peer_create_link(0, mac(3), 6, 101);
        soc.mld_add_link(&mld, &link0, 0).expect("fits");
        assert_matches!(soc.mld_add_link(&mld, &link1, 1), Err(Error::NoResources));
    }

    #[test]
    fn rx_state_lives_on_mld_peer() {
        let ctx = MloContext::new();
        let (soc, fw, _ring) = soc_with_mlo(SocConfig::default(), ctx, 0);
        let (mld, link0, link1) = mld_with_two_links(&soc);

        // ADDBA arriving on one link lands on the MLD's shared state.
        soc.addba_request_process(&link0, 4, 7, 64, 0).expect("req");
        soc.addba_resp_tx_completion(&link0, 4, true).expect("commit");
        assert_eq!(mld.arc().tids[4].lock().ba_status, BaStatus::Active);

        // The other link sees the same session.
        assert_matches!(
            soc.addba_request_process(&link1, 4, 8, 64, 0),
            Err(Error::AlreadyExists)
        );

        // The queue was published once per link.
        let setups = fw
            .calls()
            .iter()
            .filter(|c| matches!(c, FwCall::ReorderQueueSetup { tid: 4, .. }))
            .count();
        assert_eq!(setups, 2);
    }

    #[test]
    fn ml_peer_map_and_unmap() {
        let ctx = MloContext::new();
        let (soc, _fw, _ring) = soc_with_mlo(SocConfig::default(), ctx.clone(), 0);
        let (mld, _link0, _link1) = mld_with_two_links(&soc);
        let ml_id = ctx.alloc_ml_peer_id();

        soc.mlo_peer_map_handler(MloPeerMapEvent { ml_peer_id: ml_id, mld_mac: mac(20) })
            .expect("map");
        assert_eq!(mld.peer_id(), ml_id);
        assert!(soc.get_tgt_peer_by_id(ml_id, ModuleId::Misc).is_some());

        // Remap of the same pair is idempotent; a conflict is not.
        soc.mlo_peer_map_handler(MloPeerMapEvent { ml_peer_id: ml_id, mld_mac: mac(20) })
            .expect("idempotent");
        attach_sta_vdev(&soc, 2, mac(9));
        let _other = soc.peer_create(2, mac(21), PeerType::Mld).expect("other mld");
        assert_matches!(
            soc.mlo_peer_map_handler(MloPeerMapEvent { ml_peer_id: ml_id, mld_mac: mac(21) }),
            Err(Error::AlreadyExists)
        );

        soc.mlo_peer_unmap_handler(MloPeerUnmapEvent { ml_peer_id: ml_id });
        assert!(soc.get_tgt_peer_by_id(ml_id, ModuleId::Misc).is_none());
        assert_eq!(mld.peer_id(), crate::PEER_ID_INVALID);
    }

    #[test]
    fn untagged_ml_map_rejected() {
        let ctx = MloContext::new();
        let (soc, _fw, _ring) = soc_with_mlo(SocConfig::default(), ctx, 0);
        assert_matches!(
            soc.mlo_peer_map_handler(MloPeerMapEvent { ml_peer_id: 7, mld_mac: mac(20) }),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn target_lookup_reaches_other_chips() {
        let ctx = MloContext::new();
        let (soc_a, _fw_a, _ring_a) = soc_with_mlo(SocConfig::default(), ctx.clone(), 0);
        let (soc_b, _fw_b, _ring_b) = soc_with_mlo(SocConfig::default(), ctx.clone(), 1);
        attach_sta_vdev(&soc_b, 0, mac(1));
        let _peer = create_and_map_peer(&soc_b, 0, mac(2), 5, 100);

        // A lookup on chip 0 falls through to chip 1.
        let found = soc_a.get_tgt_peer_by_id(5, ModuleId::Misc).expect("cross-chip by id");
        assert_eq!(found.mac(), mac(2));
        let found = soc_a.get_tgt_peer_by_mac(mac(2), ModuleId::Misc).expect("cross-chip by mac");
        assert_eq!(found.peer_id(), 5);
        assert!(ctx.soc(1).is_some());
        assert!(ctx.soc(7).is_none());
    }
}

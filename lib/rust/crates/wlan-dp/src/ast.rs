// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host mirror of the hardware address search table (AST).
//!
//! Entries live in an index-keyed arena; a MAC-keyed bucket map and a
//! hardware-index vector point into it. Forwarding (WDS) entries are known
//! to firmware and delete in two phases: the host marks the entry, asks
//! firmware to drop it, and frees the slot only when the matching unmap
//! event confirms hardware no longer uses the index.

use {
    crate::{
        error::{Error, Result},
        mac::MacAddr,
        peer::{Peer, PeerRef, PeerState},
        soc::DpSoc,
        HW_PEER_ID_INVALID,
    },
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        sync::{Arc, Weak},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AstEntryId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstType {
    /// Plain hardware entry for a peer MAC.
    Static,
    /// The vdev's own address.
    SelfEntry,
    /// The BSS peer as seen from a STA vdev.
    StaBss,
    /// Learned 4-address forwarding entry.
    Wds,
    /// Host-managed forwarding entry.
    WdsHm,
    /// Host-managed secondary entry; may duplicate a MAC.
    WdsHmSec,
    /// Destination-address entry for intra-BSS forwarding.
    Da,
}

impl AstType {
    /// Entry types firmware tracks individually and must be told about.
    pub fn is_forwarding(self) -> bool {
        matches!(self, AstType::Wds | AstType::WdsHm | AstType::WdsHmSec | AstType::Da)
    }

    fn is_host_managed(self) -> bool {
        matches!(self, AstType::WdsHm | AstType::WdsHmSec)
    }
}

/// Invoked once the entry's slot is actually released.
pub(crate) type AstFreeCb = Box<dyn FnOnce(&DpSoc) + Send>;

pub(crate) struct AstEntry {
    pub mac: MacAddr,
    pub entry_type: AstType,
    pub peer: Weak<Peer>,
    pub peer_mac: MacAddr,
    pub vdev_id: u8,
    pub pdev_id: u8,
    pub next_hop: bool,
    pub is_active: bool,
    pub is_mapped: bool,
    pub ast_idx: u16,
    pub ast_hash: u16,
    pub delete_in_progress: bool,
    pub callback: Option<AstFreeCb>,
}

/// Read-only view of an AST entry for callers outside the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AstInfo {
    pub mac: MacAddr,
    pub entry_type: AstType,
    pub peer_mac: MacAddr,
    pub vdev_id: u8,
    pub ast_idx: u16,
    pub is_mapped: bool,
    pub delete_in_progress: bool,
}

pub(crate) struct AstTable {
    slots: Vec<Option<AstEntry>>,
    free_ids: Vec<usize>,
    by_mac: HashMap<MacAddr, Vec<usize>>,
    /// Hardware index -> arena slot, sized to the hardware table.
    hw: Vec<Option<usize>>,
    count: usize,
}

impl AstTable {
    pub(crate) fn new(max_entries: usize) -> AstTable {
        AstTable {
            slots: Vec::new(),
            free_ids: Vec::new(),
            by_mac: HashMap::new(),
            hw: vec![None; max_entries],
            count: 0,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    fn insert(&mut self, entry: AstEntry) -> AstEntryId {
        let mac = entry.mac;
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.slots[id] = Some(entry);
                id
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.by_mac.entry(mac).or_default().push(id);
        self.count += 1;
        AstEntryId(id)
    }

    fn get(&self, id: AstEntryId) -> Option<&AstEntry> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: AstEntryId) -> Option<&mut AstEntry> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn ids_for_mac(&self, mac: MacAddr) -> Vec<AstEntryId> {
        self.by_mac.get(&mac).map(|v| v.iter().map(|&i| AstEntryId(i)).collect()).unwrap_or_default()
    }

    /// Duplicate detection: per-pdev when the hardware supports AST
    /// override, SoC-wide otherwise.
    fn find_dup(&self, mac: MacAddr, pdev_scope: Option<u8>) -> Option<AstEntryId> {
        for id in self.ids_for_mac(mac) {
            let entry = self.get(id)?;
            match pdev_scope {
                Some(pdev) if entry.pdev_id != pdev => continue,
                _ => return Some(id),
            }
        }
        None
    }

    /// Remove an entry from the arena and every index pointing at it.
    /// Idempotent: a second unlink of the same id is a no-op.
    fn unlink(&mut self, id: AstEntryId) -> Option<AstEntry> {
        let entry = self.slots.get_mut(id.0)?.take()?;
        if let Some(bucket) = self.by_mac.get_mut(&entry.mac) {
            bucket.retain(|&i| i != id.0);
            if bucket.is_empty() {
                self.by_mac.remove(&entry.mac);
            }
        }
        if entry.is_mapped {
            if let Some(slot) = self.hw.get_mut(entry.ast_idx as usize) {
                *slot = None;
            }
        }
        self.free_ids.push(id.0);
        self.count -= 1;
        Some(entry)
    }
}

impl DpSoc {
    /// Add an AST entry owned by `peer`. Forwarding types are pushed to
    /// firmware; others are installed by firmware as part of peer map and
    /// only mirrored here.
    pub fn add_ast(&self, peer: &PeerRef, mac: MacAddr, entry_type: AstType, flags: u32) -> Result {
        self.add_ast_inner(peer.arc(), mac, entry_type, flags)
    }

    pub(crate) fn add_ast_inner(
        &self,
        peer: &Arc<Peer>,
        mac: MacAddr,
        entry_type: AstType,
        flags: u32,
    ) -> Result {
        let state = self.state();
        // MLD peers have no hardware presence; their links carry the
        // entries.
        if peer.peer_type() == crate::peer::PeerType::Mld {
            return Ok(());
        }
        let vdev = peer.vdev().clone();

        let mut table = state.ast.lock();
        if table.count() >= state.config.max_ast_entries {
            error!("ast table full ({} entries), cannot add {}", table.count(), mac);
            return Err(Error::NoResources);
        }

        let scope = if state.config.ast_override_support { Some(vdev.pdev_id) } else { None };
        if let Some(dup_id) = table.find_dup(mac, scope) {
            let dup = table.get_mut(dup_id).ok_or(Error::Failure)?;
            let both_hm_sec =
                dup.entry_type == AstType::WdsHmSec && entry_type == AstType::WdsHmSec;
            if !both_hm_sec {
                if dup.delete_in_progress {
                    if entry_type.is_host_managed() {
                        // Recreate once firmware confirms the pending
                        // delete; the caller retries via the callback.
                        let peer_weak = Arc::downgrade(peer);
                        dup.callback = Some(Box::new(move |soc| {
                            let peer = match peer_weak.upgrade() {
                                Some(p) if p.state() < PeerState::LogicalDelete => p,
                                _ => return,
                            };
                            if let Err(e) = soc.add_ast_inner(&peer, mac, entry_type, flags) {
                                warn!("deferred ast re-add for {} failed: {}", mac, e);
                            }
                        }));
                    }
                    return Err(Error::Busy);
                }
                return Err(Error::AlreadyExists);
            }
        }

        let next_hop = entry_type.is_forwarding();
        let id = table.insert(AstEntry {
            mac,
            entry_type,
            peer: Arc::downgrade(peer),
            peer_mac: peer.mac(),
            vdev_id: vdev.vdev_id,
            pdev_id: vdev.pdev_id,
            next_hop,
            is_active: true,
            is_mapped: false,
            ast_idx: HW_PEER_ID_INVALID,
            ast_hash: 0,
            delete_in_progress: false,
            callback: None,
        });
        peer.ast_list.lock().push(id);
        state.stats.ast_added_inc();
        debug!("ast add: {} type {:?} peer {}", mac, entry_type, peer.mac());

        if next_hop {
            drop(table);
            if let Err(e) = state.fw.add_wds_entry(vdev.vdev_id, peer.mac(), mac, flags) {
                error!("fw wds add for {} failed: {}", mac, e);
                let mut table = state.ast.lock();
                self.ast_unlink_locked(&mut table, id);
                return Err(Error::Failure);
            }
        }
        Ok(())
    }

    /// Firmware reported the hardware index for an entry. An index in the
    /// skid region means the hardware could not place it; the entry is
    /// dropped and the control plane notified.
    pub(crate) fn map_ast(
        &self,
        peer: &Arc<Peer>,
        mac: MacAddr,
        ast_idx: u16,
        ast_hash: u16,
        entry_type: AstType,
    ) -> Result {
        let state = self.state();
        if ast_idx == HW_PEER_ID_INVALID {
            warn!("ast map for {} landed in skid, dropping entry", mac);
            let unlinked = {
                let mut table = state.ast.lock();
                let id = table
                    .ids_for_mac(mac)
                    .into_iter()
                    .find(|&i| table.get(i).map_or(false, |e| e.peer.ptr_eq(&Arc::downgrade(peer))))
                    .or_else(|| table.ids_for_mac(mac).into_iter().next());
                id.map(|id| self.ast_unlink_locked(&mut table, id))
            };
            state.stats.ast_map_err_inc();
            state.fw.notify_ast_deleted(peer.vdev_id(), mac, entry_type);
            if let Some(cb) = unlinked {
                state.stats.ast_deleted_inc();
                if let Some(cb) = cb {
                    cb(self);
                }
            }
            return Err(Error::InvalidArgument("ast index in skid"));
        }

        let mut table = state.ast.lock();
        if ast_idx as usize >= state.config.max_ast_entries {
            state.stats.ast_map_err_inc();
            return Err(Error::InvalidArgument("ast index out of range"));
        }
        let id = table
            .ids_for_mac(mac)
            .into_iter()
            .find(|&i| table.get(i).map_or(false, |e| !e.is_mapped))
            .or_else(|| table.ids_for_mac(mac).into_iter().next())
            .ok_or_else(|| {
                state.stats.ast_map_err_inc();
                error!("ast map for unknown mac {}", mac);
                Error::NotFound
            })?;
        let slot = id.0;
        let entry = table.get_mut(id).ok_or(Error::Failure)?;
        entry.ast_idx = ast_idx;
        entry.ast_hash = ast_hash;
        entry.is_mapped = true;
        table.hw[ast_idx as usize] = Some(slot);
        debug!("ast map: {} -> hw index {}", mac, ast_idx);
        Ok(())
    }

    /// Re-home a forwarding entry to a new peer (station roamed between
    /// nodes behind different peers).
    pub fn update_ast(&self, new_peer: &PeerRef, wds_mac: MacAddr) -> Result {
        let state = self.state();
        let (vdev_id, peer_mac) = {
            let mut table = state.ast.lock();
            let id =
                table.ids_for_mac(wds_mac).into_iter().next().ok_or(Error::NotFound)?;
            let entry = table.get_mut(id).ok_or(Error::NotFound)?;
            // Fixed entries never move.
            if matches!(
                entry.entry_type,
                AstType::Static | AstType::SelfEntry | AstType::StaBss
            ) {
                return Ok(());
            }
            if entry.delete_in_progress {
                return Err(Error::Busy);
            }
            if let Some(old) = entry.peer.upgrade() {
                if Arc::ptr_eq(&old, new_peer.arc()) {
                    debug!("redundant ast update for {}", wds_mac);
                    return Ok(());
                }
                old.ast_list.lock().retain(|&i| i != id);
            }
            entry.peer = Arc::downgrade(new_peer.arc());
            entry.peer_mac = new_peer.mac();
            entry.vdev_id = new_peer.vdev_id();
            entry.is_active = true;
            new_peer.arc().ast_list.lock().push(id);
            (new_peer.vdev_id(), new_peer.mac())
        };
        state
            .fw
            .update_wds_entry(vdev_id, peer_mac, wds_mac, 0)
            .map_err(|_| Error::Failure)
    }

    /// Start deleting an entry. Mapped entries wait for firmware's unmap
    /// confirmation; unmapped ones free immediately. Repeated deletes of
    /// the same entry are no-ops.
    pub fn del_ast(&self, wds_mac: MacAddr) -> Result {
        let state = self.state();
        enum Next {
            FwDelete(u8, AstType),
            Freed(Option<AstFreeCb>),
        }
        let next = {
            let mut table = state.ast.lock();
            let id = table
                .ids_for_mac(wds_mac)
                .into_iter()
                .find(|&i| table.get(i).map_or(false, |e| !e.delete_in_progress))
                .or_else(|| table.ids_for_mac(wds_mac).into_iter().next())
                .ok_or(Error::NotFound)?;
            let entry = table.get_mut(id).ok_or(Error::NotFound)?;
            if entry.delete_in_progress {
                return Ok(());
            }
            entry.delete_in_progress = true;
            if entry.is_mapped {
                if entry.next_hop {
                    Next::FwDelete(entry.vdev_id, entry.entry_type)
                } else {
                    // Freed together with the peer at unmap.
                    return Ok(());
                }
            } else {
                Next::Freed(self.ast_unlink_locked(&mut table, id))
            }
        };
        match next {
            Next::FwDelete(vdev_id, entry_type) => {
                state.fw.del_wds_entry(vdev_id, wds_mac, entry_type);
            }
            Next::Freed(cb) => {
                state.stats.ast_deleted_inc();
                if let Some(cb) = cb {
                    cb(self);
                }
            }
        }
        Ok(())
    }

    /// Unmap confirmation for a single entry: release the slot.
    pub(crate) fn ast_free_by_mac(&self, mac: MacAddr) -> Result {
        let state = self.state();
        let cb = {
            let mut table = state.ast.lock();
            let id = table
                .ids_for_mac(mac)
                .into_iter()
                .find(|&i| table.get(i).map_or(false, |e| e.delete_in_progress))
                .or_else(|| table.ids_for_mac(mac).into_iter().next())
                .ok_or(Error::NotFound)?;
            self.ast_unlink_locked(&mut table, id)
        };
        state.stats.ast_deleted_inc();
        info!("ast freed: {}", mac);
        if let Some(cb) = cb {
            cb(self);
        }
        Ok(())
    }

    /// Drop all forwarding entries owned by `peer` and return how many
    /// there were, for the cross-check against firmware's count.
    pub(crate) fn ast_flush_wds_entries(&self, peer: &Arc<Peer>) -> u32 {
        let state = self.state();
        let mut callbacks = Vec::new();
        let mut count = 0;
        {
            let mut table = state.ast.lock();
            let ids: Vec<AstEntryId> = peer.ast_list.lock().clone();
            for id in ids {
                let is_wds = table.get(id).map_or(false, |e| e.next_hop);
                if !is_wds {
                    continue;
                }
                if let Some(cb) = self.ast_unlink_locked(&mut table, id) {
                    callbacks.push(cb);
                }
                count += 1;
                state.stats.ast_deleted_inc();
            }
        }
        for cb in callbacks {
            cb(self);
        }
        count
    }

    /// Release every remaining entry owned by `peer`; the hardware indexes
    /// died with the peer's unmap.
    pub(crate) fn ast_free_peer_entries(&self, peer: &Arc<Peer>) {
        let state = self.state();
        let mut callbacks = Vec::new();
        {
            let mut table = state.ast.lock();
            let ids: Vec<AstEntryId> = peer.ast_list.lock().clone();
            for id in ids {
                if table.get(id).is_none() {
                    continue;
                }
                if let Some(cb) = self.ast_unlink_locked(&mut table, id) {
                    callbacks.push(cb);
                }
                state.stats.ast_deleted_inc();
            }
        }
        for cb in callbacks {
            cb(self);
        }
    }

    /// Logical-delete pass over a peer's entries: forwarding entries go
    /// through the firmware two-phase delete, everything else either waits
    /// for unmap (if mapped) or frees now.
    pub(crate) fn ast_delete_peer_entries(&self, peer: &Arc<Peer>) {
        let state = self.state();
        let mut fw_deletes = Vec::new();
        let mut callbacks = Vec::new();
        {
            let mut table = state.ast.lock();
            let ids: Vec<AstEntryId> = peer.ast_list.lock().clone();
            for id in ids {
                let (mapped, next_hop, mac, vdev_id, entry_type, deleting) = match table.get(id) {
                    Some(e) => (
                        e.is_mapped,
                        e.next_hop,
                        e.mac,
                        e.vdev_id,
                        e.entry_type,
                        e.delete_in_progress,
                    ),
                    None => continue,
                };
                if deleting {
                    continue;
                }
                if mapped {
                    if let Some(e) = table.get_mut(id) {
                        e.delete_in_progress = true;
                    }
                    if next_hop {
                        fw_deletes.push((vdev_id, mac, entry_type));
                    }
                } else {
                    if let Some(cb) = self.ast_unlink_locked(&mut table, id) {
                        callbacks.push(cb);
                    }
                    state.stats.ast_deleted_inc();
                }
            }
        }
        for (vdev_id, mac, entry_type) in fw_deletes {
            state.fw.del_wds_entry(vdev_id, mac, entry_type);
        }
        for cb in callbacks {
            cb(self);
        }
    }

    /// Public lookup for control-plane consumers and tests.
    pub fn ast_entry_info(&self, mac: MacAddr) -> Option<AstInfo> {
        let state = self.state();
        let table = state.ast.lock();
        let id = table.ids_for_mac(mac).into_iter().next()?;
        let e = table.get(id)?;
        Some(AstInfo {
            mac: e.mac,
            entry_type: e.entry_type,
            peer_mac: e.peer_mac,
            vdev_id: e.vdev_id,
            ast_idx: e.ast_idx,
            is_mapped: e.is_mapped,
            delete_in_progress: e.delete_in_progress,
        })
    }

    pub fn ast_entry_count(&self) -> usize {
        self.state().ast.lock().count()
    }

    /// Unlink an entry from the arena and its owner. Returns the free
    /// callback; the caller must invoke it after releasing the table lock.
    fn ast_unlink_locked(
        &self,
        table: &mut AstTable,
        id: AstEntryId,
    ) -> Option<AstFreeCb> {
        let mut entry = table.unlink(id)?;
        if let Some(owner) = entry.peer.upgrade() {
            owner.ast_list.lock().retain(|&i| i != id);
        }
        entry.callback.take()
    }
}

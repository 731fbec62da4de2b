// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The firmware command/event boundary. The driver shim implements
//! [`FirmwareOps`] on top of its WMI/HTT transport; tests implement it
//! with recording fakes.

use crate::{ast::AstType, error::Result, mac::MacAddr, rx_tid::PnSize};

/// Commands the datapath sends towards firmware, plus control-plane
/// notifications it raises on firmware-originated AST teardown.
pub trait FirmwareOps: Send + Sync {
    /// Install a WDS (4-address forwarding) entry behind `peer_mac`.
    fn add_wds_entry(
        &self,
        vdev_id: u8,
        peer_mac: MacAddr,
        wds_mac: MacAddr,
        flags: u32,
    ) -> Result;

    /// Re-home an existing WDS entry to `peer_mac`.
    fn update_wds_entry(
        &self,
        vdev_id: u8,
        peer_mac: MacAddr,
        wds_mac: MacAddr,
        flags: u32,
    ) -> Result;

    /// Ask firmware to remove a WDS entry. Completion arrives later as a
    /// peer-unmap event carrying `wds_mac`.
    fn del_wds_entry(&self, vdev_id: u8, wds_mac: MacAddr, entry_type: AstType);

    /// Point the hardware RX reorder queue for (`peer_mac`, `tid`) at the
    /// descriptor located at `qdesc_paddr`.
    fn reorder_queue_setup(
        &self,
        vdev_id: u8,
        peer_mac: MacAddr,
        tid: u8,
        qdesc_paddr: u64,
        ba_window_size: u16,
        pn_size: PnSize,
    ) -> Result;

    /// Transmit a DELBA action frame to `peer_mac` for `tid`.
    fn send_delba(&self, vdev_id: u8, peer_mac: MacAddr, tid: u8, reason_code: u16) -> Result;

    /// Request deletion of a peer in firmware. Firmware answers with a
    /// peer-unmap event.
    fn peer_delete(&self, vdev_id: u8, peer_mac: MacAddr);

    /// Control-plane notification that an AST entry is gone without ever
    /// having been usable (e.g. the hardware index landed in the skid).
    fn notify_ast_deleted(&self, vdev_id: u8, wds_mac: MacAddr, entry_type: AstType);
}

/// Firmware peer-map event. `is_wds` marks the AST-only variant that adds
/// a hardware entry to an already mapped peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerMapEvent {
    pub peer_id: u16,
    pub hw_peer_id: u16,
    pub vdev_id: u8,
    pub mac: MacAddr,
    pub is_wds: bool,
    pub ast_hash: u16,
}

/// Firmware peer-unmap event. For the non-WDS variant, `free_wds_count`
/// carries firmware's count of forwarding entries it released with the
/// peer, cross-checked against the host table.
#[derive(Debug, Clone, Copy)]
pub struct PeerUnmapEvent {
    pub peer_id: u16,
    pub vdev_id: u8,
    pub mac: MacAddr,
    pub is_wds: bool,
    pub free_wds_count: u32,
}

/// Firmware MLO peer-map event, associating an MLD-level peer id with the
/// MLD MAC address.
#[derive(Debug, Clone, Copy)]
pub struct MloPeerMapEvent {
    pub ml_peer_id: u16,
    pub mld_mac: MacAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct MloPeerUnmapEvent {
    pub ml_peer_id: u16,
}

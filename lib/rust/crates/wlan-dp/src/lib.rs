// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side datapath peer management for a Wi-Fi SoC driver: the peer
//! object table, hardware address-search-table (AST) mirror, per-TID RX
//! reorder queues backed by REO hardware descriptors, and multi-link (MLO)
//! peer aggregation.
//!
//! Firmware and hardware interactions go through the traits in [`fw`] and
//! [`reo`]; everything else is plain host state guarded by short-lived
//! locks.

pub mod ast;
pub mod config;
pub mod error;
pub mod fw;
pub mod mac;
pub mod mlo;
pub mod peer;
pub mod reo;
pub mod rx_tid;
pub mod soc;

#[cfg(test)]
pub mod test_utils;

pub use {
    config::SocConfig,
    error::{Error, Result},
    mac::MacAddr,
    peer::{ModuleId, Peer, PeerRef, PeerState, PeerType},
    soc::DpSoc,
};

/// TIDs 0..=15 plus the non-QoS TID.
pub const MAX_TIDS: usize = 17;
pub const NON_QOS_TID: u8 = 16;

/// Sequence numbers are 12 bits; any larger start_seq means "leave SSN
/// untouched".
pub const SEQ_MAX: u16 = 1 << 12;

/// Reported by firmware when the hardware peer/AST index allocation landed
/// in the skid region and no real index exists.
pub const HW_PEER_ID_INVALID: u16 = 0xffff;

/// Peer id value for a peer that is not currently mapped by firmware.
pub const PEER_ID_INVALID: u16 = 0xffff;

// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording fakes for the firmware and REO ring boundaries, plus setup
//! helpers shared by the unit tests.

use {
    crate::{
        ast::AstType,
        error::{Error, Result},
        fw::{FirmwareOps, PeerMapEvent},
        mac::MacAddr,
        mlo::MloContext,
        peer::{PeerRef, PeerType},
        reo::{
            DescMemory, IdentityMemory, ReoCommand, ReoCompletion, ReoRing, ReoStatus, RingFull,
        },
        rx_tid::PnSize,
        soc::{DpSoc, OpMode},
        SocConfig,
    },
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Every firmware interaction, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FwCall {
    AddWds { vdev_id: u8, peer_mac: MacAddr, wds_mac: MacAddr, flags: u32 },
    UpdateWds { vdev_id: u8, peer_mac: MacAddr, wds_mac: MacAddr },
    DelWds { vdev_id: u8, wds_mac: MacAddr },
    ReorderQueueSetup { vdev_id: u8, peer_mac: MacAddr, tid: u8, ba_window_size: u16 },
    SendDelba { vdev_id: u8, peer_mac: MacAddr, tid: u8, reason_code: u16 },
    PeerDelete { vdev_id: u8, peer_mac: MacAddr },
    AstDeleted { vdev_id: u8, wds_mac: MacAddr, entry_type: AstType },
}

#[derive(Default)]
pub struct FakeFw {
    calls: Mutex<Vec<FwCall>>,
    pub fail_add_wds: AtomicBool,
    pub fail_queue_setup: AtomicBool,
}

impl FakeFw {
    pub fn calls(&self) -> Vec<FwCall> {
        self.calls.lock().clone()
    }
}

impl FirmwareOps for FakeFw {
    fn add_wds_entry(&self, vdev_id: u8, peer_mac: MacAddr, wds_mac: MacAddr, flags: u32) -> Result {
        if self.fail_add_wds.load(Ordering::SeqCst) {
            return Err(Error::Failure);
        }
        self.calls.lock().push(FwCall::AddWds { vdev_id, peer_mac, wds_mac, flags });
        Ok(())
    }

    fn update_wds_entry(
        &self,
        vdev_id: u8,
        peer_mac: MacAddr,
        wds_mac: MacAddr,
        _flags: u32,
    ) -> Result {
        self.calls.lock().push(FwCall::UpdateWds { vdev_id, peer_mac, wds_mac });
        Ok(())
    }

    fn del_wds_entry(&self, vdev_id: u8, wds_mac: MacAddr, _entry_type: AstType) {
        self.calls.lock().push(FwCall::DelWds { vdev_id, wds_mac });
    }

    fn reorder_queue_setup(
        &self,
        vdev_id: u8,
        peer_mac: MacAddr,
        tid: u8,
        _qdesc_paddr: u64,
        ba_window_size: u16,
        _pn_size: PnSize,
    ) -> Result {
        if self.fail_queue_setup.load(Ordering::SeqCst) {
            return Err(Error::Failure);
        }
        self.calls.lock().push(FwCall::ReorderQueueSetup { vdev_id, peer_mac, tid, ba_window_size });
        Ok(())
    }

    fn send_delba(&self, vdev_id: u8, peer_mac: MacAddr, tid: u8, reason_code: u16) -> Result {
        self.calls.lock().push(FwCall::SendDelba { vdev_id, peer_mac, tid, reason_code });
        Ok(())
    }

    fn peer_delete(&self, vdev_id: u8, peer_mac: MacAddr) {
        self.calls.lock().push(FwCall::PeerDelete { vdev_id, peer_mac });
    }

    fn notify_ast_deleted(&self, vdev_id: u8, wds_mac: MacAddr, entry_type: AstType) {
        self.calls.lock().push(FwCall::AstDeleted { vdev_id, wds_mac, entry_type });
    }
}

/// Command ring fake. Accepted commands queue up with their completions;
/// tests drive them with [`FakeRing::complete_next`]. Completions may
/// re-enter `send`, so the internal lock is never held across a callback.
#[derive(Default)]
pub struct FakeRing {
    pending: Mutex<VecDeque<(ReoCommand, Option<ReoCompletion>)>>,
    log: Mutex<Vec<ReoCommand>>,
    full: AtomicBool,
}

impl FakeRing {
    pub fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }

    /// Every command the ring ever accepted.
    pub fn commands(&self) -> Vec<ReoCommand> {
        self.log.lock().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete the oldest outstanding command with `status`; returns the
    /// command, or `None` when nothing is outstanding.
    pub fn complete_next(&self, soc: &DpSoc, status: ReoStatus) -> Option<ReoCommand> {
        let (cmd, done) = self.pending.lock().pop_front()?;
        if let Some(done) = done {
            done(soc, status);
        }
        Some(cmd)
    }
}

impl ReoRing for FakeRing {
    fn send(&self, cmd: ReoCommand, done: Option<ReoCompletion>) -> std::result::Result<(), RingFull> {
        if self.full.load(Ordering::SeqCst) {
            return Err(RingFull { cmd, done });
        }
        self.log.lock().push(cmd.clone());
        self.pending.lock().push_back((cmd, done));
        Ok(())
    }
}

pub fn mac(n: u8) -> MacAddr {
    MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, n])
}

pub fn soc() -> (DpSoc, Arc<FakeFw>, Arc<FakeRing>) {
    soc_with(SocConfig::default())
}

pub fn soc_with(config: SocConfig) -> (DpSoc, Arc<FakeFw>, Arc<FakeRing>) {
    build_soc(config, None, 0)
}

pub fn soc_with_mlo(
    config: SocConfig,
    ctx: Arc<MloContext>,
    chip_id: u8,
) -> (DpSoc, Arc<FakeFw>, Arc<FakeRing>) {
    build_soc(config, Some(ctx), chip_id)
}

fn build_soc(
    config: SocConfig,
    mlo: Option<Arc<MloContext>>,
    chip_id: u8,
) -> (DpSoc, Arc<FakeFw>, Arc<FakeRing>) {
    let fw = Arc::new(FakeFw::default());
    let ring = Arc::new(FakeRing::default());
    let soc = DpSoc::new(
        config,
        chip_id,
        fw.clone(),
        ring.clone(),
        Arc::new(IdentityMemory) as Arc<dyn DescMemory>,
        mlo,
    );
    (soc, fw, ring)
}

pub fn attach_sta_vdev(soc: &DpSoc, vdev_id: u8, vdev_mac: MacAddr) {
    soc.vdev_attach(vdev_id, 0, vdev_mac, OpMode::Sta).expect("vdev attach");
}

/// Create a legacy peer and run the firmware map event for it.
pub fn create_and_map_peer(
    soc: &DpSoc,
    vdev_id: u8,
    peer_mac: MacAddr,
    peer_id: u16,
    hw_peer_id: u16,
) -> PeerRef {
    let peer = soc.peer_create(vdev_id, peer_mac, PeerType::Legacy).expect("peer create");
    soc.rx_peer_map_handler(PeerMapEvent {
        peer_id,
        hw_peer_id,
        vdev_id,
        mac: peer_mac,
        is_wds: false,
        ast_hash: 7,
    })
    .expect("peer map");
    peer
}

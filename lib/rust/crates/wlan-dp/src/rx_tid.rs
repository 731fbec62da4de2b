// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-TID RX reorder queues and block-ack session handling.
//!
//! Each peer owns one reorder queue per TID, backed by a hardware
//! descriptor. ADDBA negotiation is split the way the firmware interface
//! splits it: the request is recorded, the response goes out, and only the
//! response's tx completion commits the session. The peer-global hardware
//! buffer size latches when the first session commits; a later small
//! window on a high TID forces existing 256-deep sessions down via DELBA.

use {
    crate::{
        error::{Error, Result},
        peer::{Peer, PeerRef, PeerType},
        reo::{alloc_qdesc, QueueDescriptor, QueueUpdate, ReoCommand, ReoCompletion, ReoFreeDesc},
        soc::DpSoc,
        MAX_TIDS, SEQ_MAX,
    },
    log::{debug, error, warn},
    std::{sync::Arc, time::Instant},
};

pub const ADDBA_STATUS_SUCCESS: u16 = 0;
/// IEEE Std 802.11 status code 37, "request declined".
pub const ADDBA_STATUS_REFUSED: u16 = 37;
/// IEEE Std 802.11 reason code 38: peer must re-negotiate QoS setup.
pub const DELBA_REASON_QOS_SETUP_REQUIRED: u16 = 38;

/// Packet-number check width programmed into the reorder queue, derived
/// from the pairwise cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnSize {
    None,
    Pn24,
    Pn48,
    Pn128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaStatus {
    Inactive,
    /// ADDBA response sent, waiting for its tx completion.
    InProgress,
    Active,
}

/// Snapshot handed to the response frame builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddbaResponse {
    pub dialog_token: u8,
    pub status_code: u16,
    pub ba_win_size: u16,
    pub start_seq: u16,
}

#[derive(Debug)]
pub struct RxTid {
    pub tid: u8,
    pub ba_status: BaStatus,
    pub ba_win_size: u16,
    pub dialog_token: u8,
    pub status_code: u16,
    /// Control-plane override applied to outgoing ADDBA responses.
    pub user_status_code: Option<u16>,
    pub start_seq: u16,
    /// Forced window for this TID; `Some(1)` refuses sessions outright.
    pub ba_win_size_override: Option<u16>,
    pub delba_tx_ongoing: bool,
    pub delba_tx_retry: u8,
    pub delba_reason_code: u16,
    pub num_addba_req: u32,
    pub num_addba_resp_failed: u32,
    pub num_delba_req: u32,
    pub(crate) qdesc: Option<QueueDescriptor>,
}

impl RxTid {
    pub(crate) fn new(tid: u8) -> RxTid {
        RxTid {
            tid,
            ba_status: BaStatus::Inactive,
            ba_win_size: 0,
            dialog_token: 0,
            status_code: ADDBA_STATUS_SUCCESS,
            user_status_code: None,
            start_seq: 0,
            ba_win_size_override: None,
            delba_tx_ongoing: false,
            delba_tx_retry: 0,
            delba_reason_code: 0,
            num_addba_req: 0,
            num_addba_resp_failed: 0,
            num_delba_req: 0,
            qdesc: None,
        }
    }

    fn reset_session(&mut self) {
        self.ba_status = BaStatus::Inactive;
        self.dialog_token = 0;
        self.status_code = ADDBA_STATUS_SUCCESS;
        self.delba_tx_ongoing = false;
        self.delba_tx_retry = 0;
    }
}

/// Peer-global block-ack bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct BaAggregate {
    /// 0 until the first committed session latches 64 or 256.
    pub hw_buffer_size: u16,
    pub kill_256_sessions: bool,
    pub active_ba_session_cnt: u16,
}

impl DpSoc {
    /// RX state of a link peer lives on its MLD peer.
    fn effective_peer(&self, peer: &Arc<Peer>) -> Arc<Peer> {
        if peer.peer_type() == PeerType::MloLink {
            if let Some(mld) = peer.mld.lock().clone() {
                return mld;
            }
        }
        peer.clone()
    }

    fn check_tid(tid: u8) -> Result {
        if (tid as usize) < MAX_TIDS {
            Ok(())
        } else {
            Err(Error::InvalidArgument("tid"))
        }
    }

    /// Firmware endpoints that must learn about this peer's queue: every
    /// link of an MLD, or the peer itself.
    fn queue_endpoints(&self, owner: &Arc<Peer>, requester: &PeerRef) -> Vec<(u8, crate::MacAddr)> {
        if owner.peer_type() == PeerType::Mld {
            let eps = self.link_peer_endpoints(owner);
            if !eps.is_empty() {
                return eps;
            }
        }
        vec![(requester.vdev_id(), requester.mac())]
    }

    /// Allocate and publish the reorder queue for (`peer`, `tid`). If the
    /// queue already exists this degrades to an in-place update.
    pub fn rx_tid_setup(
        &self,
        peer: &PeerRef,
        tid: u8,
        ba_win_size: u16,
        start_seq: u16,
    ) -> Result {
        Self::check_tid(tid)?;
        let state = self.state();
        let owner = self.effective_peer(peer.arc());

        // While firmware owns the peer during a roam handoff the host must
        // not touch its queues.
        if *peer.vdev().roaming_peer_mac.lock() == Some(peer.mac()) {
            return Err(Error::NotPermitted);
        }

        {
            let rx_tid = owner.tids[tid as usize].lock();
            if rx_tid.qdesc.is_some() {
                drop(rx_tid);
                return self.rx_tid_update_inner(&owner, tid, ba_win_size, start_seq, false);
            }
        }

        let pn = *owner.security.lock();
        let qdesc = alloc_qdesc(
            state.mem.as_ref(),
            ba_win_size,
            pn,
            state.config.qdesc_min_paddr,
            state.config.qdesc_alloc_retries,
        )?;
        let paddr = qdesc.paddr();
        {
            let mut rx_tid = owner.tids[tid as usize].lock();
            if rx_tid.qdesc.is_some() {
                // Raced with another setup; keep the existing queue.
                return Ok(());
            }
            rx_tid.ba_win_size = ba_win_size;
            rx_tid.start_seq = start_seq;
            rx_tid.qdesc = Some(qdesc);
        }

        for (vdev_id, mac) in self.queue_endpoints(&owner, peer) {
            if let Err(e) =
                state.fw.reorder_queue_setup(vdev_id, mac, tid, paddr, ba_win_size, pn)
            {
                error!("reorder queue setup failed for {} tid {}: {}", mac, tid, e);
                // Hardware never saw the address; safe to free inline.
                owner.tids[tid as usize].lock().qdesc = None;
                return Err(Error::Failure);
            }
        }
        debug!("rx tid setup: {} tid {} win {}", owner.mac(), tid, ba_win_size);
        Ok(())
    }

    /// Update window size and (optionally) the starting sequence number of
    /// an existing queue. `start_seq` at or above `SEQ_MAX` leaves the SSN
    /// untouched. `bar_update` marks updates triggered by a BAR frame,
    /// which must not re-validate the queue.
    pub fn rx_tid_update(
        &self,
        peer: &PeerRef,
        tid: u8,
        ba_win_size: u16,
        start_seq: u16,
        bar_update: bool,
    ) -> Result {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        if *peer.vdev().roaming_peer_mac.lock() == Some(peer.mac()) {
            return Err(Error::NotPermitted);
        }
        self.rx_tid_update_inner(&owner, tid, ba_win_size, start_seq, bar_update)
    }

    pub(crate) fn rx_tid_update_inner(
        &self,
        owner: &Arc<Peer>,
        tid: u8,
        ba_win_size: u16,
        start_seq: u16,
        bar_update: bool,
    ) -> Result {
        let state = self.state();
        if *owner.vdev().roaming_peer_mac.lock() == Some(owner.mac()) {
            return Err(Error::NotPermitted);
        }
        let paddr;
        let ssn;
        {
            let mut rx_tid = owner.tids[tid as usize].lock();
            paddr = match &rx_tid.qdesc {
                Some(q) => q.paddr(),
                None => return Err(Error::NotFound),
            };
            rx_tid.ba_win_size = ba_win_size;
            ssn = if start_seq < SEQ_MAX {
                rx_tid.start_seq = start_seq;
                Some(start_seq)
            } else {
                None
            };
        }
        let update = QueueUpdate {
            ba_window_size: Some(ba_win_size),
            ssn,
            valid: if bar_update { None } else { Some(true) },
        };
        let mac = owner.mac();
        let done: ReoCompletion = Box::new(move |_soc, status| {
            if status != crate::reo::ReoStatus::Success {
                warn!("rx queue update for {} tid {} completed {:?}", mac, tid, status);
            }
        });
        if state.reo.send(ReoCommand::UpdateRxQueue { paddr, update }, Some(done)).is_err() {
            state.stats.reo_cmd_send_fail_inc();
            error!("reo ring full, queue update dropped for {} tid {}", owner.mac(), tid);
            return Err(Error::Failure);
        }
        Ok(())
    }

    /// Tear down the queue for (`peer`, `tid`). The in-memory state is
    /// invalidated immediately; the descriptor follows the asynchronous
    /// invalidate/flush path before its memory is released.
    pub fn rx_tid_delete(&self, peer: &PeerRef, tid: u8) -> Result {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        self.rx_tid_delete_inner(&owner, tid)
    }

    pub(crate) fn rx_tid_delete_inner(&self, owner: &Arc<Peer>, tid: u8) -> Result {
        let qdesc = {
            let mut rx_tid = owner.tids[tid as usize].lock();
            let qdesc = match rx_tid.qdesc.take() {
                Some(q) => q,
                None => return Ok(()),
            };
            rx_tid.reset_session();
            rx_tid.ba_win_size = 0;
            qdesc
        };
        self.reo_desc_free(ReoFreeDesc {
            peer_mac: owner.mac(),
            tid,
            free_ts: Instant::now(),
            resend_update_cmd: false,
            qdesc,
        });
        Ok(())
    }

    /// Tear down all RX state for a peer being deleted.
    pub(crate) fn peer_rx_cleanup(&self, peer: &Arc<Peer>) {
        let owner = self.effective_peer(peer);
        // Only the owner of the queues drops them; a link peer going away
        // does not invalidate the MLD's RX state.
        if !Arc::ptr_eq(&owner, peer) {
            return;
        }
        for tid in 0..MAX_TIDS as u8 {
            let was_active =
                owner.tids[tid as usize].lock().ba_status == BaStatus::Active;
            if was_active {
                let mut ba = owner.ba.lock();
                ba.active_ba_session_cnt = ba.active_ba_session_cnt.saturating_sub(1);
            }
            let _ = self.rx_tid_delete_inner(&owner, tid);
        }
    }

    /// Record an incoming ADDBA request and decide the window we will
    /// offer in the response. The session itself commits on the response's
    /// tx completion.
    pub fn addba_request_process(
        &self,
        peer: &PeerRef,
        tid: u8,
        dialog_token: u8,
        ba_win_size: u16,
        start_seq: u16,
    ) -> Result {
        Self::check_tid(tid)?;
        let state = self.state();
        let owner = self.effective_peer(peer.arc());

        {
            let mut rx_tid = owner.tids[tid as usize].lock();
            rx_tid.num_addba_req += 1;
            match rx_tid.ba_status {
                BaStatus::InProgress => return Err(Error::Busy),
                BaStatus::Active => return Err(Error::AlreadyExists),
                BaStatus::Inactive => {}
            }
            rx_tid.dialog_token = dialog_token;
            rx_tid.start_seq = start_seq;
            rx_tid.status_code = ADDBA_STATUS_SUCCESS;

            let disabled = state.config.ba_disabled_tid_mask & (1 << tid) != 0
                || rx_tid.ba_win_size_override == Some(1);
            if disabled {
                rx_tid.ba_win_size = 1;
                rx_tid.status_code = ADDBA_STATUS_REFUSED;
                debug!("ba session refused for {} tid {}", owner.mac(), tid);
                return Ok(());
            }
        }

        let requested = {
            let rx_tid = owner.tids[tid as usize].lock();
            match rx_tid.ba_win_size_override {
                Some(forced) => forced,
                None => ba_win_size,
            }
        };
        let effective = self.check_ba_buffer_size(&owner, tid, requested);

        let mut rx_tid = owner.tids[tid as usize].lock();
        rx_tid.ba_win_size = effective;
        rx_tid.ba_status = BaStatus::InProgress;
        Ok(())
    }

    /// The window policy for high TIDs: once any session has committed,
    /// the peer's hardware buffer size is fixed; a later small request
    /// under a 256-deep latch flips it to 64 and marks the existing big
    /// sessions for teardown when the new session commits.
    fn check_ba_buffer_size(&self, owner: &Arc<Peer>, tid: u8, requested: u16) -> u16 {
        let state = self.state();
        if tid < state.config.per_tid_basize_max_tid {
            // Low TIDs negotiate their window independently.
            return requested;
        }
        let mut ba = owner.ba.lock();
        if ba.active_ba_session_cnt == 0 {
            return requested;
        }
        match ba.hw_buffer_size {
            64 => requested.min(64),
            256 if requested <= 64 => {
                ba.hw_buffer_size = 64;
                ba.kill_256_sessions = true;
                requested
            }
            _ => requested.min(256),
        }
    }

    /// DELBA every high-TID session still running a >64 window. Low TIDs
    /// keep their windows; the shared buffer depth binds only TIDs at or
    /// above the threshold.
    fn teardown_256_sessions(&self, owner: &Arc<Peer>) {
        let state = self.state();
        for tid in state.config.per_tid_basize_max_tid..MAX_TIDS as u8 {
            let send = {
                let mut rx_tid = owner.tids[tid as usize].lock();
                if rx_tid.ba_status == BaStatus::Active && rx_tid.ba_win_size > 64 {
                    rx_tid.delba_tx_ongoing = true;
                    rx_tid.delba_tx_retry = 0;
                    rx_tid.delba_reason_code = DELBA_REASON_QOS_SETUP_REQUIRED;
                    true
                } else {
                    false
                }
            };
            if send {
                if let Err(e) = state.fw.send_delba(
                    owner.vdev_id(),
                    owner.mac(),
                    tid,
                    DELBA_REASON_QOS_SETUP_REQUIRED,
                ) {
                    warn!("delba tx failed for {} tid {}: {}", owner.mac(), tid, e);
                }
            }
        }
    }

    /// Fields for the outgoing ADDBA response frame. A control-plane
    /// status override, if set, replaces the negotiated status.
    pub fn addba_response_setup(&self, peer: &PeerRef, tid: u8) -> Result<AddbaResponse> {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        let rx_tid = owner.tids[tid as usize].lock();
        Ok(AddbaResponse {
            dialog_token: rx_tid.dialog_token,
            status_code: rx_tid.user_status_code.unwrap_or(rx_tid.status_code),
            ba_win_size: rx_tid.ba_win_size,
            start_seq: rx_tid.start_seq,
        })
    }

    /// Force the status code of subsequent ADDBA responses on this TID.
    pub fn set_addba_response_status(&self, peer: &PeerRef, tid: u8, status_code: u16) -> Result {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        owner.tids[tid as usize].lock().user_status_code = Some(status_code);
        Ok(())
    }

    /// Tx completion of the ADDBA response. Success commits the session,
    /// pushes the final window to hardware, and finishes any latch flip
    /// recorded at request time; failure reverts the TID to window 1.
    pub fn addba_resp_tx_completion(&self, peer: &PeerRef, tid: u8, tx_ok: bool) -> Result {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        let (win, ssn) = {
            let mut rx_tid = owner.tids[tid as usize].lock();
            let status = rx_tid.user_status_code.unwrap_or(rx_tid.status_code);
            if !tx_ok || status != ADDBA_STATUS_SUCCESS {
                rx_tid.num_addba_resp_failed += 1;
                rx_tid.ba_status = BaStatus::Inactive;
                rx_tid.ba_win_size = 1;
                debug!("addba response for {} tid {} not committed", owner.mac(), tid);
                return Ok(());
            }
            if rx_tid.ba_status != BaStatus::InProgress {
                return Err(Error::NotPermitted);
            }
            (rx_tid.ba_win_size, rx_tid.start_seq)
        };

        match self.rx_tid_update_inner(&owner, tid, win, ssn, false) {
            Ok(()) => {}
            // First session on this TID: the queue does not exist yet.
            Err(Error::NotFound) => self.rx_tid_setup(peer, tid, win, ssn)?,
            Err(e) => return Err(e),
        }

        owner.tids[tid as usize].lock().ba_status = BaStatus::Active;
        let kill = {
            let mut ba = owner.ba.lock();
            if ba.active_ba_session_cnt == 0 {
                // First committed session fixes the shared buffer depth.
                ba.hw_buffer_size = if win > 64 { 256 } else { 64 };
            }
            ba.active_ba_session_cnt += 1;
            std::mem::take(&mut ba.kill_256_sessions)
        };
        if kill {
            self.teardown_256_sessions(&owner);
        }
        Ok(())
    }

    /// Peer-initiated DELBA: tear the session down and shrink the queue
    /// window to 1.
    pub fn delba_process(&self, peer: &PeerRef, tid: u8, reason_code: u16) -> Result {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        let was_active = {
            let mut rx_tid = owner.tids[tid as usize].lock();
            rx_tid.num_delba_req += 1;
            rx_tid.delba_reason_code = reason_code;
            let was_active = rx_tid.ba_status == BaStatus::Active;
            rx_tid.ba_status = BaStatus::Inactive;
            was_active
        };
        if was_active {
            let mut ba = owner.ba.lock();
            ba.active_ba_session_cnt = ba.active_ba_session_cnt.saturating_sub(1);
        }
        match self.rx_tid_update_inner(&owner, tid, 1, SEQ_MAX, false) {
            Ok(()) | Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tx completion of a host-initiated DELBA. Failures retry up to the
    /// configured cap; success finishes the teardown started in
    /// [`DpSoc::teardown_256_sessions`].
    pub fn delba_tx_completion(&self, peer: &PeerRef, tid: u8, tx_ok: bool) -> Result {
        Self::check_tid(tid)?;
        let state = self.state();
        let owner = self.effective_peer(peer.arc());

        if !tx_ok {
            let resend = {
                let mut rx_tid = owner.tids[tid as usize].lock();
                if rx_tid.delba_tx_ongoing && rx_tid.delba_tx_retry < state.config.max_delba_retry
                {
                    rx_tid.delba_tx_retry += 1;
                    Some(rx_tid.delba_reason_code)
                } else {
                    rx_tid.delba_tx_ongoing = false;
                    rx_tid.delba_tx_retry = 0;
                    None
                }
            };
            if let Some(reason) = resend {
                if let Err(e) = state.fw.send_delba(owner.vdev_id(), owner.mac(), tid, reason) {
                    warn!("delba retry failed for {} tid {}: {}", owner.mac(), tid, e);
                }
            }
            return Ok(());
        }

        let was_active = {
            let mut rx_tid = owner.tids[tid as usize].lock();
            if !rx_tid.delba_tx_ongoing {
                return Ok(());
            }
            rx_tid.delba_tx_ongoing = false;
            rx_tid.delba_tx_retry = 0;
            let was_active = rx_tid.ba_status == BaStatus::Active;
            rx_tid.ba_status = BaStatus::Inactive;
            was_active
        };
        if was_active {
            let mut ba = owner.ba.lock();
            ba.active_ba_session_cnt = ba.active_ba_session_cnt.saturating_sub(1);
        }
        match self.rx_tid_update_inner(&owner, tid, 1, SEQ_MAX, false) {
            Ok(()) | Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Adjust the bookkeeping window without touching hardware, for paths
    /// that already updated the queue out of band.
    pub fn rx_tid_update_ba_win_size(&self, peer: &PeerRef, tid: u8, ba_win_size: u16) -> Result {
        Self::check_tid(tid)?;
        let owner = self.effective_peer(peer.arc());
        owner.tids[tid as usize].lock().ba_win_size = ba_win_size;
        Ok(())
    }

    /// Fire a queue-stats query for debugging; the result is logged from
    /// the completion.
    pub fn rx_queue_stats(&self, peer: &PeerRef, tid: u8) -> Result {
        Self::check_tid(tid)?;
        let state = self.state();
        let owner = self.effective_peer(peer.arc());
        let paddr = match &owner.tids[tid as usize].lock().qdesc {
            Some(q) => q.paddr(),
            None => return Err(Error::NotFound),
        };
        let mac = owner.mac();
        let done: ReoCompletion = Box::new(move |_soc, status| {
            debug!("queue stats for {} tid {}: {:?}", mac, tid, status);
        });
        if state.reo.send(ReoCommand::GetQueueStats { paddr }, Some(done)).is_err() {
            state.stats.reo_cmd_send_fail_inc();
            return Err(Error::Failure);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            fw::PeerUnmapEvent,
            reo::ReoStatus,
            test_utils::{attach_sta_vdev, create_and_map_peer, mac, soc, soc_with, FwCall},
            SocConfig,
        },
        assert_matches::assert_matches,
    };

    fn fast_free_config() -> SocConfig {
        SocConfig { reo_desc_free_defer_ms: 0, ..SocConfig::default() }
    }

    fn establish_session(
        soc: &crate::DpSoc,
        peer: &PeerRef,
        tid: u8,
        win: u16,
        ssn: u16,
    ) {
        soc.addba_request_process(peer, tid, 1, win, ssn).expect("addba req");
        soc.addba_resp_tx_completion(peer, tid, true).expect("addba done");
    }

    #[test]
    fn setup_publishes_queue_to_firmware() {
        let (soc, fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 4, 64, 10).expect("setup");
        let setups: Vec<_> = fw
            .calls()
            .into_iter()
            .filter(|c| matches!(c, FwCall::ReorderQueueSetup { tid: 4, .. }))
            .collect();
        assert_eq!(setups.len(), 1);
        assert_matches!(
            setups[0],
            FwCall::ReorderQueueSetup { vdev_id: 0, peer_mac, tid: 4, ba_window_size: 64 }
                if peer_mac == mac(2)
        );
    }

    #[test]
    fn setup_twice_becomes_update() {
        let (soc, _fw, ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 10).expect("setup");
        soc.rx_tid_setup(&peer, 0, 128, 20).expect("re-setup");
        let cmds = ring.commands();
        assert!(cmds.iter().any(|c| matches!(
            c,
            ReoCommand::UpdateRxQueue { update: QueueUpdate { ba_window_size: Some(128), ssn: Some(20), valid: Some(true) }, .. }
        )));
    }

    #[test]
    fn update_keeps_ssn_with_sentinel() {
        let (soc, _fw, ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 10).expect("setup");
        soc.rx_tid_update(&peer, 0, 32, SEQ_MAX, false).expect("update");
        let cmds = ring.commands();
        assert!(cmds.iter().any(|c| matches!(
            c,
            ReoCommand::UpdateRxQueue { update: QueueUpdate { ba_window_size: Some(32), ssn: None, .. }, .. }
        )));
    }

    #[test]
    fn bar_update_does_not_revalidate() {
        let (soc, _fw, ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 10).expect("setup");
        soc.rx_tid_update(&peer, 0, 64, 42, true).expect("bar update");
        let cmds = ring.commands();
        assert!(cmds.iter().any(|c| matches!(
            c,
            ReoCommand::UpdateRxQueue { update: QueueUpdate { ssn: Some(42), valid: None, .. }, .. }
        )));
    }

    #[test]
    fn roaming_peer_queue_writes_rejected() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.set_vdev_roaming_peer(0, Some(mac(2))).expect("set");
        assert_matches!(soc.rx_tid_setup(&peer, 0, 64, 10), Err(Error::NotPermitted));
        assert_matches!(soc.rx_tid_update(&peer, 0, 64, 10, false), Err(Error::NotPermitted));
        soc.set_vdev_roaming_peer(0, None).expect("clear");
        soc.rx_tid_setup(&peer, 0, 64, 10).expect("setup allowed again");
    }

    #[test]
    fn addba_commits_only_on_tx_completion() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.addba_request_process(&peer, 4, 7, 64, 0).expect("req");
        let resp = soc.addba_response_setup(&peer, 4).expect("resp");
        assert_eq!(resp.dialog_token, 7);
        assert_eq!(resp.status_code, ADDBA_STATUS_SUCCESS);

        // Concurrent negotiation is rejected while in progress.
        assert_matches!(soc.addba_request_process(&peer, 4, 8, 64, 0), Err(Error::Busy));

        soc.addba_resp_tx_completion(&peer, 4, true).expect("commit");
        assert_matches!(soc.addba_request_process(&peer, 4, 9, 64, 0), Err(Error::AlreadyExists));
    }

    #[test]
    fn addba_failed_tx_reverts_session() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.addba_request_process(&peer, 4, 7, 64, 0).expect("req");
        soc.addba_resp_tx_completion(&peer, 4, false).expect("failed tx");
        // The window collapses to 1 and negotiation can start over.
        let resp = soc.addba_response_setup(&peer, 4).expect("resp");
        assert_eq!(resp.ba_win_size, 1);
        soc.addba_request_process(&peer, 4, 8, 64, 0).expect("retry");
    }

    #[test]
    fn disabled_tid_refuses_session() {
        let config = SocConfig { ba_disabled_tid_mask: 1 << 3, ..SocConfig::default() };
        let (soc, _fw, _ring) = soc_with(config);
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.addba_request_process(&peer, 3, 7, 64, 0).expect("req");
        let resp = soc.addba_response_setup(&peer, 3).expect("resp");
        assert_eq!(resp.status_code, ADDBA_STATUS_REFUSED);
        assert_eq!(resp.ba_win_size, 1);
        // The refused response never commits a session.
        soc.addba_resp_tx_completion(&peer, 3, true).expect("completion");
        let again = soc.addba_request_process(&peer, 3, 8, 64, 0);
        assert_matches!(again, Ok(()));
    }

    #[test]
    fn user_status_override_applies_to_response() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.set_addba_response_status(&peer, 5, ADDBA_STATUS_REFUSED).expect("override");
        soc.addba_request_process(&peer, 5, 7, 64, 0).expect("req");
        let resp = soc.addba_response_setup(&peer, 5).expect("resp");
        assert_eq!(resp.status_code, ADDBA_STATUS_REFUSED);
        soc.addba_resp_tx_completion(&peer, 5, true).expect("completion");
        // Override forces a revert, no session.
        soc.addba_request_process(&peer, 5, 8, 64, 0).expect("free to retry");
    }

    #[test]
    fn small_window_after_256_latch_kills_big_sessions() {
        let (soc, fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        // TID 9 is above the per-TID threshold (8): latches 256 on commit.
        establish_session(&soc, &peer, 9, 256, 0);
        // A 64-deep request on another high TID flips the latch, but the
        // teardown waits until the new session actually commits.
        soc.addba_request_process(&peer, 10, 2, 64, 0).expect("req");
        assert!(!fw.calls().iter().any(|c| matches!(c, FwCall::SendDelba { .. })));

        soc.addba_resp_tx_completion(&peer, 10, true).expect("new session");
        assert!(fw.calls().contains(&FwCall::SendDelba {
            vdev_id: 0,
            peer_mac: mac(2),
            tid: 9,
            reason_code: DELBA_REASON_QOS_SETUP_REQUIRED,
        }));
        // Completion of the DELBA finishes the teardown.
        soc.delba_tx_completion(&peer, 9, true).expect("delba done");
    }

    #[test]
    fn teardown_spares_low_tid_sessions() {
        let (soc, fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        // The first committed session sits below the threshold and still
        // latches the shared buffer depth at 256.
        establish_session(&soc, &peer, 2, 256, 0);
        establish_session(&soc, &peer, 9, 256, 0);

        soc.addba_request_process(&peer, 10, 3, 64, 0).expect("req");
        soc.addba_resp_tx_completion(&peer, 10, true).expect("commit");

        // Only the high-TID 256 session comes down; TID 2 negotiated its
        // window independently and keeps it.
        assert!(fw
            .calls()
            .iter()
            .any(|c| matches!(c, FwCall::SendDelba { tid: 9, .. })));
        assert!(!fw
            .calls()
            .iter()
            .any(|c| matches!(c, FwCall::SendDelba { tid: 2, .. })));
        assert_eq!(soc.addba_response_setup(&peer, 2).expect("resp").ba_win_size, 256);
    }

    #[test]
    fn latched_64_clamps_later_requests() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        establish_session(&soc, &peer, 9, 32, 0);
        soc.addba_request_process(&peer, 10, 2, 256, 0).expect("req");
        let resp = soc.addba_response_setup(&peer, 10).expect("resp");
        assert_eq!(resp.ba_win_size, 64);
    }

    #[test]
    fn low_tid_window_not_clamped() {
        let (soc, _fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        establish_session(&soc, &peer, 9, 32, 0);
        // TID 2 sits below per_tid_basize_max_tid and keeps its request.
        soc.addba_request_process(&peer, 2, 2, 256, 0).expect("req");
        let resp = soc.addba_response_setup(&peer, 2).expect("resp");
        assert_eq!(resp.ba_win_size, 256);
    }

    #[test]
    fn delba_retry_caps_out() {
        let (soc, fw, _ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        establish_session(&soc, &peer, 9, 256, 0);
        // Flipping the latch and committing the new session sends the
        // first DELBA for TID 9.
        soc.addba_request_process(&peer, 10, 2, 64, 0).expect("req");
        soc.addba_resp_tx_completion(&peer, 10, true).expect("trigger teardown");
        let base = fw
            .calls()
            .iter()
            .filter(|c| matches!(c, FwCall::SendDelba { tid: 9, .. }))
            .count();
        assert_eq!(base, 1);
        // Each failed completion retries until the cap (3), then stops.
        for _ in 0..5 {
            soc.delba_tx_completion(&peer, 9, false).expect("completion");
        }
        let total = fw
            .calls()
            .iter()
            .filter(|c| matches!(c, FwCall::SendDelba { tid: 9, .. }))
            .count();
        assert_eq!(total, 1 + 3);
    }

    #[test]
    fn peer_initiated_delba_shrinks_window() {
        let (soc, _fw, ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        establish_session(&soc, &peer, 4, 64, 0);
        soc.delba_process(&peer, 4, 37).expect("delba");
        let cmds = ring.commands();
        assert!(cmds.iter().any(|c| matches!(
            c,
            ReoCommand::UpdateRxQueue { update: QueueUpdate { ba_window_size: Some(1), .. }, .. }
        )));
        // Session is gone; a new ADDBA may begin.
        soc.addba_request_process(&peer, 4, 3, 64, 0).expect("new req");
    }

    #[test]
    fn delete_runs_descriptor_through_free_list() {
        let (soc, _fw, ring) = soc_with(fast_free_config());
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 0).expect("setup");
        soc.rx_tid_delete(&peer, 0).expect("delete");
        assert_eq!(soc.reo_list_sizes().0, 1);

        // Drive the invalidate completion, then the flush completion.
        while ring.complete_next(&soc, ReoStatus::Success).is_some() {}
        let (free, pending, deferred) = soc.reo_list_sizes();
        assert_eq!((free, pending, deferred), (0, 0, 0));
    }

    #[test]
    fn ring_full_marks_descriptor_for_resend() {
        let (soc, _fw, ring) = soc_with(fast_free_config());
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 0).expect("setup");
        // Drain the setup-time traffic before filling the ring.
        while ring.complete_next(&soc, ReoStatus::Success).is_some() {}

        ring.set_full(true);
        soc.rx_tid_delete(&peer, 0).expect("delete");
        assert_eq!(soc.stats().reo_cmd_send_fail, 1);
        assert_eq!(soc.reo_list_sizes().0, 1);

        // Ring recovers; the next free-list cycle resends the update and
        // eventually flushes.
        ring.set_full(false);
        soc.on_rx_tid_delete_done(ReoStatus::Success);
        while ring.complete_next(&soc, ReoStatus::Success).is_some() {}
        assert_eq!(soc.reo_list_sizes(), (0, 0, 0));
    }

    #[test]
    fn drain_status_is_tolerated() {
        let (soc, _fw, ring) = soc_with(fast_free_config());
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 0).expect("setup");
        soc.rx_tid_delete(&peer, 0).expect("delete");
        while ring.complete_next(&soc, ReoStatus::Drain).is_some() {}
        assert_eq!(soc.reo_list_sizes(), (0, 0, 0));
        assert!(soc.stats().reo_cmd_drain > 0);
    }

    #[test]
    fn deferred_free_holds_memory_until_grace_expires() {
        let config = SocConfig {
            reo_desc_free_defer_ms: 0,
            reo_desc_deferred_free_ms: Some(60_000),
            ..SocConfig::default()
        };
        let (soc, _fw, ring) = soc_with(config);
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        soc.rx_tid_setup(&peer, 0, 64, 0).expect("setup");
        soc.rx_tid_delete(&peer, 0).expect("delete");
        while ring.complete_next(&soc, ReoStatus::Success).is_some() {}
        let (free, pending, deferred) = soc.reo_list_sizes();
        assert_eq!((free, pending), (0, 0));
        assert_eq!(deferred, 1);
    }

    #[test]
    fn peer_delete_tears_down_queues_and_sessions() {
        let (soc, _fw, _ring) = soc_with(fast_free_config());
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        establish_session(&soc, &peer, 4, 64, 0);
        soc.peer_delete(peer).expect("delete");
        assert!(soc.reo_list_sizes().0 >= 1);
        soc.rx_peer_unmap_handler(PeerUnmapEvent {
            peer_id: 5,
            vdev_id: 0,
            mac: mac(2),
            is_wds: false,
            free_wds_count: 0,
        });
    }

    #[test]
    fn queue_stats_requires_queue() {
        let (soc, _fw, ring) = soc();
        attach_sta_vdev(&soc, 0, mac(1));
        let peer = create_and_map_peer(&soc, 0, mac(2), 5, 100);
        assert_matches!(soc.rx_queue_stats(&peer, 4), Err(Error::NotFound));
        soc.rx_tid_setup(&peer, 4, 64, 0).expect("setup");
        soc.rx_queue_stats(&peer, 4).expect("stats");
        assert!(ring.commands().iter().any(|c| matches!(c, ReoCommand::GetQueueStats { .. })));
    }
}

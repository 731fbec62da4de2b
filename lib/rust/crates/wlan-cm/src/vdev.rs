// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-vdev connection-manager state and the message sink towards the
//! serialized driver scheduler. All state changes here are bookkeeping;
//! the scheduler consumes the posted [`CmMessage`]s and drives firmware.

use {
    crate::error::{Error, Result},
    futures::channel::mpsc::UnboundedSender,
    log::{info, warn},
    parking_lot::Mutex,
    std::sync::Arc,
    wlan_dp::MacAddr,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub bssid: MacAddr,
    pub ssid: Vec<u8>,
    pub freq_mhz: u32,
}

/// Connect response synthesized from a roam-sync indication; carries the
/// frames the supplicant needs as opaque IE blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub bssid: MacAddr,
    pub freq_mhz: u32,
    pub beacon_ies: Vec<u8>,
    pub reassoc_req_ies: Vec<u8>,
    pub reassoc_resp_ies: Vec<u8>,
    /// FILS HLP payload, when the AP returned one.
    pub hlp_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    UserRequest,
    HandoverFailed,
    DisabledFrequency,
    PeerKickout,
}

/// Messages posted to the scheduler. One consumer owns the receiving end
/// and applies them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmMessage {
    Connect { vdev_id: u8, req: ConnectRequest },
    Disconnect { vdev_id: u8, reason: DisconnectReason },
    /// Firmware roamed on its own; the host state must follow.
    RoamSync { vdev_id: u8, bssid: MacAddr },
    /// Roam propagation finished; the synthesized response is final.
    RoamDone { vdev_id: u8, resp: ConnectResponse },
}

/// Sending half of the scheduler queue.
#[derive(Clone)]
pub struct CmSink {
    sender: UnboundedSender<CmMessage>,
}

impl CmSink {
    pub fn new(sender: UnboundedSender<CmMessage>) -> CmSink {
        CmSink { sender }
    }

    pub fn send(&self, msg: CmMessage) -> Result {
        self.sender.unbounded_send(msg).map_err(|e| {
            warn!("scheduler sink closed, dropping {:?}", e.into_inner());
            Error::SinkClosed
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Roam-scan-offload state mirrored from firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoamState {
    Deinit,
    RsoStopped,
    RsoEnabled,
    RoamSyncInProgress,
    /// Roam sync driven through an MLO link vdev; only state tracking
    /// happens on this vdev, the assoc vdev runs the full sequence.
    MloRoamSyncInProgress,
}

/// Connection-manager view of one vdev.
pub struct CmVdev {
    vdev_id: u8,
    /// True for MLO link vdevs that never carry the association state.
    link_vdev: bool,
    sink: CmSink,
    pub(crate) conn_state: Mutex<ConnState>,
    pub(crate) roam_state: Mutex<RoamState>,
    pub(crate) bssid: Mutex<Option<MacAddr>>,
    pub(crate) freq_mhz: Mutex<u32>,
}

impl CmVdev {
    pub fn new(vdev_id: u8, link_vdev: bool, sink: CmSink) -> Arc<CmVdev> {
        Arc::new(CmVdev {
            vdev_id,
            link_vdev,
            sink,
            conn_state: Mutex::new(ConnState::Idle),
            roam_state: Mutex::new(RoamState::Deinit),
            bssid: Mutex::new(None),
            freq_mhz: Mutex::new(0),
        })
    }

    pub fn vdev_id(&self) -> u8 {
        self.vdev_id
    }

    pub fn is_link_vdev(&self) -> bool {
        self.link_vdev
    }

    pub fn conn_state(&self) -> ConnState {
        *self.conn_state.lock()
    }

    pub fn roam_state(&self) -> RoamState {
        *self.roam_state.lock()
    }

    pub fn bssid(&self) -> Option<MacAddr> {
        *self.bssid.lock()
    }

    pub(crate) fn sink(&self) -> &CmSink {
        &self.sink
    }

    /// Post a connect request. Rejected while another connect or a
    /// disconnect is still in flight.
    pub fn connect(&self, req: ConnectRequest) -> Result {
        {
            let mut state = self.conn_state.lock();
            match *state {
                ConnState::Connecting | ConnState::Disconnecting => return Err(Error::Busy),
                ConnState::Idle | ConnState::Connected => {}
            }
            *state = ConnState::Connecting;
        }
        info!("vdev {}: connect to {} posted", self.vdev_id, req.bssid);
        self.sink.send(CmMessage::Connect { vdev_id: self.vdev_id, req }).map_err(|e| {
            *self.conn_state.lock() = ConnState::Idle;
            e
        })
    }

    pub fn disconnect(&self, reason: DisconnectReason) -> Result {
        {
            let mut state = self.conn_state.lock();
            if *state == ConnState::Idle {
                return Err(Error::NotPermitted);
            }
            *state = ConnState::Disconnecting;
        }
        info!("vdev {}: disconnect posted ({:?})", self.vdev_id, reason);
        self.sink.send(CmMessage::Disconnect { vdev_id: self.vdev_id, reason })
    }

    /// Scheduler reports the outcome of a posted connect.
    pub fn on_connect_result(&self, bssid: MacAddr, freq_mhz: u32, success: bool) {
        let mut state = self.conn_state.lock();
        if success {
            *state = ConnState::Connected;
            *self.bssid.lock() = Some(bssid);
            *self.freq_mhz.lock() = freq_mhz;
        } else {
            *state = ConnState::Idle;
            *self.bssid.lock() = None;
        }
    }

    /// Scheduler reports a finished disconnect.
    pub fn on_disconnect_done(&self) {
        *self.conn_state.lock() = ConnState::Idle;
        *self.bssid.lock() = None;
        *self.roam_state.lock() = RoamState::Deinit;
    }
}

impl std::fmt::Debug for CmVdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmVdev")
            .field("vdev_id", &self.vdev_id)
            .field("link_vdev", &self.link_vdev)
            .field("conn_state", &self.conn_state())
            .field("roam_state", &self.roam_state())
            .field("bssid", &self.bssid())
            .finish()
    }
}

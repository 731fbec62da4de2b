// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Firmware-initiated roam synchronization.
//!
//! Firmware may roam to a new AP on its own and then tell the host after
//! the fact. The host replays the roam as a connection change: the old
//! BSSID is retired, the new association is synthesized from the frames
//! firmware captured, key material is migrated, and roam-scan offload is
//! re-armed. Any failure along the way aborts the roam in firmware rather
//! than leaving the host half-migrated.

use {
    crate::{
        error::{Error, Result},
        vdev::{CmMessage, CmVdev, ConnState, ConnectResponse, DisconnectReason, RoamState},
    },
    log::{error, info, warn},
    parking_lot::Mutex,
    std::{collections::HashMap, sync::Arc},
    wlan_dp::{DpSoc, MacAddr, ModuleId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoamStopReason {
    SyncFailed,
    HandoverFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsoMode {
    Enabled,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Akm {
    Open,
    Psk,
    Eap,
    Sae,
    Owe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmksa {
    pub pmkid: [u8; 16],
    pub pmk: Vec<u8>,
}

/// Why firmware decided to roam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoamReason {
    LowRssi,
    HighRssi,
    Periodic,
    /// The AP deauthenticated or disassociated us.
    Kickout,
}

/// Everything firmware reports about a completed roam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoamSyncInd {
    pub vdev_id: u8,
    pub bssid: MacAddr,
    pub freq_mhz: u32,
    pub reason: RoamReason,
    /// Firmware finished the 4-way handshake with the new AP.
    pub authenticated: bool,
    pub akm: Akm,
    /// The roam used fast transition; key material came over the FT
    /// protocol and must not be re-derived.
    pub uses_ft: bool,
    pub beacon_ies: Vec<u8>,
    pub reassoc_req_ies: Vec<u8>,
    pub reassoc_resp_ies: Vec<u8>,
    pub hlp_data: Option<Vec<u8>>,
    pub pmk: Option<Vec<u8>>,
    pub pmkid: Option<[u8; 16]>,
}

/// Denylist of misbehaving APs.
pub trait BlockList: Send + Sync {
    fn mark_disconnected(&self, bssid: MacAddr);
    /// The AP kicked us out; weigh it down for future roam candidates.
    fn add_kickout_reject(&self, bssid: MacAddr);
}

/// The scan result database.
pub trait ScanCache: Send + Sync {
    fn set_connection_state(&self, bssid: MacAddr, connected: bool);
    fn update_entry(&self, bssid: MacAddr, freq_mhz: u32, beacon_ies: &[u8]);
}

/// Concurrency policy engine: which frequencies are usable and which
/// vdev is connected where.
pub trait PolicyMgr: Send + Sync {
    fn is_freq_disabled(&self, freq_mhz: u32) -> bool;
    fn update_connection(&self, vdev_id: u8, bssid: MacAddr, freq_mhz: u32);
}

/// PMKSA cache owned by the supplicant side.
pub trait CryptoStore: Send + Sync {
    fn lookup_pmksa(&self, bssid: MacAddr) -> Option<Pmksa>;
    fn insert_pmksa(&self, bssid: MacAddr, pmksa: Pmksa);
    fn delete_pmksa(&self, bssid: MacAddr);
}

/// Roam-scan-offload control channel into firmware.
pub trait RoamOffload: Send + Sync {
    fn stop(&self, vdev_id: u8, reason: RoamStopReason);
    fn abort(&self, vdev_id: u8);
    fn set_rso_state(&self, vdev_id: u8, mode: RsoMode);
    /// The high-RSSI trigger (roam towards 5 GHz once the signal is
    /// strong) is only meaningful while associated on 2.4 GHz.
    fn disable_hi_rssi_trigger(&self, vdev_id: u8);
}

fn is_24ghz(freq_mhz: u32) -> bool {
    (2400..2500).contains(&freq_mhz)
}

pub struct RoamManager {
    soc: DpSoc,
    blocklist: Arc<dyn BlockList>,
    scan_cache: Arc<dyn ScanCache>,
    policy: Arc<dyn PolicyMgr>,
    crypto: Arc<dyn CryptoStore>,
    offload: Arc<dyn RoamOffload>,
    vdevs: Mutex<HashMap<u8, Arc<CmVdev>>>,
}

impl RoamManager {
    pub fn new(
        soc: DpSoc,
        blocklist: Arc<dyn BlockList>,
        scan_cache: Arc<dyn ScanCache>,
        policy: Arc<dyn PolicyMgr>,
        crypto: Arc<dyn CryptoStore>,
        offload: Arc<dyn RoamOffload>,
    ) -> RoamManager {
        RoamManager {
            soc,
            blocklist,
            scan_cache,
            policy,
            crypto,
            offload,
            vdevs: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_vdev(&self, vdev: Arc<CmVdev>) {
        self.vdevs.lock().insert(vdev.vdev_id(), vdev);
    }

    fn vdev(&self, vdev_id: u8) -> Result<Arc<CmVdev>> {
        self.vdevs.lock().get(&vdev_id).cloned().ok_or(Error::NotFound)
    }

    /// Firmware announced a roam. Rejected while a connect or disconnect
    /// is in flight; otherwise the sync event is handed to the scheduler
    /// and the datapath peer is flagged as firmware-owned.
    pub fn fw_roam_sync_req(&self, ind: &RoamSyncInd) -> Result {
        let vdev = self.vdev(ind.vdev_id)?;
        match vdev.conn_state() {
            ConnState::Connecting | ConnState::Disconnecting => {
                warn!(
                    "vdev {}: roam sync during {:?}, stopping roam",
                    ind.vdev_id,
                    vdev.conn_state()
                );
                self.offload.stop(ind.vdev_id, RoamStopReason::SyncFailed);
                return Err(Error::NotPermitted);
            }
            ConnState::Idle | ConnState::Connected => {}
        }

        *vdev.roam_state.lock() = if vdev.is_link_vdev() {
            RoamState::MloRoamSyncInProgress
        } else {
            RoamState::RoamSyncInProgress
        };
        if let Some(old_bssid) = vdev.bssid() {
            // Queue writes for the roaming peer stay off until the new
            // map event lands.
            self.soc.set_vdev_roaming_peer(ind.vdev_id, Some(old_bssid))?;
        }

        info!("vdev {}: roam sync to {} started", ind.vdev_id, ind.bssid);
        if let Err(e) =
            vdev.sink().send(CmMessage::RoamSync { vdev_id: ind.vdev_id, bssid: ind.bssid })
        {
            error!("vdev {}: roam sync delivery failed, aborting", ind.vdev_id);
            self.roam_abort(&vdev, ind.vdev_id);
            return Err(e);
        }
        Ok(())
    }

    /// First indication of the sync sequence: retire the old BSSID. Link
    /// vdevs only track state; the assoc vdev runs the full path.
    pub fn fw_roam_sync_start_ind(&self, ind: &RoamSyncInd) -> Result {
        let vdev = self.vdev(ind.vdev_id)?;
        if vdev.is_link_vdev() {
            *vdev.roam_state.lock() = RoamState::MloRoamSyncInProgress;
            return Ok(());
        }
        let old_bssid = vdev.bssid().ok_or(Error::NotPermitted)?;
        self.blocklist.mark_disconnected(old_bssid);
        if ind.reason == RoamReason::Kickout {
            self.blocklist.add_kickout_reject(old_bssid);
        }
        self.scan_cache.set_connection_state(old_bssid, false);
        info!("vdev {}: left {} behind", ind.vdev_id, old_bssid);
        Ok(())
    }

    /// Propagate the new association into host state and hand the
    /// synthesized connect response to the scheduler.
    pub fn fw_roam_sync_propagation(&self, ind: &RoamSyncInd) -> Result {
        let vdev = self.vdev(ind.vdev_id)?;

        self.scan_cache.update_entry(ind.bssid, ind.freq_mhz, &ind.beacon_ies);
        self.scan_cache.set_connection_state(ind.bssid, true);
        self.update_pmksa(ind);

        let resp = ConnectResponse {
            bssid: ind.bssid,
            freq_mhz: ind.freq_mhz,
            beacon_ies: ind.beacon_ies.clone(),
            reassoc_req_ies: ind.reassoc_req_ies.clone(),
            reassoc_resp_ies: ind.reassoc_resp_ies.clone(),
            hlp_data: ind.hlp_data.clone(),
        };
        if let Err(e) = vdev.sink().send(CmMessage::RoamDone { vdev_id: ind.vdev_id, resp }) {
            error!("vdev {}: roam propagation delivery failed, aborting", ind.vdev_id);
            self.roam_abort(&vdev, ind.vdev_id);
            return Err(e);
        }

        *vdev.bssid.lock() = Some(ind.bssid);
        *vdev.freq_mhz.lock() = ind.freq_mhz;
        *vdev.conn_state.lock() = ConnState::Connected;
        info!("vdev {}: now associated to {} ({} MHz)", ind.vdev_id, ind.bssid, ind.freq_mhz);
        Ok(())
    }

    /// PMKSA migration. A PMKSA is only cached once firmware reports the
    /// link authenticated, or when the AKM derives the PMK during
    /// association (SAE, OWE). FT roams bring their keys over the FT
    /// protocol, so a fresh PMKSA must not be inserted for them.
    fn update_pmksa(&self, ind: &RoamSyncInd) {
        if ind.uses_ft {
            return;
        }
        if !(ind.authenticated || matches!(ind.akm, Akm::Sae | Akm::Owe)) {
            return;
        }
        let pmk = match &ind.pmk {
            Some(pmk) => pmk.clone(),
            None => return,
        };
        let pmkid = ind.pmkid.unwrap_or([0; 16]);
        match self.crypto.lookup_pmksa(ind.bssid) {
            Some(existing) if existing.pmk != pmk => {
                // A stale entry from an earlier association; replacing it
                // keeps the supplicant from mixing key hierarchies.
                self.crypto.delete_pmksa(ind.bssid);
                self.crypto.insert_pmksa(ind.bssid, Pmksa { pmkid, pmk });
            }
            Some(_) => {}
            None => self.crypto.insert_pmksa(ind.bssid, Pmksa { pmkid, pmk }),
        }
    }

    /// Tail of the sequence: concurrency bookkeeping and re-arming
    /// roam-scan offload.
    pub fn fw_roam_complete(&self, ind: &RoamSyncInd) -> Result {
        let vdev = self.vdev(ind.vdev_id)?;
        // Whatever happened, the datapath peer is back under host control.
        let _ = self.soc.set_vdev_roaming_peer(ind.vdev_id, None);

        if self.policy.is_freq_disabled(ind.freq_mhz) {
            warn!(
                "vdev {}: roamed onto disabled freq {} MHz, disconnecting",
                ind.vdev_id, ind.freq_mhz
            );
            *vdev.roam_state.lock() = RoamState::RsoStopped;
            self.offload.stop(ind.vdev_id, RoamStopReason::SyncFailed);
            *vdev.conn_state.lock() = ConnState::Disconnecting;
            return vdev.sink().send(CmMessage::Disconnect {
                vdev_id: ind.vdev_id,
                reason: DisconnectReason::DisabledFrequency,
            });
        }

        self.policy.update_connection(ind.vdev_id, ind.bssid, ind.freq_mhz);
        if !is_24ghz(ind.freq_mhz) {
            self.offload.disable_hi_rssi_trigger(ind.vdev_id);
        }

        if ind.authenticated {
            self.offload.set_rso_state(ind.vdev_id, RsoMode::Enabled);
            *vdev.roam_state.lock() = RoamState::RsoEnabled;
        } else {
            // Firmware has not finished the handshake; offload stays off
            // until the host-side handshake completes.
            self.offload.set_rso_state(ind.vdev_id, RsoMode::Stopped);
            *vdev.roam_state.lock() = RoamState::RsoStopped;
        }
        Ok(())
    }

    /// Firmware could not complete the handover. The old association is
    /// unusable: drop the datapath peer and disconnect.
    pub fn fw_ho_fail(&self, vdev_id: u8, bssid: MacAddr) -> Result {
        let vdev = self.vdev(vdev_id)?;
        let _ = self.soc.set_vdev_roaming_peer(vdev_id, None);
        *vdev.roam_state.lock() = RoamState::RsoStopped;
        // Keep the AP that failed the handover out of the next candidate
        // selection.
        self.blocklist.add_kickout_reject(bssid);

        match self.soc.peer_find(bssid, Some(vdev_id), ModuleId::Cm) {
            Some(peer) => self.soc.peer_delete(peer)?,
            None => warn!("vdev {}: ho-fail for unknown peer {}", vdev_id, bssid),
        }
        self.offload.stop(vdev_id, RoamStopReason::HandoverFailed);
        *vdev.conn_state.lock() = ConnState::Disconnecting;
        vdev.sink()
            .send(CmMessage::Disconnect { vdev_id, reason: DisconnectReason::HandoverFailed })
    }

    fn roam_abort(&self, vdev: &CmVdev, vdev_id: u8) {
        self.offload.abort(vdev_id);
        self.offload.stop(vdev_id, RoamStopReason::SyncFailed);
        *vdev.roam_state.lock() = RoamState::RsoStopped;
        let _ = self.soc.set_vdev_roaming_peer(vdev_id, None);
    }
}

// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Connection-manager glue for the WLAN datapath: per-vdev connection
//! state, the message sink towards the driver scheduler, and the firmware
//! roam-sync sequence (request, start indication, propagation, completion,
//! handover failure).

pub mod error;
pub mod roam;
pub mod vdev;

pub use {
    error::{Error, Result},
    roam::{RoamManager, RoamReason, RoamSyncInd},
    vdev::{CmMessage, CmSink, CmVdev, ConnState, RoamState},
};

// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("operation in progress")]
    Busy,
    #[error("object not found")]
    NotFound,
    #[error("operation not permitted in this state")]
    NotPermitted,
    #[error("scheduler sink closed")]
    SinkClosed,
    #[error("datapath error: {0}")]
    Datapath(wlan_dp::Error),
    #[error("operation failed")]
    Failure,
}

impl From<wlan_dp::Error> for Error {
    fn from(e: wlan_dp::Error) -> Error {
        Error::Datapath(e)
    }
}

pub type Result<T = ()> = std::result::Result<T, Error>;

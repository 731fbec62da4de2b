// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// Status-style errors shared by the datapath modules. Callers on the
/// firmware event path generally log these and drop the event; control
/// path callers propagate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("entry already exists")]
    AlreadyExists,
    #[error("resource busy, retry later")]
    Busy,
    #[error("table capacity exhausted")]
    NoResources,
    #[error("allocation failed")]
    NoMemory,
    #[error("no such entry")]
    NotFound,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not permitted in current state")]
    NotPermitted,
    #[error("operation failed")]
    Failure,
}

pub type Result<T = ()> = std::result::Result<T, Error>;

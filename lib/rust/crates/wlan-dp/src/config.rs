// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Per-SoC tunables. Everything that varies across hardware generations is
/// carried here rather than baked into the code; the driver shim fills this
/// in from its platform configuration.
#[derive(Debug, Clone)]
pub struct SocConfig {
    /// Size of the firmware peer-id space (the flat id-to-object map).
    pub max_peer_id: usize,
    /// Capacity of the hardware address search table mirror.
    pub max_ast_entries: usize,
    /// Width of the per-MLD link table.
    pub max_mlo_links: usize,
    /// When set, duplicate AST detection is scoped to a single pdev;
    /// otherwise the whole SoC shares one MAC namespace.
    pub ast_override_support: bool,
    /// TIDs below this threshold may negotiate a block-ack window
    /// independently of the peer-global hardware buffer size.
    pub per_tid_basize_max_tid: u8,
    /// Bitmask of TIDs for which RX block-ack sessions are administratively
    /// disabled (window forced to 1, ADDBA refused).
    pub ba_disabled_tid_mask: u32,
    /// Maximum number of REO descriptors processed per free-list cycle.
    pub reo_free_batch_size: usize,
    /// Minimum age of a freed descriptor before its cache flush is issued.
    pub reo_desc_free_defer_ms: u64,
    /// When set, flushed descriptors linger on a deferred list for this many
    /// milliseconds before their memory is actually released.
    pub reo_desc_deferred_free_ms: Option<u64>,
    /// Host-initiated DELBA retransmissions before giving up.
    pub max_delba_retry: u8,
    /// When set, reorder queue descriptors whose bus address falls below
    /// this value are rejected and reallocated.
    pub qdesc_min_paddr: Option<u64>,
    /// Reallocation attempts for the address check above.
    pub qdesc_alloc_retries: usize,
}

impl Default for SocConfig {
    fn default() -> Self {
        SocConfig {
            max_peer_id: 1024,
            max_ast_entries: 1024,
            max_mlo_links: 4,
            ast_override_support: false,
            per_tid_basize_max_tid: 8,
            ba_disabled_tid_mask: 0,
            reo_free_batch_size: 64,
            reo_desc_free_defer_ms: 30,
            reo_desc_deferred_free_ms: None,
            max_delba_retry: 3,
            qdesc_min_paddr: None,
            qdesc_alloc_retries: 10,
        }
    }
}

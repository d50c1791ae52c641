// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Only conditions fatal to the pipeline use this type: invalid construction
/// arguments and internal platform failures (a pacer thread that can't run,
/// for example). Everything that happens per-packet or per-frame — late
/// packets, sequence gaps, orphan fragments, decoder buffer exhaustion,
/// incomplete frames at drain time — is recoverable and handled inside the
/// component that detects it, never surfaced to the ingest caller.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying platform failed in a way the pipeline can't recover
    /// from; distinguishable from all per-packet recoverable conditions.
    #[error("Internal error: {0}")]
    Internal(String),
}

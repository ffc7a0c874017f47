//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailstore.
//
// Mailstore is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailstore is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailstore. If not, see <http://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

use crate::store::model::BlockKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Accuracy range start is after its end")]
    InvertedRange,
    #[error("Message not found")]
    MessageNotFound,
    #[error("Server ID mapping not supported for this folder")]
    ServerIdMappingUnsupported,
    #[error("Non-existent flag")]
    NxFlag,
    #[error("Unsafe name")]
    UnsafeName,
    #[error("Malformed message identifier")]
    BadSuid,
    #[error("{0} block {1} could not be loaded")]
    BlockUnavailable(BlockKind, u32),
    #[error("Synchronisation failed: {0}")]
    Sync(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

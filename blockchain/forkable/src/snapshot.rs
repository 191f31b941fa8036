// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::forkdb::{ForkDb, ForkableBlock};
use crate::Error;
use chainstream_blocks::{BlockRef, Payload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Serializable image of a [`ForkDb`]. Node payloads are kept opaque: the
/// caller supplies the codec turning a stored node into a [`Payload`]
/// variant and back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForkDbSnapshot {
    pub links: HashMap<String, String>,
    pub nums: HashMap<String, u64>,
    pub objects: HashMap<String, Payload>,
    pub lib_ref: BlockRef,
}

impl<O> ForkDb<O> {
    pub fn snapshot<F>(&self, encode: F) -> Result<ForkDbSnapshot, Error>
    where
        F: Fn(&ForkableBlock<O>) -> anyhow::Result<Payload>,
    {
        let mut objects = HashMap::with_capacity(self.objects().len());
        for (id, node) in self.objects() {
            objects.insert(id.clone(), encode(node).map_err(Error::Snapshot)?);
        }
        Ok(ForkDbSnapshot {
            links: self.links().clone(),
            nums: self.nums().clone(),
            objects,
            lib_ref: self.lib_ref().clone(),
        })
    }

    pub fn restore<F>(snapshot: ForkDbSnapshot, decode: F) -> Result<Self, Error>
    where
        F: Fn(&str, Payload) -> anyhow::Result<ForkableBlock<O>>,
    {
        let mut objects = HashMap::with_capacity(snapshot.objects.len());
        for (id, payload) in snapshot.objects {
            let node = decode(&id, payload).map_err(Error::Snapshot)?;
            objects.insert(id, node);
        }
        Ok(ForkDb::from_parts(
            snapshot.links,
            snapshot.nums,
            objects,
            snapshot.lib_ref,
        ))
    }
}

pub fn write_snapshot<W: Write>(writer: W, snapshot: &ForkDbSnapshot) -> Result<(), Error> {
    serde_json::to_writer(writer, snapshot).map_err(|e| Error::Snapshot(e.into()))
}

pub fn read_snapshot<R: Read>(reader: R) -> Result<ForkDbSnapshot, Error> {
    serde_json::from_reader(reader).map_err(|e| Error::Snapshot(anyhow::Error::from(e)))
}

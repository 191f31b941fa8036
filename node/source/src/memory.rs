// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::traits::{DynReader, ObjectStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A thread-safe in-memory object store. Objects can be added while a
/// source is running, which is how tests model bundles appearing in a
/// remote store over time.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_object(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().insert(name.into(), bytes);
    }

    pub fn remove_object(&self, name: &str) {
        self.objects.write().remove(name);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn file_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.objects.read().contains_key(name))
    }

    async fn open_object(&self, name: &str) -> anyhow::Result<DynReader> {
        let bytes = self
            .objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object {name} not found"))?;
        Ok(Box::new(futures::io::Cursor::new(bytes)))
    }

    fn object_path(&self, name: &str) -> String {
        format!("memory://{name}")
    }
}

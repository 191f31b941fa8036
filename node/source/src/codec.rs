// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::traits::{BlockReader, BlockReaderFactory, DynReader};
use async_trait::async_trait;
use chainstream_blocks::Block;
use futures::io::{AsyncBufReadExt, BufReader};

/// Reference bundle codec: one JSON-encoded block per line. Chains plug in
/// their binary codec through [`BlockReaderFactory`]; this one keeps the
/// source usable and testable without one.
pub struct JsonLinesBlockReader {
    reader: BufReader<DynReader>,
}

#[async_trait]
impl BlockReader for JsonLinesBlockReader {
    async fn read(&mut self) -> anyhow::Result<Option<Block>> {
        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(line)?));
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesBlockReaderFactory;

impl BlockReaderFactory for JsonLinesBlockReaderFactory {
    fn new_reader(&self, reader: DynReader) -> anyhow::Result<Box<dyn BlockReader>> {
        Ok(Box::new(JsonLinesBlockReader {
            reader: BufReader::new(reader),
        }))
    }
}

/// Encodes blocks into the JSON-lines bundle form understood by
/// [`JsonLinesBlockReader`].
pub fn write_bundle(blocks: &[Block]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for block in blocks {
        serde_json::to_writer(&mut out, block)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ObjectStore;
    use crate::MemoryObjectStore;
    use chainstream_blocks::Payload;

    #[async_std::test]
    async fn bundle_roundtrip() {
        let blocks = vec![
            Block::new("a1", 1, "G", 0, Payload::Raw(vec![7])),
            Block::new("a2", 2, "a1", 1, Payload::Json("{}".to_string())),
        ];
        let store = MemoryObjectStore::new();
        store.set_object("0000000000", write_bundle(&blocks).unwrap());

        let reader = store.open_object("0000000000").await.unwrap();
        let mut block_reader = JsonLinesBlockReaderFactory.new_reader(reader).unwrap();
        let mut decoded = Vec::new();
        while let Some(block) = block_reader.read().await.unwrap() {
            decoded.push(block);
        }
        assert_eq!(decoded, blocks);
    }
}

// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::shutter::Shutter;
use crate::traits::{BlockIndexer, BlockReader, BlockReaderFactory, Gator, ObjectStore};
use crate::{metrics, Error};
use async_std::task;
use chainstream_blocks::{Block, BlockRef, Cursor, Handler, ObjectWithCursor, PreprocessedBlock, Step};
use futures::channel::oneshot;
use futures::{pin_mut, select, FutureExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Conventional number of blocks per bundle file.
pub const DEFAULT_BUNDLE_SIZE: u64 = 100;
/// How long to wait before looking again for a bundle that is not in the
/// store yet.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(4);

/// Optional per-block preprocessing, run on the worker pool before the
/// block rejoins the ordered stream.
pub type PreprocessFunc<O> = Box<dyn Fn(&Block) -> anyhow::Result<O> + Send + Sync>;

/// Zero-padded object name of the bundle starting at `base`.
pub fn bundle_filename(base: u64) -> String {
    format!("{base:010}")
}

/// One bundle in flight between the main loop and the sink. Its `blocks`
/// channel is a rendezvous: the reader task fills it in bundle order while
/// the sink drains it.
pub struct IncomingBlocksFile<O> {
    pub filename: String,
    pub filtered_blocks: Option<Vec<u64>>,
    pub blocks: flume::Receiver<PreprocessedBlock<O>>,
}

/// Streams historical blocks out of an object store organized in
/// fixed-size bundles: bundles are dispatched strictly in order through a
/// capacity-1 channel, each bundle is decoded by its own reader task, and
/// blocks fan through a bounded preprocessor pool that rejoins them in
/// read order before the sink hands them to the handler.
pub struct FileSource<O, H> {
    store: Arc<dyn ObjectStore>,
    reader_factory: Arc<dyn BlockReaderFactory>,
    handler: H,
    start_block_num: u64,
    stop_block_num: u64,
    bundle_size: u64,
    retry_delay: Duration,
    preprocessor_threads: usize,
    preprocess: Option<PreprocessFunc<O>>,
    gator: Option<Mutex<Box<dyn Gator>>>,
    block_indexer: Mutex<Option<Box<dyn BlockIndexer>>>,
    shutter: Shutter,
    last_block_read: Mutex<Option<BlockRef>>,
    highest_file_processed_block: AtomicU64,
    open_files: AtomicI64,
}

impl<O, H> FileSource<O, H>
where
    O: Default + Send + Sync + 'static,
    H: Handler<ObjectWithCursor<O>> + 'static,
{
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reader_factory: Arc<dyn BlockReaderFactory>,
        handler: H,
        start_block_num: u64,
    ) -> Self {
        Self {
            store,
            reader_factory,
            handler,
            start_block_num,
            stop_block_num: 0,
            bundle_size: DEFAULT_BUNDLE_SIZE,
            retry_delay: DEFAULT_RETRY_DELAY,
            preprocessor_threads: 1,
            preprocess: None,
            gator: None,
            block_indexer: Mutex::new(None),
            shutter: Shutter::new(),
            last_block_read: Mutex::new(None),
            highest_file_processed_block: AtomicU64::new(0),
            open_files: AtomicI64::new(0),
        }
    }

    /// Stop (inclusive) block number; 0 streams forever.
    pub fn with_stop_block(mut self, stop_block_num: u64) -> Self {
        self.stop_block_num = stop_block_num;
        self
    }

    pub fn with_bundle_size(mut self, bundle_size: u64) -> Self {
        self.bundle_size = bundle_size.max(1);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_preprocessor(mut self, threads: usize, preprocess: PreprocessFunc<O>) -> Self {
        self.preprocessor_threads = threads.max(1);
        self.preprocess = Some(preprocess);
        self
    }

    pub fn with_gator(mut self, gator: Box<dyn Gator>) -> Self {
        self.gator = Some(Mutex::new(gator));
        self
    }

    pub fn with_block_indexer(mut self, block_indexer: Box<dyn BlockIndexer>) -> Self {
        self.block_indexer = Mutex::new(Some(block_indexer));
        self
    }

    /// Highest block number the sink has fed downstream.
    pub fn highest_file_processed_block(&self) -> u64 {
        self.highest_file_processed_block.load(Ordering::SeqCst)
    }

    /// Bundle files currently open against the store (diagnostic).
    pub fn current_open_files(&self) -> i64 {
        self.open_files.load(Ordering::SeqCst)
    }

    /// Requests shutdown; `run` unwinds and returns.
    pub fn shutdown(&self) {
        self.shutter.shutdown(Ok(()));
    }

    /// Drives the source until the stop block is passed, the handler or a
    /// task fails, or `shutdown` is called.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let (file_tx, file_rx) = flume::bounded(1);
        let sink = task::spawn({
            let fs = self.clone();
            async move { fs.launch_sink(file_rx).await }
        });

        if let Err(e) = self.clone().stream_bundles(file_tx).await {
            self.shutter.shutdown(Err(e));
        }
        sink.await;
        self.shutter.shutdown(Ok(()));
        match self.shutter.take_err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stream_bundles(
        self: Arc<Self>,
        file_tx: flume::Sender<IncomingBlocksFile<O>>,
    ) -> Result<(), Error> {
        let mut base = self.start_block_num - (self.start_block_num % self.bundle_size);
        loop {
            if self.shutter.is_down() {
                return Ok(());
            }

            let (resolved_base, filtered_blocks) = self.resolve_next_bundle(base)?;
            base = resolved_base;

            let filename = bundle_filename(base);
            if !self
                .store
                .file_exists(&filename)
                .await
                .map_err(Error::Store)?
            {
                info!(
                    "bundle {} not found, retrying in {:?}",
                    self.store.object_path(&filename),
                    self.retry_delay
                );
                metrics::FILE_RETRIES_TOTAL.inc();
                let delay = task::sleep(self.retry_delay).fuse();
                let down = self.shutter.wait().fuse();
                pin_mut!(delay, down);
                select! {
                    _ = delay => {},
                    _ = down => return Ok(()),
                }
                continue;
            }

            let (blocks_tx, blocks_rx) = flume::bounded(0);
            let incoming = IncomingBlocksFile {
                filename: filename.clone(),
                filtered_blocks: filtered_blocks.clone(),
                blocks: blocks_rx,
            };
            {
                let dispatch = file_tx.send_async(incoming).fuse();
                let down = self.shutter.wait().fuse();
                pin_mut!(dispatch, down);
                select! {
                    sent = dispatch => {
                        if sent.is_err() {
                            return Ok(()); // sink is gone
                        }
                    },
                    _ = down => return Ok(()),
                }
            }

            let fs = self.clone();
            task::spawn(async move {
                if let Err(e) = fs
                    .clone()
                    .stream_incoming_file(filename, base, filtered_blocks, blocks_tx)
                    .await
                {
                    fs.shutter.shutdown(Err(e));
                }
            });

            base += self.bundle_size;
            if self.stop_block_num != 0 && base > self.stop_block_num {
                // final bundle dispatched; the sink drains what remains
                return Ok(());
            }
        }
    }

    fn resolve_next_bundle(&self, base: u64) -> Result<(u64, Option<Vec<u64>>), Error> {
        let mut indexer_slot = self.block_indexer.lock();
        let indexer = match indexer_slot.as_deref() {
            Some(indexer) => indexer,
            None => return Ok((base, None)),
        };
        match self.lookup_block_index(indexer, base)? {
            (resolved, Some(filtered)) => Ok((resolved, Some(filtered))),
            (resolved, None) => {
                info!("block index exhausted at bundle {resolved}, continuing unfiltered");
                *indexer_slot = None;
                Ok((resolved, None))
            }
        }
    }

    /// Resolves which bundle actually needs reading next and which block
    /// numbers of it survive index filtering. Bundles with no matching
    /// blocks are skipped wholesale, except that the start and stop blocks
    /// are always materialized so the stream keeps its boundary markers.
    fn lookup_block_index(
        &self,
        indexer: &dyn BlockIndexer,
        mut base: u64,
    ) -> Result<(u64, Option<Vec<u64>>), Error> {
        if self.stop_block_num != 0 && base > self.stop_block_num {
            return Err(Error::IndexBeyondStop {
                base,
                stop: self.stop_block_num,
            });
        }
        loop {
            let nums = match indexer
                .blocks_in_range(base, self.bundle_size)
                .map_err(Error::Index)?
            {
                // the index has nothing for this range: fall back to
                // unfiltered streaming from here on
                None => return Ok((base, None)),
                Some(nums) => nums,
            };

            let mut out = Vec::new();
            for num in nums {
                if num < self.start_block_num {
                    continue;
                }
                // the start boundary must flow even when this same entry
                // goes on to hit the stop below
                if out.is_empty()
                    && self.bundle_contains(base, self.start_block_num)
                    && num > self.start_block_num
                {
                    out.push(self.start_block_num);
                }
                if self.stop_block_num != 0 && num >= self.stop_block_num {
                    out.push(self.stop_block_num);
                    return Ok((base, Some(out)));
                }
                out.push(num);
            }
            if !out.is_empty() {
                return Ok((base, Some(out)));
            }

            let overlaps_start = self.bundle_contains(base, self.start_block_num);
            let overlaps_stop =
                self.stop_block_num != 0 && self.bundle_contains(base, self.stop_block_num);
            if overlaps_start || overlaps_stop {
                let mut sentinels = Vec::new();
                if overlaps_start {
                    sentinels.push(self.start_block_num);
                }
                if overlaps_stop && self.stop_block_num != self.start_block_num {
                    sentinels.push(self.stop_block_num);
                }
                return Ok((base, Some(sentinels)));
            }

            base += self.bundle_size;
            if self.stop_block_num != 0 && base > self.stop_block_num {
                return Err(Error::IndexBeyondStop {
                    base,
                    stop: self.stop_block_num,
                });
            }
        }
    }

    fn bundle_contains(&self, base: u64, num: u64) -> bool {
        base <= num && num < base + self.bundle_size
    }

    async fn stream_incoming_file(
        self: Arc<Self>,
        filename: String,
        base: u64,
        filtered_blocks: Option<Vec<u64>>,
        output: flume::Sender<PreprocessedBlock<O>>,
    ) -> Result<(), Error> {
        self.open_files.fetch_add(1, Ordering::SeqCst);
        metrics::OPEN_FILES.inc();
        let result = self
            .read_file_into(&filename, base, filtered_blocks, output)
            .await;
        self.open_files.fetch_sub(1, Ordering::SeqCst);
        metrics::OPEN_FILES.dec();
        result
    }

    async fn read_file_into(
        self: &Arc<Self>,
        filename: &str,
        base: u64,
        filtered_blocks: Option<Vec<u64>>,
        output: flume::Sender<PreprocessedBlock<O>>,
    ) -> Result<(), Error> {
        debug!("reading bundle {}", self.store.object_path(filename));
        let reader = self
            .store
            .open_object(filename)
            .await
            .map_err(Error::Store)?;
        let block_reader = self.reader_factory.new_reader(reader).map_err(Error::Reader)?;
        let previous_last_block = self.last_block_read.lock().clone();
        self.stream_reader(block_reader, previous_last_block, base, filtered_blocks, output)
            .await
    }

    /// Decodes the bundle sequentially, fans kept blocks into the
    /// preprocessor pool and rejoins them in read order. The queue of
    /// per-block result channels is bounded by the pool size, which is
    /// what bounds preprocessing concurrency.
    async fn stream_reader(
        self: &Arc<Self>,
        mut block_reader: Box<dyn BlockReader>,
        previous_last_block: Option<BlockRef>,
        base: u64,
        filtered_blocks: Option<Vec<u64>>,
        output: flume::Sender<PreprocessedBlock<O>>,
    ) -> Result<(), Error> {
        type PendingBlock<O> = oneshot::Receiver<Result<PreprocessedBlock<O>, Error>>;
        let (queue_tx, queue_rx) = flume::bounded::<PendingBlock<O>>(self.preprocessor_threads);

        let orderer = task::spawn(async move {
            while let Ok(pending) = queue_rx.recv_async().await {
                match pending.await {
                    Ok(Ok(preprocessed)) => {
                        if output.send_async(preprocessed).await.is_err() {
                            return Ok(()); // sink went away
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_cancelled) => return Ok(()),
                }
            }
            Ok(())
        });

        // the skip applies only when re-streaming a bundle that was
        // already partially delivered; a ref from an earlier bundle must
        // not swallow this one
        let mut skip_until = previous_last_block.filter(|prev| prev.num >= base);

        let read_result = loop {
            if self.shutter.is_down() {
                break Ok(());
            }
            match block_reader.read().await {
                Ok(Some(block)) => {
                    if block.num < self.start_block_num {
                        continue;
                    }
                    if self.stop_block_num != 0 && block.num > self.stop_block_num {
                        continue;
                    }
                    if let Some(prev) = &skip_until {
                        let caught_up = block.id == prev.id;
                        if caught_up {
                            skip_until = None; // resume after this block
                        }
                        continue;
                    }
                    if let Some(filtered) = &filtered_blocks {
                        if filtered.binary_search(&block.num).is_err() {
                            continue;
                        }
                    }
                    if let Some(gator) = &self.gator {
                        if !gator.lock().pass(&block) {
                            debug!("gator dropped block {block}");
                            continue;
                        }
                    }

                    let block = Arc::new(block);
                    let (result_tx, result_rx) = oneshot::channel();
                    if queue_tx.send_async(result_rx).await.is_err() {
                        break Ok(());
                    }
                    let fs = self.clone();
                    let dispatched = block.clone();
                    task::spawn(async move {
                        let _ = result_tx.send(fs.preprocess_block(dispatched));
                    });
                    *self.last_block_read.lock() = Some(block.to_ref());
                }
                Ok(None) => break Ok(()), // end of bundle
                Err(e) => break Err(Error::Reader(e)),
            }
        };

        drop(queue_tx); // lets the orderer drain pending results and stop
        let orderer_result = orderer.await;
        read_result?;
        orderer_result
    }

    fn preprocess_block(&self, block: Arc<Block>) -> Result<PreprocessedBlock<O>, Error> {
        let obj = match &self.preprocess {
            Some(preprocess) => preprocess(&block).map_err(Error::Preprocess)?,
            None => O::default(),
        };
        // bootstrap cursor: the block is its own head and LIB until a
        // fork-aware stage downstream says otherwise
        let cursor = Cursor::new(
            Step::NewIrreversible,
            block.to_ref(),
            block.to_ref(),
            block.to_ref(),
        );
        Ok(PreprocessedBlock {
            block,
            obj: ObjectWithCursor { cursor, obj },
        })
    }

    /// Builds a source resuming an interrupted stream: it starts reading
    /// at the cursor's LIB bundle and wraps the handler in a
    /// [`crate::CursorResolverHandler`] that reissues the undos and
    /// redeliveries owed across the resume boundary.
    pub fn from_cursor(
        store: Arc<dyn ObjectStore>,
        reader_factory: Arc<dyn BlockReaderFactory>,
        fetcher: Arc<dyn crate::BlockFetcher>,
        handler: H,
        cursor: &Cursor,
    ) -> FileSource<O, crate::CursorResolverHandler<O, H>> {
        FileSource::new(
            store,
            reader_factory,
            crate::CursorResolverHandler::new(handler, fetcher, cursor.clone()),
            cursor.lib.num,
        )
    }

    async fn launch_sink(self: Arc<Self>, file_rx: flume::Receiver<IncomingBlocksFile<O>>) {
        while let Ok(incoming) = file_rx.recv_async().await {
            debug!("feeding blocks from file {}", incoming.filename);
            while let Ok(preprocessed) = incoming.blocks.recv_async().await {
                if self.shutter.is_down() {
                    return;
                }
                let num = preprocessed.block.num;
                if let Err(e) = self
                    .handler
                    .process_block(preprocessed.block.clone(), preprocessed.obj)
                {
                    warn!("handler failed on block #{num}: {e}");
                    self.shutter.shutdown(Err(Error::Handler(e)));
                    return;
                }
                metrics::BLOCKS_STREAMED_TOTAL.inc();
                self.highest_file_processed_block
                    .fetch_max(num, Ordering::SeqCst);
            }
        }
    }

}

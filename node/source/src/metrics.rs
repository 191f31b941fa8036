// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::core::{AtomicI64, AtomicU64, GenericCounter, GenericGauge};

lazy_static! {
    pub static ref OPEN_FILES: Box<GenericGauge<AtomicI64>> = {
        let open_files = Box::new(
            GenericGauge::<AtomicI64>::new(
                "file_source_open_files",
                "Number of bundle files currently open against the object store",
            )
            .expect("Defining the file_source_open_files metric must succeed"),
        );
        prometheus::default_registry()
            .register(open_files.clone())
            .expect("Registering the file_source_open_files metric with the metrics registry must succeed");
        open_files
    };
    pub static ref BLOCKS_STREAMED_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let blocks_streamed_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "file_source_blocks_streamed_total",
                "Total number of blocks delivered to the sink handler",
            )
            .expect("Defining the file_source_blocks_streamed_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(blocks_streamed_total.clone())
            .expect("Registering the file_source_blocks_streamed_total metric with the metrics registry must succeed");
        blocks_streamed_total
    };
    pub static ref FILE_RETRIES_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let file_retries_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "file_source_file_retries_total",
                "Total number of bundle lookups that found no file and slept",
            )
            .expect("Defining the file_source_file_retries_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(file_retries_total.clone())
            .expect("Registering the file_source_file_retries_total metric with the metrics registry must succeed");
        file_retries_total
    };
}

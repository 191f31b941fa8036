// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::core::{AtomicU64, GenericCounter, GenericCounterVec, Opts};

lazy_static! {
    pub static ref STEPS_EMITTED_TOTAL: Box<GenericCounterVec<AtomicU64>> = {
        let steps_emitted_total = Box::new(
            GenericCounterVec::<AtomicU64>::new(
                Opts::new(
                    "forkable_steps_emitted_total",
                    "Total number of step events emitted downstream, by step kind",
                ),
                &[labels::STEP_KIND],
            )
            .expect("Defining the forkable_steps_emitted_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(steps_emitted_total.clone())
            .expect(
                "Registering the forkable_steps_emitted_total metric with the metrics registry must succeed",
            );
        steps_emitted_total
    };
    pub static ref UNLINKABLE_BLOCKS_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let unlinkable_blocks_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "forkable_unlinkable_blocks_total",
                "Total number of blocks that could not be linked to the tracked DAG",
            )
            .expect("Defining the forkable_unlinkable_blocks_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(unlinkable_blocks_total.clone())
            .expect(
                "Registering the forkable_unlinkable_blocks_total metric with the metrics registry must succeed",
            );
        unlinkable_blocks_total
    };
}

pub mod labels {
    pub const STEP_KIND: &str = "step";
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Metric;

    macro_rules! test_counter {
        ($name:ident) => {
            let _ = $name.metric();
        };
    }

    macro_rules! test_counter_vec {
        ($name:ident) => {
            let _ = $name.with_label_values(&["label"]);
        };
    }
    #[test]
    fn metrics_defined_and_registered() {
        test_counter_vec!(STEPS_EMITTED_TOTAL);
        test_counter!(UNLINKABLE_BLOCKS_TOTAL);
    }
}

//! Per-shard processor counters.

use data_types::ShardId;
use metric::{Registry, U64Counter};

/// The record- and batch-level counters of one shard's processor, all
/// attributed with the shard id.
#[derive(Debug, Clone)]
pub struct ProcessorMetrics {
    pub records_in: U64Counter,
    pub records_filtered: U64Counter,
    pub records_delivered: U64Counter,
    pub records_rejected_unknown_op: U64Counter,
    pub batch_retries: U64Counter,
    pub batch_partial_failures: U64Counter,
    pub batch_total_failures: U64Counter,
}

impl ProcessorMetrics {
    pub fn new(registry: &Registry, shard_id: &ShardId) -> Self {
        let attributes = [("shard_id", shard_id.to_string())];
        Self {
            records_in: registry
                .register_metric::<U64Counter>("records_in", "records fetched from the stream")
                .recorder(attributes.clone()),
            records_filtered: registry
                .register_metric::<U64Counter>(
                    "records_filtered",
                    "records excluded by the filter expression",
                )
                .recorder(attributes.clone()),
            records_delivered: registry
                .register_metric::<U64Counter>(
                    "records_delivered",
                    "records successfully delivered to the sink",
                )
                .recorder(attributes.clone()),
            records_rejected_unknown_op: registry
                .register_metric::<U64Counter>(
                    "records_rejected_unknown_op",
                    "records rejected because their operation could not be classified",
                )
                .recorder(attributes.clone()),
            batch_retries: registry
                .register_metric::<U64Counter>(
                    "batch_retries",
                    "batches that failed delivery and will be refetched",
                )
                .recorder(attributes.clone()),
            batch_partial_failures: registry
                .register_metric::<U64Counter>(
                    "batch_partial_failures",
                    "batches the sink accepted only partially",
                )
                .recorder(attributes.clone()),
            batch_total_failures: registry
                .register_metric::<U64Counter>(
                    "batch_total_failures",
                    "batches the sink rejected entirely",
                )
                .recorder(attributes),
        }
    }
}

//! The default mapper: logs every record as JSON. Useful for smoke
//! testing a stream before wiring a real sink, and as the smallest
//! example of the mapper contract.

use crate::encode::record_envelope_json;
use crate::error::MapperError;
use crate::filter::FilterWiring;
use crate::mapper::{ClientRegistry, TargetMapper};
use async_trait::async_trait;
use data_types::DecodedRecord;
use observability_deps::tracing::info;
use std::sync::Arc;
use stream_config::ConfigDocument;

#[derive(Debug)]
pub struct LogMapper {
    filter: FilterWiring,
}

impl LogMapper {
    pub fn from_config(
        config: &ConfigDocument,
        _clients: &ClientRegistry,
    ) -> Result<Arc<dyn TargetMapper>, MapperError> {
        Ok(Arc::new(Self {
            filter: FilterWiring::from_config(config)?,
        }))
    }
}

#[async_trait]
impl TargetMapper for LogMapper {
    fn name(&self) -> &'static str {
        "LogMapper"
    }

    async fn initialize(&self) -> Result<(), MapperError> {
        info!("initialized log mapper");
        Ok(())
    }

    fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        self.filter.apply(records)
    }

    async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError> {
        for record in records {
            info!(record = %record_envelope_json(record), "cdc record");
        }
        Ok(())
    }
}

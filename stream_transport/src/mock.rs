//! An in-memory [`StreamTransport`] for tests.

use crate::{FetchedBatch, ShardIterator, StreamInfo, StreamTransport, TransportError};
use async_trait::async_trait;
use data_types::{ChangeRecord, Checkpoint, Shard, ShardId, StreamId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

#[derive(Debug)]
struct ShardState {
    shard: Shard,
    records: Vec<ChangeRecord>,
    ended: bool,
    /// Removed shards stay readable but vanish from `list_shards`,
    /// modeling retention lapse after shard end.
    visible: bool,
}

#[derive(Debug)]
struct StreamState {
    info: StreamInfo,
    shards: BTreeMap<ShardId, ShardState>,
}

#[derive(Debug, Default)]
struct State {
    streams: BTreeMap<StreamId, StreamState>,
    injected_failures: VecDeque<TransportError>,
}

/// Shared-state mock: cloning yields handles onto the same stream.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream and returns its id.
    pub fn add_stream(
        &self,
        keyspace: impl Into<String>,
        table: impl Into<String>,
        label: Option<&str>,
    ) -> StreamId {
        let keyspace = keyspace.into();
        let table = table.into();
        let label = label.map(|l| l.to_string());
        let stream_id = StreamId::new(format!(
            "stream/{keyspace}/{table}/{}",
            label.as_deref().unwrap_or("0000")
        ));
        self.state.lock().streams.insert(
            stream_id.clone(),
            StreamState {
                info: StreamInfo {
                    stream_id: stream_id.clone(),
                    keyspace,
                    table,
                    label,
                },
                shards: BTreeMap::new(),
            },
        );
        stream_id
    }

    pub fn add_shard(&self, stream_id: &StreamId, shard: Shard) {
        let mut state = self.state.lock();
        let stream = state.streams.get_mut(stream_id).expect("unknown stream");
        stream.shards.insert(
            shard.shard_id.clone(),
            ShardState {
                shard,
                records: Vec::new(),
                ended: false,
                visible: true,
            },
        );
    }

    pub fn push_record(&self, stream_id: &StreamId, shard_id: &ShardId, record: ChangeRecord) {
        let mut state = self.state.lock();
        let shard = state
            .streams
            .get_mut(stream_id)
            .expect("unknown stream")
            .shards
            .get_mut(shard_id)
            .expect("unknown shard");
        assert!(!shard.ended, "cannot append to an ended shard");
        if let Some(last) = shard.records.last() {
            assert!(
                last.sequence_number < record.sequence_number,
                "records must be appended in sequence order"
            );
        }
        shard.records.push(record);
    }

    /// Marks a shard ended; no further records can be appended.
    pub fn end_shard(&self, stream_id: &StreamId, shard_id: &ShardId) {
        let mut state = self.state.lock();
        state
            .streams
            .get_mut(stream_id)
            .expect("unknown stream")
            .shards
            .get_mut(shard_id)
            .expect("unknown shard")
            .ended = true;
    }

    /// Ends `parent` and registers two children covering its split hash
    /// range. Returns the child ids.
    pub fn split_shard(&self, stream_id: &StreamId, parent: &ShardId) -> (ShardId, ShardId) {
        self.end_shard(stream_id, parent);

        let range = {
            let state = self.state.lock();
            state.streams[stream_id].shards[parent].shard.hash_range
        };
        let (left, right) = range.split();
        let c1 = ShardId::new(format!("{parent}-1"));
        let c2 = ShardId::new(format!("{parent}-2"));
        self.add_shard(stream_id, Shard::child(c1.clone(), parent.clone(), left));
        self.add_shard(stream_id, Shard::child(c2.clone(), parent.clone(), right));
        (c1, c2)
    }

    /// Drops a shard from enumeration, as retention lapse would.
    pub fn remove_shard_from_listing(&self, stream_id: &StreamId, shard_id: &ShardId) {
        let mut state = self.state.lock();
        state
            .streams
            .get_mut(stream_id)
            .expect("unknown stream")
            .shards
            .get_mut(shard_id)
            .expect("unknown shard")
            .visible = false;
    }

    /// Queues an error returned by the next transport call, ahead of
    /// its normal behavior.
    pub fn inject_failure(&self, error: TransportError) {
        self.state.lock().injected_failures.push_back(error);
    }

    fn take_injected_failure(&self) -> Option<TransportError> {
        self.state.lock().injected_failures.pop_front()
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn list_streams(&self) -> Result<Vec<StreamInfo>, TransportError> {
        if let Some(e) = self.take_injected_failure() {
            return Err(e);
        }
        Ok(self
            .state
            .lock()
            .streams
            .values()
            .map(|s| s.info.clone())
            .collect())
    }

    async fn list_shards(&self, stream_id: &StreamId) -> Result<Vec<Shard>, TransportError> {
        if let Some(e) = self.take_injected_failure() {
            return Err(e);
        }
        let state = self.state.lock();
        let stream = state
            .streams
            .get(stream_id)
            .ok_or_else(|| TransportError::StreamNotFound(stream_id.clone()))?;
        Ok(stream
            .shards
            .values()
            .filter(|s| s.visible)
            .map(|s| s.shard.clone())
            .collect())
    }

    async fn open_iterator(
        &self,
        stream_id: &StreamId,
        shard_id: &ShardId,
        position: &Checkpoint,
    ) -> Result<ShardIterator, TransportError> {
        if let Some(e) = self.take_injected_failure() {
            return Err(e);
        }
        let state = self.state.lock();
        let shard = state
            .streams
            .get(stream_id)
            .ok_or_else(|| TransportError::StreamNotFound(stream_id.clone()))?
            .shards
            .get(shard_id)
            .ok_or_else(|| TransportError::ShardNotFound(shard_id.clone()))?;

        let index = match position {
            Checkpoint::TrimHorizon => 0,
            Checkpoint::At(seq) => shard
                .records
                .partition_point(|r| r.sequence_number <= *seq),
            Checkpoint::ShardEnd => shard.records.len(),
        };
        Ok(ShardIterator::new(shard_id.clone(), index.to_string()))
    }

    async fn next(
        &self,
        stream_id: &StreamId,
        iterator: &mut ShardIterator,
        max_records: usize,
    ) -> Result<FetchedBatch, TransportError> {
        if let Some(e) = self.take_injected_failure() {
            return Err(e);
        }
        let state = self.state.lock();
        let shard = state
            .streams
            .get(stream_id)
            .ok_or_else(|| TransportError::StreamNotFound(stream_id.clone()))?
            .shards
            .get(&iterator.shard_id)
            .ok_or_else(|| TransportError::ShardNotFound(iterator.shard_id.clone()))?;

        let index: usize = iterator
            .token()
            .parse()
            .map_err(|_| TransportError::permanent("corrupt iterator token"))?;
        let end = (index + max_records).min(shard.records.len());
        let records = shard.records[index..end].to_vec();

        iterator.set_token(end.to_string());
        let next_checkpoint = if end == 0 {
            Checkpoint::TrimHorizon
        } else {
            Checkpoint::At(shard.records[end - 1].sequence_number.clone())
        };
        Ok(FetchedBatch {
            records,
            next_checkpoint,
            end_of_shard: shard.ended && end == shard.records.len(),
        })
    }
}

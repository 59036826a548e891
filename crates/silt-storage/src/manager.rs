//! Metadata collaborator contracts: object manager and stream manager.
//!
//! The object manager allocates contiguous object id ranges and publishes
//! committed objects; the stream manager reports which streams are open
//! and closes them after recovery. Both ship with in-memory
//! implementations used by tests and local development.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use silt_core::error::StorageResult;
use silt_core::object::{ObjectManifest, StreamObjectManifest};
use silt_core::stream::StreamMetadata;

/// Object metadata service.
#[async_trait]
pub trait ObjectManager: Send + Sync {
    /// Reserves `count` contiguous object ids and returns the first.
    ///
    /// The reservation expires after `ttl_ms` if never committed.
    async fn prepare(&self, count: usize, ttl_ms: u64) -> StorageResult<u64>;

    /// Atomically publishes a stream-set object together with the stream
    /// objects split out of the same cache block. `compacted_object_ids`
    /// names objects superseded by this commit.
    async fn commit_stream_set_object(
        &self,
        manifest: ObjectManifest,
        stream_objects: Vec<StreamObjectManifest>,
        compacted_object_ids: Vec<u64>,
    ) -> StorageResult<()>;

    /// Publishes a standalone stream object produced from `source_object_ids`.
    async fn commit_stream_object(
        &self,
        manifest: StreamObjectManifest,
        source_object_ids: Vec<u64>,
    ) -> StorageResult<()>;
}

/// Stream metadata service.
#[async_trait]
pub trait StreamManager: Send + Sync {
    /// Streams currently open for this node, with their committed end
    /// offsets.
    async fn get_opening_streams(&self) -> StorageResult<Vec<StreamMetadata>>;

    /// Closes a stream under the given writer epoch.
    async fn close_stream(&self, stream_id: u64, epoch: u64) -> StorageResult<()>;
}

/// One published stream-set commit, as observed by tests.
#[derive(Debug, Clone)]
pub struct CommittedUpload {
    pub manifest: ObjectManifest,
    pub stream_objects: Vec<StreamObjectManifest>,
}

/// In-memory [`ObjectManager`] recording commits in publication order.
#[derive(Clone, Default)]
pub struct MemoryObjectManager {
    state: Arc<Mutex<ObjectManagerState>>,
}

#[derive(Default)]
struct ObjectManagerState {
    next_id: u64,
    committed: Vec<CommittedUpload>,
    stream_object_commits: Vec<StreamObjectManifest>,
}

impl MemoryObjectManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream-set commits in the order they were published.
    #[must_use]
    pub fn committed(&self) -> Vec<CommittedUpload> {
        self.state.lock().committed.clone()
    }

    /// Object ids of stream-set commits, in publication order.
    #[must_use]
    pub fn committed_object_ids(&self) -> Vec<u64> {
        self.state
            .lock()
            .committed
            .iter()
            .map(|c| c.manifest.object_id)
            .collect()
    }

    /// Standalone stream-object commits, in publication order.
    #[must_use]
    pub fn committed_stream_objects(&self) -> Vec<StreamObjectManifest> {
        self.state.lock().stream_object_commits.clone()
    }
}

#[async_trait]
impl ObjectManager for MemoryObjectManager {
    async fn prepare(&self, count: usize, _ttl_ms: u64) -> StorageResult<u64> {
        let mut state = self.state.lock();
        let first = state.next_id;
        state.next_id += count as u64;
        Ok(first)
    }

    async fn commit_stream_set_object(
        &self,
        manifest: ObjectManifest,
        stream_objects: Vec<StreamObjectManifest>,
        _compacted_object_ids: Vec<u64>,
    ) -> StorageResult<()> {
        self.state.lock().committed.push(CommittedUpload {
            manifest,
            stream_objects,
        });
        Ok(())
    }

    async fn commit_stream_object(
        &self,
        manifest: StreamObjectManifest,
        _source_object_ids: Vec<u64>,
    ) -> StorageResult<()> {
        self.state.lock().stream_object_commits.push(manifest);
        Ok(())
    }
}

/// In-memory [`StreamManager`] seeded by tests.
#[derive(Clone, Default)]
pub struct MemoryStreamManager {
    state: Arc<Mutex<StreamManagerState>>,
}

#[derive(Default)]
struct StreamManagerState {
    streams: Vec<StreamMetadata>,
    closed: Vec<(u64, u64)>, // (stream_id, epoch)
}

impl MemoryStreamManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set of open streams.
    pub fn set_streams(&self, streams: Vec<StreamMetadata>) {
        self.state.lock().streams = streams;
    }

    /// `(stream_id, epoch)` pairs closed so far, in call order.
    #[must_use]
    pub fn closed_streams(&self) -> Vec<(u64, u64)> {
        self.state.lock().closed.clone()
    }
}

#[async_trait]
impl StreamManager for MemoryStreamManager {
    async fn get_opening_streams(&self) -> StorageResult<Vec<StreamMetadata>> {
        Ok(self.state.lock().streams.clone())
    }

    async fn close_stream(&self, stream_id: u64, epoch: u64) -> StorageResult<()> {
        self.state.lock().closed.push((stream_id, epoch));
        Ok(())
    }
}

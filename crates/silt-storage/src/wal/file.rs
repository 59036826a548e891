//! Segmented file-backed WAL device.
//!
//! # File Format
//! - Filename: `wal-{offset_hex}.log` where `offset_hex` is the offset of
//!   the first frame in the file.
//! - Content: length-prefixed frames: `len: u32 BE | crc32: u32 BE | data`.
//! - A frame's offset is the file's base offset plus its index in the file.
//!
//! # Durability
//! Appends are handed to a dedicated writer thread over a channel. The
//! writer drains whatever is queued, writes the frames, fsyncs once, and
//! only then acknowledges the whole group. Trim deletes whole segment
//! files whose frames all precede the trim offset.
//!
//! # Crash Recovery
//! On startup the device scans all segment files in base-offset order and
//! replays intact frames. A torn or corrupt frame ends the scan; the
//! sequence continues after the last intact frame.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use silt_core::error::{StorageError, StorageResult};

use super::{send_ack, RecoveredRecord, WalAppendHandle, WalDevice};

const FRAME_HEADER_SIZE: usize = 8;

/// Configuration for [`FileWal`].
#[derive(Debug, Clone)]
pub struct FileWalConfig {
    /// Segment file size triggering rotation.
    pub segment_size_bytes: u64,
    /// Untrimmed bytes above which appends fail with over-capacity.
    pub capacity_bytes: u64,
    /// fsync after every write group. Disable only for tests.
    pub sync_on_write: bool,
}

impl Default for FileWalConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: 64 * 1024 * 1024, // 64MB
            capacity_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            sync_on_write: true,
        }
    }
}

enum Command {
    Append {
        offset: u64,
        data: Bytes,
        ack: oneshot::Sender<StorageResult<()>>,
    },
    Trim(u64),
    Reset(oneshot::Sender<StorageResult<()>>),
    Shutdown,
}

struct Shared {
    next_offset: u64,
    live_bytes: u64,
    started: bool,
    shutdown: bool,
    tx: Option<mpsc::Sender<Command>>,
}

/// Segmented file-backed [`WalDevice`].
pub struct FileWal {
    dir: PathBuf,
    config: FileWalConfig,
    shared: Arc<Mutex<Shared>>,
    writer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FileWal {
    /// Creates the device rooted at `dir`. The directory is created on
    /// [`WalDevice::start`].
    #[must_use]
    pub fn new(dir: impl AsRef<Path>, config: FileWalConfig) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            config,
            shared: Arc::new(Mutex::new(Shared {
                next_offset: 0,
                live_bytes: 0,
                started: false,
                shutdown: false,
                tx: None,
            })),
            writer: Mutex::new(None),
        }
    }

    /// Segment files under `dir` sorted by base offset.
    fn segment_files(dir: &Path) -> StorageResult<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().map_or(true, |e| e != "log") {
                continue;
            }
            if let Some(hex) = stem.strip_prefix("wal-") {
                if let Ok(base) = u64::from_str_radix(hex, 16) {
                    segments.push((base, path));
                }
            }
        }
        segments.sort_by_key(|(base, _)| *base);
        Ok(segments)
    }

    /// Reads intact frames from one segment file. Stops at the first torn
    /// or corrupt frame.
    fn read_segment(base: u64, path: &Path) -> StorageResult<Vec<RecoveredRecord>> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        let mut index = 0u64;
        while buf.len() >= pos + FRAME_HEADER_SIZE {
            let len = BigEndian::read_u32(&buf[pos..pos + 4]) as usize;
            let crc = BigEndian::read_u32(&buf[pos + 4..pos + 8]);
            let data_start = pos + FRAME_HEADER_SIZE;
            if buf.len() < data_start + len {
                warn!(path = %path.display(), frame = index, "torn WAL frame, ending scan");
                break;
            }
            let data = &buf[data_start..data_start + len];
            if crc32fast::hash(data) != crc {
                warn!(path = %path.display(), frame = index, "corrupt WAL frame, ending scan");
                break;
            }
            records.push(RecoveredRecord {
                offset: base + index,
                data: Bytes::copy_from_slice(data),
            });
            pos = data_start + len;
            index += 1;
        }
        Ok(records)
    }

    fn sender(&self) -> StorageResult<mpsc::Sender<Command>> {
        let shared = self.shared.lock();
        if shared.shutdown {
            return Err(StorageError::Shutdown);
        }
        shared
            .tx
            .clone()
            .ok_or_else(|| StorageError::storage("WAL device not started"))
    }
}

struct OpenSegment {
    base: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
}

struct WriterLoop {
    dir: PathBuf,
    config: FileWalConfig,
    shared: Arc<Mutex<Shared>>,
    segments: Vec<(u64, PathBuf, u64)>, // base, path, size (sealed)
    current: Option<OpenSegment>,
}

impl WriterLoop {
    fn run(mut self, rx: mpsc::Receiver<Command>) {
        while let Ok(command) = rx.recv() {
            let mut batch = vec![command];
            // Group commit: take everything already queued before syncing.
            while let Ok(next) = rx.try_recv() {
                batch.push(next);
            }

            let mut acks: Vec<(oneshot::Sender<StorageResult<()>>, StorageResult<()>)> =
                Vec::new();
            let mut stop = false;
            for command in batch {
                match command {
                    Command::Append { offset, data, ack } => {
                        let result = self.write_frame(offset, &data);
                        acks.push((ack, result));
                    }
                    Command::Trim(offset) => self.trim(offset),
                    Command::Reset(ack) => {
                        let result = self.reset();
                        acks.push((ack, result));
                    }
                    Command::Shutdown => stop = true,
                }
            }

            let sync_result = self.sync();
            for (ack, write_result) in acks {
                let result = match (&sync_result, write_result) {
                    (Err(e), Ok(())) => Err(StorageError::storage(format!(
                        "WAL sync failed: {}",
                        e
                    ))),
                    (_, result) => result,
                };
                send_ack(ack, result);
            }
            if stop {
                let _ = self.sync();
                break;
            }
        }
    }

    fn write_frame(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let frame_len = (FRAME_HEADER_SIZE + data.len()) as u64;
        let rotate = match &self.current {
            Some(segment) => segment.len >= self.config.segment_size_bytes,
            None => true,
        };
        if rotate {
            self.rotate(offset)?;
        }

        let segment = self
            .current
            .as_mut()
            .ok_or_else(|| StorageError::storage("WAL writer has no open segment"))?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        BigEndian::write_u32(&mut header[..4], data.len() as u32);
        BigEndian::write_u32(&mut header[4..], crc32fast::hash(data));
        segment.writer.write_all(&header)?;
        segment.writer.write_all(data)?;
        segment.len += frame_len;
        Ok(())
    }

    fn rotate(&mut self, first_offset: u64) -> StorageResult<()> {
        if let Some(segment) = self.current.take() {
            let mut writer = segment.writer;
            writer.flush()?;
            if self.config.sync_on_write {
                writer.get_ref().sync_all()?;
            }
            self.segments.push((segment.base, segment.path, segment.len));
        }
        let path = self.dir.join(format!("wal-{:016x}.log", first_offset));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current = Some(OpenSegment {
            base: first_offset,
            path,
            writer: BufWriter::new(file),
            len: 0,
        });
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if let Some(segment) = self.current.as_mut() {
            segment.writer.flush()?;
            if self.config.sync_on_write {
                segment.writer.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    /// Deletes sealed segments whose frames all precede `offset`. The
    /// active segment is never deleted.
    fn trim(&mut self, offset: u64) {
        let bound = self
            .current
            .as_ref()
            .map(|s| s.base)
            .unwrap_or(u64::MAX);
        let mut kept = Vec::with_capacity(self.segments.len());
        let mut freed = 0u64;
        for i in 0..self.segments.len() {
            let next_base = self
                .segments
                .get(i + 1)
                .map(|(base, _, _)| *base)
                .unwrap_or(bound);
            let (base, path, size) = &self.segments[i];
            // next_base - 1 is the last offset stored in this segment.
            if next_base != u64::MAX && next_base.saturating_sub(1) <= offset {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to delete trimmed WAL segment");
                    kept.push((*base, path.clone(), *size));
                } else {
                    freed += size;
                }
            } else {
                kept.push((*base, path.clone(), *size));
            }
        }
        self.segments = kept;
        if freed > 0 {
            let mut shared = self.shared.lock();
            shared.live_bytes = shared.live_bytes.saturating_sub(freed);
        }
    }

    fn reset(&mut self) -> StorageResult<()> {
        if let Some(segment) = self.current.take() {
            drop(segment.writer);
            std::fs::remove_file(&segment.path)?;
        }
        for (_, path, _) in self.segments.drain(..) {
            std::fs::remove_file(&path)?;
        }
        self.shared.lock().live_bytes = 0;
        Ok(())
    }
}

#[async_trait::async_trait]
impl WalDevice for FileWal {
    async fn start(&self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir)?;

        let mut segments = Vec::new();
        let mut next_offset = 0u64;
        let mut live_bytes = 0u64;
        for (base, path) in Self::segment_files(&self.dir)? {
            let records = Self::read_segment(base, &path)?;
            if let Some(last) = records.last() {
                next_offset = next_offset.max(last.offset + 1);
            } else {
                next_offset = next_offset.max(base);
            }
            let size = std::fs::metadata(&path)?.len();
            live_bytes += size;
            segments.push((base, path, size));
        }

        let (tx, rx) = mpsc::channel();
        {
            let mut shared = self.shared.lock();
            if shared.started {
                return Err(StorageError::storage("WAL device already started"));
            }
            shared.started = true;
            shared.next_offset = next_offset;
            shared.live_bytes = live_bytes;
            shared.tx = Some(tx);
        }

        let writer = WriterLoop {
            dir: self.dir.clone(),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            segments,
            current: None,
        };
        let handle = std::thread::Builder::new()
            .name("silt-wal-writer".to_string())
            .spawn(move || writer.run(rx))
            .map_err(|e| StorageError::storage(format!("failed to spawn WAL writer: {}", e)))?;
        *self.writer.lock() = Some(handle);
        Ok(())
    }

    fn append(&self, data: Bytes) -> StorageResult<WalAppendHandle> {
        let frame_len = (FRAME_HEADER_SIZE + data.len()) as u64;
        let (offset, tx) = {
            let mut shared = self.shared.lock();
            if shared.shutdown {
                return Err(StorageError::Shutdown);
            }
            let Some(tx) = shared.tx.clone() else {
                return Err(StorageError::storage("WAL device not started"));
            };
            if shared.live_bytes + frame_len > self.config.capacity_bytes {
                return Err(StorageError::WalOverCapacity);
            }
            let offset = shared.next_offset;
            shared.next_offset += 1;
            shared.live_bytes += frame_len;
            (offset, tx)
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Command::Append {
            offset,
            data,
            ack: ack_tx,
        })
        .map_err(|_| StorageError::storage("WAL writer is gone"))?;
        Ok(WalAppendHandle {
            offset,
            ack: ack_rx,
        })
    }

    async fn recover(&self) -> StorageResult<Vec<RecoveredRecord>> {
        let dir = self.dir.clone();
        let segments = Self::segment_files(&dir)?;
        let mut records = Vec::new();
        for (base, path) in segments {
            records.extend(Self::read_segment(base, &path)?);
        }
        records.sort_by_key(|r| r.offset);
        Ok(records)
    }

    async fn reset(&self) -> StorageResult<()> {
        let tx = self.sender()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Command::Reset(ack_tx))
            .map_err(|_| StorageError::storage("WAL writer is gone"))?;
        ack_rx
            .await
            .map_err(|_| StorageError::storage("WAL writer dropped reset acknowledgement"))?
    }

    fn trim(&self, offset: u64) {
        if let Ok(tx) = self.sender() {
            let _ = tx.send(Command::Trim(offset));
        }
    }

    async fn shutdown_gracefully(&self) -> StorageResult<()> {
        let handle = {
            let mut shared = self.shared.lock();
            if shared.shutdown {
                return Ok(());
            }
            shared.shutdown = true;
            if let Some(tx) = shared.tx.take() {
                let _ = tx.send(Command::Shutdown);
            }
            self.writer.lock().take()
        };
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await
            .map_err(|e| StorageError::storage(format!("WAL writer join failed: {}", e)))?;
        }
        Ok(())
    }
}

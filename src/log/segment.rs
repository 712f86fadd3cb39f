// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single file-backed chunk of a partition log.
//!
//! A segment owns one data file and one sparse index file, both named after
//! the segment's start offset. Only the active segment of a partition is
//! mutable; once rolled it is closed, its index is trimmed and it is only
//! read from until the expiration sweep deletes it.
//!
//! Offsets are tracked with an exclusive end: `last` is the offset the next
//! appended record would receive, so an empty segment has `last == start`.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::log::index_file::{ReadOnlyIndexFile, WritableIndexFile};
use crate::log::record_view::RecordView;
use crate::log::{now_ms, segment_file_path, INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX};
use crate::message::{encode_record, encoded_size, RecordHeader, TopicPartition, RECORD_HEADER_SIZE};
use crate::service::StoreConfig;
use crate::{AppError, AppResult};

#[derive(Debug)]
enum SegmentIndex {
    Active(WritableIndexFile),
    ReadOnly(ReadOnlyIndexFile),
    /// index could not be converted on close, lookups scan from the start
    Detached,
}

impl SegmentIndex {
    fn lookup(&self, relative_offset: u32) -> (u32, u32) {
        let entry = match self {
            SegmentIndex::Active(index) => index.lookup(relative_offset),
            SegmentIndex::ReadOnly(index) => index.lookup(relative_offset),
            SegmentIndex::Detached => None,
        };
        entry.unwrap_or((0, 0))
    }
}

/// What a frame scan over a data file found.
#[derive(Debug, Default, Clone, Copy)]
struct ScanResult {
    end_position: u64,
    records: i64,
    last_timestamp: Option<i64>,
    /// the scan stopped before the end of the file
    truncated: bool,
}

#[derive(Debug)]
pub struct Segment {
    topic_partition: TopicPartition,
    start: i64,
    data_path: PathBuf,
    index_path: PathBuf,
    file: File,
    /// The write lock also serializes appends, close and truncation.
    index: RwLock<SegmentIndex>,
    bytes_since_last_entry: AtomicCell<usize>,
    index_interval_bytes: usize,
    flush_dirty_bytes: u64,

    last: AtomicI64,
    commit_last: AtomicI64,
    cached_size: AtomicU64,
    commit_size: AtomicU64,
    /// bumped by every truncation, lets an unlocked sync detect one
    truncations: AtomicU64,
    last_append_time: AtomicI64,
    created_time: i64,

    mutable: AtomicCell<bool>,
    closed: AtomicCell<bool>,
    expired: AtomicCell<bool>,
    ref_count: AtomicUsize,
}

impl Segment {
    /// Creates an empty, mutable segment starting at `start`.
    pub fn create(
        topic_partition: &TopicPartition,
        dir: impl AsRef<Path>,
        start: i64,
        config: &StoreConfig,
    ) -> AppResult<Self> {
        let data_path = segment_file_path(dir.as_ref(), start, LOG_FILE_SUFFIX);
        let index_path = segment_file_path(dir.as_ref(), start, INDEX_FILE_SUFFIX);

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)
            .map_err(|e| {
                AppError::DetailedIoError(format!(
                    "create segment file {}: {}",
                    data_path.display(),
                    e
                ))
            })?;
        let index = WritableIndexFile::create(&index_path, config.index_file_size)?;

        debug!(%topic_partition, start, "created segment");
        Ok(Self::assemble(
            topic_partition,
            start,
            data_path,
            index_path,
            file,
            SegmentIndex::Active(index),
            config,
            ScanResult::default(),
            true,
        ))
    }

    /// Opens a segment left on disk by a previous run.
    ///
    /// With `full_scan` every frame is read back and CRC checked, the file is
    /// truncated at the first incomplete or corrupt frame and the index is
    /// rebuilt. Otherwise the trimmed index is trusted and only the frames
    /// after its last entry are walked. A `mutable` segment always gets a
    /// full scan since its index is still pre-allocated.
    pub fn recover(
        topic_partition: &TopicPartition,
        dir: impl AsRef<Path>,
        start: i64,
        config: &StoreConfig,
        full_scan: bool,
        mutable: bool,
    ) -> AppResult<Self> {
        let data_path = segment_file_path(dir.as_ref(), start, LOG_FILE_SUFFIX);
        let index_path = segment_file_path(dir.as_ref(), start, INDEX_FILE_SUFFIX);
        let file = File::options().read(true).write(true).open(&data_path)?;
        let file_len = file.metadata()?.len();

        if !full_scan && !mutable && index_path.exists() {
            let index = ReadOnlyIndexFile::open(&index_path)?;
            if index.is_consistent(file_len) {
                let (relative_offset, position) = index.last_entry().unwrap_or((0, 0));
                let tail = scan_frames(&file, position as u64, file_len, false, |_, _, _| Ok(()))?;
                if !tail.truncated {
                    let scan = ScanResult {
                        records: relative_offset as i64 + tail.records,
                        ..tail
                    };
                    trace!(%topic_partition, start, records = scan.records, "segment loaded from index");
                    return Ok(Self::assemble(
                        topic_partition,
                        start,
                        data_path,
                        index_path,
                        file,
                        SegmentIndex::ReadOnly(index),
                        config,
                        scan,
                        false,
                    ));
                }
            }
            warn!(%topic_partition, start, "segment index does not match its data file, rebuilding");
        }

        let mut index = WritableIndexFile::create(&index_path, config.index_file_size)?;
        let mut bytes_since_last_entry = 0usize;
        let scan = scan_frames(&file, 0, file_len, true, |record_no, position, frame_size| {
            if bytes_since_last_entry >= config.index_interval_bytes && !index.is_full() {
                index.add_entry(record_no as u32, position as u32)?;
                bytes_since_last_entry = 0;
            }
            bytes_since_last_entry += frame_size as usize;
            Ok(())
        })?;

        if scan.truncated {
            warn!(
                %topic_partition,
                start,
                valid_bytes = scan.end_position,
                file_len,
                "truncating segment at first invalid frame"
            );
            file.set_len(scan.end_position)?;
            file.sync_all()?;
        }

        let index = if mutable {
            SegmentIndex::Active(index)
        } else {
            SegmentIndex::ReadOnly(index.into_readonly()?)
        };

        info!(%topic_partition, start, records = scan.records, mutable, "segment recovered");
        let segment = Self::assemble(
            topic_partition,
            start,
            data_path,
            index_path,
            file,
            index,
            config,
            scan,
            mutable,
        );
        segment.bytes_since_last_entry.store(bytes_since_last_entry);
        Ok(segment)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        topic_partition: &TopicPartition,
        start: i64,
        data_path: PathBuf,
        index_path: PathBuf,
        file: File,
        index: SegmentIndex,
        config: &StoreConfig,
        scan: ScanResult,
        mutable: bool,
    ) -> Self {
        let last = start + scan.records;
        Self {
            topic_partition: topic_partition.clone(),
            start,
            data_path,
            index_path,
            file,
            index: RwLock::new(index),
            bytes_since_last_entry: AtomicCell::new(0),
            index_interval_bytes: config.index_interval_bytes,
            flush_dirty_bytes: config.flush_dirty_bytes,
            last: AtomicI64::new(last),
            commit_last: AtomicI64::new(last),
            cached_size: AtomicU64::new(scan.end_position),
            commit_size: AtomicU64::new(scan.end_position),
            truncations: AtomicU64::new(0),
            last_append_time: AtomicI64::new(scan.last_timestamp.unwrap_or_else(now_ms)),
            created_time: now_ms(),
            mutable: AtomicCell::new(mutable),
            closed: AtomicCell::new(!mutable),
            expired: AtomicCell::new(false),
            ref_count: AtomicUsize::new(0),
        }
    }

    /// Appends a batch of records stamped with `timestamp` and returns the
    /// offset assigned to the first one.
    ///
    /// The owning store guarantees a single writer; the index write lock
    /// additionally keeps appends apart from close and truncation.
    pub fn append(&self, payloads: &[Bytes], timestamp: i64) -> AppResult<i64> {
        if payloads.is_empty() {
            return Err(AppError::InvalidValue(format!(
                "empty record batch for segment {} of {}",
                self.start, self.topic_partition
            )));
        }

        let mut index = self.index.write();
        if self.closed.load() || !self.mutable.load() {
            return Err(AppError::SegmentClosed { start: self.start });
        }

        let first_offset = self.last.load(Ordering::Acquire);
        let position = self.cached_size.load(Ordering::Acquire);
        let batch_size: usize = payloads.iter().map(|p| encoded_size(p)).sum();
        let end_position = position + batch_size as u64;
        let end_relative = first_offset + payloads.len() as i64 - self.start;
        if end_position > u32::MAX as u64 || end_relative > u32::MAX as i64 {
            return Err(AppError::InvalidValue(format!(
                "segment {} of {} can not address {} more bytes",
                self.start, self.topic_partition, batch_size
            )));
        }

        let mut buf = BytesMut::with_capacity(batch_size);
        let mut entries = Vec::new();
        let mut bytes_since_last_entry = self.bytes_since_last_entry.load();
        for (i, payload) in payloads.iter().enumerate() {
            if bytes_since_last_entry >= self.index_interval_bytes {
                let relative_offset = first_offset + i as i64 - self.start;
                entries.push((relative_offset as u32, (position + buf.len() as u64) as u32));
                bytes_since_last_entry = 0;
            }
            bytes_since_last_entry += encoded_size(payload);
            encode_record(&mut buf, timestamp, payload);
        }

        self.file.write_all_at(&buf, position).map_err(|e| {
            AppError::DetailedIoError(format!(
                "append to segment {} of {}: {}",
                self.start, self.topic_partition, e
            ))
        })?;

        if let SegmentIndex::Active(index) = &mut *index {
            for (relative_offset, entry_position) in entries {
                if index.is_full() {
                    break;
                }
                index.add_entry(relative_offset, entry_position)?;
            }
        }
        self.bytes_since_last_entry.store(bytes_since_last_entry);

        // size first so that a reader observing `last` finds the bytes
        self.cached_size.store(end_position, Ordering::Release);
        self.last
            .store(first_offset + payloads.len() as i64, Ordering::Release);
        self.last_append_time.store(timestamp, Ordering::Release);

        trace!(
            topic_partition = %self.topic_partition,
            segment = self.start,
            first_offset,
            records = payloads.len(),
            bytes = batch_size,
            "appended record batch"
        );
        Ok(first_offset)
    }

    /// Syncs appended bytes to disk and returns the durable end offset.
    ///
    /// Without `force` the sync is skipped while fewer than
    /// `flush_dirty_bytes` are pending. Calling it again with nothing new
    /// appended changes nothing.
    pub fn flush(&self, force: bool) -> AppResult<i64> {
        let truncations = self.truncations.load(Ordering::Acquire);
        let last = self.last.load(Ordering::Acquire);
        let size = self.cached_size.load(Ordering::Acquire);
        let dirty = size.saturating_sub(self.commit_size.load(Ordering::Acquire));
        if dirty == 0 || (!force && dirty < self.flush_dirty_bytes) {
            return Ok(self.commit_last.load(Ordering::Acquire));
        }

        // appends keep going while the data file syncs
        self.sync_data()?;
        let index = self.index.read();
        if self.truncations.load(Ordering::Acquire) != truncations {
            return Ok(self.commit_last.load(Ordering::Acquire));
        }
        self.publish_sync(&index, last, size)
    }

    fn sync_data(&self) -> AppResult<()> {
        self.file.sync_data().map_err(|e| {
            AppError::DetailedIoError(format!(
                "flush segment {} of {}: {}",
                self.start, self.topic_partition, e
            ))
        })
    }

    fn sync_to(&self, index: &SegmentIndex, last: i64, size: u64) -> AppResult<i64> {
        self.sync_data()?;
        self.publish_sync(index, last, size)
    }

    /// Flushes the index and advances the durable end once the data file
    /// holds everything up to `size`.
    fn publish_sync(&self, index: &SegmentIndex, last: i64, size: u64) -> AppResult<i64> {
        if let SegmentIndex::Active(index) = index {
            index.flush()?;
        }
        self.commit_size.fetch_max(size, Ordering::AcqRel);
        let commit_last = self.commit_last.fetch_max(last, Ordering::AcqRel).max(last);
        trace!(
            topic_partition = %self.topic_partition,
            segment = self.start,
            commit_last,
            "segment flushed"
        );
        Ok(commit_last)
    }

    /// Flushes pending data, trims the index and closes the segment for
    /// appends. A second call is a no-op.
    pub fn close(&self) -> AppResult<()> {
        let mut index = self.index.write();
        if self.closed.load() {
            return Ok(());
        }

        let last = self.last.load(Ordering::Acquire);
        let size = self.cached_size.load(Ordering::Acquire);
        self.sync_to(&index, last, size)?;
        self.mutable.store(false);

        if matches!(&*index, SegmentIndex::Active(_)) {
            if let SegmentIndex::Active(writable) =
                std::mem::replace(&mut *index, SegmentIndex::Detached)
            {
                match writable.into_readonly() {
                    Ok(readonly) => *index = SegmentIndex::ReadOnly(readonly),
                    Err(e) => warn!(
                        topic_partition = %self.topic_partition,
                        segment = self.start,
                        error = %e,
                        "can not trim index of closed segment"
                    ),
                }
            }
        }
        self.closed.store(true);
        debug!(topic_partition = %self.topic_partition, segment = self.start, last, "segment closed");
        Ok(())
    }

    /// Marks the segment expired once its newest record is older than
    /// `max_valid_time_ms` at `check_timestamp`. Returns 1 when the segment
    /// is expired, 0 otherwise. The active segment never expires.
    pub fn check_and_set_expired(&self, check_timestamp: i64, max_valid_time_ms: i64) -> i32 {
        if self.expired.load() {
            return 1;
        }
        if self.mutable.load() || max_valid_time_ms <= 0 {
            return 0;
        }
        let newest = self.last_append_time.load(Ordering::Acquire);
        if check_timestamp - newest > max_valid_time_ms {
            self.expired.store(true);
            debug!(
                topic_partition = %self.topic_partition,
                segment = self.start,
                newest,
                "segment expired"
            );
            return 1;
        }
        0
    }

    /// Acquires a view starting at `from_offset` holding whole records up to
    /// `max_bytes`, but at least one record if any is left. `from_offset`
    /// equal to `last` yields an empty view.
    pub fn get_view_ref(self: &Arc<Self>, from_offset: i64, max_bytes: u64) -> AppResult<RecordView> {
        self.acquire_view_ref();
        self.view_from_acquired(from_offset, max_bytes)
    }

    /// Takes a view reference ahead of [`view_from_acquired`](Self::view_from_acquired),
    /// letting the caller pin the segment under its own lock and scan
    /// after releasing it.
    pub(crate) fn acquire_view_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Builds a view on a reference already taken with
    /// [`acquire_view_ref`](Self::acquire_view_ref). The reference moves into
    /// the view, or is released when this fails.
    pub(crate) fn view_from_acquired(
        self: &Arc<Self>,
        from_offset: i64,
        max_bytes: u64,
    ) -> AppResult<RecordView> {
        match self.locate_view(from_offset, max_bytes) {
            Ok((position, len, records)) => Ok(RecordView::new(
                self.clone(),
                from_offset,
                position,
                len,
                records,
            )),
            Err(e) => {
                self.rel_view_ref();
                Err(e)
            }
        }
    }

    /// Start position, byte length and record count of the view at
    /// `from_offset`.
    fn locate_view(&self, from_offset: i64, max_bytes: u64) -> AppResult<(u64, u64, i64)> {
        let last = self.last.load(Ordering::Acquire);
        let size = self.cached_size.load(Ordering::Acquire);
        if from_offset < self.start || from_offset > last {
            return Err(AppError::OutOfRange(format!(
                "offset {} outside segment [{}, {}] of {}",
                from_offset, self.start, last, self.topic_partition
            )));
        }

        let position = self.position_of(from_offset, size)?;
        let mut end = position;
        let mut offset = from_offset;
        while offset < last {
            let header = self.read_header(end, size)?;
            let frame_end = end + header.frame_size();
            if frame_end - position > max_bytes && offset > from_offset {
                break;
            }
            end = frame_end;
            offset += 1;
        }
        Ok((position, end - position, offset - from_offset))
    }

    /// Acquires a view over every record currently in the segment.
    pub fn get_full_view_ref(self: &Arc<Self>) -> AppResult<RecordView> {
        let last = self.last.load(Ordering::Acquire);
        let size = self.cached_size.load(Ordering::Acquire);
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(RecordView::new(
            self.clone(),
            self.start,
            0,
            size,
            last - self.start,
        ))
    }

    /// Releases a view acquired from this segment. Called when a
    /// [`RecordView`] is dropped.
    pub fn rel_view_ref(&self) {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        if previous.is_err() {
            warn!(
                topic_partition = %self.topic_partition,
                segment = self.start,
                "released a view that was never acquired"
            );
        }
    }

    /// Discards everything written after the last successful flush.
    pub fn truncate_to_commit(&self) -> AppResult<()> {
        let mut index = self.index.write();
        let SegmentIndex::Active(writable) = &mut *index else {
            return Err(AppError::InvalidOperation(format!(
                "closed segment {} of {} can not be truncated",
                self.start, self.topic_partition
            )));
        };

        let commit_size = self.commit_size.load(Ordering::Acquire);
        let commit_last = self.commit_last.load(Ordering::Acquire);
        self.file.set_len(commit_size)?;
        self.file.sync_all()?;
        writable.truncate_to_position(commit_size as u32);
        writable.flush()?;

        self.bytes_since_last_entry
            .store(bytes_since_last_entry(writable, commit_size));
        self.cached_size.store(commit_size, Ordering::Release);
        self.last.store(commit_last, Ordering::Release);
        self.truncations.fetch_add(1, Ordering::AcqRel);
        info!(
            topic_partition = %self.topic_partition,
            segment = self.start,
            commit_last,
            commit_size,
            "segment truncated to last flush"
        );
        Ok(())
    }

    /// Removes the segment's files. The owning store only calls this for
    /// expired segments without outstanding views.
    pub fn delete(&self) -> AppResult<()> {
        if self.ref_count() > 0 {
            return Err(AppError::IllegalState(format!(
                "segment {} of {} still has {} views",
                self.start,
                self.topic_partition,
                self.ref_count()
            )));
        }
        self.mutable.store(false);
        self.closed.store(true);
        for path in [&self.data_path, &self.index_path] {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        info!(topic_partition = %self.topic_partition, segment = self.start, "segment deleted");
        Ok(())
    }

    /// Reads `len` bytes of the data file at `position`.
    pub fn read_at(&self, position: u64, len: u64) -> AppResult<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, position).map_err(|e| {
            AppError::DetailedIoError(format!(
                "read {} bytes at {} of segment {}: {}",
                len,
                position,
                self.data_path.display(),
                e
            ))
        })?;
        Ok(Bytes::from(buf))
    }

    fn read_header(&self, position: u64, size: u64) -> AppResult<RecordHeader> {
        if position + RECORD_HEADER_SIZE as u64 > size {
            return Err(AppError::CorruptRecord(format!(
                "record header at {} past end {} of segment {}",
                position,
                size,
                self.data_path.display()
            )));
        }
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact_at(&mut buf, position)?;
        RecordHeader::parse(&buf)
    }

    /// Byte position of the frame holding `offset`, `size` when `offset` is
    /// the segment's end.
    fn position_of(&self, offset: i64, size: u64) -> AppResult<u64> {
        let relative_offset = (offset - self.start) as u32;
        let (entry_offset, entry_position) = self.index.read().lookup(relative_offset);
        let mut current = self.start + entry_offset as i64;
        let mut position = entry_position as u64;
        while current < offset {
            position += self.read_header(position, size)?.frame_size();
            current += 1;
        }
        Ok(position)
    }

    pub fn contains(&self, offset: i64) -> bool {
        offset >= self.start && offset < self.last.load(Ordering::Acquire)
    }

    pub fn index_full(&self) -> bool {
        matches!(&*self.index.read(), SegmentIndex::Active(index) if index.is_full())
    }

    pub fn get_start(&self) -> i64 {
        self.start
    }

    pub fn get_last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    pub fn get_commit_last(&self) -> i64 {
        self.commit_last.load(Ordering::Acquire)
    }

    pub fn get_cached_size(&self) -> u64 {
        self.cached_size.load(Ordering::Acquire)
    }

    pub fn get_commit_size(&self) -> u64 {
        self.commit_size.load(Ordering::Acquire)
    }

    pub fn last_append_time(&self) -> i64 {
        self.last_append_time.load(Ordering::Acquire)
    }

    /// When this instance was created or recovered, drives time based rolls.
    pub fn created_time(&self) -> i64 {
        self.created_time
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable.load()
    }

    pub fn set_mutable(&self, mutable: bool) {
        self.mutable.store(mutable);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load()
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn file_path(&self) -> &Path {
        &self.data_path
    }
}

/// Walks frames from `position` up to `file_len`, calling `on_frame` with
/// the record number (counted from `position`), the frame position and the
/// frame size for every valid frame.
fn scan_frames(
    file: &File,
    mut position: u64,
    file_len: u64,
    verify_crc: bool,
    mut on_frame: impl FnMut(i64, u64, u64) -> AppResult<()>,
) -> AppResult<ScanResult> {
    let mut result = ScanResult::default();
    let mut header_buf = [0u8; RECORD_HEADER_SIZE];
    while position < file_len {
        if position + RECORD_HEADER_SIZE as u64 > file_len {
            result.truncated = true;
            break;
        }
        file.read_exact_at(&mut header_buf, position)?;
        let header = RecordHeader::parse(&header_buf)?;
        let frame_end = position + header.frame_size();
        if frame_end > file_len {
            result.truncated = true;
            break;
        }
        if verify_crc {
            let mut payload = vec![0u8; header.size as usize];
            file.read_exact_at(&mut payload, position + RECORD_HEADER_SIZE as u64)?;
            if !header.verify(&payload) {
                result.truncated = true;
                break;
            }
        }
        on_frame(result.records, position, header.frame_size())?;
        result.records += 1;
        result.last_timestamp = Some(header.timestamp);
        position = frame_end;
    }
    result.end_position = position;
    Ok(result)
}

fn bytes_since_last_entry(index: &WritableIndexFile, end_position: u64) -> usize {
    let last_position = index.last_entry().map(|(_, p)| p as u64).unwrap_or(0);
    end_position.saturating_sub(last_position) as usize
}

//! Segment-rotated, length-prefixed record log.
//!
//! Layout under `data_path`:
//! * `{name}.diskqueue.{n:06}.dat`: records as `[4 BE length][bytes]`
//! * `{name}.diskqueue.meta.dat`: `depth\nreadFile,readPos\nwriteFile,writePos\n`
//!
//! `put` and `read_next` only touch the page cache. fsync, the cursor file
//! rewrite and removal of consumed data files happen in `sync`, which the
//! owner runs on a blocking thread every `sync_timeout`, or sooner once
//! `sync_every` operations have piled up and `sync_signal` has been
//! notified. A crash replays at most the reads since the last sync.
//! Records written after the last sync are recovered by scanning the write
//! file on open; a torn tail is truncated.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{BackendQueue, QueueError};

const LENGTH_PREFIX: u64 = 4;

#[derive(Debug, Clone)]
pub struct DiskQueueConfig {
    pub data_path: PathBuf,
    pub max_bytes_per_file: u64,
    pub min_record_size: usize,
    pub max_record_size: usize,
    pub sync_every: u64,
    pub sync_timeout: Duration,
    /// Notified once `sync_every` operations are waiting for a sync.
    pub sync_signal: Option<Arc<Notify>>,
}

#[derive(Debug)]
pub struct DiskQueue {
    name: String,
    config: DiskQueueConfig,
    state: Mutex<DiskState>,
    readable: Notify,
}

#[derive(Debug)]
struct DiskState {
    depth: u64,
    read_file: u64,
    read_pos: u64,
    write_file: u64,
    write_pos: u64,
    /// Final size of `read_file` once the writer has moved past it.
    read_file_end: Option<u64>,
    reader: Option<BufReader<File>>,
    writer: Option<File>,
    /// Rotated-out write files whose data is not yet fsynced.
    retired: Vec<File>,
    /// Fully consumed data files, removed once the cursor past them is durable.
    consumed: Vec<PathBuf>,
    ops_since_sync: u64,
    last_sync: Instant,
    needs_sync: bool,
    failed: bool,
    closed: bool,
}

impl DiskState {
    fn new() -> Self {
        Self {
            depth: 0,
            read_file: 0,
            read_pos: 0,
            write_file: 0,
            write_pos: 0,
            read_file_end: None,
            reader: None,
            writer: None,
            retired: Vec::new(),
            consumed: Vec::new(),
            ops_since_sync: 0,
            last_sync: Instant::now(),
            needs_sync: false,
            failed: false,
            closed: false,
        }
    }
}

impl DiskQueue {
    /// Open (or create) the queue called `name`, recovering any state left
    /// by a previous process.
    pub fn open(name: impl Into<String>, config: DiskQueueConfig) -> Result<Self, QueueError> {
        fs::create_dir_all(&config.data_path)?;
        let queue = Self {
            name: name.into(),
            config,
            state: Mutex::new(DiskState::new()),
            readable: Notify::new(),
        };
        {
            let mut state = queue.state.lock();
            queue.recover(&mut state)?;
            queue.persist_metadata(&state)?;
        }
        Ok(queue)
    }

    /// Wait for the next record. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Result<Bytes, QueueError>> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.read_next() {
                Ok(Some(data)) => return Some(Ok(data)),
                Ok(None) => {}
                Err(QueueError::Closed) => return None,
                Err(err) => return Some(Err(err)),
            }
            notified.await;
        }
    }

    /// Lazily drain the records currently available.
    pub fn records(&self) -> Records<'_> {
        Records {
            queue: self,
            done: false,
        }
    }

    fn data_file(&self, index: u64) -> PathBuf {
        self.config
            .data_path
            .join(format!("{}.diskqueue.{:06}.dat", self.name, index))
    }

    fn meta_file(&self) -> PathBuf {
        self.config
            .data_path
            .join(format!("{}.diskqueue.meta.dat", self.name))
    }

    fn valid_size(&self, len: u64) -> bool {
        len >= self.config.min_record_size as u64 && len <= self.config.max_record_size as u64
    }

    fn recover(&self, state: &mut DiskState) -> Result<(), QueueError> {
        let meta = self.meta_file();
        match fs::read_to_string(&meta) {
            Ok(raw) => {
                let (depth, read, write) =
                    parse_metadata(&raw).ok_or_else(|| QueueError::Metadata {
                        file: meta.clone(),
                        reason: "malformed cursor file".to_string(),
                    })?;
                if read > write {
                    return Err(QueueError::Metadata {
                        file: meta,
                        reason: format!("read cursor {read:?} is past write cursor {write:?}"),
                    });
                }
                state.depth = depth;
                (state.read_file, state.read_pos) = read;
                (state.write_file, state.write_pos) = write;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        loop {
            let path = self.data_file(state.write_file);
            if path.exists() {
                self.scan_tail(path, state)?;
            }
            if !self.data_file(state.write_file + 1).exists() {
                break;
            }
            // The writer rotated after the last cursor sync.
            if state.read_file == state.write_file {
                state.read_file_end = Some(state.write_pos);
            }
            state.write_file += 1;
            state.write_pos = 0;
        }
        Ok(())
    }

    /// Count complete records past the persisted write position and cut off
    /// anything after the last one.
    fn scan_tail(&self, path: PathBuf, state: &mut DiskState) -> Result<(), QueueError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < state.write_pos {
            warn!(
                target: "rillmq::diskqueue",
                queue = %self.name,
                file = %path.display(),
                file_len,
                write_pos = state.write_pos,
                "data file shorter than recorded write position; unsynced tail lost"
            );
            state.write_pos = file_len;
            if state.read_file == state.write_file && state.read_pos > file_len {
                state.read_pos = file_len;
            }
            return Ok(());
        }

        file.seek(SeekFrom::Start(state.write_pos))?;
        let mut pos = state.write_pos;
        let mut recovered = 0u64;
        {
            let mut reader = BufReader::new(&mut file);
            while pos + LENGTH_PREFIX <= file_len {
                let mut len_buf = [0u8; 4];
                reader.read_exact(&mut len_buf)?;
                let len = u64::from(u32::from_be_bytes(len_buf));
                if !self.valid_size(len) || pos + LENGTH_PREFIX + len > file_len {
                    break;
                }
                io::copy(&mut reader.by_ref().take(len), &mut io::sink())?;
                pos += LENGTH_PREFIX + len;
                recovered += 1;
            }
        }

        if pos < file_len {
            file.set_len(pos)?;
            warn!(
                target: "rillmq::diskqueue",
                queue = %self.name,
                file = %path.display(),
                truncated = file_len - pos,
                "truncated torn record at end of data file"
            );
        }
        if recovered > 0 {
            info!(
                target: "rillmq::diskqueue",
                queue = %self.name,
                recovered,
                "recovered records written after the last sync"
            );
        }
        state.write_pos = pos;
        state.depth += recovered;
        Ok(())
    }

    fn persist_metadata(&self, state: &DiskState) -> Result<(), QueueError> {
        let path = self.meta_file();
        let tmp = self
            .config
            .data_path
            .join(format!("{}.diskqueue.meta.dat.tmp", self.name));
        {
            let mut file = File::create(&tmp)?;
            write!(
                file,
                "{}\n{},{}\n{},{}\n",
                state.depth, state.read_file, state.read_pos, state.write_file, state.write_pos
            )?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn sync_locked(&self, state: &mut DiskState) -> Result<(), QueueError> {
        for retired in &state.retired {
            retired.sync_data()?;
        }
        state.retired.clear();
        if let Some(writer) = state.writer.as_mut() {
            writer.sync_data()?;
        }
        self.persist_metadata(state)?;
        // The cursor is past these files now.
        for finished in state.consumed.drain(..) {
            if let Err(err) = fs::remove_file(&finished) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        target: "rillmq::diskqueue",
                        queue = %self.name,
                        file = %finished.display(),
                        error = %err,
                        "failed to remove consumed data file"
                    );
                }
            }
        }
        state.ops_since_sync = 0;
        state.last_sync = Instant::now();
        state.needs_sync = false;
        Ok(())
    }

    fn sync_due(&self, state: &DiskState) -> bool {
        state.ops_since_sync >= self.config.sync_every.max(1)
            || state.last_sync.elapsed() >= self.config.sync_timeout
    }

    /// Count one operation and wake the syncer when the count threshold is
    /// crossed.
    fn note_op(&self, state: &mut DiskState) {
        state.ops_since_sync += 1;
        state.needs_sync = true;
        if state.ops_since_sync == self.config.sync_every.max(1) {
            if let Some(signal) = &self.config.sync_signal {
                signal.notify_one();
            }
        }
    }

    fn rotate(&self, state: &mut DiskState) {
        if let Some(writer) = state.writer.take() {
            state.retired.push(writer);
        }
        if state.read_file == state.write_file {
            state.read_file_end = Some(state.write_pos);
        }
        state.write_file += 1;
        state.write_pos = 0;
        state.needs_sync = true;
        debug!(
            target: "rillmq::diskqueue",
            queue = %self.name,
            write_file = state.write_file,
            "rotated to new data file"
        );
    }

    fn write_one(&self, state: &mut DiskState, data: &[u8]) -> Result<(), QueueError> {
        let record_len = LENGTH_PREFIX + data.len() as u64;
        if state.write_pos > 0 && state.write_pos + record_len > self.config.max_bytes_per_file {
            self.rotate(state);
        }

        if state.writer.is_none() {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(self.data_file(state.write_file))?;
            file.seek(SeekFrom::Start(state.write_pos))?;
            state.writer = Some(file);
        }

        let mut buf = BytesMut::with_capacity(record_len as usize);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        if let Some(writer) = state.writer.as_mut() {
            writer.write_all(&buf)?;
        }

        state.write_pos += record_len;
        state.depth += 1;
        self.note_op(state);
        Ok(())
    }

    fn open_reader(&self, state: &mut DiskState) -> Result<(), QueueError> {
        let mut file = File::open(self.data_file(state.read_file))?;
        if state.read_file < state.write_file && state.read_file_end.is_none() {
            state.read_file_end = Some(file.metadata()?.len());
        }
        file.seek(SeekFrom::Start(state.read_pos))?;
        state.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn read_bound(state: &DiskState) -> u64 {
        match (state.read_file < state.write_file, state.read_file_end) {
            (true, Some(end)) => end,
            _ => state.write_pos,
        }
    }

    fn advance_read_file(&self, state: &mut DiskState) {
        state.consumed.push(self.data_file(state.read_file));
        state.reader = None;
        state.read_file_end = None;
        state.read_file += 1;
        state.read_pos = 0;
        state.needs_sync = true;
    }

    fn read_one(&self, state: &mut DiskState) -> Result<Option<Bytes>, QueueError> {
        loop {
            if state.read_file == state.write_file && state.read_pos >= state.write_pos {
                return Ok(None);
            }
            if state.reader.is_none() {
                self.open_reader(state)?;
            }
            if state.read_pos < Self::read_bound(state) {
                break;
            }
            self.advance_read_file(state);
        }

        let bound = Self::read_bound(state);
        let offset = state.read_pos;
        let Some(reader) = state.reader.as_mut() else {
            return Ok(None);
        };

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u64::from(u32::from_be_bytes(len_buf));
        if !self.valid_size(len) || offset + LENGTH_PREFIX + len > bound {
            return Err(QueueError::Corrupt {
                file: self.data_file(state.read_file),
                offset,
                len,
            });
        }
        let mut data = vec![0u8; len as usize];
        reader.read_exact(&mut data)?;

        state.read_pos += LENGTH_PREFIX + len;
        state.depth = state.depth.saturating_sub(1);
        self.note_op(state);

        if state.read_file < state.write_file && state.read_pos >= bound {
            self.advance_read_file(state);
        }
        Ok(Some(Bytes::from(data)))
    }

    fn remove_data_files(&self, state: &mut DiskState) {
        state.retired.clear();
        let consumed: Vec<PathBuf> = state.consumed.drain(..).collect();
        let live = (state.read_file..=state.write_file).map(|index| self.data_file(index));
        for path in consumed.into_iter().chain(live) {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        target: "rillmq::diskqueue",
                        queue = %self.name,
                        file = %path.display(),
                        error = %err,
                        "failed to remove data file"
                    );
                }
            }
        }
    }
}

impl BackendQueue for DiskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, data: &[u8]) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.failed {
            return Err(QueueError::Failed);
        }
        if !self.valid_size(data.len() as u64) {
            return Err(QueueError::RecordSize(data.len()));
        }
        match self.write_one(&mut state, data) {
            Ok(()) => {
                drop(state);
                self.readable.notify_waiters();
                Ok(())
            }
            Err(err) => {
                state.failed = true;
                state.writer = None;
                error!(
                    target: "rillmq::diskqueue",
                    queue = %self.name,
                    error = %err,
                    "write failed; queue stopped until emptied"
                );
                Err(err)
            }
        }
    }

    fn read_next(&self) -> Result<Option<Bytes>, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.failed {
            return Err(QueueError::Failed);
        }
        match self.read_one(&mut state) {
            Ok(next) => Ok(next),
            Err(err) => {
                state.failed = true;
                state.reader = None;
                error!(
                    target: "rillmq::diskqueue",
                    queue = %self.name,
                    error = %err,
                    "read failed; queue stopped until emptied"
                );
                Err(err)
            }
        }
    }

    fn depth(&self) -> u64 {
        self.state.lock().depth
    }

    fn sync(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.sync_locked(&mut state)
    }

    fn sync_if_due(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed || state.failed || !state.needs_sync {
            return Ok(());
        }
        if self.sync_due(&state) {
            self.sync_locked(&mut state)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let result = self.sync_locked(&mut state);
        state.reader = None;
        state.writer = None;
        state.closed = true;
        drop(state);
        self.readable.notify_waiters();
        result
    }

    fn delete(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.reader = None;
        state.writer = None;
        state.closed = true;
        self.remove_data_files(&mut state);
        if let Err(err) = fs::remove_file(self.meta_file()) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        drop(state);
        self.readable.notify_waiters();
        Ok(())
    }

    fn empty(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.reader = None;
        state.writer = None;
        self.remove_data_files(&mut state);
        state.write_file += 1;
        state.write_pos = 0;
        state.read_file = state.write_file;
        state.read_pos = 0;
        state.read_file_end = None;
        state.depth = 0;
        state.failed = false;
        self.sync_locked(&mut state)
    }

    fn is_failed(&self) -> bool {
        self.state.lock().failed
    }
}

/// Iterator over records, stopping at the first error.
pub struct Records<'a> {
    queue: &'a DiskQueue,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Bytes, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.queue.read_next().transpose();
        if matches!(next, Some(Err(_)) | None) {
            self.done = true;
        }
        next
    }
}

fn parse_metadata(raw: &str) -> Option<(u64, (u64, u64), (u64, u64))> {
    let mut lines = raw.lines();
    let depth = lines.next()?.trim().parse().ok()?;
    let read = parse_cursor(lines.next()?)?;
    let write = parse_cursor(lines.next()?)?;
    Some((depth, read, write))
}

fn parse_cursor(line: &str) -> Option<(u64, u64)> {
    let (file, pos) = line.trim().split_once(',')?;
    Some((file.parse().ok()?, pos.parse().ok()?))
}

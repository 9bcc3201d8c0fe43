use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::model::Event;

/// Larger length prefixes can only come from corruption.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Encode a single event to `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a WAL back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A truncated or corrupt tail was found and ignored.
    pub discarded_tail: bool,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
}

/// Append-only booking log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// `len` covers the payload only. A torn final entry (crash mid-write) fails
/// the length or CRC check and is dropped on replay.
///
/// A failed flush rolls the file back to the last durable length and drops
/// whatever was buffered, so an append reported as failed never reaches disk.
/// If the rollback itself fails the log refuses further appends until it is
/// reopened or compacted.
pub struct Wal {
    /// `None` once a rollback has failed.
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    /// File length covered by the last successful fsync.
    durable_len: u64,
    pending_bytes: u64,
    pending_appends: u64,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_next_flush: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            durable_len,
            pending_bytes: 0,
            pending_appends: 0,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_flush: Default::default(),
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("WAL unusable after failed rollback"))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mut record = Vec::new();
        encode_event(&mut record, event)?;
        if let Err(e) = self.writer()?.write_all(&record) {
            self.rollback();
            return Err(e);
        }
        self.pending_bytes += record.len() as u64;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file. On failure every append since
    /// the last successful flush is discarded.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        match self.try_flush_sync() {
            Ok(()) => {
                self.durable_len += self.pending_bytes;
                self.pending_bytes = 0;
                self.pending_appends = 0;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn try_flush_sync(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if self
            .fail_next_flush
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            // Half the batch reaches the file, then the device fills up.
            let writer = self.writer()?;
            let half = writer.buffer()[..writer.buffer().len() / 2].to_vec();
            writer.get_mut().write_all(&half)?;
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "No space left on device",
            ));
        }
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Drop buffered bytes without writing them and cut the file back to
    /// `durable_len`.
    fn rollback(&mut self) {
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_bytes = 0;
        self.pending_appends = 0;
        let Some(writer) = self.writer.take() else {
            return;
        };
        // `into_parts` hands back the file without flushing the buffer.
        let (file, _discarded) = writer.into_parts();
        match file.set_len(self.durable_len).and_then(|()| file.sync_all()) {
            Ok(()) => self.writer = Some(BufWriter::new(file)),
            Err(e) => error!(
                "WAL rollback of {} to {} bytes failed, refusing appends: {e}",
                self.path.display(),
                self.durable_len
            ),
        }
    }

    /// Make the next flush fail after writing part of the buffer.
    #[cfg(test)]
    pub(crate) fn fault_switch(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.fail_next_flush.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write `events` to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the live log and reopen for append. This
    /// also brings a log back into service after a failed rollback.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        if self.writer.is_some() {
            self.flush_sync()?;
        }
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Cut the file back to `len` bytes so new appends follow the last
    /// valid record instead of a torn one.
    pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }

    /// Read every valid event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            match read_full(&mut reader, &mut len_buf)? {
                ReadOutcome::Full => {}
                ReadOutcome::Empty => break,
                ReadOutcome::Partial => {
                    replay.discarded_tail = true;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_LEN {
                replay.discarded_tail = true;
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if read_full(&mut reader, &mut payload)? != ReadOutcome::Full
                || read_full(&mut reader, &mut crc_buf)? != ReadOutcome::Full
            {
                replay.discarded_tail = true;
                break;
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.discarded_tail = true;
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    replay.events.push(event);
                    replay.valid_len += (len + 8) as u64;
                }
                Err(_) => {
                    replay.discarded_tail = true;
                    break;
                }
            }
        }

        Ok(replay)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Full,
    Empty,
    Partial,
}

/// Like `read_exact`, but tells a clean EOF apart from a torn record.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 && !buf.is_empty() {
                    ReadOutcome::Empty
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

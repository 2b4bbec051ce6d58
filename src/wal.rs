use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Guards replay against allocating for a garbage length prefix.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` means the log ended mid-frame.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// What a replay recovered from disk.
#[derive(Debug, Default)]
pub struct Replayed {
    pub events: Vec<Event>,
    /// A trailing frame was truncated or failed its checksum and was dropped.
    pub torn_tail: bool,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
}

/// Append-only reservation log.
///
/// Frames accumulate in memory until `flush_sync`, which writes and fsyncs
/// them in one go. A flush that fails drops its frames and cuts the file back
/// to the last synced length, so a rejected batch can never reach disk with a
/// later one. A crash mid-write leaves a torn last frame, which replay detects
/// by length prefix and CRC and discards.
pub struct Wal {
    file: File,
    /// Frames appended since the last `flush_sync`.
    pending: Vec<u8>,
    pending_appends: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    /// Bytes past `synced_len` may be on disk from a failed write.
    dirty_tail: bool,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            file,
            pending: Vec::new(),
            pending_appends: 0,
            synced_len,
            dirty_tail: false,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.pending, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    /// Drop everything appended since the last `flush_sync`.
    pub fn discard_unsynced(&mut self) {
        self.pending.clear();
        self.pending_appends = 0;
    }

    /// Write and fsync the buffered frames. On error they are discarded and
    /// the file is cut back to its last synced length.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let result = self.write_pending();
        let written = self.pending.len() as u64;
        let appended = self.pending_appends;
        self.discard_unsynced();

        if let Err(e) = result {
            self.dirty_tail = true;
            if let Err(trunc) = self.truncate_tail() {
                warn!("WAL {}: could not cut back torn write: {trunc}", self.path.display());
            }
            return Err(e);
        }
        self.synced_len += written;
        self.appends_since_compact += appended;
        Ok(())
    }

    fn write_pending(&mut self) -> io::Result<()> {
        if self.dirty_tail {
            self.truncate_tail()?;
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()
    }

    fn truncate_tail(&mut self) -> io::Result<()> {
        self.file.set_len(self.synced_len)?;
        self.file.sync_all()?;
        self.dirty_tail = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the snapshot to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.file = file;
        self.dirty_tail = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Events made durable since open or the last compaction.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Cut the log back to its intact prefix so new appends are not stranded
    /// behind a torn frame.
    pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }

    /// Read every intact frame. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replayed> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replayed::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut out = Replayed::default();

        loop {
            if reader.fill_buf()?.is_empty() {
                break;
            }
            let mut len_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut len_buf)? {
                out.torn_tail = true;
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                out.torn_tail = true;
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut payload)?
                || !read_frame_part(&mut reader, &mut crc_buf)?
            {
                out.torn_tail = true;
                break;
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                out.torn_tail = true;
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    out.events.push(event);
                    out.valid_len += (len + 8) as u64;
                }
                Err(_) => {
                    out.torn_tail = true;
                    break;
                }
            }
        }

        Ok(out)
    }
}

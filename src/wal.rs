use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const MAGIC: &[u8; 4] = b"TRQJ";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;

/// Records longer than this are treated as corruption, not allocated.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())
}

/// Encode a single event to [len][bincode][crc32] format. Returns the
/// record's size on disk. Nothing is written for a record replay would reject.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("journal record of {} bytes exceeds the limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(4 + len as u64 + 4)
}

/// Read `buf.len()` bytes, or report a clean/partial end of file as `false`.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next record. `None` at end of file or at the first truncated
/// or corrupt record. Returns the record's size on disk alongside the event.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, 4 + len as u64 + 4))),
        Err(_) => Ok(None),
    }
}

/// Result of reading a journal from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the header plus every intact record.
    pub valid_len: u64,
    /// Bytes after the last intact record (a torn write or corruption).
    pub discarded_bytes: u64,
}

/// Append-only event journal.
///
/// Layout: `TRQJ` magic and a `u32` version, then one record per event,
/// `[u32: len][bincode: Event][u32: crc32]` with `len` covering the payload
/// only. A truncated or corrupt tail is cut off when the journal is opened.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful fsync.
    synced_len: u64,
    unsynced_bytes: u64,
    unsynced_appends: u64,
    /// Set when a failed batch could not be cut back off the file. Appends
    /// are refused until a compaction rewrites the journal from memory.
    poisoned: bool,
}

impl Wal {
    /// Replay the journal at `path` (creating it if absent), drop any
    /// damaged tail, and open it for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %path.display(),
                discarded_bytes = replay.discarded_bytes,
                recovered_events = replay.events.len(),
                "journal tail is truncated or corrupt; discarding it"
            );
            file.set_len(replay.valid_len)?;
        }
        let mut synced_len = replay.valid_len;
        if synced_len == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
            synced_len = HEADER_LEN;
        }
        Ok((
            Self {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
                appends_since_compact: 0,
                synced_len,
                unsynced_bytes: 0,
                unsynced_appends: 0,
                poisoned: false,
            },
            replay,
        ))
    }

    /// Append a single event and fsync. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append to the buffer without flushing or syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("journal needs compaction after a failed write"));
        }
        self.unsynced_bytes += encode_event(&mut self.writer, event)?;
        self.unsynced_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_bytes;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Append every event and fsync once. All or nothing: on any error the
    /// journal is cut back to its last synced length, so none of the batch
    /// replays.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let mut written = Ok(());
        for event in events {
            written = self.append_buffered(event);
            if written.is_err() {
                break;
            }
        }
        match written.and_then(|()| self.flush_sync()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cut) = self.discard_unsynced() {
                    warn!(path = %self.path.display(), error = %cut, "could not discard failed journal batch");
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Drop buffered records and truncate anything written since the last
    /// fsync.
    fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // `into_parts` hands back the buffer instead of flushing it on drop.
        drop(stale.into_parts());
        self.appends_since_compact -= self.unsynced_appends;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a complete journal (header + `events`) to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the journal and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced_bytes = 0;
        self.unsynced_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Replace the journal with `events`. Both phases in one call.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("journal.tmp")
    }

    /// Read every intact event. A missing file is an empty journal; a file
    /// with a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        if !read_or_eof(&mut reader, &mut header)? {
            // Torn header: nothing was ever committed after it.
            return Ok(Replay {
                events: Vec::new(),
                valid_len: 0,
                discarded_bytes: total,
            });
        }
        if &header[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a torque journal", path.display()),
            ));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported journal version {version}"),
            ));
        }

        let mut events = Vec::new();
        let mut valid_len = HEADER_LEN;
        while let Some((event, size)) = decode_event(&mut reader)? {
            events.push(event);
            valid_len += size;
        }

        Ok(Replay {
            events,
            valid_len,
            discarded_bytes: total - valid_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceKind, Unit};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("torque_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn bay() -> Event {
        Event::ResourceRegistered {
            id: Ulid::new(),
            kind: ResourceKind::Bay,
            name: Some("Bay 1".into()),
            capabilities: Default::default(),
        }
    }

    fn stock(part_id: Ulid, delta: i64) -> Event {
        Event::StockAdjusted {
            part_id,
            delta,
            remarks: None,
            at: 1_000,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let part_id = Ulid::new();
        let events = vec![
            bay(),
            Event::PartRegistered {
                id: part_id,
                name: "Spark plug".into(),
                unit: Unit::Piece,
                on_hand: 8,
                minimum_threshold: 4,
            },
            stock(part_id, 12),
        ];

        {
            let (mut wal, replay) = Wal::open(&path).unwrap();
            assert!(replay.events.is_empty());
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.discarded_bytes, 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn new_journal_starts_with_header() {
        let path = tmp_path("header.journal");
        drop(Wal::open(&path).unwrap());
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(bytes.len() as u64, HEADER_LEN);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn truncated_tail_is_cut_on_open() {
        let path = tmp_path("truncation.journal");
        let first = bay();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let (mut wal, replay) = Wal::open(&path).unwrap();
        assert_eq!(replay.events, vec![first.clone()]);
        assert_eq!(replay.discarded_bytes, 6);

        // Appends after recovery land right after the last intact record.
        let second = bay();
        wal.append(&second).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.journal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.journal");
        {
            let payload = bincode::serialize(&bay()).unwrap();
            let mut f = File::create(&path).unwrap();
            write_header(&mut f).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, HEADER_LEN);
        assert!(replay.discarded_bytes > 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let path = tmp_path("foreign.journal");
        fs::write(&path, b"PGDMP\0\0\0 something else").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_journal_and_accepts_appends() {
        let path = tmp_path("compact.journal");
        let part_id = Ulid::new();
        let registered = Event::PartRegistered {
            id: part_id,
            name: "Coolant".into(),
            unit: Unit::Litre,
            on_hand: 0,
            minimum_threshold: 5,
        };

        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&registered).unwrap();
        for _ in 0..20 {
            wal.append(&stock(part_id, 1)).unwrap();
            wal.append(&stock(part_id, -1)).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&registered)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");

        let next = stock(part_id, 3);
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![registered, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.journal");
        let events: Vec<Event> = (0..5).map(|_| bay()).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
        let _ = fs::remove_file(&path);
    }

    fn noted(part_id: Ulid, remarks_len: usize) -> Event {
        Event::StockAdjusted {
            part_id,
            delta: 1,
            remarks: Some("x".repeat(remarks_len)),
            at: 0,
        }
    }

    #[test]
    fn failed_batch_leaves_no_records_behind() {
        let path = tmp_path("failed_batch.journal");
        let part_id = Ulid::new();
        let kept = bay();
        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append_batch([&kept]).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        // Larger than the write buffer, so it reaches the file before the
        // oversized record behind it fails to encode.
        let spilled = noted(part_id, 64 * 1024);
        let oversized = noted(part_id, MAX_RECORD_LEN + 1);
        assert!(wal.append_batch([&spilled, &oversized]).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        // The journal stays usable and the failed batch never replays.
        let next = stock(part_id, 2);
        wal.append_batch([&next]).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept, next]);
        let _ = fs::remove_file(&path);
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// A length prefix above this is garbage, not an event.
const MAX_ENTRY_LEN: usize = 16 * 1024 * 1024;

/// Bytes around each payload: u32 length before, u32 crc32 after.
const FRAME_OVERHEAD: u64 = 8;

/// Build one `[len][bincode][crc32]` frame so it reaches the writer in a
/// single `write_all`.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(out)
}

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    writer.write_all(&frame(event)?)
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact frame and its size on disk. `None` at end of log, on a torn
/// frame or on a checksum mismatch.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let size = u32::from_le_bytes(word) as usize;
    if size > MAX_ENTRY_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; size];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let event = bincode::deserialize::<Event>(&payload).ok();
    Ok(event.map(|e| (e, size as u64 + FRAME_OVERHEAD)))
}

fn snapshot_path(wal: &Path) -> PathBuf {
    wal.with_extension("wal.tmp")
}

/// Append-only log of one business's events.
///
/// Each entry is a frame `[u32 payload length][bincode Event][u32 crc32]`,
/// little-endian. Replay ends at the first torn or corrupt frame; see
/// [`Wal::recover`].
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length as of the last successful `flush_sync`.
    synced_len: u64,
    /// Bytes and frames appended since then.
    unsynced_len: u64,
    unsynced_appends: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_len: 0,
            unsynced_appends: 0,
        })
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let bytes = frame(event)?;
        self.writer.write_all(&bytes)?;
        self.unsynced_len += bytes.len() as u64;
        self.unsynced_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_len;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// whether still buffered or already written, and cut the file back to
    /// its synced length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer without writing it.
        let _ = stale.into_parts();
        self.appends_since_compact -= self.unsynced_appends;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a compacted snapshot next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(snapshot_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted snapshot over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(snapshot_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_prefix(path).map(|(events, _)| events)
    }

    /// Intact events plus the byte length they occupy.
    fn replay_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        while let Some((event, size)) = read_frame(&mut reader)? {
            events.push(event);
            valid_len += size;
        }
        Ok((events, valid_len))
    }

    /// Replay `path`, cut off a torn or corrupt tail so later appends stay
    /// reachable, and open the log for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::replay_prefix(path)?;
        let on_disk = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                dropped_bytes = on_disk - valid_len,
                "truncating damaged WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("agenda_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn staff_event(business_id: Ulid) -> Event {
        Event::StaffSaved {
            staff: Staff {
                id: Ulid::new(),
                business_id,
                name: "Ayşe".into(),
                user_id: None,
                active: true,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let bid = Ulid::new();
        let events = vec![
            Event::SettingsUpdated {
                settings: BusinessSettings::defaults_for(bid),
            },
            staff_event(bid),
            Event::AppointmentStatusChanged {
                id: Ulid::new(),
                status: AppointmentStatus::Scheduled,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = staff_event(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn recover_truncates_damage_before_new_appends() {
        let path = tmp_path("recover.wal");
        let first = staff_event(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF; 11]).unwrap();
        }

        let second = staff_event(Ulid::new());
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = staff_event(Ulid::new());
        let bad = Event::LinkRedeemed { link_id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_replaces_history_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let bid = Ulid::new();
        let settings = BusinessSettings::defaults_for(bid);

        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..20 {
            wal.append(&Event::SettingsUpdated { settings: settings.clone() }).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::SettingsUpdated { settings: settings.clone() }];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after_event = staff_event(bid);
        wal.append(&after_event).unwrap();
        drop(wal);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![snapshot[0].clone(), after_event]
        );
    }

    #[test]
    fn buffered_appends_are_counted_and_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let bid = Ulid::new();
        let events: Vec<Event> = (0..5).map(|_| staff_event(bid)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn rollback_cuts_written_and_buffered_frames() {
        let path = tmp_path("rollback.wal");
        let bid = Ulid::new();
        let kept = staff_event(bid);
        let (written, buffered) = (staff_event(bid), staff_event(bid));
        let later = staff_event(bid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            let synced = fs::metadata(&path).unwrap().len();

            // One frame reaches the file without an fsync, one stays buffered.
            wal.append_buffered(&written).unwrap();
            wal.writer.flush().unwrap();
            wal.append_buffered(&buffered).unwrap();
            assert!(fs::metadata(&path).unwrap().len() > synced);

            wal.rollback().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), synced);
            assert_eq!(wal.appends_since_compact(), 1);

            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
    }
}

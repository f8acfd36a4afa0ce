use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only event log.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little endian, where
/// `len` counts the payload only. A torn or corrupt tail (crash mid-write)
/// ends replay at the last good record.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record payload, or `None` at end of log / first bad record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to `path` and fsync it. Slow phase.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted log over the live one and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        while let Some(payload) = read_record(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(
                        "{}: undecodable record after {} events: {e}",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, Weekday};
    use ulid::Ulid;

    use super::*;
    use crate::model::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("samay_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn trainer(id: Ulid) -> Event {
        Event::UserRegistered { id, username: format!("coach-{id}"), role: Role::Trainer }
    }

    fn window(trainer_id: Ulid) -> AvailabilityWindow {
        AvailabilityWindow {
            id: Ulid::new(),
            trainer_id,
            day: Weekday::Mon,
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let tid = Ulid::new();
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let events = vec![
            trainer(tid),
            Event::WindowAdded { window: window(tid) },
            Event::BookingCreated {
                booking: Booking {
                    id: Ulid::new(),
                    client_id: Ulid::new(),
                    trainer_id: tid,
                    span: Span::new(
                        day.and_hms_opt(10, 0, 0).unwrap(),
                        day.and_hms_opt(11, 0, 0).unwrap(),
                    ),
                    status: BookingStatus::Pending,
                    notes: Some("knee rehab".into()),
                    linked_commitment: None,
                },
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
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = trainer(Ulid::new());
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
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&trainer(Ulid::new())).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let tid = Ulid::new();

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&trainer(tid)).unwrap();
        for _ in 0..10 {
            let w = window(tid);
            let id = w.id;
            wal.append(&Event::WindowAdded { window: w }).unwrap();
            wal.append(&Event::WindowRemoved { id, trainer_id: tid }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![trainer(tid)];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} >= {before}");

        let late = Event::AvailabilityReplaced { trainer_id: tid, windows: vec![window(tid)] };
        wal.append(&late).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), late]);
    }

    #[test]
    fn buffered_appends_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| trainer(Ulid::new())).collect();
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
}

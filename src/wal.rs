use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one commit (all events of one operation) as `[len][bincode][crc32]`.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only journal of commits.
///
/// Format per frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`.
/// A frame is the unit of atomicity: a torn or corrupt trailing frame is dropped
/// whole on replay, so a reconciliation plan is either fully replayed or not at all.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
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

    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Buffer one commit without syncing. Follow with `flush_sync` for the batch.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_commit(&mut self.writer, events)?;
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

    /// Write the compacted state to a temp file beside the journal and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for chunk in events.chunks(COMPACT_CHUNK) {
            encode_commit(&mut writer, chunk)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the journal and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
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

    /// Replay every intact commit in order. Stops at the first torn or corrupt frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if !read_frame_part(&mut reader, &mut payload)? {
                break;
            }

            let mut crc_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("journal {}: corrupt frame, replay stopped", path.display());
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(events) => commits.push(events),
                Err(_) => break,
            }
        }

        Ok(commits)
    }
}

/// Events per frame when writing a compacted journal.
const COMPACT_CHUNK: usize = 512;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn opened(start: i64) -> Event {
        Event::WindowOpened {
            id: Ulid::new(),
            span: Span::new(start, start + 3_600_000),
            reserved: Vec::new(),
        }
    }

    #[test]
    fn append_and_replay_keeps_commit_boundaries() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let first = vec![opened(0), opened(3_600_000)];
        let second = vec![Event::WindowReleased {
            window_id: Ulid::new(),
            holder_id: Ulid::new(),
        }];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_commit_is_dropped_whole() {
        let path = tmp_path("torn.wal");
        let _ = fs::remove_file(&path);

        let kept = vec![opened(0)];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
        }
        // Half of a second frame: length prefix plus a few payload bytes.
        {
            let payload = bincode::serialize(&vec![opened(0), opened(1)]).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![kept]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&vec![opened(0)]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let state = vec![opened(0)];
        let later = vec![opened(7_200_000)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&[opened(0)]).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&state).unwrap();
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![state, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_commits_need_flush() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let commits: Vec<Vec<Event>> = (0..5).map(|i| vec![opened(i * 3_600_000)]).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), commits);
        let _ = fs::remove_file(&path);
    }
}

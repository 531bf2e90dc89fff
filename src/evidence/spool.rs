//! Durable, crash-resilient evidence spool.
//!
//! Layout: `{root}/{channel_id}/{session_id}.spool.jsonl` (append-only, one
//! JSON object per line, never rewritten or compacted during a session) plus
//! `{...}.ack` (two-line text file, rewritten atomically via temp+rename).
//! A dedicated writer thread batches appends: 250 ms or 50 records,
//! whichever comes first; file I/O happens outside the queue lock. The
//! writer never drops — only `append` can refuse, and only with `SpoolFull`
//! when pending-unacked bytes exceed the disk cap.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PlayoutError, Result};

use super::EvidenceRecord;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
pub const FLUSH_RECORDS_MAX: usize = 50;

/// Status returned by `append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Ok,
    /// Pending-unacked bytes exceed the disk cap; the caller degrades.
    SpoolFull,
}

struct Queue {
    write_queue: Vec<String>,
    last_appended_sequence: u64,
    /// File bytes plus queued-but-unflushed bytes.
    estimated_spool_bytes: u64,
    /// Byte length of each appended record, indexed by sequence - 1.
    record_byte_sizes: Vec<u64>,
    /// Bytes covered by the ack cursor.
    acked_byte_offset: u64,
    ack_cursor: u64,
    shutdown: bool,
}

struct Shared {
    spool_path: PathBuf,
    ack_path: PathBuf,
    /// 0 means unlimited.
    max_spool_bytes: u64,
    queue: Mutex<Queue>,
    queue_cv: Condvar,
}

pub struct EvidenceSpool {
    channel_id: String,
    playout_session_id: String,
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EvidenceSpool {
    pub fn new(
        channel_id: &str,
        playout_session_id: &str,
        spool_root: &std::path::Path,
        max_spool_bytes: u64,
    ) -> Result<Self> {
        let dir = spool_root.join(channel_id);
        fs::create_dir_all(&dir)?;
        let spool_path = dir.join(format!("{}.spool.jsonl", playout_session_id));
        let ack_path = dir.join(format!("{}.ack", playout_session_id));

        // Restart: seed byte accounting from the existing file.
        let existing_bytes = fs::metadata(&spool_path).map(|m| m.len()).unwrap_or(0);

        let shared = Arc::new(Shared {
            spool_path,
            ack_path,
            max_spool_bytes,
            queue: Mutex::new(Queue {
                write_queue: Vec::new(),
                last_appended_sequence: 0,
                estimated_spool_bytes: existing_bytes,
                record_byte_sizes: Vec::new(),
                acked_byte_offset: 0,
                ack_cursor: 0,
                shutdown: false,
            }),
            queue_cv: Condvar::new(),
        });

        let writer_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("evidence-spool".into())
            .spawn(move || writer_loop(writer_shared))
            .expect("spawn spool writer");

        Ok(Self {
            channel_id: channel_id.to_string(),
            playout_session_id: playout_session_id.to_string(),
            shared,
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn playout_session_id(&self) -> &str {
        &self.playout_session_id
    }

    pub fn spool_path(&self) -> PathBuf {
        self.shared.spool_path.clone()
    }

    pub fn ack_path(&self) -> PathBuf {
        self.shared.ack_path.clone()
    }

    /// Enqueue one record for the writer thread. Validates sequence
    /// monotonicity — a gap is a programmer error in the emitter and aborts
    /// the session — and enforces the pending-unacked byte cap.
    pub fn append(&self, record: &EvidenceRecord) -> Result<AppendStatus> {
        let line = record.to_json_line();
        let line_bytes = line.len() as u64 + 1;

        let mut q = self.shared.queue.lock();
        if q.last_appended_sequence != 0 && record.sequence != q.last_appended_sequence + 1 {
            return Err(PlayoutError::InvariantViolation(format!(
                "evidence sequence gap: expected {}, got {}",
                q.last_appended_sequence + 1,
                record.sequence
            )));
        }

        if self.shared.max_spool_bytes > 0 {
            let pending = q.estimated_spool_bytes + line_bytes - q.acked_byte_offset;
            if pending > self.shared.max_spool_bytes {
                return Ok(AppendStatus::SpoolFull);
            }
        }

        q.last_appended_sequence = record.sequence;
        q.estimated_spool_bytes += line_bytes;
        q.record_byte_sizes.push(line_bytes);
        q.write_queue.push(line);
        let kick = q.write_queue.len() >= FLUSH_RECORDS_MAX;
        drop(q);
        if kick {
            self.shared.queue_cv.notify_one();
        }
        Ok(AppendStatus::Ok)
    }

    /// Highest sequence accepted so far (0 before the first append).
    pub fn last_appended_sequence(&self) -> u64 {
        self.shared.queue.lock().last_appended_sequence
    }

    /// Spool file size including queued-but-unflushed records.
    pub fn current_spool_bytes(&self) -> u64 {
        self.shared.queue.lock().estimated_spool_bytes
    }

    /// Bytes not yet covered by Core's ack.
    pub fn pending_bytes(&self) -> u64 {
        let q = self.shared.queue.lock();
        q.estimated_spool_bytes - q.acked_byte_offset
    }

    /// Block until everything queued so far is on disk (test/shutdown aid).
    pub fn flush(&self) {
        loop {
            {
                let q = self.shared.queue.lock();
                if q.write_queue.is_empty() {
                    return;
                }
            }
            self.shared.queue_cv.notify_one();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Read the spool and return records with `sequence > acked_sequence`.
    /// A corrupt trailing line (partial final write) is tolerated.
    pub fn replay_from(&self, acked_sequence: u64) -> Vec<EvidenceRecord> {
        let content = match fs::read_to_string(&self.shared.spool_path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match EvidenceRecord::from_json_line(line) {
                Some(record) => {
                    if record.sequence > acked_sequence {
                        out.push(record);
                    }
                }
                None => {
                    tracing::warn!("skipping corrupt spool line ({} bytes)", line.len());
                }
            }
        }
        out
    }

    /// Persist Core's ack atomically (temp file + rename). Only advances;
    /// stale or duplicate acks are ignored.
    pub fn update_ack(&self, seq: u64) {
        {
            let mut q = self.shared.queue.lock();
            if seq <= q.ack_cursor {
                return;
            }
            // Advance the acked byte offset over the newly covered records.
            let len = q.record_byte_sizes.len();
            let from = (q.ack_cursor as usize).min(len);
            let to = (seq as usize).min(len);
            let newly_acked: u64 = q.record_byte_sizes[from..to].iter().sum();
            q.acked_byte_offset += newly_acked;
            q.ack_cursor = seq;
        }

        let updated_utc = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let body = format!("acked_sequence={}\nupdated_utc={}\n", seq, updated_utc);
        let tmp_path = self.shared.ack_path.with_extension("ack.tmp");
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp_path, &self.shared.ack_path)?;
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!(error = %e, "failed to persist evidence ack");
        }
    }

    /// Last acked sequence from the ack file; 0 when missing or unreadable.
    pub fn last_ack(&self) -> u64 {
        let content = match fs::read_to_string(&self.shared.ack_path) {
            Ok(c) => c,
            Err(_) => return 0,
        };
        for line in content.lines() {
            if let Some(value) = line.strip_prefix("acked_sequence=") {
                return value.trim().parse().unwrap_or(0);
            }
        }
        0
    }
}

impl Drop for EvidenceSpool {
    fn drop(&mut self) {
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
        }
        self.shared.queue_cv.notify_all();
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(shared: Arc<Shared>) {
    let mut last_flush = Instant::now();
    loop {
        let (batch, shutdown) = {
            let mut q = shared.queue.lock();
            loop {
                if q.shutdown || q.write_queue.len() >= FLUSH_RECORDS_MAX {
                    break;
                }
                let elapsed = last_flush.elapsed();
                if !q.write_queue.is_empty() && elapsed >= FLUSH_INTERVAL {
                    break;
                }
                let wait = FLUSH_INTERVAL
                    .checked_sub(elapsed)
                    .unwrap_or(FLUSH_INTERVAL)
                    .max(Duration::from_millis(10));
                shared.queue_cv.wait_for(&mut q, wait);
            }
            (std::mem::take(&mut q.write_queue), q.shutdown)
        };

        if !batch.is_empty() {
            // File I/O outside the queue lock.
            let io = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&shared.spool_path)
                .and_then(|mut f| {
                    for line in &batch {
                        f.write_all(line.as_bytes())?;
                        f.write_all(b"\n")?;
                    }
                    f.sync_data()
                });
            if let Err(e) = io {
                tracing::error!(error = %e, "spool write failed ({} records)", batch.len());
            }
            last_flush = Instant::now();
        }

        if shutdown {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{SCHEMA_VERSION, PAYLOAD_BLOCK_START};

    fn record(seq: u64) -> EvidenceRecord {
        EvidenceRecord {
            schema_version: SCHEMA_VERSION,
            channel_id: "ch".into(),
            playout_session_id: "PS-1".into(),
            sequence: seq,
            event_uuid: format!("00000000-0000-4000-8000-{:012}", seq),
            emitted_utc: "2026-02-13T12:00:00.000Z".into(),
            payload_type: PAYLOAD_BLOCK_START.into(),
            payload: serde_json::json!({"block_id": "b", "swap_tick": seq}),
        }
    }

    #[test]
    fn test_append_flush_replay() {
        let root = tempfile::tempdir().unwrap();
        let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
        for seq in 1..=5 {
            assert_eq!(spool.append(&record(seq)).unwrap(), AppendStatus::Ok);
        }
        spool.flush();
        std::thread::sleep(Duration::from_millis(300));

        let replayed = spool.replay_from(3);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].sequence, 4);
        assert_eq!(replayed[1].sequence, 5);
    }

    #[test]
    fn test_replay_survives_restart() {
        let root = tempfile::tempdir().unwrap();
        {
            let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
            for seq in 1..=5 {
                spool.append(&record(seq)).unwrap();
            }
            // Drop joins the writer, flushing everything.
        }
        let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
        let replayed = spool.replay_from(0);
        assert_eq!(replayed.len(), 5);
    }

    #[test]
    fn test_sequence_gap_is_programmer_error() {
        let root = tempfile::tempdir().unwrap();
        let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
        spool.append(&record(1)).unwrap();
        let err = spool.append(&record(3)).unwrap_err();
        assert!(matches!(err, PlayoutError::InvariantViolation(_)));
    }

    #[test]
    fn test_corrupt_trailing_line_tolerated() {
        let root = tempfile::tempdir().unwrap();
        {
            let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
            spool.append(&record(1)).unwrap();
            spool.append(&record(2)).unwrap();
        }
        // Simulate a crash mid-write: truncated final line.
        let path = root.path().join("ch").join("PS-1.spool.jsonl");
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("{\"schema_version\":1,\"chan");
        fs::write(&path, content).unwrap();

        let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
        let replayed = spool.replay_from(0);
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_ack_file_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let spool = EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap();
        for seq in 1..=10 {
            spool.append(&record(seq)).unwrap();
        }
        assert_eq!(spool.last_ack(), 0);
        spool.update_ack(6);
        assert_eq!(spool.last_ack(), 6);

        let content = fs::read_to_string(spool.ack_path()).unwrap();
        assert!(content.starts_with("acked_sequence=6\nupdated_utc="));

        // Stale ack ignored.
        spool.update_ack(4);
        assert_eq!(spool.last_ack(), 6);
    }

    #[test]
    fn test_disk_cap_on_pending_unacked_bytes() {
        let root = tempfile::tempdir().unwrap();
        let line_len = record(1).to_json_line().len() as u64 + 1;
        // Cap fits roughly three records.
        let spool = EvidenceSpool::new("ch", "PS-1", root.path(), line_len * 3).unwrap();
        assert_eq!(spool.append(&record(1)).unwrap(), AppendStatus::Ok);
        assert_eq!(spool.append(&record(2)).unwrap(), AppendStatus::Ok);
        assert_eq!(spool.append(&record(3)).unwrap(), AppendStatus::Ok);
        assert_eq!(spool.append(&record(4)).unwrap(), AppendStatus::SpoolFull);

        // Acks release pending bytes and appends recover.
        spool.update_ack(2);
        assert_eq!(spool.append(&record(4)).unwrap(), AppendStatus::Ok);
    }
}

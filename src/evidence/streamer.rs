//! Evidence streamer: delivers spooled + live evidence to Core.
//!
//! One bidirectional line-delimited JSON stream per connection:
//! - outbound `{"hello":{...}}` once, then `{"evidence":{envelope}}` lines
//! - inbound `{"acked_sequence":N}` lines
//!
//! Session shape: connect, HELLO with `(first_sequence_available,
//! last_sequence_emitted)`, wait for Core's initial ack (bounded 5 s),
//! replay everything past the ack from the spool, then stream live.
//! Disconnects reconnect with exponential backoff (100 ms doubling to 5 s).
//! Delivery is at-least-once; ordering is preserved per stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::emitter::LiveSender;
use super::{EvidenceRecord, EvidenceSpool};

const HELLO_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Shutdown-poll granularity inside the live loop.
const IDLE_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct AckFromCore {
    acked_sequence: u64,
}

pub struct EvidenceStreamer {
    live_tx: LiveSender,
    last_acked: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EvidenceStreamer {
    /// Spawn the streamer thread (it owns a current-thread tokio runtime).
    pub fn start(core_address: String, spool: Arc<EvidenceSpool>) -> Self {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let last_acked = Arc::new(AtomicU64::new(spool.last_ack()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_acked = Arc::clone(&last_acked);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("evidence-stream".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("build evidence stream runtime");
                runtime.block_on(connection_loop(
                    core_address,
                    spool,
                    live_rx,
                    thread_acked,
                    thread_shutdown,
                ));
            })
            .expect("spawn evidence streamer");

        Self {
            live_tx,
            last_acked,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Sender the emitter uses for live events.
    pub fn live_sender(&self) -> LiveSender {
        self.live_tx.clone()
    }

    pub fn last_acked_sequence(&self) -> u64 {
        self.last_acked.load(Ordering::Acquire)
    }

    /// Stop streaming and join the worker.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvidenceStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn connection_loop(
    core_address: String,
    spool: Arc<EvidenceSpool>,
    mut live_rx: mpsc::UnboundedReceiver<EvidenceRecord>,
    last_acked: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    while !shutdown.load(Ordering::Acquire) {
        match run_session(&core_address, &spool, &mut live_rx, &last_acked, &shutdown).await {
            Ok(()) => {
                backoff = BACKOFF_INITIAL;
                tracing::info!(core_address, "evidence stream closed; reconnecting");
            }
            Err(e) => {
                tracing::debug!(core_address, error = %e, "evidence stream error; reconnecting");
            }
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

async fn run_session(
    core_address: &str,
    spool: &Arc<EvidenceSpool>,
    live_rx: &mut mpsc::UnboundedReceiver<EvidenceRecord>,
    last_acked: &Arc<AtomicU64>,
    shutdown: &Arc<AtomicBool>,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(core_address).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // HELLO: tell Core what we can replay and where we currently are.
    let hello = serde_json::json!({
        "hello": {
            "channel_id": spool.channel_id(),
            "playout_session_id": spool.playout_session_id(),
            "first_sequence_available": 1u64,
            "last_sequence_emitted": spool.last_appended_sequence(),
        }
    });
    write_half
        .write_all(format!("{}\n", hello).as_bytes())
        .await?;

    // Core answers with its current ack; bounded wait.
    let acked = tokio::time::timeout(HELLO_ACK_TIMEOUT, read_ack(&mut lines))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "HELLO ack timeout")
        })??;
    last_acked.store(acked, Ordering::Release);
    spool.update_ack(acked);
    tracing::info!(core_address, acked, "evidence stream established");

    // Replay everything past the ack, in spool order.
    let mut high_sent = acked;
    for record in spool.replay_from(acked) {
        let line = serde_json::json!({ "evidence": &record });
        write_half
            .write_all(format!("{}\n", line).as_bytes())
            .await?;
        high_sent = record.sequence;
    }

    // Live: forward new events, absorb acks, poll for shutdown.
    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(text) => {
                    if let Ok(ack) = serde_json::from_str::<AckFromCore>(&text) {
                        let prev = last_acked.swap(ack.acked_sequence, Ordering::AcqRel);
                        if ack.acked_sequence > prev {
                            spool.update_ack(ack.acked_sequence);
                        }
                    }
                }
                None => return Ok(()),
            },
            record = live_rx.recv() => match record {
                Some(record) => {
                    // Events already covered by replay are skipped; Core
                    // dedupes whatever overlap remains.
                    if record.sequence > high_sent {
                        let line = serde_json::json!({ "evidence": &record });
                        write_half
                            .write_all(format!("{}\n", line).as_bytes())
                            .await?;
                        high_sent = record.sequence;
                    }
                }
                None => return Ok(()),
            },
            _ = tokio::time::sleep(IDLE_TICK) => {}
        }
    }
}

async fn read_ack(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
) -> std::io::Result<u64> {
    loop {
        match lines.next_line().await? {
            Some(text) => {
                if let Ok(ack) = serde_json::from_str::<AckFromCore>(&text) {
                    return Ok(ack.acked_sequence);
                }
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed before initial ack",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::emitter::EvidenceEmitter;
    use crate::evidence::{BlockStartPayload, SCHEMA_VERSION};
    use std::io::{BufRead, BufReader as StdBufReader, Write as StdWrite};
    use std::net::TcpListener;

    fn record_seq(line: &str) -> Option<u64> {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        v.get("evidence")?.get("sequence")?.as_u64()
    }

    /// Restart/replay behavior (scenario: events 1..100 emitted, Core acked
    /// 60, new streamer connects): HELLO advertises last=100, Core's initial
    /// ack triggers replay of 61..100, live events continue from 101.
    #[test]
    fn test_hello_replay_then_live() {
        let root = tempfile::tempdir().unwrap();
        let spool = Arc::new(EvidenceSpool::new("ch", "PS-1", root.path(), 0).unwrap());
        let emitter = EvidenceEmitter::new(Arc::clone(&spool), None);
        for i in 0..100 {
            emitter.emit_block_start(&BlockStartPayload {
                block_id: format!("b{}", i),
                swap_tick: 0,
                fence_tick: 0,
                actual_start_utc_ms: 0,
                primed_success: true,
            });
        }
        spool.flush();
        std::thread::sleep(Duration::from_millis(300));
        spool.update_ack(60);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let core = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;

            let mut hello = String::new();
            reader.read_line(&mut hello).unwrap();
            let v: serde_json::Value = serde_json::from_str(&hello).unwrap();
            assert_eq!(v["hello"]["last_sequence_emitted"], 100);
            assert_eq!(v["hello"]["first_sequence_available"], 1);

            stream
                .write_all(b"{\"acked_sequence\":60}\n")
                .unwrap();

            // Replay 61..=100, then one live event (101).
            let mut seqs = Vec::new();
            for _ in 0..41 {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                seqs.push(record_seq(&line).unwrap());
            }
            seqs
        });

        let mut streamer = EvidenceStreamer::start(addr.to_string(), Arc::clone(&spool));
        let live_emitter = EvidenceEmitter::new(Arc::clone(&spool), Some(streamer.live_sender()));
        // Give the session time to finish the replay before the live event.
        std::thread::sleep(Duration::from_millis(500));
        live_emitter.emit_block_start(&BlockStartPayload {
            block_id: "live".into(),
            swap_tick: 0,
            fence_tick: 0,
            actual_start_utc_ms: 0,
            primed_success: true,
        });

        let seqs = core.join().unwrap();
        let expected: Vec<u64> = (61..=101).collect();
        assert_eq!(seqs, expected);
        assert_eq!(streamer.last_acked_sequence(), 60);
        streamer.stop();
    }

    #[test]
    fn test_unreachable_core_keeps_retrying_quietly() {
        let root = tempfile::tempdir().unwrap();
        let spool = Arc::new(EvidenceSpool::new("ch", "PS-2", root.path(), 0).unwrap());
        // Nothing listens on this port.
        let mut streamer = EvidenceStreamer::start("127.0.0.1:1".into(), spool);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(streamer.last_acked_sequence(), 0);
        streamer.stop();
    }

    #[test]
    fn test_ack_parse_ignores_noise() {
        let ack: AckFromCore = serde_json::from_str("{\"acked_sequence\":7}").unwrap();
        assert_eq!(ack.acked_sequence, 7);
        assert!(serde_json::from_str::<AckFromCore>("{\"other\":1}").is_err());
    }

    #[test]
    fn test_record_seq_helper() {
        let rec = EvidenceRecord {
            schema_version: SCHEMA_VERSION,
            channel_id: "c".into(),
            playout_session_id: "p".into(),
            sequence: 9,
            event_uuid: "u".into(),
            emitted_utc: "t".into(),
            payload_type: "BLOCK_START".into(),
            payload: serde_json::json!({}),
        };
        let line = serde_json::json!({ "evidence": rec }).to_string();
        assert_eq!(record_seq(&line), Some(9));
    }
}

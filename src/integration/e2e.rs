//! Full-session scenarios against the deterministic harness.
//!
//! Each test builds a real pipeline (real buffers, preparer, evidence
//! spool) around scripted decoders and a recording sink, runs a session to
//! termination, and checks emissions plus the evidence trail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::audio::AudioBufferConfig;
use crate::buffer::video::VideoBufferConfig;
use crate::clock::SessionClock;
use crate::decode::OutputGeometry;
use crate::error::TerminationReason;
use crate::evidence::{EvidenceEmitter, EvidenceSpool};
use crate::fps::RationalFps;
use crate::pipeline::{PipelineManager, SessionContext};
use crate::plan::{BlockPlan, Segment, SegmentType};
use crate::sink::OutputSink;

use super::harness::{FakeAsset, FakeDecoderFactory, PacedWait, Recording, RecordingSink};

const TICK_PACE: Duration = Duration::from_micros(500);

struct Rig {
    manager: PipelineManager,
    recording: Arc<Mutex<Recording>>,
    spool: Arc<EvidenceSpool>,
    _tmp: tempfile::TempDir,
}

fn geometry(fps: RationalFps) -> OutputGeometry {
    OutputGeometry {
        width: 64,
        height: 36,
        fps,
    }
}

fn rig_with_sink(
    fps: RationalFps,
    factory: Arc<FakeDecoderFactory>,
    sink: Box<dyn OutputSink>,
    recording: Arc<Mutex<Recording>>,
) -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let spool = Arc::new(EvidenceSpool::new("chan-e2e", "PS-e2e", tmp.path(), 0).unwrap());
    let emitter = Arc::new(EvidenceEmitter::new(Arc::clone(&spool), None));
    let clock = SessionClock::new(fps, Box::new(PacedWait(TICK_PACE)));
    let ctx = SessionContext {
        channel_id: "chan-e2e".into(),
        playout_session_id: "PS-e2e".into(),
        geometry: geometry(fps),
        min_audio_prime_ms: 100,
        audio_config: AudioBufferConfig::default(),
        video_config: VideoBufferConfig::default(),
    };
    Rig {
        manager: PipelineManager::new(ctx, clock, sink, emitter, factory),
        recording,
        spool,
        _tmp: tmp,
    }
}

fn rig(fps: RationalFps, factory: Arc<FakeDecoderFactory>) -> Rig {
    let (sink, recording) = RecordingSink::new();
    rig_with_sink(fps, factory, Box::new(sink), recording)
}

fn wait_terminated(manager: &PipelineManager) -> (TerminationReason, String) {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        if let Some(t) = manager.termination() {
            return t;
        }
        assert!(Instant::now() < deadline, "session did not terminate");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn evidence_types(rig: &Rig) -> Vec<(u64, String)> {
    rig.spool.flush();
    std::thread::sleep(Duration::from_millis(100));
    rig.spool
        .replay_from(0)
        .into_iter()
        .map(|r| (r.sequence, r.payload_type))
        .collect()
}

/// Scenario: happy path, one block, three segments at 30000/1001 fps.
/// 10.010 s -> exactly 300 frames, 480480 audio samples, and the canonical
/// evidence ladder.
#[test]
fn test_scenario_single_block_three_segments() {
    let fps = RationalFps::new(30000, 1001);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("asset_x", FakeAsset::new(5000, fps));
    factory.add_asset("asset_y", FakeAsset::new(5000, fps));
    factory.add_asset("asset_z", FakeAsset::new(5000, fps));

    let mut rig = rig(fps, factory);
    rig.manager
        .submit_block(crate::plan::test_plan(
            "blk-1",
            0,
            &[("asset_x", 0, 3337), ("asset_y", 0, 3337), ("asset_z", 0, 3336)],
        ))
        .unwrap();
    rig.manager.start();

    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    rig.manager.stop();

    let recording = rig.recording.lock();
    assert_eq!(recording.ticks.len(), 300);

    // Invariant: output PTS is the exact 90 kHz grid, no gaps/dupes/reorders.
    for (i, tick) in recording.ticks.iter().enumerate() {
        assert_eq!(tick.pts_90k, i as i64 * 3003);
    }

    // Audio popped over the session: 48 kHz x 10.010 s.
    let total_samples: usize = recording.ticks.iter().map(|t| t.audio_samples).sum();
    assert_eq!(total_samples, 480_480);

    // Segment ownership follows the CT boundaries.
    assert_eq!(recording.ticks[0].asset_uri, "asset_x");
    assert_eq!(recording.ticks[150].asset_uri, "asset_y");
    assert_eq!(recording.ticks[299].asset_uri, "asset_z");

    // Evidence ladder with gap-free sequences from 1.
    let events = evidence_types(&rig);
    let types: Vec<&str> = events.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "BLOCK_START",
            "SEGMENT_START",
            "SEGMENT_END",
            "SEGMENT_START",
            "SEGMENT_END",
            "SEGMENT_START",
            "SEGMENT_END",
            "BLOCK_FENCE",
            "CHANNEL_TERMINATED",
        ]
    );
    for (i, (seq, _)) in events.iter().enumerate() {
        assert_eq!(*seq, i as u64 + 1);
    }

    // Invariant: a normally-fenced session never underflowed.
    let metrics = rig.manager.metrics();
    assert_eq!(metrics.video_underflows, 0);
    assert_eq!(metrics.audio_underflows, 0);
}

/// Scenario: seamless handover. The frame at the fence tick belongs to the
/// next block, on the continuous output grid.
#[test]
fn test_scenario_seamless_block_handover() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("asset_a", FakeAsset::new(6000, fps));
    factory.add_asset("asset_b", FakeAsset::new(8000, fps));

    let mut rig = rig(fps, factory);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-a", 0, &[("asset_a", 0, 4000)]))
        .unwrap();
    rig.manager
        .submit_block(crate::plan::test_plan("blk-b", 4000, &[("asset_b", 0, 6000)]))
        .unwrap();
    rig.manager.start();

    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    rig.manager.stop();

    let recording = rig.recording.lock();
    assert_eq!(recording.ticks.len(), 300); // 120 from A + 180 from B

    // Fence tick 120 (t = 4000 ms at 30 fps): B's content, grid PTS.
    assert_eq!(recording.ticks[119].asset_uri, "asset_a");
    assert_eq!(recording.ticks[120].asset_uri, "asset_b");
    assert_eq!(recording.ticks[120].pts_90k, 120 * 3000);

    // BLOCK_FENCE(A) and BLOCK_START(B) agree on the boundary wall time.
    rig.spool.flush();
    std::thread::sleep(Duration::from_millis(100));
    let records = rig.spool.replay_from(0);
    let fence = records
        .iter()
        .find(|r| r.payload_type == "BLOCK_FENCE" && r.payload["block_id"] == "blk-a")
        .unwrap();
    let start_b = records
        .iter()
        .find(|r| r.payload_type == "BLOCK_START" && r.payload["block_id"] == "blk-b")
        .unwrap();
    assert_eq!(
        fence.payload["actual_end_utc_ms"],
        start_b.payload["actual_start_utc_ms"]
    );
    assert_eq!(fence.payload["fence_tick"], 120);
    assert_eq!(start_b.payload["swap_tick"], 120);
    assert_eq!(fence.payload["total_frames_emitted"], 120);
}

/// Scenario: underrun termination. Fence arrives with an empty next slot;
/// nothing from a next block is ever emitted.
#[test]
fn test_scenario_underrun_no_next_block() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("asset_a", FakeAsset::new(4000, fps));

    let mut rig = rig(fps, factory);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-a", 0, &[("asset_a", 0, 2000)]))
        .unwrap();
    rig.manager.start();

    let (reason, detail) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    assert!(detail.contains("blk-a"));
    rig.manager.stop();

    // Exactly frames_per_block(A) frames emitted, none past the fence.
    assert_eq!(rig.recording.lock().ticks.len(), 60);

    let events = evidence_types(&rig);
    let (_, last) = events.last().unwrap();
    assert_eq!(last, "CHANNEL_TERMINATED");
    // No evidence follows the terminal record.
    let terminated_at = events
        .iter()
        .position(|(_, t)| t == "CHANNEL_TERMINATED")
        .unwrap();
    assert_eq!(terminated_at, events.len() - 1);
}

/// Scenario: slow consumer. The sink detaches mid-session and the channel
/// goes off-air with `SinkDetached`.
#[test]
fn test_scenario_sink_detach_terminates() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("asset_a", FakeAsset::new(10_000, fps));

    let (sink, recording) = RecordingSink::new();
    let sink = sink.detach_after(30);
    let mut rig = rig_with_sink(fps, factory, Box::new(sink), recording);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-a", 0, &[("asset_a", 0, 8000)]))
        .unwrap();
    rig.manager.start();

    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::SinkDetached);
    rig.manager.stop();

    assert_eq!(rig.recording.lock().ticks.len(), 30);
    let events = evidence_types(&rig);
    let (_, last) = events.last().unwrap();
    assert_eq!(last, "CHANNEL_TERMINATED");
}

/// Scenario: 60 -> 30 fps resample. Every second source frame airs; no
/// consecutive duplicate emissions.
#[test]
fn test_scenario_resample_fast_source() {
    let out = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("fast", FakeAsset::new(4000, RationalFps::new(60, 1)));

    let mut rig = rig(out, factory);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-fast", 0, &[("fast", 0, 2000)]))
        .unwrap();
    rig.manager.start();
    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    rig.manager.stop();

    let recording = rig.recording.lock();
    assert_eq!(recording.ticks.len(), 60);
    for (i, tick) in recording.ticks.iter().enumerate() {
        // Intermediate source frames are dropped: tick i carries frame 2i.
        assert_eq!(tick.frame_tag, 2 * i as i64, "tick {}", i);
    }
    for pair in recording.ticks.windows(2) {
        assert_ne!(pair[0].frame_tag, pair[1].frame_tag);
    }
}

/// Scenario: 24000/1001 -> 30000/1001 resample. Repeat emissions appear on
/// empty ticks; the output grid stays dense and monotonic.
#[test]
fn test_scenario_resample_slow_source() {
    let out = RationalFps::new(30000, 1001);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("film", FakeAsset::new(6000, RationalFps::new(24000, 1001)));

    let mut rig = rig(out, factory);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-film", 0, &[("film", 0, 2002)]))
        .unwrap();
    rig.manager.start();
    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    rig.manager.stop();

    let recording = rig.recording.lock();
    assert_eq!(recording.ticks.len(), 60); // 2.002 s at 29.97

    // Source frames never go backwards, and 4:5 cadence means repeats.
    let mut repeats = 0;
    for pair in recording.ticks.windows(2) {
        assert!(pair[1].frame_tag >= pair[0].frame_tag);
        if pair[1].frame_tag == pair[0].frame_tag {
            repeats += 1;
        }
    }
    assert!(repeats >= 10, "expected film-cadence repeats, got {}", repeats);
    // 60 output ticks consume ~48 source frames.
    let max_tag = recording.ticks.iter().map(|t| t.frame_tag).max().unwrap();
    assert!((46..=49).contains(&max_tag), "source frames consumed: {}", max_tag);
}

/// A pad-classified segment whose asset exhausts early holds the last frame
/// (with silent audio) to the boundary instead of dying.
#[test]
fn test_scenario_pad_tail_hold_last() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("short", FakeAsset::new(1000, fps));

    let plan = BlockPlan {
        block_id: "blk-pad".into(),
        start_utc_ms: 0,
        end_utc_ms: 2000,
        segments: vec![Segment {
            segment_index: 0,
            asset_uri: "short".into(),
            asset_start_offset_ms: 0,
            duration_ms: 2000,
            segment_type: SegmentType::Pad,
            event_id: "ev-pad".into(),
            looping: false,
        }],
    };

    let mut rig = rig(fps, factory);
    rig.manager.submit_block(plan).unwrap();
    rig.manager.start();

    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    rig.manager.stop();

    assert_eq!(rig.recording.lock().ticks.len(), 60);

    rig.spool.flush();
    std::thread::sleep(Duration::from_millis(100));
    let records = rig.spool.replay_from(0);
    let seg_end = records
        .iter()
        .find(|r| r.payload_type == "SEGMENT_END")
        .unwrap();
    assert!(seg_end.payload["fallback_frames_used"].as_u64().unwrap() > 0);
    let fence = records
        .iter()
        .find(|r| r.payload_type == "BLOCK_FENCE")
        .unwrap();
    assert_eq!(fence.payload["early_exhaustion"], true);
}

/// A content-classified segment whose asset exhausts early gets no
/// fallback: the video lookahead drains and the session terminates.
#[test]
fn test_scenario_content_exhaustion_is_fatal() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("short", FakeAsset::new(1000, fps));

    let mut rig = rig(fps, factory);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-cut", 0, &[("short", 0, 2000)]))
        .unwrap();
    rig.manager.start();

    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::VideoUnderflow);
    rig.manager.stop();

    // Ticks stop short of the fence.
    let emitted = rig.recording.lock().ticks.len();
    assert!(emitted < 60, "emitted {} ticks", emitted);

    // The open segment closes as TRUNCATED before the terminal record.
    rig.spool.flush();
    std::thread::sleep(Duration::from_millis(100));
    let records = rig.spool.replay_from(0);
    let seg_end = records
        .iter()
        .find(|r| r.payload_type == "SEGMENT_END")
        .unwrap();
    assert_eq!(seg_end.payload["status"], "TRUNCATED");
    assert_eq!(seg_end.payload["reason"], "VideoUnderflow");
}

/// External stop: graceful drain, `ExternalStop` recorded, no evidence
/// after the terminal record.
#[test]
fn test_scenario_external_stop() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("long", FakeAsset::new(120_000, fps));

    let mut rig = rig(fps, factory);
    rig.manager
        .submit_block(crate::plan::test_plan("blk-long", 0, &[("long", 0, 120_000)]))
        .unwrap();
    rig.manager.start();

    // Let it air a little, then pull the plug.
    let deadline = Instant::now() + Duration::from_secs(10);
    while rig.manager.metrics().frames_emitted < 20 {
        assert!(Instant::now() < deadline, "session never started emitting");
        std::thread::sleep(Duration::from_millis(5));
    }
    rig.manager.stop();

    let (reason, _) = rig.manager.termination().unwrap();
    assert_eq!(reason, TerminationReason::ExternalStop);
    assert!(!rig.manager.is_running());

    let events = evidence_types(&rig);
    let types: Vec<&str> = events.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(*types.last().unwrap(), "CHANNEL_TERMINATED");
    // The interrupted segment was closed before termination.
    assert!(types.contains(&"SEGMENT_END"));
}

/// Mid-block segment seam with a changed source: the prepared result is
/// taken at the boundary tick and decode switches assets seamlessly.
#[test]
fn test_scenario_segment_seam_swap() {
    let fps = RationalFps::new(30, 1);
    let factory = Arc::new(FakeDecoderFactory::new());
    factory.add_asset("first", FakeAsset::new(5000, fps));
    factory.add_asset("second", FakeAsset::new(5000, fps));

    let mut rig = rig(fps, factory);
    rig.manager
        .submit_block(crate::plan::test_plan(
            "blk-seam",
            0,
            &[("first", 0, 2000), ("second", 1000, 2000)],
        ))
        .unwrap();
    rig.manager.start();
    let (reason, _) = wait_terminated(&rig.manager);
    assert_eq!(reason, TerminationReason::UnderrunNoNextBlock);
    rig.manager.stop();

    let recording = rig.recording.lock();
    assert_eq!(recording.ticks.len(), 120);
    assert_eq!(recording.ticks[59].asset_uri, "first");
    assert_eq!(recording.ticks[60].asset_uri, "second");
    // The second segment entered at its configured 1 s asset offset.
    assert_eq!(recording.ticks[60].frame_tag, 30);

    let metrics = rig.manager.metrics();
    assert_eq!(metrics.seam_misses, 0);
    assert!(metrics.seams_taken >= 1);
}

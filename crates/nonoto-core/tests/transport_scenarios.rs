//! End-to-end checks of the transport and the double-buffered scheduler.

use std::time::{Duration, Instant};

use nonoto_core::{
    BeatTime, ConflictKind, Content, DoubleBufferedContentScheduler, Error, RecordingSink,
    ScheduledEvent, SharedTransport, SlotId, TransportClock,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LOOKAHEAD: Duration = Duration::from_millis(150);
const TICK: Duration = Duration::from_millis(10);

fn per_beat(note: u8, beats: usize) -> Content {
    let events = (0..beats)
        .map(|beat| ScheduledEvent::note(beat as f64, 0.25, note))
        .collect();
    Content::symbolic(events, Vec::new(), BeatTime::from_float(beats as f64))
}

fn run_ticks(
    buffer: &mut DoubleBufferedContentScheduler,
    sink: &mut RecordingSink,
    origin: Instant,
    from: u32,
    to: u32,
) {
    for i in from..to {
        buffer.tick(origin + TICK * i, LOOKAHEAD, sink);
    }
}

#[test]
fn test_set_tempo_preserves_position() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let origin = Instant::now();
    for _ in 0..200 {
        let mut clock = TransportClock::new();
        clock
            .set_loop(BeatTime::ZERO, BeatTime::from_float(16.0), origin)
            .unwrap();
        clock.set_looping(rng.random_bool(0.5), origin);
        if rng.random_bool(0.7) {
            clock.start(origin, BeatTime::from_float(rng.random_range(0.0..16.0)));
        }
        let now = origin + Duration::from_millis(rng.random_range(0..20_000));
        let before = clock.position_at(now).to_float();
        let bpm = rng.random_range(1.0..400.0);
        clock.set_tempo(bpm, now).unwrap();
        let after = clock.position_at(now).to_float();
        assert!((before - after).abs() < 1e-3, "bpm {bpm}: {before} -> {after}");
    }
}

#[test]
fn test_loop_invariant_under_random_operations() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut now = Instant::now();
    let mut clock = TransportClock::new();
    clock
        .set_loop(BeatTime::ZERO, BeatTime::from_float(8.0), now)
        .unwrap();
    clock.set_looping(true, now);

    for _ in 0..2000 {
        now += Duration::from_millis(rng.random_range(0..400));
        match rng.random_range(0..6) {
            0 => clock.start(now, BeatTime::from_float(rng.random_range(0.0..32.0))),
            1 => clock.pause(now),
            2 => clock.seek(BeatTime::from_float(rng.random_range(0.0..32.0)), now),
            3 => {
                let start = rng.random_range(0.0..12.0);
                let end = start + rng.random_range(0.25..12.0);
                clock
                    .set_loop(BeatTime::from_float(start), BeatTime::from_float(end), now)
                    .unwrap();
            }
            4 => clock.set_tempo(rng.random_range(30.0..300.0), now).unwrap(),
            _ => {
                clock.nudge(rng.random_range(-0.5..0.5), Duration::from_millis(500), now);
            }
        }

        for probe in [0, 7, 130, 1999] {
            let at = now + Duration::from_millis(probe);
            if clock.is_looping() && clock.is_running() {
                let position = clock.position_at(at);
                assert!(
                    position >= clock.loop_start() && position < clock.loop_end(),
                    "{} outside {}..{}",
                    position,
                    clock.loop_start(),
                    clock.loop_end()
                );
                let progress = clock.progress_at(at);
                assert!((0.0..1.0).contains(&progress));
            }
        }
    }
}

#[test]
fn test_progress_is_half_after_two_of_four_bars() {
    let now = Instant::now();
    let mut clock = TransportClock::new();
    let end = BeatTime::from_bars(4.0, clock.time_signature());
    clock.set_loop(BeatTime::ZERO, end, now).unwrap();
    clock.set_looping(true, now);
    clock.start(now, BeatTime::ZERO);

    // 2 bars of 4/4 at 120 BPM
    let later = now + Duration::from_secs(4);
    assert!((clock.progress_at(later) - 0.5).abs() < 1e-9);
    assert_eq!(clock.snapshot(later).bars_beats_ticks().to_string(), "2:0:000");
}

#[test]
fn test_swap_never_interleaves_generations() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..25 {
        let transport = SharedTransport::new(TransportClock::new());
        let mut buffer = DoubleBufferedContentScheduler::new(transport.clone(), Duration::from_secs(1));
        let mut sink = RecordingSink::new();
        let origin = Instant::now();

        buffer.update_content(per_beat(60, 8)).unwrap();
        buffer.swap(origin).unwrap();
        transport.write(|clock| clock.start(origin, BeatTime::ZERO));

        let swap_tick = rng.random_range(1..600);
        run_ticks(&mut buffer, &mut sink, origin, 0, swap_tick);
        let beats = rng.random_range(1..12);
        buffer.update_content(per_beat(72, beats)).unwrap();
        let report = buffer.swap(origin + TICK * swap_tick).unwrap();
        run_ticks(&mut buffer, &mut sink, origin, swap_tick, swap_tick + 600);

        assert!(sink.notes_with_pitch(60).all(|n| n.time <= report.at));
        assert!(sink.notes_with_pitch(72).all(|n| n.time >= report.at));
        assert!(sink.notes_with_pitch(72).count() > 0);
    }
}

#[test]
fn test_shorter_generation_restarts_at_its_own_downbeat() {
    let transport = SharedTransport::new(TransportClock::new());
    let mut buffer = DoubleBufferedContentScheduler::new(transport.clone(), Duration::from_secs(1));
    let mut sink = RecordingSink::new();
    let origin = Instant::now();

    // 4-bar generation A
    buffer.update_content(per_beat(60, 16)).unwrap();
    buffer.swap(origin).unwrap();
    transport.write(|clock| clock.start(origin, BeatTime::ZERO));

    // play into the third bar (beat 8 starts at 4s); bars count from zero
    run_ticks(&mut buffer, &mut sink, origin, 0, 425);
    assert_eq!(
        transport.snapshot(origin + TICK * 425).bars_beats_ticks().bar,
        2
    );

    buffer.update_content(per_beat(72, 8)).unwrap();
    let report = buffer.swap(origin + TICK * 425).unwrap();
    assert!(report.rebased);
    assert_eq!(report.loop_start, BeatTime::ZERO);
    assert_eq!(report.loop_end, BeatTime::from_float(8.0));
    run_ticks(&mut buffer, &mut sink, origin, 425, 1400);

    assert!(sink.notes_with_pitch(60).all(|n| n.time <= report.at));
    let b: Vec<Instant> = sink.notes_with_pitch(72).map(|n| n.time).collect();
    assert_eq!(b[0], report.at);
    assert_eq!(b[1], report.at + Duration::from_millis(500));
    // the 2-bar loop wraps after 8 beats
    assert_eq!(b[8], report.at + Duration::from_secs(4));
}

#[test]
fn test_second_swap_is_rejected_without_side_effects() {
    let transport = SharedTransport::new(TransportClock::new());
    let mut buffer = DoubleBufferedContentScheduler::new(transport.clone(), Duration::from_secs(1));
    let now = Instant::now();
    transport.write(|clock| clock.start(now, BeatTime::ZERO));

    buffer.update_content(per_beat(60, 4)).unwrap();
    buffer.swap(now).unwrap();
    let later = now + Duration::from_millis(300);
    let snapshot = transport.snapshot(later);
    let active = buffer.active_slot();

    assert_eq!(
        buffer.swap(later),
        Err(Error::SchedulingConflict(ConflictKind::NothingStaged))
    );
    assert_eq!(buffer.active_slot(), active);
    assert_eq!(active, SlotId::B);
    assert_eq!(transport.snapshot(later), snapshot);
}

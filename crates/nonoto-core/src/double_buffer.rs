//! Double-buffered content scheduling.
//!
//! Two generation slots live in a fixed arena indexed by `active`. New
//! content is only ever written to the inactive slot; the active slot keeps
//! feeding the scheduler until [`DoubleBufferedContentScheduler::swap`] flips
//! the index at the next scheduling tick.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::PlaybackConfig;
use crate::content::ContentFeed;
use crate::error::{ConflictKind, Error, Result};
use crate::events::{Content, ContentBody, Crossfade, NotePayload};
use crate::scheduler::{Due, EventScheduler};
use crate::sink::NoteSink;
use crate::timing::BeatTime;
use crate::transport::SharedTransport;

/// Identity of a generation slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }

    fn from_index(index: usize) -> Self {
        if index == 0 {
            SlotId::A
        } else {
            SlotId::B
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::A => write!(f, "A"),
            SlotId::B => write!(f, "B"),
        }
    }
}

/// Notes currently held on a slot's instrument, keyed by (channel, note).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoicePool {
    held: BTreeMap<(u8, u8), f32>,
}

impl VoicePool {
    pub fn hold(&mut self, channel: u8, note: u8, velocity: f32) {
        self.held.insert((channel, note), velocity);
    }

    pub fn release(&mut self, channel: u8, note: u8) -> bool {
        self.held.remove(&(channel, note)).is_some()
    }

    pub fn is_held(&self, channel: u8, note: u8) -> bool {
        self.held.contains_key(&(channel, note))
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Add every voice of `other` that is not already held here.
    fn absorb(&mut self, other: &VoicePool) -> usize {
        let mut added = 0;
        for (&key, &velocity) in &other.held {
            if let std::collections::btree_map::Entry::Vacant(entry) = self.held.entry(key) {
                entry.insert(velocity);
                added += 1;
            }
        }
        added
    }

    fn clear(&mut self) {
        self.held.clear();
    }
}

/// One of the two alternating content buffers.
#[derive(Clone, Debug)]
pub struct ContentGeneration {
    pub id: SlotId,
    pub muted: bool,
    content: Option<Content>,
    generation: u64,
    voices: VoicePool,
}

impl ContentGeneration {
    fn empty(id: SlotId, muted: bool) -> Self {
        Self {
            id,
            muted,
            content: None,
            generation: 0,
            voices: VoicePool::default(),
        }
    }

    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    /// Stamp of the content loaded into this slot (0 when empty).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn duration_in_loop(&self) -> Option<BeatTime> {
        self.content.as_ref().map(|c| c.duration_in_loop)
    }

    pub fn voices(&self) -> &VoicePool {
        &self.voices
    }
}

/// Receipt for content written into the inactive slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentTicket {
    pub slot: SlotId,
    pub generation: u64,
}

/// What a successful swap did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapReport {
    /// The scheduling tick at which the swap takes effect.
    pub at: Instant,
    pub active: SlotId,
    pub previous: SlotId,
    pub generation: u64,
    pub loop_start: BeatTime,
    pub loop_end: BeatTime,
    /// The new content restarted at its own beat zero.
    pub rebased: bool,
    pub crossfade: Option<Crossfade>,
    /// Held voices copied into the new slot.
    pub carried_voices: usize,
}

/// Holds two content generations and swaps them glitch-free.
pub struct DoubleBufferedContentScheduler {
    transport: SharedTransport,
    slots: [ContentGeneration; 2],
    active: usize,
    staged: Option<u64>,
    next_generation: u64,
    scheduler: EventScheduler,
    crossfade: Crossfade,
    crossfade_duration: Duration,
    feed: Option<ContentFeed>,
}

impl DoubleBufferedContentScheduler {
    pub fn new(transport: SharedTransport, crossfade_duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            transport,
            slots: [
                ContentGeneration::empty(SlotId::A, false),
                ContentGeneration::empty(SlotId::B, true),
            ],
            active: 0,
            staged: None,
            next_generation: 1,
            scheduler: EventScheduler::new(),
            crossfade: Crossfade {
                from: 0.0,
                to: 0.0,
                start: now,
                duration: Duration::ZERO,
            },
            crossfade_duration,
            feed: None,
        }
    }

    pub fn with_config(transport: SharedTransport, config: &PlaybackConfig) -> Self {
        Self::new(transport, config.crossfade_duration)
    }

    /// Consume updates from a producer at every [`tick`](Self::tick).
    pub fn attach_feed(&mut self, feed: ContentFeed) {
        self.feed = Some(feed);
    }

    fn inactive(&self) -> usize {
        1 - self.active
    }

    pub fn active_slot(&self) -> SlotId {
        SlotId::from_index(self.active)
    }

    pub fn slot(&self, id: SlotId) -> &ContentGeneration {
        &self.slots[id.index()]
    }

    pub fn active_generation(&self) -> &ContentGeneration {
        &self.slots[self.active]
    }

    /// Generation waiting in the inactive slot, if any.
    pub fn staged(&self) -> Option<u64> {
        self.staged
    }

    pub fn crossfade(&self) -> &Crossfade {
        &self.crossfade
    }

    /// Load `content` into the inactive slot.
    ///
    /// The active slot is never touched. Invalid content is rejected without
    /// any state change; a newer update overwrites an unswapped older one.
    pub fn update_content(&mut self, content: Content) -> Result<ContentTicket> {
        content.validate()?;

        let generation = self.next_generation;
        self.next_generation += 1;
        if let Some(stale) = self.staged {
            log::debug!(
                "[CONTENT] Generation {} supersedes unswapped generation {}",
                generation,
                stale
            );
        }

        let inactive = self.inactive();
        let slot = &mut self.slots[inactive];
        slot.content = Some(content);
        slot.generation = generation;
        slot.voices.clear();
        self.staged = Some(generation);

        log::debug!("[CONTENT] Staged generation {} in slot {}", generation, slot.id);
        Ok(ContentTicket {
            slot: slot.id,
            generation,
        })
    }

    /// Swap only if `ticket` is still the staged generation.
    pub fn swap_ticket(&mut self, ticket: ContentTicket, now: Instant) -> Result<SwapReport> {
        match self.staged {
            Some(staged) if staged == ticket.generation => self.swap(now),
            Some(staged) => Err(Error::SchedulingConflict(ConflictKind::Superseded {
                request: ticket.generation,
                latest: staged,
            })),
            None => Err(Error::SchedulingConflict(ConflictKind::NothingStaged)),
        }
    }

    /// Make the staged slot active at the next scheduling tick.
    pub fn swap(&mut self, now: Instant) -> Result<SwapReport> {
        let generation = self
            .staged
            .ok_or(Error::SchedulingConflict(ConflictKind::NothingStaged))?;
        let next = self.inactive();
        let (duration, is_audio) = match self.slots[next].content.as_ref() {
            Some(content) => (content.duration_in_loop, content.is_audio()),
            None => return Err(Error::SchedulingConflict(ConflictKind::NothingStaged)),
        };

        let scheduler = &mut self.scheduler;
        let (at, loop_start, rebased) = self.transport.write(|clock| -> Result<_> {
            let tick = scheduler.next_tick(clock, now);
            let at = tick.map_or(now, |tick| tick.instant);
            let position = clock.position_at(at);
            let loop_start = if clock.loop_start() < duration {
                clock.loop_start()
            } else {
                BeatTime::ZERO
            };

            clock.set_loop(loop_start, duration, at)?;
            clock.set_looping(true, at);
            let rebased = position >= duration;
            if rebased {
                clock.seek(loop_start, at);
            }
            if let Some(tick) = tick {
                scheduler.restart_at(clock, at, rebased || tick.inclusive);
            }
            Ok((at, loop_start, rebased))
        })?;

        let previous = self.active;
        self.active = next;
        self.slots[previous].muted = true;
        self.slots[next].muted = false;
        self.staged = None;

        let mut carried_voices = 0;
        let mut crossfade = None;
        let target = next as f32;
        if is_audio {
            let fade = Crossfade {
                from: self.crossfade.value_at(at),
                to: target,
                start: at,
                duration: self.crossfade_duration,
            };
            let (left, right) = self.slots.split_at_mut(1);
            let (from, to) = if previous == 0 {
                (&left[0], &mut right[0])
            } else {
                (&right[0], &mut left[0])
            };
            carried_voices = to.voices.absorb(&from.voices);
            self.crossfade = fade;
            crossfade = Some(fade);
        } else {
            self.crossfade = Crossfade {
                from: target,
                to: target,
                start: at,
                duration: Duration::ZERO,
            };
        }

        let report = SwapReport {
            at,
            active: SlotId::from_index(next),
            previous: SlotId::from_index(previous),
            generation,
            loop_start,
            loop_end: duration,
            rebased,
            crossfade,
            carried_voices,
        };
        log::info!(
            "[CONTENT] Swapped {} -> {} (generation {}, loop {}..{}{})",
            report.previous,
            report.active,
            generation,
            loop_start,
            duration,
            if rebased { ", restarted" } else { "" }
        );
        Ok(report)
    }

    /// One scheduling tick: pick up the freshest producer update, then hand
    /// the active generation's due events to `sink`.
    ///
    /// Returns the number of notes and pedal changes handed out.
    pub fn tick(&mut self, now: Instant, lookahead: Duration, sink: &mut dyn NoteSink) -> usize {
        let update = self.feed.as_ref().and_then(ContentFeed::drain_latest);
        if let Some(update) = update {
            match self.update_content(update.content) {
                Ok(ticket) => {
                    if let Err(e) = self.swap_ticket(ticket, now) {
                        log::warn!("[CONTENT] Swap of request {} failed: {}", update.request, e);
                    }
                }
                Err(e) => log::warn!("[CONTENT] Rejected content of request {}: {}", update.request, e),
            }
        }

        let slot = &self.slots[self.active];
        let (events, controls) = match slot.content.as_ref().map(|c| &c.body) {
            Some(ContentBody::Symbolic {
                events,
                control_events,
            }) => (events.as_slice(), control_events.as_slice()),
            _ => (&[][..], &[][..]),
        };

        let scheduler = &mut self.scheduler;
        self.transport.read(|clock| {
            let mut fired = 0;
            for due in scheduler.collect_due_events(clock, now, lookahead, events, controls) {
                match due.item {
                    Due::Note(event) => {
                        let duration = clock.duration_of(event.duration.to_float());
                        for &note in event.payload.notes() {
                            match &event.payload {
                                NotePayload::NoteOff { .. } => {
                                    sink.play_note(due.time, note, 0.0, Duration::ZERO, event.channel)
                                }
                                NotePayload::NoteOn { velocity, .. }
                                | NotePayload::Chord { velocity, .. } => {
                                    sink.play_note(due.time, note, *velocity, duration, event.channel)
                                }
                            }
                            fired += 1;
                        }
                    }
                    Due::Control(control) if control.is_pedal() => {
                        sink.trigger_pedal(due.time, control.pedal_down());
                        fired += 1;
                    }
                    Due::Control(control) => {
                        log::trace!("[SCHEDULER] Ignoring controller {}", control.controller);
                    }
                }
            }
            fired
        })
    }

    /// Start a live (keyboard / MIDI-in) note on both slots' voice pools.
    pub fn live_note_on(
        &mut self,
        channel: u8,
        note: u8,
        velocity: f32,
        now: Instant,
        sink: &mut dyn NoteSink,
    ) {
        for slot in &mut self.slots {
            slot.voices.hold(channel, note, velocity);
        }
        sink.play_note(now, note, velocity, Duration::ZERO, channel);
    }

    /// Release a live note on both slots' voice pools.
    pub fn live_note_off(&mut self, channel: u8, note: u8, now: Instant, sink: &mut dyn NoteSink) {
        let mut released = false;
        for slot in &mut self.slots {
            released |= slot.voices.release(channel, note);
        }
        if released {
            sink.play_note(now, note, 0.0, Duration::ZERO, channel);
        }
    }

    /// Mix the audio generations into `out` (mono), starting at `at`.
    ///
    /// Each slot is weighted by the crossfade gains; symbolic slots are
    /// silent here. Writes silence while the transport is stopped.
    pub fn render(&self, out: &mut [f32], at: Instant, sample_rate: u32) {
        out.fill(0.0);
        if sample_rate == 0 {
            return;
        }
        self.transport.read(|clock| {
            if !clock.is_running() {
                return;
            }
            let seconds_per_beat = 60.0 / clock.bpm();
            for (i, sample) in out.iter_mut().enumerate() {
                let t = at + Duration::from_secs_f64(i as f64 / sample_rate as f64);
                let position = clock.position_at(t).to_float();
                let gains = self.crossfade.gains_at(t);
                for slot in &self.slots {
                    let gain = gains[slot.id.index()];
                    if gain <= 0.0 {
                        continue;
                    }
                    if let Some(Content {
                        body: ContentBody::Audio(clip),
                        duration_in_loop,
                    }) = &slot.content
                    {
                        let offset = position.rem_euclid(duration_in_loop.to_float());
                        *sample += gain * clip.sample_at(offset * seconds_per_beat);
                    }
                }
            }
        });
    }
}

impl fmt::Debug for DoubleBufferedContentScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleBufferedContentScheduler")
            .field("active", &self.active_slot())
            .field("staged", &self.staged)
            .field("generations", &[self.slots[0].generation, self.slots[1].generation])
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::content_channel;
    use crate::events::{AudioClip, ScheduledControlEvent, ScheduledEvent};
    use crate::sink::RecordingSink;
    use crate::transport::TransportClock;

    const LOOKAHEAD: Duration = Duration::from_millis(150);

    fn melody(note: u8, beats: usize) -> Content {
        let events = (0..beats)
            .map(|beat| ScheduledEvent::note(beat as f64, 0.5, note))
            .collect();
        Content::symbolic(events, Vec::new(), BeatTime::from_float(beats as f64))
    }

    fn buffer() -> (SharedTransport, DoubleBufferedContentScheduler) {
        let transport = SharedTransport::new(TransportClock::new());
        let buffer = DoubleBufferedContentScheduler::new(transport.clone(), Duration::from_secs(1));
        (transport, buffer)
    }

    fn unmuted(buffer: &DoubleBufferedContentScheduler) -> usize {
        [SlotId::A, SlotId::B]
            .iter()
            .filter(|&&id| !buffer.slot(id).muted)
            .count()
    }

    #[test]
    fn test_update_writes_inactive_slot_only() {
        let (_transport, mut buffer) = buffer();
        let ticket = buffer.update_content(melody(60, 4)).unwrap();
        assert_eq!(ticket.slot, SlotId::B);
        assert_eq!(buffer.active_slot(), SlotId::A);
        assert!(buffer.slot(SlotId::A).content().is_none());
        assert_eq!(buffer.staged(), Some(ticket.generation));
        assert_eq!(unmuted(&buffer), 1);
    }

    #[test]
    fn test_invalid_update_leaves_state_untouched() {
        let (_transport, mut buffer) = buffer();
        let empty = Content::symbolic(Vec::new(), Vec::new(), BeatTime::from_float(4.0));
        assert!(matches!(buffer.update_content(empty), Err(Error::InvalidContent(_))));
        assert_eq!(buffer.staged(), None);
        assert!(buffer.slot(SlotId::B).content().is_none());
    }

    #[test]
    fn test_swap_without_staged_content_is_rejected() {
        let (transport, mut buffer) = buffer();
        let now = Instant::now();
        assert_eq!(
            buffer.swap(now).unwrap_err(),
            Error::SchedulingConflict(ConflictKind::NothingStaged)
        );

        buffer.update_content(melody(60, 4)).unwrap();
        buffer.swap(now).unwrap();
        let before = transport.snapshot(now);
        let err = buffer.swap(now).unwrap_err();
        assert_eq!(err, Error::SchedulingConflict(ConflictKind::NothingStaged));
        assert_eq!(buffer.active_slot(), SlotId::B);
        assert_eq!(transport.snapshot(now), before);
    }

    #[test]
    fn test_superseded_ticket_cannot_swap() {
        let (_transport, mut buffer) = buffer();
        let now = Instant::now();
        let stale = buffer.update_content(melody(60, 4)).unwrap();
        let fresh = buffer.update_content(melody(62, 4)).unwrap();
        assert_eq!(
            buffer.swap_ticket(stale, now).unwrap_err(),
            Error::SchedulingConflict(ConflictKind::Superseded {
                request: stale.generation,
                latest: fresh.generation,
            })
        );
        let report = buffer.swap_ticket(fresh, now).unwrap();
        assert_eq!(report.generation, fresh.generation);
        let content = buffer.active_generation().content().unwrap();
        assert_eq!(*content, melody(62, 4));
    }

    #[test]
    fn test_swap_derives_loop_from_new_content() {
        let (transport, mut buffer) = buffer();
        let now = Instant::now();
        buffer.update_content(melody(60, 6)).unwrap();
        let report = buffer.swap(now).unwrap();
        assert_eq!(report.loop_end, BeatTime::from_float(6.0));
        let snapshot = transport.snapshot(now);
        assert!(snapshot.looping);
        assert_eq!(snapshot.loop_end, BeatTime::from_float(6.0));
        assert_eq!(unmuted(&buffer), 1);
    }

    #[test]
    fn test_symbolic_swap_is_same_tick_flip() {
        let (transport, mut buffer) = buffer();
        let now = Instant::now();
        let mut sink = RecordingSink::new();
        buffer.update_content(melody(60, 4)).unwrap();
        buffer.swap(now).unwrap();
        transport.write(|clock| clock.start(now, BeatTime::ZERO));

        for tick in 0..50 {
            buffer.tick(now + Duration::from_millis(tick * 10), LOOKAHEAD, &mut sink);
        }
        let swap_now = now + Duration::from_millis(500);
        buffer.update_content(melody(72, 4)).unwrap();
        let report = buffer.swap(swap_now).unwrap();
        assert!(report.crossfade.is_none());
        assert!(!report.rebased);
        for tick in 50..300 {
            buffer.tick(now + Duration::from_millis(tick * 10), LOOKAHEAD, &mut sink);
        }

        assert!(sink.notes_with_pitch(60).all(|n| n.time <= report.at));
        assert!(sink.notes_with_pitch(72).all(|n| n.time > report.at));
        assert!(sink.notes_with_pitch(72).count() > 0);
    }

    #[test]
    fn test_tempo_change_after_swap_keeps_position() {
        let (transport, mut buffer) = buffer();
        let now = Instant::now();
        let mut sink = RecordingSink::new();
        buffer.update_content(melody(60, 4)).unwrap();
        buffer.swap(now).unwrap();
        transport.write(|clock| clock.start(now, BeatTime::ZERO));

        let t = now + Duration::from_secs(1);
        for tick in 0..=100 {
            buffer.tick(now + Duration::from_millis(tick * 10), LOOKAHEAD, &mut sink);
        }
        buffer.update_content(melody(72, 4)).unwrap();
        let report = buffer.swap(t).unwrap();
        assert!(report.at > t);

        let before = transport.snapshot(t).position.to_float();
        assert!((before - 2.0).abs() < 1e-3);
        transport.write(|clock| clock.set_tempo(60.0, t)).unwrap();
        let after = transport.snapshot(t).position.to_float();
        assert!((after - before).abs() < 1e-3, "{before} -> {after}");
    }

    #[test]
    fn test_feed_updates_are_swapped_in_on_tick() {
        let (transport, mut buffer) = buffer();
        let (publisher, feed) = content_channel();
        buffer.attach_feed(feed);
        let now = Instant::now();
        transport.write(|clock| clock.start(now, BeatTime::ZERO));

        let stale = publisher.begin_request();
        let fresh = publisher.begin_request();
        assert!(publisher.complete(&stale, melody(60, 4)).is_err());
        publisher.complete(&fresh, melody(64, 4)).unwrap();

        let mut sink = RecordingSink::new();
        buffer.tick(now, LOOKAHEAD, &mut sink);
        assert_eq!(buffer.active_slot(), SlotId::B);
        assert_eq!(sink.notes.len(), 1);
        assert_eq!(sink.notes[0].note, 64);
        assert_eq!(sink.notes[0].time, now);
    }

    #[test]
    fn test_pedal_and_note_off_delivery() {
        let (transport, mut buffer) = buffer();
        let now = Instant::now();
        let content = Content::symbolic(
            vec![
                ScheduledEvent::note(0.0, 1.0, 60),
                ScheduledEvent {
                    time: BeatTime::from_float(0.0),
                    duration: BeatTime::ZERO,
                    channel: 2,
                    payload: NotePayload::NoteOff { note: 48 },
                },
            ],
            vec![ScheduledControlEvent::pedal(0.0, true)],
            BeatTime::from_float(4.0),
        );
        buffer.update_content(content).unwrap();
        buffer.swap(now).unwrap();
        transport.write(|clock| clock.start(now, BeatTime::ZERO));

        let mut sink = RecordingSink::new();
        let fired = buffer.tick(now, LOOKAHEAD, &mut sink);
        assert_eq!(fired, 3);
        assert_eq!(sink.pedals, vec![(now, true)]);
        let off = sink.notes_with_pitch(48).next().unwrap();
        assert_eq!(off.velocity, 0.0);
        assert_eq!(off.duration, Duration::ZERO);
        let on = sink.notes_with_pitch(60).next().unwrap();
        assert_eq!(on.duration, Duration::from_millis(500));
    }

    #[test]
    fn test_audio_swap_crossfades_and_carries_voices() {
        let (transport, mut buffer) = buffer();
        let now = Instant::now();
        let mut sink = RecordingSink::new();
        transport.write(|clock| clock.start(now, BeatTime::ZERO));

        let clip = |level: f32| Content::audio(AudioClip::new(100, vec![level; 400]), BeatTime::from_float(8.0));
        buffer.update_content(clip(0.25)).unwrap();
        buffer.swap(now).unwrap();

        buffer.live_note_on(0, 60, 0.9, now, &mut sink);
        buffer.update_content(clip(1.0)).unwrap();
        // reloading the inactive slot drops its voices
        assert!(buffer.slot(SlotId::A).voices().is_empty());
        assert!(buffer.slot(SlotId::B).voices().is_held(0, 60));

        let later = now + Duration::from_secs(2);
        let report = buffer.swap(later).unwrap();
        assert_eq!(report.at, later);
        assert!(!report.rebased);
        let fade = report.crossfade.unwrap();
        assert_eq!(fade.duration, Duration::from_secs(1));
        assert_eq!(fade.from, 1.0);
        assert_eq!(fade.to, 0.0);
        assert_eq!(report.carried_voices, 1);
        assert!(buffer.slot(SlotId::A).voices().is_held(0, 60));

        let mut out = [0.0f32; 1];
        buffer.render(&mut out, report.at + Duration::from_millis(500), 100);
        // halfway: 0.5 * 0.25 + 0.5 * 1.0
        assert!((out[0] - 0.625).abs() < 1e-4);

        buffer.live_note_off(0, 60, now, &mut sink);
        assert!(buffer.slot(SlotId::A).voices().is_empty());
        assert_eq!(sink.notes.len(), 2);
    }
}

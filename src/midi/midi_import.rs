//! Standard MIDI File (SMF) parsing into a playable event list.
//!
//! Reads .mid and .midi data into a single time-ordered `EventList`.
//! Supports SMF Format 0 (single track), Format 1 (parallel tracks, merged
//! by absolute tick) and Format 2 (sequential tracks, played back to back).
//!
//! # Limitations
//!
//! - Only metrical (ticks per quarter note) timing is supported
//! - System common and realtime messages are skipped
//! - Meta events are kept with their raw payload; the engine only acts on tempo

use super::{
    EventList, TimedEvent, CMD_BENDER, CMD_CHANNEL_PRESSURE, CMD_CONTROL, CMD_NOTE_OFF,
    CMD_NOTE_ON, CMD_NOTE_PRESSURE, CMD_PGM_CHANGE, META_END_OF_TRACK, META_KEY_SIGNATURE,
    META_TEMPO, META_TEXT, META_TIME_SIGNATURE, META_TRACK_NAME, MAX_TICK, SYSEX,
    SYSEX_END,
};
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while building an event list.
#[derive(Debug, Error)]
pub enum MidiImportError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// MIDI parsing failed
    #[error("MIDI parse error: {0}")]
    Parse(String),
    /// Unsupported MIDI format or timing
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// The file contained no events at all
    #[error("MIDI file contains no events")]
    Empty,
    /// Event storage could not be reserved
    #[error("Out of memory")]
    OutOfMemory,
}

/// Parses SMF bytes into an event list and its ticks-per-quarter-note resolution.
///
/// # Arguments
///
/// * `data` - Raw Standard MIDI File bytes
///
/// # Returns
///
/// The merged, time-ordered event list and the file's PPQN
///
/// # Errors
///
/// Returns error if the data is not a valid SMF, uses timecode timing, or
/// contains no events
pub fn parse(data: &[u8]) -> Result<(EventList, u16), MidiImportError> {
    let smf = Smf::parse(data).map_err(|e| MidiImportError::Parse(e.to_string()))?;

    let ppqn = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int(),
        Timing::Timecode(_, _) => {
            return Err(MidiImportError::UnsupportedFormat(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if ppqn == 0 {
        return Err(MidiImportError::UnsupportedFormat(
            "zero ticks per quarter note".to_string(),
        ));
    }

    let total: usize = smf.tracks.iter().map(|t| t.len()).sum();
    let mut events = Vec::new();
    events
        .try_reserve_exact(total)
        .map_err(|_| MidiImportError::OutOfMemory)?;

    // Format 2 tracks are independent sequences played one after another
    let sequential = smf.header.format == Format::Sequential;
    let mut offset: u32 = 0;

    for track in &smf.tracks {
        let end = convert_track(track, offset, &mut events)?;
        if sequential {
            offset = end;
        }
    }

    tracing::debug!(
        "Parsed {} tracks ({:?}), {} events, ppqn {}",
        smf.tracks.len(),
        smf.header.format,
        events.len(),
        ppqn
    );

    Ok((EventList::from_events(events)?, ppqn))
}

/// Reads and parses a MIDI file from disk.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<(EventList, u16), MidiImportError> {
    let data = fs::read(path.as_ref())?;
    parse(&data)
}

/// Appends one track's events at absolute ticks starting from `offset`.
/// Returns the absolute tick where the track ends.
fn convert_track(
    track: &[TrackEvent],
    offset: u32,
    out: &mut Vec<TimedEvent>,
) -> Result<u32, MidiImportError> {
    let mut tick = offset;

    for event in track {
        tick = tick
            .checked_add(event.delta.as_int())
            .filter(|t| *t <= MAX_TICK)
            .ok_or_else(|| {
                MidiImportError::UnsupportedFormat(
                    "track runs past the last playable tick".to_string(),
                )
            })?;

        match event.kind {
            TrackEventKind::Midi { channel, message } => {
                out.push(convert_message(tick, channel.as_int(), message));
            }
            TrackEventKind::SysEx(payload) => {
                out.push(TimedEvent {
                    tick,
                    status: SYSEX,
                    data: [0, 0],
                    extra: payload.to_vec(),
                });
            }
            TrackEventKind::Escape(payload) => {
                out.push(TimedEvent {
                    tick,
                    status: SYSEX_END,
                    data: [0, 0],
                    extra: payload.to_vec(),
                });
            }
            TrackEventKind::Meta(meta) => {
                if let Some(ev) = convert_meta(tick, meta) {
                    out.push(ev);
                }
            }
        }
    }

    Ok(tick)
}

fn convert_message(tick: u32, channel: u8, message: MidiMessage) -> TimedEvent {
    let (command, d0, d1) = match message {
        MidiMessage::NoteOff { key, vel } => (CMD_NOTE_OFF, key.as_int(), vel.as_int()),
        MidiMessage::NoteOn { key, vel } => (CMD_NOTE_ON, key.as_int(), vel.as_int()),
        MidiMessage::Aftertouch { key, vel } => (CMD_NOTE_PRESSURE, key.as_int(), vel.as_int()),
        MidiMessage::Controller { controller, value } => {
            (CMD_CONTROL, controller.as_int(), value.as_int())
        }
        MidiMessage::ProgramChange { program } => (CMD_PGM_CHANGE, program.as_int(), 0),
        MidiMessage::ChannelAftertouch { vel } => (CMD_CHANNEL_PRESSURE, vel.as_int(), 0),
        MidiMessage::PitchBend { bend } => {
            // Stored LSB first, as on the wire
            let raw = bend.0.as_int();
            (CMD_BENDER, (raw & 0x7F) as u8, (raw >> 7) as u8)
        }
    };
    TimedEvent::new(tick, command | (channel & 0x0F), d0, d1)
}

fn convert_meta(tick: u32, meta: MetaMessage) -> Option<TimedEvent> {
    let ev = match meta {
        MetaMessage::Tempo(t) => {
            TimedEvent::meta(tick, META_TEMPO, t.as_int().to_be_bytes()[1..].to_vec())
        }
        MetaMessage::Text(text) => TimedEvent::meta(tick, META_TEXT, text.to_vec()),
        MetaMessage::TrackName(name) => TimedEvent::meta(tick, META_TRACK_NAME, name.to_vec()),
        MetaMessage::EndOfTrack => TimedEvent::meta(tick, META_END_OF_TRACK, Vec::new()),
        MetaMessage::TimeSignature(num, denom, clocks, notes) => {
            TimedEvent::meta(tick, META_TIME_SIGNATURE, vec![num, denom, clocks, notes])
        }
        MetaMessage::KeySignature(sharps, minor) => {
            TimedEvent::meta(tick, META_KEY_SIGNATURE, vec![sharps as u8, minor as u8])
        }
        MetaMessage::Unknown(meta_type, data) => TimedEvent::meta(tick, meta_type, data.to_vec()),
        _ => return None,
    };
    Some(ev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u15, u24, u28, u4, u7};
    use midly::{Header, PitchBend};

    fn ev(delta: u32, kind: TrackEventKind<'static>) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind,
        }
    }

    fn note(delta: u32, channel: u8, on: bool, key: u8, vel: u8) -> TrackEvent<'static> {
        let message = if on {
            MidiMessage::NoteOn {
                key: u7::new(key),
                vel: u7::new(vel),
            }
        } else {
            MidiMessage::NoteOff {
                key: u7::new(key),
                vel: u7::new(vel),
            }
        };
        ev(
            delta,
            TrackEventKind::Midi {
                channel: u4::new(channel),
                message,
            },
        )
    }

    fn end_of_track() -> TrackEvent<'static> {
        ev(0, TrackEventKind::Meta(MetaMessage::EndOfTrack))
    }

    fn write(format: Format, timing: Timing, tracks: Vec<Vec<TrackEvent<'static>>>) -> Vec<u8> {
        let mut smf = Smf::new(Header::new(format, timing));
        smf.tracks = tracks;
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_single_track() {
        let bytes = write(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
            vec![vec![
                note(0, 0, true, 60, 100),
                note(480, 0, false, 60, 0),
                end_of_track(),
            ]],
        );

        let (list, ppqn) = parse(&bytes).unwrap();
        assert_eq!(ppqn, 480);
        assert_eq!(list.len(), 3);

        let first = list.get(0).unwrap();
        assert_eq!(first.status, CMD_NOTE_ON);
        assert_eq!(first.data, [60, 100]);
        assert_eq!(list.get(1).unwrap().tick, 480);
        assert_eq!(list.end_tick(), 480);
    }

    #[test]
    fn test_parallel_tracks_merged() {
        let tempo_track = vec![
            ev(0, TrackEventKind::Meta(MetaMessage::Tempo(u24::new(400_000)))),
            end_of_track(),
        ];
        let melody = vec![
            note(0, 1, true, 64, 90),
            note(240, 1, false, 64, 0),
            end_of_track(),
        ];
        let bass = vec![
            note(120, 2, true, 40, 90),
            note(360, 2, false, 40, 0),
            end_of_track(),
        ];
        let bytes = write(
            Format::Parallel,
            Timing::Metrical(u15::new(96)),
            vec![tempo_track, melody, bass],
        );

        let (list, ppqn) = parse(&bytes).unwrap();
        assert_eq!(ppqn, 96);

        let ticks: Vec<u32> = list.iter().map(|e| e.tick).collect();
        let mut sorted = ticks.clone();
        sorted.sort();
        assert_eq!(ticks, sorted);
        assert_eq!(list.end_tick(), 480);

        let tempo = list.get(0).unwrap();
        assert!(tempo.is_meta());
        assert_eq!(tempo.data[0], META_TEMPO);
        assert_eq!(tempo.extra, vec![0x06, 0x1A, 0x80]);
    }

    #[test]
    fn test_tick_overflow_rejected() {
        // Each delta is the largest a track event can carry
        let max_delta: u32 = (1 << 28) - 1;
        let mut track: Vec<TrackEvent<'static>> = (0..17)
            .map(|i| note(max_delta, 0, i % 2 == 0, 60, 100))
            .collect();
        track.push(end_of_track());
        let bytes = write(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
            vec![track],
        );

        assert!(matches!(
            parse(&bytes),
            Err(MidiImportError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_sequential_tracks_offset() {
        let first = vec![note(0, 0, true, 60, 100), note(100, 0, false, 60, 0), end_of_track()];
        let second = vec![note(0, 0, true, 62, 100), note(50, 0, false, 62, 0), end_of_track()];
        let bytes = write(
            Format::Sequential,
            Timing::Metrical(u15::new(480)),
            vec![first, second],
        );

        let (list, _) = parse(&bytes).unwrap();
        let second_on = list
            .iter()
            .find(|e| e.command() == CMD_NOTE_ON && e.data[0] == 62)
            .unwrap();
        assert_eq!(second_on.tick, 100);
        assert_eq!(list.end_tick(), 150);
    }

    #[test]
    fn test_pitch_bend_bytes() {
        let bytes = write(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
            vec![vec![
                ev(
                    0,
                    TrackEventKind::Midi {
                        channel: u4::new(3),
                        message: MidiMessage::PitchBend {
                            bend: PitchBend(midly::num::u14::new(0x2000 + 0x81)),
                        },
                    },
                ),
                end_of_track(),
            ]],
        );

        let (list, _) = parse(&bytes).unwrap();
        let bend = list.get(0).unwrap();
        assert_eq!(bend.status, CMD_BENDER | 3);
        let raw = ((bend.data[1] as u16) << 7) | bend.data[0] as u16;
        assert_eq!(raw, 0x2081);
    }

    #[test]
    fn test_timecode_rejected() {
        let bytes = write(
            Format::SingleTrack,
            Timing::Timecode(midly::Fps::Fps25, 40),
            vec![vec![note(0, 0, true, 60, 100), end_of_track()]],
        );
        assert!(matches!(
            parse(&bytes),
            Err(MidiImportError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_empty_file_rejected() {
        let bytes = write(Format::SingleTrack, Timing::Metrical(u15::new(480)), vec![vec![]]);
        assert!(matches!(parse(&bytes), Err(MidiImportError::Empty)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            parse(b"not a midi file"),
            Err(MidiImportError::Parse(_))
        ));
    }
}

//! MIDI data structures for timed playback.
//!
//! This module provides the time-ordered event list consumed by the
//! playback engine and the Standard MIDI File parser that produces it.

mod event;
mod midi_import;

pub use event::{Cursor, EventList, TimedEvent, MAX_TICK};
pub use midi_import::{parse, parse_file, MidiImportError};

/// Number of MIDI channels.
pub const MIDI_CHANNELS: u8 = 16;

/// Channel voice message classes (high nibble of the status byte).
pub const CMD_NOTE_OFF: u8 = 0x80;
pub const CMD_NOTE_ON: u8 = 0x90;
pub const CMD_NOTE_PRESSURE: u8 = 0xA0;
pub const CMD_CONTROL: u8 = 0xB0;
pub const CMD_PGM_CHANGE: u8 = 0xC0;
pub const CMD_CHANNEL_PRESSURE: u8 = 0xD0;
pub const CMD_BENDER: u8 = 0xE0;

/// System exclusive start and end bytes.
pub const SYSEX: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// Status byte used for SMF meta events.
pub const META_EVENT: u8 = 0xFF;

/// Meta event types.
pub const META_TEXT: u8 = 0x01;
pub const META_TRACK_NAME: u8 = 0x03;
pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_TEMPO: u8 = 0x51;
pub const META_TIME_SIGNATURE: u8 = 0x58;
pub const META_KEY_SIGNATURE: u8 = 0x59;

/// Controller numbers used by the shutdown panic sequence.
pub const CTL_SUSTAIN: u8 = 64;
pub const CTL_ALL_SOUNDS_OFF: u8 = 120;
pub const CTL_RESET_CONTROLLERS: u8 = 121;
pub const CTL_ALL_NOTES_OFF: u8 = 123;

/// Default tempo in microseconds per quarter note (120 BPM).
pub const DEFAULT_TEMPO_US: u32 = 500_000;

/// Maximum value of a MIDI data byte.
pub const MAX_DATA: u8 = 0x7F;

/// Converts a tempo in microseconds per quarter note to beats per minute.
///
/// # Examples
///
/// ```
/// use midiplay::midi::tempo_to_bpm;
///
/// assert_eq!(tempo_to_bpm(500_000), 120.0);
/// ```
pub fn tempo_to_bpm(micros_per_quarter: u32) -> f64 {
    if micros_per_quarter == 0 {
        return 0.0;
    }
    60_000_000.0 / micros_per_quarter as f64
}

/// Builds the universal real-time master volume SysEx message.
///
/// # Arguments
///
/// * `volume` - Master volume (0-127), used as the coarse value
pub fn master_volume_sysex(volume: u8) -> [u8; 8] {
    [SYSEX, 0x7F, 0x7F, 0x04, 0x01, 0x00, volume & MAX_DATA, SYSEX_END]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tempo_to_bpm() {
        assert!((tempo_to_bpm(DEFAULT_TEMPO_US) - 120.0).abs() < 0.001);
        assert!((tempo_to_bpm(1_000_000) - 60.0).abs() < 0.001);
        assert_eq!(tempo_to_bpm(0), 0.0);
    }

    #[test]
    fn test_master_volume_sysex() {
        let msg = master_volume_sysex(100);
        assert_eq!(msg[0], SYSEX);
        assert_eq!(msg[6], 100);
        assert_eq!(msg[7], SYSEX_END);

        // Out-of-range volumes are masked to a data byte
        assert_eq!(master_volume_sysex(0xFF)[6], 0x7F);
    }
}

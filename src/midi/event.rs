//! Timed MIDI events and the time-ordered event list.

use super::{MidiImportError, CMD_CONTROL, META_EVENT};

/// Latest tick an event may sit on. The tick after the final event is
/// reserved for the end-of-piece marker.
pub const MAX_TICK: u32 = u32::MAX - 1;

/// A single MIDI event at an absolute tick position.
///
/// Events are immutable once created. The status byte carries the message
/// class and channel, `data` holds up to two data bytes and `extra` holds the
/// variable-length payload of meta and SysEx events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    /// Absolute time in ticks from the start of the piece.
    pub tick: u32,
    /// Status byte (message class in the high nibble, channel in the low one).
    pub status: u8,
    /// Data bytes. For meta events `data[0]` is the meta type.
    pub data: [u8; 2],
    /// Extra payload for meta and SysEx events.
    pub extra: Vec<u8>,
}

impl TimedEvent {
    /// Creates a channel event with two data bytes.
    pub fn new(tick: u32, status: u8, data0: u8, data1: u8) -> Self {
        Self {
            tick,
            status,
            data: [data0, data1],
            extra: Vec::new(),
        }
    }

    /// Creates a meta event with the given type and payload.
    pub fn meta(tick: u32, meta_type: u8, payload: Vec<u8>) -> Self {
        Self {
            tick,
            status: META_EVENT,
            data: [meta_type, 0],
            extra: payload,
        }
    }

    /// Creates a tempo meta event (microseconds per quarter note).
    pub fn tempo(tick: u32, micros_per_quarter: u32) -> Self {
        let bytes = micros_per_quarter.to_be_bytes();
        Self::meta(tick, super::META_TEMPO, bytes[1..].to_vec())
    }

    /// Creates a control change event.
    pub fn controller(tick: u32, channel: u8, param: u8, value: u8) -> Self {
        Self::new(tick, CMD_CONTROL | (channel & 0x0F), param, value)
    }

    /// Message class (status with the channel bits cleared).
    pub fn command(&self) -> u8 {
        self.status & 0xF0
    }

    /// Channel bits of the status byte.
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    pub fn is_meta(&self) -> bool {
        self.status == META_EVENT
    }
}

/// An owned, time-ordered sequence of timed events.
///
/// The list is never mutated after construction. The last event's tick is
/// the authoritative end-of-piece time.
#[derive(Debug, Clone)]
pub struct EventList {
    events: Vec<TimedEvent>,
}

impl EventList {
    /// Builds an event list from events in any order.
    ///
    /// Events are stable-sorted by tick, so events sharing a tick keep their
    /// relative order (merged tracks stay in track order).
    ///
    /// # Errors
    ///
    /// Returns `MidiImportError::Empty` if there are no events and
    /// `MidiImportError::UnsupportedFormat` if an event lies past `MAX_TICK`.
    pub fn from_events(mut events: Vec<TimedEvent>) -> Result<Self, MidiImportError> {
        if events.is_empty() {
            return Err(MidiImportError::Empty);
        }
        if let Some(late) = events.iter().find(|e| e.tick > MAX_TICK) {
            return Err(MidiImportError::UnsupportedFormat(format!(
                "event at tick {} is past the last playable tick",
                late.tick
            )));
        }
        events.sort_by_key(|e| e.tick);
        events.shrink_to_fit();
        Ok(Self { events })
    }

    /// Returns the tick of the final event.
    pub fn end_tick(&self) -> u32 {
        self.last_event().tick
    }

    /// Returns the final event of the piece.
    pub fn last_event(&self) -> &TimedEvent {
        // from_events guarantees at least one event
        &self.events[self.events.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TimedEvent> {
        self.events.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimedEvent> {
        self.events.iter()
    }
}

/// A non-owning read position into an `EventList`.
///
/// The cursor only stores an index; the list is passed in on every access so
/// the engine can keep the list behind an `Arc` while moving the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pos: usize,
    exhausted: bool,
}

impl Cursor {
    /// Creates a cursor at the head of the list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the event under the cursor, or None once the list is exhausted.
    pub fn current<'a>(&self, list: &'a EventList) -> Option<&'a TimedEvent> {
        if self.exhausted {
            None
        } else {
            list.get(self.pos)
        }
    }

    /// Moves to the next event.
    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Moves back to the head of the list.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.exhausted = false;
    }

    /// Drops the remaining events without moving the position.
    pub fn exhaust(&mut self) {
        self.exhausted = true;
    }

    pub fn is_exhausted(&self, list: &EventList) -> bool {
        self.current(list).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{CMD_NOTE_OFF, CMD_NOTE_ON, META_TEMPO};

    fn two_notes() -> EventList {
        EventList::from_events(vec![
            TimedEvent::new(480, CMD_NOTE_OFF, 60, 0),
            TimedEvent::new(0, CMD_NOTE_ON, 60, 100),
        ])
        .unwrap()
    }

    #[test]
    fn test_events_sorted_by_tick() {
        let list = two_notes();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().tick, 0);
        assert_eq!(list.get(1).unwrap().tick, 480);
        assert_eq!(list.end_tick(), 480);
    }

    #[test]
    fn test_equal_ticks_keep_order() {
        let list = EventList::from_events(vec![
            TimedEvent::new(10, CMD_NOTE_ON, 60, 100),
            TimedEvent::new(0, CMD_NOTE_ON | 1, 62, 100),
            TimedEvent::new(10, CMD_NOTE_ON | 2, 64, 100),
        ])
        .unwrap();

        let channels: Vec<u8> = list.iter().map(|e| e.channel()).collect();
        assert_eq!(channels, vec![1, 0, 2]);
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(matches!(
            EventList::from_events(Vec::new()),
            Err(MidiImportError::Empty)
        ));
    }

    #[test]
    fn test_last_tick_reserved_for_end_marker() {
        let at_limit = EventList::from_events(vec![
            TimedEvent::new(0, CMD_NOTE_ON, 60, 100),
            TimedEvent::new(MAX_TICK, CMD_NOTE_OFF, 60, 0),
        ])
        .unwrap();
        assert_eq!(at_limit.end_tick(), MAX_TICK);

        let past_limit = EventList::from_events(vec![
            TimedEvent::new(0, CMD_NOTE_ON, 60, 100),
            TimedEvent::new(u32::MAX, CMD_NOTE_OFF, 60, 0),
        ]);
        assert!(matches!(
            past_limit,
            Err(MidiImportError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_cursor_traversal() {
        let list = two_notes();
        let mut cursor = Cursor::new();

        assert_eq!(cursor.current(&list).unwrap().command(), CMD_NOTE_ON);
        cursor.advance();
        assert_eq!(cursor.current(&list).unwrap().command(), CMD_NOTE_OFF);
        cursor.advance();
        assert!(cursor.is_exhausted(&list));

        cursor.rewind();
        assert_eq!(cursor.current(&list).unwrap().tick, 0);

        cursor.exhaust();
        assert!(cursor.is_exhausted(&list));
        cursor.rewind();
        assert!(!cursor.is_exhausted(&list));
    }

    #[test]
    fn test_tempo_event_payload() {
        let ev = TimedEvent::tempo(0, 500_000);
        assert!(ev.is_meta());
        assert_eq!(ev.data[0], META_TEMPO);
        assert_eq!(ev.extra, vec![0x07, 0xA1, 0x20]);
    }
}

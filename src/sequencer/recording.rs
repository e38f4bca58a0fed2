//! Headless sequencer that records what it is given.
//!
//! `RecordingSequencer` stands in for a sequencing service when no device is
//! available. Every event is recorded with its scheduled tick at the moment
//! it leaves the output buffer, so callers can assert on exactly what a
//! synthesizer would have received. Queue time is virtual: an echo fires as
//! soon as the output is drained while its queue is running.

use super::{
    Address, Drain, Output, PollDescriptors, PortInfo, QueueId, Schedule, SeqEvent,
    SeqEventKind, Sequencer, SequencerError, Tick,
};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Client id the recording sequencer reports for itself.
pub const RECORDING_CLIENT: u8 = 128;

/// Default number of events the output buffer holds.
const DEFAULT_CAPACITY: usize = 64;

/// Something the recording sequencer observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Connect(Address),
    AllocQueue(QueueId),
    QueueTempo { micros_per_quarter: u32, ppqn: u16 },
    StartQueue,
    StopQueue,
    ContinueQueue,
    FreeQueue,
    /// A scheduled event left the output buffer.
    Queued {
        tick: Tick,
        kind: SeqEventKind,
        dest: Address,
    },
    /// An event was delivered immediately.
    Direct { kind: SeqEventKind, dest: Address },
    /// Buffered events were discarded.
    DropOutput { dropped: usize },
}

#[derive(Debug)]
struct Inner {
    records: Vec<Record>,
    ports: Vec<PortInfo>,
    refused: HashSet<Address>,
    buffer: Vec<SeqEvent>,
    capacity: usize,
    writable: bool,
    nonblocking: bool,
    queue: Option<QueueId>,
    running: bool,
    next_queue: u8,
    pending_echoes: Vec<SeqEvent>,
    input: VecDeque<SeqEvent>,
    queues_refused: bool,
    closed: bool,
}

impl Inner {
    fn record(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Moves buffered events to the record. Echoes wait for a drain.
    fn flush(&mut self) {
        for event in std::mem::take(&mut self.buffer) {
            let tick = match event.schedule {
                Schedule::Tick { tick, .. } => tick,
                Schedule::Direct => 0,
            };
            if event.kind == SeqEventKind::Echo {
                self.pending_echoes.push(event.clone());
            }
            self.records.push(Record::Queued {
                tick,
                kind: event.kind,
                dest: event.dest,
            });
        }
    }
}

/// Test-side handle onto a `RecordingSequencer`.
#[derive(Debug, Clone)]
pub struct RecordingLog {
    inner: Arc<Mutex<Inner>>,
    output_bell: Sender<()>,
}

/// A sequencer double that records every event it delivers.
#[derive(Debug)]
pub struct RecordingSequencer {
    inner: Arc<Mutex<Inner>>,
    input_bell: (Sender<()>, Receiver<()>),
    output_bell: (Sender<()>, Receiver<()>),
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panicking test thread must not hide the records from the others
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn ring(bell: &Sender<()>) {
    let _ = bell.try_send(());
}

impl RecordingSequencer {
    /// Creates a recording sequencer with an empty port catalog.
    pub fn new() -> (Self, RecordingLog) {
        Self::with_ports(Vec::new())
    }

    /// Creates a recording sequencer advertising the given ports.
    pub fn with_ports(ports: Vec<PortInfo>) -> (Self, RecordingLog) {
        let inner = Arc::new(Mutex::new(Inner {
            records: Vec::new(),
            ports,
            refused: HashSet::new(),
            buffer: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            writable: true,
            nonblocking: false,
            queue: None,
            running: false,
            next_queue: 0,
            pending_echoes: Vec::new(),
            input: VecDeque::new(),
            queues_refused: false,
            closed: false,
        }));
        let output_bell = crossbeam_channel::bounded(1);
        let seq = Self {
            inner: Arc::clone(&inner),
            input_bell: crossbeam_channel::bounded(1),
            output_bell: output_bell.clone(),
        };
        let log = RecordingLog {
            inner,
            output_bell: output_bell.0,
        };
        (seq, log)
    }

    fn check_queue(inner: &Inner, queue: QueueId) -> Result<(), SequencerError> {
        if inner.queue == Some(queue) {
            Ok(())
        } else {
            Err(SequencerError::NoSuchQueue(queue))
        }
    }
}

impl Sequencer for RecordingSequencer {
    fn source(&self) -> Address {
        Address::new(RECORDING_CLIENT, 0)
    }

    fn ports(&self) -> Vec<PortInfo> {
        lock(&self.inner).ports.clone()
    }

    fn connect_to(&mut self, dest: Address) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        let known = inner.ports.iter().any(|p| p.addr == dest);
        if !known || inner.refused.contains(&dest) {
            return Err(SequencerError::Connect(dest, "refused".to_string()));
        }
        inner.record(Record::Connect(dest));
        Ok(())
    }

    fn alloc_queue(&mut self) -> Result<QueueId, SequencerError> {
        let mut inner = lock(&self.inner);
        if inner.queues_refused {
            return Err(SequencerError::Open("no free queue".to_string()));
        }
        let queue = QueueId(inner.next_queue);
        inner.next_queue = inner.next_queue.wrapping_add(1);
        inner.queue = Some(queue);
        inner.running = false;
        inner.record(Record::AllocQueue(queue));
        Ok(queue)
    }

    fn set_queue_tempo(
        &mut self,
        queue: QueueId,
        micros_per_quarter: u32,
        ppqn: u16,
    ) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        Self::check_queue(&inner, queue)?;
        inner.record(Record::QueueTempo {
            micros_per_quarter,
            ppqn,
        });
        Ok(())
    }

    fn start_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        Self::check_queue(&inner, queue)?;
        inner.running = true;
        inner.record(Record::StartQueue);
        Ok(())
    }

    fn stop_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        Self::check_queue(&inner, queue)?;
        inner.running = false;
        inner.record(Record::StopQueue);
        Ok(())
    }

    fn continue_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        Self::check_queue(&inner, queue)?;
        inner.running = true;
        inner.record(Record::ContinueQueue);
        Ok(())
    }

    fn free_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        let mut inner = lock(&self.inner);
        Self::check_queue(&inner, queue)?;
        inner.queue = None;
        inner.running = false;
        inner.pending_echoes.clear();
        inner.record(Record::FreeQueue);
        Ok(())
    }

    fn event_output(&mut self, event: &SeqEvent) -> Result<Output, SequencerError> {
        let mut inner = lock(&self.inner);
        if inner.buffer.len() >= inner.capacity {
            // The service consumes the buffer; the caller has to retry
            inner.flush();
            if inner.nonblocking {
                ring(&self.output_bell.0);
                return Ok(Output::Busy);
            }
        }
        inner.buffer.push(event.clone());
        Ok(Output::Queued)
    }

    fn event_output_direct(&mut self, event: &SeqEvent) -> Result<(), SequencerError> {
        lock(&self.inner).record(Record::Direct {
            kind: event.kind.clone(),
            dest: event.dest,
        });
        Ok(())
    }

    fn drain_output(&mut self) -> Result<Drain, SequencerError> {
        let mut inner = lock(&self.inner);
        inner.flush();
        if inner.running && !inner.pending_echoes.is_empty() {
            let source = self.source();
            let echoes = std::mem::take(&mut inner.pending_echoes);
            for echo in echoes.into_iter().filter(|e| e.dest == source) {
                inner.input.push_back(echo);
            }
            ring(&self.input_bell.0);
        }
        Ok(Drain::Done)
    }

    fn drop_output(&mut self) {
        let mut inner = lock(&self.inner);
        let dropped = inner.buffer.len();
        inner.buffer.clear();
        inner.record(Record::DropOutput { dropped });
    }

    fn set_nonblocking(&mut self, nonblocking: bool) {
        lock(&self.inner).nonblocking = nonblocking;
    }

    fn poll_descriptors(&self) -> PollDescriptors {
        PollDescriptors {
            input: self.input_bell.1.clone(),
            output: self.output_bell.1.clone(),
        }
    }

    fn output_ready(&self) -> bool {
        lock(&self.inner).writable
    }

    fn input_pending(&self) -> bool {
        !lock(&self.inner).input.is_empty()
    }

    fn event_input(&mut self) -> Option<SeqEvent> {
        lock(&self.inner).input.pop_front()
    }
}

impl Drop for RecordingSequencer {
    fn drop(&mut self) {
        lock(&self.inner).closed = true;
    }
}

impl RecordingLog {
    /// True once the sequencer itself has been dropped.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Everything recorded so far.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.inner).records.clone()
    }

    /// Scheduled events in delivery order, as (tick, kind).
    pub fn queued(&self) -> Vec<(Tick, SeqEventKind)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Queued { tick, kind, .. } => Some((tick, kind)),
                _ => None,
            })
            .collect()
    }

    /// Immediately delivered events in order.
    pub fn direct(&self) -> Vec<SeqEventKind> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Direct { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }

    /// Ports that were connected, in order.
    pub fn connections(&self) -> Vec<Address> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Connect(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    /// Makes `connect_to` fail for an address.
    pub fn refuse_connection(&self, addr: Address) {
        lock(&self.inner).refused.insert(addr);
    }

    /// Sets how many events fit in the output buffer before `Busy`.
    pub fn set_output_capacity(&self, capacity: usize) {
        lock(&self.inner).capacity = capacity.max(1);
    }

    /// Makes every later `alloc_queue` fail.
    pub fn refuse_queues(&self) {
        lock(&self.inner).queues_refused = true;
    }

    /// Gates output readiness, as a device that stopped accepting data would.
    pub fn set_writable(&self, writable: bool) {
        lock(&self.inner).writable = writable;
        if writable {
            ring(&self.output_bell);
        }
    }

    /// Number of records matching a predicate.
    pub fn count(&self, predicate: impl Fn(&Record) -> bool) -> usize {
        lock(&self.inner).records.iter().filter(|r| predicate(r)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_at(seq: &RecordingSequencer, queue: QueueId, tick: Tick) -> SeqEvent {
        SeqEvent::new(
            SeqEventKind::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100,
            },
            seq.source(),
            Address::SUBSCRIBERS,
        )
        .at(queue, tick)
    }

    #[test]
    fn test_records_on_drain() {
        let (mut seq, log) = RecordingSequencer::new();
        let queue = seq.alloc_queue().unwrap();
        seq.start_queue(queue).unwrap();

        let ev = note_at(&seq, queue, 96);
        assert_eq!(seq.event_output(&ev).unwrap(), Output::Queued);
        assert!(log.queued().is_empty());

        assert_eq!(seq.drain_output().unwrap(), Drain::Done);
        assert_eq!(log.queued().len(), 1);
        assert_eq!(log.queued()[0].0, 96);
    }

    #[test]
    fn test_busy_when_full() {
        let (mut seq, log) = RecordingSequencer::new();
        log.set_output_capacity(1);
        seq.set_nonblocking(true);
        let queue = seq.alloc_queue().unwrap();

        let ev = note_at(&seq, queue, 0);
        assert_eq!(seq.event_output(&ev).unwrap(), Output::Queued);
        assert_eq!(seq.event_output(&ev).unwrap(), Output::Busy);

        // The busy attempt let the service consume the buffer
        assert_eq!(seq.event_output(&ev).unwrap(), Output::Queued);
        assert_eq!(log.queued().len(), 1);
    }

    #[test]
    fn test_echo_waits_for_running_queue() {
        let (mut seq, _log) = RecordingSequencer::new();
        let queue = seq.alloc_queue().unwrap();
        seq.start_queue(queue).unwrap();
        seq.stop_queue(queue).unwrap();

        seq.enqueue_echo(queue, 10).unwrap();
        seq.drain_output().unwrap();
        assert!(!seq.input_pending());

        seq.continue_queue(queue).unwrap();
        seq.drain_output().unwrap();
        assert!(seq.input_pending());

        let echo = seq.event_input().unwrap();
        assert_eq!(echo.kind, SeqEventKind::Echo);
        assert_eq!(echo.source, seq.source());
        assert!(seq.event_input().is_none());
    }

    #[test]
    fn test_drop_output_discards_buffer() {
        let (mut seq, log) = RecordingSequencer::new();
        let queue = seq.alloc_queue().unwrap();
        let ev = note_at(&seq, queue, 0);
        seq.event_output(&ev).unwrap();
        seq.drop_output();
        seq.drain_output().unwrap();

        assert!(log.queued().is_empty());
        assert!(log.records().contains(&Record::DropOutput { dropped: 1 }));
    }

    #[test]
    fn test_unknown_queue() {
        let (mut seq, _log) = RecordingSequencer::new();
        assert!(matches!(
            seq.start_queue(QueueId(9)),
            Err(SequencerError::NoSuchQueue(QueueId(9)))
        ));
    }
}

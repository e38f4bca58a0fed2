//! Software sequencing service.
//!
//! `SoftSequencer` plays the role of a kernel sequencer: it hosts a client
//! with one duplex port, a catalog of sink ports and tick-clocked queues.
//! Queued events move from a client-side output buffer into a bounded
//! kernel pool, from which a clock thread dispatches them when their tick
//! comes due.

use super::sink::{MidiSink, SinkInfo};
use super::{
    Address, Capability, Drain, Output, PollDescriptors, PortInfo, PortType, QueueId, Schedule,
    SeqEvent, SeqEventKind, Sequencer, SequencerError, Tick,
};
use crate::midi::DEFAULT_TEMPO_US;
use crossbeam_channel::{Receiver, Sender};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Client id of the sequencer's own port.
pub const SOFT_CLIENT: u8 = 128;

/// Client id of the first registered sink.
pub const FIRST_SINK_CLIENT: u8 = 16;

/// Events the client-side output buffer holds before it must be flushed.
pub const OUTPUT_BUFFER_EVENTS: usize = 64;

/// Scheduled events the kernel pool holds across all queues.
pub const POOL_EVENTS: usize = 512;

const DEFAULT_PPQN: u16 = 96;

/// An event waiting in the kernel pool, ordered by (tick, arrival).
#[derive(Debug)]
struct Pending {
    tick: Tick,
    arrival: u64,
    event: SeqEvent,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.tick, self.arrival).cmp(&(other.tick, other.arrival))
    }
}

/// Clock and pending events of one queue.
#[derive(Debug)]
struct Queue {
    running: bool,
    tempo_us: u32,
    ppqn: u16,
    /// Tick position at `base_time`.
    base_tick: f64,
    base_time: Instant,
    pending: BinaryHeap<Reverse<Pending>>,
}

impl Queue {
    fn new() -> Self {
        Self {
            running: false,
            tempo_us: DEFAULT_TEMPO_US,
            ppqn: DEFAULT_PPQN,
            base_tick: 0.0,
            base_time: Instant::now(),
            pending: BinaryHeap::new(),
        }
    }

    fn tick_at(&self, now: Instant) -> f64 {
        if !self.running {
            return self.base_tick;
        }
        let elapsed_us = now.saturating_duration_since(self.base_time).as_secs_f64() * 1e6;
        self.base_tick + elapsed_us * self.ppqn as f64 / self.tempo_us as f64
    }

    /// Moves the time base to `now` without changing the position.
    fn rebase(&mut self, now: Instant) {
        self.base_tick = self.tick_at(now);
        self.base_time = now;
    }

    fn next_due(&self, now: Instant) -> Option<Duration> {
        if !self.running {
            return None;
        }
        let Reverse(next) = self.pending.peek()?;
        let ticks = (next.tick as f64 - self.tick_at(now)).max(0.0);
        let micros = ticks * self.tempo_us as f64 / self.ppqn as f64;
        Some(Duration::from_secs_f64(micros / 1e6))
    }
}

/// A port in the catalog; sinks receive what is routed to them.
struct Port {
    info: PortInfo,
    sink: Option<Box<dyn MidiSink>>,
}

/// State shared with the clock thread.
struct Kernel {
    own: PortInfo,
    ports: Vec<Port>,
    subscribers: Vec<Address>,
    queues: HashMap<QueueId, Queue>,
    next_queue: u8,
    pool_used: usize,
    arrival: u64,
    input: VecDeque<SeqEvent>,
    shutdown: bool,
}

impl Kernel {
    fn pool_room(&self) -> usize {
        POOL_EVENTS.saturating_sub(self.pool_used)
    }

    fn queue_mut(&mut self, queue: QueueId) -> Result<&mut Queue, SequencerError> {
        self.queues
            .get_mut(&queue)
            .ok_or(SequencerError::NoSuchQueue(queue))
    }

    fn enqueue(&mut self, event: SeqEvent) -> Result<(), SequencerError> {
        let Schedule::Tick { queue, tick } = event.schedule else {
            self.deliver(&event, Instant::now());
            return Ok(());
        };
        self.arrival += 1;
        let arrival = self.arrival;
        self.queue_mut(queue)?.pending.push(Reverse(Pending {
            tick,
            arrival,
            event,
        }));
        self.pool_used += 1;
        Ok(())
    }

    /// Pops the earliest event that is due on any running queue.
    fn pop_due(&mut self, now: Instant) -> Option<SeqEvent> {
        let queue = self
            .queues
            .iter()
            .filter(|(_, q)| q.running)
            .filter_map(|(id, q)| {
                let Reverse(next) = q.pending.peek()?;
                (next.tick as f64 <= q.tick_at(now)).then_some((next.tick, next.arrival, *id))
            })
            .min_by_key(|(tick, arrival, _)| (*tick, *arrival))
            .map(|(_, _, id)| id)?;

        let Reverse(due) = self.queues.get_mut(&queue)?.pending.pop()?;
        self.pool_used = self.pool_used.saturating_sub(1);
        Some(due.event)
    }

    fn deliver(&mut self, event: &SeqEvent, now: Instant) {
        match event.kind {
            SeqEventKind::Tempo {
                queue,
                micros_per_quarter,
            } => {
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.rebase(now);
                    q.tempo_us = micros_per_quarter.max(1);
                    tracing::trace!("Queue {:?} tempo {}", queue, micros_per_quarter);
                }
            }
            SeqEventKind::QueuePosition { queue, tick } => {
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.base_tick = tick as f64;
                    q.base_time = now;
                }
            }
            SeqEventKind::Echo => {
                // Only our own client has an input side
                if event.dest.client == self.own.addr.client {
                    self.input.push_back(event.clone());
                }
            }
            ref kind => {
                if let Some(bytes) = kind.to_midi_bytes() {
                    self.route(event.dest, &bytes);
                }
            }
        }
    }

    fn route(&mut self, dest: Address, bytes: &[u8]) {
        let targets: Vec<Address> = if dest == Address::SUBSCRIBERS {
            self.subscribers.clone()
        } else {
            vec![dest]
        };
        for addr in targets {
            let Some(sink) = self
                .ports
                .iter_mut()
                .find(|p| p.info.addr == addr)
                .and_then(|p| p.sink.as_mut())
            else {
                continue;
            };
            if let Err(e) = sink.send(bytes) {
                tracing::warn!("{}", e);
            }
        }
    }
}

struct Shared {
    kernel: Mutex<Kernel>,
    /// Signalled when the clock must re-plan or the pool gains room.
    changed: Condvar,
    input_bell: Sender<()>,
    output_bell: Sender<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ring(bell: &Sender<()>) {
    let _ = bell.try_send(());
}

/// A software sequencer client driving `MidiSink`s from a clock thread.
pub struct SoftSequencer {
    shared: Arc<Shared>,
    buffer: VecDeque<SeqEvent>,
    nonblocking: bool,
    input_rx: Receiver<()>,
    output_rx: Receiver<()>,
    clock: Option<JoinHandle<()>>,
}

impl SoftSequencer {
    /// Opens a client named `app_name` and registers the sinks as ports.
    ///
    /// # Errors
    ///
    /// `SequencerError::PortCreate` if the name is empty or there are too
    /// many sinks, `SequencerError::Open` if the clock cannot be started.
    pub fn open(app_name: &str, sinks: Vec<Box<dyn MidiSink>>) -> Result<Self, SequencerError> {
        if app_name.trim().is_empty() {
            return Err(SequencerError::PortCreate("empty port name".to_string()));
        }

        let mut ports = vec![Port {
            info: PortInfo {
                addr: Address::SYSTEM_TIMER,
                client_name: "System".to_string(),
                name: "Timer".to_string(),
                capability: Capability::READ | Capability::WRITE | Capability::NO_EXPORT,
                port_type: PortType::empty(),
            },
            sink: None,
        }];
        for (i, sink) in sinks.into_iter().enumerate() {
            let client = u8::try_from(i)
                .ok()
                .and_then(|i| FIRST_SINK_CLIENT.checked_add(i))
                .filter(|c| *c < SOFT_CLIENT)
                .ok_or_else(|| SequencerError::PortCreate("too many sink ports".to_string()))?;
            let SinkInfo {
                client_name,
                port_name,
                port_type,
            } = sink.port_info();
            ports.push(Port {
                info: PortInfo {
                    addr: Address::new(client, 0),
                    client_name,
                    name: port_name,
                    capability: Capability::WRITE | Capability::SUBS_WRITE,
                    port_type,
                },
                sink: Some(sink),
            });
        }

        let own = PortInfo {
            addr: Address::new(SOFT_CLIENT, 0),
            client_name: app_name.to_string(),
            name: app_name.to_string(),
            capability: Capability::READ
                | Capability::WRITE
                | Capability::SUBS_READ
                | Capability::SUBS_WRITE
                | Capability::DUPLEX,
            port_type: PortType::MIDI_GENERIC | PortType::SOFTWARE | PortType::APPLICATION,
        };

        let (input_tx, input_rx) = crossbeam_channel::bounded(1);
        let (output_tx, output_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(Shared {
            kernel: Mutex::new(Kernel {
                own,
                ports,
                subscribers: Vec::new(),
                queues: HashMap::new(),
                next_queue: 0,
                pool_used: 0,
                arrival: 0,
                input: VecDeque::new(),
                shutdown: false,
            }),
            changed: Condvar::new(),
            input_bell: input_tx,
            output_bell: output_tx,
        });

        let clock_shared = Arc::clone(&shared);
        let clock = thread::Builder::new()
            .name("midiplay-clock".to_string())
            .spawn(move || run_clock(&clock_shared))
            .map_err(|e| SequencerError::Open(e.to_string()))?;

        tracing::debug!("Sequencer client {} opened as {:?}", SOFT_CLIENT, app_name);
        Ok(Self {
            shared,
            buffer: VecDeque::with_capacity(OUTPUT_BUFFER_EVENTS),
            nonblocking: false,
            input_rx,
            output_rx,
            clock: Some(clock),
        })
    }

    /// Moves buffered events into the kernel pool while it has room.
    fn flush(&mut self) -> Result<(), SequencerError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut kernel = self.shared.lock();
        while kernel.pool_room() > 0 {
            let Some(event) = self.buffer.pop_front() else {
                break;
            };
            kernel.enqueue(event)?;
        }
        drop(kernel);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Flushes everything, waiting for pool room as needed.
    fn flush_blocking(&mut self) -> Result<(), SequencerError> {
        loop {
            self.flush()?;
            if self.buffer.is_empty() {
                return Ok(());
            }
            let kernel = self.shared.lock();
            if kernel.shutdown {
                return Err(SequencerError::Closed);
            }
            if kernel.pool_room() == 0 {
                let (_kernel, _) = self
                    .shared
                    .changed
                    .wait_timeout(kernel, Duration::from_millis(10))
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    fn with_queue(
        &mut self,
        queue: QueueId,
        f: impl FnOnce(&mut Queue, Instant),
    ) -> Result<(), SequencerError> {
        let mut kernel = self.shared.lock();
        f(kernel.queue_mut(queue)?, Instant::now());
        drop(kernel);
        self.shared.changed.notify_all();
        Ok(())
    }
}

/// Dispatches due events until the sequencer is closed.
fn run_clock(shared: &Shared) {
    let mut kernel = shared.lock();
    loop {
        if kernel.shutdown {
            return;
        }

        let mut freed = false;
        let mut echoed = false;
        let now = Instant::now();
        while let Some(event) = kernel.pop_due(now) {
            freed = true;
            echoed |= event.kind == SeqEventKind::Echo;
            kernel.deliver(&event, now);
        }
        if freed {
            ring(&shared.output_bell);
            shared.changed.notify_all();
        }
        if echoed && !kernel.input.is_empty() {
            ring(&shared.input_bell);
        }

        let next = kernel
            .queues
            .values()
            .filter_map(|q| q.next_due(now))
            .min();
        kernel = match next {
            Some(timeout) => {
                shared
                    .changed
                    .wait_timeout(kernel, timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0
            }
            None => shared
                .changed
                .wait(kernel)
                .unwrap_or_else(|e| e.into_inner()),
        };
    }
}

impl Sequencer for SoftSequencer {
    fn source(&self) -> Address {
        Address::new(SOFT_CLIENT, 0)
    }

    fn ports(&self) -> Vec<PortInfo> {
        let kernel = self.shared.lock();
        let mut ports: Vec<PortInfo> = kernel.ports.iter().map(|p| p.info.clone()).collect();
        ports.push(kernel.own.clone());
        ports.sort_by_key(|p| p.addr);
        ports
    }

    fn connect_to(&mut self, dest: Address) -> Result<(), SequencerError> {
        let mut kernel = self.shared.lock();
        let Some(port) = kernel.ports.iter_mut().find(|p| p.info.addr == dest) else {
            return Err(SequencerError::Connect(dest, "no such port".to_string()));
        };
        if !port
            .info
            .capability
            .contains(Capability::WRITE | Capability::SUBS_WRITE)
        {
            return Err(SequencerError::Connect(
                dest,
                "port does not accept subscriptions".to_string(),
            ));
        }
        if let Some(sink) = port.sink.as_mut() {
            sink.subscribe()
                .map_err(|e| SequencerError::Connect(dest, e.to_string()))?;
        }
        if !kernel.subscribers.contains(&dest) {
            kernel.subscribers.push(dest);
        }
        Ok(())
    }

    fn alloc_queue(&mut self) -> Result<QueueId, SequencerError> {
        let mut kernel = self.shared.lock();
        let start = kernel.next_queue;
        let mut id = start;
        while kernel.queues.contains_key(&QueueId(id)) {
            id = id.wrapping_add(1);
            if id == start {
                return Err(SequencerError::Open("no free queue".to_string()));
            }
        }
        kernel.next_queue = id.wrapping_add(1);
        kernel.queues.insert(QueueId(id), Queue::new());
        Ok(QueueId(id))
    }

    fn set_queue_tempo(
        &mut self,
        queue: QueueId,
        micros_per_quarter: u32,
        ppqn: u16,
    ) -> Result<(), SequencerError> {
        self.with_queue(queue, |q, now| {
            q.rebase(now);
            q.tempo_us = micros_per_quarter.max(1);
            q.ppqn = ppqn.max(1);
        })
    }

    fn start_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        self.with_queue(queue, |q, now| {
            q.base_tick = 0.0;
            q.base_time = now;
            q.running = true;
        })
    }

    fn stop_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        self.with_queue(queue, |q, now| {
            q.rebase(now);
            q.running = false;
        })
    }

    fn continue_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        self.with_queue(queue, |q, now| {
            if !q.running {
                q.base_time = now;
                q.running = true;
            }
        })
    }

    fn free_queue(&mut self, queue: QueueId) -> Result<(), SequencerError> {
        let mut kernel = self.shared.lock();
        let removed = kernel
            .queues
            .remove(&queue)
            .ok_or(SequencerError::NoSuchQueue(queue))?;
        kernel.pool_used = kernel.pool_used.saturating_sub(removed.pending.len());
        drop(kernel);
        self.buffer
            .retain(|ev| !matches!(ev.schedule, Schedule::Tick { queue: q, .. } if q == queue));
        ring(&self.shared.output_bell);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn event_output(&mut self, event: &SeqEvent) -> Result<Output, SequencerError> {
        if let Schedule::Tick { queue, .. } = event.schedule {
            if !self.shared.lock().queues.contains_key(&queue) {
                return Err(SequencerError::NoSuchQueue(queue));
            }
        }
        if self.buffer.len() >= OUTPUT_BUFFER_EVENTS {
            self.flush()?;
            if self.buffer.len() >= OUTPUT_BUFFER_EVENTS {
                if self.nonblocking {
                    return Ok(Output::Busy);
                }
                self.flush_blocking()?;
            }
        }
        self.buffer.push_back(event.clone());
        Ok(Output::Queued)
    }

    fn event_output_direct(&mut self, event: &SeqEvent) -> Result<(), SequencerError> {
        let mut direct = event.clone();
        direct.schedule = Schedule::Direct;
        self.shared.lock().deliver(&direct, Instant::now());
        if direct.kind == SeqEventKind::Echo {
            ring(&self.shared.input_bell);
        }
        Ok(())
    }

    fn drain_output(&mut self) -> Result<Drain, SequencerError> {
        if self.nonblocking {
            self.flush()?;
        } else {
            self.flush_blocking()?;
        }
        if self.buffer.is_empty() {
            Ok(Drain::Done)
        } else {
            Ok(Drain::Pending)
        }
    }

    fn drop_output(&mut self) {
        let dropped = self.buffer.len();
        self.buffer.clear();
        let mut kernel = self.shared.lock();
        let pooled = kernel.pool_used;
        for queue in kernel.queues.values_mut() {
            queue.pending.clear();
        }
        kernel.pool_used = 0;
        drop(kernel);
        tracing::debug!("Dropped {} buffered and {} pooled events", dropped, pooled);
        ring(&self.shared.output_bell);
    }

    fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    fn poll_descriptors(&self) -> PollDescriptors {
        PollDescriptors {
            input: self.input_rx.clone(),
            output: self.output_rx.clone(),
        }
    }

    fn output_ready(&self) -> bool {
        // Room in the kernel pool, not the client buffer
        self.shared.lock().pool_room() > 0
    }

    fn input_pending(&self) -> bool {
        !self.shared.lock().input.is_empty()
    }

    fn event_input(&mut self) -> Option<SeqEvent> {
        self.shared.lock().input.pop_front()
    }
}

impl Drop for SoftSequencer {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.changed.notify_all();
        if let Some(clock) = self.clock.take() {
            let _ = clock.join();
        }
        tracing::debug!("Sequencer client {} closed", SOFT_CLIENT);
    }
}

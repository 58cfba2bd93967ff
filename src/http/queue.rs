//! Flow-controlled packet queues.
//!
//! Every stage of a request pipeline owns one [`Queue`] per direction. The
//! queues of one request live in a [`Pipeline`] arena and refer to each other
//! by [`QueueId`]; the arena is cleared as a unit when the request completes.
//!
//! Backpressure works in two halves. [`Pipeline::will_next_queue_accept`]
//! refuses a packet when the downstream queue is at its `max`, disabling the
//! producer and marking the downstream queue full. [`Pipeline::get`] releases
//! the pressure once a full queue drains to its `low` mark by re-enabling the
//! nearest disabled upstream queue.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::http::packet::{Packet, PacketKind};
use crate::http::stage::Stage;

/// Index of a queue inside its [`Pipeline`].
pub type QueueId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Response data flowing from the handler to the connector.
    Send,
    /// Request body flowing from the connection to the handler.
    Receive,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Send => 0,
            Direction::Receive => 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    /// The stage's `open` callback has run for this queue.
    pub open: bool,
    /// Not eligible for scheduling until re-enabled.
    pub disabled: bool,
    /// A producer was refused; re-enable it when this queue drains.
    pub full: bool,
    /// Serviced at least once.
    pub serviced: bool,
    /// On the pipeline's ready list.
    pub scheduled: bool,
    /// The service routine is running.
    pub servicing: bool,
}

/// Flow-control thresholds for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max: usize,
    pub low: usize,
    pub packet_size: usize,
}

impl QueueLimits {
    /// `low` is derived as five percent of `max`.
    pub fn new(max: usize, packet_size: usize) -> Self {
        Self {
            max,
            low: max / 100 * 5,
            packet_size,
        }
    }
}

pub struct Queue {
    pub stage: Arc<dyn Stage>,
    pub direction: Direction,
    pub max: usize,
    pub low: usize,
    pub packet_size: usize,
    pub next: Option<QueueId>,
    pub prev: Option<QueueId>,
    pub pair: Option<QueueId>,
    pub flags: QueueFlags,
    packets: VecDeque<Packet>,
    count: usize,
}

impl Queue {
    fn new(stage: Arc<dyn Stage>, direction: Direction, limits: QueueLimits) -> Self {
        Self {
            stage,
            direction,
            max: limits.max,
            low: limits.low,
            packet_size: limits.packet_size,
            next: None,
            prev: None,
            pair: None,
            flags: QueueFlags::default(),
            packets: VecDeque::new(),
            count: 0,
        }
    }

    /// Sum of the counts of all queued packets.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn packets(&self) -> &VecDeque<Packet> {
        &self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// True when the last queued packet is the end-of-stream marker.
    pub fn has_end(&self) -> bool {
        self.packets
            .back()
            .is_some_and(|p| p.kind == PacketKind::End)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("stage", &self.stage.name())
            .field("direction", &self.direction)
            .field("count", &self.count)
            .field("packets", &self.packets.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// The queues of one request, plus the ready list of queues awaiting service.
#[derive(Debug, Default)]
pub struct Pipeline {
    queues: Vec<Queue>,
    heads: [Option<QueueId>; 2],
    tails: [Option<QueueId>; 2],
    schedule: VecDeque<QueueId>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a queue for `stage` to the end of the `direction` chain.
    pub fn append(
        &mut self,
        stage: Arc<dyn Stage>,
        direction: Direction,
        limits: QueueLimits,
    ) -> QueueId {
        let id = self.queues.len();
        let mut queue = Queue::new(stage, direction, limits);
        let slot = direction.index();
        if let Some(tail) = self.tails[slot] {
            self.queues[tail].next = Some(id);
            queue.prev = Some(tail);
        } else {
            self.heads[slot] = Some(id);
        }
        self.tails[slot] = Some(id);
        self.queues.push(queue);
        id
    }

    pub fn pair(&mut self, a: QueueId, b: QueueId) {
        self.queues[a].pair = Some(b);
        self.queues[b].pair = Some(a);
    }

    pub fn first(&self, direction: Direction) -> Option<QueueId> {
        self.heads[direction.index()]
    }

    /// Queue ids of one direction in chain order.
    pub fn chain(&self, direction: Direction) -> Vec<QueueId> {
        let mut ids = Vec::new();
        let mut cursor = self.first(direction);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.queues[id].next;
        }
        ids
    }

    pub fn queue(&self, q: QueueId) -> &Queue {
        &self.queues[q]
    }

    pub fn queue_mut(&mut self, q: QueueId) -> &mut Queue {
        &mut self.queues[q]
    }

    pub fn is_built(&self) -> bool {
        !self.queues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Drops every queue, packet and scheduling entry.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Appends `packet` to `q`, scheduling the queue when asked to and it is
    /// not disabled.
    pub fn put_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        let queue = &mut self.queues[q];
        queue.count += packet.count();
        queue.packets.push_back(packet);
        if schedule && !queue.flags.disabled {
            self.schedule(q);
        }
    }

    /// Like [`put_for_service`](Self::put_for_service) but coalesces
    /// consecutive data packets into one.
    pub fn join_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        let queue = &mut self.queues[q];
        let count = packet.count();
        let packet = match queue.packets.back_mut() {
            Some(last) if last.kind == PacketKind::Data && packet.kind == PacketKind::Data => {
                match last.join(packet) {
                    Ok(()) => {
                        queue.count += count;
                        None
                    }
                    Err(packet) => Some(packet),
                }
            }
            _ => Some(packet),
        };
        match packet {
            Some(packet) => self.put_for_service(q, packet, schedule),
            None if schedule && !self.queues[q].flags.disabled => self.schedule(q),
            None => {}
        }
    }

    /// Returns a packet to the head of the queue, undoing a [`get`](Self::get).
    pub fn put_back(&mut self, q: QueueId, packet: Packet) {
        let queue = &mut self.queues[q];
        queue.count += packet.count();
        queue.packets.push_front(packet);
    }

    /// Removes the head packet.
    ///
    /// When a queue that was marked full drains to its low-water mark, the
    /// nearest disabled upstream queue is re-enabled.
    pub fn get(&mut self, q: QueueId) -> Option<Packet> {
        let queue = &mut self.queues[q];
        let packet = queue.packets.pop_front()?;
        queue.count -= packet.count();

        if queue.flags.full && queue.count <= queue.low {
            queue.flags.full = false;
            let mut cursor = queue.prev;
            while let Some(prev) = cursor {
                if self.queues[prev].flags.disabled {
                    self.enable(prev);
                    break;
                }
                cursor = self.queues[prev].prev;
            }
        }
        Some(packet)
    }

    /// Runs `f` on the packet at `index`, keeping the queue count exact when
    /// the packet grows or shrinks.
    pub fn with_packet<R>(
        &mut self,
        q: QueueId,
        index: usize,
        f: impl FnOnce(&mut Packet) -> R,
    ) -> Option<R> {
        let queue = &mut self.queues[q];
        let packet = queue.packets.get_mut(index)?;
        let before = packet.count();
        let result = f(packet);
        let after = packet.count();
        queue.count = queue.count - before + after;
        Some(result)
    }

    /// Adds `q` to the ready list. Scheduling an already scheduled queue is a
    /// no-op.
    pub fn schedule(&mut self, q: QueueId) {
        let queue = &mut self.queues[q];
        if !queue.flags.scheduled {
            queue.flags.scheduled = true;
            self.schedule.push_back(q);
        }
    }

    pub fn unschedule(&mut self, q: QueueId) {
        if self.queues[q].flags.scheduled {
            self.queues[q].flags.scheduled = false;
            self.schedule.retain(|&id| id != q);
        }
    }

    /// Pops the next queue from the ready list.
    pub fn next_scheduled(&mut self) -> Option<QueueId> {
        let q = self.schedule.pop_front()?;
        self.queues[q].flags.scheduled = false;
        Some(q)
    }

    pub fn has_scheduled(&self) -> bool {
        !self.schedule.is_empty()
    }

    pub fn disable(&mut self, q: QueueId) {
        self.queues[q].flags.disabled = true;
    }

    /// Re-enables a disabled queue and schedules it.
    pub fn enable(&mut self, q: QueueId) {
        if self.queues[q].flags.disabled {
            self.queues[q].flags.disabled = false;
            self.schedule(q);
        }
    }

    /// Checks whether the queue after `q` can take `packet`.
    ///
    /// An oversized packet is cut down to the downstream packet size with the
    /// remainder put back on `q`. If even that does not fit, `q` is disabled,
    /// the downstream queue is marked full and scheduled, and `false` is
    /// returned. The caller must then put `packet` back and yield.
    pub fn will_next_queue_accept(&mut self, q: QueueId, packet: &mut Packet) -> bool {
        let Some(next) = self.queues[q].next else {
            return true;
        };
        let (next_max, next_size, next_count) = {
            let n = &self.queues[next];
            (n.max, n.packet_size, n.count)
        };

        let size = packet.count();
        if size <= next_size && size + next_count <= next_max {
            return true;
        }
        self.resize_packet(q, packet, 0);
        if packet.count() + next_count <= next_max {
            return true;
        }

        self.disable(q);
        self.queues[next].flags.full = true;
        self.schedule(next);
        false
    }

    /// Splits `packet` so it fits `size` and the downstream limits, putting
    /// the remainder back on `q`. A `size` of zero means no explicit bound.
    pub fn resize_packet(&mut self, q: QueueId, packet: &mut Packet, size: usize) {
        let mut limit = if size == 0 { usize::MAX } else { size };
        if let Some(next) = self.queues[q].next {
            let n = &self.queues[next];
            limit = limit.min(n.max).min(n.packet_size);
        }
        if let Some(tail) = packet.split(limit.max(1)) {
            self.put_back(q, tail);
        }
    }

    /// Drops every queued packet except the response header.
    pub fn discard_data(&mut self, q: QueueId) {
        let queue = &mut self.queues[q];
        queue.packets.retain(|p| p.kind == PacketKind::Header);
        queue.count = queue.packets.iter().map(Packet::count).sum();
    }

    /// Replaces the stage serving `q`.
    pub fn set_stage(&mut self, q: QueueId, stage: Arc<dyn Stage>) {
        self.queues[q].stage = stage;
    }
}

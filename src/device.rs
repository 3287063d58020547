//! Nodes, devices and priority queues.
//!
//! A [`Node`] owns a set of [`Device`]s. A device carries up to eight
//! priority class queues (its root discipline), a nominal data rate and a
//! point-to-point link to a peer device. Transmission of a frame occupies
//! the link for its serialization time; arriving frames are dispatched to
//! the receiving node's protocol handlers in registration order.
//!
//! Control frames bypass the class queues through a dedicated queue with
//! strict priority, so link-level signaling is never blocked by the data
//! it regulates.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use slab::Slab;
use tracing::warn;

use crate::error::{Error, Result};
use crate::packet::{MacAddr, Packet};
use crate::sim::{Simulator, Time};

/// Index of a device within its node.
pub type DeviceId = usize;

/// Handlers registered for this protocol number see every frame.
pub const WILDCARD_PROTOCOL: u16 = 0;

/// A link-layer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub dst: MacAddr,
    pub protocol: u16,
    pub payload: Packet,
    /// Device the frame arrived on, stamped at ingress.
    ingress: Cell<Option<DeviceId>>,
}

impl Frame {
    pub fn new(dst: MacAddr, protocol: u16, payload: Packet) -> Self {
        Frame {
            dst,
            protocol,
            payload,
            ingress: Cell::new(None),
        }
    }

    #[inline]
    pub fn ingress(&self) -> Option<DeviceId> {
        self.ingress.get()
    }

    #[inline]
    pub fn set_ingress(&self, device: DeviceId) {
        self.ingress.set(Some(device));
    }

    #[inline]
    fn bits_on_wire(&self) -> u64 {
        self.payload.len() as u64 * 8
    }
}

struct ClassQueue {
    frames: RefCell<VecDeque<Frame>>,
    max_frames: usize,
    paused: Cell<bool>,
}

impl ClassQueue {
    fn new(max_frames: usize) -> Self {
        ClassQueue {
            frames: RefCell::new(VecDeque::new()),
            max_frames,
            paused: Cell::new(false),
        }
    }
}

type TraceFn = Box<dyn Fn(&Frame, usize)>;

struct DeviceInner {
    id: DeviceId,
    sim: Simulator,
    node: Weak<NodeInner>,
    data_rate_bps: u64,
    classes: Vec<ClassQueue>,
    control: RefCell<VecDeque<Frame>>,
    peer: RefCell<Option<Weak<DeviceInner>>>,
    busy: Cell<bool>,
    enqueue_traces: RefCell<Vec<(usize, TraceFn)>>,
    dequeue_traces: RefCell<Vec<(usize, TraceFn)>>,
}

/// One network device. Cheap to clone; clones share the device.
#[derive(Clone)]
pub struct Device {
    inner: Rc<DeviceInner>,
}

impl Device {
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    /// Nominal data rate in bits per second.
    #[inline]
    pub fn data_rate(&self) -> u64 {
        self.inner.data_rate_bps
    }

    /// Number of priority classes in the root discipline.
    #[inline]
    pub fn class_count(&self) -> usize {
        self.inner.classes.len()
    }

    pub fn class_depth(&self, class: usize) -> usize {
        self.inner.classes[class].frames.borrow().len()
    }

    pub fn class_max(&self, class: usize) -> usize {
        self.inner.classes[class].max_frames
    }

    pub fn class_paused(&self, class: usize) -> bool {
        self.inner.classes[class].paused.get()
    }

    /// Wire this device to a peer, both directions.
    pub fn connect(&self, peer: &Device) {
        *self.inner.peer.borrow_mut() = Some(Rc::downgrade(&peer.inner));
        *peer.inner.peer.borrow_mut() = Some(Rc::downgrade(&self.inner));
    }

    /// Enqueue a frame on a priority class. Full queues tail-drop.
    pub fn enqueue(&self, frame: Frame, class: usize) {
        if self.inner.classes.is_empty() {
            self.send_control(frame);
            return;
        }
        if class >= self.inner.classes.len() {
            warn!(
                target: "simmpi::device",
                device = self.id(),
                class,
                "no such priority class, dropping frame"
            );
            return;
        }
        let queue = &self.inner.classes[class];
        let depth = {
            let mut frames = queue.frames.borrow_mut();
            if frames.len() >= queue.max_frames {
                warn!(
                    target: "simmpi::device",
                    device = self.id(),
                    class,
                    "priority class full, dropping frame"
                );
                return;
            }
            frames.push_back(frame.clone());
            frames.len()
        };
        for (traced_class, trace) in self.inner.enqueue_traces.borrow().iter() {
            if *traced_class == class {
                trace(&frame, depth);
            }
        }
        Device::kick(&self.inner);
    }

    /// Enqueue on the control path: strict priority, unbounded, untraced.
    pub fn send_control(&self, frame: Frame) {
        self.inner.control.borrow_mut().push_back(frame);
        Device::kick(&self.inner);
    }

    /// Stop serving a priority class.
    pub fn pause_class(&self, class: usize) {
        self.inner.classes[class].paused.set(true);
    }

    /// Resume a priority class and re-kick transmission.
    pub fn resume_class(&self, class: usize) {
        let was_paused = self.inner.classes[class].paused.replace(false);
        if was_paused {
            Device::kick(&self.inner);
        }
    }

    /// Observe enqueues on one class: `(frame, depth after enqueue)`.
    pub fn trace_enqueue<F: Fn(&Frame, usize) + 'static>(&self, class: usize, trace: F) {
        self.inner
            .enqueue_traces
            .borrow_mut()
            .push((class, Box::new(trace)));
    }

    /// Observe dequeues on one class: `(frame, depth after dequeue)`.
    pub fn trace_dequeue<F: Fn(&Frame, usize) + 'static>(&self, class: usize, trace: F) {
        self.inner
            .dequeue_traces
            .borrow_mut()
            .push((class, Box::new(trace)));
    }

    fn pick_frame(inner: &Rc<DeviceInner>) -> Option<Frame> {
        if let Some(frame) = inner.control.borrow_mut().pop_front() {
            return Some(frame);
        }
        for (class, queue) in inner.classes.iter().enumerate() {
            if queue.paused.get() {
                continue;
            }
            let popped = {
                let mut frames = queue.frames.borrow_mut();
                frames.pop_front().map(|frame| (frame, frames.len()))
            };
            if let Some((frame, depth)) = popped {
                for (traced_class, trace) in inner.dequeue_traces.borrow().iter() {
                    if *traced_class == class {
                        trace(&frame, depth);
                    }
                }
                return Some(frame);
            }
        }
        None
    }

    fn kick(inner: &Rc<DeviceInner>) {
        if inner.busy.get() {
            return;
        }
        // Claim the link before running dequeue traces, so a trace that
        // re-kicks this device cannot start a second transmission.
        inner.busy.set(true);
        let Some(frame) = Device::pick_frame(inner) else {
            inner.busy.set(false);
            return;
        };
        let delay = Time::bit_time(frame.bits_on_wire(), inner.data_rate_bps);
        let weak = Rc::downgrade(inner);
        inner.sim.schedule(delay, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.busy.set(false);
            Device::deliver(&inner, frame);
            Device::kick(&inner);
        });
    }

    fn deliver(inner: &Rc<DeviceInner>, frame: Frame) {
        let peer = inner.peer.borrow().as_ref().and_then(Weak::upgrade);
        let Some(peer) = peer else {
            warn!(target: "simmpi::device", device = inner.id, "no link peer, frame lost");
            return;
        };
        let Some(peer_node) = peer.node.upgrade() else {
            return;
        };
        Node { inner: peer_node }.dispatch(peer.id, &frame);
    }
}

struct HandlerEntry {
    protocol: u16,
    device: Option<DeviceId>,
    callback: Box<dyn Fn(DeviceId, &Frame)>,
}

struct NodeInner {
    sim: Simulator,
    devices: RefCell<Slab<Device>>,
    handlers: RefCell<Vec<Rc<HandlerEntry>>>,
}

/// A node: a set of devices plus protocol handler dispatch.
#[derive(Clone)]
pub struct Node {
    inner: Rc<NodeInner>,
}

impl Node {
    pub fn new(sim: &Simulator) -> Self {
        Node {
            inner: Rc::new(NodeInner {
                sim: sim.clone(),
                devices: RefCell::new(Slab::new()),
                handlers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Add a device with `num_classes` priority classes (0 for a plain
    /// device) of `max_frames` depth each.
    pub fn add_device(&self, data_rate_bps: u64, num_classes: usize, max_frames: usize) -> Device {
        let mut devices = self.inner.devices.borrow_mut();
        let entry = devices.vacant_entry();
        let device = Device {
            inner: Rc::new(DeviceInner {
                id: entry.key(),
                sim: self.inner.sim.clone(),
                node: Rc::downgrade(&self.inner),
                data_rate_bps,
                classes: (0..num_classes).map(|_| ClassQueue::new(max_frames)).collect(),
                control: RefCell::new(VecDeque::new()),
                peer: RefCell::new(None),
                busy: Cell::new(false),
                enqueue_traces: RefCell::new(Vec::new()),
                dequeue_traces: RefCell::new(Vec::new()),
            }),
        };
        entry.insert(device.clone());
        device
    }

    /// Look up a device by id.
    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.inner.devices.borrow().get(id).cloned()
    }

    /// Register a protocol handler, optionally scoped to one device.
    /// Non-wildcard registrations must not collide.
    pub fn register_handler<F>(
        &self,
        protocol: u16,
        device: Option<DeviceId>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(DeviceId, &Frame) + 'static,
    {
        let mut handlers = self.inner.handlers.borrow_mut();
        if protocol != WILDCARD_PROTOCOL {
            let collision = handlers.iter().any(|entry| {
                entry.protocol == protocol
                    && (entry.device.is_none() || device.is_none() || entry.device == device)
            });
            if collision {
                return Err(Error::Protocol(format!(
                    "protocol {protocol:#06x} already has a handler on this node"
                )));
            }
        }
        handlers.push(Rc::new(HandlerEntry {
            protocol,
            device,
            callback: Box::new(callback),
        }));
        Ok(())
    }

    /// Deliver an arriving frame to every matching handler, in
    /// registration order.
    fn dispatch(&self, device: DeviceId, frame: &Frame) {
        let handlers: Vec<_> = self.inner.handlers.borrow().iter().cloned().collect();
        for entry in handlers {
            let protocol_match =
                entry.protocol == WILDCARD_PROTOCOL || entry.protocol == frame.protocol;
            let device_match = entry.device.is_none() || entry.device == Some(device);
            if protocol_match && device_match {
                (entry.callback)(device, frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;

    fn linked_pair(sim: &Simulator, rate: u64) -> (Node, Device, Node, Device) {
        let node_a = Node::new(sim);
        let device_a = node_a.add_device(rate, 8, 100);
        let node_b = Node::new(sim);
        let device_b = node_b.add_device(rate, 8, 100);
        device_a.connect(&device_b);
        (node_a, device_a, node_b, device_b)
    }

    #[test]
    fn test_transmission_delay() {
        let sim = Simulator::new();
        let (_a, device_a, node_b, _b) = linked_pair(&sim, 100_000_000_000);

        let arrived = Rc::new(Cell::new(None));
        let slot = arrived.clone();
        let sim2 = sim.clone();
        node_b
            .register_handler(0x0800, None, move |_dev, _frame| {
                slot.set(Some(sim2.now()));
            })
            .unwrap();

        // 46 bytes at 100 Gb/s serialize in 3.68 ns.
        let frame = Frame::new(MacAddr([0; 6]), 0x0800, packet::zeroed(46));
        device_a.enqueue(frame, 0);
        sim.run();
        assert_eq!(arrived.get(), Some(Time::from_picos(3_680)));
    }

    #[test]
    fn test_pause_holds_frames() {
        let sim = Simulator::new();
        let (_a, device_a, node_b, _b) = linked_pair(&sim, 100_000_000_000);

        let count = Rc::new(Cell::new(0u32));
        let slot = count.clone();
        node_b
            .register_handler(0x0800, None, move |_dev, _frame| slot.set(slot.get() + 1))
            .unwrap();

        device_a.pause_class(0);
        device_a.enqueue(Frame::new(MacAddr([0; 6]), 0x0800, packet::zeroed(64)), 0);
        sim.run();
        assert_eq!(count.get(), 0);
        assert_eq!(device_a.class_depth(0), 1);

        device_a.resume_class(0);
        sim.run();
        assert_eq!(count.get(), 1);
        assert_eq!(device_a.class_depth(0), 0);
    }

    #[test]
    fn test_control_frames_preempt_paused_classes() {
        let sim = Simulator::new();
        let (_a, device_a, node_b, _b) = linked_pair(&sim, 100_000_000_000);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let slot = seen.clone();
        node_b
            .register_handler(WILDCARD_PROTOCOL, None, move |_dev, frame| {
                slot.borrow_mut().push(frame.protocol);
            })
            .unwrap();

        device_a.pause_class(0);
        device_a.enqueue(Frame::new(MacAddr([0; 6]), 0x0800, packet::zeroed(64)), 0);
        device_a.send_control(Frame::new(MacAddr([0; 6]), 0x8808, packet::zeroed(46)));
        sim.run();
        assert_eq!(*seen.borrow(), vec![0x8808]);
    }

    #[test]
    fn test_priority_order_and_traces() {
        let sim = Simulator::new();
        let (_a, device_a, node_b, _b) = linked_pair(&sim, 1_000_000_000);

        let order = Rc::new(RefCell::new(Vec::new()));
        let slot = order.clone();
        node_b
            .register_handler(WILDCARD_PROTOCOL, None, move |_dev, frame| {
                slot.borrow_mut().push(frame.protocol);
            })
            .unwrap();

        let enqueued = Rc::new(Cell::new(0usize));
        let slot = enqueued.clone();
        device_a.trace_enqueue(1, move |_frame, depth| slot.set(depth));

        // Class 1 frame queued first, but class 0 transmits first.
        device_a.pause_class(0);
        device_a.pause_class(1);
        device_a.enqueue(Frame::new(MacAddr([0; 6]), 0x0002, packet::zeroed(10)), 1);
        device_a.enqueue(Frame::new(MacAddr([0; 6]), 0x0001, packet::zeroed(10)), 0);
        assert_eq!(enqueued.get(), 1);
        device_a.resume_class(0);
        device_a.resume_class(1);
        sim.run();
        assert_eq!(*order.borrow(), vec![0x0001, 0x0002]);
    }

    #[test]
    fn test_handler_collision_refused() {
        let sim = Simulator::new();
        let node = Node::new(&sim);
        let device = node.add_device(1_000_000_000, 8, 10);
        node.register_handler(0x8808, Some(device.id()), |_dev, _frame| {})
            .unwrap();
        assert!(node
            .register_handler(0x8808, Some(device.id()), |_dev, _frame| {})
            .is_err());
        // Wildcards never collide.
        node.register_handler(WILDCARD_PROTOCOL, None, |_dev, _frame| {})
            .unwrap();
        node.register_handler(WILDCARD_PROTOCOL, None, |_dev, _frame| {})
            .unwrap();
    }
}

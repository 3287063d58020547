//! Priority Flow Control.
//!
//! Two drivers cooperate per the usual split:
//!
//! - [`PfcDeviceDriver`] watches the class queues of an outbound device.
//!   An enqueue that fills a queue past the pause watermark emits a PAUSE
//!   frame (pause time saturated); a dequeue that drains it below the
//!   resume watermark emits a RESUME (pause time zero). Frames go out of
//!   the triggering packet's ingress device, to the PFC multicast group.
//! - [`PfcNodeDriver`] stamps every arriving frame with its ingress device
//!   and maintains one [`PauseTimer`] per device: received pause times are
//!   counted down in link quanta (the bit time of 512 bits), paused class
//!   queues are resumed when their remaining time reaches zero, and a
//!   terminable wake operation is kept armed at the minimum positive
//!   remaining time.

use std::cell::RefCell;
use std::rc::Rc;

use fnv::FnvHashMap;
use tracing::{debug, warn};

use crate::config::SimConfig;
use crate::device::{Device, DeviceId, Frame, Node, WILDCARD_PROTOCOL};
use crate::op::Operation;
use crate::packet::{
    PauseTimeVector, PfcHeader, PFC_MAC_PROTOCOL, PFC_MULTICAST_ADDRESS, PFC_OP_CODE,
    PFC_PRIORITY_COUNT,
};
use crate::sim::{Simulator, Time};

/// A PFC quantum is the transmission time of this many bits.
pub const QUANTA_BIT_SIZE: u64 = 512;

/// Per-device pause state: remaining pause durations in quanta, one per
/// priority, decayed by elapsed link time.
struct PauseTimer {
    quanta: Time,
    last_updated: Time,
    remaining: [u16; PFC_PRIORITY_COUNT],
    wake: Option<Operation<bool>>,
}

impl PauseTimer {
    fn new(quanta: Time, now: Time) -> Self {
        PauseTimer {
            quanta,
            last_updated: now,
            remaining: [0; PFC_PRIORITY_COUNT],
            wake: None,
        }
    }

    /// Decay every positive entry by the number of whole quanta elapsed
    /// and cancel the armed wake.
    fn update(&mut self, now: Time) {
        if let Some(wake) = self.wake.take() {
            wake.terminate(false);
        }
        let delta = ((now - self.last_updated) / self.quanta).min(u16::MAX as u64) as u16;
        for remaining in &mut self.remaining {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(delta);
            }
        }
        self.last_updated = now;
    }

    fn min_positive(&self) -> Option<u16> {
        self.remaining.iter().copied().filter(|&r| r > 0).min()
    }
}

struct PfcNodeInner {
    sim: Simulator,
    timers: RefCell<FnvHashMap<DeviceId, PauseTimer>>,
}

/// Ingress tagging and pause-timer maintenance for one node.
#[derive(Clone)]
pub struct PfcNodeDriver {
    inner: Rc<PfcNodeInner>,
}

impl PfcNodeDriver {
    pub fn new(sim: &Simulator) -> Self {
        PfcNodeDriver {
            inner: Rc::new(PfcNodeInner {
                sim: sim.clone(),
                timers: RefCell::new(FnvHashMap::default()),
            }),
        }
    }

    /// Install the wildcard ingress tagger on `node`.
    pub fn install(&self, node: &Node) {
        node.register_handler(WILDCARD_PROTOCOL, None, |device, frame| {
            frame.set_ingress(device);
        })
        .expect("wildcard handlers never collide");
    }

    /// Apply a received PFC frame to `device`: decay the timer, overwrite
    /// the masked entries, dispatch queue pause/resume, and re-arm the
    /// wake.
    pub fn notify_pause_time(&self, device: &Device, mask: u16, pause_time: PauseTimeVector) {
        let now = self.inner.sim.now();
        debug!(
            target: "simmpi::pfc",
            device = device.id(),
            mask,
            ?pause_time,
            now = %now,
            "pause time updated"
        );
        {
            let mut timers = self.inner.timers.borrow_mut();
            let timer = timers.entry(device.id()).or_insert_with(|| {
                PauseTimer::new(Time::bit_time(QUANTA_BIT_SIZE, device.data_rate()), now)
            });
            timer.update(now);
            for priority in 0..PFC_PRIORITY_COUNT {
                if mask & (1 << priority) != 0 {
                    timer.remaining[priority] = pause_time[priority];
                }
            }
        }
        self.process(device);
        self.reschedule(device);
    }

    /// Pause or resume each of the device's class queues according to the
    /// timer state.
    fn process(&self, device: &Device) {
        let states: Vec<bool> = {
            let timers = self.inner.timers.borrow();
            let Some(timer) = timers.get(&device.id()) else {
                return;
            };
            let classes = device.class_count().min(PFC_PRIORITY_COUNT);
            (0..classes).map(|p| timer.remaining[p] > 0).collect()
        };
        for (priority, paused) in states.into_iter().enumerate() {
            if paused {
                device.pause_class(priority);
            } else {
                device.resume_class(priority);
            }
        }
    }

    /// Arm a wake at the minimum positive remaining time. The wake either
    /// fires (re-entering update/process/reschedule) or is cancelled by
    /// the next update.
    fn reschedule(&self, device: &Device) {
        let wake = {
            let mut timers = self.inner.timers.borrow_mut();
            let Some(timer) = timers.get_mut(&device.id()) else {
                return;
            };
            let Some(next) = timer.min_positive() else {
                return;
            };
            let delay = timer.quanta * next as u64;
            let wake = Operation::with_timeout(&self.inner.sim, false, true, delay);
            timer.wake = Some(wake.clone());
            wake
        };
        let driver = self.clone();
        let device = device.clone();
        Operation::spawn(async move {
            if wake.await? {
                driver.on_wake(&device);
            }
            Ok(())
        });
    }

    fn on_wake(&self, device: &Device) {
        let now = self.inner.sim.now();
        {
            let mut timers = self.inner.timers.borrow_mut();
            let Some(timer) = timers.get_mut(&device.id()) else {
                return;
            };
            timer.wake = None;
            timer.update(now);
        }
        self.process(device);
        self.reschedule(device);
    }

    /// Remaining pause time of one priority, in quanta.
    pub fn remaining_quanta(&self, device: DeviceId, priority: usize) -> u16 {
        self.inner
            .timers
            .borrow()
            .get(&device)
            .map_or(0, |timer| timer.remaining[priority])
    }
}

struct PfcDeviceInner {
    node_driver: PfcNodeDriver,
    pause_threshold: f64,
    resume_threshold: f64,
    node: RefCell<Option<Node>>,
}

/// Watermark watcher for one outbound device.
#[derive(Clone)]
pub struct PfcDeviceDriver {
    inner: Rc<PfcDeviceInner>,
}

impl PfcDeviceDriver {
    pub fn new(config: &SimConfig, node_driver: &PfcNodeDriver) -> Self {
        PfcDeviceDriver {
            inner: Rc::new(PfcDeviceInner {
                node_driver: node_driver.clone(),
                pause_threshold: config.pfc_pause_threshold,
                resume_threshold: config.pfc_resume_threshold,
                node: RefCell::new(None),
            }),
        }
    }

    /// Hook the device's class queues and register the PFC frame handler.
    /// Returns false (and logs) when the device is unsuitable or the PFC
    /// protocol number is already claimed.
    pub fn install(&self, node: &Node, device: &Device) -> bool {
        if device.class_count() == 0 {
            warn!(
                target: "simmpi::pfc",
                device = device.id(),
                "device has no priority discipline, skipping installation"
            );
            return false;
        }
        if device.class_count() > PFC_PRIORITY_COUNT {
            warn!(
                target: "simmpi::pfc",
                device = device.id(),
                classes = device.class_count(),
                "device has too many priorities, skipping installation"
            );
            return false;
        }

        let driver = self.clone();
        let target = device.clone();
        let registered = node.register_handler(PFC_MAC_PROTOCOL, Some(device.id()), move |_dev, frame| {
            match PfcHeader::from_frame(&frame.payload) {
                Ok(header) if header.op_code() == PFC_OP_CODE => {
                    driver
                        .inner
                        .node_driver
                        .notify_pause_time(&target, header.mask(), *header.pause_time());
                }
                _ => warn!(target: "simmpi::pfc", "frame is not a PFC frame, skipping it"),
            }
        });
        if registered.is_err() {
            warn!(
                target: "simmpi::pfc",
                device = device.id(),
                "PFC protocol number already claimed on this node, skipping installation"
            );
            return false;
        }
        *self.inner.node.borrow_mut() = Some(node.clone());

        for class in 0..device.class_count() {
            let max = device.class_max(class);
            let driver = self.clone();
            device.trace_enqueue(class, move |frame, depth| {
                if depth as f64 >= max as f64 * driver.inner.pause_threshold {
                    driver.send_pause(frame, class as u8);
                }
            });
            let driver = self.clone();
            device.trace_dequeue(class, move |frame, depth| {
                if depth as f64 <= max as f64 * driver.inner.resume_threshold {
                    driver.send_resume(frame, class as u8);
                }
            });
        }
        true
    }

    fn send_pause(&self, trigger: &Frame, priority: u8) {
        debug!(target: "simmpi::pfc", priority, "emitting PAUSE");
        self.send_pfc(trigger, PfcHeader::pause(priority));
    }

    fn send_resume(&self, trigger: &Frame, priority: u8) {
        debug!(target: "simmpi::pfc", priority, "emitting RESUME");
        self.send_pfc(trigger, PfcHeader::resume(priority));
    }

    /// Send a PFC frame out of the trigger's ingress device.
    fn send_pfc(&self, trigger: &Frame, header: PfcHeader) {
        let Some(ingress) = trigger.ingress() else {
            warn!(target: "simmpi::pfc", "trigger frame carries no ingress tag, skipping it");
            return;
        };
        let node = self.inner.node.borrow().clone();
        let Some(node) = node else {
            warn!(target: "simmpi::pfc", "driver is not installed, skipping it");
            return;
        };
        let Some(out) = node.device(ingress) else {
            warn!(target: "simmpi::pfc", device = ingress, "ingress device not found, skipping it");
            return;
        };
        out.send_control(Frame::new(
            PFC_MULTICAST_ADDRESS,
            PFC_MAC_PROTOCOL,
            header.to_frame(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE_100G: u64 = 100_000_000_000;

    fn paused_device(sim: &Simulator) -> (Node, Device, PfcNodeDriver) {
        let node = Node::new(sim);
        let device = node.add_device(RATE_100G, 8, 100);
        let driver = PfcNodeDriver::new(sim);
        driver.install(&node);
        (node, device, driver)
    }

    #[test]
    fn test_quanta_at_100g() {
        // One quantum at 100 Gb/s is exactly 5.12 ns.
        assert_eq!(
            Time::bit_time(QUANTA_BIT_SIZE, RATE_100G),
            Time::from_picos(5_120)
        );
    }

    #[test]
    fn test_pause_resumes_after_decay() {
        // A pause of 1000 quanta at 100 Gb/s expires at exactly 5.12 us.
        let sim = Simulator::new();
        let (_node, device, driver) = paused_device(&sim);

        let mut times = [0u16; PFC_PRIORITY_COUNT];
        times[0] = 1000;
        driver.notify_pause_time(&device, 0b1, times);
        assert!(device.class_paused(0));
        assert!(!device.class_paused(1));

        sim.run_until(Time::from_picos(5_119_999));
        assert!(device.class_paused(0));

        sim.run_until(Time::from_picos(5_120_000));
        assert!(!device.class_paused(0));
    }

    #[test]
    fn test_update_decays_and_merges_new_entries() {
        let sim = Simulator::new();
        let (_node, device, driver) = paused_device(&sim);

        let mut times = [0u16; PFC_PRIORITY_COUNT];
        times[0] = 1000;
        driver.notify_pause_time(&device, 0b1, times);

        // Half way through, a second frame pauses priority 1 for 100
        // quanta; priority 0 has decayed to 500 remaining.
        sim.run_until(Time::from_picos(2_560_000));
        let mut times = [0u16; PFC_PRIORITY_COUNT];
        times[1] = 100;
        driver.notify_pause_time(&device, 0b10, times);
        assert_eq!(driver.remaining_quanta(device.id(), 0), 500);
        assert_eq!(driver.remaining_quanta(device.id(), 1), 100);
        assert!(device.class_paused(0));
        assert!(device.class_paused(1));

        // Priority 1 expires first.
        sim.run_until(Time::from_picos(2_560_000 + 512_000));
        assert!(!device.class_paused(1));
        assert!(device.class_paused(0));

        // Priority 0 expires at its original deadline.
        sim.run_until(Time::from_picos(5_120_000));
        assert!(!device.class_paused(0));
    }

    #[test]
    fn test_resume_frame_overrides_pause() {
        let sim = Simulator::new();
        let (_node, device, driver) = paused_device(&sim);

        let mut times = [0u16; PFC_PRIORITY_COUNT];
        times[2] = 0xFFFF;
        driver.notify_pause_time(&device, 0b100, times);
        assert!(device.class_paused(2));

        // A zero pause time resumes immediately.
        driver.notify_pause_time(&device, 0b100, [0; PFC_PRIORITY_COUNT]);
        assert!(!device.class_paused(2));
        sim.run();
    }

    #[test]
    fn test_installation_requires_priority_discipline() {
        let sim = Simulator::new();
        let node = Node::new(&sim);
        let node_driver = PfcNodeDriver::new(&sim);
        let config = SimConfig::default();

        let plain = node.add_device(RATE_100G, 0, 0);
        assert!(!PfcDeviceDriver::new(&config, &node_driver).install(&node, &plain));

        let wide = node.add_device(RATE_100G, 16, 10);
        assert!(!PfcDeviceDriver::new(&config, &node_driver).install(&node, &wide));

        let good = node.add_device(RATE_100G, 8, 10);
        assert!(PfcDeviceDriver::new(&config, &node_driver).install(&node, &good));

        // Double installation collides on the protocol handler.
        assert!(!PfcDeviceDriver::new(&config, &node_driver).install(&node, &good));
    }
}

//! simmpi - MPI-style collectives over a discrete-event network simulation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ MpiApplication (app)      per-rank lifecycle, function queue     │
//! │   └─ Communicator (comm)  collectives over rank → socket map     │
//! │        └─ wire            typed codecs + fake payloads           │
//! │             └─ SimSocket (socket)   cooperative accept/connect/  │
//! │                  │                  send/receive + loopback      │
//! │                  └─ StreamSocket (net)  bounded byte pipes       │
//! │                                                                  │
//! │ Operation (op)   the currency of suspension everywhere           │
//! │ Simulator (sim)  the only driver of time                         │
//! │                                                                  │
//! │ PFC control plane:                                               │
//! │   Node/Device (device)  priority queues + rate-timed links       │
//! │   PfcDeviceDriver/PfcNodeDriver (pfc)  watermarks + pause timers │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is single-threaded and cooperative: user functions run as
//! coroutines whose suspension points are [`op::Operation`]s, resumed by
//! socket callbacks or scheduled simulator events. Between awaits, a body
//! runs to completion within a single simulator step.
//!
//! The PFC layer is an orthogonal control plane over the same physical
//! links: queue watermarks inject PAUSE/RESUME frames, and received pause
//! times throttle per-priority queues for durations measured in link
//! quanta (the transmission time of 512 bits).

pub mod app;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod net;
pub mod op;
pub mod packet;
pub mod pfc;
pub mod sim;
pub mod socket;
pub mod wire;

pub use app::{
    CommId, MpiApplication, MpiFunction, ERROR_COMMUNICATOR, FIRST_USER_COMMUNICATOR,
    NULL_COMMUNICATOR, SELF_COMMUNICATOR, WORLD_COMMUNICATOR,
};
pub use comm::{Communicator, Rank, ReduceOp, Reducible};
pub use config::SimConfig;
pub use device::{Device, DeviceId, Frame, Node};
pub use error::{Error, Result, SockErr};
pub use net::{Addr, Network, StreamSocket};
pub use op::Operation;
pub use packet::{InfinibandBth, MacAddr, Packet, PfcHeader};
pub use pfc::{PfcDeviceDriver, PfcNodeDriver};
pub use sim::{Simulator, Time};
pub use socket::SimSocket;

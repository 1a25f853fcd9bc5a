//! Bus master for OSDP peripherals on a shared RS-485 line.
//!
//! The [`master::Master`] polls every configured device in turn through a
//! [`transport::Transport`], tracks sequence numbers and reachability per device,
//! and passes replies and status changes to a [`bridge::Bridge`]. Messages for the
//! devices are queued from any thread through a [`master::BusHandle`].
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use osdp_master::{addr, bridge::Event, link::SerialConnector, Config, Master};
//!
//! let config = Config::load("osdp.toml").unwrap();
//! let (events, rx) = std::sync::mpsc::channel::<Event>();
//! let mut master = Master::new(config.devices().unwrap(), config.poll.clone(), events);
//! master.handle().deliver(addr(1), &b"\x6A\x00\x02\x02\x02\x01"[..]).unwrap();
//! master.run(&mut SerialConnector, &config.port, &AtomicBool::new(false));
//! # drop(rx);
//! ```

mod buffer;
pub mod bridge;
pub mod checksum;
pub mod config;
pub mod frame;
pub mod link;
pub mod mailbox;
pub mod master;
pub mod slave;
pub mod transport;
pub mod types;

pub use crate::config::Config;
pub use crate::frame::{function, Frame};
pub use crate::master::{BusHandle, Master, Polled};
pub use crate::slave::{Device, Status};
pub use crate::transport::Transport;
pub use crate::types::{addr, Address, IntoAddress, Sequence};

//! # roverd
//!
//! The Rover Suite robot runtime: bridges a motor-driver MCU and a thermal
//! camera to remote operators over one WebSocket hub, while fusing an
//! external 6-DoF pose stream and ultrasonic ranges into a log-odds
//! occupancy grid, planning exploration over it, and driving the vehicle
//! to map frontiers.
//!
//! The crate is a library plus the `roverd` daemon binary. A phone-side
//! host embeds [`supervisor::Supervisor`] directly and feeds it poses,
//! IMU samples and camera frames through the `offer_*` methods; the daemon
//! wires the same runtime to a serial port and serves the hub.

pub mod astar;
pub mod config;
pub mod explore;
pub mod flir;
pub mod frontier;
pub mod grid;
pub mod hex;
pub mod hub;
pub mod mapper;
pub mod mcu_bridge;
pub mod motion;
pub mod persistence;
pub mod recorder;
pub mod scan_match;
pub mod serial_link;
pub mod status;
pub mod stk500;
pub mod supervisor;
pub mod wander;

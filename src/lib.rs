//! # Airnode Sensor Node Library
//!
//! This crate is the core library of the `airnode` unattended sensor node.
//! It contains the particulate sensor bus driver, the adaptive filter bank,
//! the rotating log store and the stop-and-wait log retrieval session, plus
//! the `Node` type that composes them. The binary (`main.rs`) wires a node
//! to a real or mocked sensor bus and drives it at the configured cadence.
//!
//! ## Crate Structure
//!
//! - **`opc`**: Byte-level driver for the particulate sensor bus, including
//!   framing, CRC integrity checking and the ready-poll/restart ladder.
//! - **`filter`**: Per-channel scalar Kalman filters with adaptive
//!   observation noise, one per particulate size fraction.
//! - **`record`**: The composite sample record and its serialized line form.
//! - **`logstore`**: Rotating on-disk log of serialized sample records.
//! - **`uploader`**: Stop-and-wait retrieval of archived log files over the
//!   message bus.
//! - **`commands`**: The remote management command set and its parser.
//! - **`sensors`**: Traits for the collaborating sensors (GPS, gas,
//!   environment, secondary particulate) and mock implementations.
//! - **`msgbus`**: The publish/subscribe seam the node talks through.
//! - **`config`**: TOML settings, persisted in place when remote commands
//!   change them.
//! - **`node`**: Composition of the above into one tick-driven sensor node.
//! - **`error`**: The crate-wide `NodeError` enum.

pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod logstore;
pub mod msgbus;
pub mod node;
pub mod opc;
pub mod record;
pub mod sensors;
pub mod uploader;

//! loadcal -- adaptive load calibration for remote traffic engines.
//!
//! This crate drives a packet-generating traffic engine on a tester host
//! against a system under test, searching for the highest sustainable load
//! through its text control protocol.

pub mod calib;
pub mod config;
pub mod proto;
pub mod remote;

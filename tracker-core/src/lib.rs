#![no_std]

// Control plane for the wearable tracker firmware.
//
// Everything here is portable across the MCU firmware and the host emulator:
// no standard library, bounded storage only, and every hardware touch point is
// reached through the collaborator traits in `drivers`.

pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod event;
pub mod flash;
pub mod machine;
pub mod queue;
pub mod retry;
pub mod timer;
pub mod trace;

pub use event::{Event, EventKind};
pub use machine::{Controller, Fault};
pub use queue::EventQueue;

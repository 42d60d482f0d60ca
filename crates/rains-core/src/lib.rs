//! rains-core — shared types, wire codec, framing and signature checks.
//! The daemon and the integration tests depend on this crate.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod framer;
pub mod wire;

pub use wire::{Capability, ConnInfo, Message, NotificationType, Section, Token};

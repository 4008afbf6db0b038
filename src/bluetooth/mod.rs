//! Bluetooth side of the relay.
//!
//! The emulated board (peripheral role) faces the app, the upstream link
//! (central role) faces the real board.

pub mod gatt;
pub mod peripheral;
pub mod transport;
pub mod upstream;

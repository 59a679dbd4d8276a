//! Input injection for viewer-originated keyboard/mouse/scroll events.
//!
//! - `libei.rs`: libei backend for injecting into the host compositor.
//! - `keymap.rs`: wire scancode to Linux evdev keycode mapping.

pub mod keymap;
pub mod libei;

//! Shared utility modules used across Galley components.

pub mod lock_order;
pub mod varint;

//! Shared utility modules used across segdex components.

pub mod varint;

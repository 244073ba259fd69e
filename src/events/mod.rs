//! Audit events and counters

mod bus;

pub use bus::{AuditEvent, CounterSnapshot, Counters, EventBus};

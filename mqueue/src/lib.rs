//! Named message queues shared between processes.
//!
//! A queue lives in a named shared memory segment; its name is resolved to a
//! stable identity which addresses a link file under the configured data
//! directory. Messages carry a `u32` priority and are received highest
//! priority first, oldest first within a priority.

pub mod attr;
pub mod config;
mod core;
pub mod errors;
pub mod flags;
pub mod handle;
pub mod identity;
pub mod transport;


use std::time::Instant;

pub use attr::MqAttr;
pub use config::QueueConfig;
pub use errors::{MqError, Result};
pub use flags::{Access, OpenFlags};
pub use handle::{HandleTable, MessageQueue, Mqd, OpenOptions};
pub use identity::{resolve, QueueId};
pub use transport::{Message, Wait};

pub fn open(name: &str, flags: OpenFlags, mode: u32, attr: Option<&MqAttr>) -> Result<Mqd> {
    HandleTable::global().open(name, flags, mode, attr)
}

pub fn close(mqd: Mqd) -> Result<()> {
    HandleTable::global().close(mqd)
}

/// Removes the named queue outright.
pub fn unlink(name: &str) -> Result<()> {
    HandleTable::global().unlink(name)
}

pub fn send(mqd: Mqd, payload: &[u8], priority: u32) -> Result<()> {
    HandleTable::global().send(mqd, payload, priority)
}

pub fn timed_send(mqd: Mqd, payload: &[u8], priority: u32, deadline: Instant) -> Result<()> {
    HandleTable::global().timed_send(mqd, payload, priority, deadline)
}

pub fn receive(mqd: Mqd, buf: &mut [u8]) -> Result<(usize, u32)> {
    HandleTable::global().receive(mqd, buf)
}

pub fn timed_receive(mqd: Mqd, buf: &mut [u8], deadline: Instant) -> Result<(usize, u32)> {
    HandleTable::global().timed_receive(mqd, buf, deadline)
}

pub fn getattr(mqd: Mqd) -> Result<MqAttr> {
    HandleTable::global().getattr(mqd)
}

/// Replaces the queue flags; returns the attributes as they were.
pub fn setattr(mqd: Mqd, flags: OpenFlags) -> Result<MqAttr> {
    HandleTable::global().setattr(mqd, flags)
}

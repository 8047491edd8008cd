use crate::errors::Result;
use crate::flags::OpenFlags;
use crate::handle::{HandleTable, MessageQueue, Mqd};

/// Snapshot of a queue's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqAttr {
    pub flags: OpenFlags,
    pub max_msg: usize,
    pub msg_size: usize,
    pub cur_msgs: usize,
}

impl Default for MqAttr {
    fn default() -> Self {
        MqAttr { flags: OpenFlags::empty(), max_msg: 0, msg_size: 0, cur_msgs: 0 }
    }
}

impl MqAttr {
    /// Creation attributes.
    pub fn new(max_msg: usize, msg_size: usize) -> Self {
        MqAttr { max_msg, msg_size, ..Default::default() }
    }
}

impl MessageQueue {
    /// Live attributes, read under the segment lock.
    pub fn attributes(&self) -> Result<MqAttr> {
        let geometry = self.segment.geometry();
        let mut locked = self.segment.lock()?;
        let state = locked.state();
        Ok(MqAttr {
            flags: OpenFlags::from_bits_truncate(state.flags),
            max_msg: geometry.max_msg,
            msg_size: geometry.msg_size,
            cur_msgs: state.cur_msgs as usize,
        })
    }

    /// Replaces the queue flags and returns the attributes as they were.
    /// Only `NONBLOCK` is kept; capacity and message size are fixed.
    pub fn set_flags(&self, flags: OpenFlags) -> Result<MqAttr> {
        let geometry = self.segment.geometry();
        let mut locked = self.segment.lock()?;
        let state = locked.state();
        let previous = MqAttr {
            flags: OpenFlags::from_bits_truncate(state.flags),
            max_msg: geometry.max_msg,
            msg_size: geometry.msg_size,
            cur_msgs: state.cur_msgs as usize,
        };
        state.flags = flags.queue_flags().bits();
        Ok(previous)
    }
}

impl HandleTable {
    pub fn getattr(&self, mqd: Mqd) -> Result<MqAttr> {
        self.get(mqd)?.attributes()
    }

    pub fn setattr(&self, mqd: Mqd, flags: OpenFlags) -> Result<MqAttr> {
        self.get(mqd)?.set_flags(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::config::QueueConfig;
    use crate::errors::MqError;
    use crate::handle::OpenOptions;
    use crate::transport::Wait;

    #[test]
    fn attributes_reflect_creation_and_depth() -> Result<()> {
        let dir = tempdir()?;
        let cfg = QueueConfig::with_data_dir(dir.path().to_string_lossy().into_owned());
        let q = MessageQueue::open("attrs", &OpenOptions::new().create().attr(MqAttr::new(3, 64)), &cfg)?;
        let attr = q.attributes()?;
        assert_eq!(attr, MqAttr::new(3, 64));

        q.send(b"one", 0, Wait::NonBlocking)?;
        q.send(b"two", 0, Wait::NonBlocking)?;
        assert_eq!(q.attributes()?.cur_msgs, 2);
        q.receive(64, Wait::NonBlocking)?;
        assert_eq!(q.attributes()?.cur_msgs, 1);
        q.destroy()
    }

    #[test]
    fn set_flags_returns_previous_and_keeps_limits() -> Result<()> {
        let dir = tempdir()?;
        let cfg = QueueConfig::with_data_dir(dir.path().to_string_lossy().into_owned());
        let q = MessageQueue::open("attrs", &OpenOptions::new().create(), &cfg)?;

        let previous = q.set_flags(OpenFlags::NONBLOCK | OpenFlags::CREAT)?;
        assert!(previous.flags.is_empty());
        let now = q.attributes()?;
        assert_eq!(now.flags, OpenFlags::NONBLOCK);
        assert_eq!(now.max_msg, cfg.max_messages);
        assert_eq!(now.msg_size, cfg.max_msg_size);

        let previous = q.set_flags(OpenFlags::empty())?;
        assert_eq!(previous.flags, OpenFlags::NONBLOCK);
        q.destroy()
    }

    #[test]
    fn attributes_fail_after_removal() -> Result<()> {
        let dir = tempdir()?;
        let cfg = QueueConfig::with_data_dir(dir.path().to_string_lossy().into_owned());
        let q = MessageQueue::open("attrs", &OpenOptions::new().create(), &cfg)?;
        MessageQueue::unlink("attrs", &cfg)?;
        assert!(matches!(q.attributes(), Err(MqError::InvalidHandle)));
        assert!(matches!(q.set_flags(OpenFlags::NONBLOCK), Err(MqError::InvalidHandle)));
        Ok(())
    }
}

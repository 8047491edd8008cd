use bitflags::bitflags;

bitflags! {
    /// Open flags and queue flags. Values follow the host's `fcntl.h`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Receive only
        const RDONLY = libc::O_RDONLY;
        /// Send only
        const WRONLY = libc::O_WRONLY;
        /// Send and receive
        const RDWR = libc::O_RDWR;
        /// Create the queue if it does not exist
        const CREAT = libc::O_CREAT;
        /// With CREAT, fail if the queue exists
        const EXCL = libc::O_EXCL;
        /// Fail instead of waiting on a full or empty queue
        const NONBLOCK = libc::O_NONBLOCK;
    }
}

/// Direction(s) a handle may transfer messages in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn can_send(&self) -> bool {
        !matches!(self, Access::ReadOnly)
    }

    pub fn can_receive(&self) -> bool {
        !matches!(self, Access::WriteOnly)
    }
}

impl OpenFlags {
    pub fn access(&self) -> Access {
        match self.bits() & libc::O_ACCMODE {
            libc::O_WRONLY => Access::WriteOnly,
            libc::O_RDWR => Access::ReadWrite,
            _ => Access::ReadOnly,
        }
    }

    /// The subset that is stored in a queue's attributes.
    pub fn queue_flags(&self) -> OpenFlags {
        *self & OpenFlags::NONBLOCK
    }
}

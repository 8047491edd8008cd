use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::attr::MqAttr;
use crate::config::QueueConfig;
use crate::core::{Geometry, Lookup, Segment};
use crate::errors::{MqError, Result};
use crate::flags::{Access, OpenFlags};
use crate::identity::{self, QueueId};

// Creation races with removal by other processes; give up after a few rounds.
const CREATE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub flags: OpenFlags,
    /// Recorded in the segment header; not enforced.
    pub mode: u32,
    /// Capacity and message size for a newly created queue. Ignored when
    /// attaching to an existing one.
    pub attr: Option<MqAttr>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions { flags: OpenFlags::RDWR, mode: 0o600, attr: None }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_flags(flags: OpenFlags, mode: u32, attr: Option<&MqAttr>) -> Self {
        OpenOptions { flags, mode, attr: attr.copied() }
    }

    pub fn create(mut self) -> Self {
        self.flags |= OpenFlags::CREAT;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.flags |= OpenFlags::CREAT | OpenFlags::EXCL;
        self
    }

    pub fn nonblocking(mut self) -> Self {
        self.flags |= OpenFlags::NONBLOCK;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.flags.remove(OpenFlags::WRONLY | OpenFlags::RDWR);
        self
    }

    pub fn write_only(mut self) -> Self {
        self.flags.remove(OpenFlags::RDWR);
        self.flags |= OpenFlags::WRONLY;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn attr(mut self, attr: MqAttr) -> Self {
        self.attr = Some(attr);
        self
    }
}

fn geometry_for(attr: Option<&MqAttr>, cfg: &QueueConfig) -> Result<Geometry> {
    let (max_msg, msg_size) = match attr {
        Some(a) => (a.max_msg, a.msg_size),
        None => (cfg.max_messages, cfg.max_msg_size),
    };
    if max_msg == 0 || max_msg > cfg.limit_messages {
        return Err(MqError::InvalidAttributes(format!(
            "max_msg {} not in 1..={}",
            max_msg, cfg.limit_messages
        )));
    }
    if msg_size == 0 || msg_size > cfg.limit_msg_size {
        return Err(MqError::InvalidAttributes(format!(
            "msg_size {} not in 1..={}",
            msg_size, cfg.limit_msg_size
        )));
    }
    Ok(Geometry { max_msg, msg_size })
}

/// One open reference to a named queue.
pub struct MessageQueue {
    name: String,
    id: QueueId,
    access: Access,
    nonblocking: bool,
    pub(crate) segment: Segment,
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("access", &self.access)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

impl MessageQueue {
    pub fn open(name: &str, opts: &OpenOptions, cfg: &QueueConfig) -> Result<MessageQueue> {
        let id = identity::resolve(name);
        let link = cfg.data_dir().join(id.link_name());
        let init_timeout = Duration::from_millis(cfg.init_timeout_ms);

        let segment = if opts.flags.contains(OpenFlags::CREAT) {
            let geometry = geometry_for(opts.attr.as_ref(), cfg)?;
            fs::create_dir_all(cfg.data_dir())?;
            let exclusive = opts.flags.contains(OpenFlags::EXCL);
            let mut attempt = 0;
            loop {
                if attempt == CREATE_ATTEMPTS {
                    return Err(MqError::QueueUnavailable(name.to_string()));
                }
                attempt += 1;
                if let Some(seg) = Segment::create(&link, geometry, opts.mode)? {
                    info!(name, id = %id, "created message queue");
                    break seg;
                }
                match Segment::open(&link, init_timeout)? {
                    Lookup::Found(_) if exclusive => {
                        return Err(MqError::QueueExists(name.to_string()))
                    }
                    Lookup::Found(seg) => break seg,
                    Lookup::Absent => continue,
                    Lookup::Stale(os_id) => Segment::remove_stale_link(&link, &os_id)?,
                }
            }
        } else {
            match Segment::open(&link, init_timeout)? {
                Lookup::Found(seg) => seg,
                Lookup::Absent | Lookup::Stale(_) => {
                    return Err(MqError::QueueUnavailable(name.to_string()))
                }
            }
        };
        debug!(name, id = %id, flags = ?opts.flags, "opened message queue");
        Ok(MessageQueue {
            name: name.to_string(),
            id,
            access: opts.flags.access(),
            nonblocking: opts.flags.contains(OpenFlags::NONBLOCK),
            segment,
        })
    }

    /// Removes the named queue. Handles still open on it, here or in other
    /// processes, fail from then on with `InvalidHandle`.
    pub fn unlink(name: &str, cfg: &QueueConfig) -> Result<()> {
        let link = cfg.data_dir().join(identity::resolve(name).link_name());
        match Segment::open(&link, Duration::from_millis(cfg.init_timeout_ms))? {
            Lookup::Found(seg) => {
                seg.remove()?;
                info!(name, "removed message queue");
                Ok(())
            }
            Lookup::Absent => Err(MqError::QueueUnavailable(name.to_string())),
            Lookup::Stale(os_id) => {
                Segment::remove_stale_link(&link, &os_id)?;
                Err(MqError::QueueUnavailable(name.to_string()))
            }
        }
    }

    /// Releases this reference. The queue itself and other handles are
    /// untouched.
    pub fn close(self) -> Result<()> {
        self.release()
    }

    /// Releases this reference and removes the queue.
    pub fn destroy(self) -> Result<()> {
        self.segment.remove()?;
        info!(name = %self.name, "removed message queue");
        Ok(())
    }

    fn release(&self) -> Result<()> {
        debug!(name = %self.name, "closed message queue");
        self.segment.ensure_live()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Mode the queue was created with. Recorded only.
    pub fn mode(&self) -> u32 {
        self.segment.mode()
    }
}

/// Opaque queue descriptor handed out by a `HandleTable`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mqd(u32);

impl Mqd {
    pub fn as_raw(&self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Mqd {
        Mqd(raw)
    }
}

impl fmt::Display for Mqd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static GLOBAL: Lazy<HandleTable> = Lazy::new(|| HandleTable::new(QueueConfig::from_env()));

/// Descriptor table of one process (or one test).
pub struct HandleTable {
    config: QueueConfig,
    next: AtomicU32,
    handles: Mutex<HashMap<Mqd, Arc<MessageQueue>>>,
}

impl HandleTable {
    pub fn new(config: QueueConfig) -> HandleTable {
        HandleTable {
            config,
            next: AtomicU32::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The table behind the crate-level functions. Its data directory comes
    /// from `MQUEUE_DIR`.
    pub fn global() -> &'static HandleTable {
        &GLOBAL
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn open(&self, name: &str, flags: OpenFlags, mode: u32, attr: Option<&MqAttr>) -> Result<Mqd> {
        let queue = MessageQueue::open(name, &OpenOptions::from_flags(flags, mode, attr), &self.config)?;
        let mqd = Mqd(self.next.fetch_add(1, Ordering::Relaxed));
        self.handles.lock()?.insert(mqd, Arc::new(queue));
        Ok(mqd)
    }

    /// Forgets `mqd`. A descriptor whose queue was removed is forgotten too,
    /// but reported as `InvalidHandle`.
    pub fn close(&self, mqd: Mqd) -> Result<()> {
        let queue = self.handles.lock()?.remove(&mqd).ok_or(MqError::InvalidHandle)?;
        queue.release()
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        MessageQueue::unlink(name, &self.config)
    }

    /// The queue behind `mqd`. The table lock is not held while the caller
    /// uses it.
    pub fn get(&self, mqd: Mqd) -> Result<Arc<MessageQueue>> {
        self.handles
            .lock()?
            .get(&mqd)
            .cloned()
            .ok_or(MqError::InvalidHandle)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.handles.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

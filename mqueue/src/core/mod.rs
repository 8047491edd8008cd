use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, warn};

use crate::errors::{lock_err, MqError, Result};

const MAGIC: u64 = 0x6d71_7565_7565_0001;

const STATUS_INIT: u32 = 0;
const STATUS_READY: u32 = 1;
const STATUS_REMOVED: u32 = 2;

const HEADER_SIZE: usize = 64;
// Room for one process-shared primitive; raw_sync reports what it used.
const SYNC_SIZE: usize = 256;
const MUTEX_OFFSET: usize = HEADER_SIZE;
const NOT_EMPTY_OFFSET: usize = MUTEX_OFFSET + SYNC_SIZE;
const NOT_FULL_OFFSET: usize = NOT_EMPTY_OFFSET + SYNC_SIZE;
const STATE_OFFSET: usize = NOT_FULL_OFFSET + SYNC_SIZE;
const STATE_SIZE: usize = 64;
const SLOTS_OFFSET: usize = STATE_OFFSET + STATE_SIZE;

const INIT_POLL: Duration = Duration::from_millis(1);

#[repr(C)]
struct Header {
    magic: AtomicU64,
    status: AtomicU32,
    mode: u32,
    // Written once by the creator before status becomes READY.
    max_msg: u64,
    msg_size: u64,
}

/// Mutable queue state, only touched while the segment mutex is held.
#[repr(C)]
#[derive(Default, Debug)]
pub struct QueueState {
    pub flags: i32,
    pub cur_msgs: u32,
    pub next_seq: u64,
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug)]
pub struct SlotHeader {
    pub seq: u64,
    pub priority: u32,
    pub len: u32,
    pub used: u32,
    _pad: u32,
}

const _: () = assert!(mem::size_of::<Header>() <= HEADER_SIZE);
const _: () = assert!(mem::size_of::<QueueState>() <= STATE_SIZE);

#[inline]
fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[inline]
fn slot_stride(msg_size: usize) -> usize {
    align_up(mem::size_of::<SlotHeader>() + msg_size, 8)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub max_msg: usize,
    pub msg_size: usize,
}

impl Geometry {
    pub fn segment_size(&self) -> usize {
        SLOTS_OFFSET + self.max_msg * slot_stride(self.msg_size)
    }
}

/// Outcome of looking a segment up through its link.
pub enum Lookup {
    Found(Segment),
    Absent,
    /// The link is there but the mapping it names is gone, marked removed
    /// or was never initialised. Carries the os_id read from the link.
    Stale(String),
}

/// One queue object living in named shared memory.
pub struct Segment {
    lock: Box<dyn LockImpl>,
    not_empty: Box<dyn EventImpl>,
    not_full: Box<dyn EventImpl>,
    geometry: Geometry,
    link: PathBuf,
    // Declared last: the primitives above point into this mapping.
    shmem: Shmem,
}

// All access to the mapping goes through the header atomics or the
// process-shared mutex.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates and initialises a new segment behind `link`.
    /// Returns `Ok(None)` when the link already exists.
    pub fn create(link: &Path, geometry: Geometry, mode: u32) -> Result<Option<Segment>> {
        let mut shmem = match ShmemConf::new()
            .size(geometry.segment_size())
            .flink(link)
            .create()
        {
            Ok(v) => v,
            Err(ShmemError::LinkExists) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let base = shmem.as_ptr();
        let (published, lock, not_empty, not_full) = unsafe {
            ptr::write_bytes(base.add(STATE_OFFSET), 0, shmem.len() - STATE_OFFSET);
            let (lock, used) = Mutex::new(base.add(MUTEX_OFFSET), base.add(STATE_OFFSET))
                .map_err(lock_err)?;
            check_sync_size("mutex", used)?;
            let (not_empty, used) = Event::new(base.add(NOT_EMPTY_OFFSET), true).map_err(lock_err)?;
            check_sync_size("event", used)?;
            let (not_full, used) = Event::new(base.add(NOT_FULL_OFFSET), true).map_err(lock_err)?;
            check_sync_size("event", used)?;

            let header = base as *mut Header;
            (*header).mode = mode;
            (*header).max_msg = geometry.max_msg as u64;
            (*header).msg_size = geometry.msg_size as u64;
            (*header).magic.store(MAGIC, Ordering::Relaxed);
            let published = (*header)
                .status
                .compare_exchange(STATUS_INIT, STATUS_READY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            (published, lock, not_empty, not_full)
        };
        // The queue outlives this process until it is removed explicitly.
        shmem.set_owner(false);
        if !published {
            // An opener gave up waiting and reclaimed the name.
            warn!(link = %link.display(), "queue segment reclaimed before it was ready");
            return Ok(None);
        }
        debug!(
            link = %link.display(),
            os_id = shmem.get_os_id(),
            max_msg = geometry.max_msg,
            msg_size = geometry.msg_size,
            "created queue segment"
        );
        Ok(Some(Segment {
            lock,
            not_empty,
            not_full,
            geometry,
            link: link.to_path_buf(),
            shmem,
        }))
    }

    /// Attaches to the segment behind `link`, waiting up to `init_timeout`
    /// for a concurrent creator to finish initialising it.
    ///
    /// A segment still not initialised when the timeout expires belongs to a
    /// creator that died; it is marked removed, its OS object is unlinked and
    /// the lookup reports `Stale` so the name can be reclaimed.
    pub fn open(link: &Path, init_timeout: Duration) -> Result<Lookup> {
        let os_id = match read_link(link)? {
            Some(v) => v,
            None => return Ok(Lookup::Absent),
        };
        // Opened by os_id rather than through the link, so that `Stale`
        // names exactly the object that was tried.
        let mut shmem = match ShmemConf::new().os_id(&os_id).open() {
            Ok(v) => v,
            Err(e) => {
                debug!(link = %link.display(), error = %e, "queue mapping could not be opened");
                return Ok(Lookup::Stale(os_id));
            }
        };
        if shmem.len() < SLOTS_OFFSET {
            return Err(MqError::Logic(format!("segment at {} is too small", link.display())));
        }
        let base = shmem.as_ptr();
        let header = unsafe { &*(base as *const Header) };

        let deadline = Instant::now() + init_timeout;
        let status = loop {
            match header.status.load(Ordering::Acquire) {
                STATUS_INIT if Instant::now() < deadline => thread::sleep(INIT_POLL),
                STATUS_INIT => {
                    if header
                        .status
                        .compare_exchange(STATUS_INIT, STATUS_REMOVED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        warn!(
                            link = %link.display(),
                            timeout = ?init_timeout,
                            "queue segment never became ready, reclaiming it"
                        );
                        // No file link on this mapping: only the OS object goes.
                        shmem.set_owner(true);
                        drop(shmem);
                        return Ok(Lookup::Stale(os_id));
                    }
                }
                s => break s,
            }
        };
        if status == STATUS_REMOVED {
            return Ok(Lookup::Stale(os_id));
        }
        if header.magic.load(Ordering::Relaxed) != MAGIC {
            return Err(MqError::Logic(format!("{} is not a message queue segment", link.display())));
        }
        let geometry = Geometry {
            max_msg: header.max_msg as usize,
            msg_size: header.msg_size as usize,
        };
        if shmem.len() < geometry.segment_size() {
            return Err(MqError::Logic(format!("segment at {} is truncated", link.display())));
        }
        let (lock, not_empty, not_full) = unsafe {
            let (lock, _) = Mutex::from_existing(base.add(MUTEX_OFFSET), base.add(STATE_OFFSET))
                .map_err(lock_err)?;
            let (not_empty, _) = Event::from_existing(base.add(NOT_EMPTY_OFFSET)).map_err(lock_err)?;
            let (not_full, _) = Event::from_existing(base.add(NOT_FULL_OFFSET)).map_err(lock_err)?;
            (lock, not_empty, not_full)
        };
        debug!(link = %link.display(), os_id = shmem.get_os_id(), "attached queue segment");
        Ok(Lookup::Found(Segment {
            lock,
            not_empty,
            not_full,
            geometry,
            link: link.to_path_buf(),
            shmem,
        }))
    }

    /// Deletes the link if it still names `os_id`, as reported by a `Stale`
    /// lookup. A link that has been replaced since is left alone.
    pub fn remove_stale_link(link: &Path, os_id: &str) -> Result<()> {
        if remove_link_if(link, os_id)? {
            warn!(link = %link.display(), os_id, "removed stale queue link");
        }
        Ok(())
    }

    /// Marks the segment removed, wakes every waiter and deletes both the
    /// link and the OS object. Other mappings stay readable but report the
    /// removal.
    pub fn remove(&self) -> Result<()> {
        if self.header().status.swap(STATUS_REMOVED, Ordering::AcqRel) == STATUS_REMOVED {
            return Err(MqError::InvalidHandle);
        }
        self.wake_all();

        let os_id = self.shmem.get_os_id().to_string();
        remove_link_if(&self.link, &os_id)?;
        // A second mapping without a file link, so that dropping it as the
        // owner unlinks only the OS object.
        let mut owner = ShmemConf::new().os_id(&os_id).open()?;
        owner.set_owner(true);
        drop(owner);
        debug!(link = %self.link.display(), os_id = %os_id, "removed queue segment");
        Ok(())
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { &*(self.shmem.as_ptr() as *const Header) }
    }

    pub fn is_live(&self) -> bool {
        self.header().status.load(Ordering::Acquire) == STATUS_READY
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(MqError::InvalidHandle)
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn mode(&self) -> u32 {
        self.header().mode
    }

    /// Takes the segment mutex. Fails with `InvalidHandle` once the segment
    /// has been removed.
    pub fn lock(&self) -> Result<Locked<'_>> {
        self.ensure_live()?;
        let guard = self.lock.lock().map_err(lock_err)?;
        // Removal may have won the race for the mutex.
        self.ensure_live()?;
        let state = *guard as *mut QueueState;
        let slots = unsafe { self.shmem.as_ptr().add(SLOTS_OFFSET) };
        Ok(Locked {
            _guard: guard,
            state,
            slots,
            geometry: self.geometry,
        })
    }

    pub fn signal_not_empty(&self) {
        if let Err(e) = self.not_empty.set(EventState::Signaled) {
            warn!(link = %self.link.display(), error = %e, "failed to signal not_empty");
        }
    }

    pub fn signal_not_full(&self) {
        if let Err(e) = self.not_full.set(EventState::Signaled) {
            warn!(link = %self.link.display(), error = %e, "failed to signal not_full");
        }
    }

    // A timed-out slice is not an error: callers re-check under the lock.
    pub fn wait_not_empty(&self, slice: Duration) {
        let _ = self.not_empty.wait(Timeout::Val(slice));
    }

    pub fn wait_not_full(&self, slice: Duration) {
        let _ = self.not_full.wait(Timeout::Val(slice));
    }

    fn wake_all(&self) {
        self.signal_not_empty();
        self.signal_not_full();
    }
}

/// The os_id stored in `link`, or `None` when there is no link.
fn read_link(link: &Path) -> Result<Option<String>> {
    match fs::read_to_string(link) {
        Ok(v) => Ok(Some(v.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Advisory lock on `<link>.lock`, held while a link is compared and
/// deleted. Creation needs no lock: it only succeeds on an absent link.
struct LinkLock {
    _file: fs::File,
}

impl LinkLock {
    fn acquire(link: &Path) -> Result<LinkLock> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(link.with_extension("lock"))?;
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                // Released when the file is closed.
                return Ok(LinkLock { _file: file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
}

/// Deletes `link` only while it still names `os_id`. Returns whether it did.
fn remove_link_if(link: &Path, os_id: &str) -> Result<bool> {
    let _lock = LinkLock::acquire(link)?;
    match read_link(link)? {
        Some(current) if current == os_id => match fs::remove_file(link) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        },
        _ => Ok(false),
    }
}

fn check_sync_size(what: &str, used: usize) -> Result<()> {
    if used > SYNC_SIZE {
        return Err(MqError::Logic(format!(
            "{} needs {} bytes, only {} reserved",
            what, used, SYNC_SIZE
        )));
    }
    Ok(())
}

/// Exclusive view over the queue state and its slots.
pub struct Locked<'a> {
    _guard: LockGuard<'a>,
    state: *mut QueueState,
    slots: *mut u8,
    geometry: Geometry,
}

impl Locked<'_> {
    pub fn state(&mut self) -> &mut QueueState {
        unsafe { &mut *self.state }
    }

    pub fn slot_count(&self) -> usize {
        self.geometry.max_msg
    }

    pub fn slot_header(&self, index: usize) -> SlotHeader {
        assert!(index < self.geometry.max_msg);
        unsafe { ptr::read(self.slot_ptr(index) as *const SlotHeader) }
    }

    /// Header and payload area of slot `index`.
    pub fn slot_mut(&mut self, index: usize) -> (&mut SlotHeader, &mut [u8]) {
        assert!(index < self.geometry.max_msg);
        unsafe {
            let p = self.slot_ptr(index);
            let header = &mut *(p as *mut SlotHeader);
            let data = std::slice::from_raw_parts_mut(
                p.add(mem::size_of::<SlotHeader>()),
                self.geometry.msg_size,
            );
            (header, data)
        }
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut u8 {
        unsafe { self.slots.add(index * slot_stride(self.geometry.msg_size)) }
    }
}

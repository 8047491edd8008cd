use std::cmp;
use std::time::{Duration, Instant};

use crate::core::Locked;
use crate::errors::{MqError, Result};
use crate::flags::OpenFlags;
use crate::handle::{HandleTable, MessageQueue, Mqd};

/// Upper bound on one sleep of a blocked sender or receiver. State is
/// re-checked after every slice, so removal is noticed even without a wake-up.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// What to do when a send finds the queue full or a receive finds it empty.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    Blocking,
    Until(Instant),
}

impl Wait {
    #[inline]
    fn next_slice(&self, would_block: MqError) -> Result<Duration> {
        match *self {
            Wait::NonBlocking => Err(would_block),
            Wait::Blocking => Ok(WAIT_SLICE),
            Wait::Until(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(MqError::TimedOut)
                } else {
                    Ok(cmp::min(deadline - now, WAIT_SLICE))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub priority: u32,
}

/// Stores `payload` in a free slot. Returns `None` when the queue is full,
/// otherwise whether room is left for another message.
fn enqueue(locked: &mut Locked<'_>, payload: &[u8], priority: u32) -> Result<Option<bool>> {
    let capacity = locked.slot_count();
    if locked.state().cur_msgs as usize >= capacity {
        return Ok(None);
    }
    let free = (0..capacity)
        .find(|&i| locked.slot_header(i).used == 0)
        .ok_or_else(|| MqError::Logic("queue depth and slots disagree".to_string()))?;
    let seq = {
        let state = locked.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    };
    let (header, data) = locked.slot_mut(free);
    data[..payload.len()].copy_from_slice(payload);
    header.seq = seq;
    header.priority = priority;
    header.len = payload.len() as u32;
    header.used = 1;

    let state = locked.state();
    state.cur_msgs += 1;
    Ok(Some((state.cur_msgs as usize) < capacity))
}

/// Takes the highest priority, oldest message and copies at most
/// `buf.len()` bytes of it. Returns `None` when the queue is empty,
/// otherwise (copied length, priority, messages left).
fn dequeue(locked: &mut Locked<'_>, buf: &mut [u8]) -> Result<Option<(usize, u32, bool)>> {
    if locked.state().cur_msgs == 0 {
        return Ok(None);
    }
    let mut best: Option<(usize, u32, u64)> = None;
    for i in 0..locked.slot_count() {
        let h = locked.slot_header(i);
        if h.used == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, prio, seq)) => h.priority > prio || (h.priority == prio && h.seq < seq),
        };
        if better {
            best = Some((i, h.priority, h.seq));
        }
    }
    let (index, priority, _) =
        best.ok_or_else(|| MqError::Logic("queue depth and slots disagree".to_string()))?;

    let (header, data) = locked.slot_mut(index);
    let n = cmp::min(header.len as usize, buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    header.used = 0;
    header.len = 0;

    let state = locked.state();
    state.cur_msgs -= 1;
    Ok(Some((n, priority, state.cur_msgs > 0)))
}

impl MessageQueue {
    /// Enqueues `payload` with `priority`. Either the whole message is queued
    /// or nothing is.
    pub fn send(&self, payload: &[u8], priority: u32, wait: Wait) -> Result<()> {
        if !self.access().can_send() {
            return Err(MqError::InvalidHandle);
        }
        let max = self.segment.geometry().msg_size;
        if payload.len() > max {
            return Err(MqError::PayloadTooLarge { len: payload.len(), max });
        }
        loop {
            let queued = {
                let mut locked = self.segment.lock()?;
                enqueue(&mut locked, payload, priority)?
            };
            if let Some(room_left) = queued {
                self.segment.signal_not_empty();
                if room_left {
                    self.segment.signal_not_full();
                }
                return Ok(());
            }
            let slice = wait.next_slice(MqError::QueueFull)?;
            self.segment.wait_not_full(slice);
        }
    }

    /// Dequeues the highest priority, oldest message into `buf`. A message
    /// longer than `buf` is truncated and still consumed.
    pub fn receive_into(&self, buf: &mut [u8], wait: Wait) -> Result<(usize, u32)> {
        if !self.access().can_receive() {
            return Err(MqError::InvalidHandle);
        }
        loop {
            let taken = {
                let mut locked = self.segment.lock()?;
                dequeue(&mut locked, buf)?
            };
            if let Some((len, priority, more)) = taken {
                self.segment.signal_not_full();
                if more {
                    self.segment.signal_not_empty();
                }
                return Ok((len, priority));
            }
            let slice = wait.next_slice(MqError::QueueEmpty)?;
            self.segment.wait_not_empty(slice);
        }
    }

    pub fn receive(&self, max_len: usize, wait: Wait) -> Result<Message> {
        let mut payload = vec![0u8; cmp::min(max_len, self.segment.geometry().msg_size)];
        let (len, priority) = self.receive_into(&mut payload, wait)?;
        payload.truncate(len);
        Ok(Message { payload, priority })
    }

    pub fn send_timeout(&self, payload: &[u8], priority: u32, deadline: Instant) -> Result<()> {
        self.send(payload, priority, Wait::Until(deadline))
    }

    pub fn receive_timeout(&self, max_len: usize, deadline: Instant) -> Result<Message> {
        self.receive(max_len, Wait::Until(deadline))
    }

    /// Wait policy for descriptor-level calls: non-blocking when this handle
    /// was opened with `NONBLOCK` or the queue flags carry it.
    fn wait_policy(&self, deadline: Option<Instant>) -> Result<Wait> {
        if self.is_nonblocking() || self.attributes()?.flags.contains(OpenFlags::NONBLOCK) {
            return Ok(Wait::NonBlocking);
        }
        Ok(deadline.map_or(Wait::Blocking, Wait::Until))
    }
}

impl HandleTable {
    pub fn send(&self, mqd: Mqd, payload: &[u8], priority: u32) -> Result<()> {
        let queue = self.get(mqd)?;
        let wait = queue.wait_policy(None)?;
        queue.send(payload, priority, wait)
    }

    pub fn timed_send(&self, mqd: Mqd, payload: &[u8], priority: u32, deadline: Instant) -> Result<()> {
        let queue = self.get(mqd)?;
        let wait = queue.wait_policy(Some(deadline))?;
        queue.send(payload, priority, wait)
    }

    pub fn receive(&self, mqd: Mqd, buf: &mut [u8]) -> Result<(usize, u32)> {
        let queue = self.get(mqd)?;
        let wait = queue.wait_policy(None)?;
        queue.receive_into(buf, wait)
    }

    pub fn timed_receive(&self, mqd: Mqd, buf: &mut [u8], deadline: Instant) -> Result<(usize, u32)> {
        let queue = self.get(mqd)?;
        let wait = queue.wait_policy(Some(deadline))?;
        queue.receive_into(buf, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::{tempdir, TempDir};

    use crate::attr::MqAttr;
    use crate::config::QueueConfig;
    use crate::handle::OpenOptions;

    fn queue(dir: &TempDir, attr: MqAttr) -> Result<MessageQueue> {
        let cfg = QueueConfig::with_data_dir(dir.path().to_string_lossy().into_owned());
        MessageQueue::open("transport", &OpenOptions::new().create().attr(attr), &cfg)
    }

    #[test]
    fn round_trip_keeps_payload_and_priority() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(4, 64))?;
        q.send(b"payload", 7, Wait::NonBlocking)?;
        let msg = q.receive(64, Wait::NonBlocking)?;
        assert_eq!(msg, Message { payload: b"payload".to_vec(), priority: 7 });
        q.destroy()
    }

    #[test]
    fn zero_length_message_round_trips() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(4, 64))?;
        q.send(b"", 3, Wait::NonBlocking)?;
        assert_eq!(q.attributes()?.cur_msgs, 1);
        let msg = q.receive(64, Wait::NonBlocking)?;
        assert!(msg.payload.is_empty());
        assert_eq!(msg.priority, 3);
        q.destroy()
    }

    #[test]
    fn higher_priority_first_then_arrival_order() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(8, 16))?;
        q.send(b"A", 1, Wait::NonBlocking)?;
        q.send(b"B", 5, Wait::NonBlocking)?;
        q.send(b"C", 1, Wait::NonBlocking)?;
        let order: Vec<Vec<u8>> = (0..3)
            .map(|_| q.receive(16, Wait::NonBlocking).map(|m| m.payload))
            .collect::<Result<_>>()?;
        assert_eq!(order, vec![b"B".to_vec(), b"A".to_vec(), b"C".to_vec()]);
        q.destroy()
    }

    #[test]
    fn arrival_order_survives_slot_reuse() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(3, 16))?;
        q.send(b"1", 0, Wait::NonBlocking)?;
        q.send(b"2", 0, Wait::NonBlocking)?;
        assert_eq!(q.receive(16, Wait::NonBlocking)?.payload, b"1");
        // Lands in the slot "1" left behind.
        q.send(b"3", 0, Wait::NonBlocking)?;
        q.send(b"4", 0, Wait::NonBlocking)?;
        for expected in [b"2", b"3", b"4"] {
            assert_eq!(q.receive(16, Wait::NonBlocking)?.payload, expected);
        }
        q.destroy()
    }

    #[test]
    fn full_queue_rejects_nonblocking_send_until_drained() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(2, 16))?;
        q.send(b"a", 0, Wait::NonBlocking)?;
        q.send(b"b", 0, Wait::NonBlocking)?;
        assert!(matches!(q.send(b"c", 0, Wait::NonBlocking), Err(MqError::QueueFull)));
        q.receive(16, Wait::NonBlocking)?;
        q.send(b"c", 0, Wait::NonBlocking)?;
        assert_eq!(q.attributes()?.cur_msgs, 2);
        q.destroy()
    }

    #[test]
    fn oversized_payload_leaves_queue_unchanged() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(2, 8))?;
        q.send(&[1u8; 8], 0, Wait::NonBlocking)?;
        let err = q.send(&[1u8; 9], 0, Wait::NonBlocking).unwrap_err();
        assert!(matches!(err, MqError::PayloadTooLarge { len: 9, max: 8 }));
        assert_eq!(q.attributes()?.cur_msgs, 1);
        q.destroy()
    }

    #[test]
    fn empty_queue_rejects_nonblocking_receive() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(2, 8))?;
        assert!(matches!(q.receive(8, Wait::NonBlocking), Err(MqError::QueueEmpty)));
        q.destroy()
    }

    #[test]
    fn short_buffer_truncates_and_consumes() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(2, 16))?;
        q.send(b"truncated", 2, Wait::NonBlocking)?;
        let mut buf = [0u8; 5];
        assert_eq!(q.receive_into(&mut buf, Wait::NonBlocking)?, (5, 2));
        assert_eq!(&buf, b"trunc");
        assert_eq!(q.attributes()?.cur_msgs, 0);
        q.destroy()
    }

    #[test]
    fn receive_times_out_on_empty_queue() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(2, 8))?;
        let start = Instant::now();
        let err = q.receive_timeout(8, start + Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, MqError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(120));
        q.destroy()
    }

    #[test]
    fn send_times_out_on_full_queue() -> Result<()> {
        let dir = tempdir()?;
        let q = queue(&dir, MqAttr::new(1, 8))?;
        q.send(b"x", 0, Wait::NonBlocking)?;
        let err = q.send_timeout(b"y", 0, Instant::now() + Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, MqError::TimedOut));
        q.destroy()
    }

    #[test]
    fn access_mode_is_enforced() -> Result<()> {
        let dir = tempdir()?;
        let cfg = QueueConfig::with_data_dir(dir.path().to_string_lossy().into_owned());
        let rx = MessageQueue::open("modes", &OpenOptions::new().create().read_only(), &cfg)?;
        let tx = MessageQueue::open("modes", &OpenOptions::new().write_only(), &cfg)?;
        assert!(matches!(rx.send(b"x", 0, Wait::NonBlocking), Err(MqError::InvalidHandle)));
        assert!(matches!(tx.receive(8, Wait::NonBlocking), Err(MqError::InvalidHandle)));
        tx.send(b"x", 0, Wait::NonBlocking)?;
        assert_eq!(rx.receive(8, Wait::NonBlocking)?.payload, b"x");
        tx.close()?;
        rx.destroy()
    }

    #[test]
    fn descriptor_calls_follow_queue_nonblock_flag() -> Result<()> {
        let dir = tempdir()?;
        let table = HandleTable::new(QueueConfig::with_data_dir(
            dir.path().to_string_lossy().into_owned(),
        ));
        let attr = MqAttr::new(1, 8);
        let mqd = table.open("flags", OpenFlags::RDWR | OpenFlags::CREAT, 0o600, Some(&attr))?;
        table.setattr(mqd, OpenFlags::NONBLOCK)?;

        let mut buf = [0u8; 8];
        assert!(matches!(table.receive(mqd, &mut buf), Err(MqError::QueueEmpty)));
        table.send(mqd, b"x", 4)?;
        assert!(matches!(table.send(mqd, b"y", 4), Err(MqError::QueueFull)));
        assert_eq!(table.receive(mqd, &mut buf)?, (1, 4));

        table.close(mqd)?;
        table.unlink("flags")
    }

    #[test]
    fn descriptor_timed_calls_wait_until_the_deadline() -> Result<()> {
        let dir = tempdir()?;
        let table = HandleTable::new(QueueConfig::with_data_dir(
            dir.path().to_string_lossy().into_owned(),
        ));
        let attr = MqAttr::new(1, 8);
        let mqd = table.open("timed", OpenFlags::RDWR | OpenFlags::CREAT, 0o600, Some(&attr))?;
        let mut buf = [0u8; 8];

        let start = Instant::now();
        let err = table.timed_receive(mqd, &mut buf, start + Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, MqError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(60));

        table.timed_send(mqd, b"once", 2, Instant::now() + Duration::from_millis(60))?;
        let err = table
            .timed_send(mqd, b"twice", 2, Instant::now() + Duration::from_millis(60))
            .unwrap_err();
        assert!(matches!(err, MqError::TimedOut));
        assert_eq!(table.timed_receive(mqd, &mut buf, Instant::now() + Duration::from_millis(60))?, (4, 2));
        assert_eq!(&buf[..4], b"once");

        // With NONBLOCK set the deadline no longer applies.
        table.setattr(mqd, OpenFlags::NONBLOCK)?;
        let err = table.timed_receive(mqd, &mut buf, Instant::now() + Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, MqError::QueueEmpty));

        table.close(mqd)?;
        table.unlink("timed")
    }
}

//! SysV message queue transport between children and the parent.
//!
//! Every kernel message carries a positive `long` type tag. By convention a
//! child reports under its own pid, so the parent can pull exactly that
//! child's message. Encoded values larger than one kernel message are split
//! into frames that share the tag:
//!
//! ```text
//! +--------------+----------------+----------------------+
//! | mtype: long  | more-flag: u8  | frame bytes ...      |
//! +--------------+----------------+----------------------+
//! ```
//!
//! Frames of one tag are only ever written by one process, and the kernel
//! keeps per-type FIFO order, so the receiver can reassemble without
//! sequence numbers.
//!
//! All syscalls retry on `EINTR`.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::{c_int, c_long, c_void, key_t};
use nix::errno::Errno;
use thiserror::Error;
use tracing::warn;

use crate::config::MIN_MESSAGE_SIZE;
use crate::error::{PoolError, Result};
use crate::wire::{self, Value, WireError};

/// Access mode for the queue and semaphore: owner read/write.
pub(crate) const PERMISSIONS: c_int = 0o600;

const FRAME_LAST: u8 = 0;
const FRAME_MORE: u8 = 1;

/// A SysV IPC key derived with `ftok()` from an existing path and a
/// project byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcKey(key_t);

impl IpcKey {
    pub fn derive(seed: &Path, project: u8) -> Result<Self> {
        let c_path =
            CString::new(seed.as_os_str().as_bytes()).map_err(|_| PoolError::KeyDerivation {
                path: seed.display().to_string(),
                source: Errno::EINVAL,
            })?;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let key = unsafe { libc::ftok(c_path.as_ptr(), c_int::from(project)) };
        if key == -1 {
            return Err(PoolError::KeyDerivation {
                path: seed.display().to_string(),
                source: Errno::last(),
            });
        }
        Ok(Self(key))
    }

    pub fn from_raw(key: key_t) -> Self {
        Self(key)
    }

    pub fn raw(self) -> key_t {
        self.0
    }
}

impl fmt::Display for IpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Transport failure, carrying the OS error where there is one.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to send message (tag {tag}): {errno}")]
    Send { tag: i64, errno: Errno },

    #[error("Failed to receive message (tag {tag}): {errno}")]
    Receive { tag: i64, errno: Errno },

    #[error("Failed to {op} message queue {id}: {errno}")]
    Control {
        op: &'static str,
        id: c_int,
        errno: Errno,
    },

    #[error("Message size {0} cannot carry a frame")]
    MessageSizeTooSmall(usize),

    #[error("Empty frame received (tag {0})")]
    EmptyFrame(i64),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ChannelError {
    /// The raw OS error code, if this failure came from a syscall.
    pub fn code(&self) -> Option<i32> {
        match self {
            ChannelError::Send { errno, .. }
            | ChannelError::Receive { errno, .. }
            | ChannelError::Control { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }

    /// Worth retrying: the queue was momentarily busy or full.
    pub fn is_transient(&self) -> bool {
        matches!(self.code(), Some(c) if c == Errno::EAGAIN as i32 || c == Errno::EINTR as i32)
    }

    /// The queue no longer exists.
    pub fn is_removed(&self) -> bool {
        matches!(self.code(), Some(c) if c == Errno::EIDRM as i32 || c == Errno::EINVAL as i32)
    }
}

type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Occupancy of a queue, from `IPC_STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Messages currently queued (`msg_qnum`).
    pub messages: u64,
    /// Byte capacity of the queue (`msg_qbytes`).
    pub capacity: u64,
}

/// A message queue handle.
///
/// The handle is plain data: copies made by `fork()` address the same
/// kernel queue. Only the creator should call [`Channel::remove`].
#[derive(Debug, Clone)]
pub struct Channel {
    id: c_int,
    key: IpcKey,
    max_message_size: usize,
}

impl Channel {
    /// Create a fresh queue for `key`.
    ///
    /// A queue left behind under the same key by an earlier run is removed
    /// and recreated so no stale reports leak into this run.
    pub fn create(key: IpcKey, max_message_size: usize) -> Result<Self> {
        if max_message_size < MIN_MESSAGE_SIZE {
            return Err(ChannelError::MessageSizeTooSmall(max_message_size).into());
        }
        let setup = |source| PoolError::Setup {
            resource: "message queue",
            source,
        };
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | PERMISSIONS;

        // SAFETY: msgget has no memory-safety preconditions.
        let id = match Errno::result(unsafe { libc::msgget(key.raw(), flags) }) {
            Ok(id) => id,
            Err(Errno::EEXIST) => {
                warn!(%key, "Removing stale message queue from an earlier run");
                let stale = Errno::result(unsafe { libc::msgget(key.raw(), PERMISSIONS) })
                    .map_err(setup)?;
                Errno::result(unsafe { libc::msgctl(stale, libc::IPC_RMID, std::ptr::null_mut()) })
                    .map_err(setup)?;
                Errno::result(unsafe { libc::msgget(key.raw(), flags) }).map_err(setup)?
            }
            Err(errno) => return Err(setup(errno)),
        };

        Ok(Self {
            id,
            key,
            max_message_size,
        })
    }

    /// Whether a queue currently exists for `key`.
    pub fn exists(key: IpcKey) -> bool {
        // SAFETY: msgget without IPC_CREAT only looks the key up.
        unsafe { libc::msgget(key.raw(), 0) != -1 }
    }

    pub fn id(&self) -> c_int {
        self.id
    }

    pub fn key(&self) -> IpcKey {
        self.key
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// A blocking, compressing sender over this queue.
    pub fn sender(&self) -> Sender {
        Sender {
            id: self.id,
            max_message_size: self.max_message_size,
            blocking: true,
            compress: true,
        }
    }

    pub fn receiver(&self) -> Receiver {
        Receiver {
            id: self.id,
            max_message_size: self.max_message_size,
            partial: HashMap::new(),
        }
    }

    pub fn status(&self) -> ChannelResult<ChannelStatus> {
        // SAFETY: msqid_ds is plain old data; all-zero is a valid value.
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: ds is a valid, writable msqid_ds.
            match Errno::result(unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) }) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(ChannelError::Control {
                        op: "stat",
                        id: self.id,
                        errno,
                    });
                }
            }
        }
        Ok(ChannelStatus {
            messages: ds.msg_qnum as u64,
            capacity: ds.msg_qbytes as u64,
        })
    }

    /// Destroy the queue. Pending messages are discarded.
    pub fn remove(&self) -> ChannelResult<()> {
        // SAFETY: IPC_RMID ignores the buffer argument.
        Errno::result(unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) })
            .map(drop)
            .map_err(|errno| ChannelError::Control {
                op: "remove",
                id: self.id,
                errno,
            })
    }
}

/// A `struct msgbuf` laid out as `c_long` words so the text follows the
/// type field with the alignment the kernel expects.
struct MessageBuffer {
    words: Vec<c_long>,
    text_len: usize,
}

const WORD: usize = std::mem::size_of::<c_long>();

impl MessageBuffer {
    fn new(tag: c_long, text_len: usize) -> Self {
        let mut words = vec![0; 1 + text_len.div_ceil(WORD)];
        words[0] = tag;
        Self { words, text_len }
    }

    fn text(&self) -> &[u8] {
        // SAFETY: words has at least text_len bytes after the first word.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().add(1).cast::<u8>(), self.text_len) }
    }

    fn text_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in text(), and we hold the only borrow of words.
        unsafe {
            std::slice::from_raw_parts_mut(self.words.as_mut_ptr().add(1).cast::<u8>(), self.text_len)
        }
    }

    fn as_ptr(&self) -> *const c_void {
        self.words.as_ptr().cast()
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }
}

/// Writing end of a [`Channel`].
#[derive(Debug, Clone)]
pub struct Sender {
    id: c_int,
    max_message_size: usize,
    blocking: bool,
    compress: bool,
}

impl Sender {
    /// With blocking off, a full queue fails with `EAGAIN` instead of waiting.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Encode `value` and send it under `tag`.
    pub fn push(&self, tag: i64, value: &Value) -> ChannelResult<()> {
        let bytes = wire::encode(value, self.compress)?;
        self.push_bytes(tag, &bytes)
    }

    /// Send raw bytes under `tag`, split into as many frames as needed.
    pub fn push_bytes(&self, tag: i64, bytes: &[u8]) -> ChannelResult<()> {
        if tag <= 0 {
            return Err(ChannelError::Send {
                tag,
                errno: Errno::EINVAL,
            });
        }
        let frame_len = self.max_message_size - 1;
        if bytes.is_empty() {
            return self.send_frame(tag, FRAME_LAST, &[]);
        }
        let mut frames = bytes.chunks(frame_len).peekable();
        while let Some(frame) = frames.next() {
            let flag = if frames.peek().is_some() {
                FRAME_MORE
            } else {
                FRAME_LAST
            };
            self.send_frame(tag, flag, frame)?;
        }
        Ok(())
    }

    fn send_frame(&self, tag: i64, flag: u8, body: &[u8]) -> ChannelResult<()> {
        let mut message = MessageBuffer::new(tag as c_long, 1 + body.len());
        let text = message.text_mut();
        text[0] = flag;
        text[1..].copy_from_slice(body);

        let flags = if self.blocking { 0 } else { libc::IPC_NOWAIT };
        loop {
            // SAFETY: message holds a type word followed by text_len bytes.
            let rc =
                unsafe { libc::msgsnd(self.id, message.as_ptr(), message.text_len, flags) };
            match Errno::result(rc) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(ChannelError::Send { tag, errno }),
            }
        }
    }
}

/// Reading end of a [`Channel`].
///
/// Keeps partially received multi-frame messages per tag, so a non-blocking
/// pull can return `None` midway and resume on the next call.
#[derive(Debug)]
pub struct Receiver {
    id: c_int,
    max_message_size: usize,
    partial: HashMap<i64, Vec<u8>>,
}

impl Receiver {
    /// Largest kernel message accepted. Must match the sender's size or
    /// larger frames fail with `E2BIG`.
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Block until a complete message for `tag` arrives.
    pub fn pull(&mut self, tag: i64) -> ChannelResult<Value> {
        loop {
            if let Some(value) = self.receive(tag, true)? {
                return Ok(value);
            }
        }
    }

    /// Return a complete message for `tag` if one is already queued.
    pub fn try_pull(&mut self, tag: i64) -> ChannelResult<Option<Value>> {
        self.receive(tag, false)
    }

    /// Whether frames for `tag` have been received but not completed.
    pub fn is_pending(&self, tag: i64) -> bool {
        self.partial.contains_key(&tag)
    }

    /// Drop any partial frames for `tag`.
    pub fn discard(&mut self, tag: i64) {
        self.partial.remove(&tag);
    }

    fn receive(&mut self, tag: i64, blocking: bool) -> ChannelResult<Option<Value>> {
        while let Some((flag, body)) = self.receive_frame(tag, blocking)? {
            let buffer = self.partial.entry(tag).or_default();
            buffer.extend_from_slice(&body);
            if flag == FRAME_LAST {
                let bytes = self.partial.remove(&tag).unwrap_or_default();
                return Ok(Some(wire::decode(&bytes)?));
            }
        }
        Ok(None)
    }

    fn receive_frame(&self, tag: i64, blocking: bool) -> ChannelResult<Option<(u8, Vec<u8>)>> {
        let mut message = MessageBuffer::new(0, self.max_message_size);
        let flags = if blocking { 0 } else { libc::IPC_NOWAIT };
        loop {
            // SAFETY: message has room for a type word plus max_message_size bytes.
            let rc = unsafe {
                libc::msgrcv(
                    self.id,
                    message.as_mut_ptr(),
                    self.max_message_size,
                    tag as c_long,
                    flags,
                )
            };
            match Errno::result(rc) {
                Ok(n) => {
                    message.text_len = n as usize;
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ENOMSG) if !blocking => return Ok(None),
                Err(errno) => return Err(ChannelError::Receive { tag, errno }),
            }
        }

        match message.text().split_first() {
            Some((&flag, body)) => Ok(Some((flag, body.to_vec()))),
            None => Err(ChannelError::EmptyFrame(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_MESSAGE_SIZE;

    fn channel(max: usize) -> (tempfile::NamedTempFile, Channel) {
        let seed = tempfile::NamedTempFile::new().unwrap();
        let key = IpcKey::derive(seed.path(), b'm').unwrap();
        (seed, Channel::create(key, max).unwrap())
    }

    #[test]
    fn test_key_derivation_is_stable() {
        let seed = tempfile::NamedTempFile::new().unwrap();
        let a = IpcKey::derive(seed.path(), b'm').unwrap();
        let b = IpcKey::derive(seed.path(), b'm').unwrap();
        let c = IpcKey::derive(seed.path(), b's').unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_derivation_missing_path() {
        let err = IpcKey::derive(Path::new("/no/such/seed"), b'm').unwrap_err();
        assert!(matches!(err, PoolError::KeyDerivation { .. }));
    }

    #[test]
    fn test_push_pull_by_tag() {
        let (_seed, channel) = channel(DEFAULT_MAX_MESSAGE_SIZE);
        let sender = channel.sender();
        let mut receiver = channel.receiver();

        sender.push(11, &Value::from("first")).unwrap();
        sender.push(22, &Value::Int(2)).unwrap();

        // Tag filtering skips over the other tag's message
        assert_eq!(receiver.pull(22).unwrap(), Value::Int(2));
        assert_eq!(receiver.try_pull(22).unwrap(), None);
        assert_eq!(receiver.pull(11).unwrap(), Value::from("first"));

        channel.remove().unwrap();
    }

    #[test]
    fn test_multi_frame_message() {
        let (_seed, channel) = channel(64);
        let sender = channel.sender().with_compression(false);
        let mut receiver = channel.receiver();

        let big = Value::Array((0..200).map(Value::Int).collect());
        sender.push(7, &big).unwrap();
        assert!(channel.status().unwrap().messages > 1);

        assert_eq!(receiver.try_pull(7).unwrap(), Some(big));
        assert!(!receiver.is_pending(7));
        assert_eq!(channel.status().unwrap().messages, 0);

        channel.remove().unwrap();
    }

    #[test]
    fn test_try_pull_on_empty_queue() {
        let (_seed, channel) = channel(DEFAULT_MAX_MESSAGE_SIZE);
        let mut receiver = channel.receiver();
        assert_eq!(receiver.try_pull(99).unwrap(), None);
        channel.remove().unwrap();
    }

    #[test]
    fn test_invalid_tag_is_rejected() {
        let (_seed, channel) = channel(DEFAULT_MAX_MESSAGE_SIZE);
        let err = channel.sender().push(0, &Value::Null).unwrap_err();
        assert_eq!(err.code(), Some(Errno::EINVAL as i32));
        channel.remove().unwrap();
    }

    #[test]
    fn test_stale_queue_is_replaced() {
        let seed = tempfile::NamedTempFile::new().unwrap();
        let key = IpcKey::derive(seed.path(), b'm').unwrap();

        let stale = Channel::create(key, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        stale.sender().push(5, &Value::Int(1)).unwrap();

        let fresh = Channel::create(key, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_ne!(stale.id(), fresh.id());
        assert_eq!(fresh.status().unwrap().messages, 0);

        fresh.remove().unwrap();
        assert!(!Channel::exists(key));
    }

    #[test]
    fn test_operations_after_remove() {
        let (_seed, channel) = channel(DEFAULT_MAX_MESSAGE_SIZE);
        channel.remove().unwrap();

        let err = channel.remove().unwrap_err();
        assert!(err.is_removed());
        let err = channel.receiver().try_pull(1).unwrap_err();
        assert!(err.is_removed());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_non_blocking_send_on_full_queue() {
        let (_seed, channel) = channel(DEFAULT_MAX_MESSAGE_SIZE);
        let sender = channel.sender().with_blocking(false).with_compression(false);
        let capacity = channel.status().unwrap().capacity as usize;

        let payload = vec![0xAB; DEFAULT_MAX_MESSAGE_SIZE - 1];
        let mut result = Ok(());
        for _ in 0..=(capacity / payload.len() + 1) {
            result = sender.push_bytes(3, &payload);
            if result.is_err() {
                break;
            }
        }
        let err = result.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");

        channel.remove().unwrap();
    }
}

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use super::errors::AttachError;
use super::sync::{SharedCondvar, SharedMutex, SharedMutexGuard};

pub const MAX_MESSAGE_SIZE: usize = 1_048_576;
pub const MAX_SENDER_SIZE: usize = 256;

pub const DEFAULT_NAME_PREFIX: &str = "/chatroom-";

// Written by the owner once the lock and signal are constructed.
const READY_MAGIC: u32 = 0x4348_4154;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub name_prefix: String,
    pub attach_timeout_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            attach_timeout_ms: 5_000,
        }
    }
}

impl ShmemConfig {
    fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
}

/// Builds the system-visible name of a room's region.
pub fn region_name(cfg: &ShmemConfig, room_id: &str) -> Result<CString, AttachError> {
    if room_id.is_empty() || room_id.contains('/') {
        return Err(AttachError::InvalidRoomId(room_id.to_string()));
    }
    CString::new(format!("{}{}", cfg.name_prefix, room_id))
        .map_err(|_| AttachError::InvalidRoomId(room_id.to_string()))
}

/// The part of the mailbox that is only touched with `lock` held.
#[repr(C)]
pub struct MailboxState {
    pub sequence: u64,
    pub message_len: usize,
    pub sender_len: usize,
    pub sender: [u8; MAX_SENDER_SIZE],
    pub message: [u8; MAX_MESSAGE_SIZE],
}

impl MailboxState {
    pub fn message(&self) -> &[u8] {
        &self.message[..self.message_len.min(MAX_MESSAGE_SIZE)]
    }

    pub fn sender(&self) -> &[u8] {
        &self.sender[..self.sender_len.min(MAX_SENDER_SIZE)]
    }
}

/// Binary record placed at offset 0 of every room's region.
///
/// Holds no pointers, only the pthread state and plain values, so the same
/// bytes are meaningful at whatever address each process maps them.
#[repr(C)]
pub struct MailboxLayout {
    pub lock: SharedMutex,
    pub signal: SharedCondvar,
    pub ready: AtomicU32,
    state: UnsafeCell<MailboxState>,
}

/// POSIX shared memory object mapped read/write into this process.
///
/// Dropping it unmaps the view; the owner additionally removes the name.
pub struct Region {
    name: CString,
    ptr: NonNull<u8>,
    len: usize,
    owner: bool,
    unlinked: AtomicBool,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[inline]
fn close_fd(fd: libc::c_int) {
    unsafe {
        libc::close(fd);
    }
}

fn map_fd(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
}

fn fd_size(fd: libc::c_int) -> io::Result<usize> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { stat.assume_init() }.st_size as usize)
}

impl Region {
    /// Exclusive create. `Ok(None)` means the name already exists.
    ///
    /// Every failure after `shm_open` closes the descriptor and removes the
    /// name again before returning, preserving the errno of the failed call.
    pub fn create(name: &CString, len: usize) -> Result<Option<Region>, AttachError> {
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Ok(None);
            }
            return Err(AttachError::RegionCreate(err));
        }

        let rollback = |fd: libc::c_int| {
            close_fd(fd);
            unsafe {
                libc::shm_unlink(name.as_ptr());
            }
        };

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            rollback(fd);
            return Err(AttachError::SizeAdjust(err));
        }
        let ptr = match map_fd(fd, len) {
            Ok(v) => v,
            Err(err) => {
                rollback(fd);
                return Err(AttachError::Map(err));
            }
        };
        close_fd(fd);

        Ok(Some(Region {
            name: name.clone(),
            ptr,
            len,
            owner: true,
            unlinked: AtomicBool::new(false),
        }))
    }

    /// Opens a region some other process created, waiting up to `timeout`
    /// for the creator to size it.
    pub fn open(name: &CString, len: usize, timeout: Duration) -> Result<Region, AttachError> {
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(AttachError::RegionOpen(io::Error::last_os_error()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match fd_size(fd) {
                Ok(size) if size >= len => break,
                Ok(_) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Ok(_) => {
                    close_fd(fd);
                    return Err(AttachError::NotReady);
                }
                Err(err) => {
                    close_fd(fd);
                    return Err(AttachError::RegionOpen(err));
                }
            }
        }

        let ptr = match map_fd(fd, len) {
            Ok(v) => v,
            Err(err) => {
                close_fd(fd);
                return Err(AttachError::Map(err));
            }
        };
        close_fd(fd);

        Ok(Region {
            name: name.clone(),
            ptr,
            len,
            owner: false,
            unlinked: AtomicBool::new(false),
        })
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn name(&self) -> &CString {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Removes the name from the namespace if this process owns it.
    /// Mappings stay valid. Safe to call more than once.
    pub fn unlink(&self) {
        if !self.owner || self.unlinked.swap(true, Ordering::SeqCst) {
            return;
        }
        if unsafe { libc::shm_unlink(self.name.as_ptr()) } < 0 {
            warn!("shm_unlink({:?}) failed: {}", self.name, io::Error::last_os_error());
        } else {
            info!("removed shared region {:?}", self.name);
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
        self.unlink();
    }
}

/// A mapped room mailbox, either freshly constructed or attached.
pub struct Mailbox {
    region: Region,
    layout: NonNull<MailboxLayout>,
}

unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub const SIZE: usize = mem::size_of::<MailboxLayout>();

    /// Creates the room and constructs the layout in place.
    /// `Ok(None)` means another process already created it.
    pub fn create(cfg: &ShmemConfig, room_id: &str) -> Result<Option<Mailbox>, AttachError> {
        let name = region_name(cfg, room_id)?;
        let region = match Region::create(&name, Self::SIZE)? {
            Some(v) => v,
            None => return Ok(None),
        };
        // ftruncate zero-fills, so the state already reads as empty.
        let layout = region.as_ptr() as *mut MailboxLayout;
        unsafe {
            SharedMutex::init(ptr::addr_of_mut!((*layout).lock)).map_err(AttachError::LockInit)?;
            SharedCondvar::init(ptr::addr_of_mut!((*layout).signal))
                .map_err(AttachError::LockInit)?;
            (*layout).ready.store(READY_MAGIC, Ordering::Release);
        }
        debug!("constructed mailbox in {:?} ({} bytes)", name, Self::SIZE);
        Ok(Some(Mailbox {
            layout: region.ptr.cast(),
            region,
        }))
    }

    /// Attaches to a room created by another process. No construction.
    pub fn open(cfg: &ShmemConfig, room_id: &str) -> Result<Mailbox, AttachError> {
        let name = region_name(cfg, room_id)?;
        let region = Region::open(&name, Self::SIZE, cfg.attach_timeout())?;
        let layout = region.as_ptr() as *mut MailboxLayout;
        let deadline = Instant::now() + cfg.attach_timeout();
        while unsafe { (*layout).ready.load(Ordering::Acquire) } != READY_MAGIC {
            if Instant::now() >= deadline {
                return Err(AttachError::NotReady);
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(Mailbox {
            layout: region.ptr.cast(),
            region,
        })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    fn layout(&self) -> &MailboxLayout {
        unsafe { self.layout.as_ref() }
    }

    pub fn lock(&self) -> io::Result<MailboxGuard<'_>> {
        let layout = self.layout();
        let lock = unsafe { SharedMutex::from_existing(&layout.lock) };
        let signal = unsafe { SharedCondvar::from_existing(&layout.signal) };
        Ok(MailboxGuard {
            guard: lock.lock()?,
            signal,
            state: layout.state.get(),
        })
    }

    /// Wakes every waiter in every attached process.
    pub fn notify_all(&self) -> io::Result<()> {
        let _guard = self.lock()?;
        self.layout().signal.notify_all()
    }
}

/// Exclusive access to the mailbox state across all attached processes.
pub struct MailboxGuard<'a> {
    guard: SharedMutexGuard<'a>,
    signal: &'a SharedCondvar,
    state: *mut MailboxState,
}

impl MailboxGuard<'_> {
    pub fn wait(&mut self) -> io::Result<()> {
        self.signal.wait(&mut self.guard)
    }

    pub fn notify_all(&self) -> io::Result<()> {
        self.signal.notify_all()
    }
}

impl Deref for MailboxGuard<'_> {
    type Target = MailboxState;

    fn deref(&self) -> &MailboxState {
        unsafe { &*self.state }
    }
}

impl DerefMut for MailboxGuard<'_> {
    fn deref_mut(&mut self) -> &mut MailboxState {
        unsafe { &mut *self.state }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::error::Error;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn unique_room(tag: &str) -> String {
        static ROOM_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "test-{}-{}-{}",
            tag,
            std::process::id(),
            ROOM_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn exists(cfg: &ShmemConfig, room: &str) -> Result<bool, Box<dyn Error>> {
        let name = region_name(cfg, room)?;
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Ok(false);
        }
        close_fd(fd);
        Ok(true)
    }

    #[test]
    fn region_name_rejects_bad_room_ids() {
        let cfg = ShmemConfig::default();
        assert_eq!(region_name(&cfg, "").unwrap_err().code(), -6);
        assert_eq!(region_name(&cfg, "a/b").unwrap_err().code(), -6);
        assert_eq!(region_name(&cfg, "a\0b").unwrap_err().code(), -6);
        assert_eq!(
            region_name(&cfg, "lab").unwrap().to_str().unwrap(),
            "/chatroom-lab"
        );
    }

    #[test]
    fn layout_fits_a_full_message() {
        assert!(Mailbox::SIZE >= MAX_MESSAGE_SIZE + MAX_SENDER_SIZE);
    }

    #[test]
    fn second_create_reports_existing() -> Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig::default();
        let room = unique_room("create");
        let owner = Mailbox::create(&cfg, &room)?.expect("first create owns the room");
        assert!(owner.is_owner());
        assert!(Mailbox::create(&cfg, &room)?.is_none());

        let peer = Mailbox::open(&cfg, &room)?;
        assert!(!peer.is_owner());
        assert_eq!(peer.lock()?.sequence, 0);
        assert_eq!(peer.lock()?.message_len, 0);
        Ok(())
    }

    #[test]
    fn owner_drop_unlinks_but_peer_drop_does_not() -> Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig::default();
        let room = unique_room("unlink");
        let owner = Mailbox::create(&cfg, &room)?.expect("owner");
        let peer = Mailbox::open(&cfg, &room)?;

        drop(peer);
        assert!(exists(&cfg, &room)?);

        drop(owner);
        assert!(!exists(&cfg, &room)?);
        Ok(())
    }

    #[test]
    fn peer_mapping_survives_owner_unlink() -> Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig::default();
        let room = unique_room("survive");
        let owner = Mailbox::create(&cfg, &room)?.expect("owner");
        let peer = Mailbox::open(&cfg, &room)?;
        owner.lock()?.sequence = 7;
        drop(owner);
        assert_eq!(peer.lock()?.sequence, 7);
        Ok(())
    }

    #[test]
    fn failed_resize_removes_created_region() -> Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig::default();
        let room = unique_room("resize");
        let name = region_name(&cfg, &room)?;
        // usize::MAX turns into a negative off_t, which ftruncate rejects.
        let err = Region::create(&name, usize::MAX).err().expect("create must fail");
        assert!(matches!(err, AttachError::SizeAdjust(_)));
        assert_eq!(err.code(), -3);
        assert_eq!(err.os_error().and_then(|e| e.raw_os_error()), Some(libc::EINVAL));
        assert!(!exists(&cfg, &room)?);
        Ok(())
    }

    #[test]
    fn open_missing_room_fails_without_creating() -> Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig::default();
        let room = unique_room("missing");
        let err = Mailbox::open(&cfg, &room).err().expect("open must fail");
        assert_eq!(err.code(), -5);
        assert_eq!(err.os_error().and_then(|e| e.raw_os_error()), Some(libc::ENOENT));
        assert!(!exists(&cfg, &room)?);
        Ok(())
    }

    #[test]
    fn open_unsized_region_times_out() -> Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig {
            attach_timeout_ms: 20,
            ..ShmemConfig::default()
        };
        let room = unique_room("unsized");
        let name = region_name(&cfg, &room)?;
        // A creator that never gets past shm_open.
        let fd = unsafe {
            libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600)
        };
        assert!(fd >= 0);
        close_fd(fd);

        let result = Mailbox::open(&cfg, &room);
        unsafe {
            libc::shm_unlink(name.as_ptr());
        }
        assert_eq!(result.err().map(|e| e.code()), Some(-7));
        Ok(())
    }
}

use std::{fmt, io};

/// Failure of `ChatSession::attach`.
///
/// Every variant maps to a distinct signed status code so that callers which
/// only deal in integers can still tell which step failed. Variants that wrap
/// an `io::Error` carry the platform errno captured right after the failing
/// call.
#[derive(Debug)]
pub enum AttachError {
    AlreadyAttached,
    RegionCreate(io::Error),
    SizeAdjust(io::Error),
    Map(io::Error),
    RegionOpen(io::Error),
    InvalidRoomId(String),
    NotReady,
    LockInit(io::Error),
}

impl AttachError {
    pub const SUCCESS: i32 = 0;

    pub fn code(&self) -> i32 {
        match self {
            AttachError::AlreadyAttached => -1,
            AttachError::RegionCreate(_) => -2,
            AttachError::SizeAdjust(_) => -3,
            AttachError::Map(_) => -4,
            AttachError::RegionOpen(_) => -5,
            AttachError::InvalidRoomId(_) => -6,
            AttachError::NotReady => -7,
            AttachError::LockInit(_) => -8,
        }
    }

    /// Short name of the step that failed, used for diagnostics.
    pub fn step(&self) -> &'static str {
        match self {
            AttachError::AlreadyAttached => "attach",
            AttachError::RegionCreate(_) => "shm_open(O_CREAT|O_EXCL)",
            AttachError::SizeAdjust(_) => "ftruncate",
            AttachError::Map(_) => "mmap",
            AttachError::RegionOpen(_) => "shm_open",
            AttachError::InvalidRoomId(_) => "room id",
            AttachError::NotReady => "wait for owner",
            AttachError::LockInit(_) => "pthread init",
        }
    }

    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            AttachError::RegionCreate(e)
            | AttachError::SizeAdjust(e)
            | AttachError::Map(e)
            | AttachError::RegionOpen(e)
            | AttachError::LockInit(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::AlreadyAttached => write!(f, "session is already attached"),
            AttachError::InvalidRoomId(id) => write!(f, "invalid room id: {:?}", id),
            AttachError::NotReady => write!(f, "room owner did not finish initialization"),
            e => match e.os_error() {
                Some(os) => write!(f, "{}: {}", e.step(), os),
                None => write!(f, "{}", e.step()),
            },
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.os_error() {
            Some(e) => Some(e),
            None => None,
        }
    }
}

#[derive(Debug)]
pub enum ShmemLibError {
    Attach(AttachError),
    Lock(io::Error),
    Io(io::Error),
    NotAttached,
}

impl fmt::Display for ShmemLibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmemLibError::Attach(e) => write!(f, "Attach error: {}", e),
            ShmemLibError::Lock(e) => write!(f, "Lock error: {}", e),
            ShmemLibError::Io(e) => write!(f, "IO error: {}", e),
            ShmemLibError::NotAttached => write!(f, "Session is not attached to a room"),
        }
    }
}

impl std::error::Error for ShmemLibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmemLibError::Attach(e) => Some(e),
            ShmemLibError::Lock(e) => Some(e),
            ShmemLibError::Io(e) => Some(e),
            ShmemLibError::NotAttached => None,
        }
    }
}

impl From<AttachError> for ShmemLibError {
    fn from(err: AttachError) -> Self {
        ShmemLibError::Attach(err)
    }
}

impl From<io::Error> for ShmemLibError {
    fn from(err: io::Error) -> Self {
        ShmemLibError::Io(err)
    }
}

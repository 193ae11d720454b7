use strum::FromRepr;

/// Type alias for syscall result. A syscall returns an `usize` if successful.
pub type SyscallResult = Result<usize, SysError>;
/// Type alias for result of general functions.
pub type SysResult<T> = Result<T, SysError>;

/// Linux specific error codes defined in `errno.h`.
#[derive(FromRepr, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SysError {
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// No such process
    ESRCH = 3,
    /// Interrupted system call
    EINTR = 4,
    /// I/O error
    EIO = 5,
    /// No such device or address
    ENXIO = 6,
    /// Argument list too long
    E2BIG = 7,
    /// Exec format error
    ENOEXEC = 8,
    /// Bad file number
    EBADF = 9,
    /// Try again
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Permission denied
    EACCES = 13,
    /// Bad address
    EFAULT = 14,
    /// File exists
    EEXIST = 17,
    /// No such device
    ENODEV = 19,
    /// Invalid argument
    EINVAL = 22,
    /// File too large
    EFBIG = 27,
    /// No space left on device
    ENOSPC = 28,
    /// Math result not representable
    ERANGE = 34,
    /// No message of desired type
    ENOMSG = 42,
    /// Identifier removed
    EIDRM = 43,
    /// Value too large for defined data type
    EOVERFLOW = 75,
    /// Connection timed out
    ETIMEDOUT = 110,
}

impl SysError {
    /// Returns the errno value.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Folds a syscall result into the numeric return convention: the value on
/// success, the negated errno on failure.
pub fn syscall_ret(res: SyscallResult) -> isize {
    match res {
        Ok(v) => v as isize,
        Err(e) => -(e.code() as isize),
    }
}

use std::fmt;

/// Network-specific error type for all kernel-facing operations
#[derive(Debug)]
pub enum NetworkError {
    /// Kernel rejected a netlink request. `errno` is the positive errno value.
    Kernel { op: String, errno: i32 },
    /// Netlink transport or decode failure (no errno available)
    Netlink(String),
    /// System I/O error
    Io(std::io::Error),
    /// Input validation failed
    Validation(String),
    /// Operation timed out
    Timeout(String),
    /// Resource not found (interface, address, route, ...)
    NotFound(String),
    /// Namespace operation failed
    Namespace(String),
}

impl NetworkError {
    /// Map an rtnetlink failure to a typed error, keeping the errno so callers
    /// can tell an idempotent EEXIST/ENOENT apart from a real failure.
    pub fn netlink(op: impl Into<String>, err: rtnetlink::Error) -> Self {
        let op = op.into();
        match err {
            rtnetlink::Error::NetlinkError(msg) if msg.raw_code() != 0 => NetworkError::Kernel {
                op,
                errno: -msg.raw_code(),
            },
            other => NetworkError::Netlink(format!("{}: {}", op, other)),
        }
    }

    pub fn kernel(op: impl Into<String>, errno: i32) -> Self {
        NetworkError::Kernel {
            op: op.into(),
            errno,
        }
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            NetworkError::Kernel { errno, .. } => Some(*errno),
            NetworkError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// EEXIST: the object is already present.
    pub fn is_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// ENOENT/ESRCH/ENODEV (or an explicit NotFound): the object is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetworkError::NotFound(_))
            || matches!(
                self.errno(),
                Some(libc::ENOENT) | Some(libc::ESRCH) | Some(libc::ENODEV)
            )
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Kernel { op, errno } => write!(
                f,
                "{}: {}",
                op,
                std::io::Error::from_raw_os_error(*errno)
            ),
            NetworkError::Netlink(msg) => write!(f, "netlink error: {}", msg),
            NetworkError::Io(e) => write!(f, "io error: {}", e),
            NetworkError::Validation(msg) => write!(f, "validation error: {}", msg),
            NetworkError::Timeout(msg) => write!(f, "timeout: {}", msg),
            NetworkError::NotFound(msg) => write!(f, "not found: {}", msg),
            NetworkError::Namespace(msg) => write!(f, "namespace error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_idempotent_errnos() {
        assert!(NetworkError::kernel("add route", libc::EEXIST).is_exists());
        assert!(NetworkError::kernel("del rule", libc::ENOENT).is_not_found());
        assert!(NetworkError::kernel("del route", libc::ESRCH).is_not_found());
        assert!(NetworkError::NotFound("link eth9".into()).is_not_found());

        let perm = NetworkError::kernel("add route", libc::EPERM);
        assert!(!perm.is_exists());
        assert!(!perm.is_not_found());
    }

    #[test]
    fn kernel_error_display_names_operation() {
        let e = NetworkError::kernel("add rule to 10.0.0.1/32 table 100", libc::EPERM);
        let text = e.to_string();
        assert!(text.starts_with("add rule to 10.0.0.1/32 table 100: "));
    }
}

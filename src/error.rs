use std::io;

/// Formats a kernel I/O error the way socket observers see it: the POSIX
/// mnemonic, the error number and the canonical description, in one line.
///
/// # Examples
///
/// ```
/// use kestrel_io::posix_error;
///
/// let error = std::io::Error::from_raw_os_error(libc::EPIPE);
/// assert_eq!(posix_error(&error), "POSIX error EPIPE(32): Broken pipe.");
/// ```
pub fn posix_error(error: &io::Error) -> String {
    match error.raw_os_error() {
        Some(code) => match posix_error_description(code) {
            Some((name, description)) => {
                format!("POSIX error {name}({code}): {description}.")
            }
            None => format!("POSIX error ({code}): {error}."),
        },
        None => format!("{error}."),
    }
}

fn posix_error_description(code: i32) -> Option<(&'static str, &'static str)> {
    let entry = match code {
        libc::EPERM => ("EPERM", "Operation not permitted"),
        libc::ENOENT => ("ENOENT", "No such file or directory"),
        libc::EINTR => ("EINTR", "Interrupted system call"),
        libc::EIO => ("EIO", "Input/output error"),
        libc::EBADF => ("EBADF", "Bad file descriptor"),
        libc::EAGAIN => ("EAGAIN/EWOULDBLOCK", "Resource temporarily unavailable"),
        libc::ENOMEM => ("ENOMEM", "Cannot allocate memory"),
        libc::EACCES => ("EACCES", "Permission denied"),
        libc::EFAULT => ("EFAULT", "Bad address"),
        libc::EBUSY => ("EBUSY", "Device or resource busy"),
        libc::EEXIST => ("EEXIST", "File exists"),
        libc::ENODEV => ("ENODEV", "No such device"),
        libc::EINVAL => ("EINVAL", "Invalid argument"),
        libc::ENFILE => ("ENFILE", "Too many open files in system"),
        libc::EMFILE => ("EMFILE", "Too many open files"),
        libc::ENOSPC => ("ENOSPC", "No space left on device"),
        libc::EPIPE => ("EPIPE", "Broken pipe"),
        libc::ENAMETOOLONG => ("ENAMETOOLONG", "File name too long"),
        libc::ENOSYS => ("ENOSYS", "Function not implemented"),
        libc::ENOTSOCK => ("ENOTSOCK", "Socket operation on non-socket"),
        libc::EDESTADDRREQ => ("EDESTADDRREQ", "Destination address required"),
        libc::EMSGSIZE => ("EMSGSIZE", "Message too long"),
        libc::EPROTOTYPE => ("EPROTOTYPE", "Protocol wrong type for socket"),
        libc::ENOPROTOOPT => ("ENOPROTOOPT", "Protocol not available"),
        libc::EPROTONOSUPPORT => ("EPROTONOSUPPORT", "Protocol not supported"),
        libc::ESOCKTNOSUPPORT => ("ESOCKTNOSUPPORT", "Socket type not supported"),
        libc::EOPNOTSUPP => ("EOPNOTSUPP", "Operation not supported"),
        libc::EPFNOSUPPORT => ("EPFNOSUPPORT", "Protocol family not supported"),
        libc::EAFNOSUPPORT => (
            "EAFNOSUPPORT",
            "Address family not supported by protocol",
        ),
        libc::EADDRINUSE => ("EADDRINUSE", "Address already in use"),
        libc::EADDRNOTAVAIL => ("EADDRNOTAVAIL", "Cannot assign requested address"),
        libc::ENETDOWN => ("ENETDOWN", "Network is down"),
        libc::ENETUNREACH => ("ENETUNREACH", "Network is unreachable"),
        libc::ENETRESET => ("ENETRESET", "Network dropped connection on reset"),
        libc::ECONNABORTED => ("ECONNABORTED", "Software caused connection abort"),
        libc::ECONNRESET => ("ECONNRESET", "Connection reset by peer"),
        libc::ENOBUFS => ("ENOBUFS", "No buffer space available"),
        libc::EISCONN => ("EISCONN", "Transport endpoint is already connected"),
        libc::ENOTCONN => ("ENOTCONN", "Transport endpoint is not connected"),
        libc::ESHUTDOWN => (
            "ESHUTDOWN",
            "Cannot send after transport endpoint shutdown",
        ),
        libc::ETIMEDOUT => ("ETIMEDOUT", "Connection timed out"),
        libc::ECONNREFUSED => ("ECONNREFUSED", "Connection refused"),
        libc::EHOSTDOWN => ("EHOSTDOWN", "Host is down"),
        libc::EHOSTUNREACH => ("EHOSTUNREACH", "No route to host"),
        libc::EALREADY => ("EALREADY", "Operation already in progress"),
        libc::EINPROGRESS => ("EINPROGRESS", "Operation now in progress"),
        libc::ECANCELED => ("ECANCELED", "Operation canceled"),
        _ => return None,
    };
    Some(entry)
}

#[cfg(test)]
mod test {
    use super::posix_error;
    use std::io;

    #[test]
    fn known_errors_carry_mnemonic_and_number() {
        let error = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(
            posix_error(&error),
            "POSIX error ECONNREFUSED(111): Connection refused."
        );

        let error = io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(
            posix_error(&error),
            "POSIX error EAGAIN/EWOULDBLOCK(11): Resource temporarily unavailable."
        );
    }

    #[test]
    fn unknown_os_errors_fall_back_to_the_number() {
        let error = io::Error::from_raw_os_error(4095);
        assert!(posix_error(&error).starts_with("POSIX error (4095):"));
    }

    #[test]
    fn non_os_errors_fall_back_to_display() {
        let error = io::Error::new(io::ErrorKind::Other, "name lookup failed");
        assert_eq!(posix_error(&error), "name lookup failed.");
    }
}

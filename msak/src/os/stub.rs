//! Fallback concretions for platforms without TCP kernel introspection
// (c) 2025 Ross Younger

use std::os::fd::BorrowedFd;

use super::{CcInfo, Error, TcpInfo};

pub(super) fn set_congestion_control(_fd: BorrowedFd<'_>, _name: &str) -> Result<(), Error> {
    Err(Error::Unsupported)
}

pub(super) fn get_congestion_control(_fd: BorrowedFd<'_>) -> Result<String, Error> {
    Err(Error::Unsupported)
}

pub(super) fn tcp_info(_fd: BorrowedFd<'_>) -> Result<TcpInfo, Error> {
    Err(Error::Unsupported)
}

pub(super) fn bbr_info(_fd: BorrowedFd<'_>) -> Result<CcInfo, Error> {
    Err(Error::Unsupported)
}

pub(super) fn socket_cookie(_fd: BorrowedFd<'_>) -> Result<u64, Error> {
    Err(Error::Unsupported)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsFd as _;

    #[test]
    fn everything_reports_unsupported() {
        let sock = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(matches!(
            get_congestion_control(sock.as_fd()),
            Err(Error::Unsupported)
        ));
        assert!(matches!(tcp_info(sock.as_fd()), Err(Error::Unsupported)));
        assert!(matches!(bbr_info(sock.as_fd()), Err(Error::Unsupported)));
        assert!(matches!(socket_cookie(sock.as_fd()), Err(Error::Unsupported)));
    }
}

//! Live capture through a Linux `AF_PACKET` raw socket.
//!
//! Requires `CAP_NET_RAW`. The socket carries a receive timeout so the reader
//! thread returns to its stop-flag check at least every
//! [`CAPTURE_POLL_TIMEOUT_MS`].

use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvfrom, setsockopt, socket, sockopt, AddressFamily, LinkAddr, SockFlag, SockProtocol,
    SockType,
};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::capture::packet::{LinkType, RawPacket};
use crate::capture::{CaptureError, PacketSource, Poll};
use crate::config::{unix_now, CAPTURE_POLL_TIMEOUT_MS, CAPTURE_SNAPLEN};

const ARPHRD_ETHER: u16 = 1;
const ARPHRD_LOOPBACK: u16 = 772;
const ARPHRD_NONE: u16 = 0xFFFE;
const PACKET_OUTGOING: u8 = 4;

pub struct RawSocketSource {
    fd: OwnedFd,
    iface: Option<String>,
    ifindex: Option<usize>,
    buf: Vec<u8>,
}

impl RawSocketSource {
    /// Open a raw socket on `iface`, or on every interface when `None`.
    pub fn open(iface: Option<&str>) -> Result<Self, CaptureError> {
        let ifindex = match iface {
            Some(name) => Some(
                nix::net::if_::if_nametoindex(name)
                    .map_err(|_| CaptureError::InterfaceNotFound(name.to_string()))?
                    as usize,
            ),
            None => None,
        };

        let fd = socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::EthAll,
        )
        .map_err(|errno| match errno {
            Errno::EPERM | Errno::EACCES => {
                CaptureError::Permission(format!("opening raw socket: {errno}"))
            }
            other => CaptureError::Io(other.into()),
        })?;

        let timeout = TimeVal::milliseconds(CAPTURE_POLL_TIMEOUT_MS as i64);
        setsockopt(&fd, sockopt::ReceiveTimeout, &timeout)
            .map_err(|errno| CaptureError::Io(errno.into()))?;

        Ok(Self {
            fd,
            iface: iface.map(str::to_string),
            ifindex,
            buf: vec![0u8; CAPTURE_SNAPLEN],
        })
    }

    /// Map the hardware type of a frame to the framing the decoder expects.
    ///
    /// Loopback frames are seen twice (outgoing and incoming); only the
    /// incoming copy is kept.
    fn frame_link(addr: &LinkAddr) -> Option<LinkType> {
        match addr.hatype() {
            ARPHRD_ETHER => Some(LinkType::Ethernet),
            ARPHRD_LOOPBACK if addr.pkttype() == PACKET_OUTGOING => None,
            ARPHRD_LOOPBACK => Some(LinkType::Ethernet),
            ARPHRD_NONE => Some(LinkType::RawIp),
            _ => None,
        }
    }
}

impl PacketSource for RawSocketSource {
    fn describe(&self) -> String {
        match &self.iface {
            Some(name) => format!("live capture on {name}"),
            None => "live capture on all interfaces".to_string(),
        }
    }

    fn poll_packet(&mut self) -> Result<Poll, CaptureError> {
        let (len, addr) = match recvfrom::<LinkAddr>(self.fd.as_raw_fd(), &mut self.buf) {
            Ok(received) => received,
            Err(Errno::EAGAIN | Errno::EINTR) => return Ok(Poll::Idle),
            Err(errno) => return Err(CaptureError::Io(errno.into())),
        };
        let timestamp = unix_now();

        let Some(addr) = addr else {
            return Ok(Poll::Idle);
        };
        if self.ifindex.is_some_and(|idx| idx != addr.ifindex()) {
            return Ok(Poll::Idle);
        }
        let Some(link) = Self::frame_link(&addr) else {
            return Ok(Poll::Idle);
        };

        Ok(Poll::Packet(RawPacket {
            timestamp,
            link,
            data: self.buf[..len].to_vec(),
            wire_len: len as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_is_reported() {
        let err = RawSocketSource::open(Some("nonexistent-if0")).err().unwrap();
        assert!(matches!(err, CaptureError::InterfaceNotFound(name) if name == "nonexistent-if0"));
    }
}

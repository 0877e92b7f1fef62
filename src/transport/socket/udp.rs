//! Datagram sockets the transport can run on.

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;

/// A datagram socket shared between the IO thread and senders.
///
/// `recv_from` must not block, returning [io::ErrorKind::WouldBlock] when empty.
pub trait Udp: Debug + Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub mod real {
    use super::*;

    #[derive(Debug)]
    pub struct UdpSocket(pub(crate) std::net::UdpSocket);

    impl UdpSocket {
        pub fn bind(addr: SocketAddr) -> io::Result<Box<Self>> {
            let socket = std::net::UdpSocket::bind(addr)?;
            socket.set_nonblocking(true)?;

            Ok(Box::new(Self(socket)))
        }
    }

    impl Udp for UdpSocket {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.0.recv_from(buf)
        }
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.0.send_to(buf, addr)
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.0.local_addr()
        }
    }
}

/// In-memory sockets delivering datagrams within the process.
pub mod sim {
    pub use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::net::Ipv4Addr;
    use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

    use rand::Rng;

    type ChannelMessage = (Box<[u8]>, SocketAddr);
    type Channels = HashMap<SocketAddr, VecDeque<ChannelMessage>>;

    static CHANNELS: OnceLock<Mutex<Channels>> = OnceLock::new();

    fn channels() -> MutexGuard<'static, Channels> {
        CHANNELS
            .get_or_init(|| Mutex::new(Default::default()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[derive(Debug)]
    pub struct UdpSocket(SocketAddr);

    impl UdpSocket {
        /// Bind to a random unused public-looking address.
        pub fn bind() -> io::Result<Box<Self>> {
            let mut rng = rand::thread_rng();

            loop {
                let address = SocketAddr::from((
                    Ipv4Addr::new(rng.gen_range(11..=99), rng.gen(), rng.gen(), rng.gen()),
                    rng.gen_range(1024..=u16::MAX),
                ));

                if let Ok(socket) = Self::bind_addr(address) {
                    return Ok(socket);
                }
            }
        }

        /// Bind to an explicit address, failing if it is already taken.
        pub fn bind_addr(address: SocketAddr) -> io::Result<Box<Self>> {
            let mut channels = channels();
            if channels.contains_key(&address) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "udp::sim::UdpSocket address in use",
                ));
            }
            channels.insert(address, VecDeque::new());

            Ok(Box::new(Self(address)))
        }
    }

    impl Drop for UdpSocket {
        fn drop(&mut self) {
            channels().remove(&self.0);
        }
    }

    impl Udp for UdpSocket {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut channels = channels();
            let channel = channels
                .get_mut(&self.0)
                .ok_or_else(|| io::Error::other("udp::sim::UdpSocket messages queue dropped"))?;

            if let Some((message, from)) = channel.pop_front() {
                let size = message.len().min(buf.len());
                buf[..size].copy_from_slice(&message[..size]);

                Ok((size, from))
            } else {
                Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "udp::sim::UdpSocket empty",
                ))
            }
        }
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            if let Some(channel) = channels().get_mut(&addr) {
                channel.push_back((buf.to_vec().into_boxed_slice(), self.0));
            } else {
                // UDP packet sent to the void.
            }

            Ok(buf.len())
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.0)
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn fifo_delivery() {
            let a = UdpSocket::bind().unwrap();
            let b = UdpSocket::bind().unwrap();

            a.send_to(b"one", b.local_addr().unwrap()).unwrap();
            a.send_to(b"two", b.local_addr().unwrap()).unwrap();

            let mut buf = [0u8; 16];
            let (size, from) = b.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..size], b"one");
            assert_eq!(from, a.local_addr().unwrap());

            let (size, _) = b.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..size], b"two");

            assert_eq!(
                b.recv_from(&mut buf).unwrap_err().kind(),
                io::ErrorKind::WouldBlock
            );
        }

        #[test]
        fn address_in_use() {
            let a = UdpSocket::bind().unwrap();

            assert!(UdpSocket::bind_addr(a.local_addr().unwrap()).is_err());
        }
    }
}

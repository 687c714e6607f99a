//! SSDP presence announcements
//!
//! Nodes advertise themselves with `NOTIFY * HTTP/1.1` datagrams on the SSDP
//! multicast group. Only `ssdp:alive` notifications are turned into
//! [`Announcement`]s; byebye messages and M-SEARCH traffic are ignored.

use super::DiscoveryError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub const SSDP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

const MAX_DATAGRAM: usize = 2048;
const RECEIVE_BACKOFF: Duration = Duration::from_millis(200);

/// An `ssdp:alive` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// IP of the announcing node, without port
    pub address: String,
    pub server: String,
    pub usn: String,
    pub location: String,
    pub nt: String,
    pub max_age: Option<u32>,
}

impl Announcement {
    /// Minimal announcement from `address` with the given `SERVER` banner
    pub fn new(address: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server: server.into(),
            usn: String::new(),
            location: String::new(),
            nt: String::new(),
            max_age: None,
        }
    }
}

/// Parses a NOTIFY datagram received from `from`
///
/// Returns `None` for anything that is not an `ssdp:alive` notification.
pub fn parse_alive(datagram: &[u8], from: SocketAddr) -> Option<Announcement> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));

    let request_line = lines.next()?.trim();
    if !request_line.to_ascii_uppercase().starts_with("NOTIFY ") {
        return None;
    }

    let mut announcement = Announcement::new(from.ip().to_string(), "");
    let mut alive = false;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_uppercase().as_str() {
            "NTS" => alive = value.eq_ignore_ascii_case("ssdp:alive"),
            "SERVER" => announcement.server = value.to_string(),
            "USN" => announcement.usn = value.to_string(),
            "LOCATION" => announcement.location = value.to_string(),
            "NT" => announcement.nt = value.to_string(),
            "CACHE-CONTROL" => announcement.max_age = parse_max_age(value),
            _ => {}
        }
    }

    alive.then_some(announcement)
}

fn parse_max_age(value: &str) -> Option<u32> {
    value.split(',').find_map(|directive| {
        let (key, age) = directive.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("max-age") {
            age.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Binds a socket on the SSDP port and joins the multicast group
///
/// Address reuse is enabled so other SSDP agents on the host keep working.
pub fn bind_multicast() -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(DiscoveryError::Bind)?;
    socket.set_reuse_address(true).map_err(DiscoveryError::Bind)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(DiscoveryError::Bind)?;
    socket.set_nonblocking(true).map_err(DiscoveryError::Bind)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
    socket
        .bind(&SocketAddr::V4(bind_addr).into())
        .map_err(DiscoveryError::Bind)?;
    socket
        .join_multicast_v4(&SSDP_MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)
        .map_err(DiscoveryError::Join)?;

    UdpSocket::from_std(socket.into()).map_err(DiscoveryError::Bind)
}

/// Reads datagrams until cancelled, forwarding every alive announcement
pub fn spawn_reader(
    socket: UdpSocket,
    announcements: mpsc::Sender<Announcement>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => {
                        warn!("SSDP receive failed, retrying: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                        }
                    }
                    Err(e) => {
                        error!("SSDP socket failed, discovery stops: {}", e);
                        break;
                    }
                },
            };

            let Some(announcement) = parse_alive(&buf[..len], from) else {
                trace!("Ignoring SSDP datagram from {}", from);
                continue;
            };

            if announcements.send(announcement).await.is_err() {
                break;
            }
        }
        debug!("SSDP reader stopped");
    })
}

/// Errors after which the socket is still usable
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from() -> SocketAddr {
        "192.168.1.42:1900".parse().unwrap()
    }

    #[test]
    fn test_parse_alive() {
        let datagram = "NOTIFY * HTTP/1.1\r\n\
            HOST: 239.255.255.250:1900\r\n\
            CACHE-CONTROL: max-age=1800\r\n\
            LOCATION: http://192.168.1.42/api/conn\r\n\
            NT: urn:moody:device:sensor:1\r\n\
            NTS: ssdp:alive\r\n\
            SERVER: Arduino/1.0 UPnP/1.1 moody/0.1\r\n\
            USN: uuid:1234::urn:moody:device:sensor:1\r\n\r\n";

        let announcement = parse_alive(datagram.as_bytes(), from()).unwrap();
        assert_eq!(announcement.address, "192.168.1.42");
        assert_eq!(announcement.server, "Arduino/1.0 UPnP/1.1 moody/0.1");
        assert_eq!(announcement.location, "http://192.168.1.42/api/conn");
        assert_eq!(announcement.nt, "urn:moody:device:sensor:1");
        assert_eq!(announcement.max_age, Some(1800));
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let datagram = "notify * HTTP/1.1\nnts: ssdp:alive\nServer: Arduino\n\n";
        let announcement = parse_alive(datagram.as_bytes(), from()).unwrap();
        assert_eq!(announcement.server, "Arduino");
    }

    #[test]
    fn test_ignores_byebye_and_search() {
        let byebye = "NOTIFY * HTTP/1.1\r\nNTS: ssdp:byebye\r\nSERVER: Arduino\r\n\r\n";
        assert!(parse_alive(byebye.as_bytes(), from()).is_none());

        let search = "M-SEARCH * HTTP/1.1\r\nMAN: \"ssdp:discover\"\r\nST: ssdp:all\r\n\r\n";
        assert!(parse_alive(search.as_bytes(), from()).is_none());

        assert!(parse_alive(&[0xff, 0xfe, 0x00], from()).is_none());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test]
    async fn test_reader_forwards_alive_and_stops_on_cancel() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let reader = spawn_reader(socket, tx, cancel.clone());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"M-SEARCH * HTTP/1.1\r\nST: ssdp:all\r\n\r\n", target)
            .await
            .unwrap();
        sender
            .send_to(b"NOTIFY * HTTP/1.1\r\nNTS: ssdp:alive\r\nSERVER: Arduino\r\n\r\n", target)
            .await
            .unwrap();

        let announcement = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announcement.address, "127.0.0.1");
        assert_eq!(announcement.server, "Arduino");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
    }
}

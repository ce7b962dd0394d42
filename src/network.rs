//! The network gateway: a single-task reactor owning every socket.
//!
//! All sockets live inside one service loop. Callers create, write to and
//! close them purely by sending [`NetworkRequest`] messages on the gateway's
//! bus; the loop performs the non-blocking I/O and answers with
//! [`NetworkEvent`]s on the response bus registered at create time. State is
//! touched by the loop alone, so no socket record needs a lock.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use futures::{
    future::{abortable, Aborted, BoxFuture, Either},
    stream::{FuturesUnordered, StreamExt},
};
use tokio::{
    io::Ready,
    net::{TcpSocket, TcpStream, UdpSocket},
};
use tracing::{debug, info_span, trace, Instrument};

use self::entry::{NetworkEntry, Socket, StreamBuf};
use crate::{
    bus::{self, Bus, Inbox},
    interfaces,
    util::AbortOnDropHandle,
};

mod entry;
mod messages;

pub use messages::{NetworkEvent, NetworkRequest, SocketId};

/// Scratch read buffer size, enough for a maximum size UDP payload.
const READ_BUFFER_SIZE: usize = 65535;

/// Handle to a running network gateway.
///
/// The service task is aborted when the handle is dropped. Sending
/// [`NetworkRequest::Kill`] shuts it down gracefully instead: every remaining
/// socket is closed and reported before the loop exits.
#[derive(Debug)]
pub struct NetworkGateway {
    bus: Bus<NetworkRequest>,
    _service_handle: AbortOnDropHandle<()>,
}

impl NetworkGateway {
    /// Spawns the service loop and returns a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = bus::channel();
        let service = Service {
            rx,
            entries: HashMap::new(),
            connects: FuturesUnordered::new(),
            next_id: 0,
            scratch: vec![0; READ_BUFFER_SIZE],
        };
        let handle = tokio::spawn(
            async move { service.run().await }.instrument(info_span!("network.gateway")),
        );
        NetworkGateway {
            bus: tx,
            _service_handle: handle.into(),
        }
    }

    /// The gateway's request bus.
    pub fn bus(&self) -> Bus<NetworkRequest> {
        self.bus.clone()
    }
}

/// Resolved TCP connect attempt, delivered back into the service loop.
/// `Err(Aborted)` means the entry was closed while the connect was in
/// flight and the socket has already been released.
type ConnectFut = BoxFuture<'static, (SocketId, Result<io::Result<TcpStream>, Aborted>)>;

struct Service {
    /// Request inbox. The service stops when all senders are gone.
    rx: Inbox<NetworkRequest>,
    entries: HashMap<SocketId, NetworkEntry>,
    /// In-flight TCP connects. A resolved stream is installed on its entry,
    /// or dropped if the entry was closed in the meantime.
    connects: FuturesUnordered<ConnectFut>,
    next_id: u64,
    /// Reused for every read; contents are copied out before they escape.
    scratch: Vec<u8>,
}

impl Service {
    async fn run(mut self) {
        debug!("gateway starting");
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: msg {msg:?}");
                    match msg {
                        Some(NetworkRequest::Kill) => {
                            debug!("kill requested");
                            break;
                        }
                        Some(msg) => self.handle_msg(msg),
                        None => {
                            debug!("request bus dropped, shutting down");
                            break;
                        }
                    }
                }
                Some((id, res)) = self.connects.next() => {
                    match res {
                        Ok(res) => {
                            trace!("tick: connect resolved for {id}");
                            self.on_connect_resolved(id, res);
                        }
                        // cancelled by a close; the entry is already gone
                        Err(Aborted) => trace!("tick: connect aborted for {id}"),
                    }
                }
                (id, res) = Self::next_ready(&self.entries) => {
                    trace!("tick: readiness for {id}");
                    self.on_ready(id, res);
                }
            }
        }
        self.shutdown();
    }

    /// Resolves as soon as any entry's socket reports the readiness the entry
    /// is interested in. Pending forever while no socket is pollable.
    async fn next_ready(
        entries: &HashMap<SocketId, NetworkEntry>,
    ) -> (SocketId, io::Result<Ready>) {
        let mut readiness: FuturesUnordered<_> = entries
            .values()
            .filter_map(|entry| {
                let id = entry.id;
                let interest = entry.interest;
                match &entry.socket {
                    Socket::Udp { socket, .. } => Some(Either::Left(async move {
                        (id, socket.ready(interest).await)
                    })),
                    Socket::Tcp {
                        stream: Some(stream),
                        ..
                    } => Some(Either::Right(async move {
                        (id, stream.ready(interest).await)
                    })),
                    // still connecting, driven through `connects`
                    Socket::Tcp { stream: None, .. } => None,
                }
            })
            .collect();
        match readiness.next().await {
            Some(ready) => ready,
            None => std::future::pending().await,
        }
    }

    fn handle_msg(&mut self, msg: NetworkRequest) {
        match msg {
            NetworkRequest::CreateUdp {
                source_addr,
                response_bus,
            } => self.create_udp(source_addr, response_bus),
            NetworkRequest::CreateTcp {
                source_addr,
                to,
                response_bus,
            } => self.create_tcp(source_addr, to, response_bus),
            NetworkRequest::WriteTcp { id, data } => self.write_tcp(id, data),
            NetworkRequest::WriteUdp { id, to, data } => self.write_udp(id, to, data),
            NetworkRequest::Close { id } => self.close(id),
            NetworkRequest::LocalAddresses { response_bus } => {
                response_bus.send(NetworkEvent::LocalAddressesFound(
                    interfaces::local_addresses(),
                ));
            }
            NetworkRequest::Kill => unreachable!("handled in the run loop"),
        }
    }

    fn next_socket_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    fn create_udp(&mut self, source_addr: IpAddr, response_bus: Bus<NetworkEvent>) {
        match bind_udp(source_addr) {
            Ok(socket) => {
                let id = self.next_socket_id();
                debug!("{id} udp socket bound to {:?}", socket.local_addr().ok());
                let entry = NetworkEntry::new_udp(id, socket, response_bus);
                entry.response_bus.send(NetworkEvent::UdpCreated { id });
                self.entries.insert(id, entry);
            }
            Err(err) => {
                debug!("udp bind to {source_addr} failed: {err}");
                response_bus.send(NetworkEvent::Error);
            }
        }
    }

    fn create_tcp(&mut self, source_addr: IpAddr, to: SocketAddr, response_bus: Bus<NetworkEvent>) {
        let socket = match bind_tcp(source_addr) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("tcp bind to {source_addr} failed: {err}");
                response_bus.send(NetworkEvent::Error);
                return;
            }
        };
        let id = self.next_socket_id();
        debug!("{id} tcp socket bound, connecting to {to}");
        // the connect future owns the socket until it resolves; the abort
        // handle lets a close release it without waiting out the OS connect
        // timeout
        let (connect, abort_handle) = abortable(socket.connect(to));
        let entry = NetworkEntry::new_tcp(id, response_bus, abort_handle);
        entry.response_bus.send(NetworkEvent::TcpCreated { id });
        self.entries.insert(id, entry);
        self.connects
            .push(Box::pin(async move { (id, connect.await) }));
    }

    fn on_connect_resolved(&mut self, id: SocketId, res: io::Result<TcpStream>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            // closed while the connect was in flight
            trace!("{id} connect resolved after close");
            return;
        };
        match res {
            Ok(stream) => {
                debug!("{id} connected");
                if let Socket::Tcp {
                    stream: slot,
                    connecting,
                    connect_abort,
                    ..
                } = &mut entry.socket
                {
                    *slot = Some(stream);
                    *connecting = false;
                    *connect_abort = None;
                }
                entry.response_bus.send(NetworkEvent::TcpConnected { id });
                entry.update_interest();
            }
            Err(err) => {
                debug!("{id} connect failed: {err}");
                self.shutdown_socket(id);
            }
        }
    }

    fn write_tcp(&mut self, id: SocketId, data: Bytes) {
        let Some(entry) = self.entries.get_mut(&id) else {
            debug!("{id} tcp write to unknown socket");
            return;
        };
        match &mut entry.socket {
            Socket::Tcp { outgoing, .. } => {
                if !data.is_empty() {
                    // empty stream writes carry no information
                    outgoing.push_back(StreamBuf::new(data));
                }
                entry.update_interest();
            }
            Socket::Udp { .. } => {
                debug!("{id} tcp write to udp socket");
                self.shutdown_socket(id);
            }
        }
    }

    fn write_udp(&mut self, id: SocketId, to: SocketAddr, data: Bytes) {
        let Some(entry) = self.entries.get_mut(&id) else {
            debug!("{id} udp write to unknown socket");
            return;
        };
        match &mut entry.socket {
            Socket::Udp { outgoing, .. } => {
                outgoing.push_back((data, to));
                entry.update_interest();
            }
            Socket::Tcp { .. } => {
                debug!("{id} udp write to tcp socket");
                self.shutdown_socket(id);
            }
        }
    }

    fn close(&mut self, id: SocketId) {
        match self.entries.remove(&id) {
            Some(mut entry) => {
                debug!("{id} closed");
                entry.abort_pending_connect();
                entry.response_bus.send(NetworkEvent::Closed { id });
                // the socket drops with the entry
            }
            None => debug!("{id} close for unknown socket"),
        }
    }

    fn on_ready(&mut self, id: SocketId, res: io::Result<Ready>) {
        let res = match res {
            Ok(ready) => self.drive_socket(id, ready),
            Err(err) => Err(err),
        };
        match res {
            Ok(()) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.update_interest();
                }
            }
            Err(err) => {
                debug!("{id} socket error: {err}");
                self.shutdown_socket(id);
            }
        }
    }

    /// Performs the I/O a readiness event allows. Any error escalates to the
    /// socket's shutdown path in [`Self::on_ready`].
    fn drive_socket(&mut self, id: SocketId, ready: Ready) -> io::Result<()> {
        let scratch = &mut self.scratch;
        let Some(entry) = self.entries.get_mut(&id) else {
            return Ok(());
        };
        match &mut entry.socket {
            Socket::Udp { socket, outgoing } => {
                if ready.is_readable() {
                    match socket.try_recv_from(scratch) {
                        Ok((n, from)) => {
                            let local = socket.local_addr()?;
                            trace!("{id} udp read {n} bytes from {from}");
                            entry.response_bus.send(NetworkEvent::UdpRead {
                                id,
                                local,
                                from,
                                data: Bytes::copy_from_slice(&scratch[..n]),
                            });
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => return Err(err),
                    }
                }
                if ready.is_writable() {
                    if let Some((data, to)) = outgoing.front().cloned() {
                        match socket.try_send_to(&data, to) {
                            Ok(n) => {
                                trace!("{id} udp wrote {n} of {} bytes to {to}", data.len());
                                outgoing.pop_front();
                                entry.response_bus.send(NetworkEvent::UdpWritten { id, n });
                            }
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                            Err(err) => return Err(err),
                        }
                    } else if !entry.notified_of_writable {
                        trace!("{id} udp write queue empty");
                        entry.notified_of_writable = true;
                        entry
                            .response_bus
                            .send(NetworkEvent::UdpWriteQueueEmpty { id });
                    }
                }
            }
            Socket::Tcp {
                stream, outgoing, ..
            } => {
                let Some(stream) = stream.as_ref() else {
                    return Ok(());
                };
                if ready.is_readable() {
                    match stream.try_read(scratch) {
                        // orderly shutdown by the peer ends the entry
                        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                        Ok(n) => {
                            trace!("{id} tcp read {n} bytes");
                            entry.response_bus.send(NetworkEvent::TcpRead {
                                id,
                                data: Bytes::copy_from_slice(&scratch[..n]),
                            });
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => return Err(err),
                    }
                }
                if ready.is_writable() {
                    while let Some(buf) = outgoing.front_mut() {
                        match stream.try_write(buf.remaining()) {
                            Ok(n) => {
                                buf.advance(n);
                                trace!("{id} tcp wrote {n} bytes");
                                if !buf.is_drained() {
                                    // wait for the next writable event
                                    break;
                                }
                                let n = buf.data.len();
                                outgoing.pop_front();
                                entry.response_bus.send(NetworkEvent::TcpWritten { id, n });
                            }
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(err) => return Err(err),
                        }
                    }
                    if outgoing.is_empty() && !entry.notified_of_writable {
                        trace!("{id} tcp write queue empty");
                        entry.notified_of_writable = true;
                        entry
                            .response_bus
                            .send(NetworkEvent::TcpWriteQueueEmpty { id });
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes the entry, reports the id as dead and drops the socket.
    fn shutdown_socket(&mut self, id: SocketId) {
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        debug!("{id} shutting down");
        entry.abort_pending_connect();
        entry.response_bus.send(NetworkEvent::SocketError { id });
    }

    fn shutdown(&mut self) {
        debug!("gateway stopping, {} sockets left", self.entries.len());
        let ids: Vec<_> = self.entries.keys().copied().collect();
        for id in ids {
            self.shutdown_socket(id);
        }
    }
}

fn bind_udp(source_addr: IpAddr) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((source_addr, 0))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

fn bind_tcp(source_addr: IpAddr) -> io::Result<TcpSocket> {
    let socket = match source_addr {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(source_addr, 0))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::Ipv4Addr, time::Duration};

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn next_event(inbox: &mut Inbox<NetworkEvent>) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(10), inbox.recv())
            .await
            .expect("timed out waiting for event")
            .expect("response bus closed")
    }

    /// Receives events until `pred` accepts one, skipping over write-queue
    /// drain notifications (their timing depends on readiness interleaving).
    async fn next_matching(
        inbox: &mut Inbox<NetworkEvent>,
        pred: impl Fn(&NetworkEvent) -> bool,
    ) -> NetworkEvent {
        loop {
            let event = next_event(inbox).await;
            if pred(&event) {
                return event;
            }
            assert!(
                matches!(
                    event,
                    NetworkEvent::TcpWriteQueueEmpty { .. }
                        | NetworkEvent::UdpWriteQueueEmpty { .. }
                ),
                "unexpected event {event:?}"
            );
        }
    }

    async fn create_udp(
        bus: &Bus<NetworkRequest>,
        response_bus: &Bus<NetworkEvent>,
        inbox: &mut Inbox<NetworkEvent>,
    ) -> SocketId {
        bus.send(NetworkRequest::CreateUdp {
            source_addr: LOCALHOST,
            response_bus: response_bus.clone(),
        });
        match next_matching(inbox, |e| matches!(e, NetworkEvent::UdpCreated { .. })).await {
            NetworkEvent::UdpCreated { id } => id,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn udp_echo_with_peer() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let peer = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let id = create_udp(&bus, &response_bus, &mut inbox).await;

        bus.send(NetworkRequest::WriteUdp {
            id,
            to: peer_addr,
            data: Bytes::from_static(b"ping"),
        });
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::UdpWritten { .. })).await {
            NetworkEvent::UdpWritten { id: wid, n } => {
                assert_eq!(wid, id);
                assert_eq!(n, 4);
            }
            _ => unreachable!(),
        }

        let mut buf = [0u8; 16];
        let (n, mapped_addr) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", mapped_addr).await.unwrap();
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::UdpRead { .. })).await {
            NetworkEvent::UdpRead {
                id: rid,
                local,
                from,
                data,
            } => {
                assert_eq!(rid, id);
                assert_eq!(local, mapped_addr);
                assert_eq!(from, peer_addr);
                assert_eq!(data, Bytes::from_static(b"pong"));
            }
            _ => unreachable!(),
        }

        bus.send(NetworkRequest::Close { id });
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::Closed { .. })).await {
            NetworkEvent::Closed { id: cid } => assert_eq!(cid, id),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn tcp_write_ordering_and_drain() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let peer_addr = listener.local_addr().unwrap();

        bus.send(NetworkRequest::CreateTcp {
            source_addr: LOCALHOST,
            to: peer_addr,
            response_bus: response_bus.clone(),
        });
        let id = match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpCreated { .. }))
            .await
        {
            NetworkEvent::TcpCreated { id } => id,
            _ => unreachable!(),
        };

        // enqueue before and after the connect resolves, order must hold
        let chunks: [&[u8]; 3] = [b"one-", b"two-", b"three"];
        for chunk in chunks {
            bus.send(NetworkRequest::WriteTcp {
                id,
                data: Bytes::from_static(chunk),
            });
        }

        let (mut peer, _) = listener.accept().await.unwrap();
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpConnected { .. })).await {
            NetworkEvent::TcpConnected { id: cid } => assert_eq!(cid, id),
            _ => unreachable!(),
        }

        let mut written = Vec::new();
        while written.len() < chunks.len() {
            match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpWritten { .. })).await
            {
                NetworkEvent::TcpWritten { id: wid, n } => {
                    assert_eq!(wid, id);
                    written.push(n);
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(written, vec![4, 4, 5]);

        use tokio::io::AsyncReadExt;
        let mut received = vec![0u8; 13];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"one-two-three");

        // peer to gateway direction
        use tokio::io::AsyncWriteExt;
        peer.write_all(b"reply").await.unwrap();
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpRead { .. })).await {
            NetworkEvent::TcpRead { id: rid, data } => {
                assert_eq!(rid, id);
                assert_eq!(data, Bytes::from_static(b"reply"));
            }
            _ => unreachable!(),
        }

        bus.send(NetworkRequest::Close { id });
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::Closed { .. })).await {
            NetworkEvent::Closed { id: cid } => assert_eq!(cid, id),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn write_queue_empty_fires_once_per_drain() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let peer = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let id = create_udp(&bus, &response_bus, &mut inbox).await;
        for _ in 0..3 {
            bus.send(NetworkRequest::WriteUdp {
                id,
                to: peer_addr,
                data: Bytes::from_static(b"x"),
            });
        }

        // collect until all three datagrams are out; drain notifications can
        // interleave when a cycle empties between writes, but never twice in
        // a row
        let mut events = Vec::new();
        let mut sent = 0;
        while sent < 3 {
            let event = next_event(&mut inbox).await;
            match event {
                NetworkEvent::UdpWritten { id: wid, n } => {
                    assert_eq!(wid, id);
                    assert_eq!(n, 1);
                    sent += 1;
                }
                NetworkEvent::UdpWriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
            events.push(event);
        }

        // the final drained cycle is reported exactly once
        match next_event(&mut inbox).await {
            NetworkEvent::UdpWriteQueueEmpty { id: eid } => assert_eq!(eid, id),
            other => panic!("expected drain notification, got {other:?}"),
        }
        events.push(NetworkEvent::UdpWriteQueueEmpty { id });
        for pair in events.windows(2) {
            assert!(
                !(matches!(pair[0], NetworkEvent::UdpWriteQueueEmpty { .. })
                    && matches!(pair[1], NetworkEvent::UdpWriteQueueEmpty { .. })),
                "consecutive drain notifications: {events:?}"
            );
        }

        bus.send(NetworkRequest::Close { id });
        match next_event(&mut inbox).await {
            NetworkEvent::Closed { id: cid } => assert_eq!(cid, id),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tcp_connect_failure_reports_the_id_dead() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        // grab a loopback port with no listener behind it
        let port = {
            let probe = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            probe.local_addr().unwrap().port()
        };

        bus.send(NetworkRequest::CreateTcp {
            source_addr: LOCALHOST,
            to: SocketAddr::new(LOCALHOST, port),
            response_bus: response_bus.clone(),
        });
        let id = match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpCreated { .. }))
            .await
        {
            NetworkEvent::TcpCreated { id } => id,
            _ => unreachable!(),
        };
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::SocketError { .. })).await {
            NetworkEvent::SocketError { id: eid } => assert_eq!(eid, id),
            other => panic!("expected SocketError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_tcp_write_is_dropped() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        bus.send(NetworkRequest::CreateTcp {
            source_addr: LOCALHOST,
            to: listener.local_addr().unwrap(),
            response_bus: response_bus.clone(),
        });
        let id = match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpCreated { .. }))
            .await
        {
            NetworkEvent::TcpCreated { id } => id,
            _ => unreachable!(),
        };
        // the peer end has to stay open or the gateway sees an EOF
        let (_peer, _) = listener.accept().await.unwrap();
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpConnected { .. })).await {
            NetworkEvent::TcpConnected { .. } => {}
            _ => unreachable!(),
        }

        bus.send(NetworkRequest::WriteTcp {
            id,
            data: Bytes::new(),
        });
        bus.send(NetworkRequest::Close { id });

        loop {
            match next_event(&mut inbox).await {
                NetworkEvent::Closed { id: cid } => {
                    assert_eq!(cid, id);
                    break;
                }
                NetworkEvent::TcpWriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn kill_sweeps_every_socket() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();

        let mut ids = HashSet::new();
        for _ in 0..3 {
            ids.insert(create_udp(&bus, &response_bus, &mut inbox).await);
        }
        bus.send(NetworkRequest::CreateTcp {
            source_addr: LOCALHOST,
            to: listener.local_addr().unwrap(),
            response_bus: response_bus.clone(),
        });
        match next_matching(&mut inbox, |e| matches!(e, NetworkEvent::TcpCreated { .. })).await {
            NetworkEvent::TcpCreated { id } => ids.insert(id),
            _ => unreachable!(),
        };

        bus.send(NetworkRequest::Kill);

        let mut dead = HashSet::new();
        while dead.len() < ids.len() {
            match next_event(&mut inbox).await {
                NetworkEvent::SocketError { id } => assert!(dead.insert(id), "{id} swept twice"),
                // the connect may still resolve before the kill is processed
                NetworkEvent::TcpConnected { .. }
                | NetworkEvent::TcpWriteQueueEmpty { .. }
                | NetworkEvent::UdpWriteQueueEmpty { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(ids, dead);
    }

    #[tokio::test]
    async fn local_addresses_exclude_loopback() {
        let gateway = NetworkGateway::spawn();
        let bus = gateway.bus();
        let (response_bus, mut inbox) = bus::channel();

        bus.send(NetworkRequest::LocalAddresses {
            response_bus: response_bus.clone(),
        });
        match next_event(&mut inbox).await {
            NetworkEvent::LocalAddressesFound(addrs) => {
                for addr in addrs {
                    assert!(!addr.is_loopback());
                }
            }
            other => panic!("expected LocalAddressesFound, got {other:?}"),
        }
    }
}

use bytes::{Buf, Bytes, BytesMut};
use certforge_core::{
    Error,
    protocol::{MAX_NAME_LEN, scan_request},
};
use mio::{Interest, Registry, Token, net::TcpStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

const READ_CHUNK: usize = 1024;

/// Bytes discarded from the receive queue before closing, so a clean close
/// does not turn into a reset that destroys the response in flight.
const MAX_DISCARD: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for read readiness, accumulating the request.
    Reading,
    /// Request parsed; not registered until the issuance completes.
    AwaitingGeneration,
    /// Registered for write readiness, draining the response frame.
    Writing,
    Closed,
}

/// Progress of a read pass over a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadProgress {
    /// The socket has no more data for now and no delimiter was seen.
    Incomplete,
    /// A complete request, or the reason it was rejected.
    Request(Result<String, Error>),
    /// The peer closed its side before a request was complete.
    Eof,
}

/// Per-socket buffers and protocol state, owned by the Reactor thread.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    read_buf: BytesMut,
    write_buf: Option<Bytes>,
    subject: Option<String>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: None,
            subject: None,
        }
    }

    pub const fn state(&self) -> ConnState {
        self.state
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    /// Reads until the socket would block, a request is complete, or the
    /// peer closes.
    ///
    /// Readiness is edge-triggered, so an `Incomplete` result is only
    /// returned once the socket is drained.
    pub fn read_request(&mut self) -> io::Result<ReadProgress> {
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadProgress::Eof),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    match scan_request(&self.read_buf, MAX_NAME_LEN) {
                        Ok(None) => {}
                        Ok(Some(name)) => return Ok(ReadProgress::Request(Ok(name))),
                        Err(err) => return Ok(ReadProgress::Request(Err(err))),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadProgress::Incomplete);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops read polling and parks the connection until its result is
    /// delivered.
    pub fn await_generation(&mut self, registry: &Registry, subject: String) -> io::Result<()> {
        self.read_buf.clear();
        self.subject = Some(subject);
        self.state = ConnState::AwaitingGeneration;
        registry.deregister(&mut self.stream)
    }

    /// Installs the response frame and switches the connection to write
    /// readiness.
    pub fn respond(&mut self, registry: &Registry, token: Token, frame: Bytes) -> io::Result<()> {
        let parked = self.state == ConnState::AwaitingGeneration;
        self.read_buf.clear();
        self.write_buf = Some(frame);
        self.state = ConnState::Writing;
        if parked {
            registry.register(&mut self.stream, token, Interest::WRITABLE)
        } else {
            registry.reregister(&mut self.stream, token, Interest::WRITABLE)
        }
    }

    /// Writes as much of the pending frame as the socket accepts.
    ///
    /// Returns `true` once the frame is fully written.
    pub fn flush(&mut self) -> io::Result<bool> {
        let Some(buf) = self.write_buf.as_mut() else {
            return Ok(true);
        };
        while buf.has_remaining() {
            match self.stream.write(buf.chunk()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.write_buf = None;
        Ok(true)
    }

    /// Releases the socket. Safe to call more than once.
    ///
    /// A connection that is still registered is deregistered first; a
    /// connection whose frame was fully written is half-closed so the peer
    /// sees a clean end of stream.
    pub fn close(&mut self, registry: &Registry) {
        if self.state == ConnState::Closed {
            return;
        }
        let registered = self.state != ConnState::AwaitingGeneration;
        let sent = self.state == ConnState::Writing && self.write_buf.is_none();
        self.state = ConnState::Closed;

        if registered {
            // Already gone if the peer reset the connection.
            let _ = registry.deregister(&mut self.stream);
        }
        if sent {
            let _ = self.stream.shutdown(Shutdown::Write);
            self.discard_unread();
        }
    }

    fn discard_unread(&mut self) {
        let mut scratch = [0_u8; READ_CHUNK];
        let mut discarded = 0;
        while discarded < MAX_DISCARD {
            match self.stream.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
    }
}

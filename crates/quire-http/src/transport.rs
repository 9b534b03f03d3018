use std::{
    io::{self, ErrorKind, Read, Write},
    net::Shutdown,
    sync::Arc,
};

use mio::net::TcpStream;
use rustls::{ServerConfig as TlsConfig, ServerConnection};

/// First bytes of the methods the engine serves.
///
/// Anything else opening a connection that allows TLS is taken to be a TLS record.
const PLAINTEXT_OPENERS: &[u8] = b"DGHOPT";

/// A client socket, optionally wrapped in a TLS session.
pub struct Transport {
    stream: TcpStream,
    tls: Option<Box<ServerConnection>>,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream, tls: None }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    /// Wrap the socket in a server-side TLS session.
    ///
    /// Bytes already read from the socket are not replayed, so this has to happen before any
    /// plaintext has been consumed.
    pub fn start_tls(&mut self, config: Arc<TlsConfig>) -> Result<(), rustls::Error> {
        let session = ServerConnection::new(config)?;
        self.tls = Some(Box::new(session));
        Ok(())
    }

    /// Whether a connection that hasn't sent anything yet opens with a TLS record.
    ///
    /// `Ok(None)` means the peer closed without sending anything.
    pub fn sniff_tls(&self) -> io::Result<Option<bool>> {
        let mut byte = [0; 1];

        match self.stream.peek(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(!PLAINTEXT_OPENERS.contains(&byte[0]))),
        }
    }

    /// Whether encrypted data is waiting to go out, independent of application data.
    pub fn wants_write(&self) -> bool {
        self.tls
            .as_ref()
            .map(|session| session.wants_write())
            .unwrap_or(false)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(session) = &mut self.tls else {
            return self.stream.read(buf);
        };

        loop {
            let state = session
                .process_new_packets()
                .map_err(|error| io::Error::new(ErrorKind::InvalidData, error))?;

            if state.plaintext_bytes_to_read() > 0 {
                return session.reader().read(buf);
            }

            if state.peer_has_closed() {
                return Ok(0);
            }

            // Handshake messages have to go out before the peer sends anything more
            flush_session(session, &mut self.stream)?;

            if session.read_tls(&mut self.stream)? == 0 {
                return Ok(0);
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(session) = &mut self.tls else {
            return self.stream.write(buf);
        };

        let mut written = session.writer().write(buf)?;
        if written == 0 && !buf.is_empty() {
            // The session buffer is full, make room and retry once
            flush_session(session, &mut self.stream)?;
            written = session.writer().write(buf)?;

            if written == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
        }

        match flush_session(session, &mut self.stream) {
            Ok(()) => Ok(written),
            // The plaintext is buffered in the session, and goes out with the next flush
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(written),
            Err(error) => Err(error),
        }
    }

    /// Push out buffered TLS records.
    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.tls {
            Some(session) => flush_session(session, &mut self.stream),
            None => Ok(()),
        }
    }

    /// Best effort orderly close.
    pub fn shutdown(&mut self) {
        if let Some(session) = &mut self.tls {
            session.send_close_notify();
            let _ = flush_session(session, &mut self.stream);
        }

        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn flush_session(session: &mut ServerConnection, stream: &mut TcpStream) -> io::Result<()> {
    while session.wants_write() {
        session.write_tls(stream)?;
    }

    Ok(())
}

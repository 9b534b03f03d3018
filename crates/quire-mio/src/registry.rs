use std::{io::ErrorKind, time::Duration};

use anyhow::{Context as _, Error};
use mio::{event::Source, Events, Interest, Poll, Token};
use tracing::{event, Level};

/// Shared mio readiness registry.
///
/// Owners register their sources with a token they allocated from this registry, and receive
/// `Ready` notifications for those tokens from `poll`.
pub struct Registry {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl Registry {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().context("failed to create poll")?;

        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            next_token: 0,
        })
    }

    /// Create a new unique token for this registry.
    pub fn token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Start watching `source` for the given interest.
    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .register(source, token, interest)
            .context("failed to register source")?;
        Ok(())
    }

    /// Change the interest of an already watched source.
    ///
    /// Re-registering also re-arms edge triggered readiness, so owners that stopped reading or
    /// writing before hitting `WouldBlock` will be woken again if the source is still ready.
    pub fn reregister<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .reregister(source, token, interest)
            .context("failed to reregister source")?;
        Ok(())
    }

    /// Stop watching `source`.
    pub fn deregister<S>(&self, source: &mut S) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .deregister(source)
            .context("failed to deregister source")?;
        Ok(())
    }

    /// Wait for readiness, up to `timeout`.
    ///
    /// Multiple events for the same token are merged into one `Ready`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready>, Error> {
        if let Err(error) = self.poll.poll(&mut self.events, timeout) {
            // A signal interrupting the wait is not an error, the caller just polls again
            if error.kind() == ErrorKind::Interrupted {
                return Ok(Vec::new());
            }

            return Err(Error::new(error).context("failed to poll"));
        }

        let mut ready: Vec<Ready> = Vec::new();
        for mio_event in self.events.iter() {
            event!(Level::TRACE, token = mio_event.token().0, "readiness event");

            let incoming = Ready {
                token: mio_event.token(),
                readable: mio_event.is_readable() || mio_event.is_read_closed(),
                writable: mio_event.is_writable(),
                closed: mio_event.is_error() || mio_event.is_write_closed(),
            };

            // Attempt to find an existing entry
            match ready.iter_mut().find(|r| r.token == incoming.token) {
                Some(r) => {
                    r.readable |= incoming.readable;
                    r.writable |= incoming.writable;
                    r.closed |= incoming.closed;
                }
                None => ready.push(incoming),
            }
        }

        Ok(ready)
    }
}

/// Readiness of one registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// The source reported an error or hang-up.
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::{SocketAddr, TcpStream},
        time::Duration,
    };

    use mio::{net::TcpListener, Interest};
    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn tokens_are_unique() -> Result<(), Error> {
        let mut registry = Registry::new()?;

        let a = registry.token();
        let b = registry.token();
        assert_ne!(a, b);

        Ok(())
    }

    #[test]
    #[traced_test]
    fn listener_becomes_readable_on_connect() -> Result<(), Error> {
        let mut registry = Registry::new()?;

        let addr: SocketAddr = "127.0.0.1:0".parse()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let token = registry.token();
        registry.register(&mut listener, token, Interest::READABLE)?;

        let mut client = TcpStream::connect(local_addr)?;
        client.write_all(b"x")?;

        let mut found = false;
        for _ in 0..20 {
            let ready = registry.poll(Some(Duration::from_millis(50)))?;
            if ready.iter().any(|r| r.token == token && r.readable) {
                found = true;
                break;
            }
        }
        assert!(found, "listener never became readable");

        registry.deregister(&mut listener)?;

        Ok(())
    }
}

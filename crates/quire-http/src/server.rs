use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _, Error};
use mio::net::TcpListener;
use quire_mio::{run_event_loop, Interest, Ready, Registry, Token};
use quire_resolve::Resolver;
use rustls::ServerConfig as TlsConfig;
use tracing::{event, info_span, instrument, Level};

use crate::{
    connection::{Connection, Context},
    gateway::Reaper,
    registry::{ConnectionRegistry, RejectReason, Slot},
    HostnameLookups, ListenerEncryption, ServerConfig, Services,
};

/// How often idle connections are looked for.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Something the owner of a `Server` has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A new configuration file was installed.
    ReloadScheduled,
}

/// HTTP front-end serving all configured listeners from one thread.
pub struct Server {
    registry: Registry,
    core: Core,
}

struct Core {
    config: ServerConfig,
    services: Services,
    resolver: Resolver,
    tls: Option<Arc<TlsConfig>>,
    listeners: Vec<Listener>,
    connections: ConnectionRegistry<Connection>,
    targets: HashMap<Token, Target>,
    helpers: HashMap<Slot, (Token, u32)>,
    reaper: Reaper,
    next_id: u64,
    last_sweep: Instant,
}

struct Listener {
    socket: TcpListener,
    addr: SocketAddr,
    encryption: ListenerEncryption,
}

/// What a readiness token belongs to.
#[derive(Debug, Clone, Copy)]
enum Target {
    Listener(usize),
    Client(Slot),
    Helper(Slot),
}

impl Server {
    /// Bind all configured listeners.
    #[instrument("Server::bind", skip_all)]
    pub fn bind(
        config: ServerConfig,
        services: Services,
        tls: Option<Arc<TlsConfig>>,
    ) -> Result<Self, Error> {
        let mut registry = Registry::new()?;
        let mut listeners = Vec::new();
        let mut targets = HashMap::new();

        for listener in &config.listeners {
            if listener.encryption == ListenerEncryption::Always && tls.is_none() {
                bail!("listener {} requires TLS, but TLS is not configured", listener.addr);
            }

            let mut socket = TcpListener::bind(listener.addr)
                .with_context(|| format!("failed to bind {}", listener.addr))?;
            let addr = socket.local_addr()?;

            let token = registry.token();
            registry.register(&mut socket, token, Interest::READABLE)?;
            targets.insert(token, Target::Listener(listeners.len()));

            event!(Level::INFO, %addr, encryption = ?listener.encryption, "listening");
            listeners.push(Listener {
                socket,
                addr,
                encryption: listener.encryption,
            });
        }

        let core = Core {
            resolver: Resolver::new(config.roots.clone()),
            connections: ConnectionRegistry::new(config.max_clients, config.max_clients_per_host),
            config,
            services,
            tls,
            listeners,
            targets,
            helpers: HashMap::new(),
            reaper: Reaper::default(),
            next_id: 0,
            last_sweep: Instant::now(),
        };

        Ok(Self { registry, core })
    }

    /// Addresses the listeners are bound to, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.core.listeners.iter().map(|l| l.addr).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }

    /// Wait up to `timeout` for readiness and handle whatever became ready.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<Vec<ServerEvent>, Error> {
        let ready = self.registry.poll(timeout)?;
        self.core.step(&mut self.registry, ready)
    }

    /// Serve until `on_event` breaks.
    pub fn run<F>(self, mut on_event: F) -> Result<(), Error>
    where
        F: FnMut(ServerEvent) -> ControlFlow<()>,
    {
        let Server {
            mut registry,
            mut core,
        } = self;

        run_event_loop(&mut registry, SWEEP_INTERVAL, |registry, ready| {
            for event in core.step(registry, ready)? {
                if on_event(event).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }

            Ok(ControlFlow::Continue(()))
        })
    }
}

impl Core {
    fn step(&mut self, registry: &mut Registry, ready: Vec<Ready>) -> Result<Vec<ServerEvent>, Error> {
        let mut events = Vec::new();

        for ready in ready {
            let Some(target) = self.targets.get(&ready.token).copied() else {
                event!(Level::TRACE, token = ready.token.0, "readiness for stale token");
                continue;
            };

            match target {
                Target::Listener(index) => self.accept(registry, index)?,
                Target::Client(slot) => self.process(registry, slot, false, &mut events)?,
                Target::Helper(slot) => self.process(registry, slot, true, &mut events)?,
            }
        }

        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.last_sweep = now;
            self.sweep_idle(registry, now)?;
        }

        self.reaper.reap();

        Ok(events)
    }

    #[instrument("Server::accept", skip_all)]
    fn accept(&mut self, registry: &mut Registry, index: usize) -> Result<(), Error> {
        loop {
            let Some(listener) = self.listeners.get(index) else {
                return Ok(());
            };
            let encryption = listener.encryption;
            let listener_addr = listener.addr;

            let (stream, peer) = match listener.socket.accept() {
                Ok(accepted) => accepted,
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    // Typically out of descriptors, try again on the next readiness
                    event!(Level::WARN, ?error, "failed to accept connection");
                    return Ok(());
                }
            };

            let hostname = match self.admit(peer.ip(), encryption) {
                Ok(hostname) => hostname,
                Err(reason) => {
                    event!(Level::INFO, %peer, %reason, "refused connection");
                    continue;
                }
            };

            let local = stream.local_addr().unwrap_or(listener_addr);
            let token = registry.token();
            let id = self.next_id;
            self.next_id += 1;

            let mut connection =
                Connection::new(id, token, stream, peer, local, hostname, encryption);

            if encryption == ListenerEncryption::Always {
                if let Some(tls) = &self.tls {
                    if let Err(error) = connection.start_tls(tls) {
                        event!(Level::WARN, ?error, %peer, "refused connection");
                        continue;
                    }
                }
            }

            if let Err(error) = registry.register(connection.stream_mut(), token, Interest::READABLE)
            {
                event!(Level::WARN, ?error, %peer, "refused connection");
                continue;
            }

            event!(Level::DEBUG, id, %peer, hostname = connection.hostname(), "accepted connection");
            let slot = self.connections.insert(peer.ip(), connection);
            self.targets.insert(token, Target::Client(slot));
        }
    }

    /// Check a new peer against the limits, and find its hostname.
    fn admit(&mut self, addr: IpAddr, encryption: ListenerEncryption) -> Result<String, RejectReason> {
        self.connections.admit(addr, Instant::now())?;

        if encryption == ListenerEncryption::Always && self.tls.is_none() {
            return Err(RejectReason::NoTls);
        }

        if addr.is_loopback() {
            return Ok("localhost".to_string());
        }

        let hosts = &self.services.hosts;
        match self.config.hostname_lookups {
            HostnameLookups::Off => Ok(addr.to_string()),
            HostnameLookups::On => Ok(hosts.lookup_addr(addr).unwrap_or_else(|| addr.to_string())),
            HostnameLookups::Double => match hosts.lookup_addr(addr) {
                None => Ok(addr.to_string()),
                Some(name) if hosts.lookup_host(&name).contains(&addr) => Ok(name),
                Some(name) => {
                    event!(Level::WARN, %addr, %name, "hostname does not resolve back to peer");
                    Err(RejectReason::Verification { addr })
                }
            },
        }
    }

    fn process(
        &mut self,
        registry: &mut Registry,
        slot: Slot,
        helper: bool,
        events: &mut Vec<ServerEvent>,
    ) -> Result<(), Error> {
        {
            let Core {
                config,
                services,
                resolver,
                tls,
                connections,
                reaper,
                ..
            } = self;

            let Some(connection) = connections.get_mut(slot) else {
                return Ok(());
            };

            let span = info_span!("connection", id = connection.id());
            let _entered = span.enter();

            let mut cx = Context {
                config,
                services,
                resolver,
                tls: tls.as_ref(),
                reaper,
                events,
            };

            let result = if helper {
                connection.on_helper_ready(&mut cx)
            } else {
                connection.on_ready(&mut cx)
            };

            if let Err(error) = result {
                event!(Level::DEBUG, ?error, "connection failed");
                connection.close("connection error");
            }
        }

        self.sync(registry, slot)
    }

    /// Bring readiness registrations in line with the connection's state, removing it once
    /// closed.
    fn sync(&mut self, registry: &mut Registry, slot: Slot) -> Result<(), Error> {
        let Some(connection) = self.connections.get_mut(slot) else {
            return Ok(());
        };

        let change = if connection.is_closed() {
            None
        } else {
            connection.interest_change()
        };

        if let Some(interest) = change {
            let token = connection.token();

            if let Err(error) = registry.reregister(connection.stream_mut(), token, interest) {
                event!(Level::DEBUG, ?error, id = connection.id(), "lost client socket");
                connection.close("socket registration failed");
            }
        }

        if connection.is_closed() {
            let _ = registry.deregister(connection.stream_mut());
            self.targets.remove(&connection.token());

            if let Some((token, _)) = self.helpers.remove(&slot) {
                self.targets.remove(&token);
            }

            // Dropping the connection releases its socket, files and helper
            self.connections.remove(slot);
            return Ok(());
        }

        let current = connection.helper_mut().and_then(|helper| helper.pid());
        let registered = self.helpers.get(&slot).copied();

        match (registered, current) {
            (Some((_, pid)), Some(current)) if pid == current => {}
            (registered, current) => {
                // A finished helper's pipe is closed with it, so only the mapping remains
                if let Some((token, _)) = registered {
                    self.targets.remove(&token);
                    self.helpers.remove(&slot);
                }

                if let (Some(pid), Some(helper)) = (current, connection.helper_mut()) {
                    let token = registry.token();
                    registry.register(helper.output_mut(), token, Interest::READABLE)?;

                    self.helpers.insert(slot, (token, pid));
                    self.targets.insert(token, Target::Helper(slot));
                }
            }
        }

        Ok(())
    }

    fn sweep_idle(&mut self, registry: &mut Registry, now: Instant) -> Result<(), Error> {
        for slot in self.connections.slots() {
            let Some(connection) = self.connections.get_mut(slot) else {
                continue;
            };

            if connection.is_idle(now, &self.config) {
                let span = info_span!("connection", id = connection.id());
                let _entered = span.enter();

                connection.close("idle timeout");
                self.sync(registry, slot)?;
            }
        }

        Ok(())
    }
}

use std::{
    fs::File,
    io::{ErrorKind, Read, Seek, SeekFrom},
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use anyhow::{bail, Context as _, Error};
use bytes::{Buf, BytesMut};
use mio::{net::TcpStream, Interest, Token};
use quire_resolve::{gateway_prefix, FoundFile, ResolvedFile, Resolver};
use rustls::ServerConfig as TlsConfig;
use tracing::{event, Level};

use crate::{
    body::{BodyDecoder, Decoded},
    gateway::{self, GatewayRequest, HeaderScanner, HelperHeader, HelperProcess, Reaper},
    host::{strip_port, valid_host},
    install::{install_config, TempFile},
    parser::{HttpHeader, HttpParser, ParserEvent},
    request::{normalize_uri, parse_request_line},
    response::{
        build_header, error_page, error_status, is_modified, www_authenticate, ChallengeContext,
        HeaderContext, ResponseHeader, ALLOWED_METHODS,
    },
    transport::Transport,
    AuthRequest, AuthScheme, Authorization, Fields, IppRequest, ListenerEncryption, Locale,
    Method, RequestHead, ServerConfig, ServerEvent, Services, Status, Version,
};

const READ_CHUNK: usize = 16 * 1024;

/// Input buffered ahead of the parser before reading pauses.
const MAX_INPUT: usize = 64 * 1024;

/// Output buffered before file and helper reads pause.
const HIGH_WATER: usize = 64 * 1024;

/// Server-owned state a connection works with while handling an event.
pub struct Context<'a> {
    pub config: &'a ServerConfig,
    pub services: &'a mut Services,
    pub resolver: &'a Resolver,
    pub tls: Option<&'a Arc<TlsConfig>>,
    pub reaper: &'a mut Reaper,
    pub events: &'a mut Vec<ServerEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Idle between requests.
    Waiting,
    ReadingHeaders,
    ReadingBody,
    /// Headers are in, the request is being routed.
    Dispatched,
    Writing,
    Closed,
}

/// Where a request body goes while it is read.
enum Upload {
    None,
    Ipp(BytesMut),
    File(TempFile),
}

/// What produces the rest of the response after its header.
enum ResponseSource {
    None,
    File(File),
    Helper(HelperProcess),
}

/// What to do once the request body is complete.
enum Completion {
    Ipp { uri: String },
    Gateway {
        head: RequestHead,
        program: PathBuf,
        options: String,
    },
    Install,
}

enum Fill {
    Data,
    Blocked,
    Eof,
}

struct Current {
    method: Method,
    uri: String,
    host: Option<String>,
}

/// One client connection and the request it is handling.
pub struct Connection {
    id: u64,
    token: Token,
    transport: Transport,
    encryption: ListenerEncryption,
    peer: SocketAddr,
    local: SocketAddr,
    hostname: String,
    watched: Interest,
    state: State,
    last_activity: Instant,
    served: u64,

    parser: HttpParser,
    input: BytesMut,
    out: BytesMut,
    /// Plaintext `101` still to be sent before the session switches to TLS.
    upgrade: Option<(BytesMut, Arc<TlsConfig>)>,

    current: Option<Current>,
    version: Version,
    keep_alive: bool,
    locale: Option<Locale>,
    auth: Authorization,

    body: Option<BodyDecoder>,
    received: u64,
    upload: Upload,
    completion: Option<Completion>,

    source: ResponseSource,
    scanner: HeaderScanner,
    sent_header: bool,
    chunked: bool,
    status: Status,
    bytes_sent: u64,
}

impl Connection {
    pub fn new(
        id: u64,
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        hostname: String,
        encryption: ListenerEncryption,
    ) -> Self {
        Self {
            id,
            token,
            transport: Transport::new(stream),
            encryption,
            peer,
            local,
            hostname,
            watched: Interest::READABLE,
            state: State::Waiting,
            last_activity: Instant::now(),
            served: 0,
            parser: HttpParser::default(),
            input: BytesMut::new(),
            out: BytesMut::new(),
            upgrade: None,
            current: None,
            version: Version::HTTP_1_1,
            keep_alive: false,
            locale: None,
            auth: Authorization::default(),
            body: None,
            received: 0,
            upload: Upload::None,
            completion: None,
            source: ResponseSource::None,
            scanner: HeaderScanner::default(),
            sent_header: false,
            chunked: false,
            status: Status::OK,
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.transport.stream_mut()
    }

    pub fn helper_mut(&mut self) -> Option<&mut HelperProcess> {
        match &mut self.source {
            ResponseSource::Helper(helper) => Some(helper),
            _ => None,
        }
    }

    /// Readiness the client socket should be watched for.
    fn interest(&self) -> Interest {
        if !self.out.is_empty() || self.upgrade.is_some() || self.transport.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Readiness to watch the client socket for, if it changed since the last call.
    ///
    /// Readiness is edge triggered, and re-registering re-arms it, so registrations are only
    /// touched when the interest actually changes.
    pub fn interest_change(&mut self) -> Option<Interest> {
        let interest = self.interest();
        if interest == self.watched {
            return None;
        }

        self.watched = interest;
        Some(interest)
    }

    /// Whether the connection went without progress for longer than allowed in its state.
    pub fn is_idle(&self, now: Instant, config: &ServerConfig) -> bool {
        let limit = match self.state {
            State::Waiting => config.keep_alive_timeout(),
            _ => config.timeout(),
        };

        now.saturating_duration_since(self.last_activity) >= limit
    }

    /// Whether the session is, or is about to be, encrypted.
    fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted() || self.upgrade.is_some()
    }

    pub fn start_tls(&mut self, tls: &Arc<TlsConfig>) -> Result<(), Error> {
        self.transport
            .start_tls(tls.clone())
            .context("failed to start TLS session")?;

        event!(Level::DEBUG, "started TLS session");
        Ok(())
    }

    pub fn close(&mut self, reason: &str) {
        if self.state == State::Closed {
            return;
        }

        event!(Level::DEBUG, reason, "closing connection");
        if self.current.is_some() {
            self.log_access();
        }

        self.upgrade = None;
        self.transport.shutdown();
        self.state = State::Closed;

        // Kills any helper and unlinks any partial upload
        self.source = ResponseSource::None;
        self.upload = Upload::None;
    }

    /// Make all the progress currently possible, after any readiness event.
    pub fn on_ready(&mut self, cx: &mut Context) -> Result<(), Error> {
        loop {
            self.on_readable(cx)?;

            if !self.on_writable(cx)? {
                return Ok(());
            }
        }
    }

    fn on_readable(&mut self, cx: &mut Context) -> Result<(), Error> {
        loop {
            let progressed = match self.state {
                State::Waiting => self.wait_for_request(cx)?,
                State::ReadingHeaders => self.read_headers(cx)?,
                State::ReadingBody => self.read_body(cx)?,
                State::Dispatched | State::Writing | State::Closed => false,
            };

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Flush and refill output, returning whether a response completed on a kept-alive
    /// connection.
    fn on_writable(&mut self, cx: &mut Context) -> Result<bool, Error> {
        loop {
            if self.state == State::Closed || !self.flush_out()? {
                return Ok(false);
            }

            if self.state != State::Writing {
                return Ok(false);
            }

            match &mut self.source {
                ResponseSource::File(file) => {
                    let mut buffer = [0; READ_CHUNK];

                    match file.read(&mut buffer) {
                        Ok(0) => self.source = ResponseSource::None,
                        Ok(read) => self.out.extend_from_slice(&buffer[..read]),
                        Err(error) if error.kind() == ErrorKind::Interrupted => {}
                        Err(error) => {
                            // Headers are out already, so all that's left is to cut the client off
                            event!(Level::ERROR, ?error, "failed to read response file");
                            self.close("response file unreadable");
                            return Ok(false);
                        }
                    }
                }
                ResponseSource::Helper(_) => {
                    self.pump_helper(cx)?;

                    let waiting = matches!(self.source, ResponseSource::Helper(_));
                    if waiting && self.out.is_empty() {
                        return Ok(false);
                    }
                }
                ResponseSource::None => return Ok(self.finish_response()),
            }
        }
    }

    fn fill_input(&mut self) -> Result<Fill, Error> {
        // Whatever the client sends after the switch belongs to the TLS session
        if self.upgrade.is_some() {
            return Ok(Fill::Blocked);
        }

        let mut buffer = [0; READ_CHUNK];
        let mut any = false;

        while self.input.len() < MAX_INPUT {
            match self.transport.read(&mut buffer) {
                Ok(0) => {
                    return Ok(if any { Fill::Data } else { Fill::Eof });
                }
                Ok(read) => {
                    self.input.extend_from_slice(&buffer[..read]);
                    self.last_activity = Instant::now();
                    any = true;
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(Error::new(error).context("failed to read from client")),
            }
        }

        Ok(if any { Fill::Data } else { Fill::Blocked })
    }

    /// Write out as much buffered output as the transport takes, returning whether all of it
    /// went out.
    fn flush_out(&mut self) -> Result<bool, Error> {
        if !self.flush_upgrade()? {
            return Ok(false);
        }

        while !self.out.is_empty() {
            match self.transport.write(&self.out) {
                Ok(0) => bail!("client stopped accepting data"),
                Ok(written) => {
                    self.out.advance(written);
                    self.bytes_sent += written as u64;
                    self.last_activity = Instant::now();
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(Error::new(error).context("failed to write to client")),
            }
        }

        match self.transport.flush() {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(error) => Err(Error::new(error).context("failed to flush to client")),
        }
    }

    /// Send a queued `101 Switching Protocols` in plaintext, then start TLS.
    fn flush_upgrade(&mut self) -> Result<bool, Error> {
        let Some((response, _)) = &mut self.upgrade else {
            return Ok(true);
        };

        while !response.is_empty() {
            match self.transport.write(&response[..]) {
                Ok(0) => bail!("client stopped accepting data"),
                Ok(written) => {
                    response.advance(written);
                    self.last_activity = Instant::now();
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(Error::new(error).context("failed to send upgrade response"))
                }
            }
        }

        if let Some((_, tls)) = self.upgrade.take() {
            self.start_tls(&tls)?;
        }

        Ok(true)
    }

    fn wait_for_request(&mut self, cx: &mut Context) -> Result<bool, Error> {
        if self.input.is_empty() {
            if let Some(tls) = self.sniff_target(cx) {
                match self.transport.sniff_tls() {
                    Ok(Some(true)) => self.start_tls(tls)?,
                    Ok(Some(false)) => {}
                    Ok(None) => {
                        self.close("client closed connection");
                        return Ok(false);
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(false),
                    Err(error) => return Err(Error::new(error).context("failed to peek at client")),
                }
            }

            match self.fill_input()? {
                Fill::Data => {}
                Fill::Blocked => return Ok(false),
                Fill::Eof => {
                    self.close("client closed connection");
                    return Ok(false);
                }
            }
        }

        self.begin_request();
        Ok(true)
    }

    /// TLS configuration to upgrade with, if the client may still open with a TLS record.
    fn sniff_target<'a>(&self, cx: &Context<'a>) -> Option<&'a Arc<TlsConfig>> {
        let eligible = self.encryption == ListenerEncryption::IfRequested
            && !self.is_encrypted()
            && self.served == 0;

        cx.tls.filter(|_| eligible)
    }

    fn begin_request(&mut self) {
        self.parser = HttpParser::default();
        self.current = None;
        self.version = Version::HTTP_1_1;
        self.keep_alive = false;
        self.locale = None;
        self.auth = Authorization::default();
        self.body = None;
        self.received = 0;
        self.upload = Upload::None;
        self.completion = None;
        self.source = ResponseSource::None;
        self.scanner = HeaderScanner::default();
        self.sent_header = false;
        self.chunked = false;
        self.status = Status::OK;
        self.bytes_sent = 0;

        self.state = State::ReadingHeaders;
    }

    fn read_headers(&mut self, cx: &mut Context) -> Result<bool, Error> {
        match self.parser.consume(&mut self.input) {
            Ok(Some(ParserEvent::Header(header))) => {
                self.on_header(cx, header)?;
                Ok(true)
            }
            Ok(None) => match self.fill_input()? {
                Fill::Data => Ok(true),
                Fill::Blocked => Ok(false),
                Fill::Eof => {
                    self.close("client closed connection mid-request");
                    Ok(false)
                }
            },
            Err(error) => {
                event!(Level::WARN, %error, "bad request header");
                self.send_error(cx, Status::BAD_REQUEST, AuthScheme::None)?;
                Ok(true)
            }
        }
    }

    fn on_header(&mut self, cx: &mut Context, header: HttpHeader) -> Result<(), Error> {
        self.state = State::Dispatched;

        let (method, raw_uri, version) = match parse_request_line(&header.request_line) {
            Ok(parts) => parts,
            Err(status) => {
                event!(Level::WARN, line = %header.request_line, "bad request line");
                return self.send_error(cx, status, AuthScheme::None);
            }
        };
        self.version = version;
        self.current = Some(Current {
            method,
            uri: raw_uri.clone(),
            host: header.fields.get("Host").map(String::from),
        });

        let uri = match normalize_uri(&raw_uri) {
            Ok(uri) => uri,
            Err(status) => {
                event!(Level::WARN, uri = %raw_uri, %status, "refusing request URI");
                return self.send_error(cx, status, AuthScheme::None);
            }
        };

        let head = RequestHead {
            method,
            uri,
            version,
            fields: header.fields,
        };
        event!(Level::DEBUG, %method, uri = %head.uri, %version, "request");

        self.keep_alive = cx.config.keep_alive && head.wants_keep_alive();
        self.locale = Locale::from_request(
            head.fields.get("Accept-Language"),
            head.fields.get("Content-Type"),
            cx.config.default_locale.as_deref(),
        );

        if head.uri == "*" && method != Method::Options {
            return self.send_error(cx, Status::BAD_REQUEST, AuthScheme::None);
        }

        match body_framing(&head, cx.config) {
            Ok(body) => self.body = body,
            Err(status) => {
                event!(Level::WARN, %status, "refusing request body");
                return self.send_error(cx, status, AuthScheme::None);
            }
        }

        // Bodies of other methods are never read, so the connection can't be reused
        if !method.has_body() && self.body.take().is_some() {
            self.keep_alive = false;
        }

        self.auth = cx.services.authorizer.authorize(&AuthRequest {
            method,
            uri: &head.uri,
            fields: &head.fields,
            peer: self.peer.ip(),
            hostname: &self.hostname,
            encrypted: self.is_encrypted(),
        });

        if wants_tls_upgrade(&head.fields) && !self.is_encrypted() {
            if let Some(tls) = cx.tls {
                self.upgrade_tls(cx, tls);
            }
        }

        if !valid_host(head.fields.get("Host"), version, cx.config, self.local) {
            event!(Level::WARN, host = ?head.fields.get("Host"), "request for unknown host");
            return self.send_error(cx, Status::BAD_REQUEST, AuthScheme::None);
        }

        if let Some(expect) = head.fields.get("Expect") {
            if !expect.trim().eq_ignore_ascii_case("100-continue") {
                event!(Level::WARN, expect, "unsupported expectation");
                return self.send_error(cx, Status::EXPECTATION_FAILED, AuthScheme::None);
            }

            if self.body.is_some() {
                let interim = ResponseHeader {
                    status: Status::CONTINUE,
                    version,
                    fields: Fields::new(),
                };
                interim.encode(&mut self.out);
            }
        }

        match method {
            Method::Options => self.handle_options(cx),
            Method::Delete | Method::Trace => {
                self.send_error(cx, Status::NOT_IMPLEMENTED, AuthScheme::None)
            }
            Method::Get | Method::Head => self.handle_get(cx, &head),
            Method::Post => self.handle_post(cx, &head),
            Method::Put => self.handle_put(cx, &head),
        }
    }

    /// Queue the switch to TLS; the response to this request already goes out encrypted.
    fn upgrade_tls(&mut self, cx: &Context, tls: &Arc<TlsConfig>) {
        let mut response = BytesMut::new();
        self.header(cx, Status::SWITCHING_PROTOCOLS, None, None)
            .encode(&mut response);

        event!(Level::DEBUG, "switching to TLS on request");
        self.upgrade = Some((response, tls.clone()));
    }

    fn handle_options(&mut self, cx: &mut Context) -> Result<(), Error> {
        if let Some(status) = self.refusal() {
            return self.send_error(cx, status, AuthScheme::None);
        }

        let mut fields = Fields::new();
        fields.set("Allow", ALLOWED_METHODS);
        fields.set("Content-Length", "0");

        self.send_header(cx, Status::OK, None, fields);
        self.state = State::Writing;
        Ok(())
    }

    fn handle_get(&mut self, cx: &mut Context, head: &RequestHead) -> Result<(), Error> {
        let path = head.path();

        if gateway_prefix(path).is_some() && !cx.config.web_interface {
            return self.send_error(cx, Status::WEB_INTERFACE_DISABLED, AuthScheme::None);
        }

        if let Some(status) = self.refusal() {
            return self.send_error(cx, status, AuthScheme::None);
        }

        if let Some(name) = path.strip_prefix("/admin/log/") {
            if name.is_empty() || name.contains('/') {
                return self.send_error(cx, Status::FORBIDDEN, AuthScheme::None);
            }
        }

        let locale = self.locale.as_ref().map(Locale::tag);
        let resolved = cx
            .resolver
            .resolve(&head.uri, locale.as_deref(), cx.services.printers.as_ref());

        match resolved {
            ResolvedFile::MustGateway => match gateway_prefix(path) {
                Some(prefix) => {
                    let program = helper_program(cx.config, prefix);
                    let options = head.uri[prefix.len()..].to_string();
                    self.start_helper(cx, head, program, &options, None)
                }
                None => self.send_error(cx, Status::NOT_FOUND, AuthScheme::None),
            },
            ResolvedFile::Missing => self.send_error(cx, Status::NOT_FOUND, AuthScheme::None),
            ResolvedFile::Found(found) if is_executable_cgi(&found) => {
                let options = query_options(head);
                self.start_helper(cx, head, found.path, &options, None)
            }
            ResolvedFile::Found(found) => self.serve_file(cx, head, found),
        }
    }

    fn serve_file(
        &mut self,
        cx: &mut Context,
        head: &RequestHead,
        mut found: FoundFile,
    ) -> Result<(), Error> {
        let size = found.metadata.len();
        let modified = found.metadata.modified().ok();

        if let Some(modified) = modified {
            if !is_modified(head.fields.get("If-Modified-Since"), size, modified) {
                self.send_header(cx, Status::NOT_MODIFIED, None, Fields::new());
                self.state = State::Writing;
                return Ok(());
            }
        }

        let name = found
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = cx
            .services
            .mime
            .classify(&mut found.file, &name)
            .unwrap_or_else(|| "text/plain".to_string());

        // The classifier may have read from the file
        if let Err(error) = found.file.seek(SeekFrom::Start(0)) {
            event!(Level::ERROR, ?error, path = ?found.path, "failed to rewind file");
            return self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None);
        }

        let mut fields = Fields::new();
        fields.set("Content-Length", size.to_string());
        if let Some(modified) = modified {
            fields.set("Last-Modified", httpdate::fmt_http_date(modified));
        }

        self.send_header(cx, Status::OK, Some(&content_type), fields);
        if head.method != Method::Head {
            self.source = ResponseSource::File(found.file);
        }

        self.state = State::Writing;
        Ok(())
    }

    fn handle_post(&mut self, cx: &mut Context, head: &RequestHead) -> Result<(), Error> {
        let content_type = head.fields.get("Content-Type").unwrap_or_default();

        // IPP requests go to the IPP layer, which does its own authorization
        if media_type(content_type).eq_ignore_ascii_case("application/ipp") {
            self.upload = Upload::Ipp(BytesMut::new());
            self.completion = Some(Completion::Ipp {
                uri: head.uri.clone(),
            });
            return self.start_body(cx);
        }

        let path = head.path();
        if gateway_prefix(path).is_some() && !cx.config.web_interface {
            return self.send_error(cx, Status::WEB_INTERFACE_DISABLED, AuthScheme::None);
        }

        if let Some(status) = self.refusal() {
            return self.send_error(cx, status, AuthScheme::None);
        }

        let locale = self.locale.as_ref().map(Locale::tag);
        let resolved = cx
            .resolver
            .resolve(&head.uri, locale.as_deref(), cx.services.printers.as_ref());

        let (program, options) = match resolved {
            ResolvedFile::MustGateway => match gateway_prefix(path) {
                Some(prefix) => (
                    helper_program(cx.config, prefix),
                    head.uri[prefix.len()..].to_string(),
                ),
                None => return self.send_error(cx, Status::NOT_FOUND, AuthScheme::None),
            },
            ResolvedFile::Found(found) if is_executable_cgi(&found) => {
                (found.path, query_options(head))
            }
            ResolvedFile::Found(_) => {
                return self.send_error(cx, Status::UNAUTHORIZED, AuthScheme::None)
            }
            ResolvedFile::Missing => {
                return self.send_error(cx, Status::NOT_FOUND, AuthScheme::None)
            }
        };

        if !self.create_upload(cx)? {
            return Ok(());
        }

        self.completion = Some(Completion::Gateway {
            head: head.clone(),
            program,
            options,
        });
        self.start_body(cx)
    }

    fn handle_put(&mut self, cx: &mut Context, head: &RequestHead) -> Result<(), Error> {
        let config_uri = cx.resolver.roots().config_uri();

        if config_uri.as_deref() != Some(head.path()) {
            event!(Level::WARN, uri = %head.uri, "refusing PUT outside the configuration file");
            return self.send_error(cx, Status::FORBIDDEN, AuthScheme::None);
        }

        if let Some(status) = self.refusal() {
            return self.send_error(cx, status, AuthScheme::None);
        }

        if !self.create_upload(cx)? {
            return Ok(());
        }

        self.completion = Some(Completion::Install);
        self.start_body(cx)
    }

    /// Open a temporary file for the request body, answering 500 if that fails.
    fn create_upload(&mut self, cx: &mut Context) -> Result<bool, Error> {
        match TempFile::create(&cx.config.request_root) {
            Ok(file) => {
                self.upload = Upload::File(file);
                Ok(true)
            }
            Err(error) => {
                event!(Level::ERROR, ?error, dir = ?cx.config.request_root, "failed to create request file");
                self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None)?;
                Ok(false)
            }
        }
    }

    fn start_body(&mut self, cx: &mut Context) -> Result<(), Error> {
        self.received = 0;

        if self.body.is_none() {
            return self.complete_body(cx);
        }

        self.state = State::ReadingBody;
        Ok(())
    }

    fn read_body(&mut self, cx: &mut Context) -> Result<bool, Error> {
        let Some(decoder) = &mut self.body else {
            self.complete_body(cx)?;
            return Ok(true);
        };

        match decoder.decode(&mut self.input) {
            Ok(Decoded::Data(data)) => {
                self.store_body(cx, &data)?;
                Ok(true)
            }
            Ok(Decoded::Done) => {
                self.body = None;
                self.complete_body(cx)?;
                Ok(true)
            }
            Ok(Decoded::NeedMore) => match self.fill_input()? {
                Fill::Data => Ok(true),
                Fill::Blocked => Ok(false),
                Fill::Eof => {
                    self.close("client closed connection mid-body");
                    Ok(false)
                }
            },
            Err(error) => {
                event!(Level::WARN, %error, "bad request body");
                self.send_error(cx, Status::BAD_REQUEST, AuthScheme::None)?;
                Ok(true)
            }
        }
    }

    fn store_body(&mut self, cx: &mut Context, data: &[u8]) -> Result<(), Error> {
        self.received += data.len() as u64;

        if cx.config.exceeds_request_size(self.received) {
            event!(Level::WARN, received = self.received, "request body over the size limit");
            return self.send_error(cx, Status::REQUEST_TOO_LARGE, AuthScheme::None);
        }

        match &mut self.upload {
            Upload::Ipp(buffer) => buffer.extend_from_slice(data),
            Upload::File(file) => {
                if let Err(error) = file.write_all(data) {
                    event!(Level::ERROR, ?error, "failed to write request file");
                    return self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None);
                }
            }
            Upload::None => {}
        }

        Ok(())
    }

    fn complete_body(&mut self, cx: &mut Context) -> Result<(), Error> {
        self.state = State::Dispatched;
        let upload = std::mem::replace(&mut self.upload, Upload::None);

        match (self.completion.take(), upload) {
            (Some(Completion::Ipp { uri }), Upload::Ipp(body)) => self.process_ipp(cx, &uri, &body),
            (
                Some(Completion::Gateway {
                    head,
                    program,
                    options,
                }),
                Upload::File(file),
            ) => {
                let input = match file.reopen() {
                    Ok(input) => input,
                    Err(error) => {
                        event!(Level::ERROR, ?error, "failed to reopen request file");
                        return self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None);
                    }
                };

                // The helper holds its own handle, the file itself can go
                let length = file.written();
                drop(file);

                self.start_helper(cx, &head, program, &options, Some((input, length)))
            }
            (Some(Completion::Install), Upload::File(file)) => self.install(cx, &file),
            _ => {
                event!(Level::ERROR, "request body completed without a destination");
                self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None)
            }
        }
    }

    fn process_ipp(&mut self, cx: &mut Context, uri: &str, body: &[u8]) -> Result<(), Error> {
        let response = cx.services.ipp.process(&IppRequest {
            uri,
            body,
            peer: self.peer.ip(),
            hostname: &self.hostname,
            user: self.auth.user.as_deref(),
            encrypted: self.is_encrypted(),
            locale: self.locale.as_ref(),
        });

        let mut fields = Fields::new();
        fields.set("Content-Length", response.body.len().to_string());

        self.send_header(cx, response.status, Some("application/ipp"), fields);
        self.out.extend_from_slice(&response.body);

        self.state = State::Writing;
        Ok(())
    }

    fn install(&mut self, cx: &mut Context, file: &TempFile) -> Result<(), Error> {
        if let Err(error) = install_config(file, &cx.resolver.roots().config_file) {
            event!(Level::ERROR, error = ?Error::new(error), "failed to install configuration");
            return self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None);
        }

        cx.events.push(ServerEvent::ReloadScheduled);

        let mut fields = Fields::new();
        fields.set("Content-Length", "0");
        self.send_header(cx, Status::CREATED, None, fields);

        self.state = State::Writing;
        Ok(())
    }

    fn start_helper(
        &mut self,
        cx: &mut Context,
        head: &RequestHead,
        program: PathBuf,
        options: &str,
        input: Option<(File, u64)>,
    ) -> Result<(), Error> {
        let program_name = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (path_info, query_string) = match options.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (options, None),
        };

        let has_body = input.is_some();
        let field = |name: &str| head.fields.get(name).map(String::from);

        let request = GatewayRequest {
            args: GatewayRequest::args_for(&program_name, options),
            program,
            method: head.method,
            script_name: head.path().to_string(),
            path_info: (!path_info.is_empty()).then(|| path_info.to_string()),
            query_string,
            content_length: input.as_ref().map(|(_, length)| *length),
            content_type: field("Content-Type").filter(|_| has_body),
            remote_addr: self.peer.ip(),
            remote_host: self.hostname.clone(),
            remote_user: self.auth.user.clone(),
            auth_type: self
                .auth
                .user
                .as_ref()
                .map(|_| auth_type_name(self.auth.scheme).to_string()),
            cookie: field("Cookie"),
            referer: field("Referer"),
            user_agent: field("User-Agent"),
            lang: self.locale.as_ref().map(Locale::lang_env),
            encrypted: self.is_encrypted(),
            server_name: cx.config.server_name.clone(),
            server_port: self.local.port(),
            server_admin: cx.config.server_admin.clone(),
            protocol: head.version,
        };

        match gateway::spawn(&request, input.map(|(file, _)| file), &cx.config.helper_env) {
            Ok(helper) => {
                self.source = ResponseSource::Helper(helper);
                self.state = State::Writing;
                Ok(())
            }
            Err(error) => {
                event!(Level::ERROR, error = ?Error::new(error), "unable to start helper");
                self.send_error(cx, Status::NOT_FOUND, AuthScheme::None)
            }
        }
    }

    /// Read helper output until it blocks, ends, or enough output is pending.
    fn pump_helper(&mut self, cx: &mut Context) -> Result<(), Error> {
        let mut buffer = [0; READ_CHUNK];

        while self.out.len() < HIGH_WATER {
            let ResponseSource::Helper(helper) = &mut self.source else {
                return Ok(());
            };

            match helper.read(&mut buffer) {
                Ok(0) => return self.helper_finished(cx),
                Ok(read) => {
                    self.last_activity = Instant::now();
                    self.helper_output(cx, &buffer[..read])?;
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    event!(Level::WARN, ?error, "failed to read helper output");
                    return self.helper_finished(cx);
                }
            }
        }

        Ok(())
    }

    /// Relay helper output, pulling out its header block first.
    pub fn on_helper_ready(&mut self, cx: &mut Context) -> Result<(), Error> {
        if self.state == State::Writing {
            self.pump_helper(cx)?;
        }

        self.on_ready(cx)
    }

    fn helper_output(&mut self, cx: &mut Context, data: &[u8]) -> Result<(), Error> {
        let scanned = match self.scanner.feed(data) {
            Ok(scanned) => scanned,
            Err(error) => {
                event!(Level::ERROR, %error, "bad helper output");
                self.source = ResponseSource::None;

                if self.sent_header {
                    self.close("helper output unusable");
                    return Ok(());
                }
                return self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None);
            }
        };

        if let Some(header) = scanned.header {
            self.send_helper_header(cx, header);
        }

        let is_head = self.current.as_ref().map(|c| c.method) == Some(Method::Head);
        if !scanned.body.is_empty() && !is_head {
            self.queue_body(&scanned.body);
        }

        Ok(())
    }

    fn send_helper_header(&mut self, cx: &Context, header: HelperHeader) {
        let HelperHeader {
            status,
            mut fields,
            cookies,
        } = header;

        let content_type = fields.remove("Content-Type");
        let is_head = self.current.as_ref().map(|c| c.method) == Some(Method::Head);

        if fields.get("Content-Length").is_none() && !is_head {
            if self.version >= Version::HTTP_1_1 {
                self.chunked = true;
                fields.set("Transfer-Encoding", "chunked");
            } else {
                // The body runs until the helper closes its output
                self.keep_alive = false;
            }
        }

        for cookie in cookies {
            fields.append("Set-Cookie", cookie);
        }

        self.send_header(cx, status, content_type.as_deref(), fields);
    }

    fn helper_finished(&mut self, cx: &mut Context) -> Result<(), Error> {
        if let ResponseSource::Helper(helper) =
            std::mem::replace(&mut self.source, ResponseSource::None)
        {
            helper.finish(cx.reaper);
        }

        if !self.sent_header {
            event!(Level::ERROR, "helper exited without sending a header");
            return self.send_error(cx, Status::SERVER_ERROR, AuthScheme::None);
        }

        if self.chunked {
            self.out.extend_from_slice(b"0\r\n\r\n");
        }

        Ok(())
    }

    fn queue_body(&mut self, data: &[u8]) {
        if self.chunked {
            self.out
                .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            self.out.extend_from_slice(data);
            self.out.extend_from_slice(b"\r\n");
        } else {
            self.out.extend_from_slice(data);
        }
    }

    /// The status to answer with if the authorizer refused the request.
    fn refusal(&self) -> Option<Status> {
        (self.auth.status != Status::OK).then_some(self.auth.status)
    }

    fn is_local(&self) -> bool {
        self.peer.ip().is_loopback()
    }

    fn header(
        &self,
        cx: &Context,
        status: Status,
        content_type: Option<&str>,
        challenge: Option<String>,
    ) -> ResponseHeader {
        let header_cx = HeaderContext {
            version: self.version,
            keep_alive: self.keep_alive,
            keep_alive_timeout: cx.config.keep_alive_timeout,
            server: &cx.config.server_header,
            locale: self.locale.as_ref(),
            challenge,
        };

        build_header(status, content_type, &header_cx)
    }

    /// Queue a response header, with `fields` on top of the common ones.
    fn send_header(&mut self, cx: &Context, status: Status, content_type: Option<&str>, fields: Fields) {
        self.send_header_with(cx, status, content_type, fields, None);
    }

    fn send_header_with(
        &mut self,
        cx: &Context,
        status: Status,
        content_type: Option<&str>,
        fields: Fields,
        challenge: Option<String>,
    ) {
        let mut header = self.header(cx, status, content_type, challenge);

        for (name, value) in fields.iter() {
            if name.eq_ignore_ascii_case("Set-Cookie") {
                header.fields.append(name, value);
            } else {
                header.fields.set(name, value);
            }
        }

        header.encode(&mut self.out);
        self.sent_header = true;
        self.status = status;
    }

    /// Answer with an error or private status and an explanatory page.
    fn send_error(&mut self, cx: &mut Context, status: Status, hint: AuthScheme) -> Result<(), Error> {
        let encrypted = self.is_encrypted();
        let status = error_status(status, cx.config.default_encryption, encrypted, self.is_local());

        // Negotiate authentication continues on the same connection
        if status.is_error() && self.auth.scheme != AuthScheme::Negotiate {
            self.keep_alive = false;
        }

        // An unread body would be taken for the next request
        if self.body.take().is_some() {
            self.keep_alive = false;
        }
        self.upload = Upload::None;
        self.completion = None;
        self.source = ResponseSource::None;

        let challenge = if status == Status::UNAUTHORIZED {
            www_authenticate(&ChallengeContext {
                hint,
                policy: self.auth.policy.as_ref(),
                default_scheme: cx.config.default_auth_scheme,
                local: self.is_local(),
                negotiated: self.auth.scheme,
                system_groups: &cx.config.system_groups,
            })
        } else {
            None
        };

        let upgrade_url = (status == Status::UPGRADE_REQUIRED).then(|| self.upgrade_url(cx));
        let page = (status.is_error() || status == Status::WEB_INTERFACE_DISABLED)
            .then(|| error_page(status, self.locale.as_ref(), upgrade_url.as_deref()));

        let mut fields = Fields::new();
        let length = page.as_ref().map(String::len).unwrap_or(0);
        fields.set("Content-Length", length.to_string());

        let content_type = page.as_ref().map(|_| "text/html");
        self.send_header_with(cx, status, content_type, fields, challenge);

        let is_head = self.current.as_ref().map(|c| c.method) == Some(Method::Head);
        if let Some(page) = page.filter(|_| !is_head) {
            self.out.extend_from_slice(page.as_bytes());
        }

        self.state = State::Writing;
        Ok(())
    }

    fn upgrade_url(&self, cx: &Context) -> String {
        let host = self
            .current
            .as_ref()
            .and_then(|current| current.host.as_deref())
            .map(strip_port)
            .unwrap_or(cx.config.server_name.as_str());

        let uri = self
            .current
            .as_ref()
            .map(|current| current.uri.as_str())
            .unwrap_or("/");

        format!("https://{}:{}{}", host, self.local.port(), uri)
    }

    /// Wrap up a response whose output has all gone out.
    ///
    /// Returns whether the connection is ready for another request.
    fn finish_response(&mut self) -> bool {
        self.log_access();
        self.current = None;
        self.served += 1;

        if self.keep_alive {
            self.state = State::Waiting;
            true
        } else {
            self.close("response complete");
            false
        }
    }

    fn log_access(&self) {
        let (method, uri) = self
            .current
            .as_ref()
            .map(|current| (current.method.as_str(), current.uri.as_str()))
            .unwrap_or(("-", "-"));
        let user = self.auth.user.as_deref().unwrap_or("-");

        event!(
            target: "quire::access",
            Level::INFO,
            host = %self.hostname,
            user,
            method,
            uri,
            status = self.status.wire().code(),
            bytes = self.bytes_sent,
            "request"
        );
    }
}

/// Work out how the request body is framed.
///
/// Errors carry the status to refuse the request with.
fn body_framing(head: &RequestHead, config: &ServerConfig) -> Result<Option<BodyDecoder>, Status> {
    if head.is_chunked() {
        return Ok(Some(BodyDecoder::chunked()));
    }

    let Some(value) = head.fields.get("Content-Length") else {
        return Ok(None);
    };

    let length: i64 = value.trim().parse().map_err(|_| Status::BAD_REQUEST)?;
    if length < 0 {
        return Err(Status::BAD_REQUEST);
    }

    let length = length as u64;
    if config.exceeds_request_size(length) {
        return Err(Status::REQUEST_TOO_LARGE);
    }

    Ok((length > 0).then(|| BodyDecoder::length(length)))
}

fn wants_tls_upgrade(fields: &Fields) -> bool {
    let upgrade = fields
        .get("Upgrade")
        .map(|value| {
            value
                .split(',')
                .any(|protocol| protocol.trim().to_ascii_uppercase().starts_with("TLS/"))
        })
        .unwrap_or(false);

    upgrade && fields.has_token("Connection", "Upgrade")
}

fn helper_program(config: &ServerConfig, prefix: &str) -> PathBuf {
    config
        .cgi_bin
        .join(format!("{}.cgi", prefix.trim_start_matches('/')))
}

fn is_executable_cgi(found: &FoundFile) -> bool {
    let is_cgi = found
        .path
        .extension()
        .map(|extension| extension == "cgi")
        .unwrap_or(false);

    is_cgi && found.metadata.is_file() && found.metadata.permissions().mode() & 0o111 != 0
}

fn query_options(head: &RequestHead) -> String {
    head.query()
        .map(|query| format!("?{}", query))
        .unwrap_or_default()
}

/// Media type without parameters.
fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

fn auth_type_name(scheme: AuthScheme) -> &'static str {
    match scheme {
        AuthScheme::None => "",
        AuthScheme::Basic => "Basic",
        AuthScheme::Negotiate => "Negotiate",
        AuthScheme::Local => "Local",
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::{TcpListener as StdListener, TcpStream as StdStream},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{Authorizer, EncryptionPolicy};

    /// Demands credentials for everything.
    struct Challenge;

    impl Authorizer for Challenge {
        fn authorize(&mut self, _request: &AuthRequest) -> Authorization {
            Authorization {
                status: Status::UNAUTHORIZED,
                ..Authorization::default()
            }
        }
    }

    fn head(fields: &[(&str, &str)]) -> RequestHead {
        let mut head = RequestHead {
            method: Method::Post,
            uri: "/jobs".to_string(),
            version: Version::HTTP_1_1,
            fields: Fields::new(),
        };
        for (name, value) in fields {
            head.fields.append(name, *value);
        }
        head
    }

    #[test]
    fn content_length_limits() {
        let config = ServerConfig {
            max_request_size: 100,
            ..ServerConfig::default()
        };

        let framing = |value| body_framing(&head(&[("Content-Length", value)]), &config);

        assert!(matches!(framing("100"), Ok(Some(BodyDecoder::Length { remaining: 100 }))));
        assert!(matches!(framing("0"), Ok(None)));
        assert!(matches!(framing("101"), Err(Status::REQUEST_TOO_LARGE)));
        assert!(matches!(framing("-1"), Err(Status::BAD_REQUEST)));
        assert!(matches!(framing("ten"), Err(Status::BAD_REQUEST)));
    }

    #[test]
    fn chunked_framing_wins() {
        let config = ServerConfig::default();
        let head = head(&[("Transfer-Encoding", "chunked"), ("Content-Length", "5")]);

        assert!(matches!(
            body_framing(&head, &config),
            Ok(Some(BodyDecoder::Chunked(_)))
        ));
    }

    #[test]
    fn upgrade_request_detection() {
        let mut fields = Fields::new();
        fields.set("Connection", "keep-alive, Upgrade");
        fields.set("Upgrade", "TLS/1.2, HTTP/1.1");
        assert!(wants_tls_upgrade(&fields));

        fields.set("Connection", "keep-alive");
        assert!(!wants_tls_upgrade(&fields));
    }

    #[test]
    fn remote_plaintext_challenge_becomes_upgrade_required() -> Result<(), Error> {
        let config = ServerConfig {
            default_encryption: EncryptionPolicy::Required,
            ..ServerConfig::default()
        };
        let mut services = Services {
            authorizer: Box::new(Challenge),
            ..Services::default()
        };
        let resolver = Resolver::new(config.roots.clone());
        let mut reaper = Reaper::default();
        let mut events = Vec::new();

        // Not loopback, so the client counts as remote
        let peer: SocketAddr = "203.0.113.7:40000".parse()?;
        let (mut connection, mut client) = given_connection(peer)?;
        client.write_all(b"GET /admin HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

        let started = Instant::now();
        while !connection.is_closed() {
            if started.elapsed() > Duration::from_secs(5) {
                bail!("connection never finished");
            }

            let mut cx = Context {
                config: &config,
                services: &mut services,
                resolver: &resolver,
                tls: None,
                reaper: &mut reaper,
                events: &mut events,
            };
            connection.on_ready(&mut cx)?;
            thread::sleep(Duration::from_millis(5));
        }

        let mut response = String::new();
        client.read_to_string(&mut response)?;

        assert!(response.starts_with("HTTP/1.1 426"), "{}", response);
        assert!(response.contains("Upgrade: TLS/1.2, TLS/1.1, TLS/1.0\r\n"));
        assert!(response.contains("URL=https://localhost:"));
        assert!(!response.contains("WWW-Authenticate"));

        Ok(())
    }

    fn given_connection(peer: SocketAddr) -> Result<(Connection, StdStream), Error> {
        let listener = StdListener::bind("127.0.0.1:0")?;
        let client = StdStream::connect(listener.local_addr()?)?;
        client.set_read_timeout(Some(Duration::from_secs(5)))?;

        let (stream, _) = listener.accept()?;
        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;

        let connection = Connection::new(
            0,
            Token(0),
            TcpStream::from_std(stream),
            peer,
            local,
            peer.ip().to_string(),
            ListenerEncryption::IfRequested,
        );

        Ok((connection, client))
    }

    #[test]
    fn helper_programs_live_in_cgi_bin() {
        let config = ServerConfig {
            cgi_bin: PathBuf::from("/usr/lib/quire/cgi-bin"),
            ..ServerConfig::default()
        };

        assert_eq!(
            helper_program(&config, "/printers"),
            PathBuf::from("/usr/lib/quire/cgi-bin/printers.cgi")
        );
    }
}

use std::{
    fs::{self, Permissions},
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    os::unix::fs::PermissionsExt,
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{bail, Error};
use quire_http::{ListenerConfig, ListenerEncryption, Roots, Server, ServerConfig, ServerEvent, Services};
use tempfile::TempDir;
use tracing_test::traced_test;

const DEADLINE: Duration = Duration::from_secs(5);

#[test]
#[traced_test]
fn get_serves_document() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(&world.dir.path().join("doc/hello.html"), "<p>hi</p>", 0o644)?;

    let response = when_requested(
        &mut world,
        "GET /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 200"), "{}", response.text);
    assert!(response.text.contains("Content-Length: 9\r\n"));
    assert!(response.text.contains("Last-Modified: "));
    assert!(response.text.contains("Connection: close\r\n"));
    assert!(response.text.ends_with("\r\n\r\n<p>hi</p>"));

    Ok(())
}

#[test]
#[traced_test]
fn head_sends_no_body() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(&world.dir.path().join("doc/hello.html"), "<p>hi</p>", 0o644)?;

    let response = when_requested(
        &mut world,
        "HEAD /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 200"), "{}", response.text);
    assert!(response.text.contains("Content-Length: 9\r\n"));
    assert!(response.text.ends_with("\r\n\r\n"));

    Ok(())
}

#[test]
#[traced_test]
fn missing_document_is_not_found() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;

    let response = when_requested(
        &mut world,
        "GET /nothing.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 404"), "{}", response.text);
    assert!(response.text.contains("Content-Type: text/html; charset=utf-8\r\n"));

    Ok(())
}

#[test]
#[traced_test]
fn traversal_is_forbidden() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;

    let raw = when_requested(
        &mut world,
        "GET /a/../../etc/passwd HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;
    assert!(raw.text.starts_with("HTTP/1.1 403"), "{}", raw.text);

    let encoded = when_requested(
        &mut world,
        "GET /a/%2e%2e/%2e%2e/etc/passwd HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;
    assert!(encoded.text.starts_with("HTTP/1.1 403"), "{}", encoded.text);

    Ok(())
}

#[test]
#[traced_test]
fn unchanged_document_is_not_modified() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(&world.dir.path().join("doc/hello.html"), "<p>hi</p>", 0o644)?;

    let first = when_requested(
        &mut world,
        "GET /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;
    let Some(modified) = first.field("Last-Modified") else {
        bail!("no Last-Modified in {}", first.text);
    };

    let request = format!(
        "GET /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nIf-Modified-Since: {}; length=9\r\n\r\n",
        modified
    );
    let second = when_requested(&mut world, &request)?;

    assert!(second.text.starts_with("HTTP/1.1 304"), "{}", second.text);
    assert!(!second.text.contains("<p>hi</p>"));

    Ok(())
}

#[test]
#[traced_test]
fn put_installs_configuration() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    let config_file = world.dir.path().join("etc/quired.conf");
    given_file(&config_file, "old\n", 0o640)?;

    let response = when_requested(
        &mut world,
        "PUT /admin/conf/quired.conf HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 4\r\n\r\nnew\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 201"), "{}", response.text);
    assert_eq!(response.events, vec![ServerEvent::ReloadScheduled]);
    assert_eq!(fs::read_to_string(&config_file)?, "new\n");
    assert_eq!(fs::read_to_string(world.dir.path().join("etc/quired.conf.O"))?, "old\n");
    then_no_request_files(&world)?;

    Ok(())
}

#[test]
#[traced_test]
fn put_elsewhere_is_forbidden() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;

    let response = when_requested(
        &mut world,
        "PUT /admin/conf/other.conf HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 4\r\n\r\nnew\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 403"), "{}", response.text);
    assert!(response.events.is_empty());
    then_no_request_files(&world)?;

    Ok(())
}

#[test]
#[traced_test]
fn body_length_is_checked() -> Result<(), Error> {
    let mut world = given_server(|config| config.max_request_size = 16)?;

    let too_large = when_requested(
        &mut world,
        "POST /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 17\r\n\r\n",
    )?;
    assert!(too_large.text.starts_with("HTTP/1.1 413"), "{}", too_large.text);

    let negative = when_requested(
        &mut world,
        "POST /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: -1\r\n\r\n",
    )?;
    assert!(negative.text.starts_with("HTTP/1.1 400"), "{}", negative.text);

    Ok(())
}

#[test]
#[traced_test]
fn helper_output_becomes_response() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(
        &world.dir.path().join("doc/redirect.cgi"),
        "#!/bin/sh\nprintf 'Status: 303\\r\\nLocation: http://localhost/next\\r\\n\\r\\nBODY'\n",
        0o755,
    )?;

    let response = when_requested(&mut world, "GET /redirect.cgi HTTP/1.0\r\n\r\n")?;

    assert!(response.text.starts_with("HTTP/1.0 303"), "{}", response.text);
    assert_eq!(response.field("Location"), Some("http://localhost/next"));
    assert!(!response.text.contains("Transfer-Encoding"));
    assert!(response.text.ends_with("\r\n\r\nBODY"));

    Ok(())
}

#[test]
#[traced_test]
fn helper_output_is_chunked_on_http11() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(
        &world.dir.path().join("doc/page.cgi"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\nhello'\n",
        0o755,
    )?;

    let response = when_requested(
        &mut world,
        "GET /page.cgi HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 200"), "{}", response.text);
    assert_eq!(response.field("Transfer-Encoding"), Some("chunked"));
    assert!(response.text.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));

    Ok(())
}

#[test]
#[traced_test]
fn per_host_limit_refuses_extra_clients() -> Result<(), Error> {
    let mut world = given_server(|config| config.max_clients_per_host = 1)?;
    given_file(&world.dir.path().join("doc/hello.html"), "<p>hi</p>", 0o644)?;

    let mut first = TcpStream::connect(world.addr)?;
    first.set_nonblocking(true)?;
    when_settled(&mut world)?;
    assert_eq!(world.server.connection_count(), 1);

    let mut second = TcpStream::connect(world.addr)?;
    second.set_nonblocking(true)?;
    when_settled(&mut world)?;
    assert_eq!(world.server.connection_count(), 1);

    let refused = when_read_until_closed(&mut world, &mut second)?;
    assert!(refused.text.is_empty());

    first.write_all(b"GET /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")?;
    let served = when_read_until_closed(&mut world, &mut first)?;
    assert!(served.text.starts_with("HTTP/1.1 200"), "{}", served.text);

    assert!(logs_contain("too many connections"));

    Ok(())
}

#[test]
#[traced_test]
fn unknown_methods() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;

    let delete = when_requested(
        &mut world,
        "DELETE /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;
    assert!(delete.text.starts_with("HTTP/1.1 501"), "{}", delete.text);

    let unknown = when_requested(
        &mut world,
        "BREW /pot HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;
    assert!(unknown.text.starts_with("HTTP/1.1 405"), "{}", unknown.text);
    assert_eq!(unknown.field("Allow"), Some("GET, HEAD, OPTIONS, POST, PUT"));

    Ok(())
}

#[test]
#[traced_test]
fn http11_requires_host() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(&world.dir.path().join("doc/hello.html"), "<p>hi</p>", 0o644)?;

    let missing = when_requested(&mut world, "GET /hello.html HTTP/1.1\r\nConnection: close\r\n\r\n")?;
    assert!(missing.text.starts_with("HTTP/1.1 400"), "{}", missing.text);

    let foreign = when_requested(
        &mut world,
        "GET /hello.html HTTP/1.1\r\nHost: evil.example.com\r\nConnection: close\r\n\r\n",
    )?;
    assert!(foreign.text.starts_with("HTTP/1.1 400"), "{}", foreign.text);

    let old = when_requested(&mut world, "GET /hello.html HTTP/1.0\r\n\r\n")?;
    assert!(old.text.starts_with("HTTP/1.0 200"), "{}", old.text);

    Ok(())
}

#[test]
#[traced_test]
fn expect_continue_sends_interim_response() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(&world.dir.path().join("etc/quired.conf"), "old\n", 0o640)?;

    let response = when_requested(
        &mut world,
        "PUT /admin/conf/quired.conf HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\nnew\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 100"), "{}", response.text);
    assert!(response.text.contains("\r\n\r\nHTTP/1.1 201"));

    let refused = when_requested(
        &mut world,
        "PUT /admin/conf/quired.conf HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nExpect: teapot\r\nContent-Length: 4\r\n\r\nnew\n",
    )?;
    assert!(refused.text.starts_with("HTTP/1.1 417"), "{}", refused.text);

    Ok(())
}

#[test]
#[traced_test]
fn options_lists_methods() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;

    let response = when_requested(
        &mut world,
        "OPTIONS * HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 200"), "{}", response.text);
    assert_eq!(response.field("Allow"), Some("GET, HEAD, OPTIONS, POST, PUT"));

    let star_get = when_requested(
        &mut world,
        "GET * HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;
    assert!(star_get.text.starts_with("HTTP/1.1 400"), "{}", star_get.text);

    Ok(())
}

#[test]
#[traced_test]
fn disabled_web_interface_answers_with_page() -> Result<(), Error> {
    let mut world = given_server(|config| config.web_interface = false)?;

    let response = when_requested(
        &mut world,
        "GET /printers/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 200"), "{}", response.text);
    assert!(response.text.contains("Web Interface is Disabled"));

    Ok(())
}

#[test]
#[traced_test]
fn keep_alive_serves_pipelined_requests() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(&world.dir.path().join("doc/a.html"), "aaa", 0o644)?;
    given_file(&world.dir.path().join("doc/b.html"), "bbb", 0o644)?;

    let response = when_requested(
        &mut world,
        "GET /a.html HTTP/1.1\r\nHost: localhost\r\n\r\nGET /b.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    let first = response.text.find("\r\n\r\naaa");
    let second = response.text.find("\r\n\r\nbbb");
    assert!(matches!((first, second), (Some(a), Some(b)) if a < b), "{}", response.text);
    assert!(response.text.contains("Keep-Alive: timeout=30\r\n"));

    Ok(())
}

#[test]
#[traced_test]
fn chunked_body_over_limit_is_refused() -> Result<(), Error> {
    let mut world = given_server(|config| config.max_request_size = 8)?;
    let config_file = world.dir.path().join("etc/quired.conf");
    given_file(&config_file, "old\n", 0o640)?;

    // No length up front, so only the running total can catch this one
    let response = when_requested(
        &mut world,
        "PUT /admin/conf/quired.conf HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n8\r\nefghijkl\r\n0\r\n\r\n",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 413"), "{}", response.text);
    assert!(response.events.is_empty());
    assert_eq!(fs::read_to_string(&config_file)?, "old\n");
    then_no_request_files(&world)?;

    Ok(())
}

#[test]
#[traced_test]
fn post_body_reaches_helper_input() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(
        &world.dir.path().join("doc/echo.cgi"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\n'\necho \"len=$CONTENT_LENGTH\"\ncat\n",
        0o755,
    )?;

    let response = when_requested(
        &mut world,
        "POST /echo.cgi HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    )?;

    assert!(response.text.starts_with("HTTP/1.1 200"), "{}", response.text);
    assert_eq!(response.field("Transfer-Encoding"), Some("chunked"));
    assert!(response.text.contains("len=5\n"), "{}", response.text);
    assert!(response.text.contains("hello"), "{}", response.text);
    assert!(response.text.ends_with("0\r\n\r\n"));
    then_no_request_files(&world)?;

    Ok(())
}

#[test]
#[traced_test]
fn keep_alive_continues_after_helper() -> Result<(), Error> {
    let mut world = given_server(|_| {})?;
    given_file(
        &world.dir.path().join("doc/page.cgi"),
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\nhello'\n",
        0o755,
    )?;
    given_file(&world.dir.path().join("doc/b.html"), "bbb", 0o644)?;

    let response = when_requested(
        &mut world,
        "GET /page.cgi HTTP/1.1\r\nHost: localhost\r\n\r\nGET /b.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )?;

    let first = response.text.find("\r\n\r\n5\r\nhello\r\n0\r\n\r\n");
    let second = response.text.find("\r\n\r\nbbb");
    assert!(matches!((first, second), (Some(a), Some(b)) if a < b), "{}", response.text);
    assert!(response.text.ends_with("\r\n\r\nbbb"));

    Ok(())
}

struct TestWorld {
    dir: TempDir,
    server: Server,
    addr: SocketAddr,
}

struct Response {
    text: String,
    events: Vec<ServerEvent>,
}

impl Response {
    fn field(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}: ", name);

        self.text
            .split("\r\n")
            .take_while(|line| !line.is_empty())
            .find_map(|line| line.strip_prefix(prefix.as_str()))
    }
}

fn given_server(configure: impl FnOnce(&mut ServerConfig)) -> Result<TestWorld, Error> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();

    for name in ["doc", "etc", "cache", "cgi-bin", "spool", "log"] {
        fs::create_dir_all(root.join(name))?;
    }

    let mut config = ServerConfig {
        listeners: vec![ListenerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            encryption: ListenerEncryption::Never,
        }],
        cgi_bin: root.join("cgi-bin"),
        request_root: root.join("spool"),
        roots: Roots {
            document_root: root.join("doc"),
            server_root: root.join("etc"),
            cache_dir: root.join("cache"),
            config_file: root.join("etc/quired.conf"),
            access_log: root.join("log/access_log"),
            error_log: root.join("log/error_log"),
            page_log: root.join("log/page_log"),
        },
        ..ServerConfig::default()
    };
    configure(&mut config);

    let server = Server::bind(config, Services::default(), None)?;
    let Some(addr) = server.local_addrs().first().copied() else {
        bail!("server has no listener");
    };

    Ok(TestWorld { dir, server, addr })
}

fn given_file(path: &Path, content: &str, mode: u32) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, content)?;
    fs::set_permissions(path, Permissions::from_mode(mode))?;

    Ok(())
}

fn when_requested(world: &mut TestWorld, request: &str) -> Result<Response, Error> {
    let mut client = TcpStream::connect(world.addr)?;
    client.write_all(request.as_bytes())?;
    client.set_nonblocking(true)?;

    when_read_until_closed(world, &mut client)
}

/// Drive the server until the client sees the connection close.
fn when_read_until_closed(world: &mut TestWorld, client: &mut TcpStream) -> Result<Response, Error> {
    let started = Instant::now();
    let mut received = Vec::new();
    let mut events = Vec::new();
    let mut buffer = [0; 4096];

    loop {
        if started.elapsed() > DEADLINE {
            bail!("timed out, received {:?}", String::from_utf8_lossy(&received));
        }

        events.extend(world.server.poll_once(Some(Duration::from_millis(10)))?);

        match client.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => received.extend_from_slice(&buffer[..read]),
            Err(error) if error.kind() == ErrorKind::WouldBlock => {}
            Err(error) if error.kind() == ErrorKind::ConnectionReset => break,
            Err(error) => return Err(error.into()),
        }
    }

    Ok(Response {
        text: String::from_utf8(received)?,
        events,
    })
}

fn when_settled(world: &mut TestWorld) -> Result<(), Error> {
    for _ in 0..10 {
        world.server.poll_once(Some(Duration::from_millis(10)))?;
    }

    Ok(())
}

fn then_no_request_files(world: &TestWorld) -> Result<(), Error> {
    let leftover: Vec<_> = fs::read_dir(world.dir.path().join("spool"))?.collect();
    assert!(leftover.is_empty(), "left over request files: {:?}", leftover);

    Ok(())
}

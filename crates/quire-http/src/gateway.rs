//! Running helper programs for dynamic resources.
//!
//! A helper gets the request through its arguments, environment and standard input, and answers
//! on standard output with a CGI header block followed by the body.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Read},
    net::IpAddr,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
};

use bytes::{Bytes, BytesMut};
use mio::unix::pipe::Receiver;
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::{percent_decode, Fields, Method, Status, Version};

/// Most environment entries a helper is started with.
pub const MAX_ENV_ENTRIES: usize = 100;

/// Largest header block accepted from a helper.
const MAX_HELPER_HEADER: usize = 32 * 1024;

/// Helper response fields passed on to the client.
const FORWARDED_FIELDS: &[&str] = &[
    "Accept-Ranges",
    "Cache-Control",
    "Content-Disposition",
    "Content-Encoding",
    "Content-Language",
    "Content-Length",
    "Content-Location",
    "Content-Security-Policy",
    "Content-Type",
    "ETag",
    "Expires",
    "Last-Modified",
    "Link",
    "Location",
    "Pragma",
    "Refresh",
    "Retry-After",
    "Vary",
    "WWW-Authenticate",
    "X-Frame-Options",
];

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("helper environment has too many entries ({count})")]
    Environment { count: usize },
    #[error("failed to start helper {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("helper output is not available")]
    Output(#[source] io::Error),
    #[error("helper header block is too large")]
    HeaderTooLarge,
}

/// Everything a helper learns about the request it answers.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub program: PathBuf,
    /// `argv`, the program name first.
    pub args: Vec<String>,
    pub method: Method,
    /// Request path the helper was reached through.
    pub script_name: String,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub remote_addr: IpAddr,
    pub remote_host: String,
    pub remote_user: Option<String>,
    pub auth_type: Option<String>,
    pub cookie: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub lang: Option<String>,
    pub encrypted: bool,
    pub server_name: String,
    pub server_port: u16,
    pub server_admin: String,
    pub protocol: Version,
}

impl GatewayRequest {
    /// Split a helper's option string into `argv`.
    ///
    /// `options` is whatever followed the helper's prefix, path info and query included.
    /// Form style queries are left encoded for the helper to parse; anything else is decoded
    /// per argument.
    pub fn args_for(program_name: &str, options: &str) -> Vec<String> {
        let decode = !options.contains('=');

        // Only the first '?' separates path info from the query
        let (path, query) = match options.split_once('?') {
            Some((path, query)) => (path, query),
            None => (options, ""),
        };

        let mut args = vec![program_name.to_string()];
        args.extend(
            path.split([' ', '+'])
                .chain(query.split([' ', '+']))
                .filter(|arg| !arg.is_empty())
                .map(|arg| {
                    if decode {
                        percent_decode(arg).unwrap_or_else(|| arg.to_string())
                    } else {
                        arg.to_string()
                    }
                }),
        );

        args
    }

    /// Environment the helper is started with, on top of `base`.
    pub fn environment(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = base.clone();
        let mut set = |name: &str, value: String| {
            env.insert(name.to_string(), value);
        };

        set("GATEWAY_INTERFACE", "CGI/1.1".to_string());
        set("REDIRECT_STATUS", "1".to_string());
        set("REQUEST_METHOD", self.method.to_string());
        set("SCRIPT_FILENAME", self.program.display().to_string());
        set("SCRIPT_NAME", self.script_name.clone());
        set("REMOTE_ADDR", self.remote_addr.to_string());
        set("REMOTE_HOST", self.remote_host.clone());
        set("SERVER_NAME", self.server_name.clone());
        set("SERVER_PORT", self.server_port.to_string());
        set("SERVER_ADMIN", self.server_admin.clone());
        set("SERVER_PROTOCOL", self.protocol.to_string());

        if self.encrypted {
            set("HTTPS", "ON".to_string());
        }

        let optional = [
            ("PATH_INFO", &self.path_info),
            ("QUERY_STRING", &self.query_string),
            ("CONTENT_TYPE", &self.content_type),
            ("REMOTE_USER", &self.remote_user),
            ("AUTH_TYPE", &self.auth_type),
            ("HTTP_COOKIE", &self.cookie),
            ("HTTP_REFERER", &self.referer),
            ("HTTP_USER_AGENT", &self.user_agent),
            ("LANG", &self.lang),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                set(name, value.clone());
            }
        }

        if let Some(length) = self.content_length {
            set("CONTENT_LENGTH", length.to_string());
        }

        env
    }
}

/// Start a helper, its output readable through the returned handle.
#[instrument("gateway::spawn", skip_all, fields(program = ?request.program))]
pub fn spawn(
    request: &GatewayRequest,
    input: Option<File>,
    base_env: &BTreeMap<String, String>,
) -> Result<HelperProcess, GatewayError> {
    let env = request.environment(base_env);
    if env.len() > MAX_ENV_ENTRIES {
        return Err(GatewayError::Environment { count: env.len() });
    }

    let mut command = Command::new(&request.program);
    if let Some((arg0, args)) = request.args.split_first() {
        command.arg0(arg0).args(args);
    }

    let stdin = input.map(Stdio::from).unwrap_or_else(Stdio::null);
    command
        .env_clear()
        .envs(&env)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(|source| GatewayError::Spawn {
        program: request.program.clone(),
        source,
    })?;

    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(GatewayError::Output(io::ErrorKind::BrokenPipe.into()));
    };

    let output = Receiver::from(stdout);
    if let Err(error) = output.set_nonblocking(true) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(GatewayError::Output(error));
    }

    event!(Level::DEBUG, pid = child.id(), "started helper");
    Ok(HelperProcess {
        child: Some(child),
        output,
    })
}

/// A running helper and the read end of its output.
///
/// Dropping the handle kills and reaps a helper that is still attached.
pub struct HelperProcess {
    child: Option<Child>,
    output: Receiver,
}

impl HelperProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn output_mut(&mut self) -> &mut Receiver {
        &mut self.output
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf)
    }

    /// Detach the helper once its output is exhausted, leaving the reaper to collect it if it
    /// hasn't exited yet.
    pub fn finish(mut self, reaper: &mut Reaper) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => event!(Level::DEBUG, pid = child.id(), %status, "helper exited"),
            Ok(None) => reaper.adopt(child),
            Err(error) => event!(Level::WARN, ?error, "failed to check helper status"),
        }
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            event!(Level::DEBUG, pid = child.id(), "killing abandoned helper");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Collects helpers that closed their output but were still running.
#[derive(Default)]
pub struct Reaper {
    children: Vec<Child>,
}

impl Reaper {
    pub fn adopt(&mut self, child: Child) {
        self.children.push(child);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Collect every helper that has exited since the last call.
    pub fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                event!(Level::DEBUG, pid = child.id(), %status, "reaped helper");
                false
            }
            Ok(None) => true,
            Err(error) => {
                event!(Level::WARN, pid = child.id(), ?error, "failed to reap helper");
                false
            }
        });
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Header block a helper sent.
#[derive(Debug)]
pub struct HelperHeader {
    pub status: Status,
    pub fields: Fields,
    pub cookies: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Scanned {
    /// Set once, when the blank line ending the header block arrives.
    pub header: Option<HelperHeader>,
    pub body: Bytes,
}

/// Separates a helper's header block from its body.
#[derive(Default)]
pub struct HeaderScanner {
    buffer: BytesMut,
    got_fields: bool,
    status: Option<Status>,
    fields: Fields,
    cookies: Vec<String>,
}

impl HeaderScanner {
    /// Whether the header block has been completed.
    pub fn got_fields(&self) -> bool {
        self.got_fields
    }

    /// Feed helper output, getting back the header once complete and any body bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<Scanned, GatewayError> {
        if self.got_fields {
            return Ok(Scanned {
                header: None,
                body: Bytes::copy_from_slice(data),
            });
        }

        self.buffer.extend_from_slice(data);

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(end + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                self.got_fields = true;

                let header = HelperHeader {
                    status: self.status.unwrap_or(Status::OK),
                    fields: std::mem::take(&mut self.fields),
                    cookies: std::mem::take(&mut self.cookies),
                };
                let body = std::mem::take(&mut self.buffer).freeze();

                return Ok(Scanned {
                    header: Some(header),
                    body,
                });
            }

            self.scan_line(line);
        }

        if self.buffer.len() > MAX_HELPER_HEADER {
            return Err(GatewayError::HeaderTooLarge);
        }

        Ok(Scanned::default())
    }

    fn scan_line(&mut self, line: &str) {
        let Some((name, value)) = line.split_once(':') else {
            event!(Level::DEBUG, line, "ignoring helper line without a field name");
            return;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Status") {
            let code = value.split_whitespace().next().and_then(|code| code.parse().ok());

            match code.and_then(Status::from_code) {
                Some(status) => self.status = Some(status),
                None => event!(Level::WARN, value, "ignoring invalid helper status"),
            }
            return;
        }

        if name.eq_ignore_ascii_case("Set-Cookie") {
            self.cookies.push(value.to_string());
            return;
        }

        match FORWARDED_FIELDS
            .iter()
            .find(|known| known.eq_ignore_ascii_case(name))
        {
            Some(known) => self.fields.set(known, value),
            None => event!(Level::DEBUG, name, "dropping helper field"),
        }
    }
}

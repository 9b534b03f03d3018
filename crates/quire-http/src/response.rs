use std::{
    fmt::Write as _,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};

use crate::{status_text, AccessPolicy, AuthScheme, EncryptionPolicy, Fields, Locale, Status, Version};

/// Methods advertised in `Allow`.
pub const ALLOWED_METHODS: &str = "GET, HEAD, OPTIONS, POST, PUT";

const UPGRADE_PROTOCOLS: &str = "TLS/1.2, TLS/1.1, TLS/1.0";

/// Status line and fields of an outgoing response.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub status: Status,
    pub version: Version,
    pub fields: Fields,
}

impl ResponseHeader {
    /// Serialize into `out`, private statuses mapped to their wire form.
    pub fn encode(&self, out: &mut BytesMut) {
        let status = self.status.wire();

        let mut text = String::new();
        let _ = write!(text, "{} {}\r\n", self.version, status);
        for (name, value) in self.fields.iter() {
            let _ = write!(text, "{}: {}\r\n", name, value);
        }
        text.push_str("\r\n");

        out.put_slice(text.as_bytes());
    }
}

/// Connection facts the header builder needs.
pub struct HeaderContext<'a> {
    pub version: Version,
    pub keep_alive: bool,
    pub keep_alive_timeout: u64,
    pub server: &'a str,
    pub locale: Option<&'a Locale>,
    /// Value for `WWW-Authenticate` on 401 responses.
    pub challenge: Option<String>,
}

/// Build a response header with the fields every response carries.
pub fn build_header(
    status: Status,
    content_type: Option<&str>,
    cx: &HeaderContext,
) -> ResponseHeader {
    let mut fields = Fields::new();

    fields.set("Date", httpdate::fmt_http_date(SystemTime::now()));
    fields.set("Server", cx.server);

    if status == Status::SWITCHING_PROTOCOLS || status == Status::UPGRADE_REQUIRED {
        fields.set("Connection", "Upgrade");
        fields.set("Upgrade", UPGRADE_PROTOCOLS);
    } else if cx.keep_alive {
        fields.set("Connection", "Keep-Alive");
        fields.set("Keep-Alive", format!("timeout={}", cx.keep_alive_timeout));
    } else {
        fields.set("Connection", "close");
    }

    if let Some(locale) = cx.locale {
        fields.set("Content-Language", locale.content_language());
    }

    if let Some(content_type) = content_type {
        fields.set("Content-Type", normalize_content_type(content_type));
    }

    if status == Status::METHOD_NOT_ALLOWED {
        fields.set("Allow", ALLOWED_METHODS);
    }

    if status == Status::UNAUTHORIZED {
        if let Some(challenge) = &cx.challenge {
            fields.set("WWW-Authenticate", challenge.clone());
        }
    }

    // Responses before 1.0 don't exist on the wire
    let version = cx.version.max(Version::HTTP_1_0);

    ResponseHeader {
        status,
        version,
        fields,
    }
}

fn normalize_content_type(content_type: &str) -> String {
    if content_type.eq_ignore_ascii_case("text/html") {
        "text/html; charset=utf-8".to_string()
    } else {
        content_type.to_string()
    }
}

/// Status actually sent for an error, given the encryption policy.
///
/// Remote plaintext clients that would be challenged are told to upgrade instead.
pub fn error_status(status: Status, policy: EncryptionPolicy, encrypted: bool, local: bool) -> Status {
    if status == Status::UNAUTHORIZED
        && policy == EncryptionPolicy::Required
        && !encrypted
        && !local
    {
        return Status::UPGRADE_REQUIRED;
    }

    status
}

pub struct ChallengeContext<'a> {
    /// Scheme the caller wants to challenge with, `None` to derive it.
    pub hint: AuthScheme,
    pub policy: Option<&'a AccessPolicy>,
    pub default_scheme: AuthScheme,
    pub local: bool,
    /// Scheme the client already authenticated with.
    pub negotiated: AuthScheme,
    pub system_groups: &'a [String],
}

/// Value of `WWW-Authenticate` for a 401, if there is anything to offer.
pub fn www_authenticate(cx: &ChallengeContext) -> Option<String> {
    let scheme = match (cx.hint, cx.policy) {
        (AuthScheme::None, Some(policy)) if policy.scheme != AuthScheme::None => policy.scheme,
        (AuthScheme::None, _) => cx.default_scheme,
        (hint, _) => hint,
    };

    let mut value = match scheme {
        AuthScheme::Basic => "Basic realm=\"quire\"".to_string(),
        AuthScheme::Negotiate => "Negotiate".to_string(),
        AuthScheme::None | AuthScheme::Local => String::new(),
    };

    // Local clients may retry with the root certificate
    let privileged = cx
        .policy
        .map(|policy| policy.names_system_group(cx.system_groups))
        .unwrap_or(false);

    if cx.local && cx.negotiated != AuthScheme::Negotiate && privileged {
        if !value.is_empty() {
            value.push_str(", ");
        }
        value.push_str("Local trc=\"y\"");
    }

    (!value.is_empty()).then_some(value)
}

/// HTML page explaining an error or private status.
pub fn error_page(status: Status, locale: Option<&Locale>, upgrade_url: Option<&str>) -> String {
    let title = status_text(status, locale);
    let url = upgrade_url.map(html_escape);

    let (refresh, message) = match (status, &url) {
        (Status::UPGRADE_REQUIRED, Some(url)) => (
            format!("<meta http-equiv=\"refresh\" content=\"3;URL={}\">\n", url),
            format!(
                "<p>You must access this page using the URL <a href=\"{0}\">{0}</a>.</p>\n",
                url
            ),
        ),
        (Status::WEB_INTERFACE_DISABLED, _) => (
            String::new(),
            "<p>The web interface is currently disabled. Run \"quirectl --enable-web\" to \
             enable it.</p>\n"
                .to_string(),
        ),
        _ => (String::new(), String::new()),
    };

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title} - quire</title>\n{refresh}</head>\n\
         <body>\n<h1>{title}</h1>\n{message}</body>\n</html>\n"
    )
}

fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }

    escaped
}

/// Whether a file must be sent in full given the client's `If-Modified-Since`.
///
/// The field may carry `; length=N` beside the date. A length of 0 and an unparsable date
/// both count as absent, and a request with neither always gets the file.
pub fn is_modified(if_modified_since: Option<&str>, size: u64, modified: SystemTime) -> bool {
    let Some(value) = if_modified_since else {
        return true;
    };

    let mut length = None;
    let mut date = None;

    for part in value.split(';').map(str::trim) {
        let parameter = part
            .split_once('=')
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case("length"));

        if let Some((_, value)) = parameter {
            length = value.trim().parse::<u64>().ok().filter(|length| *length != 0);
        } else if part.starts_with(|c: char| c.is_ascii_alphabetic()) {
            date = httpdate::parse_http_date(part).ok();
        }
    }

    let seconds = |time: SystemTime| {
        time.duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0)
    };

    match (length, date) {
        (None, None) => true,
        (length, date) => {
            length.map(|length| length != size).unwrap_or(false)
                || date
                    .map(|date| seconds(date) < seconds(modified))
                    .unwrap_or(false)
        }
    }
}

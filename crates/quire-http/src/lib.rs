//! HTTP connection engine of the quire print service.
//!
//! A `Server` accepts clients on its listeners and drives every connection through request
//! parsing, path resolution, helper programs and response writing, all from a single thread
//! woken by readiness events. Decisions that belong to the rest of the print service, such as
//! authorization and IPP processing, are handed to the `Services` it was created with.

mod body;
mod config;
mod connection;
mod gateway;
mod host;
mod install;
mod locale;
mod parser;
mod registry;
mod request;
mod response;
mod server;
mod services;
mod status;
mod transport;

pub use self::{
    body::{BodyDecoder, BodyError, Decoded},
    config::{EncryptionPolicy, HostnameLookups, ListenerConfig, ListenerEncryption, ServerConfig},
    connection::State,
    gateway::{GatewayError, GatewayRequest, HeaderScanner, HelperHeader, Scanned},
    host::valid_host,
    install::{install_config, InstallError, TempFile},
    locale::{status_text, Locale},
    parser::{HttpHeader, HttpParser, ParseError, ParserEvent, MAX_HEADER_SIZE},
    registry::{ConnectionRegistry, RejectReason, Slot},
    request::{normalize_uri, parse_request_line, percent_decode, Fields, Method, RequestHead, Version},
    response::{is_modified, ALLOWED_METHODS},
    server::{Server, ServerEvent},
    services::{
        AccessPolicy, AllowAll, AuthRequest, AuthScheme, Authorization, Authorizer,
        ExtensionClassifier, HostResolver, IppHandler, IppRequest, IppResponse, LiteralResolver,
        MimeClassifier, RejectIpp, Services, SystemResolver,
    },
    status::Status,
};

pub use quire_resolve::{PrinterDirectory, PrinterEntry, Roots, StaticPrinters};

use std::{fs, ops::ControlFlow, path::Path, sync::Arc};

use anyhow::{Context, Error};
use quire_http::{PrinterEntry, Server, ServerConfig, ServerEvent, Services, StaticPrinters};
use rustls::{Certificate, PrivateKey};
use tracing::{event, Level};

const CONFIG: &str = include_str!("spool_server.yaml");

fn main() -> Result<(), Error> {
    devutils::init_logging("info,quire_http=debug");

    let config: ServerConfig = serde_yaml::from_str(CONFIG).context("invalid demo config")?;
    given_demo_tree(&config)?;

    let mut printers = StaticPrinters::default();
    printers.insert(PrinterEntry::printer("office"));
    printers.insert(PrinterEntry::class(
        "all",
        vec!["office".to_string(), "lab".to_string()],
    ));

    let services = Services {
        printers: Box::new(printers),
        ..Services::default()
    };

    let tls = tls_config()?;
    let server = Server::bind(config, services, Some(Arc::new(tls)))?;
    for addr in server.local_addrs() {
        event!(Level::INFO, "try: curl -v http://{}/index.html", addr);
    }

    server.run(|event| match event {
        ServerEvent::ReloadScheduled => {
            event!(Level::WARN, "configuration replaced, stopping");
            ControlFlow::Break(())
        }
    })
}

/// Lay out the directories the demo config points at.
fn given_demo_tree(config: &ServerConfig) -> Result<(), Error> {
    let roots = &config.roots;

    for dir in [
        &roots.document_root,
        &roots.server_root,
        &roots.cache_dir,
        &config.cgi_bin,
        &config.request_root,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    }

    write_if_missing(
        &roots.document_root.join("index.html"),
        "<!DOCTYPE html><html><body><h1>quire</h1></body></html>\n",
    )?;
    write_if_missing(&roots.config_file, "# demo configuration\n")?;

    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<(), Error> {
    if !path.exists() {
        fs::write(path, content).with_context(|| format!("failed to write {:?}", path))?;
    }

    Ok(())
}

fn tls_config() -> Result<rustls::ServerConfig, Error> {
    event!(Level::WARN, "generating self-signed certificate");

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
    let key = PrivateKey(cert.serialize_private_key_der());
    let cert = Certificate(cert.serialize_der()?);

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    Ok(config)
}

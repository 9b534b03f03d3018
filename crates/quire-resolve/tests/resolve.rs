use std::{
    fs::{self, Permissions},
    io::Read,
    os::unix::fs::{symlink, PermissionsExt},
    path::Path,
};

use anyhow::{bail, Error};
use quire_resolve::{
    NoPrinters, PrinterEntry, ResolvedFile, Resolver, Roots, StaticPrinters,
};
use tempfile::TempDir;
use tracing_test::traced_test;

#[test]
#[traced_test]
fn locale_fallback_order() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;
    let docs = dir.path().join("doc");

    given_file(&docs.join("de_DE/page.html"), "de_DE", 0o644)?;
    given_file(&docs.join("de/page.html"), "de", 0o644)?;
    given_file(&docs.join("page.html"), "plain", 0o644)?;
    given_file(&docs.join("de/only-de.html"), "de", 0o644)?;

    assert_eq!(when_resolved(&resolver, "/page.html", Some("de_DE"))?, "de_DE");
    assert_eq!(when_resolved(&resolver, "/page.html", Some("de_AT"))?, "de");
    assert_eq!(when_resolved(&resolver, "/page.html", Some("fr_FR"))?, "plain");
    assert_eq!(when_resolved(&resolver, "/page.html", None)?, "plain");
    assert_eq!(when_resolved(&resolver, "/only-de.html", Some("de_CH"))?, "de");

    then_missing(&resolver, "/only-de.html", Some("fr"));

    Ok(())
}

#[test]
#[traced_test]
fn unreadable_localized_file_falls_back() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;
    let docs = dir.path().join("doc");

    given_file(&docs.join("es/page.html"), "private", 0o600)?;
    given_file(&docs.join("page.html"), "plain", 0o644)?;

    assert_eq!(when_resolved(&resolver, "/page.html", Some("es"))?, "plain");

    Ok(())
}

#[test]
#[traced_test]
fn directory_tries_index_in_locale_order() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;
    let docs = dir.path().join("doc");

    fs::create_dir_all(docs.join("fr_FR/guide"))?;
    given_file(&docs.join("fr/guide/index.html"), "fr index", 0o644)?;
    given_file(&docs.join("index.html"), "root index", 0o644)?;

    assert_eq!(when_resolved(&resolver, "/guide", Some("fr_FR"))?, "fr index");
    assert_eq!(when_resolved(&resolver, "/", None)?, "root index");

    Ok(())
}

#[test]
#[traced_test]
fn symlinks_are_missing() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;
    let docs = dir.path().join("doc");
    let outside = dir.path().join("outside");

    given_file(&outside.join("secret.html"), "secret", 0o644)?;
    given_file(&docs.join("real/page.html"), "real", 0o644)?;

    // Link as the leaf, and link as an intermediate directory
    symlink(outside.join("secret.html"), docs.join("leaf.html"))?;
    symlink(&outside, docs.join("linked"))?;
    symlink(docs.join("real"), docs.join("alias"))?;

    then_missing(&resolver, "/leaf.html", None);
    then_missing(&resolver, "/linked/secret.html", None);
    then_missing(&resolver, "/alias/page.html", None);
    assert_eq!(when_resolved(&resolver, "/real/page.html", None)?, "real");

    Ok(())
}

#[test]
#[traced_test]
fn documents_must_be_world_readable() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;
    let docs = dir.path().join("doc");

    given_file(&docs.join("private.html"), "private", 0o640)?;

    then_missing(&resolver, "/private.html", None);

    Ok(())
}

#[test]
#[traced_test]
fn config_file_is_served_without_permission_check() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;

    given_file(&dir.path().join("etc/quired.conf"), "Listen 631", 0o600)?;

    assert_eq!(
        when_resolved(&resolver, "/admin/conf/quired.conf", None)?,
        "Listen 631"
    );

    Ok(())
}

#[test]
#[traced_test]
fn class_description_tries_members_in_order() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;

    given_file(&dir.path().join("etc/ppd/lp1.ppd"), "lp1", 0o644)?;
    given_file(&dir.path().join("etc/ppd/lp2.ppd"), "lp2", 0o644)?;

    let mut printers = StaticPrinters::default();
    printers.insert(PrinterEntry::class(
        "office",
        vec!["lp0".into(), "lp1".into(), "lp2".into()],
    ));

    let result = resolver.resolve("/classes/office.ppd", None, &printers);
    assert_eq!(read_found(result)?, "lp1");

    Ok(())
}

#[test]
#[traced_test]
fn icon_falls_back_to_generic() -> Result<(), Error> {
    let (dir, resolver) = given_roots()?;

    given_file(&dir.path().join("doc/images/generic.png"), "generic", 0o644)?;
    given_file(&dir.path().join("cache/images/lp0.png"), "lp0", 0o644)?;

    let mut printers = StaticPrinters::default();
    printers.insert(PrinterEntry::printer("lp0"));
    printers.insert(PrinterEntry::printer("lp9"));

    assert_eq!(read_found(resolver.resolve("/printers/lp0.png", None, &printers))?, "lp0");
    assert_eq!(read_found(resolver.resolve("/printers/lp9.png", None, &printers))?, "generic");

    Ok(())
}

#[test]
#[traced_test]
fn gateway_paths() -> Result<(), Error> {
    let (_dir, resolver) = given_roots()?;

    let result = resolver.resolve("/admin/?op=add-printer", None, &NoPrinters);
    assert!(matches!(result, ResolvedFile::MustGateway));

    Ok(())
}

fn given_roots() -> Result<(TempDir, Resolver), Error> {
    let dir = tempfile::tempdir()?;

    for name in ["doc", "etc", "cache", "log"] {
        fs::create_dir_all(dir.path().join(name))?;
    }

    let roots = Roots {
        document_root: dir.path().join("doc"),
        server_root: dir.path().join("etc"),
        cache_dir: dir.path().join("cache"),
        config_file: dir.path().join("etc/quired.conf"),
        access_log: dir.path().join("log/access_log"),
        error_log: dir.path().join("log/error_log"),
        page_log: dir.path().join("log/page_log"),
    };

    Ok((dir, Resolver::new(roots)))
}

fn given_file(path: &Path, content: &str, mode: u32) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, content)?;
    fs::set_permissions(path, Permissions::from_mode(mode))?;

    Ok(())
}

fn when_resolved(resolver: &Resolver, uri: &str, locale: Option<&str>) -> Result<String, Error> {
    read_found(resolver.resolve(uri, locale, &NoPrinters))
}

fn read_found(result: ResolvedFile) -> Result<String, Error> {
    let ResolvedFile::Found(mut found) = result else {
        bail!("expected a file, got {:?}", result);
    };

    let mut content = String::new();
    found.file.read_to_string(&mut content)?;
    Ok(content)
}

fn then_missing(resolver: &Resolver, uri: &str, locale: Option<&str>) {
    let result = resolver.resolve(uri, locale, &NoPrinters);
    assert!(
        matches!(result, ResolvedFile::Missing),
        "{} resolved to {:?}",
        uri,
        result
    );
}

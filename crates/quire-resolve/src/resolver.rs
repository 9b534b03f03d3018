use std::{
    fmt,
    fs::{File, Metadata},
    path::{Path, PathBuf},
};

use tracing::{event, instrument, Level};

use crate::{
    locale_variants,
    open::{self, Candidate},
    PrinterDirectory, Root, RootedPath, Roots,
};

/// URI prefixes owned by gateway helper programs.
pub const GATEWAY_PREFIXES: &[&str] = &["/admin", "/classes", "/help", "/jobs", "/printers"];

const INDEX_NAME: &str = "index.html";

/// Outcome of resolving a request path.
///
/// The caller owns the file handle of a `Found` result.
pub enum ResolvedFile {
    Found(FoundFile),
    Missing,
    MustGateway,
}

impl fmt::Debug for ResolvedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedFile::Found(found) => f.debug_tuple("Found").field(&found.path).finish(),
            ResolvedFile::Missing => f.write_str("Missing"),
            ResolvedFile::MustGateway => f.write_str("MustGateway"),
        }
    }
}

pub struct FoundFile {
    pub file: File,
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// How a URI maps onto configured locations, before touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Gateway,
    Missing,
    Path {
        path: RootedPath,
        /// Whether the result has to be world-readable.
        checked: bool,
    },
}

pub struct Resolver {
    roots: Roots,
}

impl Resolver {
    pub fn new(roots: Roots) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// Resolve a request URI for the given locale.
    ///
    /// Anything after a `?` is ignored.
    #[instrument("Resolver::resolve", level = "debug", skip_all, fields(uri))]
    pub fn resolve(
        &self,
        uri: &str,
        locale: Option<&str>,
        printers: &dyn PrinterDirectory,
    ) -> ResolvedFile {
        let result = match self.classify(uri, locale, printers) {
            Classified::Gateway => ResolvedFile::MustGateway,
            Classified::Missing => ResolvedFile::Missing,
            Classified::Path { path, checked } => self.resolve_path(&path, checked),
        };

        event!(Level::DEBUG, ?result, "resolved");
        result
    }

    pub fn classify(
        &self,
        uri: &str,
        locale: Option<&str>,
        printers: &dyn PrinterDirectory,
    ) -> Classified {
        let path = uri.split('?').next().unwrap_or_default();

        if path.split('/').any(|segment| segment == "..") {
            return Classified::Missing;
        }

        // Printer descriptions
        if let Some(name) = resource_name(path, &["/ppd/", "/printers/", "/classes/"], ".ppd") {
            let Some(entry) = printers.find(name) else {
                return Classified::Missing;
            };

            let alternatives = entry
                .candidates()
                .into_iter()
                .filter(|name| is_plain_name(name))
                .map(|name| RootedPath::Relative {
                    root: Root::Server,
                    path: format!("ppd/{}.ppd", name),
                })
                .collect();

            return Classified::Path {
                path: RootedPath::Alternatives(alternatives),
                checked: true,
            };
        }

        // Printer icons, with a generic fallback
        if let Some(name) = resource_name(path, &["/icons/", "/printers/", "/classes/"], ".png") {
            let names = if path.starts_with("/icons/") {
                vec![name.to_string()]
            } else {
                printers
                    .find(name)
                    .map(|entry| entry.candidates().into_iter().map(String::from).collect())
                    .unwrap_or_default()
            };

            let mut alternatives: Vec<_> = names
                .iter()
                .filter(|name| is_plain_name(name))
                .map(|name| RootedPath::Relative {
                    root: Root::Cache,
                    path: format!("images/{}.png", name),
                })
                .collect();
            alternatives.push(RootedPath::Relative {
                root: Root::Document,
                path: "images/generic.png".to_string(),
            });

            return Classified::Path {
                path: RootedPath::Alternatives(alternatives),
                checked: true,
            };
        }

        if let Some(name) = path.strip_prefix("/admin/conf/") {
            if Some(name) != self.roots.config_name() {
                return Classified::Missing;
            }

            return Classified::Path {
                path: RootedPath::Literal(self.roots.config_file.clone()),
                checked: false,
            };
        }

        if let Some(name) = path.strip_prefix("/admin/log/") {
            let file = match name {
                "access_log" => &self.roots.access_log,
                "error_log" => &self.roots.error_log,
                "page_log" => &self.roots.page_log,
                _ => return Classified::Missing,
            };

            return Classified::Path {
                path: RootedPath::Literal(file.clone()),
                checked: false,
            };
        }

        if gateway_prefix(path).is_some() {
            return Classified::Gateway;
        }

        if let Some(name) = resource_name(path, &["/strings/"], ".strings") {
            return Classified::Path {
                path: RootedPath::Relative {
                    root: Root::Server,
                    path: format!("strings/{}.strings", name),
                },
                checked: false,
            };
        }

        if let Some(name) = path.strip_prefix("/rss/").filter(|name| is_plain_name(name)) {
            return Classified::Path {
                path: RootedPath::Relative {
                    root: Root::Cache,
                    path: format!("rss/{}", name),
                },
                checked: true,
            };
        }

        Classified::Path {
            path: RootedPath::Localized {
                root: Root::Document,
                path: path.to_string(),
                locale: locale.map(String::from),
            },
            checked: true,
        }
    }

    /// Resolve an already classified path.
    pub fn resolve_path(&self, path: &RootedPath, checked: bool) -> ResolvedFile {
        match path {
            RootedPath::Root(root) => self.resolve_beneath(self.roots.dir(*root), "", checked),
            RootedPath::Literal(path) => match open::open_literal(path) {
                Some(candidate) if !candidate.is_dir() => accept(candidate, checked),
                _ => ResolvedFile::Missing,
            },
            RootedPath::Relative { root, path } => {
                self.resolve_beneath(self.roots.dir(*root), path, checked)
            }
            RootedPath::Localized { root, path, locale } => {
                self.resolve_localized(self.roots.dir(*root), path, locale.as_deref(), checked)
            }
            RootedPath::Alternatives(alternatives) => {
                for alternative in alternatives {
                    if let found @ ResolvedFile::Found(_) = self.resolve_path(alternative, checked) {
                        return found;
                    }
                }

                ResolvedFile::Missing
            }
        }
    }

    fn resolve_beneath(&self, dir: &Path, path: &str, checked: bool) -> ResolvedFile {
        let Some(candidate) = open::open_beneath(dir, path) else {
            return ResolvedFile::Missing;
        };

        if !candidate.is_dir() {
            return accept(candidate, checked);
        }

        match open::open_beneath(dir, &join(&[path, INDEX_NAME])) {
            Some(index) if !index.is_dir() => accept(index, checked),
            _ => ResolvedFile::Missing,
        }
    }

    fn resolve_localized(
        &self,
        dir: &Path,
        path: &str,
        locale: Option<&str>,
        checked: bool,
    ) -> ResolvedFile {
        let variants = locale_variants(locale);

        for (i, variant) in variants.iter().enumerate() {
            let Some(candidate) = open::open_beneath(dir, &join(&[variant, path])) else {
                continue;
            };

            if !candidate.is_dir() {
                match accept(candidate, checked) {
                    found @ ResolvedFile::Found(_) => return found,
                    _ => continue,
                }
            }

            // Directory, look for its index continuing the same fallback order
            for variant in &variants[i..] {
                let index = open::open_beneath(dir, &join(&[variant, path, INDEX_NAME]));
                if let Some(index) = index.filter(|index| !index.is_dir()) {
                    if let found @ ResolvedFile::Found(_) = accept(index, checked) {
                        return found;
                    }
                }
            }

            return ResolvedFile::Missing;
        }

        ResolvedFile::Missing
    }
}

/// Helper program prefix owning `path`, if any.
///
/// Configuration and log files under `/admin` are served directly and never match.
pub fn gateway_prefix(path: &str) -> Option<&'static str> {
    if path.starts_with("/admin/conf/") || path.starts_with("/admin/log/") {
        return None;
    }

    GATEWAY_PREFIXES.iter().copied().find(|prefix| {
        path.strip_prefix(prefix)
            .map(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
            .unwrap_or(false)
    })
}

fn accept(candidate: Candidate, checked: bool) -> ResolvedFile {
    if checked && !candidate.is_world_readable() {
        event!(Level::DEBUG, path = ?candidate.path, "refusing file that is not world-readable");
        return ResolvedFile::Missing;
    }

    ResolvedFile::Found(FoundFile {
        file: candidate.file,
        path: candidate.path,
        metadata: candidate.metadata,
    })
}

/// Name between one of `prefixes` and `suffix`, if it's a single plain path segment.
fn resource_name<'a>(path: &'a str, prefixes: &[&str], suffix: &str) -> Option<&'a str> {
    prefixes
        .iter()
        .find_map(|prefix| path.strip_prefix(prefix)?.strip_suffix(suffix))
        .filter(|name| is_plain_name(name))
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.starts_with('.')
}

fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoPrinters, PrinterEntry, StaticPrinters};

    fn resolver() -> Resolver {
        Resolver::new(Roots::default())
    }

    #[test]
    fn helper_prefixes_must_gateway() {
        let resolver = resolver();

        for uri in ["/admin", "/admin/?op=x", "/printers/lp0", "/jobs?which=all", "/help/"] {
            assert_eq!(
                resolver.classify(uri, None, &NoPrinters),
                Classified::Gateway,
                "{}",
                uri
            );
        }
    }

    #[test]
    fn prefix_must_end_at_segment() {
        assert_eq!(gateway_prefix("/administrator"), None);
        assert_eq!(gateway_prefix("/admin/log/error_log"), None);
        assert_eq!(gateway_prefix("/admin/conf/quired.conf"), None);
        assert_eq!(gateway_prefix("/jobs/12"), Some("/jobs"));
    }

    #[test]
    fn config_and_logs_are_unchecked_literals() {
        let resolver = resolver();
        let roots = resolver.roots().clone();

        assert_eq!(
            resolver.classify("/admin/conf/quired.conf", None, &NoPrinters),
            Classified::Path {
                path: RootedPath::Literal(roots.config_file.clone()),
                checked: false
            }
        );
        assert_eq!(
            resolver.classify("/admin/log/page_log", None, &NoPrinters),
            Classified::Path {
                path: RootedPath::Literal(roots.page_log.clone()),
                checked: false
            }
        );
        assert_eq!(
            resolver.classify("/admin/conf/passwd", None, &NoPrinters),
            Classified::Missing
        );
    }

    #[test]
    fn class_description_fans_out_over_members() {
        let mut printers = StaticPrinters::default();
        printers.insert(PrinterEntry::class(
            "office",
            vec!["lp0".to_string(), "lp1".to_string()],
        ));

        let classified = resolver().classify("/classes/Office.ppd", None, &printers);

        let expected = RootedPath::Alternatives(vec![
            RootedPath::Relative {
                root: Root::Server,
                path: "ppd/lp0.ppd".into(),
            },
            RootedPath::Relative {
                root: Root::Server,
                path: "ppd/lp1.ppd".into(),
            },
        ]);
        assert_eq!(
            classified,
            Classified::Path {
                path: expected,
                checked: true
            }
        );
    }

    #[test]
    fn unknown_printer_icon_uses_generic() {
        let classified = resolver().classify("/printers/nope.png", None, &NoPrinters);

        let expected = RootedPath::Alternatives(vec![RootedPath::Relative {
            root: Root::Document,
            path: "images/generic.png".into(),
        }]);
        assert_eq!(
            classified,
            Classified::Path {
                path: expected,
                checked: true
            }
        );
    }

    #[test]
    fn traversal_is_missing() {
        assert_eq!(
            resolver().classify("/docs/../../etc/passwd", None, &NoPrinters),
            Classified::Missing
        );
    }

    #[test]
    fn documents_are_localized() {
        let classified = resolver().classify("/docs/index.html?x=1", Some("de_DE"), &NoPrinters);

        assert_eq!(
            classified,
            Classified::Path {
                path: RootedPath::Localized {
                    root: Root::Document,
                    path: "/docs/index.html".into(),
                    locale: Some("de_DE".into())
                },
                checked: true
            }
        );
    }
}

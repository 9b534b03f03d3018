use std::path::PathBuf;

/// A root directory named by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Document,
    Server,
    Cache,
}

/// Path to be resolved, expressed relative to configuration rather than as a raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootedPath {
    /// A root directory itself.
    Root(Root),
    /// A fully literal path taken from configuration.
    Literal(PathBuf),
    /// A path beneath a root.
    Relative { root: Root, path: String },
    /// A path beneath a root, looked up per locale with fallback and directory index probing.
    Localized {
        root: Root,
        path: String,
        locale: Option<String>,
    },
    /// Candidates tried in order, the first one that resolves wins.
    Alternatives(Vec<RootedPath>),
}

/// Locale directory names to try, most specific first, ending with the unlocalized root.
///
/// `de_DE.UTF-8` yields `["de_DE", "de", ""]`, `de` yields `["de", ""]`.
pub fn locale_variants(locale: Option<&str>) -> Vec<String> {
    let mut variants = Vec::new();

    let tag = locale
        .map(|locale| locale.split('.').next().unwrap_or_default())
        .filter(|tag| is_locale_tag(tag));

    if let Some(tag) = tag {
        variants.push(tag.to_string());

        if tag.len() > 3 && tag.as_bytes()[2] == b'_' {
            variants.push(tag[..2].to_string());
        }
    }

    variants.push(String::new());
    variants
}

/// A locale tag is used as a directory name, so only accept the strict `xx` or `xx_YY` shapes.
fn is_locale_tag(tag: &str) -> bool {
    if tag == "C" || tag == "POSIX" {
        return false;
    }

    let bytes = tag.as_bytes();
    match bytes.len() {
        2 => bytes.iter().all(u8::is_ascii_alphabetic),
        5 => {
            bytes[..2].iter().all(u8::is_ascii_alphabetic)
                && bytes[2] == b'_'
                && bytes[3..].iter().all(u8::is_ascii_alphanumeric)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_locale_falls_back_to_language_then_none() {
        assert_eq!(locale_variants(Some("de_DE")), vec!["de_DE", "de", ""]);
        assert_eq!(locale_variants(Some("fr_CA.UTF-8")), vec!["fr_CA", "fr", ""]);
    }

    #[test]
    fn short_and_missing_locales() {
        assert_eq!(locale_variants(Some("ja")), vec!["ja", ""]);
        assert_eq!(locale_variants(None), vec![""]);
        assert_eq!(locale_variants(Some("C")), vec![""]);
    }

    #[test]
    fn hostile_locales_are_ignored() {
        assert_eq!(locale_variants(Some("../etc")), vec![""]);
        assert_eq!(locale_variants(Some("de/DE")), vec![""]);
    }

    #[test]
    fn alternatives_clone_deeply() {
        let original = RootedPath::Alternatives(vec![
            RootedPath::Relative {
                root: Root::Server,
                path: "ppd/a.ppd".into(),
            },
            RootedPath::Alternatives(vec![RootedPath::Root(Root::Cache)]),
        ]);

        let copy = original.clone();
        drop(original);

        let RootedPath::Alternatives(children) = copy else {
            panic!("variant changed on clone");
        };
        assert_eq!(children.len(), 2);
    }
}

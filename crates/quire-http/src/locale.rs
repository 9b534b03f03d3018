use crate::Status;

/// Negotiated language of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    language: String,
    country: Option<String>,
    charset: Option<String>,
}

impl Locale {
    /// Parse a locale from the first entry of an `Accept-Language` style value.
    ///
    /// Accepts both `en-US` and `en_US`, ignoring quality parameters.
    pub fn parse(value: &str) -> Option<Self> {
        let first = value.split(',').next()?.split(';').next()?.trim();

        let (tag, charset) = match first.split_once('.') {
            Some((tag, charset)) => (tag, Some(charset)),
            None => (first, None),
        };

        let mut parts = tag.split(|c| c == '-' || c == '_');
        let language = parts.next()?;
        if !(2..=3).contains(&language.len()) || !language.bytes().all(|b| b.is_ascii_alphabetic())
        {
            return None;
        }

        let country = parts
            .next()
            .filter(|c| c.len() == 2 && c.bytes().all(|b| b.is_ascii_alphanumeric()))
            .map(str::to_ascii_uppercase);

        Some(Self {
            language: language.to_ascii_lowercase(),
            country,
            charset: charset.filter(|c| !c.is_empty()).map(String::from),
        })
    }

    /// Derive the locale of a request from its headers, falling back to `default`.
    ///
    /// A `charset` parameter on the request's content type becomes the locale's charset.
    pub fn from_request(
        accept_language: Option<&str>,
        content_type: Option<&str>,
        default: Option<&str>,
    ) -> Option<Self> {
        let mut locale = accept_language
            .and_then(Locale::parse)
            .or_else(|| default.and_then(Locale::parse))?;

        if let Some(charset) = content_type.and_then(charset_param) {
            locale.charset = Some(charset.to_string());
        }

        Some(locale)
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Directory style tag, `en_US` or `en`.
    pub fn tag(&self) -> String {
        match &self.country {
            Some(country) => format!("{}_{}", self.language, country),
            None => self.language.clone(),
        }
    }

    /// Value for a `Content-Language` header, `en-US` or `en`.
    pub fn content_language(&self) -> String {
        match &self.country {
            Some(country) => format!("{}-{}", self.language, country),
            None => self.language.clone(),
        }
    }

    /// Value for a helper's `LANG` variable.
    pub fn lang_env(&self) -> String {
        format!("{}.UTF-8", self.tag())
    }
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
            .filter(|value| !value.is_empty())
    })
}

/// Status title in the language of `locale`, English if no translation exists.
pub fn status_text(status: Status, locale: Option<&Locale>) -> &'static str {
    let language = locale.map(Locale::language).unwrap_or("en");

    let translated = match (language, status.code()) {
        ("de", 400) => Some("Ungültige Anfrage"),
        ("de", 401) => Some("Nicht autorisiert"),
        ("de", 403) => Some("Verboten"),
        ("de", 404) => Some("Nicht gefunden"),
        ("de", 413) => Some("Anfrage zu groß"),
        ("de", 426) => Some("Upgrade erforderlich"),
        ("de", 500) => Some("Interner Serverfehler"),
        ("de", 501) => Some("Nicht implementiert"),
        ("de", 1000) => Some("Weboberfläche ist deaktiviert"),
        ("fr", 400) => Some("Requête invalide"),
        ("fr", 401) => Some("Non autorisé"),
        ("fr", 403) => Some("Interdit"),
        ("fr", 404) => Some("Introuvable"),
        ("fr", 413) => Some("Requête trop volumineuse"),
        ("fr", 426) => Some("Mise à niveau requise"),
        ("fr", 500) => Some("Erreur interne du serveur"),
        ("fr", 501) => Some("Non implémenté"),
        ("fr", 1000) => Some("L'interface web est désactivée"),
        ("es", 400) => Some("Petición errónea"),
        ("es", 401) => Some("No autorizado"),
        ("es", 403) => Some("Prohibido"),
        ("es", 404) => Some("No encontrado"),
        ("es", 413) => Some("Petición demasiado grande"),
        ("es", 426) => Some("Se requiere actualización"),
        ("es", 500) => Some("Error interno del servidor"),
        ("es", 501) => Some("No implementado"),
        ("es", 1000) => Some("La interfaz web está desactivada"),
        _ => None,
    };

    translated.unwrap_or_else(|| status.reason())
}

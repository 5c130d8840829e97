//! Document records - externally discovered papers.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier kind for DOIs.
pub const DOI: &str = "doi";

/// A paper as reported by a discovery provider.
///
/// Immutable once received. A record carries one or more identifiers keyed
/// by kind (`doi`, `arxiv`, `openalex`, ...), in the order the provider
/// reported them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Paper title as reported
    pub title: String,

    /// Author display names
    #[serde(default)]
    pub authors: Vec<String>,

    /// Identifier kind -> normalized value
    #[serde(default, deserialize_with = "deserialize_identifiers")]
    pub identifiers: IndexMap<String, String>,

    /// Abstract text if available
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,

    /// Open-access content URL if any
    #[serde(default)]
    pub content_url: Option<String>,

    /// Name of the discovery provider that produced this record
    #[serde(default)]
    pub source: Option<String>,
}

impl DocumentRecord {
    /// Create a record with a title and no identifiers.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            identifiers: IndexMap::new(),
            abstract_text: None,
            content_url: None,
            source: None,
        }
    }

    /// Add an identifier. The value is normalized for its kind.
    pub fn with_identifier(mut self, kind: impl Into<String>, value: impl AsRef<str>) -> Self {
        let kind = normalize_kind(&kind.into());
        let value = normalize_identifier(&kind, value.as_ref());
        if !value.is_empty() {
            self.identifiers.insert(kind, value);
        }
        self
    }

    /// Add a DOI.
    pub fn with_doi(self, doi: impl AsRef<str>) -> Self {
        self.with_identifier(DOI, doi)
    }

    /// Add a provider-scoped identifier written as `<provider>:<id>`.
    ///
    /// Strings without a `:` separator are ignored.
    pub fn with_scoped_id(self, scoped: &str) -> Self {
        match scoped.split_once(':') {
            Some((provider, id)) => self.with_identifier(provider, id),
            None => self,
        }
    }

    /// Set authors.
    pub fn with_authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(|a| a.into()).collect();
        self
    }

    /// Set the abstract.
    pub fn with_abstract(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = Some(text.into());
        self
    }

    /// Set the open-access content URL.
    pub fn with_content_url(mut self, url: impl Into<String>) -> Self {
        self.content_url = Some(url.into());
        self
    }

    /// Set the discovery provider name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Look up an identifier value by kind.
    pub fn identifier(&self, kind: &str) -> Option<&str> {
        self.identifiers.get(kind).map(|s| s.as_str())
    }

    /// Identifiers with kinds and values normalized, in record order.
    ///
    /// Records built field-by-field can carry raw provider values; lookups
    /// and registry writes go through this.
    pub fn normalized_identifiers(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.identifiers.iter().filter_map(|(kind, value)| {
            let kind = normalize_kind(kind);
            let value = normalize_identifier(&kind, value);
            (!kind.is_empty() && !value.is_empty()).then_some((kind, value))
        })
    }

    /// Stable key for caching artifacts of this record.
    ///
    /// Prefers the primary identifier kind, then the first identifier,
    /// then the normalized title.
    pub fn cache_key(&self, primary_kind: &str) -> String {
        if let Some(value) = self.identifier(primary_kind) {
            return format!("{primary_kind}:{value}");
        }
        if let Some((kind, value)) = self.identifiers.first() {
            return format!("{kind}:{value}");
        }
        format!("title:{}", crate::identity::normalize_title(&self.title))
    }
}

/// Identifier kinds are case-insensitive (`DOI` and `doi` are the same kind).
pub fn normalize_kind(kind: &str) -> String {
    kind.trim().to_lowercase()
}

/// Normalize an identifier value for its kind.
///
/// DOIs are case-insensitive and often arrive as resolver URLs, so they are
/// lower-cased and stripped of `https://doi.org/` and `doi:` prefixes. Other
/// kinds are only trimmed.
pub fn normalize_identifier(kind: &str, value: &str) -> String {
    let value = value.trim();
    if kind != DOI {
        return value.to_string();
    }

    let lower = value.to_lowercase();
    let stripped = ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .unwrap_or(&lower);
    stripped.trim().to_string()
}

fn deserialize_identifiers<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = IndexMap::<String, String>::deserialize(deserializer)?;
    let mut identifiers = IndexMap::with_capacity(raw.len());
    for (kind, value) in raw {
        let kind = normalize_kind(&kind);
        let value = normalize_identifier(&kind, &value);
        if !kind.is_empty() && !value.is_empty() {
            identifiers.insert(kind, value);
        }
    }
    Ok(identifiers)
}

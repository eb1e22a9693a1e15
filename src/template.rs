use std::collections::BTreeMap;

use crate::domain::FileRecord;
use crate::error::FetchError;

pub const DEFAULT_URL_TEMPLATE: &str =
    "https://tds.ucar.edu/thredds/fileServer/{url}?api-token={token}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// URL template with `{key}` placeholders and `{{`/`}}` escapes.
///
/// Placeholders resolve in order: record fields (`url`/`url_path`, `name`,
/// `checksum`/`hash`), bound variables, then record metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    segments: Vec<Segment>,
    bound: BTreeMap<String, String>,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self, FetchError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(FetchError::InvalidTemplate(format!(
                                    "unterminated placeholder in {template:?}"
                                )));
                            }
                            Some(other) => key.push(other),
                        }
                    }
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(FetchError::InvalidTemplate(format!(
                            "empty placeholder in {template:?}"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(key.to_string()));
                }
                '}' => {
                    return Err(FetchError::InvalidTemplate(format!(
                        "unmatched '}}' in {template:?}"
                    )));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            segments,
            bound: BTreeMap::new(),
        })
    }

    /// Binds a run-wide variable such as the API token.
    pub fn bind(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.bound.insert(key.into(), value.into());
        self
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(key) => Some(key.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn references(&self, key: &str) -> bool {
        self.placeholders().any(|placeholder| placeholder == key)
    }

    /// Substitutes record values verbatim. The resulting URL is not validated.
    pub fn render(&self, record: &FileRecord) -> Result<String, FetchError> {
        let mut url = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => url.push_str(text),
                Segment::Placeholder(key) => {
                    let value = self.lookup(key, record).ok_or_else(|| {
                        FetchError::UnknownPlaceholder {
                            placeholder: key.clone(),
                            name: record.name.clone(),
                        }
                    })?;
                    url.push_str(value);
                }
            }
        }
        Ok(url)
    }

    fn lookup<'a>(&'a self, key: &str, record: &'a FileRecord) -> Option<&'a str> {
        match key {
            "url" | "url_path" => Some(record.locator.as_str()),
            "name" => Some(record.name.as_str()),
            "checksum" | "hash" => Some(record.checksum.as_str()),
            _ => self
                .bound
                .get(key)
                .or_else(|| record.metadata.get(key))
                .map(String::as_str),
        }
    }
}

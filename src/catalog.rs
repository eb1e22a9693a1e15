//! THREDDS catalog reading and normalization.
//!
//! Reading produces a raw [`CatalogNode`] tree that mirrors the document's
//! nested `dataset` elements. Normalization walks that tree, turns each leaf
//! into a [`FileRecord`] and hands the result to [`Catalog::from_records`],
//! which settles duplicates.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};

use crate::domain::{Catalog, FileRecord};
use crate::error::FetchError;

pub const SIZE_PROPERTY: &str = "size";
pub const MOD_TIME_PROPERTY: &str = "mod_time";
pub const CHECKSUM_PROPERTY: &str = "checksum";
pub const CHECKSUM_TYPE_PROPERTY: &str = "checksum_type";

const MOD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A `dataset` element as found in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogNode {
    pub name: String,
    pub url_path: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub children: Vec<CatalogNode>,
}

impl CatalogNode {
    pub fn is_file(&self) -> bool {
        self.children.is_empty()
    }
}

pub fn parse_catalog_document(path: &Path) -> Result<CatalogNode, FetchError> {
    let content = fs::read_to_string(path).map_err(|source| FetchError::CatalogRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_catalog_str(&content)
}

/// Parses catalog XML and returns the first top-level dataset.
pub fn parse_catalog_str(content: &str) -> Result<CatalogNode, FetchError> {
    let document = roxmltree::Document::parse(content)
        .map_err(|err| FetchError::CatalogParse(err.to_string()))?;
    let root = document.root_element();
    let dataset = if is_tag(root, "dataset") {
        Some(root)
    } else {
        root.children().find(|child| is_tag(*child, "dataset"))
    };
    let dataset = dataset
        .ok_or_else(|| FetchError::CatalogParse("catalog has no dataset element".to_string()))?;
    Ok(read_node(dataset))
}

fn read_node(element: roxmltree::Node<'_, '_>) -> CatalogNode {
    let mut node = CatalogNode {
        name: element.attribute("name").unwrap_or_default().to_string(),
        url_path: element.attribute("urlPath").map(str::to_string),
        ..CatalogNode::default()
    };

    for child in element.children().filter(|child| child.is_element()) {
        if is_tag(child, "property") {
            if let (Some(name), Some(value)) = (child.attribute("name"), child.attribute("value")) {
                node.properties.insert(name.to_string(), value.to_string());
            }
        } else if is_tag(child, "dataset") {
            node.children.push(read_node(child));
        }
    }
    node
}

fn is_tag(node: roxmltree::Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

/// Flattens a catalog tree into a deduplicated [`Catalog`].
///
/// Any leaf missing a required value aborts the whole normalization.
pub fn normalize(root: &CatalogNode) -> Result<Catalog, FetchError> {
    let mut records = Vec::new();
    collect_files(root, &mut records)?;
    tracing::info!(entries = records.len(), "catalog entries read");
    let catalog = Catalog::from_records(root.properties.clone(), records);
    tracing::info!(files = catalog.len(), "catalog normalized");
    Ok(catalog)
}

fn collect_files(node: &CatalogNode, out: &mut Vec<FileRecord>) -> Result<(), FetchError> {
    for child in &node.children {
        if child.is_file() {
            out.push(file_record(child)?);
        } else {
            collect_files(child, out)?;
        }
    }
    Ok(())
}

fn file_record(node: &CatalogNode) -> Result<FileRecord, FetchError> {
    let malformed = |reason: String| FetchError::MalformedCatalogEntry {
        entry: node.name.clone(),
        reason,
    };

    if node.name.is_empty() {
        return Err(malformed("dataset has no name".to_string()));
    }
    let url_path = node
        .url_path
        .clone()
        .ok_or_else(|| malformed("missing urlPath attribute".to_string()))?;

    let size = node
        .properties
        .get(SIZE_PROPERTY)
        .ok_or_else(|| malformed(format!("missing {SIZE_PROPERTY} property")))?;
    let size: i64 = size
        .trim()
        .parse()
        .map_err(|_| malformed(format!("invalid {SIZE_PROPERTY} {size:?}")))?;

    let mod_time = node
        .properties
        .get(MOD_TIME_PROPERTY)
        .ok_or_else(|| malformed(format!("missing {MOD_TIME_PROPERTY} property")))?;
    let mod_time = parse_mod_time(mod_time)
        .ok_or_else(|| malformed(format!("invalid {MOD_TIME_PROPERTY} {mod_time:?}")))?;

    let mut metadata = node.properties.clone();
    for key in [
        SIZE_PROPERTY,
        MOD_TIME_PROPERTY,
        CHECKSUM_PROPERTY,
        CHECKSUM_TYPE_PROPERTY,
    ] {
        metadata.remove(key);
    }

    Ok(FileRecord {
        name: node.name.clone(),
        locator: url_path,
        checksum: node
            .properties
            .get(CHECKSUM_PROPERTY)
            .cloned()
            .unwrap_or_default(),
        checksum_type: node
            .properties
            .get(CHECKSUM_TYPE_PROPERTY)
            .cloned()
            .unwrap_or_default(),
        size: u64::try_from(size).ok(),
        mod_time: Some(mod_time),
        metadata,
    })
}

fn parse_mod_time(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, MOD_TIME_FORMAT)
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|parsed| parsed.naive_utc())
        })
}

//! Page-name canonicalization and the mapping between wiki-facing names and
//! local file names.
//!
//! Wiki names look like `category:page` or `page`. Canonical names are
//! lowercase with every run of other characters collapsed to one hyphen.
//! Local names swap the first category separator for `_` so they can be used
//! as a single path component, and remap names the platform reserves.

use std::collections::HashMap;
use std::path::{Component, Path};

use anyhow::{Result, bail};

pub const CATEGORY_SEPARATOR: char = ':';
pub const LOCAL_CATEGORY_SEPARATOR: char = '_';
/// Leading character of system/administrative pages that are never mirrored.
pub const INTERNAL_PAGE_PREFIX: char = '_';

const RESERVED_NAMES: &[&str] = &["con"];
const RESERVED_MARKER: char = '-';

const REDIRECT_PREFIX: &str = "[[module redirect destination=\"";
const REDIRECT_SUFFIX: &str = "\"]]";

/// Canonicalize one half of a name (category or page).
///
/// Lowercases, keeps alphanumerics and the category separator, and emits a
/// single `-` where a run of anything else ends. A leading and a trailing
/// hyphen are stripped; all-junk input yields an empty string.
pub fn canonicalize_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_junk = false;
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() || c == CATEGORY_SEPARATOR {
            if in_junk {
                out.push('-');
            }
            out.push(c);
            in_junk = false;
        } else {
            in_junk = true;
        }
    }

    let trimmed = out.strip_prefix('-').unwrap_or(&out);
    let trimmed = trimmed.strip_suffix('-').unwrap_or(trimmed);
    trimmed.to_string()
}

/// Canonicalize a full name, preserving an optional `category:` prefix.
///
/// Only the first separator divides category from page. Any further
/// `:`-separated segments are dropped.
pub fn canonicalize_name(raw: &str) -> String {
    let mut parts = raw.split(CATEGORY_SEPARATOR);
    let head = parts.next().unwrap_or_default();
    match parts.next() {
        None => canonicalize_string(head),
        Some(page) => format!(
            "{}{CATEGORY_SEPARATOR}{}",
            canonicalize_string(head),
            canonicalize_string(page)
        ),
    }
}

/// Reverse lookup from canonical names to the most informative raw form seen
/// during one run. Owned by the sync engine; never persisted.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    canonical_to_raw: HashMap<String, String>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize `raw` and remember it as the raw form of the result if
    /// nothing is recorded for that canonical name yet.
    pub fn canonicalize(&mut self, raw: &str) -> String {
        let canonical = canonicalize_name(raw);
        self.canonical_to_raw
            .entry(canonical.clone())
            .or_insert_with(|| raw.to_string());
        canonical
    }

    /// Offer `raw` as the raw form of `canonical`. It replaces the stored form
    /// only when it has strictly more uppercase characters.
    pub fn record_raw_form(&mut self, raw: &str, canonical: &str) {
        match self.canonical_to_raw.get_mut(canonical) {
            Some(current) => {
                if uppercase_count(raw) > uppercase_count(current) {
                    *current = raw.to_string();
                }
            }
            None => {
                self.canonical_to_raw
                    .insert(canonical.to_string(), raw.to_string());
            }
        }
    }

    /// Best known raw form of `canonical`. Unknown names (usually redirect
    /// targets never listed) fall back to the canonical name without hyphens.
    pub fn to_raw_form(&self, canonical: &str) -> String {
        match self.canonical_to_raw.get(canonical) {
            Some(raw) => raw.clone(),
            None => canonical.replace('-', ""),
        }
    }

    /// Canonical destination of a redirect page, or `None` when `source` is
    /// not exactly a `[[module redirect destination="..."]]` wrapper.
    pub fn is_redirect(&mut self, source: &str) -> Option<String> {
        let destination = redirect_destination(source)?;
        Some(self.canonicalize(destination))
    }

    pub fn len(&self) -> usize {
        self.canonical_to_raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical_to_raw.is_empty()
    }
}

fn redirect_destination(source: &str) -> Option<&str> {
    let trimmed = source.trim();
    let head = trimmed.get(..REDIRECT_PREFIX.len())?;
    if !head.eq_ignore_ascii_case(REDIRECT_PREFIX) {
        return None;
    }
    let destination = trimmed[REDIRECT_PREFIX.len()..].strip_suffix(REDIRECT_SUFFIX)?;
    if destination.is_empty() {
        return None;
    }
    Some(destination)
}

fn uppercase_count(value: &str) -> usize {
    value.chars().filter(|c| c.is_uppercase()).count()
}

pub fn is_internal_page(wiki_name: &str) -> bool {
    wiki_name.starts_with(INTERNAL_PAGE_PREFIX)
}

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// `con` becomes `con-`, which no wiki name can be.
pub fn remap_reserved(name: &str) -> String {
    if is_reserved(name) {
        format!("{name}{RESERVED_MARKER}")
    } else {
        name.to_string()
    }
}

pub fn unmap_reserved(name: &str) -> String {
    match name.strip_suffix(RESERVED_MARKER) {
        Some(stripped) if is_reserved(stripped) => stripped.to_string(),
        _ => name.to_string(),
    }
}

/// Wiki-facing name to local file stem: first `:` becomes `_`, then the
/// reserved-name remap.
pub fn to_local_name(wiki_name: &str) -> String {
    let swapped = wiki_name.replacen(
        CATEGORY_SEPARATOR,
        &LOCAL_CATEGORY_SEPARATOR.to_string(),
        1,
    );
    remap_reserved(&swapped)
}

/// Inverse of [`to_local_name`]. Lossy for category-less names whose page
/// part contains `_`.
pub fn to_wiki_name(local_name: &str) -> String {
    unmap_reserved(local_name).replacen(
        LOCAL_CATEGORY_SEPARATOR,
        &CATEGORY_SEPARATOR.to_string(),
        1,
    )
}

/// A local name must be exactly one normal path component.
pub fn validate_local_name(local_name: &str) -> Result<()> {
    let mut components = Path::new(local_name).components();
    let valid = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !local_name.contains(['/', '\\', '\0']);
    if !valid {
        bail!("not a safe local file name: {local_name:?}");
    }
    Ok(())
}

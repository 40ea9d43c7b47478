//! On-disk mirror of one site.
//!
//! Layout under the site root:
//! - `<local>.txt` page source
//! - `<local>.html` rendered markup
//! - `<local>.xml` metadata sidecar
//! - `<local>/` attachments, each with an `<attachment>.xml` sidecar

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::names::validate_local_name;
use crate::record::{AttachmentRecord, FIELD_TAGS, FieldValue, PageRecord};
use crate::timestamp::decode_timestamp;

pub const SOURCE_EXTENSION: &str = "txt";
pub const MARKUP_EXTENSION: &str = "html";
pub const METADATA_EXTENSION: &str = "xml";

const METADATA_ROOT: &str = "data";
const TAG_ELEMENT: &str = "tag";
const LIST_ITEM_ELEMENT: &str = "item";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreInventory {
    pub pages: usize,
    pub markup_files: usize,
    pub metadata_files: usize,
    pub attachment_dirs: usize,
    pub newest_updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the mirror directory for `site` under `output_root`.
    pub fn open(output_root: &Path, site: &str) -> Result<Self> {
        validate_local_name(site).context("invalid site name")?;
        let root = output_root.join(site);
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_path(&self, local_name: &str) -> PathBuf {
        self.root.join(format!("{local_name}.{SOURCE_EXTENSION}"))
    }

    pub fn markup_path(&self, local_name: &str) -> PathBuf {
        self.root.join(format!("{local_name}.{MARKUP_EXTENSION}"))
    }

    pub fn metadata_path(&self, local_name: &str) -> PathBuf {
        self.root.join(format!("{local_name}.{METADATA_EXTENSION}"))
    }

    pub fn attachment_dir(&self, local_name: &str) -> PathBuf {
        self.root.join(local_name)
    }

    /// Raw `updated_at` recorded in the page's sidecar. `None` when there is
    /// no sidecar or it carries no timestamp.
    pub fn read_local_updated_at(&self, local_name: &str) -> Result<Option<String>> {
        Ok(self
            .read_metadata(local_name)?
            .and_then(|record| record.updated_at().map(str::to_string)))
    }

    /// Decoded local update time; the sentinel when there is no local copy.
    pub fn read_local_update_time(&self, local_name: &str) -> Result<NaiveDateTime> {
        let raw = self.read_local_updated_at(local_name)?;
        decode_timestamp(raw.as_deref())
            .with_context(|| format!("invalid local timestamp for {local_name}"))
    }

    pub fn read_metadata(&self, local_name: &str) -> Result<Option<PageRecord>> {
        let path = self.metadata_path(local_name);
        if !path.is_file() {
            return Ok(None);
        }
        read_metadata_file(&path).map(Some)
    }

    pub fn write_source(&self, local_name: &str, source: impl AsRef<[u8]>) -> Result<()> {
        write_file(&self.source_path(local_name), source.as_ref())
    }

    pub fn write_markup(&self, local_name: &str, markup: impl AsRef<[u8]>) -> Result<()> {
        write_file(&self.markup_path(local_name), markup.as_ref())
    }

    /// Write the page sidecar and hand back the record's `updated_at`.
    pub fn write_metadata(&self, local_name: &str, record: &PageRecord) -> Result<Option<String>> {
        write_metadata_file(&self.metadata_path(local_name), record)?;
        Ok(record.updated_at().map(str::to_string))
    }

    /// Create the attachment directory on first use. Returns true when it was created.
    pub fn ensure_attachment_dir(&self, local_name: &str) -> Result<bool> {
        let dir = self.attachment_dir(local_name);
        if dir.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        set_shared_permissions(&dir)?;
        debug!(dir = %dir.display(), "created attachment directory");
        Ok(true)
    }

    /// Write an attachment's bytes and its metadata sidecar.
    pub fn write_attachment(
        &self,
        local_name: &str,
        attachment: &AttachmentRecord,
        bytes: &[u8],
    ) -> Result<()> {
        validate_local_name(&attachment.name)
            .with_context(|| format!("refusing attachment on {local_name}"))?;
        let dir = self.attachment_dir(local_name);
        write_file(&dir.join(&attachment.name), bytes)?;
        write_metadata_file(
            &dir.join(format!("{}.{METADATA_EXTENSION}", attachment.name)),
            &attachment.metadata,
        )
    }

    /// Pages that have a local source file, by local name.
    pub fn list_local_page_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        if !self.root.is_dir() {
            return Ok(names);
        }
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry =
                entry.with_context(|| format!("failed to list {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(stem) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(&format!(".{SOURCE_EXTENSION}")))
            {
                names.insert(stem.to_string());
            }
        }
        Ok(names)
    }

    /// Remove a page's source, markup and metadata. Attachments stay.
    /// Returns how many files were removed.
    pub fn delete_local_page(&self, local_name: &str) -> Result<usize> {
        let mut removed = 0;
        for path in [
            self.metadata_path(local_name),
            self.markup_path(local_name),
            self.source_path(local_name),
        ] {
            if path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn inventory(&self) -> Result<StoreInventory> {
        let mut inventory = StoreInventory::default();
        if !self.root.is_dir() {
            return Ok(inventory);
        }
        let mut newest: Option<(NaiveDateTime, String)> = None;
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry =
                entry.with_context(|| format!("failed to list {}", self.root.display()))?;
            if entry.file_type().is_dir() {
                inventory.attachment_dirs += 1;
                continue;
            }
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(SOURCE_EXTENSION) => inventory.pages += 1,
                Some(MARKUP_EXTENSION) => inventory.markup_files += 1,
                Some(METADATA_EXTENSION) => {
                    inventory.metadata_files += 1;
                    let record = read_metadata_file(path)?;
                    let Some(raw) = record.updated_at() else {
                        continue;
                    };
                    match decode_timestamp(Some(raw)) {
                        Ok(decoded) => {
                            if newest.as_ref().is_none_or(|(current, _)| decoded > *current) {
                                newest = Some((decoded, raw.to_string()));
                            }
                        }
                        Err(error) => warn!(path = %path.display(), %error, "skipping timestamp"),
                    }
                }
                _ => {}
            }
        }
        inventory.newest_updated_at = newest.map(|(_, raw)| raw);
        Ok(inventory)
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(unix)]
fn set_shared_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(dir, fs::Permissions::from_mode(0o775))
        .with_context(|| format!("failed to set permissions on {}", dir.display()))
}

#[cfg(not(unix))]
fn set_shared_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

fn write_metadata_file(path: &Path, record: &PageRecord) -> Result<()> {
    let rendered = render_metadata(record)?;
    write_file(path, &rendered)
}

/// Serialize every field except content/html. Absent values are omitted,
/// `tags` expands into `<tag>` children and other lists into `<item>` children.
pub fn render_metadata(record: &PageRecord) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new(METADATA_ROOT)))?;
    for (name, value) in record.metadata_fields() {
        if value.is_absent() {
            continue;
        }
        if !is_element_name(name) {
            warn!(field = name, "field name is not a valid XML element; omitted");
            continue;
        }
        match value {
            FieldValue::Text(text) => write_text_element(&mut writer, name, text)?,
            FieldValue::List(items) if items.is_empty() => {}
            FieldValue::List(items) => {
                let child = if name == FIELD_TAGS {
                    TAG_ELEMENT
                } else {
                    LIST_ITEM_ELEMENT
                };
                writer.write_event(Event::Start(BytesStart::new(name)))?;
                for item in items {
                    write_text_element(&mut writer, child, item)?;
                }
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }
            FieldValue::Null => {}
        }
    }
    writer.write_event(Event::End(BytesEnd::new(METADATA_ROOT)))?;
    let mut rendered = writer.into_inner();
    rendered.push(b'\n');
    Ok(rendered)
}

// Empty values are written as `<name/>` so indentation never leaks into them.
fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    if text.is_empty() {
        writer.write_event(Event::Empty(BytesStart::new(name)))?;
        return Ok(());
    }
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn is_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.to_ascii_lowercase().starts_with("xml")
}

fn read_metadata_file(path: &Path) -> Result<PageRecord> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_metadata(&xml).with_context(|| format!("failed to parse {}", path.display()))
}

/// Parse a sidecar back into a record. Fields with child elements become lists.
pub fn parse_metadata(xml: &str) -> Result<PageRecord> {
    let mut reader = Reader::from_str(xml);
    let mut record = PageRecord::new();
    let mut depth = 0usize;
    let mut field: Option<String> = None;
    let mut field_text = String::new();
    let mut items: Option<Vec<String>> = None;
    let mut item_text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                depth += 1;
                match depth {
                    2 => {
                        field = Some(String::from_utf8_lossy(element.name().as_ref()).into_owned());
                        field_text.clear();
                        items = None;
                    }
                    3 => {
                        item_text.clear();
                        items.get_or_insert_with(Vec::new);
                    }
                    _ => {}
                }
            }
            Event::Empty(element) => match depth + 1 {
                2 => {
                    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                    record.insert(name, FieldValue::Text(String::new()));
                }
                3 => items.get_or_insert_with(Vec::new).push(String::new()),
                _ => {}
            },
            Event::Text(text) => {
                let text = text.unescape()?;
                match depth {
                    2 => field_text.push_str(&text),
                    3 => item_text.push_str(&text),
                    _ => {}
                }
            }
            Event::CData(data) => {
                let data = data.into_inner();
                let text = String::from_utf8_lossy(&data);
                match depth {
                    2 => field_text.push_str(&text),
                    3 => item_text.push_str(&text),
                    _ => {}
                }
            }
            Event::End(_) => {
                match depth {
                    3 => {
                        if let Some(items) = items.as_mut() {
                            items.push(std::mem::take(&mut item_text));
                        }
                    }
                    2 => {
                        if let Some(name) = field.take() {
                            let value = match items.take() {
                                Some(list) => FieldValue::List(list),
                                None => FieldValue::Text(std::mem::take(&mut field_text)),
                            };
                            record.insert(name, value);
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(record)
}

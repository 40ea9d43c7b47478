use serde::Serialize;

pub const FIELD_CONTENT: &str = "content";
pub const FIELD_HTML: &str = "html";
pub const FIELD_TAGS: &str = "tags";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_FULLNAME: &str = "fullname";
pub const FIELD_DOWNLOAD_URL: &str = "download_url";

/// Value of one record field as the remote service reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Absent for metadata purposes: null or the literal text `None`.
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(text) => text == "None",
            Self::List(_) => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Ordered field mapping for a page (or an attachment). Field order is the
/// order the remote reported them in and is kept when written to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    fields: Vec<(String, FieldValue)>,
}

impl PageRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, FieldValue::Text(value.into()));
        self
    }

    pub fn with_list<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(
            name,
            FieldValue::List(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    /// Text value of a field that is present and not absent.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .filter(|value| !value.is_absent())
            .and_then(FieldValue::as_text)
    }

    pub fn content(&self) -> Option<&str> {
        self.text(FIELD_CONTENT)
    }

    pub fn html(&self) -> Option<&str> {
        self.text(FIELD_HTML)
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.text(FIELD_UPDATED_AT)
    }

    pub fn tags(&self) -> &[String] {
        match self.get(FIELD_TAGS) {
            Some(FieldValue::List(tags)) => tags,
            _ => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Fields that belong in a metadata sidecar: everything but content/html.
    pub fn metadata_fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.iter()
            .filter(|(name, _)| *name != FIELD_CONTENT && *name != FIELD_HTML)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A file attached to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    pub name: String,
    pub download_url: String,
    pub metadata: PageRecord,
}

//! XML codec for the S3 control plane
//!
//! Responses are parsed into a generic element tree (`XmlValue`) and typed
//! results pick the fields they need out of it. Request bodies are built with
//! plain string builders.

use super::{DonePart, ProviderError, S3ClientError};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Maximum keys per DeleteObjects request
pub const MAX_DELETE_KEYS: usize = 1000;

/// Generic XML element value
///
/// Leaves become `Text`; elements with children become `Node`; repeated
/// child tags collapse into an ordered `List`.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlValue {
    Text(String),
    Node(BTreeMap<String, XmlValue>),
    List(Vec<XmlValue>),
}

impl XmlValue {
    /// First child with this tag
    pub fn get(&self, name: &str) -> Option<&XmlValue> {
        match self {
            XmlValue::Node(children) => match children.get(name)? {
                XmlValue::List(items) => items.first(),
                value => Some(value),
            },
            _ => None,
        }
    }

    /// Every child with this tag, in document order
    pub fn all(&self, name: &str) -> Vec<&XmlValue> {
        match self {
            XmlValue::Node(children) => match children.get(name) {
                Some(XmlValue::List(items)) => items.iter().collect(),
                Some(value) => vec![value],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Text content of a leaf (an empty element reads as "")
    pub fn as_text(&self) -> Option<&str> {
        match self {
            XmlValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Text content of the first child with this tag
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(XmlValue::as_text)
    }

    fn insert(children: &mut BTreeMap<String, XmlValue>, name: String, value: XmlValue) {
        match children.remove(&name) {
            None => {
                children.insert(name, value);
            }
            Some(XmlValue::List(mut items)) => {
                items.push(value);
                children.insert(name, XmlValue::List(items));
            }
            Some(existing) => {
                children.insert(name, XmlValue::List(vec![existing, value]));
            }
        }
    }
}

/// Document root
#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub value: XmlValue,
}

impl XmlElement {
    pub fn text(&self, name: &str) -> Option<&str> {
        self.value.text(name)
    }

    fn require(&self, name: &str) -> Result<&str, S3ClientError> {
        self.text(name).ok_or_else(|| {
            S3ClientError::ResponseError(format!("{} has no {}", self.name, name))
        })
    }
}

struct OpenElement {
    name: String,
    children: BTreeMap<String, XmlValue>,
    text: String,
}

impl OpenElement {
    fn new(name: String) -> Self {
        Self {
            name,
            children: BTreeMap::new(),
            text: String::new(),
        }
    }

    fn close(self) -> (String, XmlValue) {
        let value = if self.children.is_empty() {
            XmlValue::Text(self.text)
        } else {
            XmlValue::Node(self.children)
        };
        (self.name, value)
    }
}

/// Parse an XML document into an element tree
///
/// Namespaces are dropped (local names only); no schema validation.
pub fn parse_xml(raw: &str) -> Result<XmlElement, S3ClientError> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut stack: Vec<OpenElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(OpenElement::new(name));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match stack.last_mut() {
                    Some(parent) => {
                        XmlValue::insert(&mut parent.children, name, XmlValue::Text(String::new()))
                    }
                    None => {
                        root = Some(XmlElement {
                            name,
                            value: XmlValue::Text(String::new()),
                        })
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(open) = stack.last_mut() {
                    let text = e.unescape().map_err(|e| {
                        S3ClientError::ResponseError(format!("XML parse error: {}", e))
                    })?;
                    open.text.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                let Some(open) = stack.pop() else {
                    return Err(S3ClientError::ResponseError(
                        "XML parse error: unbalanced end tag".into(),
                    ));
                };
                let (name, value) = open.close();
                match stack.last_mut() {
                    Some(parent) => XmlValue::insert(&mut parent.children, name, value),
                    None => root = Some(XmlElement { name, value }),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(S3ClientError::ResponseError(format!(
                    "XML parse error: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    root.ok_or_else(|| S3ClientError::ResponseError("XML document has no root element".into()))
}

/// Parse a document and check the root element name
fn parse_root(raw: &str, expected: &str) -> Result<XmlElement, S3ClientError> {
    let root = parse_xml(raw)?;
    if root.name != expected {
        return Err(S3ClientError::ResponseError(format!(
            "expected <{}>, got <{}>",
            expected, root.name
        )));
    }
    Ok(root)
}

// ============================================================================
// Typed responses
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct InitiateMultipartUploadResult {
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub upload_id: String,
}

impl InitiateMultipartUploadResult {
    pub fn parse(raw: &str) -> Result<Self, S3ClientError> {
        let root = parse_root(raw, "InitiateMultipartUploadResult")?;
        let upload_id = root.require("UploadId")?;
        if upload_id.is_empty() {
            return Err(S3ClientError::ResponseError("empty UploadId".into()));
        }
        Ok(Self {
            bucket: root.text("Bucket").map(str::to_string),
            key: root.text("Key").map(str::to_string),
            upload_id: upload_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteMultipartUploadResult {
    pub location: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub etag: String,
}

impl CompleteMultipartUploadResult {
    pub fn parse(raw: &str) -> Result<Self, S3ClientError> {
        let root = parse_root(raw, "CompleteMultipartUploadResult")?;
        Ok(Self {
            location: root.text("Location").map(str::to_string),
            bucket: root.text("Bucket").map(str::to_string),
            key: root.text("Key").map(str::to_string),
            etag: root.require("ETag")?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyObjectResult {
    pub etag: String,
    pub last_modified: Option<String>,
}

impl CopyObjectResult {
    pub fn parse(raw: &str) -> Result<Self, S3ClientError> {
        let root = parse_root(raw, "CopyObjectResult")?;
        Ok(Self {
            etag: root.require("ETag")?.to_string(),
            last_modified: root.text("LastModified").map(str::to_string),
        })
    }
}

/// One entry of a ListObjects page
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub storage_class: Option<String>,
}

/// ListObjects (V1) page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListBucketResult {
    pub name: String,
    pub prefix: Option<String>,
    pub marker: Option<String>,
    pub is_truncated: bool,
    /// Marker for the next page; falls back to the last key of this page
    /// when the server omits `NextMarker`
    pub next_marker: Option<String>,
    pub contents: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
}

impl ListBucketResult {
    pub fn parse(raw: &str) -> Result<Self, S3ClientError> {
        let root = parse_root(raw, "ListBucketResult")?;

        let contents = root
            .value
            .all("Contents")
            .into_iter()
            .map(|entry| {
                let key = entry.text("Key").ok_or_else(|| {
                    S3ClientError::ResponseError("Contents entry has no Key".into())
                })?;
                Ok(ObjectSummary {
                    key: key.to_string(),
                    size: entry.text("Size").and_then(|s| s.parse().ok()).unwrap_or(0),
                    etag: entry.text("ETag").map(str::to_string),
                    last_modified: entry.text("LastModified").map(str::to_string),
                    storage_class: entry.text("StorageClass").map(str::to_string),
                })
            })
            .collect::<Result<Vec<_>, S3ClientError>>()?;

        let common_prefixes = root
            .value
            .all("CommonPrefixes")
            .into_iter()
            .filter_map(|entry| entry.text("Prefix").map(str::to_string))
            .collect();

        let is_truncated = root.text("IsTruncated") == Some("true");
        let next_marker = match root.text("NextMarker").filter(|m| !m.is_empty()) {
            Some(marker) => Some(marker.to_string()),
            None if is_truncated => contents.last().map(|o: &ObjectSummary| o.key.clone()),
            None => None,
        };

        Ok(Self {
            name: root.text("Name").unwrap_or_default().to_string(),
            prefix: root.text("Prefix").filter(|p| !p.is_empty()).map(str::to_string),
            marker: root.text("Marker").filter(|m| !m.is_empty()).map(str::to_string),
            is_truncated,
            next_marker,
            contents,
            common_prefixes,
        })
    }
}

/// Per-key failure in a DeleteObjects response
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteError {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteError>,
}

impl DeleteResult {
    pub fn parse(raw: &str) -> Result<Self, S3ClientError> {
        let root = parse_root(raw, "DeleteResult")?;
        Ok(Self {
            deleted: root
                .value
                .all("Deleted")
                .into_iter()
                .filter_map(|entry| entry.text("Key").map(str::to_string))
                .collect(),
            errors: root
                .value
                .all("Error")
                .into_iter()
                .map(|entry| DeleteError {
                    key: entry.text("Key").unwrap_or_default().to_string(),
                    code: entry.text("Code").unwrap_or_default().to_string(),
                    message: entry.text("Message").unwrap_or_default().to_string(),
                })
                .collect(),
        })
    }

    /// Merge another batch into this one
    pub fn extend(&mut self, other: DeleteResult) {
        self.deleted.extend(other.deleted);
        self.errors.extend(other.errors);
    }
}

/// Credentials issued by STS AssumeRole
#[derive(Debug, Clone, PartialEq)]
pub struct AssumeRoleResult {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl AssumeRoleResult {
    pub fn parse(raw: &str) -> Result<Self, S3ClientError> {
        let root = parse_root(raw, "AssumeRoleResponse")?;
        let credentials = root
            .value
            .get("AssumeRoleResult")
            .and_then(|result| result.get("Credentials"))
            .ok_or_else(|| {
                S3ClientError::ResponseError("AssumeRoleResponse has no Credentials".into())
            })?;

        let field = |name: &str| {
            credentials
                .text(name)
                .map(str::to_string)
                .ok_or_else(|| S3ClientError::ResponseError(format!("Credentials has no {}", name)))
        };

        Ok(Self {
            access_key_id: field("AccessKeyId")?,
            secret_access_key: field("SecretAccessKey")?,
            session_token: field("SessionToken")?,
            expiration: credentials
                .text("Expiration")
                .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
                .map(|e| e.with_timezone(&Utc)),
        })
    }
}

/// Parse an S3 `<Error>` document (STS wraps it in `<ErrorResponse>`)
///
/// Returns `None` when the body is not an error document.
pub fn parse_error(raw: &str, status: u16) -> Option<ProviderError> {
    let root = parse_xml(raw).ok()?;
    let error = match root.name.as_str() {
        "Error" => &root.value,
        "ErrorResponse" => root.value.get("Error")?,
        _ => return None,
    };
    let code = error.text("Code")?;

    Some(ProviderError {
        code: code.to_string(),
        message: error.text("Message").unwrap_or_default().to_string(),
        key: error.text("Key").map(str::to_string),
        resource: error.text("Resource").map(str::to_string),
        request_id: error
            .text("RequestId")
            .or_else(|| root.text("RequestId"))
            .map(str::to_string),
        status,
    })
}

// ============================================================================
// Request bodies
// ============================================================================

/// Which ETag wins when a part number was reported more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// The most recently reported ETag (a retried part replaces the original)
    #[default]
    KeepLast,
    /// The first ETag reported for the part number
    KeepFirst,
}

/// Sort by part number and drop duplicate part numbers
pub fn dedup_parts(parts: &[DonePart], policy: DedupPolicy) -> Vec<DonePart> {
    let mut sorted: Vec<DonePart> = parts.to_vec();
    // Stable sort keeps report order within one part number.
    sorted.sort_by_key(|part| part.part_number);

    let mut result: Vec<DonePart> = Vec::with_capacity(sorted.len());
    for part in sorted {
        match result.last_mut() {
            Some(last) if last.part_number == part.part_number => {
                if policy == DedupPolicy::KeepLast {
                    *last = part;
                }
            }
            _ => result.push(part),
        }
    }
    result
}

/// `CompleteMultipartUpload` body, keeping the last reported ETag per part
pub fn build_complete_multipart_xml(parts: &[DonePart]) -> String {
    build_complete_multipart_xml_with(parts, DedupPolicy::KeepLast)
}

pub fn build_complete_multipart_xml_with(parts: &[DonePart], policy: DedupPolicy) -> String {
    let mut body = String::new();
    body.push_str("<CompleteMultipartUpload>");
    for part in dedup_parts(parts, policy) {
        body.push_str("<Part><PartNumber>");
        body.push_str(&part.part_number.to_string());
        body.push_str("</PartNumber><ETag>");
        body.push_str(&xml_escape(&part.etag));
        body.push_str("</ETag></Part>");
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// `Delete` body for a batch delete
pub fn build_delete_objects_xml(keys: &[String], quiet: bool) -> String {
    let mut body = String::new();
    body.push_str("<Delete>");
    if quiet {
        body.push_str("<Quiet>true</Quiet>");
    }
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&xml_escape(key));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    body
}

/// Escape element text; quotes stay literal so ETags round-trip byte-exact.
fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_number: u32, etag: &str) -> DonePart {
        DonePart {
            part_number,
            etag: etag.to_string(),
        }
    }

    #[test]
    fn test_parse_repeated_children_collapse() {
        let root = parse_xml("<A><B>1</B><B>2</B><C>x</C></A>").unwrap();
        assert_eq!(root.name, "A");
        assert_eq!(root.value.all("B").len(), 2);
        assert_eq!(root.text("B"), Some("1"));
        assert_eq!(root.text("C"), Some("x"));
    }

    #[test]
    fn test_parse_strips_namespace_and_unescapes() {
        let raw = r#"<?xml version="1.0"?>
            <CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
                <Location>http://localhost/b/k</Location>
                <ETag>&quot;abc-3&quot;</ETag>
            </CompleteMultipartUploadResult>"#;
        let result = CompleteMultipartUploadResult::parse(raw).unwrap();
        assert_eq!(result.etag, "\"abc-3\"");
        assert_eq!(result.location.as_deref(), Some("http://localhost/b/k"));
    }

    #[test]
    fn test_malformed_xml_is_response_error() {
        assert!(matches!(
            parse_xml("<A><B></A>"),
            Err(S3ClientError::ResponseError(_))
        ));
        assert!(parse_xml("").is_err());
    }

    #[test]
    fn test_initiate_requires_upload_id() {
        let raw = "<InitiateMultipartUploadResult><Bucket>b</Bucket></InitiateMultipartUploadResult>";
        assert!(InitiateMultipartUploadResult::parse(raw).is_err());
    }

    #[test]
    fn test_dedup_keep_last() {
        let parts = vec![part(2, "etag2"), part(1, "etag1"), part(1, "etag1-retry")];
        let deduped = dedup_parts(&parts, DedupPolicy::KeepLast);
        assert_eq!(deduped, vec![part(1, "etag1-retry"), part(2, "etag2")]);
    }

    #[test]
    fn test_dedup_keep_first() {
        let parts = vec![part(2, "etag2"), part(1, "etag1"), part(1, "etag1-retry")];
        let deduped = dedup_parts(&parts, DedupPolicy::KeepFirst);
        assert_eq!(deduped, vec![part(1, "etag1"), part(2, "etag2")]);
    }

    #[test]
    fn test_delete_objects_xml() {
        let xml = build_delete_objects_xml(&["a&b.txt".to_string(), "c.txt".to_string()], true);
        assert_eq!(
            xml,
            "<Delete><Quiet>true</Quiet><Object><Key>a&amp;b.txt</Key></Object>\
             <Object><Key>c.txt</Key></Object></Delete>"
        );
    }

    #[test]
    fn test_parse_error_not_error_document() {
        assert!(parse_error("<ListBucketResult/>", 400).is_none());
        assert!(parse_error("not xml at all", 500).is_none());
    }
}

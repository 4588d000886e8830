//! Node data model: handles, types, flags, attributes, counters, and the
//! opaque serialized blob the cache stores as the single source of truth.
//!
//! A node is a file or directory of the remote filesystem. Every queryable
//! column the cache exposes is derived from the serialized blob: attribute
//! values (favourite, label, description, tags, original fingerprint) live in
//! the attr map inside the blob, so callers can never get them out of sync
//! with it. Virtual columns (mime category, size) are computed, never stored.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::json::{JsonScanner, UNDEF_HANDLE, name_id};

/// 64-bit node or user identifier. File/folder handles occupy 6 bytes on the
/// wire, user handles 8.
pub type Handle = u64;

/// "No handle": parent of root nodes, failed lookups.
pub const UNDEF: Handle = UNDEF_HANDLE;

/// Delimiter of the tag-sequence attribute.
pub const TAG_DELIMITER: char = ',';

/// Attribute names carried in the node attr map.
pub mod attr {
    pub const NAME: &str = "n";
    pub const FAV: &str = "fav";
    pub const LABEL: &str = "lbl";
    pub const SENSITIVE: &str = "sen";
    pub const ORIG_FINGERPRINT: &str = "c0";
    pub const DESCRIPTION: &str = "des";
    pub const TAGS: &str = "t";
}

/// Flag bits stored in the `flags` column.
pub mod flags {
    /// The node is a version of its (file) parent.
    pub const IS_VERSION: u64 = 1 << 0;
    /// The node lives under the rubbish root.
    pub const IS_IN_RUBBISH: u64 = 1 << 1;
    /// The node is marked sensitive; inherited down the tree by searches.
    pub const IS_MARKED_SENSITIVE: u64 = 1 << 2;
}

/// Node kind. The ordering matters: root-like types form the contiguous
/// `Root..=Rubbish` range the cache selects with `BETWEEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NodeType {
    File = 0,
    Folder = 1,
    Root = 2,
    Inbox = 3,
    Rubbish = 4,
}

impl NodeType {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(NodeType::File),
            1 => Some(NodeType::Folder),
            2 => Some(NodeType::Root),
            3 => Some(NodeType::Inbox),
            4 => Some(NodeType::Rubbish),
            _ => None,
        }
    }

    /// Folder-like nodes may hold children; files only hold versions.
    pub fn is_container(self) -> bool {
        self != NodeType::File
    }
}

/// Color label values of the `lbl` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Label {
    #[default]
    Unknown = 0,
    Red = 1,
    Orange = 2,
    Yellow = 3,
    Green = 4,
    Blue = 5,
    Purple = 6,
    Grey = 7,
}

impl Label {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            1 => Label::Red,
            2 => Label::Orange,
            3 => Label::Yellow,
            4 => Label::Green,
            5 => Label::Blue,
            6 => Label::Purple,
            7 => Label::Grey,
            _ => Label::Unknown,
        }
    }
}

/// Bits of the share mask recording how a node is shared.
pub mod share {
    pub const NONE: u8 = 0;
    pub const IN_SHARE: u8 = 1 << 0;
    pub const OUT_SHARE: u8 = 1 << 1;
    pub const PENDING_OUT_SHARE: u8 = 1 << 2;
    pub const LINK: u8 = 1 << 3;
}

/// Coarse media category derived from the node name. Stored nowhere; the
/// cache recomputes it through the `mimetypeVirtual` generated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MimeCategory {
    Unknown = 0,
    Photo = 1,
    Audio = 2,
    Video = 3,
    Document = 4,
    Pdf = 5,
    Archive = 6,
    Program = 7,
    Spreadsheet = 8,
    Others = 9,
}

/// Classifies a file name into a [`MimeCategory`] by its extension.
pub fn mime_category(name: &str) -> MimeCategory {
    let Some(ext) = name.rsplit_once('.').map(|(_, e)| e) else {
        return MimeCategory::Others;
    };
    if ext.is_empty() {
        return MimeCategory::Others;
    }

    match ext.to_ascii_lowercase().as_str() {
        "zip" | "tar" | "gz" | "bz2" | "xz" | "7z" | "rar" | "zst" => {
            return MimeCategory::Archive;
        }
        "exe" | "dll" | "so" | "dylib" | "app" | "apk" | "msi" => return MimeCategory::Program,
        "xls" | "xlsx" | "ods" | "csv" => return MimeCategory::Spreadsheet,
        _ => {}
    }

    let guess = mime_guess::from_ext(ext);
    let Some(mime) = guess.first() else {
        return MimeCategory::Others;
    };
    use mime_guess::mime;
    if mime.type_() == mime::IMAGE {
        MimeCategory::Photo
    } else if mime.type_() == mime::AUDIO {
        MimeCategory::Audio
    } else if mime.type_() == mime::VIDEO {
        MimeCategory::Video
    } else if mime.subtype() == mime::PDF {
        MimeCategory::Pdf
    } else if mime.type_() == mime::TEXT || mime.subtype().as_str().contains("word") {
        MimeCategory::Document
    } else {
        MimeCategory::Others
    }
}

/// Encodes a handle of the given byte width as unpadded Base64
/// (6 bytes ⇒ 8 chars, 8 bytes ⇒ 11 chars).
pub fn handle_to_b64(handle: Handle, size: usize) -> String {
    URL_SAFE_NO_PAD.encode(&handle.to_le_bytes()[..size])
}

/// Decodes an unpadded Base64 handle; [`UNDEF`] on width or alphabet errors.
pub fn handle_from_b64(encoded: &str, size: usize) -> Handle {
    match URL_SAFE_NO_PAD.decode(encoded) {
        Ok(bytes) if bytes.len() == size => {
            let mut buf = [0u8; 8];
            buf[..size].copy_from_slice(&bytes);
            u64::from_le_bytes(buf)
        }
        _ => UNDEF,
    }
}

/// Aggregate of bytes and item counts for a subtree, stored serialized next
/// to each node. The `storage` field feeds the `sizeVirtual` column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounter {
    pub files: u64,
    pub folders: u64,
    pub versions: u64,
    pub storage: i64,
    pub version_storage: i64,
}

impl NodeCounter {
    pub const ENCODED_LEN: usize = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.files.to_le_bytes());
        out.extend_from_slice(&self.folders.to_le_bytes());
        out.extend_from_slice(&self.versions.to_le_bytes());
        out.extend_from_slice(&self.storage.to_le_bytes());
        out.extend_from_slice(&self.version_storage.to_le_bytes());
        out
    }

    pub fn deserialize(blob: &[u8]) -> Option<Self> {
        if blob.len() < Self::ENCODED_LEN {
            return None;
        }
        let word = |i: usize| -> [u8; 8] { blob[i * 8..i * 8 + 8].try_into().unwrap() };
        Some(Self {
            files: u64::from_le_bytes(word(0)),
            folders: u64::from_le_bytes(word(1)),
            versions: u64::from_le_bytes(word(2)),
            storage: i64::from_le_bytes(word(3)),
            version_storage: i64::from_le_bytes(word(4)),
        })
    }

    pub fn add(&mut self, other: &NodeCounter) {
        self.files += other.files;
        self.folders += other.folders;
        self.versions += other.versions;
        self.storage += other.storage;
        self.version_storage += other.version_storage;
    }
}

/// A directory or file of the remote tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub handle: Handle,
    pub parent: Handle,
    pub node_type_raw: u8,
    pub name: String,
    /// Content fingerprint, opaque bytes.
    pub fingerprint: Vec<u8>,
    pub ctime: i64,
    pub mtime: i64,
    /// Flag bitmask, see [`flags`]. The sensitivity bit is kept in sync with
    /// the `sen` attribute by [`Node::db_flags`].
    pub flags: u64,
    /// Share mask, see [`share`].
    pub share: u8,
    pub attrs: BTreeMap<String, String>,
    pub counter: NodeCounter,
}

impl Node {
    pub fn new(handle: Handle, parent: Handle, node_type: NodeType, name: &str) -> Self {
        let mut node = Node {
            handle,
            parent,
            node_type_raw: node_type as u8,
            name: name.to_string(),
            ..Default::default()
        };
        node.attrs.insert(attr::NAME.into(), name.to_string());
        node
    }

    pub fn node_type(&self) -> Option<NodeType> {
        NodeType::from_raw(i64::from(self.node_type_raw))
    }

    /// True when the `fav` attribute holds the one valid truthy value.
    pub fn favourite(&self) -> bool {
        self.attrs.get(attr::FAV).is_some_and(|v| v == "1")
    }

    pub fn label(&self) -> Label {
        self.attrs
            .get(attr::LABEL)
            .and_then(|v| v.parse::<i64>().ok())
            .map(Label::from_raw)
            .unwrap_or_default()
    }

    pub fn description(&self) -> Option<&str> {
        self.attrs.get(attr::DESCRIPTION).map(String::as_str)
    }

    pub fn tags(&self) -> Option<&str> {
        self.attrs.get(attr::TAGS).map(String::as_str)
    }

    pub fn orig_fingerprint(&self) -> Option<&str> {
        self.attrs.get(attr::ORIG_FINGERPRINT).map(String::as_str)
    }

    pub fn sensitive(&self) -> bool {
        self.attrs.contains_key(attr::SENSITIVE)
    }

    /// Flags as persisted: the stored mask with the sensitivity bit derived
    /// from the attr map.
    pub fn db_flags(&self) -> u64 {
        let mut f = self.flags & !flags::IS_MARKED_SENSITIVE;
        if self.sensitive() {
            f |= flags::IS_MARKED_SENSITIVE;
        }
        f
    }

    /// Serializes the node into the opaque blob stored in the cache. The
    /// blob reproduces every other stored attribute on decode.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96 + self.name.len());
        out.push(1u8); // layout version
        out.extend_from_slice(&self.handle.to_le_bytes());
        out.extend_from_slice(&self.parent.to_le_bytes());
        out.push(self.node_type_raw);
        out.push(self.share);
        out.extend_from_slice(&self.ctime.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());

        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.fingerprint.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.fingerprint);

        let counter = self.counter.serialize();
        out.extend_from_slice(&(counter.len() as u16).to_le_bytes());
        out.extend_from_slice(&counter);

        out.extend_from_slice(&(self.attrs.len() as u16).to_le_bytes());
        for (key, value) in &self.attrs {
            out.push(key.len() as u8);
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// Decodes a blob produced by [`Node::serialize`].
    pub fn deserialize(blob: &[u8]) -> Option<Self> {
        let mut r = BlobReader::new(blob);
        if r.u8()? != 1 {
            return None;
        }
        let mut node = Node {
            handle: r.u64()?,
            parent: r.u64()?,
            node_type_raw: r.u8()?,
            share: r.u8()?,
            ctime: r.i64()?,
            mtime: r.i64()?,
            flags: r.u64()?,
            ..Default::default()
        };

        let name_len = r.u16()? as usize;
        node.name = String::from_utf8(r.bytes(name_len)?.to_vec()).ok()?;
        let fp_len = r.u16()? as usize;
        node.fingerprint = r.bytes(fp_len)?.to_vec();
        let counter_len = r.u16()? as usize;
        node.counter = NodeCounter::deserialize(r.bytes(counter_len)?)?;

        let attr_count = r.u16()?;
        for _ in 0..attr_count {
            let key_len = r.u8()? as usize;
            let key = String::from_utf8(r.bytes(key_len)?.to_vec()).ok()?;
            let value_len = r.u32()? as usize;
            let value = String::from_utf8(r.bytes(value_len)?.to_vec()).ok()?;
            node.attrs.insert(key, value);
        }
        Some(node)
    }

    /// Parses a node object off the wire (`{"h":…,"p":…,"t":…,"a":{…}}`),
    /// leaving the scanner right after the closing brace.
    pub fn from_wire(scanner: &mut JsonScanner<'_>) -> Option<Self> {
        if !scanner.enter_object() {
            return None;
        }
        let mut node = Node {
            parent: UNDEF,
            ..Default::default()
        };

        loop {
            let id = scanner.get_name_id();
            if id == 0 {
                break;
            }
            if id == name_id("h") {
                node.handle = scanner.get_handle(6);
            } else if id == name_id("p") {
                node.parent = scanner.get_handle(6);
            } else if id == name_id("u") {
                scanner.store_object(None);
            } else if id == name_id("t") {
                node.node_type_raw = scanner.get_int() as u8;
            } else if id == name_id("ts") {
                node.ctime = scanner.get_int();
            } else if id == name_id("mts") {
                node.mtime = scanner.get_int();
            } else if id == name_id("s") {
                node.counter.storage = scanner.get_int();
                node.counter.files = 1;
            } else if id == name_id("fp") {
                node.fingerprint = scanner.store_binary().unwrap_or_default();
            } else if id == name_id("a") {
                if scanner.enter_object() {
                    loop {
                        let name = scanner.get_name();
                        if name.is_empty() {
                            break;
                        }
                        let mut value = String::new();
                        if !scanner.store_object(Some(&mut value)) {
                            break;
                        }
                        JsonScanner::unescape(&mut value);
                        node.attrs.insert(name, value);
                    }
                    scanner.leave_object();
                } else if !scanner.store_object(None) {
                    return None;
                }
            } else if !scanner.store_object(None) {
                return None;
            }
        }

        if !scanner.leave_object() {
            return None;
        }
        if node.handle == 0 && node.attrs.is_empty() {
            return None;
        }
        if let Some(name) = node.attrs.get(attr::NAME) {
            node.name = name.clone();
        }
        Some(node)
    }
}

struct BlobReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> BlobReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.at..self.at + n)?;
        self.at += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.bytes(2)?.try_into().ok()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.bytes(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.bytes(8)?.try_into().ok()?))
    }

    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.bytes(8)?.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        let mut node = Node::new(0x1122334455, 0x55, NodeType::File, "Budget 2023.pdf");
        node.ctime = 1_700_000_000;
        node.mtime = 1_700_000_500;
        node.fingerprint = vec![9, 8, 7, 6];
        node.counter = NodeCounter {
            files: 1,
            storage: 2048,
            ..Default::default()
        };
        node.attrs.insert(attr::FAV.into(), "1".into());
        node.attrs.insert(attr::LABEL.into(), "4".into());
        node.attrs.insert(attr::TAGS.into(), "work,finance".into());
        node
    }

    #[test]
    fn blob_roundtrip_reproduces_every_attribute() {
        let node = sample_node();
        let blob = node.serialize();
        let back = Node::deserialize(&blob).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.serialize(), blob);
        assert!(back.favourite());
        assert_eq!(back.label(), Label::Green);
        assert_eq!(back.tags(), Some("work,finance"));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = sample_node().serialize();
        assert!(Node::deserialize(&blob[..blob.len() - 3]).is_none());
        assert!(Node::deserialize(&[]).is_none());
    }

    #[test]
    fn handle_b64_widths() {
        let h: Handle = 0x0000_0badc0ffee42;
        let encoded = handle_to_b64(h, 6);
        assert_eq!(encoded.len(), 8);
        assert_eq!(handle_from_b64(&encoded, 6), h);

        let encoded = handle_to_b64(h, 8);
        assert_eq!(encoded.len(), 11);
        assert_eq!(handle_from_b64(&encoded, 8), h);

        assert_eq!(handle_from_b64("bogus!", 6), UNDEF);
    }

    #[test]
    fn counter_roundtrip() {
        let counter = NodeCounter {
            files: 3,
            folders: 1,
            versions: 2,
            storage: 1 << 40,
            version_storage: 77,
        };
        assert_eq!(
            NodeCounter::deserialize(&counter.serialize()),
            Some(counter)
        );
        assert_eq!(NodeCounter::deserialize(&[1, 2, 3]), None);
    }

    #[test]
    fn wire_parse_extracts_attrs() {
        let handle = handle_to_b64(7, 6);
        let parent = handle_to_b64(3, 6);
        let raw = format!(
            r#"{{"h":"{handle}","p":"{parent}","t":0,"ts":1000,"a":{{"n":"notes.txt","fav":"1"}}}}"#
        );
        let mut scanner = JsonScanner::new(raw.as_bytes());
        let node = Node::from_wire(&mut scanner).unwrap();
        assert_eq!(node.handle, 7);
        assert_eq!(node.parent, 3);
        assert_eq!(node.node_type(), Some(NodeType::File));
        assert_eq!(node.name, "notes.txt");
        assert!(node.favourite());
    }

    #[test]
    fn sensitivity_tracks_attr() {
        let mut node = sample_node();
        assert_eq!(node.db_flags() & flags::IS_MARKED_SENSITIVE, 0);
        node.attrs.insert(attr::SENSITIVE.into(), "1".into());
        assert_ne!(node.db_flags() & flags::IS_MARKED_SENSITIVE, 0);
    }

    #[test]
    fn mime_categories() {
        assert_eq!(mime_category("photo.JPG"), MimeCategory::Photo);
        assert_eq!(mime_category("track.mp3"), MimeCategory::Audio);
        assert_eq!(mime_category("movie.mp4"), MimeCategory::Video);
        assert_eq!(mime_category("paper.pdf"), MimeCategory::Pdf);
        assert_eq!(mime_category("notes.txt"), MimeCategory::Document);
        assert_eq!(mime_category("backup.tar.gz"), MimeCategory::Archive);
        assert_eq!(mime_category("sheet.xlsx"), MimeCategory::Spreadsheet);
        assert_eq!(mime_category("no-extension"), MimeCategory::Others);
    }
}

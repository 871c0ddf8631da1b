//! The self-describing part of a container: the group tree written as the file footer.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use ntuple_error::{NtupleResult, ntuple_bail, ntuple_err};
use serde::{Deserialize, Serialize};

use crate::attribute::AttrValue;
use crate::dtype::{ByteOrder, ElementType};
use crate::filter::Filter;

pub const MAGIC_BYTES: [u8; 4] = *b"NTPL";
pub const VERSION: u16 = 1;
/// footer offset (u64) + version (u16) + reserved (u16) + magic
pub const EOF_SIZE: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Footer {
    pub(crate) root: GroupNode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct GroupNode {
    #[serde(default)]
    pub(crate) attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub(crate) children: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Node {
    Group(GroupNode),
    Dataset(DatasetNode),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DatasetNode {
    pub(crate) element: ElementType,
    pub(crate) byte_order: ByteOrder,
    pub(crate) extents: Vec<u64>,
    pub(crate) rows: u64,
    pub(crate) chunk_rows: u64,
    #[serde(default)]
    pub(crate) filters: Vec<Filter>,
    /// One entry per chunk covering `rows`; `None` for chunks never written.
    #[serde(default)]
    pub(crate) chunks: Vec<Option<ChunkRef>>,
    #[serde(default)]
    pub(crate) attributes: BTreeMap<String, AttrValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChunkRef {
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

impl DatasetNode {
    pub(crate) fn elements_per_row(&self) -> usize {
        self.extents.iter().product::<u64>() as usize
    }

    pub(crate) fn chunk_count(rows: u64, chunk_rows: u64) -> usize {
        rows.div_ceil(chunk_rows) as usize
    }
}

impl GroupNode {
    /// Resolve a `/`-separated path relative to this group.
    pub(crate) fn resolve(&self, path: &[String]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let node = self.children.get(first)?;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            Node::Group(group) => group.resolve(rest),
            Node::Dataset(_) => None,
        }
    }

    pub(crate) fn resolve_mut(&mut self, path: &[String]) -> Option<&mut Node> {
        let (first, rest) = path.split_first()?;
        let node = self.children.get_mut(first)?;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            Node::Group(group) => group.resolve_mut(rest),
            Node::Dataset(_) => None,
        }
    }

    pub(crate) fn group(&self, path: &[String]) -> NtupleResult<&GroupNode> {
        if path.is_empty() {
            return Ok(self);
        }
        match self.resolve(path) {
            Some(Node::Group(group)) => Ok(group),
            Some(Node::Dataset(_)) => ntuple_bail!(BackingStore: "/{} is a dataset", path.join("/")),
            None => ntuple_bail!(BackingStore: "no group at /{}", path.join("/")),
        }
    }

    pub(crate) fn group_mut(&mut self, path: &[String]) -> NtupleResult<&mut GroupNode> {
        if path.is_empty() {
            return Ok(self);
        }
        match self.resolve_mut(path) {
            Some(Node::Group(group)) => Ok(group),
            Some(Node::Dataset(_)) => ntuple_bail!(BackingStore: "/{} is a dataset", path.join("/")),
            None => ntuple_bail!(BackingStore: "no group at /{}", path.join("/")),
        }
    }

    pub(crate) fn dataset(&self, path: &[String]) -> NtupleResult<&DatasetNode> {
        match self.resolve(path) {
            Some(Node::Dataset(dataset)) => Ok(dataset),
            Some(Node::Group(_)) => ntuple_bail!(BackingStore: "/{} is a group", path.join("/")),
            None => ntuple_bail!(BackingStore: "no dataset at /{}", path.join("/")),
        }
    }

    pub(crate) fn dataset_mut(&mut self, path: &[String]) -> NtupleResult<&mut DatasetNode> {
        match self.resolve_mut(path) {
            Some(Node::Dataset(dataset)) => Ok(dataset),
            Some(Node::Group(_)) => ntuple_bail!(BackingStore: "/{} is a group", path.join("/")),
            None => ntuple_bail!(BackingStore: "no dataset at /{}", path.join("/")),
        }
    }
}

/// Encode the end-of-file marker pointing at a footer written at `footer_offset`.
pub(crate) fn encode_eof(footer_offset: u64) -> [u8; EOF_SIZE] {
    let mut eof = [0u8; EOF_SIZE];
    let mut buf = &mut eof[..];
    buf.put_u64_le(footer_offset);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(0);
    buf.put_slice(&MAGIC_BYTES);
    eof
}

/// Decode an end-of-file marker, returning the footer offset.
pub(crate) fn decode_eof(mut eof: &[u8]) -> NtupleResult<u64> {
    if eof.len() != EOF_SIZE {
        ntuple_bail!(BackingStore: "end-of-file marker must be {} bytes, got {}", EOF_SIZE, eof.len());
    }
    let footer_offset = eof.get_u64_le();
    let version = eof.get_u16_le();
    let _reserved = eof.get_u16_le();
    if eof != MAGIC_BYTES {
        ntuple_bail!(BackingStore: "not an ntuple container: bad magic bytes");
    }
    if version != VERSION {
        ntuple_bail!(BackingStore: "unsupported container version {}, expected {}", version, VERSION);
    }
    Ok(footer_offset)
}

pub(crate) fn decode_footer(bytes: &[u8]) -> NtupleResult<Footer> {
    serde_json::from_slice(bytes)
        .map_err(|e| ntuple_err!(BackingStore: "corrupt container footer: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_marker() {
        let eof = encode_eof(4096);
        assert_eq!(&eof[12..], b"NTPL");
        assert_eq!(decode_eof(&eof).unwrap(), 4096);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut eof = encode_eof(12);
        eof[15] = b'X';
        assert!(decode_eof(&eof).is_err());
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut eof = encode_eof(12);
        eof[8] = 9;
        assert!(decode_eof(&eof).is_err());
    }

    #[test]
    fn resolves_nested_paths() {
        let mut root = GroupNode::default();
        let mut jets = GroupNode::default();
        jets.children.insert(
            "pt".into(),
            Node::Dataset(DatasetNode {
                element: ElementType::F32,
                byte_order: ByteOrder::Little,
                extents: vec![4],
                rows: 0,
                chunk_rows: 16,
                filters: vec![],
                chunks: vec![],
                attributes: BTreeMap::new(),
            }),
        );
        root.children.insert("jets".into(), Node::Group(jets));

        let path = ["jets".to_string(), "pt".to_string()];
        assert_eq!(root.dataset(&path).unwrap().elements_per_row(), 4);
        assert!(root.group(&path).is_err());
        assert!(root.group(&path[..1]).is_ok());
        assert!(root.dataset(&["missing".to_string()]).is_err());
    }
}

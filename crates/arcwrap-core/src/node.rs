//! dag-pb directory nodes.
//!
//! A [`DirectoryNode`] is an ordered list of named [`Link`]s plus the opaque
//! `Data` payload of the node (for UnixFS directories, the `08 01` type
//! marker). Decoding keeps both, upserts only touch the named link, and
//! encoding writes links first then data, so a template decoded and
//! re-encoded without changes produces the same bytes.
//!
//! Wire layout (protobuf):
//!
//! ```text
//! PBNode { 2: repeated PBLink Links, 1: optional bytes Data }
//! PBLink { 1: bytes Hash, 2: string Name, 3: uint64 Tsize }
//! ```

use serde::Serialize;
use tracing::debug;

use crate::codec::ContentId;
use crate::error::{Result, WrapError};
use crate::varint;

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

const NODE_DATA: u64 = 1;
const NODE_LINKS: u64 = 2;

const LINK_HASH: u64 = 1;
const LINK_NAME: u64 = 2;
const LINK_TSIZE: u64 = 3;

/// UnixFS `Data { Type: Directory }`.
const UNIXFS_DIRECTORY: [u8; 2] = [0x08, 0x01];

/// A named edge from a directory node to another block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub name: String,
    pub target: ContentId,
    /// Cumulative size hint of the target, in bytes.
    pub size: u64,
}

/// Directory node with ordered, uniquely named links.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryNode {
    links: Vec<Link>,
    data: Option<Vec<u8>>,
}

impl DirectoryNode {
    /// Node with no links and no data.
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical empty UnixFS directory.
    pub fn empty_unixfs_dir() -> Self {
        Self {
            links: Vec::new(),
            data: Some(UNIXFS_DIRECTORY.to_vec()),
        }
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Insert or replace the link called `name`.
    ///
    /// An existing link keeps its position and only has its target and size
    /// replaced; a new name is appended at the end.
    pub fn upsert_link(&mut self, name: &str, target: ContentId, size: u64) {
        if let Some(existing) = self.links.iter_mut().find(|l| l.name == name) {
            debug!(link = %name, cid = %target.short(), size, "replacing link");
            existing.target = target;
            existing.size = size;
        } else {
            debug!(link = %name, cid = %target.short(), size, "appending link");
            self.links.push(Link {
                name: name.to_string(),
                target,
                size,
            });
        }
    }

    /// Serialize to dag-pb bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for link in &self.links {
            let mut body = Vec::new();
            put_len_field(&mut body, LINK_HASH, &link.target.to_bytes());
            put_len_field(&mut body, LINK_NAME, link.name.as_bytes());
            put_key(&mut body, LINK_TSIZE, WIRE_VARINT);
            varint::put(&mut body, link.size);
            put_len_field(&mut out, NODE_LINKS, &body);
        }
        if let Some(data) = &self.data {
            put_len_field(&mut out, NODE_DATA, data);
        }
        out
    }

    /// Deserialize dag-pb bytes.
    ///
    /// Fails with [`WrapError::CorruptNode`] on truncated input, unknown
    /// fields, links without a hash or name, or duplicate link names.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut node = DirectoryNode::new();
        let mut fields = Fields::new(bytes);
        while let Some((field, value)) = fields.next_field()? {
            match (field, value) {
                (NODE_LINKS, Value::Bytes(body)) => {
                    let link = decode_link(body)?;
                    if node.link(&link.name).is_some() {
                        return Err(corrupt(format!("duplicate link name {:?}", link.name)));
                    }
                    node.links.push(link);
                }
                (NODE_DATA, Value::Bytes(data)) => {
                    if node.data.is_some() {
                        return Err(corrupt("repeated Data field"));
                    }
                    node.data = Some(data.to_vec());
                }
                (field, _) => return Err(corrupt(format!("unexpected node field {field}"))),
            }
        }
        Ok(node)
    }
}

fn decode_link(bytes: &[u8]) -> Result<Link> {
    let mut hash = None;
    let mut name = None;
    let mut size = None;
    let mut fields = Fields::new(bytes);
    while let Some((field, value)) = fields.next_field()? {
        match (field, value) {
            (LINK_HASH, Value::Bytes(raw)) if hash.is_none() => {
                let (cid, used) = ContentId::read_prefix(raw)
                    .map_err(|e| corrupt(format!("link hash: {e}")))?;
                if used != raw.len() {
                    return Err(corrupt("trailing bytes after link hash"));
                }
                hash = Some(cid);
            }
            (LINK_NAME, Value::Bytes(raw)) if name.is_none() => {
                let s = std::str::from_utf8(raw)
                    .map_err(|_| corrupt("link name is not valid UTF-8"))?;
                name = Some(s.to_string());
            }
            (LINK_TSIZE, Value::Varint(n)) if size.is_none() => size = Some(n),
            (field, _) => return Err(corrupt(format!("unexpected or repeated link field {field}"))),
        }
    }
    Ok(Link {
        target: hash.ok_or_else(|| corrupt("link without hash"))?,
        name: name.ok_or_else(|| corrupt("link without name"))?,
        size: size.unwrap_or(0),
    })
}

fn corrupt(reason: impl Into<String>) -> WrapError {
    WrapError::CorruptNode(reason.into())
}

fn put_key(out: &mut Vec<u8>, field: u64, wire: u64) {
    varint::put(out, (field << 3) | wire);
}

fn put_len_field(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    put_key(out, field, WIRE_LEN);
    varint::put(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

enum Value<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Minimal protobuf field iterator: varint and length-delimited only.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    fn next_field(&mut self) -> Result<Option<(u64, Value<'a>)>> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let (key, rest) = varint::take(self.rest).map_err(corrupt)?;
        let field = key >> 3;
        let value = match key & 0x7 {
            WIRE_VARINT => {
                let (n, rest) = varint::take(rest).map_err(corrupt)?;
                self.rest = rest;
                Value::Varint(n)
            }
            WIRE_LEN => {
                let (len, rest) = varint::take(rest).map_err(corrupt)?;
                let len = usize::try_from(len).map_err(|_| corrupt("field length overflow"))?;
                if rest.len() < len {
                    return Err(corrupt(format!(
                        "field {field} wants {len} bytes, {} remain",
                        rest.len()
                    )));
                }
                let (body, rest) = rest.split_at(len);
                self.rest = rest;
                Value::Bytes(body)
            }
            wire => return Err(corrupt(format!("unsupported wire type {wire} for field {field}"))),
        };
        Ok(Some((field, value)))
    }
}

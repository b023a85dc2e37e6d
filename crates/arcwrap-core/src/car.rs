//! CARv1 container framing.
//!
//! Layout:
//!
//! ```text
//! varint(len) | dag-cbor {"roots": [tag42(0x00 | cid)], "version": 1}
//! varint(len) | cid bytes | block bytes      (repeated)
//! ```
//!
//! [`ContainerPackager::package`] frames a finished directory node as the
//! single root, followed by an unreachable empty-directory padding block
//! because some upload endpoints refuse single-block CARs.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::codec::ContentId;
use crate::error::{Result, WrapError};
use crate::node::DirectoryNode;
use crate::varint;

/// CBOR tag for CIDs in dag-cbor.
const CID_TAG: u64 = 42;

const CAR_VERSION: u64 = 1;

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;

/// Immutable block: bytes plus the identifier they hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: ContentId,
    bytes: Vec<u8>,
}

impl Block {
    /// Encode a directory node into a dag-pb block.
    pub fn from_node(node: &DirectoryNode) -> Self {
        let bytes = node.encode();
        Self {
            cid: ContentId::hash(&bytes),
            bytes,
        }
    }

    /// Pair `bytes` with a claimed identifier, checking the hash.
    pub fn new(cid: ContentId, bytes: Vec<u8>) -> Result<Self> {
        if !cid.verify(&bytes) {
            return Err(WrapError::MalformedContainer(format!(
                "block bytes do not hash to {cid}"
            )));
        }
        Ok(Self { cid, bytes })
    }

    pub fn cid(&self) -> ContentId {
        self.cid
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Streaming CAR encoder into an in-memory buffer.
pub struct CarWriter {
    out: Vec<u8>,
    roots: Vec<ContentId>,
    written: HashSet<ContentId>,
    blocks: usize,
}

impl CarWriter {
    /// Start a container declaring `roots`. At least one root is required.
    pub fn new(roots: &[ContentId]) -> Result<Self> {
        if roots.is_empty() {
            return Err(WrapError::ContainerWriteFailed(
                "container must declare at least one root".to_string(),
            ));
        }
        let header = encode_header(roots);
        let mut out = Vec::with_capacity(header.len() + 10);
        varint::put(&mut out, header.len() as u64);
        out.extend_from_slice(&header);
        Ok(Self {
            out,
            roots: roots.to_vec(),
            written: HashSet::new(),
            blocks: 0,
        })
    }

    /// Append one block record.
    pub fn put(&mut self, block: &Block) -> Result<()> {
        if !block.cid.verify(&block.bytes) {
            return Err(WrapError::ContainerWriteFailed(format!(
                "block {} does not match its bytes",
                block.cid
            )));
        }
        let cid_bytes = block.cid.to_bytes();
        varint::put(&mut self.out, (cid_bytes.len() + block.bytes.len()) as u64);
        self.out.extend_from_slice(&cid_bytes);
        self.out.extend_from_slice(&block.bytes);
        self.written.insert(block.cid);
        self.blocks += 1;
        debug!(cid = %block.cid.short(), bytes = block.bytes.len(), "wrote block");
        Ok(())
    }

    /// Finish the container. Every declared root must have been written.
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(missing) = self.roots.iter().find(|r| !self.written.contains(r)) {
            return Err(WrapError::ContainerWriteFailed(format!(
                "declared root {missing} was never written"
            )));
        }
        debug!(blocks = self.blocks, bytes = self.out.len(), "finished container");
        Ok(self.out)
    }
}

/// Decoded container contents.
#[derive(Debug, Clone)]
pub struct CarContents {
    pub roots: Vec<ContentId>,
    pub blocks: Vec<Block>,
}

impl CarContents {
    pub fn block(&self, cid: &ContentId) -> Option<&Block> {
        self.blocks.iter().find(|b| &b.cid == cid)
    }
}

/// Parse a CARv1 container, verifying every block against its identifier.
pub fn read_car(bytes: &[u8]) -> Result<CarContents> {
    let (header_len, rest) = varint::take(bytes).map_err(malformed)?;
    let header_len = usize::try_from(header_len).map_err(|_| malformed("header too large"))?;
    if rest.len() < header_len {
        return Err(malformed("truncated header"));
    }
    let (header, mut rest) = rest.split_at(header_len);
    let roots = decode_header(header)?;

    let mut blocks = Vec::new();
    while !rest.is_empty() {
        let (len, after) = varint::take(rest).map_err(malformed)?;
        let len = usize::try_from(len).map_err(|_| malformed("block record too large"))?;
        if after.len() < len {
            return Err(malformed(format!(
                "block record wants {len} bytes, {} remain",
                after.len()
            )));
        }
        let (record, after) = after.split_at(len);
        let (cid, used) = ContentId::read_prefix(record)
            .map_err(|e| malformed(format!("block identifier: {e}")))?;
        blocks.push(Block::new(cid, record[used..].to_vec())?);
        rest = after;
    }
    Ok(CarContents { roots, blocks })
}

/// Container ready for upload.
#[derive(Debug, Clone)]
pub struct PackagedContainer {
    pub root: ContentId,
    pub padding: ContentId,
    pub bytes: Vec<u8>,
}

/// Frames a finished directory node into a single-root CAR.
pub struct ContainerPackager;

impl ContainerPackager {
    /// Encode `node` as the root block and frame it with the padding block.
    pub fn package(node: DirectoryNode) -> Result<PackagedContainer> {
        let root = Block::from_node(&node);
        let reread = DirectoryNode::decode(root.bytes())
            .map_err(|e| WrapError::PackagingFailed(format!("root does not decode: {e}")))?;
        if reread != node {
            return Err(WrapError::PackagingFailed(
                "root block does not decode to the node it was built from".to_string(),
            ));
        }
        let padding = Self::padding_block();

        let mut writer = CarWriter::new(&[root.cid()])?;
        writer.put(&root)?;
        writer.put(&padding)?;
        let bytes = writer.finish()?;

        info!(
            event = "container.packaged",
            root = %root.cid(),
            links = node.len(),
            bytes = bytes.len(),
        );
        Ok(PackagedContainer {
            root: root.cid(),
            padding: padding.cid(),
            bytes,
        })
    }

    /// The fixed empty-directory block appended to every container.
    pub fn padding_block() -> Block {
        Block::from_node(&DirectoryNode::empty_unixfs_dir())
    }
}

fn malformed(reason: impl Into<String>) -> WrapError {
    WrapError::MalformedContainer(reason.into())
}

fn cbor_head(out: &mut Vec<u8>, major: u8, n: u64) {
    let m = major << 5;
    match n {
        0..=23 => out.push(m | n as u8),
        24..=0xff => out.extend_from_slice(&[m | 24, n as u8]),
        0x100..=0xffff => {
            out.push(m | 25);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(m | 26);
            out.extend_from_slice(&(n as u32).to_be_bytes());
        }
        _ => {
            out.push(m | 27);
            out.extend_from_slice(&n.to_be_bytes());
        }
    }
}

fn cbor_text(out: &mut Vec<u8>, s: &str) {
    cbor_head(out, MAJOR_TEXT, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// dag-cbor header; keys in length-first order ("roots" before "version").
fn encode_header(roots: &[ContentId]) -> Vec<u8> {
    let mut out = Vec::new();
    cbor_head(&mut out, MAJOR_MAP, 2);
    cbor_text(&mut out, "roots");
    cbor_head(&mut out, MAJOR_ARRAY, roots.len() as u64);
    for root in roots {
        let mut cid_bytes = vec![0x00];
        cid_bytes.extend_from_slice(&root.to_bytes());
        cbor_head(&mut out, MAJOR_TAG, CID_TAG);
        cbor_head(&mut out, MAJOR_BYTES, cid_bytes.len() as u64);
        out.extend_from_slice(&cid_bytes);
    }
    cbor_text(&mut out, "version");
    cbor_head(&mut out, MAJOR_UINT, CAR_VERSION);
    out
}

struct Cbor<'a> {
    rest: &'a [u8],
}

impl<'a> Cbor<'a> {
    fn head(&mut self) -> Result<(u8, u64)> {
        let (&first, rest) = self
            .rest
            .split_first()
            .ok_or_else(|| malformed("truncated header"))?;
        let major = first >> 5;
        let info = first & 0x1f;
        let width = match info {
            0..=23 => 0,
            24 => 1,
            25 => 2,
            26 => 4,
            27 => 8,
            _ => return Err(malformed(format!("unsupported cbor additional info {info}"))),
        };
        if rest.len() < width {
            return Err(malformed("truncated header"));
        }
        let (arg, rest) = rest.split_at(width);
        let n = if width == 0 {
            u64::from(info)
        } else {
            arg.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
        };
        self.rest = rest;
        Ok((major, n))
    }

    fn expect(&mut self, major: u8) -> Result<u64> {
        let (got, n) = self.head()?;
        if got != major {
            return Err(malformed(format!(
                "expected cbor major type {major}, found {got}"
            )));
        }
        Ok(n)
    }

    fn payload(&mut self, len: u64) -> Result<&'a [u8]> {
        let len = usize::try_from(len).map_err(|_| malformed("cbor length overflow"))?;
        if self.rest.len() < len {
            return Err(malformed("truncated header"));
        }
        let (body, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(body)
    }

    fn text(&mut self) -> Result<&'a str> {
        let len = self.expect(MAJOR_TEXT)?;
        std::str::from_utf8(self.payload(len)?).map_err(|_| malformed("header key is not UTF-8"))
    }
}

fn decode_header(bytes: &[u8]) -> Result<Vec<ContentId>> {
    let mut cbor = Cbor { rest: bytes };
    let entries = cbor.expect(MAJOR_MAP)?;
    let mut roots = None;
    let mut version = None;
    for _ in 0..entries {
        match cbor.text()? {
            "roots" => {
                let count = cbor.expect(MAJOR_ARRAY)?;
                let mut list = Vec::new();
                for _ in 0..count {
                    if cbor.expect(MAJOR_TAG)? != CID_TAG {
                        return Err(malformed("root is not tagged as a CID"));
                    }
                    let len = cbor.expect(MAJOR_BYTES)?;
                    let raw = cbor.payload(len)?;
                    let cid_bytes = match raw.split_first() {
                        Some((0x00, cid_bytes)) => cid_bytes,
                        _ => return Err(malformed("root CID lacks multibase identity prefix")),
                    };
                    let (cid, used) = ContentId::read_prefix(cid_bytes)
                        .map_err(|e| malformed(format!("root: {e}")))?;
                    if used != cid_bytes.len() {
                        return Err(malformed("trailing bytes after root CID"));
                    }
                    list.push(cid);
                }
                roots = Some(list);
            }
            "version" => version = Some(cbor.expect(MAJOR_UINT)?),
            other => return Err(malformed(format!("unexpected header key {other:?}"))),
        }
    }
    if !cbor.rest.is_empty() {
        return Err(malformed("trailing bytes in header"));
    }
    match version {
        Some(CAR_VERSION) => {}
        Some(v) => return Err(malformed(format!("unsupported CAR version {v}"))),
        None => return Err(malformed("header has no version")),
    }
    roots.ok_or_else(|| malformed("header has no roots"))
}

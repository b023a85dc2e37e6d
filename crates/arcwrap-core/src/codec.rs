//! Content identifiers and `ipfs://` identifier URLs.
//!
//! [`ContentId`] wraps a CID and is the only way blocks are named in this
//! crate. [`IdentifierUrl`] is the `ipfs://<cid>[/path][?query][#fragment]`
//! form that backends hand back; only the CID participates in DAG linking,
//! the remainder is carried verbatim so a parsed URL formats back to the
//! exact input.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use cid::multihash::Multihash;
use cid::{Cid, Version};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::error::{Result, WrapError};

/// URL scheme prefix for identifier URLs.
pub const SCHEME: &str = "ipfs://";

/// Multicodec code for dag-pb directory nodes.
pub const DAG_PB: u64 = 0x70;

/// Multicodec code for raw leaf blocks.
pub const RAW: u64 = 0x55;

/// Multihash code for sha2-256.
pub const SHA2_256: u64 = 0x12;

/// Self-describing content identifier (CID).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(Cid);

impl ContentId {
    /// Hash `bytes` as a dag-pb block (CIDv1, sha2-256).
    pub fn hash(bytes: &[u8]) -> Self {
        Self::hash_with_codec(DAG_PB, bytes)
    }

    /// Hash `bytes` as a raw leaf block (CIDv1, sha2-256).
    pub fn hash_raw(bytes: &[u8]) -> Self {
        Self::hash_with_codec(RAW, bytes)
    }

    fn hash_with_codec(codec: u64, bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mh = Multihash::<64>::wrap(SHA2_256, &digest)
            .expect("sha2-256 digest always fits a 64-byte multihash");
        Self(Cid::new_v1(codec, mh))
    }

    /// Parse a bare CID string (no scheme).
    pub fn parse(s: &str) -> Result<Self> {
        Cid::try_from(s)
            .map(Self)
            .map_err(|e| WrapError::malformed(s, e))
    }

    /// Read a binary CID from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    pub fn read_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(bytes);
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| WrapError::malformed(format!("<{} binary bytes>", bytes.len()), e))?;
        Ok((Self(cid), cursor.position() as usize))
    }

    /// Binary CID encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Multicodec of the addressed block.
    pub fn codec(&self) -> u64 {
        self.0.codec()
    }

    pub fn is_v0(&self) -> bool {
        self.0.version() == Version::V0
    }

    /// Whether `bytes` hash to this identifier under its own codec and hash.
    ///
    /// Only sha2-256 identifiers can be verified; anything else reports `false`.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        if self.0.hash().code() != SHA2_256 {
            return false;
        }
        self.0.hash().digest() == Sha256::digest(bytes).as_slice()
    }

    /// `ipfs://<cid>` form.
    pub fn to_url(&self) -> String {
        format!("{SCHEME}{}", self.0)
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> String {
        let s = self.0.to_string();
        if s.len() <= 16 {
            return s;
        }
        format!("{}…{}", &s[..8], &s[s.len() - 6..])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

impl FromStr for ContentId {
    type Err = WrapError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An `ipfs://` identifier URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdentifierUrl {
    cid: ContentId,
    /// The CID exactly as written; any multibase is kept as given.
    cid_text: String,
    /// Everything after the CID (`/path`, `?query`, `#fragment`), verbatim.
    suffix: String,
}

impl IdentifierUrl {
    /// Parse `ipfs://<cid>[/path][?query][#fragment]`.
    ///
    /// The CID is the text between the scheme and the first `/`, `?` or `#`.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| WrapError::malformed(uri, format!("missing {SCHEME} prefix")))?;
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (cid_text, suffix) = rest.split_at(end);
        if cid_text.is_empty() {
            return Err(WrapError::malformed(uri, "empty content identifier"));
        }
        let cid = Cid::try_from(cid_text).map_err(|e| WrapError::malformed(uri, e))?;
        Ok(Self {
            cid: ContentId(cid),
            cid_text: cid_text.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn cid(&self) -> ContentId {
        self.cid
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Whether the URL names the CID's own block, i.e. carries no path
    /// beyond an optional trailing `/`.
    pub fn is_root(&self) -> bool {
        let end = self.suffix.find(['?', '#']).unwrap_or(self.suffix.len());
        matches!(&self.suffix[..end], "" | "/")
    }

    /// Same URL with `?format=raw` requested, keeping path and fragment.
    pub fn with_raw_format(&self) -> String {
        let (before_fragment, fragment) = match self.suffix.find('#') {
            Some(i) => self.suffix.split_at(i),
            None => (self.suffix.as_str(), ""),
        };
        let sep = if before_fragment.contains('?') { '&' } else { '?' };
        format!(
            "{SCHEME}{}{before_fragment}{sep}format=raw{fragment}",
            self.cid_text
        )
    }
}

impl From<ContentId> for IdentifierUrl {
    fn from(cid: ContentId) -> Self {
        Self {
            cid,
            cid_text: cid.to_string(),
            suffix: String::new(),
        }
    }
}

impl fmt::Display for IdentifierUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}{}", self.cid_text, self.suffix)
    }
}

impl fmt::Debug for IdentifierUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentifierUrl({self})")
    }
}

impl Serialize for IdentifierUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IdentifierUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl FromStr for IdentifierUrl {
    type Err = WrapError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "ipfs://bafybeiaqxlrvmovkiiniojnsy67fnfagddb2ml67ejbjcqgqyccedaegxi/";

    #[test]
    fn hash_is_deterministic() {
        let a = ContentId::hash(b"directory bytes");
        let b = ContentId::hash(b"directory bytes");
        assert_eq!(a, b);
        assert_eq!(a.codec(), DAG_PB);
    }

    #[test]
    fn different_bytes_different_identifier() {
        assert_ne!(ContentId::hash(b"a"), ContentId::hash(b"b"));
    }

    #[test]
    fn raw_and_dag_pb_differ_for_same_bytes() {
        let pb = ContentId::hash(b"same");
        let raw = ContentId::hash_raw(b"same");
        assert_ne!(pb, raw);
        assert_eq!(raw.codec(), RAW);
    }

    #[test]
    fn verify_matches_only_original_bytes() {
        let cid = ContentId::hash(b"payload");
        assert!(cid.verify(b"payload"));
        assert!(!cid.verify(b"payload!"));
    }

    #[test]
    fn url_roundtrip_with_trailing_slash() {
        let url = IdentifierUrl::parse(TEMPLATE).unwrap();
        assert_eq!(url.suffix(), "/");
        assert_eq!(url.to_string(), TEMPLATE);
    }

    #[test]
    fn url_roundtrip_bare_and_with_path() {
        let cid = ContentId::hash(b"x");
        let bare = cid.to_url();
        assert_eq!(IdentifierUrl::parse(&bare).unwrap().to_string(), bare);

        let with_path = format!("{bare}/archives/site.wacz");
        let parsed = IdentifierUrl::parse(&with_path).unwrap();
        assert_eq!(parsed.cid(), cid);
        assert_eq!(parsed.to_string(), with_path);
    }

    #[test]
    fn fragment_yields_same_cid() {
        let cid = ContentId::hash_raw(b"file");
        let url = format!("{}#site.wacz", cid.to_url());
        let parsed = IdentifierUrl::parse(&url).unwrap();
        assert_eq!(parsed.cid(), cid);
        assert_eq!(parsed.to_string(), url);
    }

    #[test]
    fn v0_identifier_roundtrips() {
        let url = "ipfs://QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn";
        let parsed = IdentifierUrl::parse(url).unwrap();
        assert!(parsed.cid().is_v0());
        assert_eq!(parsed.to_string(), url);
    }

    #[test]
    fn base58_v1_identifier_keeps_its_encoding() {
        let url = "ipfs://zb2rhZhfZ71VE6u6BX78cmaNKsLmDde9EYyrY9dsRVLJWr9oW/x.wacz";
        let parsed = IdentifierUrl::parse(url).unwrap();
        assert!(!parsed.cid().is_v0());
        assert_eq!(parsed.to_string(), url);
        assert!(parsed
            .with_raw_format()
            .starts_with("ipfs://zb2rhZhfZ71VE6u6BX78cmaNKsLmDde9EYyrY9dsRVLJWr9oW/x.wacz?"));
    }

    #[test]
    fn upper_case_base32_keeps_its_encoding() {
        let lower = IdentifierUrl::parse(TEMPLATE).unwrap();
        let url = "ipfs://BAFYBEIAQXLRVMOVKIINIOJNSY67FNFAGDDB2ML67EJBJCQGQYCCEDAEGXI/";
        let upper = IdentifierUrl::parse(url).unwrap();
        assert_eq!(upper.cid(), lower.cid());
        assert_eq!(upper.to_string(), url);
    }

    #[test]
    fn root_detection_ignores_query_and_fragment() {
        let cid = ContentId::hash(b"z").to_url();
        for root in [cid.clone(), format!("{cid}/"), format!("{cid}?a=1"), format!("{cid}/#f")] {
            assert!(IdentifierUrl::parse(&root).unwrap().is_root(), "{root}");
        }
        for sub in [format!("{cid}/site/"), format!("{cid}/a?b=1")] {
            assert!(!IdentifierUrl::parse(&sub).unwrap().is_root(), "{sub}");
        }
    }

    #[test]
    fn missing_scheme_is_malformed() {
        let err = IdentifierUrl::parse("bafybeiaqxlrvmovkiiniojnsy67fnfagddb2ml67ejbjcqgqyccedaegxi")
            .unwrap_err();
        assert!(matches!(err, WrapError::MalformedIdentifier { .. }));
    }

    #[test]
    fn truncated_cid_is_malformed() {
        let err = IdentifierUrl::parse("ipfs://bafybeiaqxlrvmov/").unwrap_err();
        assert!(matches!(err, WrapError::MalformedIdentifier { .. }));
    }

    #[test]
    fn empty_cid_is_malformed() {
        assert!(matches!(
            IdentifierUrl::parse("ipfs:///path"),
            Err(WrapError::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn raw_format_request_keeps_path_and_fragment() {
        let url = IdentifierUrl::parse(TEMPLATE).unwrap();
        assert_eq!(
            url.with_raw_format(),
            "ipfs://bafybeiaqxlrvmovkiiniojnsy67fnfagddb2ml67ejbjcqgqyccedaegxi/?format=raw"
        );

        let cid = ContentId::hash(b"y");
        let url = IdentifierUrl::parse(&format!("{}?a=1#frag", cid.to_url())).unwrap();
        assert_eq!(
            url.with_raw_format(),
            format!("{}?a=1&format=raw#frag", cid.to_url())
        );
    }

    #[test]
    fn binary_prefix_read_consumes_exact_length() {
        let cid = ContentId::hash(b"block");
        let mut bytes = cid.to_bytes();
        let len = bytes.len();
        bytes.extend_from_slice(b"trailing data");
        let (read, consumed) = ContentId::read_prefix(&bytes).unwrap();
        assert_eq!(read, cid);
        assert_eq!(consumed, len);
    }

    #[test]
    fn serde_uses_string_form() {
        let cid = ContentId::hash(b"serde");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{cid}\""));
        let back: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
    }
}

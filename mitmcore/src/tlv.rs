use log::warn;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("TLV buffer ends inside a tag, length or value field")]
    TruncatedBuffer,

    #[error("long-form length declares {0} bytes, maximum is 4")]
    OverlongLength(usize),

    #[error("indefinite length form is not supported")]
    IndefiniteLength,

    #[error("zero tag byte where a tag is required")]
    EmptyTagByte,

    #[error("tags longer than two bytes are not supported")]
    TagTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagForm {
    Primitive,
    Constructed,
}

/// A BER-TLV tag of one or two bytes. The original byte width is kept so
/// serialization reproduces the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    value: u16,
    width: u8,
}

impl Tag {
    pub const fn of(value: u16) -> Tag {
        Tag {
            value,
            width: if value > 0xFF { 2 } else { 1 },
        }
    }

    fn from_first(byte: u8) -> Tag {
        Tag {
            value: byte as u16,
            width: 1,
        }
    }

    fn from_pair(first: u8, second: u8) -> Tag {
        Tag {
            value: ((first as u16) << 8) | second as u16,
            width: 2,
        }
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    fn first_byte(&self) -> u8 {
        if self.width == 2 {
            (self.value >> 8) as u8
        } else {
            self.value as u8
        }
    }

    pub fn class(&self) -> TagClass {
        match self.first_byte() >> 6 {
            0b00 => TagClass::Universal,
            0b01 => TagClass::Application,
            0b10 => TagClass::Context,
            _ => TagClass::Private,
        }
    }

    pub fn form(&self) -> TagForm {
        if self.first_byte() & 0x20 != 0 {
            TagForm::Constructed
        } else {
            TagForm::Primitive
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        if self.width == 2 {
            vec![(self.value >> 8) as u8, self.value as u8]
        } else {
            vec![self.value as u8]
        }
    }
}

impl From<u16> for Tag {
    fn from(value: u16) -> Self {
        Tag::of(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.width == 2 {
            write!(f, "{:04X}", self.value)
        } else {
            write!(f, "{:02X}", self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    Primitive(Vec<u8>),
    Constructed(Vec<TlvNode>),
}

/// One parsed TLV element. `original_length` holds the wire encoding of the
/// length field so unmodified nodes round-trip byte-exact even when the
/// encoder used a non-minimal long form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvNode {
    tag: Tag,
    value: TlvValue,
    original_length: Option<Vec<u8>>,
}

impl TlvNode {
    pub fn primitive(tag: Tag, value: Vec<u8>) -> TlvNode {
        TlvNode {
            tag,
            value: TlvValue::Primitive(value),
            original_length: None,
        }
    }

    pub fn constructed(tag: Tag, children: Vec<TlvNode>) -> TlvNode {
        TlvNode {
            tag,
            value: TlvValue::Constructed(children),
            original_length: None,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn value(&self) -> &TlvValue {
        &self.value
    }

    /// Raw bytes of a primitive node (including opaque fallbacks).
    pub fn raw_value(&self) -> Option<&[u8]> {
        match &self.value {
            TlvValue::Primitive(v) => Some(v),
            TlvValue::Constructed(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[TlvNode]> {
        match &self.value {
            TlvValue::Constructed(children) => Some(children),
            TlvValue::Primitive(_) => None,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_bytes());

        let value_bytes = match &self.value {
            TlvValue::Primitive(v) => v.clone(),
            TlvValue::Constructed(children) => {
                let mut buf: Vec<u8> = Vec::new();
                for child in children {
                    child.write_to(&mut buf);
                }
                buf
            }
        };

        match &self.original_length {
            Some(encoding) if decoded_length(encoding) == Some(value_bytes.len()) => {
                out.extend_from_slice(encoding)
            }
            _ => out.extend_from_slice(&encode_length(value_bytes.len())),
        }

        out.extend_from_slice(&value_bytes);
    }
}

/// One TLV edit. All edits address the first **top-level** occurrence of a
/// tag; nested occurrences are never touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvEdit {
    /// Replace the first top-level occurrence, or append when absent.
    Replace(Tag, Vec<u8>),
    /// Remove the first top-level occurrence when present.
    Remove(Tag),
    /// Insert before the first top-level occurrence of the position tag,
    /// or at the end when the position tag is absent.
    Insert(Tag, Vec<u8>, Option<Tag>),
}

impl TlvEdit {
    pub fn tag(&self) -> Tag {
        match self {
            TlvEdit::Replace(tag, _) => *tag,
            TlvEdit::Remove(tag) => *tag,
            TlvEdit::Insert(tag, _, _) => *tag,
        }
    }
}

impl fmt::Display for TlvEdit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlvEdit::Replace(tag, value) => {
                write!(f, "replace {}={}", tag, hex::encode_upper(value))
            }
            TlvEdit::Remove(tag) => write!(f, "remove {}", tag),
            TlvEdit::Insert(tag, value, _) => {
                write!(f, "insert {}={}", tag, hex::encode_upper(value))
            }
        }
    }
}

/// An ordered sequence of top-level TLV nodes. Order is preserved on parse
/// and on serialize; only explicit edits reorder, insert or remove.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlvSet {
    nodes: Vec<TlvNode>,
}

impl TlvSet {
    /// Parse a complete BER-TLV buffer. The outer stream is strict; inside a
    /// constructed node a failing child parse degrades the node to an opaque
    /// primitive because inner blobs may be proprietary non-TLV.
    pub fn parse(buf: &[u8]) -> Result<TlvSet, ParseError> {
        Ok(TlvSet {
            nodes: parse_nodes(buf)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        for node in &self.nodes {
            node.write_to(&mut out);
        }
        out
    }

    pub fn nodes(&self) -> &[TlvNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: TlvNode) {
        self.nodes.push(node);
    }

    /// Depth-first search returning the *first* occurrence of a tag.
    pub fn find(&self, tag: Tag) -> Option<&TlvNode> {
        find_in(&self.nodes, tag)
    }

    /// Raw value of the first primitive occurrence of a tag, any depth.
    pub fn find_value(&self, tag: Tag) -> Option<&[u8]> {
        self.find(tag).and_then(|node| node.raw_value())
    }

    pub fn find_top_level(&self, tag: Tag) -> Option<&TlvNode> {
        self.nodes.iter().find(|node| node.tag == tag)
    }

    /// Apply edits in list order; the result of edit i is the input of
    /// edit i+1.
    pub fn apply(&mut self, edits: &[TlvEdit]) {
        for edit in edits {
            match edit {
                TlvEdit::Replace(tag, value) => {
                    match self.nodes.iter_mut().find(|node| node.tag == *tag) {
                        Some(node) => {
                            node.value = TlvValue::Primitive(value.clone());
                            node.original_length = None;
                        }
                        None => self.nodes.push(TlvNode::primitive(*tag, value.clone())),
                    }
                }
                TlvEdit::Remove(tag) => {
                    if let Some(at) = self.nodes.iter().position(|node| node.tag == *tag) {
                        self.nodes.remove(at);
                    }
                }
                TlvEdit::Insert(tag, value, position) => {
                    let at = position
                        .and_then(|p| self.nodes.iter().position(|node| node.tag == p))
                        .unwrap_or(self.nodes.len());
                    self.nodes.insert(at, TlvNode::primitive(*tag, value.clone()));
                }
            }
        }
    }
}

fn find_in(nodes: &[TlvNode], tag: Tag) -> Option<&TlvNode> {
    for node in nodes {
        if node.tag == tag {
            return Some(node);
        }
        if let TlvValue::Constructed(children) = &node.value {
            if let Some(found) = find_in(children, tag) {
                return Some(found);
            }
        }
    }
    None
}

fn parse_nodes(buf: &[u8]) -> Result<Vec<TlvNode>, ParseError> {
    let mut nodes: Vec<TlvNode> = Vec::new();
    let mut i = 0;

    while i < buf.len() {
        let (node, used) = parse_node(&buf[i..])?;
        nodes.push(node);
        i += used;
    }

    Ok(nodes)
}

fn parse_node(buf: &[u8]) -> Result<(TlvNode, usize), ParseError> {
    if buf.is_empty() {
        return Err(ParseError::TruncatedBuffer);
    }
    if buf[0] == 0x00 {
        return Err(ParseError::EmptyTagByte);
    }

    let mut i = 0;
    let first = buf[i];
    i += 1;

    // ISO 7816 / BER: low five bits all set means the tag continues.
    let tag = if first & 0x1F == 0x1F {
        if i >= buf.len() {
            return Err(ParseError::TruncatedBuffer);
        }
        let second = buf[i];
        i += 1;
        if second == 0x00 {
            return Err(ParseError::EmptyTagByte);
        }
        if second & 0x80 != 0 {
            return Err(ParseError::TagTooLong);
        }
        Tag::from_pair(first, second)
    } else {
        Tag::from_first(first)
    };

    if i >= buf.len() {
        return Err(ParseError::TruncatedBuffer);
    }

    let length_first = buf[i];
    let (length, length_encoding) = if length_first < 0x80 {
        i += 1;
        (length_first as usize, vec![length_first])
    } else {
        let count = (length_first & 0x7F) as usize;
        if count == 0 {
            return Err(ParseError::IndefiniteLength);
        }
        if count > 4 {
            return Err(ParseError::OverlongLength(count));
        }
        if i + 1 + count > buf.len() {
            return Err(ParseError::TruncatedBuffer);
        }
        let mut length: usize = 0;
        for &byte in &buf[i + 1..i + 1 + count] {
            length = (length << 8) | byte as usize;
        }
        let encoding = buf[i..i + 1 + count].to_vec();
        i += 1 + count;
        (length, encoding)
    };

    if i + length > buf.len() {
        return Err(ParseError::TruncatedBuffer);
    }
    let raw = &buf[i..i + length];

    let value = if tag.form() == TagForm::Constructed {
        match parse_nodes(raw) {
            Ok(children) => TlvValue::Constructed(children),
            Err(err) => {
                warn!(
                    "tag {} value does not parse as TLV ({}), keeping {} bytes opaque",
                    tag,
                    err,
                    raw.len()
                );
                TlvValue::Primitive(raw.to_vec())
            }
        }
    } else {
        TlvValue::Primitive(raw.to_vec())
    };

    Ok((
        TlvNode {
            tag,
            value,
            original_length: Some(length_encoding),
        },
        i + length,
    ))
}

fn decoded_length(encoding: &[u8]) -> Option<usize> {
    match encoding.split_first()? {
        (&first, rest) if first < 0x80 && rest.is_empty() => Some(first as usize),
        (&first, rest)
            if first & 0x80 != 0
                && (first & 0x7F) as usize == rest.len()
                && !rest.is_empty()
                && rest.len() <= 4 =>
        {
            let mut length: usize = 0;
            for &byte in rest {
                length = (length << 8) | byte as usize;
            }
            Some(length)
        }
        _ => None,
    }
}

// EMV Book 3, Annex A names for the tags this proxy reads or rewrites.
// Anything absent here is carried as an opaque primitive and never
// introspected further.
static TAG_NAMES: &[(u16, &str)] = &[
    (0x4F, "Application Identifier (AID)"),
    (0x50, "Application Label"),
    (0x57, "Track 2 Equivalent Data"),
    (0x5A, "Application Primary Account Number (PAN)"),
    (0x6F, "File Control Information (FCI) Template"),
    (0x70, "EMV Proprietary Template"),
    (0x77, "Response Message Template Format 2"),
    (0x82, "Application Interchange Profile (AIP)"),
    (0x84, "Dedicated File (DF) Name"),
    (0x8E, "Cardholder Verification Method (CVM) List"),
    (0x90, "Issuer Public Key Certificate"),
    (0x92, "Issuer Public Key Remainder"),
    (0x95, "Terminal Verification Results"),
    (0xA5, "File Control Information (FCI) Proprietary Template"),
    (0x5F20, "Cardholder Name"),
    (0x5F24, "Application Expiration Date"),
    (0x5F28, "Issuer Country Code"),
    (0x5F2A, "Transaction Currency Code"),
    (0x9F02, "Amount, Authorised (Numeric)"),
    (0x9F07, "Application Usage Control"),
    (0x9F10, "Issuer Application Data (IAD)"),
    (0x9F1A, "Terminal Country Code"),
    (0x9F1B, "Terminal Floor Limit"),
    (0x9F26, "Application Cryptogram (AC)"),
    (0x9F27, "Cryptogram Information Data (CID)"),
    (0x9F32, "Issuer Public Key Exponent"),
    (0x9F33, "Terminal Capabilities"),
    (0x9F34, "Cardholder Verification Method (CVM) Results"),
    (0x9F35, "Terminal Type"),
    (0x9F36, "Application Transaction Counter (ATC)"),
    (0x9F45, "Data Authentication Code"),
    (0x9F51, "Application Currency Code"),
    (0x9F6C, "Card Transaction Qualifiers (CTQ)"),
];

/// Semantic name for logging; unknown tags stay opaque.
pub fn tag_name(tag: Tag) -> Option<&'static str> {
    TAG_NAMES
        .iter()
        .find(|(value, _)| *value == tag.value())
        .map(|(_, name)| *name)
}

/// Shortest valid BER length encoding.
pub(crate) fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        return vec![length as u8];
    }

    let mut bytes: Vec<u8> = Vec::new();
    let mut remaining = length;
    while remaining > 0 {
        bytes.insert(0, (remaining & 0xFF) as u8);
        remaining >>= 8;
    }

    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend_from_slice(&bytes);
    out
}

//! DNS message parsing and construction.
//!
//! Covers the RFC 1035 header, question and resource record sections. Names
//! are kept in uncompressed wire form so that records decoded from one
//! message can be encoded into another, which is what merging upstream
//! answers into a client reply needs. Encoding compresses names again.

use std::fmt;
use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;

use crate::error::DecodeError;

pub const HEADER_LEN: usize = 12;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 64;
const MAX_POINTER_OFFSET: usize = 0x3FFF;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_DNAME: u16 = 39;

pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000F;

/// A domain name in uncompressed wire form (length-prefixed labels ending
/// with the zero-length root label).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Name {
    wire: Vec<u8>,
}

impl Name {
    pub fn root() -> Self {
        Self { wire: vec![0] }
    }

    /// Build a name from dotted text. A trailing dot is optional.
    pub fn from_ascii(text: &str) -> Result<Self, DecodeError> {
        let text = text.strip_suffix('.').unwrap_or(text);
        if text.is_empty() {
            return Ok(Self::root());
        }

        let mut wire = Vec::with_capacity(text.len() + 2);
        for (i, label) in text.split('.').enumerate() {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DecodeError::BadLabel(i));
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);

        if wire.len() > MAX_NAME_LEN {
            return Err(DecodeError::NameTooLong);
        }
        Ok(Self { wire })
    }

    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn labels(&self) -> Labels<'_> {
        Labels {
            wire: &self.wire,
            pos: 0,
        }
    }

    /// Compare names the way DNS does: ASCII case-insensitive.
    pub fn eq_ignore_case(&self, other: &Name) -> bool {
        // Length octets never fall in the ASCII letter range, so comparing
        // the whole wire form is safe.
        self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl Default for Name {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut empty = true;
        for label in self.labels() {
            empty = false;
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    0x21..=0x7e => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{b:03}")?,
                }
            }
            f.write_str(".")?;
        }
        if empty {
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

/// Iterator over the labels of a [`Name`], root label excluded.
pub struct Labels<'a> {
    wire: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.wire.get(self.pos)? as usize;
        if len == 0 {
            return None;
        }
        let label = self.wire.get(self.pos + 1..self.pos + 1 + len)?;
        self.pos += 1 + len;
        Some(label)
    }
}

/// DNS header. Section counts are derived from the message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn set_response(&mut self, response: bool) {
        self.set_flag(FLAG_QR, response);
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn set_truncated(&mut self, truncated: bool) {
        self.set_flag(FLAG_TC, truncated);
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    pub fn set_recursion_available(&mut self, available: bool) {
        self.set_flag(FLAG_RA, available);
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    pub fn set_rcode(&mut self, rcode: u8) {
        self.flags = (self.flags & !RCODE_MASK) | (u16::from(rcode) & RCODE_MASK);
    }

    fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// Same name (case-insensitive), type and class.
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && self.name.eq_ignore_case(&other.name)
    }
}

/// A DNS resource record. Names embedded in the RDATA of well-known types
/// are stored uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    /// Create an A record.
    pub fn a(name: Name, class: u16, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            name,
            rtype: TYPE_A,
            class,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }
}

/// A decoded DNS message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// Parse a DNS message from raw bytes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut message = Self::default();
        message.decode_into(data)?;
        Ok(message)
    }

    /// Replace the contents of `self` with the message in `data`.
    ///
    /// Existing section allocations are reused. On error the message is left
    /// empty.
    pub fn decode_into(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        self.clear();
        let result = self.decode_sections(data);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn decode_sections(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }

        self.header = Header {
            id: read_u16(data, 0)?,
            flags: read_u16(data, 2)?,
        };
        let qdcount = read_u16(data, 4)?;
        let ancount = read_u16(data, 6)?;
        let nscount = read_u16(data, 8)?;
        let arcount = read_u16(data, 10)?;

        let mut pos = HEADER_LEN;
        for _ in 0..qdcount {
            let (name, next) = read_name(data, pos)?;
            let qtype = read_u16(data, next)?;
            let qclass = read_u16(data, next + 2)?;
            self.questions.push(Question { name, qtype, qclass });
            pos = next + 4;
        }

        for (count, section) in [
            (ancount, &mut self.answers),
            (nscount, &mut self.authorities),
            (arcount, &mut self.additionals),
        ] {
            for _ in 0..count {
                let (record, next) = read_record(data, pos)?;
                section.push(record);
                pos = next;
            }
        }

        Ok(())
    }

    /// Empty every section and zero the header.
    pub fn clear(&mut self) {
        self.header = Header::default();
        self.questions.clear();
        self.answers.clear();
        self.authorities.clear();
        self.additionals.clear();
    }

    /// Encode the message to wire format bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);
        self.encode_into(&mut data);
        data
    }

    /// Append the wire form of the message to `data`.
    ///
    /// Owner names, question names and the names inside NS, CNAME, PTR, MX
    /// and SOA data are compressed against every name written before them.
    pub fn encode_into(&self, data: &mut Vec<u8>) {
        let base = data.len();
        let mut offsets = NameOffsets::default();

        // Header
        data.extend_from_slice(&self.header.id.to_be_bytes());
        data.extend_from_slice(&self.header.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for q in &self.questions {
            write_name(data, base, q.name.as_wire(), &mut offsets);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            write_name(data, base, record.name.as_wire(), &mut offsets);
            data.extend_from_slice(&record.rtype.to_be_bytes());
            data.extend_from_slice(&record.class.to_be_bytes());
            data.extend_from_slice(&record.ttl.to_be_bytes());
            write_rdata(data, base, record, &mut offsets);
        }
    }
}

/// Name suffixes already written, by offset from the start of the message.
type NameOffsets<'a> = FxHashMap<&'a [u8], u16>;

/// Write an uncompressed name, replacing its longest suffix already present
/// in the message with a pointer. Suffixes match byte for byte.
fn write_name<'a>(data: &mut Vec<u8>, base: usize, wire: &'a [u8], offsets: &mut NameOffsets<'a>) {
    let mut pos = 0;
    while let Some(&len) = wire.get(pos) {
        if len == 0 {
            break;
        }
        let suffix = &wire[pos..];
        if let Some(&offset) = offsets.get(suffix) {
            data.extend_from_slice(&(0xC000 | offset).to_be_bytes());
            return;
        }
        let offset = data.len() - base;
        if offset <= MAX_POINTER_OFFSET {
            offsets.insert(suffix, offset as u16);
        }
        let end = (pos + 1 + len as usize).min(wire.len());
        data.extend_from_slice(&wire[pos..end]);
        pos = end;
    }
    data.push(0);
}

/// Write RDLENGTH and RDATA, compressing embedded names where RFC 1035
/// allows it. SRV and DNAME targets are always written in full.
fn write_rdata<'a>(
    data: &mut Vec<u8>,
    base: usize,
    record: &'a Record,
    offsets: &mut NameOffsets<'a>,
) {
    let rdata = record.rdata.as_slice();
    let len_at = data.len();
    data.extend_from_slice(&[0, 0]);

    let layout = match record.rtype {
        TYPE_NS | TYPE_CNAME | TYPE_PTR | TYPE_MX | TYPE_SOA => rdata_layout(record.rtype),
        _ => None,
    };
    let split = layout.and_then(|(prefix, count, suffix)| {
        name_lengths(rdata, prefix, count, suffix).map(|lengths| (prefix, count, lengths))
    });

    match split {
        Some((prefix, count, lengths)) => {
            data.extend_from_slice(&rdata[..prefix]);
            let mut pos = prefix;
            for len in &lengths[..count] {
                write_name(data, base, &rdata[pos..pos + len], offsets);
                pos += len;
            }
            data.extend_from_slice(&rdata[pos..]);
        }
        None => data.extend_from_slice(rdata),
    }

    let rdlength = (data.len() - len_at - 2) as u16;
    data[len_at..len_at + 2].copy_from_slice(&rdlength.to_be_bytes());
}

/// Fixed-size prefix, number of embedded names and fixed-size suffix of the
/// RDATA types that carry domain names.
fn rdata_layout(rtype: u16) -> Option<(usize, usize, usize)> {
    match rtype {
        TYPE_NS | TYPE_CNAME | TYPE_PTR | TYPE_DNAME => Some((0, 1, 0)),
        TYPE_MX => Some((2, 1, 0)),
        TYPE_SRV => Some((6, 1, 0)),
        TYPE_SOA => Some((0, 2, 20)),
        _ => None,
    }
}

/// Lengths of the uncompressed names in `rdata`, if it is exactly `prefix`
/// bytes, `count` names and `suffix` bytes.
fn name_lengths(rdata: &[u8], prefix: usize, count: usize, suffix: usize) -> Option<[usize; 2]> {
    let mut lengths = [0; 2];
    let mut pos = prefix;
    for len in lengths.iter_mut().take(count) {
        *len = rdata.get(pos..).and_then(wire_name_len)?;
        pos += *len;
    }
    (pos + suffix == rdata.len()).then_some(lengths)
}

/// Length of the uncompressed name at the start of `wire`.
fn wire_name_len(wire: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let len = *wire.get(pos)? as usize;
        if len > MAX_LABEL_LEN {
            return None;
        }
        pos += 1 + len;
        if pos > MAX_NAME_LEN || pos > wire.len() {
            return None;
        }
        if len == 0 {
            return Some(pos);
        }
    }
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, DecodeError> {
    match data.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(DecodeError::Truncated(pos)),
    }
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, DecodeError> {
    match data.get(pos..pos + 4) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(DecodeError::Truncated(pos)),
    }
}

/// Read a possibly compressed name starting at `start`.
///
/// Returns the expanded name and the offset just past the name in the
/// original byte stream.
fn read_name(data: &[u8], start: usize) -> Result<(Name, usize), DecodeError> {
    let mut wire = Vec::with_capacity(32);
    let mut pos = start;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos).ok_or(DecodeError::Truncated(pos))? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                wire.push(0);
                break;
            }
            0x00 => {
                let label = data
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(DecodeError::Truncated(pos))?;
                if wire.len() + 1 + len + 1 > MAX_NAME_LEN {
                    return Err(DecodeError::NameTooLong);
                }
                wire.push(len as u8);
                wire.extend_from_slice(label);
                pos += 1 + len;
            }
            0xC0 => {
                let low = *data.get(pos + 1).ok_or(DecodeError::Truncated(pos + 1))? as usize;
                let target = ((len & 0x3F) << 8) | low;
                // Pointers must refer to earlier data.
                if target >= pos {
                    return Err(DecodeError::PointerLoop(pos));
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DecodeError::PointerLoop(pos));
                }
                end.get_or_insert(pos + 2);
                pos = target;
                continue;
            }
            _ => return Err(DecodeError::BadLabel(pos)),
        }
    }

    let next = end.unwrap_or(pos + 1);
    Ok((Name { wire }, next))
}

fn read_record(data: &[u8], start: usize) -> Result<(Record, usize), DecodeError> {
    let (name, pos) = read_name(data, start)?;
    let rtype = read_u16(data, pos)?;
    let class = read_u16(data, pos + 2)?;
    let ttl = read_u32(data, pos + 4)?;
    let rdlength = read_u16(data, pos + 8)? as usize;
    let rdata_start = pos + 10;
    let rdata_end = rdata_start + rdlength;
    if rdata_end > data.len() {
        return Err(DecodeError::Truncated(rdata_start));
    }

    let rdata = read_rdata(data, rtype, rdata_start, rdata_end)?;
    Ok((
        Record {
            name,
            rtype,
            class,
            ttl,
            rdata,
        },
        rdata_end,
    ))
}

/// Copy RDATA, expanding compressed names for types that embed them.
fn read_rdata(data: &[u8], rtype: u16, start: usize, end: usize) -> Result<Vec<u8>, DecodeError> {
    let Some((prefix, names, suffix)) = rdata_layout(rtype) else {
        return Ok(data[start..end].to_vec());
    };

    if start + prefix > end {
        return Err(DecodeError::BadRdata);
    }
    let mut rdata = Vec::with_capacity(end - start + 16);
    rdata.extend_from_slice(&data[start..start + prefix]);

    let mut pos = start + prefix;
    for _ in 0..names {
        let (name, next) = read_name(data, pos)?;
        if next > end {
            return Err(DecodeError::BadRdata);
        }
        rdata.extend_from_slice(name.as_wire());
        pos = next;
    }

    if pos + suffix != end {
        return Err(DecodeError::BadRdata);
    }
    rdata.extend_from_slice(&data[pos..end]);
    Ok(rdata)
}

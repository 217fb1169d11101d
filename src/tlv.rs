//! Matter TLV encoding and decoding.
//!
//! Only the subset needed by certificates, persisted records and CASE messages
//! is supported: integers, booleans, null, strings with 1 or 2 byte lengths and
//! the three container kinds with anonymous or context-specific tags.
//!
//! ```
//! # use matter_fabric::tlv;
//! # fn main() -> anyhow::Result<()> {
//! let mut tlv = tlv::TlvBuffer::new();
//! tlv.write_anon_struct()?;
//! tlv.write_uint64(1, 0x1122334455667788)?;
//! tlv.write_octetstring(2, &[1, 2, 3])?;
//! tlv.write_struct_end()?;
//! let item = tlv::decode_tlv(&tlv.data)?;
//! assert_eq!(item.get_u64(&[1]), Some(0x1122334455667788));
//! # Ok(())
//! # }
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Result, Write};

pub struct TlvBuffer {
    pub data: Vec<u8>,
}

const TYPE_INT_1: u8 = 0x00;
const TYPE_INT_2: u8 = 0x01;
const TYPE_INT_4: u8 = 0x02;
const TYPE_INT_8: u8 = 0x03;
const TYPE_UINT_1: u8 = 0x04;
const TYPE_UINT_2: u8 = 0x05;
const TYPE_UINT_4: u8 = 0x06;
const TYPE_UINT_8: u8 = 0x07;
const TYPE_BOOL_FALSE: u8 = 0x08;
const TYPE_BOOL_TRUE: u8 = 0x09;
const TYPE_UTF8_L1: u8 = 0x0c;
const TYPE_UTF8_L2: u8 = 0x0d;
const TYPE_OCTET_STRING_L1: u8 = 0x10;
const TYPE_OCTET_STRING_L2: u8 = 0x11;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CONTAINER: u8 = 0x18;

const CTRL_CTX_L1: u8 = 1 << 5;

// Containers deeper than this are rejected so hostile input can't blow the stack.
const MAX_DEPTH: usize = 8;

impl TlvBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(512),
        }
    }
    fn ctx(&mut self, typ: u8, tag: u8) -> Result<()> {
        self.data.write_u8(CTRL_CTX_L1 | typ)?;
        self.data.write_u8(tag)
    }
    pub fn write_anon_struct(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_STRUCT)
    }
    pub fn write_anon_array(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_ARRAY)
    }
    pub fn write_struct(&mut self, tag: u8) -> Result<()> {
        self.ctx(TYPE_STRUCT, tag)
    }
    pub fn write_array(&mut self, tag: u8) -> Result<()> {
        self.ctx(TYPE_ARRAY, tag)
    }
    pub fn write_list(&mut self, tag: u8) -> Result<()> {
        self.ctx(TYPE_LIST, tag)
    }
    pub fn write_struct_end(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_END_CONTAINER)
    }
    pub fn write_string(&mut self, tag: u8, data: &str) -> Result<()> {
        let bytes = data.as_bytes();
        if bytes.len() > 0xff {
            self.ctx(TYPE_UTF8_L2, tag)?;
            self.data.write_u16::<LittleEndian>(len16(bytes)?)?;
        } else {
            self.ctx(TYPE_UTF8_L1, tag)?;
            self.data.write_u8(bytes.len() as u8)?;
        }
        self.data.write_all(bytes)
    }
    pub fn write_octetstring(&mut self, tag: u8, data: &[u8]) -> Result<()> {
        if data.len() > 0xff {
            self.ctx(TYPE_OCTET_STRING_L2, tag)?;
            self.data.write_u16::<LittleEndian>(len16(data)?)?;
        } else {
            self.ctx(TYPE_OCTET_STRING_L1, tag)?;
            self.data.write_u8(data.len() as u8)?;
        }
        self.data.write_all(data)
    }
    /// Octet string with anonymous tag, used for array members.
    pub fn write_octetstring_notag(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > 0xff {
            self.data.write_u8(TYPE_OCTET_STRING_L2)?;
            self.data.write_u16::<LittleEndian>(len16(data)?)?;
        } else {
            self.data.write_u8(TYPE_OCTET_STRING_L1)?;
            self.data.write_u8(data.len() as u8)?;
        }
        self.data.write_all(data)
    }
    pub fn write_uint8(&mut self, tag: u8, value: u8) -> Result<()> {
        self.ctx(TYPE_UINT_1, tag)?;
        self.data.write_u8(value)
    }
    pub fn write_uint8_notag(&mut self, value: u8) -> Result<()> {
        self.data.write_u8(TYPE_UINT_1)?;
        self.data.write_u8(value)
    }
    pub fn write_uint16(&mut self, tag: u8, value: u16) -> Result<()> {
        self.ctx(TYPE_UINT_2, tag)?;
        self.data.write_u16::<LittleEndian>(value)
    }
    pub fn write_uint32(&mut self, tag: u8, value: u32) -> Result<()> {
        self.ctx(TYPE_UINT_4, tag)?;
        self.data.write_u32::<LittleEndian>(value)
    }
    pub fn write_uint64(&mut self, tag: u8, value: u64) -> Result<()> {
        self.ctx(TYPE_UINT_8, tag)?;
        self.data.write_u64::<LittleEndian>(value)
    }
    pub fn write_bool(&mut self, tag: u8, value: bool) -> Result<()> {
        let typ = if value { TYPE_BOOL_TRUE } else { TYPE_BOOL_FALSE };
        self.ctx(typ, tag)
    }
}

impl Default for TlvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn len16(data: &[u8]) -> Result<u16> {
    u16::try_from(data.len()).map_err(|_| invalid("string longer than 65535 bytes"))
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_owned())
}

/// Decoded value of a tlv element. Containers (struct, array, list) all decode to `List`.
#[derive(Debug, Clone, PartialEq)]
pub enum TlvItemValue {
    Int(u64),
    SignedInt(i64),
    Bool(bool),
    String(String),
    OctetString(Vec<u8>),
    List(Vec<TlvItem>),
    Nil(),
}

/// Decoded tlv element returned by [decode_tlv]. Anonymous elements have tag 0.
#[derive(Debug, Clone, PartialEq)]
pub struct TlvItem {
    pub tag: u8,
    pub value: TlvItemValue,
}

impl TlvItem {
    /// Walk a path of context tags down nested containers.
    pub fn get(&self, tag: &[u8]) -> Option<&TlvItemValue> {
        self.get_item(tag).map(|i| &i.value)
    }
    pub fn get_item(&self, tag: &[u8]) -> Option<&TlvItem> {
        match tag.split_first() {
            None => Some(self),
            Some((first, rest)) => match &self.value {
                TlvItemValue::List(lst) => lst
                    .iter()
                    .find(|l| l.tag == *first)
                    .and_then(|l| l.get_item(rest)),
                _ => None,
            },
        }
    }
    /// Members of a container, empty for scalars.
    pub fn children(&self) -> &[TlvItem] {
        match &self.value {
            TlvItemValue::List(lst) => lst,
            _ => &[],
        }
    }
    pub fn get_int(&self, tag: &[u8]) -> Option<u64> {
        match self.get(tag) {
            Some(TlvItemValue::Int(i)) => Some(*i),
            _ => None,
        }
    }
    pub fn get_bool(&self, tag: &[u8]) -> Option<bool> {
        match self.get(tag) {
            Some(TlvItemValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
    pub fn get_u8(&self, tag: &[u8]) -> Option<u8> {
        self.get_int(tag).and_then(|i| u8::try_from(i).ok())
    }
    pub fn get_u16(&self, tag: &[u8]) -> Option<u16> {
        self.get_int(tag).and_then(|i| u16::try_from(i).ok())
    }
    pub fn get_u32(&self, tag: &[u8]) -> Option<u32> {
        self.get_int(tag).and_then(|i| u32::try_from(i).ok())
    }
    pub fn get_u64(&self, tag: &[u8]) -> Option<u64> {
        self.get_int(tag)
    }
    pub fn get_octet_string(&self, tag: &[u8]) -> Option<&[u8]> {
        match self.get(tag) {
            Some(TlvItemValue::OctetString(o)) => Some(o),
            _ => None,
        }
    }
    pub fn get_string(&self, tag: &[u8]) -> Option<&str> {
        match self.get(tag) {
            Some(TlvItemValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

fn read_tag(tagctrl: u8, cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    match tagctrl {
        0 => Ok(0),
        1 => cursor.read_u8(),
        _ => Err(invalid("only anonymous and context tags are supported")),
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if size as u64 > remaining {
        return Err(invalid("string length exceeds buffer"));
    }
    let mut value = vec![0; size];
    cursor.read_exact(&mut value)?;
    Ok(value)
}

/// Read one element. Returns `None` when an end-of-container marker is read.
fn read_element(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Option<TlvItem>> {
    let fb = cursor.read_u8()?;
    let tp = fb & 0x1f;
    if tp == TYPE_END_CONTAINER {
        return Ok(None);
    }
    let tag = read_tag(fb >> 5, cursor)?;
    let value = match tp {
        TYPE_INT_1 => TlvItemValue::SignedInt(cursor.read_i8()? as i64),
        TYPE_INT_2 => TlvItemValue::SignedInt(cursor.read_i16::<LittleEndian>()? as i64),
        TYPE_INT_4 => TlvItemValue::SignedInt(cursor.read_i32::<LittleEndian>()? as i64),
        TYPE_INT_8 => TlvItemValue::SignedInt(cursor.read_i64::<LittleEndian>()?),
        TYPE_UINT_1 => TlvItemValue::Int(cursor.read_u8()? as u64),
        TYPE_UINT_2 => TlvItemValue::Int(cursor.read_u16::<LittleEndian>()? as u64),
        TYPE_UINT_4 => TlvItemValue::Int(cursor.read_u32::<LittleEndian>()? as u64),
        TYPE_UINT_8 => TlvItemValue::Int(cursor.read_u64::<LittleEndian>()?),
        TYPE_BOOL_FALSE => TlvItemValue::Bool(false),
        TYPE_BOOL_TRUE => TlvItemValue::Bool(true),
        TYPE_NULL => TlvItemValue::Nil(),
        TYPE_UTF8_L1 | TYPE_UTF8_L2 => {
            let size = if tp == TYPE_UTF8_L1 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            let raw = read_bytes(cursor, size)?;
            TlvItemValue::String(String::from_utf8(raw).map_err(|_| invalid("invalid utf8"))?)
        }
        TYPE_OCTET_STRING_L1 => {
            let size = cursor.read_u8()? as usize;
            TlvItemValue::OctetString(read_bytes(cursor, size)?)
        }
        TYPE_OCTET_STRING_L2 => {
            let size = cursor.read_u16::<LittleEndian>()? as usize;
            TlvItemValue::OctetString(read_bytes(cursor, size)?)
        }
        TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => {
            if depth >= MAX_DEPTH {
                return Err(invalid("tlv nesting too deep"));
            }
            let mut members = Vec::new();
            loop {
                match read_element(cursor, depth + 1)? {
                    Some(item) => members.push(item),
                    None => break,
                }
            }
            TlvItemValue::List(members)
        }
        _ => return Err(invalid(&format!("unknown tlv type 0x{:x}", tp))),
    };
    Ok(Some(TlvItem { tag, value }))
}

/// Decode a buffer holding exactly one top level element.
pub fn decode_tlv(data: &[u8]) -> Result<TlvItem> {
    let mut cursor = Cursor::new(data);
    let item = read_element(&mut cursor, 0)?.ok_or_else(|| invalid("unexpected end of container"))?;
    if cursor.position() != data.len() as u64 {
        return Err(invalid("trailing bytes after tlv element"));
    }
    Ok(item)
}

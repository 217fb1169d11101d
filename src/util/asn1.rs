//! Minimal DER writer used to build certificates and key files.

use std::io::Result;

use byteorder::WriteBytesExt;

pub fn write_tag(buf: &mut Vec<u8>, tag: u8) -> Result<()> {
    buf.write_u8(tag)
}

pub fn write_len(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    if len < 0x80 {
        buf.write_u8(len as u8)
    } else if len <= 0xff {
        buf.write_u8(0x81)?;
        buf.write_u8(len as u8)
    } else if len <= 0xffff {
        buf.write_u8(0x82)?;
        buf.write_u8((len >> 8) as u8)?;
        buf.write_u8(len as u8)
    } else {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

fn write_octet_string_with_tag(buf: &mut Vec<u8>, tag: u8, val: &[u8]) -> Result<()> {
    write_tag(buf, tag)?;
    write_len(buf, val.len())?;
    buf.extend_from_slice(val);
    Ok(())
}

fn write_bool(buf: &mut Vec<u8>, val: bool) -> Result<()> {
    write_tag(buf, 0x1)?;
    write_len(buf, 1)?;
    buf.write_u8(if val { 0xff } else { 0 })
}

pub fn write_int(buf: &mut Vec<u8>, val: u32) -> Result<()> {
    write_tag(buf, 0x2)?;
    if val < 0x80 {
        write_len(buf, 1)?;
        buf.write_u8(val as u8)
    } else if val < 0x8000 {
        write_len(buf, 2)?;
        buf.write_u8((val >> 8) as u8)?;
        buf.write_u8(val as u8)
    } else if val < 0x800000 {
        write_len(buf, 3)?;
        buf.write_u8((val >> 16) as u8)?;
        buf.write_u8((val >> 8) as u8)?;
        buf.write_u8(val as u8)
    } else {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

#[derive(Debug, Clone)]
struct Asn1EncoderStackEntry {
    pos: usize,
}

/// Sequence lengths are patched when the sequence is closed, so nested
/// structures can be written front to back.
#[derive(Debug, Clone)]
pub struct Encoder {
    buffer: Vec<u8>,
    stack: Vec<Asn1EncoderStackEntry>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            stack: Vec::new(),
        }
    }
    pub fn start_seq(&mut self, tag: u8) -> Result<()> {
        write_tag(&mut self.buffer, tag)?;
        self.stack.push(Asn1EncoderStackEntry {
            pos: self.buffer.len() - 1,
        });
        self.buffer.write_u8(0)
    }
    pub fn fix(&mut self) {
        while !self.stack.is_empty() {
            self.end_seq()
        }
    }
    pub fn end_seq(&mut self) {
        if let Some(a) = self.stack.pop() {
            let s = self.buffer.len() - a.pos - 2;
            if s < 0x80 {
                self.buffer[a.pos + 1] = s as u8;
            } else if s <= 0xff {
                self.buffer[a.pos + 1] = 0x81;
                self.buffer.insert(a.pos + 2, s as u8);
            } else {
                self.buffer[a.pos + 1] = 0x82;
                self.buffer.insert(a.pos + 2, (s >> 8) as u8);
                self.buffer.insert(a.pos + 3, s as u8);
            }
        }
    }
    pub fn write_octet_string(&mut self, val: &[u8]) -> Result<()> {
        write_octet_string_with_tag(&mut self.buffer, 0x4, val)
    }
    /// UTF8String
    pub fn write_string(&mut self, val: &str) -> Result<()> {
        write_octet_string_with_tag(&mut self.buffer, 0xc, val.as_bytes())
    }
    pub fn write_string_with_tag(&mut self, tag: u8, val: &str) -> Result<()> {
        write_octet_string_with_tag(&mut self.buffer, tag, val.as_bytes())
    }
    pub fn write_octet_string_with_tag(&mut self, tag: u8, val: &[u8]) -> Result<()> {
        write_octet_string_with_tag(&mut self.buffer, tag, val)
    }
    pub fn write_int(&mut self, val: u32) -> Result<()> {
        write_int(&mut self.buffer, val)
    }
    pub fn write_bool(&mut self, val: bool) -> Result<()> {
        write_bool(&mut self.buffer, val)
    }
    pub fn write_oid(&mut self, val: &str) -> Result<()> {
        match const_oid::ObjectIdentifier::new(val) {
            Ok(o) => self.write_octet_string_with_tag(0x6, o.as_bytes()),
            Err(e) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("can't parse oid {:?}", e),
            )),
        }
    }
    /// Append already encoded DER.
    pub fn write_raw(&mut self, der: &[u8]) {
        self.buffer.extend_from_slice(der);
    }

    pub fn encode(mut self) -> Vec<u8> {
        self.fix();
        self.buffer
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

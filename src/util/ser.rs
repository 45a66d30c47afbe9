// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Big-endian field encoding used for the canonical signed portion of gossip
//! messages and for onion payload TLV streams. Full wire codecs live with the
//! transport layer; only what signature checks and onion construction need is
//! here.

use crate::ln::msgs::DecodeError;

pub(crate) fn write_u16(buf: &mut Vec<u8>, v: u16) {
	buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, v: u32) {
	buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_u64(buf: &mut Vec<u8>, v: u64) {
	buf.extend_from_slice(&v.to_be_bytes());
}

/// BOLT 1 BigSize, the CompactSize variant with big-endian multi-byte values.
pub(crate) fn write_bigsize(buf: &mut Vec<u8>, v: u64) {
	match v {
		0..=0xFC => buf.push(v as u8),
		0xFD..=0xFFFF => {
			buf.push(0xFD);
			write_u16(buf, v as u16);
		},
		0x10000..=0xFFFF_FFFF => {
			buf.push(0xFE);
			write_u32(buf, v as u32);
		},
		_ => {
			buf.push(0xFF);
			write_u64(buf, v);
		},
	}
}

/// Truncated big-endian u64: leading zero bytes are not encoded.
pub(crate) fn write_tu64(buf: &mut Vec<u8>, v: u64) {
	let bytes = v.to_be_bytes();
	let skip = bytes.iter().take_while(|b| **b == 0).count();
	buf.extend_from_slice(&bytes[skip..]);
}

pub(crate) fn write_tu32(buf: &mut Vec<u8>, v: u32) {
	let bytes = v.to_be_bytes();
	let skip = bytes.iter().take_while(|b| **b == 0).count();
	buf.extend_from_slice(&bytes[skip..]);
}

/// One TLV record: BigSize type, BigSize length, raw value.
pub(crate) fn write_tlv(buf: &mut Vec<u8>, typ: u64, value: &[u8]) {
	write_bigsize(buf, typ);
	write_bigsize(buf, value.len() as u64);
	buf.extend_from_slice(value);
}

/// A forward-only reader over a byte slice.
pub(crate) struct Cursor<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	pub(crate) fn new(data: &'a [u8]) -> Self {
		Cursor { data, pos: 0 }
	}

	pub(crate) fn remaining(&self) -> usize {
		self.data.len() - self.pos
	}

	pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
		if self.remaining() < len {
			return Err(DecodeError::ShortRead);
		}
		let out = &self.data[self.pos..self.pos + len];
		self.pos += len;
		Ok(out)
	}

	pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
		Ok(self.read_bytes(1)?[0])
	}

	pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
		let b = self.read_bytes(2)?;
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}

	pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
		let b = self.read_bytes(4)?;
		Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	pub(crate) fn read_u64(&mut self) -> Result<u64, DecodeError> {
		let b = self.read_bytes(8)?;
		Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bigsize_boundaries() {
		let mut buf = Vec::new();
		write_bigsize(&mut buf, 0xFC);
		assert_eq!(buf, vec![0xFC]);
		buf.clear();
		write_bigsize(&mut buf, 0xFD);
		assert_eq!(buf, vec![0xFD, 0x00, 0xFD]);
		buf.clear();
		write_bigsize(&mut buf, 0x10000);
		assert_eq!(buf, vec![0xFE, 0x00, 0x01, 0x00, 0x00]);
		buf.clear();
		write_bigsize(&mut buf, u64::MAX);
		assert_eq!(buf[0], 0xFF);
		assert_eq!(buf.len(), 9);
	}

	#[test]
	fn truncated_ints_drop_leading_zeroes() {
		let mut buf = Vec::new();
		write_tu64(&mut buf, 0x0102);
		assert_eq!(buf, vec![0x01, 0x02]);
		buf.clear();
		write_tu64(&mut buf, 0);
		assert!(buf.is_empty());
		buf.clear();
		write_tu32(&mut buf, 0x01_0000);
		assert_eq!(buf, vec![0x01, 0x00, 0x00]);
	}

	#[test]
	fn cursor_short_read() {
		let mut cursor = Cursor::new(&[0x01, 0x02]);
		assert_eq!(cursor.read_u16().unwrap(), 0x0102);
		assert!(cursor.read_u8().is_err());
	}
}

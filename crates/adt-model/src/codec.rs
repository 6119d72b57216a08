// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Flattened little-endian codec for the device-tree model.
// Author: Lukas Bower

//! Flattened device-tree codec.
//!
//! Layout, all little-endian, one node at a time depth-first:
//! `name_len u16 | name | prop_count u16 | child_count u16 |
//! (prop_name_len u16 | prop_name | value_len u32 | value)* | children*`.

use crate::{Adt, AdtError, Node};

/// Encode a tree to its flattened form.
#[must_use]
pub fn encode(adt: &Adt) -> Vec<u8> {
    let mut out = Vec::new();
    encode_node(adt.root(), &mut out);
    out
}

fn encode_node(node: &Node, out: &mut Vec<u8>) {
    put_name(out, node.name());
    out.extend_from_slice(&(node.property_count() as u16).to_le_bytes());
    out.extend_from_slice(&(node.children().len() as u16).to_le_bytes());
    for (name, value) in node.properties() {
        put_name(out, name);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }
    for child in node.children() {
        encode_node(child, out);
    }
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

/// Decode a flattened blob into a tree.
pub fn decode(bytes: &[u8]) -> Result<Adt, AdtError> {
    let mut cursor = Cursor { bytes, offset: 0 };
    let root = decode_node(&mut cursor)?;
    let mut adt = Adt::new();
    *adt.root_mut() = root;
    Ok(adt)
}

fn decode_node(cursor: &mut Cursor<'_>) -> Result<Node, AdtError> {
    let name = cursor.take_name()?;
    let prop_count = cursor.take_u16()?;
    let child_count = cursor.take_u16()?;
    let mut node = Node::new(&name);
    for _ in 0..prop_count {
        let prop_name = cursor.take_name()?;
        let value_len = cursor.take_u32()? as usize;
        let value = cursor.take(value_len)?;
        node.set_property(&prop_name, value);
    }
    for _ in 0..child_count {
        let child = decode_node(cursor)?;
        node.push_child(child);
    }
    Ok(node)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], AdtError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(AdtError::Truncated(self.offset))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16, AdtError> {
        let slice = self.take(2)?;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, AdtError> {
        let slice = self.take(4)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn take_name(&mut self) -> Result<String, AdtError> {
        let len = self.take_u16()? as usize;
        let slice = self.take(len)?;
        core::str::from_utf8(slice)
            .map(str::to_owned)
            .map_err(|_| AdtError::BadName)
    }
}

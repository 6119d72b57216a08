// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-memory Apple Device Tree model with a patch-then-push transaction.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! In-memory model of the target's device tree (ADT).
//!
//! The boot flow patches a handful of entries — firmware location,
//! boot-argument location, per-core reset-vector registers — and then pushes
//! the whole tree back to the target as one logical unit. [`AdtTransaction`]
//! makes that unit explicit: edits land on a clone, and the device and the
//! local tree only change when `commit` runs, exactly once.

use std::ops::{Deref, DerefMut};

use relay_proxy::{Proxy, ProxyError, ProxyPort};

pub mod codec;

/// Errors surfaced by device-tree lookups and decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdtError {
    /// No node at the requested path.
    #[error("no device-tree node at '{0}'")]
    MissingNode(String),
    /// The node exists but lacks the named property.
    #[error("node '{node}' has no property '{name}'")]
    MissingProperty {
        /// Node path.
        node: String,
        /// Property name.
        name: String,
    },
    /// The property is not a 16-byte (address, length) tuple.
    #[error("property '{name}' is {len} bytes, expected a 16-byte tuple")]
    BadTuple {
        /// Property name.
        name: String,
        /// Actual length in bytes.
        len: usize,
    },
    /// The flattened blob could not be decoded.
    #[error("device-tree blob truncated at offset {0}")]
    Truncated(usize),
    /// A name in the flattened blob was not UTF-8.
    #[error("device-tree blob contains a non-UTF-8 name")]
    BadName,
}

/// A named property with an opaque byte value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    name: String,
    value: Vec<u8>,
}

impl Property {
    /// Property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw property bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// A device-tree node: named properties plus ordered children.
///
/// Child order is creation order, which for `cpus` is boot order — "all
/// cores except the first" is well defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    properties: Vec<Property>,
    children: Vec<Node>,
}

impl Node {
    /// Create an empty node.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered child nodes.
    #[must_use]
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Find a direct child by name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Append a child node and return a handle to it.
    pub fn add_child(&mut self, name: &str) -> &mut Node {
        let index = self.children.len();
        self.children.push(Node::new(name));
        &mut self.children[index]
    }

    /// Append an existing node as a child.
    pub fn push_child(&mut self, child: Node) {
        self.children.push(child);
    }

    /// Number of properties on this node.
    #[must_use]
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Iterate properties as (name, value) pairs.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.properties
            .iter()
            .map(|prop| (prop.name.as_str(), prop.value.as_slice()))
    }

    /// Raw bytes of a property, if present.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|prop| prop.name == name)
            .map(|prop| prop.value.as_slice())
    }

    /// Set or replace a property.
    pub fn set_property(&mut self, name: &str, value: &[u8]) {
        match self.properties.iter_mut().find(|prop| prop.name == name) {
            Some(prop) => prop.value = value.to_vec(),
            None => self.properties.push(Property {
                name: name.to_owned(),
                value: value.to_vec(),
            }),
        }
    }

    /// Read a property as a little-endian (address, length) tuple.
    pub fn reg_tuple(&self, name: &str) -> Result<(u64, u64), AdtError> {
        let value = self.property(name).ok_or_else(|| AdtError::MissingProperty {
            node: self.name.clone(),
            name: name.to_owned(),
        })?;
        if value.len() != 16 {
            return Err(AdtError::BadTuple {
                name: name.to_owned(),
                len: value.len(),
            });
        }
        Ok((le_u64(&value[..8]), le_u64(&value[8..])))
    }

    /// Write a property as a little-endian (address, length) tuple.
    pub fn set_reg_tuple(&mut self, name: &str, tuple: (u64, u64)) {
        let mut value = [0u8; 16];
        value[..8].copy_from_slice(&tuple.0.to_le_bytes());
        value[8..].copy_from_slice(&tuple.1.to_le_bytes());
        self.set_property(name, &value);
    }

    fn walk(&self, components: &[&str]) -> Option<&Node> {
        match components.split_first() {
            None => Some(self),
            Some((head, rest)) => self.child(head)?.walk(rest),
        }
    }

    fn walk_mut(&mut self, components: &[&str]) -> Option<&mut Node> {
        match components.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter_mut()
                .find(|child| child.name == *head)?
                .walk_mut(rest),
        }
    }
}

/// The device tree, addressed by slash-separated paths relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adt {
    root: Node,
}

impl Adt {
    /// Create a tree with an empty root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Node::new("device-tree"),
        }
    }

    /// Borrow the root node.
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Mutably borrow the root node.
    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    /// Look up a node by path, e.g. `chosen/memory-map`.
    #[must_use]
    pub fn node(&self, path: &str) -> Option<&Node> {
        self.root.walk(&components(path))
    }

    /// Mutable lookup by path.
    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.root.walk_mut(&components(path))
    }

    /// Look up a node by path, failing with [`AdtError::MissingNode`].
    pub fn require(&self, path: &str) -> Result<&Node, AdtError> {
        self.node(path)
            .ok_or_else(|| AdtError::MissingNode(path.to_owned()))
    }

    /// Mutable lookup by path, failing with [`AdtError::MissingNode`].
    pub fn require_mut(&mut self, path: &str) -> Result<&mut Node, AdtError> {
        self.node_mut(path)
            .ok_or_else(|| AdtError::MissingNode(path.to_owned()))
    }

    /// Decode a flattened blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, AdtError> {
        codec::decode(bytes)
    }

    /// Encode to the flattened form the target consumes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Start a patch-then-push transaction.
    ///
    /// Edits apply to a staged clone. The device and this tree change only
    /// when [`AdtTransaction::commit`] succeeds; dropping the transaction
    /// discards every edit.
    pub fn edit(&mut self) -> AdtTransaction<'_> {
        AdtTransaction {
            staged: self.clone(),
            original: self,
        }
    }
}

impl Default for Adt {
    fn default() -> Self {
        Self::new()
    }
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Scoped device-tree transaction; see [`Adt::edit`].
pub struct AdtTransaction<'a> {
    original: &'a mut Adt,
    staged: Adt,
}

impl AdtTransaction<'_> {
    /// Upload the staged tree and commit it locally. Runs the push exactly
    /// once; on any error the device and the original tree are untouched.
    pub fn commit<P: ProxyPort>(
        self,
        proxy: &mut Proxy<P>,
    ) -> Result<(), ProxyError<P::Error>> {
        let blob = self.staged.encode();
        let addr = proxy.malloc(blob.len() as u64)?;
        proxy.write_mem(addr, &blob)?;
        proxy.put_adt_blob(addr, blob.len() as u64)?;
        log::debug!("pushed device tree ({} bytes) to {addr:#x}", blob.len());
        *self.original = self.staged;
        Ok(())
    }
}

impl Deref for AdtTransaction<'_> {
    type Target = Adt;

    fn deref(&self) -> &Adt {
        &self.staged
    }
}

impl DerefMut for AdtTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Adt {
        &mut self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proxy::{CommandStatus, MockPort};

    fn sample() -> Adt {
        let mut adt = Adt::new();
        let chosen = adt.root_mut().add_child("chosen");
        let map = chosen.add_child("memory-map");
        map.set_reg_tuple("SEPFW", (0x9_0000_0000, 0x40_0000));
        let cpus = adt.root_mut().add_child("cpus");
        for i in 0..4u64 {
            let cpu = cpus.add_child(&format!("cpu{i}"));
            cpu.set_reg_tuple("cpu-impl-reg", (0x2_1005_0000 + i * 0x8, 8));
        }
        adt
    }

    #[test]
    fn path_lookup_and_tuples() {
        let adt = sample();
        let map = adt.require("chosen/memory-map").unwrap();
        assert_eq!(map.reg_tuple("SEPFW").unwrap(), (0x9_0000_0000, 0x40_0000));
        assert_eq!(adt.require("cpus").unwrap().children().len(), 4);
        assert!(matches!(
            adt.require("chosen/missing"),
            Err(AdtError::MissingNode(_))
        ));
    }

    #[test]
    fn reg_tuple_rejects_short_values() {
        let mut adt = sample();
        adt.require_mut("chosen/memory-map")
            .unwrap()
            .set_property("SEPFW", &[0u8; 8]);
        assert!(matches!(
            adt.require("chosen/memory-map").unwrap().reg_tuple("SEPFW"),
            Err(AdtError::BadTuple { len: 8, .. })
        ));
    }

    #[test]
    fn dropped_transaction_discards_edits() {
        let mut adt = sample();
        {
            let mut txn = adt.edit();
            txn.require_mut("chosen/memory-map")
                .unwrap()
                .set_reg_tuple("SEPFW", (0, 0));
        }
        let map = adt.require("chosen/memory-map").unwrap();
        assert_eq!(map.reg_tuple("SEPFW").unwrap(), (0x9_0000_0000, 0x40_0000));
    }

    #[test]
    fn commit_pushes_once_and_swaps() {
        let mut adt = sample();
        let mut proxy = Proxy::new(MockPort::new());
        let mut txn = adt.edit();
        txn.require_mut("chosen/memory-map")
            .unwrap()
            .set_reg_tuple("SEPFW", (0x8_0400_0000, 0x1234));
        txn.commit(&mut proxy).unwrap();

        let pushed = proxy.port().committed_adt().expect("blob pushed");
        let round = Adt::decode(&pushed).unwrap();
        assert_eq!(
            round
                .require("chosen/memory-map")
                .unwrap()
                .reg_tuple("SEPFW")
                .unwrap(),
            (0x8_0400_0000, 0x1234)
        );
        assert_eq!(
            adt.require("chosen/memory-map")
                .unwrap()
                .reg_tuple("SEPFW")
                .unwrap(),
            (0x8_0400_0000, 0x1234)
        );
    }

    #[test]
    fn failed_push_leaves_tree_untouched() {
        let mut adt = sample();
        let mut port = MockPort::new();
        port.fail_op("put-adt-blob", CommandStatus::Error);
        let mut proxy = Proxy::new(port);
        let mut txn = adt.edit();
        txn.require_mut("chosen/memory-map")
            .unwrap()
            .set_reg_tuple("SEPFW", (0, 0));
        assert!(txn.commit(&mut proxy).is_err());
        assert_eq!(
            adt.require("chosen/memory-map")
                .unwrap()
                .reg_tuple("SEPFW")
                .unwrap(),
            (0x9_0000_0000, 0x40_0000)
        );
        assert!(proxy.port().committed_adt().is_none());
    }
}

//! B-Tree storage for tables and indexes
//!
//! A B+-tree over pager pages: leaves hold `(key, payload)` cells sorted by
//! key, interior nodes hold separator keys plus child pointers. Nodes are
//! reconstituted on demand from the pager cache and written back after
//! mutation; pages are addressed by number, never by reference, and descent
//! paths live on the cursor's stack.
//!
//! Cells are variable-length, so balancing is byte-budgeted: a node splits
//! when its encoded size exceeds the page and rebalances (borrow or merge)
//! when it falls below a quarter of it. Root page numbers never change: a
//! root split moves both halves into fresh pages and rewrites the root in
//! place as an interior node.
//!
//! Payloads above the inline threshold spill into a chain of overflow pages.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::storage::page::{PageId, PageType, PAGE_SIZE};
use crate::storage::pager::Pager;

/// Keys longer than this are rejected; keeps the branching factor sane.
pub const MAX_KEY_LEN: usize = 512;

/// Payloads above this spill into overflow pages.
pub const MAX_INLINE_PAYLOAD: usize = 400;

/// Nodes below a quarter page rebalance with a sibling.
const MIN_NODE_BYTES: usize = PAGE_SIZE / 4;

/// Node header: type tag + cell count.
const NODE_HEADER: usize = 3;

/// Overflow page header: type tag + next pointer + chunk length.
const OVERFLOW_HEADER: usize = 7;
const OVERFLOW_CHUNK: usize = PAGE_SIZE - OVERFLOW_HEADER;

const PAYLOAD_INLINE: u8 = 0;
const PAYLOAD_OVERFLOW: u8 = 1;

/// A leaf cell's payload: inline bytes or an overflow chain reference.
#[derive(Debug, Clone, PartialEq)]
enum Payload {
    Inline(Vec<u8>),
    Overflow { total_len: u32, head: PageId },
}

#[derive(Debug, Clone)]
struct LeafCell {
    key: Vec<u8>,
    payload: Payload,
}

impl LeafCell {
    fn encoded_size(&self) -> usize {
        let payload = match &self.payload {
            Payload::Inline(data) => 4 + data.len(),
            Payload::Overflow { .. } => 8,
        };
        2 + self.key.len() + 1 + payload
    }
}

/// Decoded B-Tree node
#[derive(Debug, Clone)]
enum Node {
    Leaf {
        cells: Vec<LeafCell>,
    },
    Interior {
        keys: Vec<Vec<u8>>,
        /// Always `keys.len() + 1` entries; the last is the rightmost child
        children: Vec<PageId>,
    },
}

impl Node {
    fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf { cells } => {
                NODE_HEADER + cells.iter().map(LeafCell::encoded_size).sum::<usize>()
            }
            Node::Interior { keys, .. } => {
                NODE_HEADER + keys.iter().map(|k| 2 + k.len() + 4).sum::<usize>() + 4
            }
        }
    }
}

fn encode_node(node: &Node, index: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(PAGE_SIZE);
    match node {
        Node::Leaf { cells } => {
            buf.push(PageType::leaf_for(index) as u8);
            buf.extend_from_slice(&(cells.len() as u16).to_le_bytes());
            for cell in cells {
                buf.extend_from_slice(&(cell.key.len() as u16).to_le_bytes());
                buf.extend_from_slice(&cell.key);
                match &cell.payload {
                    Payload::Inline(data) => {
                        buf.push(PAYLOAD_INLINE);
                        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                        buf.extend_from_slice(data);
                    }
                    Payload::Overflow { total_len, head } => {
                        buf.push(PAYLOAD_OVERFLOW);
                        buf.extend_from_slice(&total_len.to_le_bytes());
                        buf.extend_from_slice(&head.to_le_bytes());
                    }
                }
            }
        }
        Node::Interior { keys, children } => {
            if children.len() != keys.len() + 1 {
                return Err(Error::Internal(
                    "interior node child count mismatch".to_string(),
                ));
            }
            buf.push(PageType::interior_for(index) as u8);
            buf.extend_from_slice(&(keys.len() as u16).to_le_bytes());
            for (key, child) in keys.iter().zip(children.iter()) {
                buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(&child.to_le_bytes());
            }
            buf.extend_from_slice(&children[children.len() - 1].to_le_bytes());
        }
    }
    if buf.len() > PAGE_SIZE {
        return Err(Error::Internal(format!(
            "node overflows page: {} bytes",
            buf.len()
        )));
    }
    buf.resize(PAGE_SIZE, 0);
    Ok(buf)
}

fn decode_node(image: &[u8]) -> Result<Node> {
    let page_type = PageType::from_byte(image[0])?;
    let count = LittleEndian::read_u16(&image[1..3]) as usize;
    let mut offset = NODE_HEADER;

    let read_key = |offset: &mut usize| -> Result<Vec<u8>> {
        if *offset + 2 > image.len() {
            return Err(Error::Corrupt("node cell truncated".to_string()));
        }
        let len = LittleEndian::read_u16(&image[*offset..]) as usize;
        *offset += 2;
        if *offset + len > image.len() {
            return Err(Error::Corrupt("node key truncated".to_string()));
        }
        let key = image[*offset..*offset + len].to_vec();
        *offset += len;
        Ok(key)
    };

    if page_type.is_leaf() {
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            let key = read_key(&mut offset)?;
            let flag = image[offset];
            offset += 1;
            let payload = match flag {
                PAYLOAD_INLINE => {
                    let len = LittleEndian::read_u32(&image[offset..]) as usize;
                    offset += 4;
                    if offset + len > image.len() {
                        return Err(Error::Corrupt("node payload truncated".to_string()));
                    }
                    let data = image[offset..offset + len].to_vec();
                    offset += len;
                    Payload::Inline(data)
                }
                PAYLOAD_OVERFLOW => {
                    let total_len = LittleEndian::read_u32(&image[offset..]);
                    let head = LittleEndian::read_u32(&image[offset + 4..]);
                    offset += 8;
                    Payload::Overflow { total_len, head }
                }
                other => {
                    return Err(Error::Corrupt(format!("unknown payload flag {}", other)));
                }
            };
            cells.push(LeafCell { key, payload });
        }
        Ok(Node::Leaf { cells })
    } else if page_type.is_interior() {
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        for _ in 0..count {
            keys.push(read_key(&mut offset)?);
            children.push(LittleEndian::read_u32(&image[offset..]));
            offset += 4;
        }
        children.push(LittleEndian::read_u32(&image[offset..]));
        Ok(Node::Interior { keys, children })
    } else {
        Err(Error::Corrupt(format!(
            "expected tree node, found page type {:?}",
            page_type
        )))
    }
}

/// Image of an empty leaf; used when creating a tree root.
pub fn empty_leaf_image(index: bool) -> Vec<u8> {
    encode_node(&Node::Leaf { cells: Vec::new() }, index)
        .expect("empty leaf always fits a page")
}

fn read_node(pager: &mut Pager, page: PageId) -> Result<Node> {
    decode_node(&pager.get(page)?)
}

fn write_node(pager: &mut Pager, page: PageId, node: &Node, index: bool) -> Result<()> {
    pager.write(page, encode_node(node, index)?)
}

// ---------- payload helpers ----------

fn make_payload(pager: &mut Pager, data: &[u8]) -> Result<Payload> {
    if data.len() <= MAX_INLINE_PAYLOAD {
        return Ok(Payload::Inline(data.to_vec()));
    }
    // Build the chain back to front so each page knows its successor.
    let mut next: PageId = 0;
    let chunks: Vec<&[u8]> = data.chunks(OVERFLOW_CHUNK).collect();
    for chunk in chunks.iter().rev() {
        let page = pager.allocate()?;
        let mut image = vec![0u8; PAGE_SIZE];
        image[0] = PageType::Overflow as u8;
        LittleEndian::write_u32(&mut image[1..5], next);
        LittleEndian::write_u16(&mut image[5..7], chunk.len() as u16);
        image[OVERFLOW_HEADER..OVERFLOW_HEADER + chunk.len()].copy_from_slice(chunk);
        pager.write(page, image)?;
        next = page;
    }
    Ok(Payload::Overflow {
        total_len: data.len() as u32,
        head: next,
    })
}

fn read_payload(pager: &mut Pager, payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Inline(data) => Ok(data.clone()),
        Payload::Overflow { total_len, head } => {
            let mut data = Vec::with_capacity(*total_len as usize);
            let mut page = *head;
            while page != 0 {
                let image = pager.get(page)?;
                if image[0] != PageType::Overflow as u8 {
                    return Err(Error::Corrupt(format!(
                        "overflow chain reaches non-overflow page {}",
                        page
                    )));
                }
                let next = LittleEndian::read_u32(&image[1..5]);
                let len = LittleEndian::read_u16(&image[5..7]) as usize;
                if OVERFLOW_HEADER + len > PAGE_SIZE {
                    return Err(Error::Corrupt("overflow chunk length out of range".to_string()));
                }
                data.extend_from_slice(&image[OVERFLOW_HEADER..OVERFLOW_HEADER + len]);
                page = next;
            }
            if data.len() != *total_len as usize {
                return Err(Error::Corrupt(format!(
                    "overflow chain length {} does not match recorded {}",
                    data.len(),
                    total_len
                )));
            }
            Ok(data)
        }
    }
}

fn free_payload(pager: &mut Pager, payload: &Payload) -> Result<()> {
    if let Payload::Overflow { head, .. } = payload {
        let mut page = *head;
        while page != 0 {
            let image = pager.get(page)?;
            let next = LittleEndian::read_u32(&image[1..5]);
            pager.free(page)?;
            page = next;
        }
    }
    Ok(())
}

// ---------- tree ----------

/// A B-Tree rooted at a fixed page
#[derive(Debug, Clone, Copy)]
pub struct BTree {
    root: PageId,
    index: bool,
}

impl BTree {
    /// Handle to a table tree (rows keyed by primary key).
    pub fn table(root: PageId) -> BTree {
        BTree { root, index: false }
    }

    /// Handle to a secondary-index tree ((value, pk) keys, empty payloads).
    pub fn index(root: PageId) -> BTree {
        BTree { root, index: true }
    }

    /// Allocate and initialize an empty tree, returning its root page.
    pub fn create(pager: &mut Pager, index: bool) -> Result<PageId> {
        let root = pager.allocate()?;
        pager.write(root, empty_leaf_image(index))?;
        Ok(root)
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Look up a key, returning its payload.
    pub fn search(&self, pager: &mut Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut page = self.root;
        loop {
            match read_node(pager, page)? {
                Node::Leaf { cells } => {
                    return match cells.binary_search_by(|c| c.key.as_slice().cmp(key)) {
                        Ok(pos) => Ok(Some(read_payload(pager, &cells[pos].payload)?)),
                        Err(_) => Ok(None),
                    };
                }
                Node::Interior { keys, children } => {
                    page = children[descend_index(&keys, key)];
                }
            }
        }
    }

    /// Insert a key; a duplicate is a constraint violation.
    pub fn insert(&self, pager: &mut Pager, key: &[u8], payload: &[u8]) -> Result<()> {
        self.put(pager, key, payload, false)
    }

    /// Insert a key, replacing the payload if the key already exists.
    pub fn replace(&self, pager: &mut Pager, key: &[u8], payload: &[u8]) -> Result<()> {
        self.put(pager, key, payload, true)
    }

    fn put(&self, pager: &mut Pager, key: &[u8], payload: &[u8], replace: bool) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::Constraint(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        if let Some((sep, right)) = self.put_rec(pager, self.root, key, payload, replace)? {
            // Root split: move the left half to a fresh page so the root's
            // page number stays fixed.
            let old_root = read_node(pager, self.root)?;
            let left = pager.allocate()?;
            write_node(pager, left, &old_root, self.index)?;
            let new_root = Node::Interior {
                keys: vec![sep],
                children: vec![left, right],
            };
            write_node(pager, self.root, &new_root, self.index)?;
        }
        Ok(())
    }

    fn put_rec(
        &self,
        pager: &mut Pager,
        page: PageId,
        key: &[u8],
        payload: &[u8],
        replace: bool,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let mut node = read_node(pager, page)?;
        let changed = match &mut node {
            Node::Leaf { cells } => {
                match cells.binary_search_by(|c| c.key.as_slice().cmp(key)) {
                    Ok(pos) => {
                        if !replace {
                            return Err(Error::Constraint("duplicate key".to_string()));
                        }
                        let old = cells[pos].payload.clone();
                        free_payload(pager, &old)?;
                        cells[pos].payload = make_payload(pager, payload)?;
                    }
                    Err(pos) => {
                        let cell = LeafCell {
                            key: key.to_vec(),
                            payload: make_payload(pager, payload)?,
                        };
                        cells.insert(pos, cell);
                    }
                }
                true
            }
            Node::Interior { keys, children } => {
                let idx = descend_index(keys, key);
                let child = children[idx];
                match self.put_rec(pager, child, key, payload, replace)? {
                    Some((sep, new_child)) => {
                        keys.insert(idx, sep);
                        children.insert(idx + 1, new_child);
                        true
                    }
                    None => false,
                }
            }
        };

        if !changed {
            return Ok(None);
        }
        if node.encoded_size() > PAGE_SIZE {
            return match node {
                Node::Leaf { .. } => self.split_leaf(pager, page, node),
                Node::Interior { .. } => self.split_interior(pager, page, node),
            };
        }
        write_node(pager, page, &node, self.index)?;
        Ok(None)
    }

    fn split_leaf(
        &self,
        pager: &mut Pager,
        page: PageId,
        node: Node,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let cells = match node {
            Node::Leaf { cells } => cells,
            _ => unreachable!(),
        };
        let mid = byte_midpoint(cells.iter().map(LeafCell::encoded_size), cells.len());
        let right_cells: Vec<LeafCell> = cells[mid..].to_vec();
        let left_cells: Vec<LeafCell> = cells[..mid].to_vec();
        let sep = right_cells[0].key.clone();

        let right_page = pager.allocate()?;
        write_node(pager, right_page, &Node::Leaf { cells: right_cells }, self.index)?;
        write_node(pager, page, &Node::Leaf { cells: left_cells }, self.index)?;
        Ok(Some((sep, right_page)))
    }

    fn split_interior(
        &self,
        pager: &mut Pager,
        page: PageId,
        node: Node,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let (keys, children) = match node {
            Node::Interior { keys, children } => (keys, children),
            _ => unreachable!(),
        };
        let mid = byte_midpoint(keys.iter().map(|k| 2 + k.len() + 4), keys.len());
        let sep = keys[mid].clone();

        let right = Node::Interior {
            keys: keys[mid + 1..].to_vec(),
            children: children[mid + 1..].to_vec(),
        };
        let left = Node::Interior {
            keys: keys[..mid].to_vec(),
            children: children[..=mid].to_vec(),
        };

        let right_page = pager.allocate()?;
        write_node(pager, right_page, &right, self.index)?;
        write_node(pager, page, &left, self.index)?;
        Ok(Some((sep, right_page)))
    }

    /// Delete a key. Returns whether it was present.
    pub fn delete(&self, pager: &mut Pager, key: &[u8]) -> Result<bool> {
        let deleted = self.delete_rec(pager, self.root, key)?;
        if deleted {
            // A root interior with a single child collapses into it,
            // reducing the tree height by one.
            if let Node::Interior { keys, children } = read_node(pager, self.root)? {
                if keys.is_empty() {
                    let child = children[0];
                    let child_node = read_node(pager, child)?;
                    write_node(pager, self.root, &child_node, self.index)?;
                    pager.free(child)?;
                }
            }
        }
        Ok(deleted)
    }

    fn delete_rec(&self, pager: &mut Pager, page: PageId, key: &[u8]) -> Result<bool> {
        let mut node = read_node(pager, page)?;
        // Outcome of the match: whether the key was found, and which child
        // (if any) to check for underflow afterwards.
        let mut child_to_check = None;
        let deleted = match &mut node {
            Node::Leaf { cells } => {
                match cells.binary_search_by(|c| c.key.as_slice().cmp(key)) {
                    Ok(pos) => {
                        let cell = cells.remove(pos);
                        free_payload(pager, &cell.payload)?;
                        true
                    }
                    Err(_) => return Ok(false),
                }
            }
            Node::Interior { keys, children } => {
                let idx = descend_index(keys, key);
                let child = children[idx];
                let deleted = self.delete_rec(pager, child, key)?;
                if deleted {
                    child_to_check = Some((idx, child));
                }
                deleted
            }
        };

        match child_to_check {
            None => {
                if deleted {
                    write_node(pager, page, &node, self.index)?;
                }
            }
            Some((idx, child)) => {
                if read_node(pager, child)?.encoded_size() < MIN_NODE_BYTES {
                    self.rebalance(pager, &mut node, idx)?;
                    write_node(pager, page, &node, self.index)?;
                }
            }
        }
        Ok(deleted)
    }

    /// Fix an underfull child by merging with or borrowing from an adjacent
    /// sibling under the same parent.
    fn rebalance(&self, pager: &mut Pager, parent: &mut Node, idx: usize) -> Result<()> {
        let (keys, children) = match parent {
            Node::Interior { keys, children } => (keys, children),
            _ => return Err(Error::Internal("rebalance on a leaf parent".to_string())),
        };
        // Pair the underfull child with its left sibling when one exists.
        let li = if idx > 0 { idx - 1 } else { idx };
        let ri = li + 1;
        if ri >= children.len() {
            return Ok(()); // single child; handled by the root collapse
        }
        let left_page = children[li];
        let right_page = children[ri];
        let left = read_node(pager, left_page)?;
        let right = read_node(pager, right_page)?;
        let sep = keys[li].clone();

        let merged = merge_nodes(&left, &right, &sep)?;
        if merged.encoded_size() <= PAGE_SIZE {
            write_node(pager, left_page, &merged, self.index)?;
            pager.free(right_page)?;
            keys.remove(li);
            children.remove(ri);
        } else {
            // Merge would overflow: redistribute cells around the byte
            // midpoint and install the new separator.
            let (new_left, new_right, new_sep) = redistribute(merged)?;
            write_node(pager, left_page, &new_left, self.index)?;
            write_node(pager, right_page, &new_right, self.index)?;
            keys[li] = new_sep;
        }
        Ok(())
    }

    /// Cursor positioned before the first entry.
    pub fn cursor_first(&self, pager: &mut Pager) -> Result<Cursor> {
        let mut cursor = Cursor { stack: Vec::new() };
        cursor.descend_leftmost(pager, self.root)?;
        Ok(cursor)
    }

    /// Cursor positioned at the first entry with key >= `key`.
    pub fn cursor_seek(&self, pager: &mut Pager, key: &[u8]) -> Result<Cursor> {
        let mut cursor = Cursor { stack: Vec::new() };
        let mut page = self.root;
        loop {
            match read_node(pager, page)? {
                Node::Leaf { cells } => {
                    let pos = match cells.binary_search_by(|c| c.key.as_slice().cmp(key)) {
                        Ok(p) | Err(p) => p,
                    };
                    cursor.stack.push((page, pos));
                    return Ok(cursor);
                }
                Node::Interior { keys, children } => {
                    let idx = descend_index(&keys, key);
                    cursor.stack.push((page, idx));
                    page = children[idx];
                }
            }
        }
    }

    /// All entries with `lo <= key <= hi` in ascending key order.
    pub fn range_scan(
        &self,
        pager: &mut Pager,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut cursor = match lo {
            Some(lo) => self.cursor_seek(pager, lo)?,
            None => self.cursor_first(pager)?,
        };
        let mut entries = Vec::new();
        while let Some((key, payload)) = cursor.next(pager)? {
            if let Some(hi) = hi {
                if key.as_slice() > hi {
                    break;
                }
            }
            entries.push((key, payload));
        }
        Ok(entries)
    }

    /// All entries in ascending key order.
    pub fn scan_all(&self, pager: &mut Pager) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.range_scan(pager, None, None)
    }
}

/// Child index to descend into for `key`. Keys equal to a separator live in
/// the right subtree (the separator is the first key of the right node).
fn descend_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
    match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

/// Split position such that both halves carry roughly half the bytes, with
/// at least one cell on each side.
fn byte_midpoint(sizes: impl Iterator<Item = usize>, count: usize) -> usize {
    debug_assert!(count >= 2, "a single cell always fits a page");
    let sizes: Vec<usize> = sizes.collect();
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            return i.max(1).min(count - 1);
        }
    }
    (count / 2).max(1)
}

fn merge_nodes(left: &Node, right: &Node, sep: &[u8]) -> Result<Node> {
    match (left, right) {
        (Node::Leaf { cells: lc }, Node::Leaf { cells: rc }) => {
            let mut cells = lc.clone();
            cells.extend(rc.iter().cloned());
            Ok(Node::Leaf { cells })
        }
        (
            Node::Interior {
                keys: lk,
                children: lch,
            },
            Node::Interior {
                keys: rk,
                children: rch,
            },
        ) => {
            let mut keys = lk.clone();
            keys.push(sep.to_vec());
            keys.extend(rk.iter().cloned());
            let mut children = lch.clone();
            children.extend(rch.iter().cloned());
            Ok(Node::Interior { keys, children })
        }
        _ => Err(Error::Corrupt(
            "sibling nodes of mixed kinds".to_string(),
        )),
    }
}

/// Split a combined node back into two balanced halves, returning the new
/// separator for the parent.
fn redistribute(merged: Node) -> Result<(Node, Node, Vec<u8>)> {
    match merged {
        Node::Leaf { cells } => {
            let mid = byte_midpoint(cells.iter().map(LeafCell::encoded_size), cells.len());
            let right: Vec<LeafCell> = cells[mid..].to_vec();
            let left: Vec<LeafCell> = cells[..mid].to_vec();
            let sep = right[0].key.clone();
            Ok((Node::Leaf { cells: left }, Node::Leaf { cells: right }, sep))
        }
        Node::Interior { keys, children } => {
            let mid = byte_midpoint(keys.iter().map(|k| 2 + k.len() + 4), keys.len());
            let sep = keys[mid].clone();
            let left = Node::Interior {
                keys: keys[..mid].to_vec(),
                children: children[..=mid].to_vec(),
            };
            let right = Node::Interior {
                keys: keys[mid + 1..].to_vec(),
                children: children[mid + 1..].to_vec(),
            };
            Ok((left, right, sep))
        }
    }
}

/// A position within a B-Tree: a root-to-leaf path plus an index within the
/// leaf. Invalidated by any structural modification of the tree; re-seek
/// after inserts or deletes.
#[derive(Debug)]
pub struct Cursor {
    /// `(page, index)` pairs: the child index taken in each interior node,
    /// and the next cell to return in the leaf at the top.
    stack: Vec<(PageId, usize)>,
}

impl Cursor {
    fn descend_leftmost(&mut self, pager: &mut Pager, mut page: PageId) -> Result<()> {
        loop {
            match read_node(pager, page)? {
                Node::Leaf { .. } => {
                    self.stack.push((page, 0));
                    return Ok(());
                }
                Node::Interior { children, .. } => {
                    self.stack.push((page, 0));
                    page = children[0];
                }
            }
        }
    }

    /// Advance to the next entry, ascending and redescending across leaf
    /// boundaries.
    pub fn next(&mut self, pager: &mut Pager) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (page, idx) = match self.stack.last() {
                Some(&top) => top,
                None => return Ok(None),
            };
            match read_node(pager, page)? {
                Node::Leaf { cells } => {
                    if idx < cells.len() {
                        self.stack.last_mut().unwrap().1 += 1;
                        let payload = read_payload(pager, &cells[idx].payload)?;
                        return Ok(Some((cells[idx].key.clone(), payload)));
                    }
                    self.stack.pop();
                }
                Node::Interior { children, .. } => {
                    let next_child = idx + 1;
                    if next_child < children.len() {
                        self.stack.last_mut().unwrap().1 = next_child;
                        self.descend_leftmost(pager, children[next_child])?;
                    } else {
                        self.stack.pop();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Pager, BTree) {
        let dir = TempDir::new().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db")).unwrap();
        pager.begin_write().unwrap();
        let root = BTree::create(&mut pager, false).unwrap();
        (dir, pager, BTree::table(root))
    }

    fn int_key(i: i64) -> Vec<u8> {
        crate::storage::record::encode_key(&[crate::storage::record::Value::Int(i)]).unwrap()
    }

    #[test]
    fn test_insert_and_search() {
        let (_dir, mut pager, tree) = setup();
        for i in [5i64, 3, 7, 1, 9] {
            tree.insert(&mut pager, &int_key(i), format!("v{}", i).as_bytes())
                .unwrap();
        }
        assert_eq!(
            tree.search(&mut pager, &int_key(7)).unwrap(),
            Some(b"v7".to_vec())
        );
        assert_eq!(tree.search(&mut pager, &int_key(8)).unwrap(), None);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, mut pager, tree) = setup();
        tree.insert(&mut pager, &int_key(1), b"a").unwrap();
        let err = tree.insert(&mut pager, &int_key(1), b"b").unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
        // replace is allowed
        tree.replace(&mut pager, &int_key(1), b"b").unwrap();
        assert_eq!(tree.search(&mut pager, &int_key(1)).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_many_inserts_force_splits() {
        let (_dir, mut pager, tree) = setup();
        let payload = vec![0x42u8; 100];
        for i in 0..500 {
            tree.insert(&mut pager, &int_key(i), &payload).unwrap();
        }
        for i in 0..500 {
            assert!(tree.search(&mut pager, &int_key(i)).unwrap().is_some());
        }
        let all = tree.scan_all(&mut pager).unwrap();
        assert_eq!(all.len(), 500);
        // ascending key order
        for pair in all.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_delete_with_merges() {
        let (_dir, mut pager, tree) = setup();
        let payload = vec![0x42u8; 100];
        for i in 0..300 {
            tree.insert(&mut pager, &int_key(i), &payload).unwrap();
        }
        for i in 0..300 {
            assert!(tree.delete(&mut pager, &int_key(i)).unwrap());
        }
        assert!(!tree.delete(&mut pager, &int_key(0)).unwrap());
        assert!(tree.scan_all(&mut pager).unwrap().is_empty());
    }

    #[test]
    fn test_matches_model_under_mixed_ops() {
        let (_dir, mut pager, tree) = setup();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        // Deterministic pseudo-random mix of inserts and deletes.
        let mut state = 0x12345678u64;
        for step in 0..1000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let k = (state >> 33) % 200;
            let key = int_key(k as i64);
            if step % 3 == 2 {
                let expected = model.remove(&key).is_some();
                assert_eq!(tree.delete(&mut pager, &key).unwrap(), expected);
            } else {
                let value = format!("value-{}", step).into_bytes();
                tree.replace(&mut pager, &key, &value).unwrap();
                model.insert(key, value);
            }
        }

        let entries = tree.scan_all(&mut pager).unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.into_iter().collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_range_scan_bounds() {
        let (_dir, mut pager, tree) = setup();
        for i in 0..50 {
            tree.insert(&mut pager, &int_key(i), b"x").unwrap();
        }
        let entries = tree
            .range_scan(&mut pager, Some(&int_key(10)), Some(&int_key(20)))
            .unwrap();
        assert_eq!(entries.len(), 11);
        assert_eq!(entries[0].0, int_key(10));
        assert_eq!(entries[10].0, int_key(20));
    }

    #[test]
    fn test_overflow_payload_roundtrip() {
        let (_dir, mut pager, tree) = setup();
        let big: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
        tree.insert(&mut pager, &int_key(1), &big).unwrap();
        assert_eq!(tree.search(&mut pager, &int_key(1)).unwrap(), Some(big.clone()));

        // Replacing frees the old chain; deleting frees the new one.
        let bigger: Vec<u8> = (0..30_000).map(|i| (i % 13) as u8).collect();
        tree.replace(&mut pager, &int_key(1), &bigger).unwrap();
        assert_eq!(tree.search(&mut pager, &int_key(1)).unwrap(), Some(bigger));
        assert!(tree.delete(&mut pager, &int_key(1)).unwrap());

        // All overflow pages are back on the free-list: allocating reuses
        // them without growing the file.
        let before = pager.meta().page_count;
        let _ = pager.allocate().unwrap();
        assert_eq!(pager.meta().page_count, before);
    }

    #[test]
    fn test_key_length_limit() {
        let (_dir, mut pager, tree) = setup();
        let long_key = vec![7u8; MAX_KEY_LEN + 1];
        assert!(matches!(
            tree.insert(&mut pager, &long_key, b"x"),
            Err(Error::Constraint(_))
        ));
    }

    #[test]
    fn test_uniform_depth_and_fill() {
        let (_dir, mut pager, tree) = setup();
        let payload = vec![1u8; 200];
        for i in 0..400 {
            tree.insert(&mut pager, &int_key(i), &payload).unwrap();
        }
        // Walk the tree: all leaves at the same depth, every node within
        // the byte budget, non-root nodes at least a quarter full.
        let mut depths = Vec::new();
        let mut stack = vec![(tree.root(), 0usize, true)];
        while let Some((page, depth, is_root)) = stack.pop() {
            let node = read_node(&mut pager, page).unwrap();
            let size = node.encoded_size();
            assert!(size <= PAGE_SIZE);
            if !is_root {
                assert!(size >= MIN_NODE_BYTES, "page {} is underfull ({} bytes)", page, size);
            }
            match node {
                Node::Leaf { cells } => {
                    depths.push(depth);
                    for pair in cells.windows(2) {
                        assert!(pair[0].key < pair[1].key);
                    }
                }
                Node::Interior { children, .. } => {
                    for child in children {
                        stack.push((child, depth + 1, false));
                    }
                }
            }
        }
        assert!(depths.windows(2).all(|d| d[0] == d[1]));
        assert!(depths[0] >= 1, "400 cells of 200 bytes must split");
    }
}

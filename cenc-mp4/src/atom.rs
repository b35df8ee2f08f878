/*
    REFERENCES
    ----------

    1. ISO/IEC 14496-12 (ISO base media file format), section 4.2 object structure
    2. https://github.com/shaka-project/shaka-packager/blob/d5ca6e84/packager/media/formats/mp4/box_definitions.cc#L1544

*/

use crate::{Error, Reader, Result};
use std::fmt;

/// Four character code of a box.
pub type FourCc = [u8; 4];

/// An owned mp4 box.
///
/// Only the boxes which lead to sample descriptions and track fragments are
/// parsed into children. Every other box keeps its payload as raw bytes and is
/// written back untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct Atom {
    pub kind: FourCc,
    /// Extended type of `uuid` boxes.
    pub user_type: Option<[u8; 16]>,
    large_size: bool,
    pub body: AtomBody,
}

#[derive(Clone, PartialEq, Eq)]
pub enum AtomBody {
    Leaf(Vec<u8>),
    /// `prefix` holds the fixed fields which come before the first child,
    /// e.g. the entry count of `stsd` or the 78 bytes of a visual sample entry.
    Container {
        prefix: Vec<u8>,
        children: Vec<Atom>,
    },
}

enum Layout {
    Opaque,
    Children,
    SampleDescription,
    VisualSampleEntry,
    AudioSampleEntry,
}

fn layout(kind: &FourCc) -> Layout {
    match kind {
        b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"mvex" | b"moof" | b"traf"
        | b"sinf" | b"schi" | b"edts" | b"dinf" => Layout::Children,
        b"stsd" => Layout::SampleDescription,
        b"avc1" | b"avc2" | b"avc3" | b"avc4" | b"hvc1" | b"hev1" | b"dvh1" | b"dvhe"
        | b"dva1" | b"dvav" | b"mp4v" | b"encv" => Layout::VisualSampleEntry,
        b"mp4a" | b"enca" | b"ac-3" | b"ec-3" | b"ac-4" | b"Opus" | b"fLaC" => {
            Layout::AudioSampleEntry
        }
        _ => Layout::Opaque,
    }
}

/// Parse every box in `data`.
pub fn parse_atoms(data: &[u8]) -> Result<Vec<Atom>> {
    let mut reader = Reader::new(data);
    let mut atoms = Vec::new();

    while reader.has_more_data() {
        atoms.push(Atom::parse_next(&mut reader)?);
    }

    Ok(atoms)
}

/// Serialize a list of sibling boxes.
pub fn write_atoms(atoms: &[Atom]) -> Vec<u8> {
    let mut out = Vec::with_capacity(atoms.iter().map(|x| x.size() as usize).sum());

    for atom in atoms {
        atom.write(&mut out);
    }

    out
}

/// Absolute start offset of every box in a sibling list, starting at `base`.
pub fn atom_offsets(atoms: &[Atom], base: u64) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(atoms.len());
    let mut offset = base;

    for atom in atoms {
        offsets.push(offset);
        offset += atom.size();
    }

    offsets
}

impl Atom {
    pub fn leaf(kind: &FourCc, payload: Vec<u8>) -> Self {
        Self {
            kind: *kind,
            user_type: None,
            large_size: false,
            body: AtomBody::Leaf(payload),
        }
    }

    /// Create a full box with a version and 24 bit flags in front of `payload`.
    pub fn full(kind: &FourCc, version: u8, flags: u32, payload: &[u8]) -> Self {
        Self::leaf(kind, full_box_payload(version, flags, payload))
    }

    pub fn container(kind: &FourCc, children: Vec<Atom>) -> Self {
        Self {
            kind: *kind,
            user_type: None,
            large_size: false,
            body: AtomBody::Container {
                prefix: Vec::new(),
                children,
            },
        }
    }

    pub fn uuid(user_type: [u8; 16], payload: Vec<u8>) -> Self {
        Self {
            kind: *b"uuid",
            user_type: Some(user_type),
            large_size: false,
            body: AtomBody::Leaf(payload),
        }
    }

    fn parse_next(reader: &mut Reader) -> Result<Self> {
        let start = reader.get_position();
        let mut size = reader.read_u32()? as u64;
        let kind = reader.read_array::<4>()?;
        let mut large_size = false;

        match size {
            0 => size = reader.get_length() - start,
            1 => {
                size = reader.read_u64()?;
                large_size = true;
            }
            _ => (),
        }

        let user_type = if &kind == b"uuid" {
            Some(reader.read_array::<16>()?)
        } else {
            None
        };

        let header_size = reader.get_position() - start;

        if size < header_size {
            return Err(Error::invalid_format(format!(
                "{} box declares size {} which is smaller than its header",
                String::from_utf8_lossy(&kind),
                size
            )));
        }

        let payload = reader.read_slice((size - header_size) as usize).map_err(|_| {
            Error::invalid_format(format!(
                "{} box of size {} at offset {} exceeds its parent",
                String::from_utf8_lossy(&kind),
                size,
                start
            ))
        })?;

        let body = match layout(&kind) {
            Layout::Opaque => AtomBody::Leaf(payload.to_vec()),
            Layout::Children => AtomBody::Container {
                prefix: Vec::new(),
                children: parse_atoms(payload)?,
            },
            Layout::SampleDescription => {
                let mut payload_reader = Reader::new(payload);
                let prefix = payload_reader.read_slice(8)?.to_vec();
                let count = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
                let mut children = Vec::new();

                for _ in 0..count {
                    children.push(Self::parse_next(&mut payload_reader)?);
                }

                if payload_reader.has_more_data() {
                    return Err(Error::invalid_format(
                        "stsd box has trailing data after its sample entries",
                    ));
                }

                AtomBody::Container { prefix, children }
            }
            Layout::VisualSampleEntry => {
                // reserved (6), data reference index (2), pre defined and reserved (16),
                // width and height (4), resolution (8), reserved (4), frame count (2),
                // compressor name (32), depth (2), pre defined (2)
                Self::split_entry(payload, 78)?
            }
            Layout::AudioSampleEntry => {
                // reserved (6), data reference index (2), version (2), then the
                // version dependent sound description fields.
                let version = Reader::new(payload.get(8..).unwrap_or_default()).read_u16()?;
                let prefix_size = match version {
                    1 => 44,
                    2 => 64,
                    _ => 28,
                };
                Self::split_entry(payload, prefix_size)?
            }
        };

        Ok(Self {
            kind,
            user_type,
            large_size,
            body,
        })
    }

    fn split_entry(payload: &[u8], prefix_size: usize) -> Result<AtomBody> {
        let mut reader = Reader::new(payload);
        let prefix = reader.read_slice(prefix_size)?.to_vec();

        // Some writers pad sample entries with bytes that are not boxes.
        match parse_atoms(reader.read_rest()) {
            Ok(children) => Ok(AtomBody::Container { prefix, children }),
            Err(_) => Ok(AtomBody::Leaf(payload.to_vec())),
        }
    }

    /// Size of the box header, including the large size and extended type fields.
    pub fn header_size(&self) -> u64 {
        let body_size = self.body_size();
        let mut size = 8;

        if self.large_size || body_size + 8 + 16 > u32::MAX as u64 {
            size += 8;
        }

        if self.user_type.is_some() {
            size += 16;
        }

        size
    }

    fn body_size(&self) -> u64 {
        match &self.body {
            AtomBody::Leaf(payload) => payload.len() as u64,
            AtomBody::Container { prefix, children } => {
                prefix.len() as u64 + children.iter().map(|x| x.size()).sum::<u64>()
            }
        }
    }

    /// Total size of the box as it would be written.
    pub fn size(&self) -> u64 {
        self.header_size() + self.body_size()
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let size = self.size();

        if self.header_size() - self.user_type.map_or(0, |_| 16) == 16 {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&self.kind);
            out.extend_from_slice(&size.to_be_bytes());
        } else {
            out.extend_from_slice(&(size as u32).to_be_bytes());
            out.extend_from_slice(&self.kind);
        }

        if let Some(user_type) = &self.user_type {
            out.extend_from_slice(user_type);
        }

        match &self.body {
            AtomBody::Leaf(payload) => out.extend_from_slice(payload),
            AtomBody::Container { prefix, children } => {
                out.extend_from_slice(prefix);

                for child in children {
                    child.write(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        self.write(&mut out);
        out
    }

    pub fn is(&self, kind: &FourCc) -> bool {
        &self.kind == kind
    }

    pub fn is_uuid(&self, user_type: &[u8; 16]) -> bool {
        self.user_type.as_ref() == Some(user_type)
    }

    /// Payload of a leaf box.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            AtomBody::Leaf(payload) => Some(payload),
            AtomBody::Container { .. } => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.body {
            AtomBody::Leaf(payload) => Some(payload),
            AtomBody::Container { .. } => None,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        match &self.body {
            AtomBody::Container { prefix, .. } => prefix,
            AtomBody::Leaf(_) => &[],
        }
    }

    pub fn prefix_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.body {
            AtomBody::Container { prefix, .. } => Some(prefix),
            AtomBody::Leaf(_) => None,
        }
    }

    pub fn children(&self) -> &[Atom] {
        match &self.body {
            AtomBody::Container { children, .. } => children,
            AtomBody::Leaf(_) => &[],
        }
    }

    /// Mutable child list. Fails for leaf boxes.
    pub fn children_mut(&mut self) -> Result<&mut Vec<Atom>> {
        let kind = self.kind;

        match &mut self.body {
            AtomBody::Container { children, .. } => Ok(children),
            AtomBody::Leaf(_) => Err(Error::internal(format!(
                "{} box is not a container",
                String::from_utf8_lossy(&kind)
            ))),
        }
    }

    pub fn child(&self, kind: &FourCc) -> Option<&Atom> {
        self.children().iter().find(|x| x.is(kind))
    }

    pub fn child_mut(&mut self, kind: &FourCc) -> Option<&mut Atom> {
        match &mut self.body {
            AtomBody::Container { children, .. } => children.iter_mut().find(|x| x.is(kind)),
            AtomBody::Leaf(_) => None,
        }
    }

    pub fn children_of<'a>(&'a self, kind: &'a FourCc) -> impl Iterator<Item = &'a Atom> {
        self.children().iter().filter(move |x| x.is(kind))
    }

    pub fn uuid_child(&self, user_type: &[u8; 16]) -> Option<&Atom> {
        self.children().iter().find(|x| x.is_uuid(user_type))
    }

    /// Find a descendant by a slash separated path such as `mdia/minf/stbl/stsd`.
    pub fn find(&self, path: &str) -> Option<&Atom> {
        path.split('/').try_fold(self, |atom, name| {
            atom.children().iter().find(|x| x.kind == name.as_bytes())
        })
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Atom> {
        let mut atom = self;

        for name in path.split('/') {
            atom = atom.child_mut(&name.as_bytes().try_into().ok()?)?;
        }

        Some(atom)
    }

    pub fn add_child(&mut self, child: Atom) -> Result<()> {
        self.children_mut()?.push(child);
        Ok(())
    }

    pub fn insert_child(&mut self, index: usize, child: Atom) -> Result<()> {
        let children = self.children_mut()?;
        children.insert(index.min(children.len()), child);
        Ok(())
    }

    /// Detach the first child of the given type and hand it back to the caller.
    pub fn remove_child(&mut self, kind: &FourCc) -> Option<Atom> {
        let children = self.children_mut().ok()?;
        let index = children.iter().position(|x| x.is(kind))?;
        Some(children.remove(index))
    }

    /// Detach every child which matches `predicate`, returning how many were removed.
    pub fn remove_children_where(&mut self, predicate: impl Fn(&Atom) -> bool) -> usize {
        match &mut self.body {
            AtomBody::Container { children, .. } => {
                let before = children.len();
                children.retain(|x| !predicate(x));
                before - children.len()
            }
            AtomBody::Leaf(_) => 0,
        }
    }

    /// Offset of the child at `index` relative to the start of this box.
    pub fn offset_of_child(&self, index: usize) -> u64 {
        self.header_size()
            + self.prefix().len() as u64
            + self
                .children()
                .iter()
                .take(index)
                .map(|x| x.size())
                .sum::<u64>()
    }

    /// Version and flags of a full box.
    pub fn version_and_flags(&self) -> Result<(u8, u32)> {
        let payload = self.payload().unwrap_or_default();
        let value = Reader::new(payload).read_u32().map_err(|_| {
            Error::invalid_format(format!("{} box has no full box header", self))
        })?;
        Ok(((value >> 24) as u8, value & 0xFFFFFF))
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.kind))
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Atom");
        debug
            .field("kind", &String::from_utf8_lossy(&self.kind))
            .field("size", &self.size());

        if let Some(user_type) = &self.user_type {
            debug.field("user_type", &hex::encode(user_type));
        }

        if let AtomBody::Container { children, .. } = &self.body {
            debug.field("children", children);
        }

        debug.finish()
    }
}

pub(crate) fn full_box_payload(version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(&(((version as u32) << 24) | (flags & 0xFFFFFF)).to_be_bytes());
    data.extend_from_slice(payload);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Vec<u8> {
        let stsd = {
            let mut avc1 = vec![0u8; 78];
            avc1.extend(Atom::leaf(b"avcC", vec![1, 2, 3]).to_bytes());
            let entry = Atom::leaf(b"avc1", avc1).to_bytes();
            let mut payload = vec![0, 0, 0, 0, 0, 0, 0, 1];
            payload.extend(entry);
            Atom::leaf(b"stsd", payload)
        };

        let stbl = Atom::container(b"stbl", vec![stsd]);
        let minf = Atom::container(b"minf", vec![stbl]);
        let mdia = Atom::container(b"mdia", vec![minf]);
        let trak = Atom::container(b"trak", vec![mdia]);
        let moov = Atom::container(b"moov", vec![trak]);

        let mut data = Atom::leaf(b"ftyp", b"isom\0\0\0\x01".to_vec()).to_bytes();
        data.extend(moov.to_bytes());
        data
    }

    #[test]
    fn test_parse_and_write_is_lossless() {
        let data = sample_tree();
        let atoms = parse_atoms(&data).unwrap();
        assert_eq!(atoms.len(), 2);
        assert_eq!(write_atoms(&atoms), data);

        let stsd = atoms[1].find("trak/mdia/minf/stbl/stsd").unwrap();
        assert_eq!(stsd.children().len(), 1);
        assert_eq!(stsd.children()[0].prefix().len(), 78);
        assert_eq!(
            stsd.children()[0].child(b"avcC").unwrap().payload(),
            Some(&[1, 2, 3][..])
        );
    }

    #[test]
    fn test_sizes_follow_mutation() {
        let data = sample_tree();
        let mut atoms = parse_atoms(&data).unwrap();
        let before = atoms[1].size();

        let stbl = atoms[1].find_mut("trak/mdia/minf/stbl").unwrap();
        stbl.add_child(Atom::full(b"stsz", 0, 0, &[0; 8])).unwrap();
        assert_eq!(atoms[1].size(), before + 20);

        let stbl = atoms[1].find_mut("trak/mdia/minf/stbl").unwrap();
        assert!(stbl.remove_child(b"stsz").is_some());
        assert_eq!(atoms[1].size(), before);
    }

    #[test]
    fn test_large_size_and_uuid() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[7; 4]);
        data.extend(Atom::uuid([9; 16], vec![1, 2]).to_bytes());

        let atoms = parse_atoms(&data).unwrap();
        assert_eq!(atoms[0].header_size(), 16);
        assert_eq!(atoms[1].header_size(), 24);
        assert!(atoms[1].is_uuid(&[9; 16]));
        assert_eq!(write_atoms(&atoms), data);
        assert_eq!(atom_offsets(&atoms, 0), vec![0, 20]);
    }

    #[test]
    fn test_truncated_box_is_invalid_format() {
        let mut data = Atom::leaf(b"free", vec![0; 10]).to_bytes();
        data.truncate(12);
        assert!(parse_atoms(&data).unwrap_err().is_invalid_format());
    }

    #[test]
    fn test_offset_of_child() {
        let traf = Atom::container(
            b"traf",
            vec![
                Atom::full(b"tfhd", 0, 0, &[0; 4]),
                Atom::full(b"trun", 0, 0, &[0; 4]),
            ],
        );
        assert_eq!(traf.offset_of_child(0), 8);
        assert_eq!(traf.offset_of_child(1), 8 + 16);
    }
}

use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result};

/// File type box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtypBox {
    pub major_brand: FourCc,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCc>,
}

impl FtypBox {
    pub fn has_brand(&self, brand: &FourCc) -> bool {
        &self.major_brand == brand || self.compatible_brands.contains(brand)
    }
}

impl TypedBox for FtypBox {
    const KIND: FourCc = *b"ftyp";

    fn parse(atom: &Atom) -> Result<Self> {
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        let major_brand = reader.read_array()?;
        let minor_version = reader.read_u32()?;
        let mut compatible_brands = Vec::new();

        while reader.remaining() >= 4 {
            compatible_brands.push(reader.read_array()?);
        }

        Ok(Self {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(8 + 4 * self.compatible_brands.len());
        payload.extend_from_slice(&self.major_brand);
        payload.extend_from_slice(&self.minor_version.to_be_bytes());

        for brand in &self.compatible_brands {
            payload.extend_from_slice(brand);
        }

        Atom::leaf(&Self::KIND, payload)
    }
}

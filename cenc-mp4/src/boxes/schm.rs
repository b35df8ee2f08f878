use super::TypedBox;
use crate::{Atom, FourCc, Reader, Result, atom::full_box_payload};

/// Scheme Type Box (schm) - identifies the protection scheme.
///
/// The scheme type indicates which encryption scheme is used:
/// - `cenc` - AES-CTR full sample and subsample encryption
/// - `cens` - AES-CTR pattern encryption
/// - `cbc1` - AES-CBC full sample and subsample encryption
/// - `cbcs` - AES-CBC pattern encryption with a constant IV
/// - `piff` - PIFF 1.1 protection, cipher picked by the track encryption box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchmBox {
    /// The scheme type as a four character code (e.g., `cenc`, `cbcs`).
    pub scheme_type: FourCc,
    /// The version of the scheme.
    pub scheme_version: u32,
    /// Optional scheme URI (if flags & 0x000001).
    pub scheme_uri: Option<String>,
}

impl SchmBox {
    pub fn new(scheme_type: FourCc, scheme_version: u32) -> Self {
        Self {
            scheme_type,
            scheme_version,
            scheme_uri: None,
        }
    }

    pub fn scheme_type_str(&self) -> String {
        String::from_utf8_lossy(&self.scheme_type).into_owned()
    }
}

impl TypedBox for SchmBox {
    const KIND: FourCc = *b"schm";

    fn parse(atom: &Atom) -> Result<Self> {
        let (_, flags) = atom.version_and_flags()?;
        let mut reader = Reader::new(atom.payload().unwrap_or_default());
        reader.skip(4)?;

        let scheme_type = reader.read_array()?;
        let scheme_version = reader.read_u32()?;

        let scheme_uri = if flags & 0x000001 != 0 && reader.has_more_data() {
            let s = String::from_utf8_lossy(reader.read_rest());
            Some(s.trim_end_matches('\0').to_owned())
        } else {
            None
        };

        Ok(Self {
            scheme_type,
            scheme_version,
            scheme_uri,
        })
    }

    fn to_atom(&self) -> Atom {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.scheme_type);
        payload.extend_from_slice(&self.scheme_version.to_be_bytes());

        let flags = if let Some(uri) = &self.scheme_uri {
            payload.extend_from_slice(uri.as_bytes());
            payload.push(0);
            1
        } else {
            0
        };

        Atom::leaf(&Self::KIND, full_box_payload(0, flags, &payload))
    }
}

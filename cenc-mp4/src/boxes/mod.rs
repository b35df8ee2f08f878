//! Typed views over the boxes which carry protection and fragment metadata.
//!
//! Every type parses itself from an [`Atom`] and can be turned back into one,
//! so that a box can be read, changed and put back in place.

use crate::{Atom, FourCc, Result};

mod frma;
mod ftyp;
mod hdlr;
mod saio;
mod saiz;
mod schm;
mod senc;
mod tenc;
mod tfhd;
mod tkhd;
mod trex;
mod trun;

pub use frma::FrmaBox;
pub use ftyp::FtypBox;
pub use hdlr::HdlrBox;
pub use saio::SaioBox;
pub use saiz::SaizBox;
pub use schm::SchmBox;
pub use senc::{PIFF_SENC_UUID, SencBox, SencSample, SencSubsample};
pub use tenc::{PIFF_TENC_UUID, TencBox};
pub use tfhd::TfhdBox;
pub use tkhd::TkhdBox;
pub use trex::TrexBox;
pub use trun::{TrunBox, TrunSample};

/// A box with a fixed four character code which can be decoded from and
/// encoded into an [`Atom`].
pub trait TypedBox: Sized {
    const KIND: FourCc;

    fn parse(atom: &Atom) -> Result<Self>;

    fn to_atom(&self) -> Atom;

    /// Parse the first child of `parent` with this type, if any.
    fn from_child(parent: &Atom) -> Result<Option<Self>> {
        parent.child(&Self::KIND).map(Self::parse).transpose()
    }
}

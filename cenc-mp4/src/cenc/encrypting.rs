//! High-level common encryption processor.

use super::{
    decrypting::parse_hex_16,
    encrypter::{SampleEncrypter, create_encrypter},
    fragment::{DataBase, fragment_layout, rewrite_data_offsets, to_data_offset},
    mapper::{SubSampleMapper, create_mapper},
    sample_info::SampleInfoTable,
    variant::{CencVariant, CipherParams, EncryptOptions},
};
use crate::{
    Atom, Error, FourCc, Result, atom_offsets,
    boxes::{
        FrmaBox, FtypBox, HdlrBox, SaioBox, SaizBox, SchmBox, SencBox, TencBox, TfhdBox, TkhdBox,
        TrexBox, TypedBox,
    },
    codec::{AvcDecoderConfig, HevcDecoderConfig, VideoCodec},
    parse_atoms,
};
use log::{debug, trace, warn};
use std::collections::HashMap;

struct TrackKey {
    key: [u8; 16],
    iv: Vec<u8>,
}

/// Builder for creating [`CencEncryptingProcessor`] instances.
///
/// # Example
///
/// ```no_run
/// use cenc_mp4::{CencEncryptingProcessor, CencVariant};
///
/// let processor = CencEncryptingProcessor::builder(CencVariant::MpegCbcs)
///     .key(1, "100b6c20940f779a4589152b57d2dacb", "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff")?
///     .kid(1, "eb676abbcb345e96bbcf616630f1a3da")?
///     .build()?;
/// # Ok::<(), cenc_mp4::Error>(())
/// ```
pub struct CencEncryptingProcessorBuilder {
    variant: CencVariant,
    options: EncryptOptions,
    keys: HashMap<u32, TrackKey>,
    kids: HashMap<u32, [u8; 16]>,
    clear_lead: HashMap<u32, u32>,
}

impl CencEncryptingProcessorBuilder {
    pub fn new(variant: CencVariant) -> Self {
        Self {
            variant,
            options: EncryptOptions::default(),
            keys: HashMap::new(),
            kids: HashMap::new(),
            clear_lead: HashMap::new(),
        }
    }

    /// Encrypt a track with a key and a starting IV.
    ///
    /// # Arguments
    ///
    /// * `track_id` - The track ID from the `tkhd` box
    /// * `key` - The key as a 32-character hexadecimal string (16 bytes)
    /// * `iv` - The first IV as a 16 or 32-character hexadecimal string (8 or 16 bytes)
    pub fn key(self, track_id: u32, key: &str, iv: &str) -> Result<Self> {
        let key = parse_hex_16(key)?;
        let iv = hex::decode(iv)?;
        Ok(self.key_bytes(track_id, key, &iv))
    }

    /// Encrypt a track with a raw key and IV. The IV length is checked by [`build`](Self::build).
    pub fn key_bytes(mut self, track_id: u32, key: [u8; 16], iv: &[u8]) -> Self {
        self.keys.insert(
            track_id,
            TrackKey {
                key,
                iv: iv.to_vec(),
            },
        );
        self
    }

    /// KID written to the track encryption box, all zeros when not set.
    pub fn kid(mut self, track_id: u32, kid: &str) -> Result<Self> {
        self.kids.insert(track_id, parse_hex_16(kid)?);
        Ok(self)
    }

    /// Leave the first `fragments` fragments of a track unencrypted.
    pub fn clear_lead(mut self, track_id: u32, fragments: u32) -> Self {
        self.clear_lead.insert(track_id, fragments);
        self
    }

    pub fn options(mut self, options: EncryptOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<CencEncryptingProcessor> {
        if self.keys.is_empty() {
            return Err(Error::invalid_parameters("no keys were provided"));
        }

        for (track_id, key) in &self.keys {
            if key.iv.len() != 8 && key.iv.len() != 16 {
                return Err(Error::invalid_parameters(format!(
                    "IV of track {} must be 8 or 16 bytes, got {}",
                    track_id,
                    key.iv.len()
                )));
            }
        }

        if let Some(track_id) = self.kids.keys().find(|x| !self.keys.contains_key(x)) {
            return Err(Error::invalid_parameters(format!(
                "KID given for track {} which has no key",
                track_id
            )));
        }

        Ok(CencEncryptingProcessor {
            variant: self.variant,
            options: self.options,
            keys: self.keys,
            kids: self.kids,
            clear_lead: self.clear_lead,
            tracks: HashMap::new(),
            trex: HashMap::new(),
        })
    }
}

struct TrackEncrypter {
    encrypter: Box<dyn SampleEncrypter>,
    params: CipherParams,
    /// Added to a sample description index to get its clear duplicate.
    clear_description_offset: u32,
    clear_lead_remaining: u32,
}

/// Encrypts the tracks of fragmented mp4 files with one of the [`CencVariant`]s.
///
/// The processor keeps the IV of every track between calls, so the init
/// segment has to go through [`encrypt_init`](Self::encrypt_init) first and
/// media segments must then be given in order.
///
/// # Example
///
/// ```no_run
/// use cenc_mp4::{CencEncryptingProcessor, CencVariant};
/// use std::fs;
///
/// let mut processor = CencEncryptingProcessor::builder(CencVariant::MpegCenc)
///     .key(1, "100b6c20940f779a4589152b57d2dacb", "0a610676cb88f302")?
///     .kid(1, "eb676abbcb345e96bbcf616630f1a3da")?
///     .clear_lead(1, 2)
///     .build()?;
///
/// let init = processor.encrypt_init(&fs::read("init.mp4")?)?;
/// let segment = processor.encrypt_segment(&fs::read("segment_1.m4s")?)?;
/// fs::write("init_enc.mp4", init)?;
/// fs::write("segment_1_enc.m4s", segment)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct CencEncryptingProcessor {
    variant: CencVariant,
    options: EncryptOptions,
    keys: HashMap<u32, TrackKey>,
    kids: HashMap<u32, [u8; 16]>,
    clear_lead: HashMap<u32, u32>,
    tracks: HashMap<u32, TrackEncrypter>,
    trex: HashMap<u32, TrexBox>,
}

impl CencEncryptingProcessor {
    pub fn builder(variant: CencVariant) -> CencEncryptingProcessorBuilder {
        CencEncryptingProcessorBuilder::new(variant)
    }

    pub fn variant(&self) -> CencVariant {
        self.variant
    }

    /// Protect the sample descriptions of an init segment.
    pub fn encrypt_init(&mut self, init: &[u8]) -> Result<Vec<u8>> {
        let atoms = parse_atoms(init)?;

        if !atoms.iter().any(|x| x.is(b"moov")) {
            return Err(Error::invalid_format("init segment has no moov box"));
        }

        self.process(init, atoms)
    }

    /// Encrypt the fragments of a media segment.
    pub fn encrypt_segment(&mut self, segment: &[u8]) -> Result<Vec<u8>> {
        if self.tracks.is_empty() {
            return Err(Error::invalid_parameters(
                "no track is set up for encryption, the init segment must be encrypted first",
            ));
        }

        let atoms = parse_atoms(segment)?;
        self.process(segment, atoms)
    }

    /// Encrypt a complete fragmented mp4 file.
    pub fn encrypt(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let atoms = parse_atoms(input)?;
        let moov = atoms
            .iter()
            .find(|x| x.is(b"moov"))
            .ok_or_else(|| Error::invalid_format("file has no moov box"))?;

        if moov.child(b"mvex").is_none() && !atoms.iter().any(|x| x.is(b"moof")) {
            return Err(Error::not_supported("files which are not fragmented"));
        }

        self.process(input, atoms)
    }

    fn process(&mut self, input: &[u8], mut atoms: Vec<Atom>) -> Result<Vec<u8>> {
        let offsets = atom_offsets(&atoms, 0);
        let sizes = atoms.iter().map(|x| x.size()).collect::<Vec<_>>();
        let mut data = input.to_vec();
        let mut ftyp = None;

        if atoms.iter().any(|x| x.is(b"moov")) && !atoms.iter().any(|x| x.is(b"ftyp")) {
            ftyp = Some(self.ftyp(FtypBox {
                major_brand: *b"mp42",
                minor_version: 1,
                compatible_brands: vec![*b"mp42", *b"isom"],
            }));
        }

        for (atom, offset) in atoms.iter_mut().zip(&offsets) {
            let kind = atom.kind;

            match &kind {
                b"ftyp" => *atom = self.ftyp(FtypBox::parse(atom)?),
                b"moov" => self.setup_tracks(atom)?,
                b"moof" => self.encrypt_fragment(atom, *offset, &mut data)?,
                _ => (),
            }
        }

        let mut output = Vec::with_capacity(data.len() + 4096);

        if let Some(ftyp) = ftyp {
            ftyp.write(&mut output);
        }

        for ((atom, offset), size) in atoms.iter().zip(offsets).zip(sizes) {
            if matches!(&atom.kind, b"ftyp" | b"moov" | b"moof") {
                atom.write(&mut output);
            } else {
                output.extend_from_slice(&data[offset as usize..(offset + size) as usize]);
            }
        }

        Ok(output)
    }

    fn ftyp(&self, mut ftyp: FtypBox) -> Atom {
        let brand = if self.variant.is_piff() {
            *b"piff"
        } else {
            *b"iso6"
        };

        if !ftyp.has_brand(&brand) {
            ftyp.compatible_brands.push(brand);
        }

        ftyp.to_atom()
    }

    fn setup_tracks(&mut self, moov: &mut Atom) -> Result<()> {
        if let Some(mvex) = moov.child(b"mvex") {
            for trex in mvex.children_of(&TrexBox::KIND) {
                let trex = TrexBox::parse(trex)?;
                self.trex.insert(trex.track_id, trex);
            }
        }

        for trak in moov.children_mut()?.iter_mut().filter(|x| x.is(b"trak")) {
            let track_id = TkhdBox::from_child(trak)?
                .ok_or_else(|| Error::invalid_format("trak box has no tkhd box"))?
                .track_id;

            let Some(key) = self.keys.get(&track_id) else {
                debug!("track {} has no key and stays in the clear", track_id);
                continue;
            };

            let kid = self.kids.get(&track_id).copied().unwrap_or_default();
            let handler = trak.find("mdia/hdlr").map(HdlrBox::parse).transpose()?;
            let stsd = trak.find_mut("mdia/minf/stbl/stsd").ok_or_else(|| {
                Error::invalid_format(format!("track {} has no stsd box", track_id))
            })?;

            let clear_entries = stsd.children().to_vec();
            let mut encrypter = None;

            for entry in stsd.children_mut()? {
                let (params, mapper) = self.protect_entry(entry, handler.as_ref(), key, kid)?;

                if encrypter.is_none() {
                    debug!(
                        "track {} uses {} with {} byte IVs and {} samples",
                        track_id,
                        self.variant,
                        params.iv_size,
                        if mapper.is_some() { "subsample" } else { "full" },
                    );
                    encrypter = Some((
                        create_encrypter(&key.key, &key.iv, &params, mapper)?,
                        params,
                    ));
                }
            }

            let Some((encrypter, params)) = encrypter else {
                warn!("track {} has no sample descriptions to protect", track_id);
                continue;
            };

            let clear_lead = self.clear_lead.get(&track_id).copied().unwrap_or_default();
            let clear_description_offset = clear_entries.len() as u32;

            if clear_lead > 0 {
                stsd.children_mut()?.extend(clear_entries);
                let entry_count = stsd.children().len() as u32;

                if let Some(prefix) = stsd.prefix_mut().filter(|x| x.len() == 8) {
                    prefix[4..].copy_from_slice(&entry_count.to_be_bytes());
                }
            }

            self.tracks.insert(
                track_id,
                TrackEncrypter {
                    encrypter,
                    params,
                    clear_description_offset,
                    clear_lead_remaining: clear_lead,
                },
            );
        }

        Ok(())
    }

    /// Wrap a sample entry in a protection scheme box and rename it.
    fn protect_entry(
        &self,
        entry: &mut Atom,
        handler: Option<&HdlrBox>,
        key: &TrackKey,
        kid: [u8; 16],
    ) -> Result<(CipherParams, Option<Box<dyn SubSampleMapper>>)> {
        let format = entry.kind;

        if entry.payload().is_some() || matches!(&format, b"encv" | b"enca") {
            return Err(Error::not_supported(format!(
                "{} sample entries cannot be encrypted",
                entry
            )));
        }

        let is_video = match handler {
            Some(handler) if handler.is_video() => true,
            Some(handler) if handler.is_audio() => false,
            _ if VideoCodec::from_format(&format).is_some() || &format == b"mp4v" => true,
            _ if matches!(&format, b"mp4a" | b"ac-3" | b"ec-3" | b"ac-4" | b"Opus" | b"fLaC") => {
                false
            }
            _ => {
                return Err(Error::not_supported(format!(
                    "{} tracks with {} handler",
                    entry,
                    handler.map_or("no".to_owned(), |x| {
                        String::from_utf8_lossy(&x.handler_type).into_owned()
                    })
                )));
            }
        };

        let params = self.variant.cipher_params(is_video, &self.options)?;
        let mapper = if is_video {
            self.mapper(entry, &format)?
        } else {
            None
        };

        let mut constant_iv = [0; 16];
        constant_iv[..key.iv.len()].copy_from_slice(&key.iv);

        let tenc = TencBox {
            version: if params.has_pattern() { 1 } else { 0 },
            default_is_protected: if self.variant.is_piff() {
                self.variant.algorithm_id()
            } else {
                1
            },
            default_crypt_byte_block: params.crypt_byte_block,
            default_skip_byte_block: params.skip_byte_block,
            default_per_sample_iv_size: params.iv_size,
            default_kid: kid,
            default_constant_iv: params.constant_iv.then(|| constant_iv.to_vec()),
        };

        let sinf = Atom::container(
            b"sinf",
            vec![
                FrmaBox {
                    original_format: format,
                }
                .to_atom(),
                SchmBox::new(self.variant.scheme_type(), self.variant.scheme_version()).to_atom(),
                Atom::container(
                    b"schi",
                    vec![if self.variant.is_piff() {
                        tenc.to_piff_atom()
                    } else {
                        tenc.to_atom()
                    }],
                ),
            ],
        );

        entry.add_child(sinf)?;
        entry.kind = if is_video { *b"encv" } else { *b"enca" };
        Ok((params, mapper))
    }

    fn mapper(&self, entry: &Atom, format: &FourCc) -> Result<Option<Box<dyn SubSampleMapper>>> {
        let Some(codec) = VideoCodec::from_format(format) else {
            return Ok(None);
        };

        let config = match codec {
            VideoCodec::Avc => entry.child(b"avcC").and_then(|x| x.payload()).map(|x| {
                AvcDecoderConfig::parse(x).map(|config| {
                    let mut parameter_sets = config.sequence_parameter_sets;
                    parameter_sets.extend(config.picture_parameter_sets);
                    (config.nalu_length_size, parameter_sets)
                })
            }),
            VideoCodec::Hevc => entry.child(b"hvcC").and_then(|x| x.payload()).map(|x| {
                HevcDecoderConfig::parse(x)
                    .map(|config| (config.nalu_length_size, config.nal_units))
            }),
        };

        let Some((nalu_length_size, parameter_sets)) = config.transpose()? else {
            warn!(
                "{} sample entry has no decoder configuration, samples are encrypted whole",
                entry
            );
            return Ok(None);
        };

        create_mapper(self.variant, nalu_length_size, codec, &parameter_sets).map(Some)
    }

    fn encrypt_fragment(
        &mut self,
        moof: &mut Atom,
        moof_start: u64,
        data: &mut [u8],
    ) -> Result<()> {
        let layouts = fragment_layout(moof, moof_start, data.len(), &self.trex)?;

        if layouts.iter().any(|x| x.base == DataBase::Explicit) {
            return Err(Error::not_supported(
                "encrypting fragments with an explicit base data offset",
            ));
        }

        let is_mpeg = !self.variant.is_piff();
        let original_size = moof.size() as i64;
        let mut moof_based = Vec::with_capacity(layouts.len());
        let mut rebased = Vec::with_capacity(layouts.len());
        let mut aux_trafs = Vec::new();

        let trafs = moof
            .children_mut()?
            .iter_mut()
            .enumerate()
            .filter(|(_, x)| x.is(b"traf"));

        for ((child_index, traf), layout) in trafs.zip(&layouts) {
            let was_moof_based = layout.base == DataBase::Moof;
            let Some(track) = self.tracks.get_mut(&layout.tfhd.track_id) else {
                moof_based.push(was_moof_based);
                rebased.push(false);
                continue;
            };

            let mut tfhd = layout.tfhd.clone();

            if track.clear_lead_remaining > 0 {
                track.clear_lead_remaining -= 1;
                tfhd.set_sample_description_index(
                    layout.sample_description_index + track.clear_description_offset,
                );
                trace!(
                    "track {} fragment at {} left in the clear",
                    tfhd.track_id, moof_start
                );
            } else {
                let table = encrypt_samples(track, &layout.samples, data)?;
                let senc = table.to_senc()?;

                if is_mpeg {
                    let mut saiz = SaizBox::new();

                    for index in 0..table.sample_count() {
                        let size = table.sample_info_size(index)?;
                        saiz.add_sample_info_size(u8::try_from(size).map_err(|_| {
                            Error::not_supported(format!(
                                "{} byte sample auxiliary information",
                                size
                            ))
                        })?);
                    }

                    traf.add_child(saiz.to_atom())?;
                    traf.add_child(SaioBox::new(0).to_atom())?;
                    traf.add_child(senc.to_atom())?;

                    if self.options.piff_compatible {
                        traf.add_child(senc.to_piff_atom())?;
                    }

                    tfhd.flags |= TfhdBox::FLAG_DEFAULT_BASE_IS_MOOF;
                    aux_trafs.push(child_index);
                } else {
                    traf.add_child(senc.to_piff_atom())?;
                }

                trace!(
                    "track {} fragment at {} has {} encrypted samples",
                    tfhd.track_id,
                    moof_start,
                    table.sample_count()
                );
            }

            let is_moof_based = tfhd.default_base_is_moof() || was_moof_based;
            moof_based.push(is_moof_based);
            rebased.push(is_moof_based && !was_moof_based);

            if let Some(child) = traf.child_mut(&TfhdBox::KIND) {
                *child = tfhd.to_atom();
            }
        }

        // reserve the data offsets first, their presence changes the moof size
        for (index, traf) in moof_traf_iter(moof)?.enumerate() {
            if moof_based[index] {
                rewrite_data_offsets(traf, |_, x| {
                    Ok((x.is_some() || rebased[index]).then_some(0))
                })?;
            }
        }

        let growth = moof.size() as i64 - original_size;

        for (index, traf) in moof_traf_iter(moof)?.enumerate() {
            if moof_based[index] {
                let run_starts = &layouts[index].run_starts;
                rewrite_data_offsets(traf, |run, x| match x {
                    Some(_) => Ok(Some(to_data_offset(run_starts[run] + growth)?)),
                    None => Ok(None),
                })?;
            }
        }

        for child_index in aux_trafs {
            let traf = &moof.children()[child_index];
            let senc_index = traf
                .children()
                .iter()
                .position(|x| x.is(&SencBox::KIND))
                .ok_or_else(|| Error::internal("senc box went missing"))?;
            let offset = moof.offset_of_child(child_index)
                + traf.offset_of_child(senc_index)
                + SencBox::sample_info_offset(&traf.children()[senc_index])?;

            if offset > u32::MAX as u64 {
                return Err(Error::not_supported("moof boxes larger than 4 GiB"));
            }

            let traf = &mut moof.children_mut()?[child_index];

            if let Some(saio) = traf.child_mut(&SaioBox::KIND) {
                *saio = SaioBox::new(offset).to_atom();
            }
        }

        Ok(())
    }
}

fn moof_traf_iter(moof: &mut Atom) -> Result<impl Iterator<Item = &mut Atom>> {
    Ok(moof.children_mut()?.iter_mut().filter(|x| x.is(b"traf")))
}

/// Encrypt the samples of one track fragment in place.
fn encrypt_samples(
    track: &mut TrackEncrypter,
    samples: &[(usize, usize)],
    data: &mut [u8],
) -> Result<SampleInfoTable> {
    let has_subsamples = track.encrypter.has_subsamples();
    let mut table = SampleInfoTable::new(
        if has_subsamples {
            SencBox::FLAG_USE_SUBSAMPLE_ENCRYPTION as u8
        } else {
            0
        },
        track.params.crypt_byte_block,
        track.params.skip_byte_block,
        samples.len() as u32,
        track.params.iv_size,
    );

    for (index, (offset, size)) in samples.iter().enumerate() {
        let range = *offset..*offset + *size;
        let sample = track.encrypter.encrypt_sample_data(&data[range.clone()])?;
        data[range].copy_from_slice(&sample.data);
        table.set_iv(index as u32, &sample.iv)?;

        if has_subsamples {
            let (count, info) = sample
                .info
                .split_first_chunk::<2>()
                .ok_or_else(|| Error::internal("subsample information has no count"))?;
            table.add_subsample_data(u16::from_be_bytes(*count), info)?;
        }
    }

    Ok(table)
}

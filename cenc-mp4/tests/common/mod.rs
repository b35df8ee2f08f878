//! Synthetic fragmented mp4 files.

#![allow(dead_code)]

use cenc_mp4::{
    Atom, parse_atoms,
    boxes::{TrunBox, TrunSample, TypedBox},
    write_atoms,
};

pub const VIDEO_KID: &str = "eb676abbcb345e96bbcf616630f1a3da";
pub const VIDEO_KEY: &str = "100b6c20940f779a4589152b57d2dacb";
pub const VIDEO_IV: &str = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff";
pub const AUDIO_KID: &str = "63cb5f7184dd4b689a5c5ff11ee6a328";
pub const AUDIO_KEY: &str = "3bda3329158a4789880816a70e7e436d";
pub const AUDIO_IV: &str = "0a610676cb88f302";

// Baseline profile 320x240 with frame_mbs_only, pic_order_cnt_type 0,
// log2_max_frame_num 4 and log2_max_pic_order_cnt_lsb 4.
const SPS: [u8; 8] = [0x67, 0x42, 0x00, 0x1E, 0xF6, 0x0A, 0x0F, 0xC8];
const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];
// IDR slice header of 3 bytes after the NAL unit header.
const IDR_SLICE_HEADER: [u8; 4] = [0x65, 0x88, 0x84, 0x0F];
const SEI: [u8; 8] = [0x06, 0x05, 0x04, 0x01, 0x02, 0x03, 0x04, 0x80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A clear fragmented file with one `moof`/`mdat` pair per fragment. Track
/// IDs start at 1 in the order the tracks are given.
pub struct Fixture {
    pub init: Vec<u8>,
    pub segments: Vec<Vec<u8>>,
}

impl Fixture {
    pub fn new(tracks: &[TrackKind], fragments: usize, samples_per_fragment: usize) -> Self {
        let init = write_atoms(&[ftyp(), moov(tracks)]);
        let segments = (0..fragments)
            .map(|fragment| {
                let samples = tracks
                    .iter()
                    .map(|kind| {
                        (0..samples_per_fragment)
                            .map(|index| sample(*kind, fragment * samples_per_fragment + index))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>();
                segment(fragment as u32 + 1, &samples)
            })
            .collect();

        Self { init, segments }
    }

    pub fn file(&self) -> Vec<u8> {
        let mut file = self.init.clone();

        for segment in &self.segments {
            file.extend_from_slice(segment);
        }

        file
    }
}

fn ftyp() -> Atom {
    let mut payload = b"isom".to_vec();
    payload.extend_from_slice(&0x200u32.to_be_bytes());
    payload.extend_from_slice(b"isomavc1");
    Atom::leaf(b"ftyp", payload)
}

fn moov(tracks: &[TrackKind]) -> Atom {
    let mut children = vec![Atom::full(b"mvhd", 0, 0, &[0; 96])];
    let mut trex = Vec::new();

    for (index, kind) in tracks.iter().enumerate() {
        let track_id = index as u32 + 1;
        children.push(trak(track_id, *kind));

        let mut payload = track_id.to_be_bytes().to_vec();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&[0; 12]);
        trex.push(Atom::full(b"trex", 0, 0, &payload));
    }

    children.push(Atom::container(b"mvex", trex));
    Atom::container(b"moov", children)
}

fn trak(track_id: u32, kind: TrackKind) -> Atom {
    let mut tkhd = vec![0; 8];
    tkhd.extend_from_slice(&track_id.to_be_bytes());
    tkhd.extend_from_slice(&[0; 68]);

    let mut hdlr = vec![0; 4];
    hdlr.extend_from_slice(match kind {
        TrackKind::Video => b"vide",
        TrackKind::Audio => b"soun",
    });
    hdlr.extend_from_slice(&[0; 12]);
    hdlr.extend_from_slice(b"handler\0");

    let mut stsd = Atom::container(b"stsd", vec![sample_entry(kind)]);
    set_prefix(&mut stsd, vec![0, 0, 0, 0, 0, 0, 0, 1]);

    let stbl = Atom::container(
        b"stbl",
        vec![
            stsd,
            Atom::full(b"stts", 0, 0, &[0; 4]),
            Atom::full(b"stsc", 0, 0, &[0; 4]),
            Atom::full(b"stsz", 0, 0, &[0; 8]),
            Atom::full(b"stco", 0, 0, &[0; 4]),
        ],
    );

    Atom::container(
        b"trak",
        vec![
            Atom::full(b"tkhd", 0, 3, &tkhd),
            Atom::container(
                b"mdia",
                vec![
                    Atom::full(b"mdhd", 0, 0, &[0; 20]),
                    Atom::full(b"hdlr", 0, 0, &hdlr),
                    Atom::container(b"minf", vec![stbl]),
                ],
            ),
        ],
    )
}

fn sample_entry(kind: TrackKind) -> Atom {
    match kind {
        TrackKind::Video => {
            let mut avcc = vec![1, 0x42, 0, 0x1E, 0xFF, 0xE1];
            avcc.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
            avcc.extend_from_slice(&SPS);
            avcc.push(1);
            avcc.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
            avcc.extend_from_slice(&PPS);

            let mut prefix = vec![0; 78];
            prefix[7] = 1;
            prefix[24..28].copy_from_slice(&[0x01, 0x40, 0x00, 0xF0]);
            prefix[75] = 0x18;
            prefix[76..78].copy_from_slice(&[0xFF, 0xFF]);

            let mut entry = Atom::container(b"avc1", vec![Atom::leaf(b"avcC", avcc)]);
            set_prefix(&mut entry, prefix);
            entry
        }
        TrackKind::Audio => {
            let mut prefix = vec![0; 28];
            prefix[7] = 1;
            prefix[17] = 2;
            prefix[19] = 16;
            prefix[24..26].copy_from_slice(&48000u16.to_be_bytes());

            let mut entry = Atom::container(
                b"mp4a",
                vec![Atom::full(b"esds", 0, 0, &[0x03, 0x80, 0x80, 0x80, 0x00])],
            );
            set_prefix(&mut entry, prefix);
            entry
        }
    }
}

fn set_prefix(atom: &mut Atom, prefix: Vec<u8>) {
    if let Some(x) = atom.prefix_mut() {
        *x = prefix;
    }
}

/// Sample `index` of a track. Video samples are an SEI NAL unit followed by
/// an IDR slice, both with 4 byte lengths.
pub fn sample(kind: TrackKind, index: usize) -> Vec<u8> {
    match kind {
        TrackKind::Video => {
            let mut slice = IDR_SLICE_HEADER.to_vec();
            slice.extend((0..200 + index * 37).map(|x| ((x * 7 + index * 31) % 255 + 1) as u8));

            let mut sample = Vec::new();
            for nalu in [&SEI[..], &slice] {
                sample.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
                sample.extend_from_slice(nalu);
            }
            sample
        }
        TrackKind::Audio => {
            let size = [7, 100, 113, 256, 16][index % 5] + index;
            (0..size).map(|x| (x * 13 + index) as u8).collect()
        }
    }
}

/// `moof` and `mdat` of one fragment. The first track fragment points at the
/// `mdat` data with a moof relative data offset, the ones after it follow on.
fn segment(sequence_number: u32, samples: &[Vec<Vec<u8>>]) -> Vec<u8> {
    let moof = |data_offset: i32| {
        let mut children = vec![Atom::full(b"mfhd", 0, 0, &sequence_number.to_be_bytes())];

        for (index, track_samples) in samples.iter().enumerate() {
            let trun = TrunBox {
                version: 0,
                flags: TrunBox::FLAG_SAMPLE_SIZE_PRESENT,
                data_offset: (index == 0).then_some(data_offset),
                first_sample_flags: None,
                samples: track_samples
                    .iter()
                    .map(|x| TrunSample {
                        sample_size: Some(x.len() as u32),
                        ..Default::default()
                    })
                    .collect(),
            };

            children.push(Atom::container(
                b"traf",
                vec![
                    Atom::full(b"tfhd", 0, 0, &(index as u32 + 1).to_be_bytes()),
                    trun.to_atom(),
                ],
            ));
        }

        Atom::container(b"moof", children)
    };

    let moof_size = moof(0).size() as i32;
    let mdat = Atom::leaf(b"mdat", samples.iter().flatten().flatten().copied().collect());
    write_atoms(&[moof(moof_size + 8), mdat])
}

/// Top level boxes of `data` with the given type.
pub fn top_level(data: &[u8], kind: &[u8; 4]) -> Vec<Atom> {
    parse_atoms(data)
        .unwrap()
        .into_iter()
        .filter(|x| x.is(kind))
        .collect()
}

pub fn mdat_payloads(data: &[u8]) -> Vec<Vec<u8>> {
    top_level(data, b"mdat")
        .iter()
        .map(|x| x.payload().unwrap().to_vec())
        .collect()
}

mod common;

use cenc_mp4::{
    CencDecryptingProcessor, CencEncryptingProcessor, CencVariant, EncryptOptions,
    boxes::{SaioBox, SencBox, TencBox, TfhdBox, TrunBox, TypedBox},
    parse_atoms,
};
use common::{
    AUDIO_IV, AUDIO_KEY, AUDIO_KID, Fixture, TrackKind, VIDEO_IV, VIDEO_KEY, VIDEO_KID,
    mdat_payloads, top_level,
};
use std::{error::Error, fs, path::PathBuf, sync::LazyLock};

static AUDIO_VIDEO: LazyLock<Fixture> =
    LazyLock::new(|| Fixture::new(&[TrackKind::Video, TrackKind::Audio], 3, 4));

static OUTPUT_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target/cenc-mp4-tests");
    fs::create_dir_all(&dir).ok();
    dir
});

fn encrypter(
    variant: CencVariant,
    options: EncryptOptions,
) -> Result<CencEncryptingProcessor, Box<dyn Error>> {
    Ok(CencEncryptingProcessor::builder(variant)
        .key(1, VIDEO_KEY, VIDEO_IV)?
        .kid(1, VIDEO_KID)?
        .key(2, AUDIO_KEY, AUDIO_IV)?
        .kid(2, AUDIO_KID)?
        .options(options)
        .build()?)
}

fn decrypter() -> Result<CencDecryptingProcessor, Box<dyn Error>> {
    Ok(CencDecryptingProcessor::builder()
        .key(VIDEO_KID, VIDEO_KEY)?
        .key(AUDIO_KID, AUDIO_KEY)?
        .build()?)
}

/// Every first track run of the output must start at the payload of the
/// `mdat` which follows its `moof`.
fn assert_data_offsets(data: &[u8]) {
    for moof in top_level(data, b"moof") {
        let trun = TrunBox::from_child(moof.find("traf").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(trun.data_offset, Some(moof.size() as i32 + 8));
    }
}

macro_rules! round_trip {
    ($test_name: ident, $variant: expr, $options: expr) => {
        #[test]
        fn $test_name() -> Result<(), Box<dyn Error>> {
            let clear = AUDIO_VIDEO.file();
            let encrypted = encrypter($variant, $options)?.encrypt(&clear)?;

            let encrypted_mdats = mdat_payloads(&encrypted);
            let clear_mdats = mdat_payloads(&clear);
            assert_eq!(encrypted_mdats.len(), clear_mdats.len());
            assert_ne!(encrypted_mdats, clear_mdats);
            assert_data_offsets(&encrypted);

            let decrypted = decrypter()?.decrypt(&encrypted, None)?;
            assert_eq!(mdat_payloads(&decrypted), clear_mdats);
            assert_eq!(top_level(&decrypted, b"moov"), top_level(&clear, b"moov"));
            assert_data_offsets(&decrypted);

            fs::write(
                OUTPUT_DIR.join(concat!(stringify!($test_name), ".mp4")),
                &encrypted,
            )?;
            Ok(())
        }
    };
}

round_trip!(test_piff_ctr, CencVariant::PiffCtr, EncryptOptions::default());
round_trip!(test_piff_cbc, CencVariant::PiffCbc, EncryptOptions::default());
round_trip!(test_mpeg_cenc, CencVariant::MpegCenc, EncryptOptions::default());
round_trip!(test_mpeg_cbc1, CencVariant::MpegCbc1, EncryptOptions::default());
round_trip!(test_mpeg_cens, CencVariant::MpegCens, EncryptOptions::default());
round_trip!(test_mpeg_cbcs, CencVariant::MpegCbcs, EncryptOptions::default());

round_trip!(
    test_piff_ctr_16_byte_iv,
    CencVariant::PiffCtr,
    EncryptOptions {
        piff_iv_size_16: true,
        ..Default::default()
    }
);

round_trip!(
    test_mpeg_cenc_8_byte_iv,
    CencVariant::MpegCenc,
    EncryptOptions {
        iv_size_8: true,
        ..Default::default()
    }
);

round_trip!(
    test_mpeg_cenc_piff_compatible,
    CencVariant::MpegCenc,
    EncryptOptions {
        piff_compatible: true,
        ..Default::default()
    }
);

#[test]
fn test_segments_with_separate_init() -> Result<(), Box<dyn Error>> {
    let mut encrypter = encrypter(CencVariant::MpegCbcs, EncryptOptions::default())?;
    let init = encrypter.encrypt_init(&AUDIO_VIDEO.init)?;
    let segments = AUDIO_VIDEO
        .segments
        .iter()
        .map(|x| encrypter.encrypt_segment(x))
        .collect::<Result<Vec<_>, _>>()?;

    let ftyp = top_level(&init, b"ftyp");
    assert!(ftyp[0].payload().unwrap().ends_with(b"iso6"));

    let moov = &top_level(&init, b"moov")[0];
    let schi = moov
        .find("trak/mdia/minf/stbl/stsd/encv/sinf/schi")
        .unwrap();
    let tenc = TencBox::from_schi(schi)?.unwrap();
    assert_eq!(tenc.version, 1);
    assert_eq!(tenc.default_per_sample_iv_size, 0);
    assert_eq!(
        (tenc.default_crypt_byte_block, tenc.default_skip_byte_block),
        (1, 9)
    );
    assert_eq!(tenc.default_constant_iv.as_deref(), Some(&hex::decode(VIDEO_IV)?[..]));
    assert_eq!(tenc.default_kid_hex(), VIDEO_KID);

    let decrypter = decrypter()?;
    assert_eq!(
        top_level(&decrypter.decrypt_init(&init)?, b"moov"),
        top_level(&AUDIO_VIDEO.init, b"moov")
    );

    for (segment, clear) in segments.iter().zip(&AUDIO_VIDEO.segments) {
        let decrypted = decrypter.decrypt(segment, Some(&init))?;
        assert_eq!(mdat_payloads(&decrypted), mdat_payloads(clear));
    }

    Ok(())
}

#[test]
fn test_iv_carries_across_fragments() -> Result<(), Box<dyn Error>> {
    let encrypted = encrypter(CencVariant::MpegCenc, EncryptOptions::default())?
        .encrypt(&AUDIO_VIDEO.file())?;
    let mut ivs = Vec::new();

    for moof in top_level(&encrypted, b"moof") {
        let senc = SencBox::from_child(moof.find("traf").unwrap())?.unwrap();
        for sample in senc.samples(16)? {
            ivs.push(u128::from_be_bytes(sample.iv.try_into().unwrap()));
        }
    }

    // every video sample has encrypted blocks, so the counter only grows
    assert_eq!(ivs.len(), 12);
    assert_eq!(ivs[0], u128::from_str_radix(VIDEO_IV, 16)?);
    assert!(ivs.windows(2).all(|x| x[1] > x[0]));
    Ok(())
}

#[test]
fn test_clear_lead() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new(&[TrackKind::Video], 3, 2);
    let mut encrypter = CencEncryptingProcessor::builder(CencVariant::MpegCenc)
        .key(1, VIDEO_KEY, VIDEO_IV)?
        .kid(1, VIDEO_KID)?
        .clear_lead(1, 2)
        .build()?;
    let encrypted = encrypter.encrypt(&fixture.file())?;

    let stsd = top_level(&encrypted, b"moov")[0]
        .find("trak/mdia/minf/stbl/stsd")
        .unwrap()
        .clone();
    let kinds = stsd.children().iter().map(|x| x.kind).collect::<Vec<_>>();
    assert_eq!(kinds, vec![*b"encv", *b"avc1"]);
    assert_eq!(&stsd.prefix()[4..], &2u32.to_be_bytes());

    let clear_mdats = mdat_payloads(&fixture.file());
    let encrypted_mdats = mdat_payloads(&encrypted);
    assert_eq!(encrypted_mdats[..2], clear_mdats[..2]);
    assert_ne!(encrypted_mdats[2], clear_mdats[2]);

    let mut moofs = Vec::new();
    let atoms = parse_atoms(&encrypted)?;
    let mut position = 0;

    for atom in &atoms {
        if atom.is(b"moof") {
            moofs.push((position, atom.clone()));
        }
        position += atom.size() as usize;
    }

    for (moof_start, moof) in &moofs[..2] {
        let traf = moof.find("traf").unwrap();
        let tfhd = TfhdBox::from_child(traf)?.unwrap();
        assert_eq!(tfhd.sample_description_index, Some(2));
        assert!(traf.child(b"senc").is_none(), "clear fragment at {}", moof_start);
    }

    // the saio offset points at the first IV of the sample encryption box
    let (moof_start, moof) = &moofs[2];
    let traf = moof.find("traf").unwrap();
    let saio = SaioBox::from_child(traf)?.unwrap();
    let senc = SencBox::from_child(traf)?.unwrap();
    let first_iv = &senc.samples(16)?[0].iv;
    let offset = moof_start + saio.offsets[0] as usize;
    assert_eq!(&encrypted[offset..offset + 16], &first_iv[..]);
    assert_eq!(&first_iv[..], &hex::decode(VIDEO_IV)?[..]);

    let decrypted = decrypter()?.decrypt(&encrypted, None)?;
    assert_eq!(mdat_payloads(&decrypted), clear_mdats);
    Ok(())
}

#[test]
fn test_sample_auxiliary_information_fallback() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new(&[TrackKind::Audio], 1, 5);
    let mut encrypter = CencEncryptingProcessor::builder(CencVariant::MpegCbc1)
        .key(1, AUDIO_KEY, VIDEO_IV)?
        .kid(1, AUDIO_KID)?
        .build()?;
    let mut encrypted = encrypter.encrypt(&fixture.file())?;

    // break the sample count of the senc box, same size so saio stays valid
    let mut position = 0;
    for atom in parse_atoms(&encrypted)? {
        if atom.is(b"moof") {
            let traf_index = atom.children().iter().position(|x| x.is(b"traf")).unwrap();
            let traf = &atom.children()[traf_index];
            let senc_index = traf.children().iter().position(|x| x.is(b"senc")).unwrap();
            let count = position
                + (atom.offset_of_child(traf_index) + traf.offset_of_child(senc_index)) as usize
                + 12;
            encrypted[count..count + 4].copy_from_slice(&1000u32.to_be_bytes());
        }
        position += atom.size() as usize;
    }

    let decrypted = CencDecryptingProcessor::builder()
        .track_key(1, AUDIO_KEY)?
        .build()?
        .decrypt(&encrypted, None)?;
    assert_eq!(mdat_payloads(&decrypted), mdat_payloads(&fixture.file()));
    Ok(())
}

#[test]
fn test_track_without_key_stays_encrypted() -> Result<(), Box<dyn Error>> {
    let encrypted = encrypter(CencVariant::MpegCenc, EncryptOptions::default())?
        .encrypt(&AUDIO_VIDEO.file())?;
    let decrypted = CencDecryptingProcessor::builder()
        .key("00000000000000000000000000000001", VIDEO_KEY)?
        .build()?
        .decrypt(&encrypted, None)?;
    assert_eq!(decrypted, encrypted);
    Ok(())
}

#[test]
fn test_decrypt_file_to_file() -> Result<(), Box<dyn Error>> {
    let mut encrypter = encrypter(CencVariant::MpegCens, EncryptOptions::default())?;
    let init = encrypter.encrypt_init(&AUDIO_VIDEO.init)?;
    let segment = encrypter.encrypt_segment(&AUDIO_VIDEO.segments[0])?;

    let init_path = OUTPUT_DIR.join("cens_init.mp4");
    let segment_path = OUTPUT_DIR.join("cens_1.m4s");
    let output_path = OUTPUT_DIR.join("cens_1_dec.m4s");
    fs::write(&init_path, init)?;
    fs::write(&segment_path, segment)?;

    let size = decrypter()?.decrypt_file_to_file(&segment_path, Some(&init_path), &output_path)?;
    let decrypted = fs::read(&output_path)?;
    assert_eq!(size, decrypted.len());
    assert_eq!(mdat_payloads(&decrypted), mdat_payloads(&AUDIO_VIDEO.segments[0]));
    Ok(())
}

#[test]
fn test_encrypt_requires_fragments() -> Result<(), Box<dyn Error>> {
    let mut encrypter = encrypter(CencVariant::MpegCenc, EncryptOptions::default())?;
    let mut moov = top_level(&AUDIO_VIDEO.init, b"moov").remove(0);
    moov.remove_child(b"mvex");

    let result = encrypter.encrypt(&moov.to_bytes());
    assert!(result.unwrap_err().is_not_supported());
    Ok(())
}

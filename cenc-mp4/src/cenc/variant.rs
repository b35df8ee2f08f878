use crate::{Error, FourCc, Result};
use std::{fmt, str::FromStr};

pub(crate) const SCHEME_VERSION_MPEG: u32 = 0x00010000;
pub(crate) const SCHEME_VERSION_PIFF_10: u32 = 0x00010000;
pub(crate) const SCHEME_VERSION_PIFF_11: u32 = 0x00010001;

/// PIFF track encryption algorithm ids.
pub(crate) const ALGORITHM_ID_NONE: u32 = 0;
pub(crate) const ALGORITHM_ID_CTR: u32 = 1;
pub(crate) const ALGORITHM_ID_CBC: u32 = 2;

/// Block cipher chaining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CipherMode {
    Ctr,
    Cbc,
}

/// The flavours of common encryption which can be produced and consumed.
///
/// | Variant | Scheme | Cipher | Default IV | Video pattern |
/// |---------|--------|--------|------------|---------------|
/// | `piff-ctr` | `piff` | AES-128-CTR | 8 bytes | - |
/// | `piff-cbc` | `piff` | AES-128-CBC | 16 bytes | - |
/// | `mpeg-cenc` | `cenc` | AES-128-CTR | 16 bytes | - |
/// | `mpeg-cbc1` | `cbc1` | AES-128-CBC | 16 bytes | - |
/// | `mpeg-cens` | `cens` | AES-128-CTR | 16 bytes | 1:9 |
/// | `mpeg-cbcs` | `cbcs` | AES-128-CBC | constant | 1:9 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CencVariant {
    PiffCtr,
    PiffCbc,
    MpegCenc,
    MpegCbc1,
    MpegCens,
    MpegCbcs,
}

/// Switches which alter the boxes and IVs produced by the encrypting processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EncryptOptions {
    /// Also write a PIFF `uuid` sample encryption box next to `senc`.
    pub piff_compatible: bool,
    /// Use 8 byte IVs for the CTR based MPEG variants.
    pub iv_size_8: bool,
    /// Use 16 byte IVs for `piff-ctr`.
    pub piff_iv_size_16: bool,
}

impl CencVariant {
    pub const ALL: [CencVariant; 6] = [
        Self::PiffCtr,
        Self::PiffCbc,
        Self::MpegCenc,
        Self::MpegCbc1,
        Self::MpegCens,
        Self::MpegCbcs,
    ];

    pub fn mode(&self) -> CipherMode {
        match self {
            Self::PiffCtr | Self::MpegCenc | Self::MpegCens => CipherMode::Ctr,
            Self::PiffCbc | Self::MpegCbc1 | Self::MpegCbcs => CipherMode::Cbc,
        }
    }

    pub fn is_piff(&self) -> bool {
        matches!(self, Self::PiffCtr | Self::PiffCbc)
    }

    /// Scheme type written to `schm`.
    pub fn scheme_type(&self) -> FourCc {
        match self {
            Self::PiffCtr | Self::PiffCbc => *b"piff",
            Self::MpegCenc => *b"cenc",
            Self::MpegCbc1 => *b"cbc1",
            Self::MpegCens => *b"cens",
            Self::MpegCbcs => *b"cbcs",
        }
    }

    pub fn scheme_version(&self) -> u32 {
        if self.is_piff() {
            SCHEME_VERSION_PIFF_11
        } else {
            SCHEME_VERSION_MPEG
        }
    }

    /// PIFF algorithm id matching the cipher mode.
    pub fn algorithm_id(&self) -> u32 {
        match self.mode() {
            CipherMode::Ctr => ALGORITHM_ID_CTR,
            CipherMode::Cbc => ALGORITHM_ID_CBC,
        }
    }

    /// Size of the IVs stored per sample, zero when a constant IV is signalled instead.
    pub fn default_iv_size(&self, options: &EncryptOptions) -> u8 {
        match self {
            Self::PiffCtr if options.piff_iv_size_16 => 16,
            Self::PiffCtr => 8,
            Self::MpegCenc | Self::MpegCens if options.iv_size_8 => 8,
            Self::MpegCbcs => 0,
            _ => 16,
        }
    }

    /// Crypt and skip byte blocks for a track.
    pub fn pattern(&self, is_video: bool) -> (u8, u8) {
        match self {
            Self::MpegCens | Self::MpegCbcs if is_video => (1, 9),
            _ => (0, 0),
        }
    }

    /// Parameters used to encrypt the samples of a track.
    pub fn cipher_params(&self, is_video: bool, options: &EncryptOptions) -> Result<CipherParams> {
        let (crypt_byte_block, skip_byte_block) = self.pattern(is_video);
        let constant_iv = *self == Self::MpegCbcs;

        CipherParams::new(
            self.mode(),
            self.default_iv_size(options),
            crypt_byte_block,
            skip_byte_block,
            constant_iv,
            constant_iv,
        )
    }

    /// Resolve the variant of a protected track from its `schm` box and, for
    /// PIFF, the algorithm id of its track encryption box.
    pub fn from_scheme(
        scheme_type: &FourCc,
        scheme_version: u32,
        algorithm_id: Option<u32>,
    ) -> Result<Self> {
        let variant = match scheme_type {
            b"piff"
                if matches!(
                    scheme_version,
                    SCHEME_VERSION_PIFF_10 | SCHEME_VERSION_PIFF_11
                ) =>
            {
                match algorithm_id {
                    Some(ALGORITHM_ID_CBC) => Self::PiffCbc,
                    // algorithm id 0 marks an unprotected track, it decrypts as a copy
                    Some(ALGORITHM_ID_CTR | ALGORITHM_ID_NONE) | None => Self::PiffCtr,
                    Some(x) => {
                        return Err(Error::not_supported(format!(
                            "piff algorithm id {} is unknown",
                            x
                        )));
                    }
                }
            }
            b"cenc" if scheme_version == SCHEME_VERSION_MPEG => Self::MpegCenc,
            b"cbc1" if scheme_version == SCHEME_VERSION_MPEG => Self::MpegCbc1,
            b"cens" if scheme_version == SCHEME_VERSION_MPEG => Self::MpegCens,
            b"cbcs" if scheme_version == SCHEME_VERSION_MPEG => Self::MpegCbcs,
            _ => {
                return Err(Error::not_supported(format!(
                    "protection scheme {} version {:#010x}",
                    String::from_utf8_lossy(scheme_type),
                    scheme_version
                )));
            }
        };

        Ok(variant)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PiffCtr => "piff-ctr",
            Self::PiffCbc => "piff-cbc",
            Self::MpegCenc => "mpeg-cenc",
            Self::MpegCbc1 => "mpeg-cbc1",
            Self::MpegCens => "mpeg-cens",
            Self::MpegCbcs => "mpeg-cbcs",
        }
    }
}

impl fmt::Display for CencVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CencVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|x| x.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::invalid_parameters(format!("unknown encryption variant {}", s)))
    }
}

/// How the samples of one track are ciphered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CipherParams {
    pub mode: CipherMode,
    /// Per sample IV size, 0 when a constant IV is used.
    pub iv_size: u8,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub constant_iv: bool,
    pub reset_iv_per_subsample: bool,
}

impl CipherParams {
    pub fn new(
        mode: CipherMode,
        iv_size: u8,
        crypt_byte_block: u8,
        skip_byte_block: u8,
        constant_iv: bool,
        reset_iv_per_subsample: bool,
    ) -> Result<Self> {
        if !matches!(iv_size, 0 | 8 | 16) {
            return Err(Error::invalid_parameters(format!(
                "IV size {} is not one of 0, 8 or 16",
                iv_size
            )));
        }

        if crypt_byte_block > 15 || skip_byte_block > 15 {
            return Err(Error::invalid_parameters(format!(
                "pattern {}:{} does not fit in four bits",
                crypt_byte_block, skip_byte_block
            )));
        }

        if (crypt_byte_block == 0) != (skip_byte_block == 0) {
            return Err(Error::invalid_parameters(format!(
                "pattern {}:{} must have both or neither block counts set",
                crypt_byte_block, skip_byte_block
            )));
        }

        Ok(Self {
            mode,
            iv_size,
            crypt_byte_block,
            skip_byte_block,
            constant_iv,
            reset_iv_per_subsample,
        })
    }

    pub fn has_pattern(&self) -> bool {
        self.crypt_byte_block != 0
    }
}

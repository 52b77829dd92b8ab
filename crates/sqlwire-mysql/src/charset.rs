//! Collation ids, charset names and text decoding.
//!
//! Every column and the session itself carry a collation id. The id maps to a
//! charset name, and the charset name maps to an [`Encoding`]. Unknown ids are
//! an error; nothing falls back to a default charset.

use sqlwire_core::Result;
use sqlwire_core::error::{DecodeError, DecodeErrorKind};

pub const LATIN1_SWEDISH_CI: u16 = 8;
pub const UTF8MB3_GENERAL_CI: u16 = 33;
pub const UTF8MB4_GENERAL_CI: u16 = 45;
pub const BINARY_COLLATION: u16 = 63;
pub const UTF8MB4_UNICODE_CI: u16 = 224;
pub const UTF8MB4_0900_AI_CI: u16 = 255;

/// Charset name for a collation id.
pub fn charset_for_collation(id: u16) -> Option<&'static str> {
    let name = match id {
        1 | 84 => "big5",
        2 | 9 | 21 | 27 | 77 => "latin2",
        3 | 69 => "dec8",
        4 | 80 => "cp850",
        5 | 8 | 15 | 31 | 47 | 48 | 49 | 94 => "latin1",
        6 | 72 => "hp8",
        7 | 74 => "koi8r",
        10 | 82 => "swe7",
        11 | 65 => "ascii",
        12 | 91 => "ujis",
        13 | 88 => "sjis",
        14 | 23 | 50 | 51 | 52 => "cp1251",
        16 | 71 => "hebrew",
        18 | 89 => "tis620",
        19 | 85 => "euckr",
        20 | 41 | 42 | 79 => "latin7",
        22 | 75 => "koi8u",
        24 | 86 => "gb2312",
        25 | 70 => "greek",
        26 | 34 | 44 | 66 | 99 => "cp1250",
        28 | 87 => "gbk",
        29 | 58 | 59 => "cp1257",
        30 | 78 => "latin5",
        32 | 64 => "armscii8",
        33 | 76 | 83 | 192..=215 | 223 => "utf8mb3",
        35 | 90 | 128..=151 | 159 => "ucs2",
        36 | 68 => "cp866",
        37 | 73 => "keybcs2",
        38 | 43 => "macce",
        39 | 53 => "macroman",
        40 | 81 => "cp852",
        45 | 46 | 224..=247 | 255..=323 => "utf8mb4",
        54 | 55 | 101..=124 => "utf16",
        56 | 62 => "utf16le",
        57 | 67 => "cp1256",
        60 | 61 | 160..=183 => "utf32",
        63 => "binary",
        92 | 93 => "geostd8",
        95 | 96 => "cp932",
        97 | 98 => "eucjpms",
        248..=250 => "gb18030",
        _ => return None,
    };
    Some(name)
}

/// How bytes of a charset become text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    /// Decoded as ISO-8859-1
    Latin1,
    Binary,
    Utf16Be,
    Utf16Le,
    Utf32Be,
    /// Known charset without a decoder here
    Other(&'static str),
}

impl Encoding {
    pub fn for_charset(charset: &'static str) -> Self {
        match charset {
            "utf8mb4" | "utf8mb3" | "utf8" => Encoding::Utf8,
            "ascii" => Encoding::Ascii,
            "latin1" => Encoding::Latin1,
            "binary" => Encoding::Binary,
            "ucs2" | "utf16" => Encoding::Utf16Be,
            "utf16le" => Encoding::Utf16Le,
            "utf32" => Encoding::Utf32Be,
            other => Encoding::Other(other),
        }
    }

    /// Resolve a collation id.
    pub fn for_collation(id: u16) -> Result<Self> {
        charset_for_collation(id)
            .map(Self::for_charset)
            .ok_or_else(|| {
                DecodeError::new(
                    DecodeErrorKind::UnknownCharset,
                    format!("unknown collation id {id}"),
                )
                .into()
            })
    }

    /// Standard name of the encoding.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Ascii => "US-ASCII",
            Encoding::Latin1 => "ISO-8859-1",
            Encoding::Binary => "binary",
            Encoding::Utf16Be => "UTF-16BE",
            Encoding::Utf16Le => "UTF-16LE",
            Encoding::Utf32Be => "UTF-32BE",
            Encoding::Other(charset) => match charset {
                "latin2" => "ISO-8859-2",
                "greek" => "ISO-8859-7",
                "hebrew" => "ISO-8859-8",
                "latin5" => "ISO-8859-9",
                "latin7" => "ISO-8859-13",
                "cp1250" => "windows-1250",
                "cp1251" => "windows-1251",
                "cp1256" => "windows-1256",
                "cp1257" => "windows-1257",
                "cp850" => "IBM850",
                "cp852" => "IBM852",
                "cp866" => "IBM866",
                "koi8r" => "KOI8-R",
                "koi8u" => "KOI8-U",
                "sjis" => "Shift_JIS",
                "cp932" => "Windows-31J",
                "ujis" => "EUC-JP",
                "eucjpms" => "EUC-JP",
                "euckr" => "EUC-KR",
                "big5" => "Big5",
                "gb2312" => "GB2312",
                "gbk" => "GBK",
                "gb18030" => "GB18030",
                "tis620" => "TIS-620",
                other => other,
            },
        }
    }

    /// Turn bytes in this encoding into a `String`.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 | Encoding::Binary => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| malformed(format!("invalid UTF-8: {e}"))),
            Encoding::Ascii => {
                if let Some(pos) = bytes.iter().position(|b| !b.is_ascii()) {
                    return Err(malformed(format!("non-ASCII byte at offset {pos}")));
                }
                Ok(bytes.iter().map(|&b| char::from(b)).collect())
            }
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Utf16Be | Encoding::Utf16Le => {
                if bytes.len() % 2 != 0 {
                    return Err(malformed("odd byte count for UTF-16 text"));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| {
                        if self == Encoding::Utf16Be {
                            u16::from_be_bytes([c[0], c[1]])
                        } else {
                            u16::from_le_bytes([c[0], c[1]])
                        }
                    })
                    .collect();
                String::from_utf16(&units).map_err(|e| malformed(format!("invalid UTF-16: {e}")))
            }
            Encoding::Utf32Be => {
                if bytes.len() % 4 != 0 {
                    return Err(malformed("byte count not a multiple of 4 for UTF-32 text"));
                }
                bytes
                    .chunks_exact(4)
                    .map(|c| {
                        let cp = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                        char::from_u32(cp)
                            .ok_or_else(|| malformed(format!("invalid code point U+{cp:X}")))
                    })
                    .collect()
            }
            Encoding::Other(charset) => Err(DecodeError::new(
                DecodeErrorKind::UnsupportedEncoding,
                format!("no decoder for charset '{charset}' ({})", self.name()),
            )
            .into()),
        }
    }
}

/// Decode `bytes` using the charset behind collation `collation`.
pub fn decode_text(bytes: &[u8], collation: u16) -> Result<String> {
    Encoding::for_collation(collation)?.decode(bytes)
}

fn malformed(message: impl Into<String>) -> sqlwire_core::Error {
    DecodeError::new(DecodeErrorKind::Malformed, message).into()
}

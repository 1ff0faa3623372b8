//! Portable track blobs.
//!
//! Tracks travel between the loader, the relay node and the persistence files as
//! base64 strings in the Lavaplayer message format (version 3). Relay nodes hand out
//! and accept the same blobs as `encoded`, so a track loaded remotely can be persisted
//! and replayed locally and the other way round.

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::time::Duration;
use thiserror::Error;

const TRACK_INFO_VERSIONED: u32 = 1;
const MESSAGE_VERSION: u8 = 3;
const MAX_UTF_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("track message truncated")]
    Truncated,
    #[error("declared message size {declared} exceeds payload of {actual} bytes")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("unsupported track message version {0}")]
    UnsupportedVersion(u8),
    #[error("track field is not valid UTF-8")]
    InvalidUtf8,
}

impl From<std::io::Error> for CodecError {
    fn from(_: std::io::Error) -> Self {
        CodecError::Truncated
    }
}

/// Metadata describing one playable item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub title: String,
    pub author: String,
    /// Length in milliseconds. Meaningless for streams.
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
    #[serde(default)]
    pub position: u64,
}

impl TrackInfo {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.length)
    }
}

/// A decoded track together with its portable blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub encoded: String,
    pub info: TrackInfo,
}

impl AudioTrack {
    /// Builds a track from metadata, producing the blob locally.
    pub fn from_info(info: TrackInfo) -> Self {
        let encoded = encode_info(&info);
        Self { encoded, info }
    }

    /// Decodes a blob produced by this module or by a relay node.
    pub fn decode(encoded: &str) -> Result<Self, CodecError> {
        let info = decode_info(encoded)?;
        Ok(Self {
            encoded: encoded.to_string(),
            info,
        })
    }

    /// Location handed to a local input: the uri when known, else the identifier.
    pub fn locator(&self) -> &str {
        self.info.uri.as_deref().unwrap_or(&self.info.identifier)
    }
}

pub fn encode_info(info: &TrackInfo) -> String {
    let mut body = Vec::with_capacity(128);
    body.push(MESSAGE_VERSION);
    put_utf(&mut body, &info.title);
    put_utf(&mut body, &info.author);
    body.extend_from_slice(&info.length.to_be_bytes());
    put_utf(&mut body, &info.identifier);
    body.push(u8::from(info.is_stream));
    put_opt_utf(&mut body, info.uri.as_deref());
    put_opt_utf(&mut body, info.artwork_url.as_deref());
    put_opt_utf(&mut body, info.isrc.as_deref());
    put_utf(&mut body, &info.source_name);
    body.extend_from_slice(&info.position.to_be_bytes());

    let header = (body.len() as u32) | (TRACK_INFO_VERSIONED << 30);
    let mut message = Vec::with_capacity(body.len() + 4);
    message.extend_from_slice(&header.to_be_bytes());
    message.extend_from_slice(&body);
    BASE64_STANDARD.encode(message)
}

pub fn decode_info(encoded: &str) -> Result<TrackInfo, CodecError> {
    let data = BASE64_STANDARD.decode(encoded.trim())?;
    let mut cursor = Cursor::new(data.as_slice());

    let header = cursor.read_u32::<BigEndian>()?;
    let flags = header >> 30;
    let declared = (header & 0x3FFF_FFFF) as usize;
    let actual = data.len() - 4;
    if declared > actual {
        return Err(CodecError::SizeMismatch { declared, actual });
    }
    let body = &data[4..4 + declared];
    let mut cursor = Cursor::new(body);

    let version = if flags & TRACK_INFO_VERSIONED != 0 {
        cursor.read_u8()?
    } else {
        1
    };
    if version == 0 || version > MESSAGE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let title = read_utf(&mut cursor)?;
    let author = read_utf(&mut cursor)?;
    let length = cursor.read_u64::<BigEndian>()?;
    let identifier = read_utf(&mut cursor)?;
    let is_stream = cursor.read_u8()? != 0;
    let uri = if version >= 2 {
        read_opt_utf(&mut cursor)?
    } else {
        None
    };
    let (artwork_url, isrc) = if version >= 3 {
        (read_opt_utf(&mut cursor)?, read_opt_utf(&mut cursor)?)
    } else {
        (None, None)
    };
    let source_name = read_utf(&mut cursor)?;

    // Source managers may append their own fields; the position is always last.
    let position = if body.len() >= cursor.position() as usize + 8 {
        let mut tail = &body[body.len() - 8..];
        tail.read_u64::<BigEndian>()?
    } else {
        0
    };

    Ok(TrackInfo {
        identifier,
        title,
        author,
        length,
        is_stream,
        uri,
        artwork_url,
        isrc,
        source_name,
        position,
    })
}

fn put_utf(buf: &mut Vec<u8>, value: &str) {
    let mut end = value.len().min(MAX_UTF_LEN);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &value.as_bytes()[..end];
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn put_opt_utf(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.push(1);
            put_utf(buf, value);
        }
        None => buf.push(0),
    }
}

fn read_utf(cursor: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let mut raw = vec![0u8; len];
    cursor.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

fn read_opt_utf(cursor: &mut Cursor<&[u8]>) -> Result<Option<String>, CodecError> {
    if cursor.read_u8()? != 0 {
        read_utf(cursor).map(Some)
    } else {
        Ok(None)
    }
}

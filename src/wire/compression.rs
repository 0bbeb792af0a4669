use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::str::FromStr;
use anyhow::bail;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Compression scheme applied to a message's full payload before chunking. The scheme's name
///  is declared in the message's start frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    #[default]
    Zlib,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
        }
    }

    pub fn compress(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(payload.to_vec()),
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2 + 16), flate2::Compression::default());
                encoder.write_all(payload)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// `max_len` bounds the decompressed size to protect against decompression bombs
    pub fn decompress(&self, payload: &[u8], max_len: usize) -> anyhow::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(payload.to_vec()),
            Compression::Zlib => {
                let mut result = Vec::with_capacity(payload.len() * 2);
                ZlibDecoder::new(payload)
                    .take(max_len as u64 + 1)
                    .read_to_end(&mut result)?;
                if result.len() > max_len {
                    bail!("decompressed payload exceeds the maximum message size of {} bytes", max_len);
                }
                Ok(result)
            }
        }
    }

    /// Compression is CPU bound, so larger payloads are moved off the async worker threads
    pub async fn compress_offloaded(self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        if self == Compression::None {
            return Ok(payload);
        }
        tokio::task::spawn_blocking(move || self.compress(&payload)).await?
    }

    pub async fn decompress_offloaded(self, payload: Vec<u8>, max_len: usize) -> anyhow::Result<Vec<u8>> {
        if self == Compression::None {
            return Ok(payload);
        }
        tokio::task::spawn_blocking(move || self.decompress(&payload, max_len)).await?
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            other => bail!("unknown compression scheme {:?}", other),
        }
    }
}

use anyhow::{Context, Result};
use rand::RngCore;

use crate::message::Request;
use crate::template;

/// Where the opaque metadata attached to every request comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaSource {
    Empty,
    /// Template rendered against the request
    Literal(String),
    /// File content, read once and truncated to `meta_size`
    File(Vec<u8>),
    /// Fresh random bytes for every attempt
    Random(usize),
}

impl MetaSource {
    /// Interprets the `payload.meta` setting: `@random` style values pick
    /// random bytes, `@path` reads a file, anything else is a literal.
    pub fn from_config(meta: Option<&str>, meta_size: usize) -> Result<Self> {
        let meta = match meta {
            None | Some("") => return Ok(MetaSource::Empty),
            Some(meta) => meta,
        };

        match meta.strip_prefix('@') {
            Some("random" | "urandom" | "/dev/random" | "/dev/urandom") => {
                Ok(MetaSource::Random(meta_size))
            }
            Some(path) => {
                let mut bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read meta file {}", path))?;
                bytes.truncate(meta_size);
                Ok(MetaSource::File(bytes))
            }
            None => Ok(MetaSource::Literal(meta.to_string())),
        }
    }

    pub fn resolve(&self, request: &Request) -> Vec<u8> {
        match self {
            MetaSource::Empty => Vec::new(),
            MetaSource::Literal(template) => template::render(template, request).into_bytes(),
            MetaSource::File(bytes) => bytes.clone(),
            MetaSource::Random(size) => {
                let mut bytes = vec![0u8; *size];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        }
    }
}

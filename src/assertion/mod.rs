//! Model assertion decoding and validation.
//!
//! A model assertion is the signed document describing the device an image
//! is built for. Trust comes from the signature; this module only checks the
//! structure, that the document really is a model, and that it does not use
//! headers this builder refuses to honour.

mod envelope;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Assertion type accepted by [`ModelAssertion::decode`].
pub const MODEL_KIND: &str = "model";

/// Headers that are postponed, unimplemented or abandoned. A model using
/// any of them is rejected whatever the value.
pub const RESERVED_HEADERS: &[&str] = &["core", "os", "class", "allowed-modes"];

/// Minor version appended to a major-only series. Major-only series always
/// resolve to the LTS point release.
pub const LTS_MINOR_SUFFIX: &str = ".04";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAssertion {
    kind: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    signature: Vec<u8>,
    sha256: String,
}

impl ModelAssertion {
    /// Read and decode the assertion at `path`.
    pub fn decode(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| Error::io(path, e))?;
        Self::decode_bytes(&raw)
    }

    /// Decode an assertion from its raw bytes. Fails with
    /// [`Error::Type`] when the document is well formed but not a model.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self> {
        let envelope = envelope::parse(raw)?;
        let kind = envelope
            .headers
            .get("type")
            .cloned()
            .ok_or_else(|| Error::decode("missing 'type' header"))?;
        if kind != MODEL_KIND {
            return Err(Error::Type { kind });
        }

        Ok(Self {
            kind,
            headers: envelope.headers,
            body: envelope.body,
            signature: envelope.signature,
            sha256: format!("{:x}", Sha256::digest(raw)),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// sha256 of the raw document, hex encoded.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn series(&self) -> Option<&str> {
        self.header("series")
    }

    pub fn brand_id(&self) -> Option<&str> {
        self.header("brand-id")
    }

    pub fn model(&self) -> Option<&str> {
        self.header("model")
    }

    pub fn architecture(&self) -> Option<&str> {
        self.header("architecture")
    }

    pub fn gadget(&self) -> Option<&str> {
        self.header("gadget")
    }

    pub fn kernel(&self) -> Option<&str> {
        self.header("kernel")
    }

    pub fn base(&self) -> Option<&str> {
        self.header("base")
    }
}

/// Reject models that set any reserved header.
pub fn validate(model: &ModelAssertion) -> Result<()> {
    for reserved in RESERVED_HEADERS {
        if model.headers.contains_key(*reserved) {
            return Err(Error::validation(format!(
                "model assertion cannot have reserved/unsupported header '{reserved}' set"
            )));
        }
    }
    Ok(())
}

/// Build series for a model: its major-version `series` header plus the LTS
/// minor version, e.g. `16` becomes `16.04`.
pub fn derive_series(model: &ModelAssertion) -> Result<String> {
    let series = model
        .series()
        .ok_or_else(|| Error::validation("model assertion has no 'series' header"))?;
    if series.is_empty() || !series.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::validation(format!(
            "model assertion series '{series}' is not a major version number"
        )));
    }
    Ok(format!("{series}{LTS_MINOR_SUFFIX}"))
}

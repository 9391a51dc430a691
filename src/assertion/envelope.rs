//! Signed-document envelope: headers, optional body, signature.
//!
//! ```text
//! type: model
//! series: 16
//! body-length: 5
//! snaps:
//!   - name: pc
//!     type: gadget
//!
//! hello
//!
//! <signature>
//! ```
//!
//! Header lines are `name: value`. A name followed by a bare `:` starts a
//! multi-line value made of the following lines indented by two spaces; it is
//! kept verbatim with the indentation stripped.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

const SEPARATOR: &[u8] = b"\n\n";
const INDENT: &str = "  ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) body: Vec<u8>,
    pub(crate) signature: Vec<u8>,
}

pub(crate) fn parse(content: &[u8]) -> Result<Envelope> {
    let split = find(content, SEPARATOR)
        .ok_or_else(|| Error::decode("header and signature separator not found"))?;
    let header_block = std::str::from_utf8(&content[..split])
        .map_err(|_| Error::decode("headers are not valid UTF-8"))?;
    let headers = parse_headers(header_block)?;

    let rest = &content[split + SEPARATOR.len()..];
    let body_length = match headers.get("body-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| Error::decode(format!("invalid body-length '{raw}'")))?,
        None => 0,
    };

    let (body, signature) = if body_length == 0 {
        (Vec::new(), rest)
    } else {
        let (Some(body), Some(tail)) = (rest.get(..body_length), rest.get(body_length..)) else {
            return Err(Error::decode(format!(
                "body is shorter than body-length {body_length}"
            )));
        };
        let Some(signature) = tail.strip_prefix(SEPARATOR) else {
            return Err(Error::decode("body is not followed by a blank line"));
        };
        (body.to_vec(), signature)
    };

    let signature = trim_end(signature);
    if signature.is_empty() {
        return Err(Error::decode("signature is empty"));
    }

    Ok(Envelope {
        headers,
        body,
        signature: signature.to_vec(),
    })
}

fn parse_headers(block: &str) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    let lines: Vec<&str> = block.split('\n').collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        i += 1;

        if line.starts_with(' ') {
            return Err(Error::decode(format!("unexpected indented line '{line}'")));
        }

        let (name, value) = if let Some((name, value)) = line.split_once(": ") {
            (name, value.to_string())
        } else if let Some(name) = line.strip_suffix(':') {
            let mut values = Vec::new();
            while i < lines.len() && lines[i].starts_with(INDENT) {
                values.push(&lines[i][INDENT.len()..]);
                i += 1;
            }
            if values.is_empty() {
                return Err(Error::decode(format!("header '{name}' has no value")));
            }
            (name, values.join("\n"))
        } else {
            return Err(Error::decode(format!(
                "header entry '{line}' is missing ': '"
            )));
        };

        if !valid_header_name(name) {
            return Err(Error::decode(format!("invalid header name '{name}'")));
        }
        if headers.insert(name.to_string(), value).is_some() {
            return Err(Error::decode(format!("repeated header '{name}'")));
        }
    }

    Ok(headers)
}

/// `[a-z](-?[a-z0-9])*`
fn valid_header_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some(first) = bytes.first() else {
        return false;
    };
    if !first.is_ascii_lowercase() || name.ends_with('-') || name.contains("--") {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_headers_and_signature() {
        let env = parse(b"type: model\nseries: 16\n\nSIGNATURE\n").unwrap();
        assert_eq!(env.headers["type"], "model");
        assert_eq!(env.headers["series"], "16");
        assert!(env.body.is_empty());
        assert_eq!(env.signature, b"SIGNATURE");

        let env = parse(b"type: model\nseries: 16\ndisplay-name: Device:\n\nSIG").unwrap();
        assert_eq!(env.headers["display-name"], "Device:");
        assert_eq!(env.headers["series"], "16");
    }

    #[test]
    fn test_parses_body_by_length() {
        let env = parse(b"type: model\nbody-length: 10\n\nhello\n\nyou\n\nSIG").unwrap();
        assert_eq!(env.body, b"hello\n\nyou");
        assert_eq!(env.signature, b"SIG");
    }

    #[test]
    fn test_parses_multiline_values() {
        let env = parse(
            b"type: model\nrequired-snaps:\n  - core\n  - htop\nseries: 16\n\nSIG",
        )
        .unwrap();
        assert_eq!(env.headers["required-snaps"], "- core\n- htop");
        assert_eq!(env.headers["series"], "16");
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let cases: &[&[u8]] = &[
            b"type: model\nseries: 16",
            b"type: model\n\n",
            b"type model\n\nSIG",
            b"type: model\ntype: model\n\nSIG",
            b"Type: model\n\nSIG",
            b"type: model\nbad-: x\n\nSIG",
            b"type: model\nempty:\n\nSIG",
            b"type: model\n  stray\n\nSIG",
            b"type: model\nbody-length: ten\n\nSIG",
            b"type: model\nbody-length: 100\n\nshort\n\nSIG",
            b"type: model\nbody-length: 2\n\nabc\n\nSIG",
            b"type: model\nbody-length: 18446744073709551615\n\nab\n\nSIG",
            b"type: model\nbody-length: 2\n\nab",
            b"type: \xff\n\nSIG",
        ];
        for case in cases {
            let err = parse(case).unwrap_err();
            assert!(
                matches!(err, Error::Decode { .. }),
                "expected decode error for {:?}, got {err}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_header_names() {
        assert!(valid_header_name("type"));
        assert!(valid_header_name("sign-key-sha3-384"));
        assert!(valid_header_name("allowed-modes"));
        assert!(!valid_header_name(""));
        assert!(!valid_header_name("1st"));
        assert!(!valid_header_name("a--b"));
        assert!(!valid_header_name("a_b"));
    }
}

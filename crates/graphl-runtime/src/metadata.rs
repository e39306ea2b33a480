//! Locating the metadata document embedded in a compiled binary.
//!
//! The document is found without parsing the binary format: scan for the
//! quoted marker key, walk back to the `{` that opens the enclosing object,
//! then walk forward balancing `{`/`[` against `}`/`]` until the depth
//! returns to zero.
//!
//! The balance scan does not understand string literals.  A document with a
//! bracket inside a string value would desynchronize it; type and function
//! names never contain brackets.

use graphl_types::{Metadata, METADATA_MARKER};
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};

/// Find and parse the embedded metadata document.
pub fn parse(bytes: &[u8]) -> RuntimeResult<Metadata> {
    let span = locate(bytes)?;
    let metadata = Metadata::from_embedded_json(span)
        .map_err(|e| RuntimeError::MetadataMalformed(e.to_string()))?;
    debug!(
        bytes = span.len(),
        functions = metadata.functions.len(),
        host_functions = metadata.host.functions.len(),
        "located metadata document"
    );
    Ok(metadata)
}

/// Return the byte span of the embedded metadata object.
pub fn locate(bytes: &[u8]) -> RuntimeResult<&[u8]> {
    let token = format!("\"{METADATA_MARKER}\"");
    let marker = find(bytes, token.as_bytes()).ok_or(RuntimeError::MetadataNotFound)?;
    let start = enclosing_open(bytes, marker).ok_or_else(|| {
        RuntimeError::MetadataMalformed("no object encloses the metadata marker".to_string())
    })?;
    let end = matching_close(bytes, start).ok_or_else(|| {
        RuntimeError::MetadataMalformed("metadata document is not terminated".to_string())
    })?;
    Ok(&bytes[start..=end])
}

/// Byte offset of the first occurrence of `needle`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let first = *needle.first()?;
    let last_start = haystack.len().checked_sub(needle.len())?;
    (0..=last_start)
        .filter(|&i| haystack[i] == first)
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Walk backward from `from` to the unmatched `{` that contains it.
fn enclosing_open(bytes: &[u8], from: usize) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..from).rev() {
        match bytes[i] {
            b'}' | b']' => depth += 1,
            b'{' if depth == 0 => return Some(i),
            b'{' | b'[' => depth = depth.checked_sub(1)?,
            _ => {}
        }
    }
    None
}

/// Walk forward from the opening brace at `start` to its matching close.
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, byte) in bytes.iter().enumerate().skip(start) {
        match byte {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

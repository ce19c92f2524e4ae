//! Thumbnail staging for registrations.
//!
//! The registrar receives a thumbnail as a file path. The staged copy lives in
//! a temp file that is deleted when the returned handle is dropped.

use base64::{engine::general_purpose, Engine as _};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, warn};

const TEMP_PREFIX: &str = "pubtmp";
const TEMP_SUFFIX: &str = ".png";

/// Stage the thumbnail named by `reference` into a temp file.
///
/// `data:` URIs with a base64 payload are decoded and local files are copied.
/// Anything else, such as a remote URL, yields `None`.
pub fn stage(reference: Option<&str>) -> io::Result<Option<NamedTempFile>> {
    let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };

    let bytes = if let Some(data) = strip_prefix_ignore_case(reference, "data:") {
        match decode_data_uri(data) {
            Some(bytes) => bytes,
            None => {
                warn!("Thumbnail data URI is not base64 encoded, skipping");
                return Ok(None);
            }
        }
    } else if Path::new(reference).is_file() {
        fs::read(reference)?
    } else {
        debug!("Thumbnail {} is not available locally, skipping", reference);
        return Ok(None);
    };

    let mut file = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile()?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(Some(file))
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

fn decode_data_uri(data: &str) -> Option<Vec<u8>> {
    let (header, payload) = data.split_once(',')?;
    if !header.to_ascii_lowercase().ends_with(";base64") {
        return None;
    }
    general_purpose::STANDARD.decode(payload.trim()).ok()
}

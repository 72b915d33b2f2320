//! Line vocabulary shared by the copy engine and the pusher
//!
//! The copy engine writes human-readable lines such as
//! `Copying blob sha256:67cd...` and `Copying config sha256:0433...`. The
//! pusher interleaves its own `+`-prefixed lifecycle markers into the same
//! stream. Everything else is plain text.

use std::fmt;

const BLOB_PREFIX: &str = "Copying blob sha256:";
const CONFIG_PREFIX: &str = "Copying config sha256:";
const FILE_BEGIN: &str = "+file.begin:";
const FILE_END: &str = "+file.end:";
const FILE_ERROR: &str = "+file.error:";
const STATUS_FLUSH: &str = "+status.flush:";

/// One parsed progress line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressLine {
    /// The copier started a layer; holds the digest hex
    Blob { layer_id: String, line: String },
    /// The copier moved on to the image config
    Config { line: String },
    /// The pusher starts an image
    ImageBegin(String),
    /// The pusher finished an image
    ImageEnd(String),
    /// The pusher gave up on the current image; holds the error text
    ImageError(String),
    /// Render the current state again
    Flush,
    Text(String),
}

impl ProgressLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix(BLOB_PREFIX) {
            let layer_id = rest.split_whitespace().next().unwrap_or_default();
            return ProgressLine::Blob {
                layer_id: layer_id.to_string(),
                line: line.to_string(),
            };
        }
        if line.starts_with(CONFIG_PREFIX) {
            return ProgressLine::Config {
                line: line.to_string(),
            };
        }
        if let Some(id) = line.strip_prefix(FILE_BEGIN) {
            return ProgressLine::ImageBegin(id.to_string());
        }
        if let Some(id) = line.strip_prefix(FILE_END) {
            return ProgressLine::ImageEnd(id.to_string());
        }
        if let Some(error) = line.strip_prefix(FILE_ERROR) {
            return ProgressLine::ImageError(error.to_string());
        }
        if line.starts_with(STATUS_FLUSH) {
            return ProgressLine::Flush;
        }
        ProgressLine::Text(line.to_string())
    }

    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            ProgressLine::ImageBegin(_)
                | ProgressLine::ImageEnd(_)
                | ProgressLine::ImageError(_)
                | ProgressLine::Flush
        )
    }

    /// Text that replaces the compatibility message; markers carry none
    pub fn compatibility_text(&self) -> Option<&str> {
        match self {
            ProgressLine::Blob { line, .. } | ProgressLine::Config { line } => Some(line),
            ProgressLine::Text(line) => Some(line),
            _ => None,
        }
    }
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressLine::Blob { line, .. } | ProgressLine::Config { line } => f.write_str(line),
            ProgressLine::ImageBegin(id) => write!(f, "{}{}", FILE_BEGIN, id),
            ProgressLine::ImageEnd(id) => write!(f, "{}{}", FILE_END, id),
            // Markers are single lines
            ProgressLine::ImageError(error) => {
                write!(f, "{}{}", FILE_ERROR, error.replace(['\r', '\n'], " "))
            }
            ProgressLine::Flush => f.write_str(STATUS_FLUSH),
            ProgressLine::Text(line) => f.write_str(line),
        }
    }
}

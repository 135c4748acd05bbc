#![forbid(unsafe_code)]

//! MP4 container check used to tell real downloads from error pages and
//! truncated files.

use std::fs::File;
use std::io::Read;
use std::path::Path;

const HEADER_LEN: usize = 12;
const FTYP: &[u8; 4] = b"ftyp";

/// True when `header` holds at least 12 bytes and bytes 4..8 are `ftyp`.
pub fn has_mp4_signature(header: &[u8]) -> bool {
    header.len() >= HEADER_LEN && &header[4..8] == FTYP
}

/// Reads the first bytes of `path`. Missing or unreadable files are invalid.
pub fn is_mp4_file(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut header = Vec::with_capacity(HEADER_LEN);
    match file.take(HEADER_LEN as u64).read_to_end(&mut header) {
        Ok(_) => has_mp4_signature(&header),
        Err(_) => false,
    }
}

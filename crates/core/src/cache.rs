//! Analysis cache for large listings.
//!
//! Stores a built [`DisasmFile`] (text, line index, branch lanes and the
//! settings they were built with) so a viewer can skip the rebuild when the
//! listing has not changed. The payload is bincode serialized and deflate
//! compressed.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "ABDL"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | CPU type         |  u8 (0 = ATmega32u4, 1 = ATmega328P)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use std::path::Path;

use crate::console::CpuType;
use crate::error::{Error, Result};
use crate::DisasmFile;

/// Magic bytes identifying an analysis cache file.
const MAGIC: &[u8; 4] = b"ABDL";
/// Current cache format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 9;

/// Serialize and compress `file` with its header.
pub fn encode(file: &DisasmFile, cpu_type: CpuType) -> Result<Vec<u8>> {
    let payload = bincode::serialize(file)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(cpu_type.to_byte());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Verify the header, decompress and deserialize a cache image.
///
/// A payload that deserializes but breaks the listing invariants is reported
/// as [`Error::Corrupt`].
pub fn decode(data: &[u8], expected_cpu_type: CpuType) -> Result<DisasmFile> {
    if data.len() < HEADER_LEN {
        return Err(Error::TooSmall(data.len()));
    }
    if &data[0..4] != MAGIC {
        return Err(Error::BadMagic);
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion { found: version, expected: FORMAT_VERSION });
    }
    if data[8] != expected_cpu_type.to_byte() {
        return Err(Error::CpuMismatch {
            cache: CpuType::from_byte(data[8]).map_or("?", CpuType::name),
            current: expected_cpu_type.name(),
        });
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| Error::Decompress(format!("{:?}", e)))?;

    let file: DisasmFile = bincode::deserialize(&decompressed)?;
    file.check_consistency().map_err(Error::Corrupt)?;
    Ok(file)
}

pub fn save_to_file(file: &DisasmFile, cpu_type: CpuType, path: &Path) -> Result<()> {
    let data = encode(file, cpu_type)?;
    std::fs::write(path, data)?;
    tracing::info!(path = %path.display(), lines = file.len(), "analysis cache saved");
    Ok(())
}

pub fn load_from_file(path: &Path, expected_cpu_type: CpuType) -> Result<DisasmFile> {
    let data = std::fs::read(path)?;
    decode(&data, expected_cpu_type)
}

/// Derive the cache path from a listing path.
/// `game.lss` → `game.abdl`
pub fn cache_path(listing_path: &str) -> String {
    let p = Path::new(listing_path);
    let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("listing");
    let dir = p.parent().unwrap_or(Path::new("."));
    dir.join(format!("{}.abdl", stem)).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_index::tests::{ins, label};
    use crate::{AvrCore, BranchConfig};

    use pretty_assertions::assert_eq;

    fn sample() -> DisasmFile {
        let text = [
            label(0x100, "loop"),
            ins(0x100, "00 00", "nop"),
            ins(0x102, "fe cf", "rjmp\t.-4"),
            ins(0x104, "0c 94 80 00", "jmp\t0x100"),
        ]
        .concat();
        DisasmFile::from_src(text, &AvrCore::default(), &BranchConfig::default())
    }

    #[test]
    fn test_encode_decode() {
        let file = sample();
        assert_eq!(file.branch_roots().len(), 2);
        let data = encode(&file, CpuType::Atmega32u4).unwrap();
        assert_eq!(&data[0..4], MAGIC);
        let back = decode(&data, CpuType::Atmega32u4).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn test_header_errors() {
        let data = encode(&sample(), CpuType::Atmega32u4).unwrap();

        assert!(matches!(decode(&data[..5], CpuType::Atmega32u4), Err(Error::TooSmall(5))));

        let mut bad = data.clone();
        bad[0] = b'X';
        assert!(matches!(decode(&bad, CpuType::Atmega32u4), Err(Error::BadMagic)));

        let mut bad = data.clone();
        bad[4] = 9;
        assert!(matches!(
            decode(&bad, CpuType::Atmega32u4),
            Err(Error::UnsupportedVersion { found: 9, expected: 1 })
        ));

        let err = decode(&data, CpuType::Atmega328p).unwrap_err();
        assert_eq!(err.to_string(), "CPU type mismatch: cache=ATmega32u4 current=ATmega328P");

        let mut bad = data.clone();
        bad.truncate(HEADER_LEN + 3);
        assert!(decode(&bad, CpuType::Atmega32u4).is_err());
    }

    #[test]
    fn test_inconsistent_payload_is_corrupt() {
        let file = sample();
        let mut payload = bincode::serialize(&file).unwrap();
        // Flip the content's first byte: the stored index no longer matches it.
        let at = payload.iter().position(|&b| b == b'0').unwrap();
        payload[at] = b'X';

        assert!(matches!(decode(&image(&payload), CpuType::Atmega32u4), Err(Error::Corrupt(_))));
    }

    fn image(payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        data.push(CpuType::Atmega32u4.to_byte());
        data.extend_from_slice(&miniz_oxide::deflate::compress_to_vec(payload, 6));
        data
    }

    #[test]
    fn test_tampered_run_index_is_corrupt() {
        let file = sample();
        let mut payload = bincode::serialize(&file).unwrap();
        assert_eq!(decode(&image(&payload), CpuType::Atmega32u4).unwrap(), file);

        // Payload tail: line → run indices [0, 1, 1, 2] as u64, the u32 max
        // depth, then the u64 clip distance.
        let first_ind = payload.len() - 12 - 4 * 8;
        assert_eq!(&payload[first_ind..first_ind + 8], &[0u8; 8]);
        payload[first_ind] = 1;

        let err = decode(&image(&payload), CpuType::Atmega32u4).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)), "{:?}", err);
    }

    #[test]
    fn test_cache_path() {
        assert_eq!(cache_path("roms/game.lss"), "roms/game.abdl");
        assert_eq!(cache_path("game.lst"), "game.abdl");
    }
}

//! Binary reference-set store.
//!
//! Layout (all integers and floats little-endian):
//!
//! ```text
//! magic        4 bytes   "PTRF"
//! version      u32       1
//! count        u32       number of entries
//! entry * count:
//!   key_len    u32
//!   key        key_len bytes, UTF-8
//!   z_step     f64
//!   center_ind u32
//!   center_pos f64 x 2   (x, y) within the template
//!   pixel_size f64 x 2   (x, y) metres
//!   tip_length f64
//!   frames     u32
//!   width      u32
//!   height     u32
//!   data       f32 x frames*height*width, row-major per frame
//! ```

use std::fs;
use std::path::Path;

use nalgebra::Vector2;

use super::reference::ReferenceSet;
use crate::error::{Result, TrackerError};
use crate::imaging::{ConfigKey, FrameImage};

const MAGIC: &[u8; 4] = b"PTRF";
const VERSION: u32 = 1;

/// Serialize reference sets into the store layout.
pub fn encode<'a>(entries: impl IntoIterator<Item = (&'a ConfigKey, &'a ReferenceSet)>) -> Vec<u8> {
    let entries: Vec<_> = entries.into_iter().collect();
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    for (key, set) in entries {
        let key = key.as_str().as_bytes();
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&set.z_step.to_le_bytes());
        out.extend_from_slice(&(set.center_index as u32).to_le_bytes());
        out.extend_from_slice(&set.center_pos.x.to_le_bytes());
        out.extend_from_slice(&set.center_pos.y.to_le_bytes());
        out.extend_from_slice(&set.pixel_size.x.to_le_bytes());
        out.extend_from_slice(&set.pixel_size.y.to_le_bytes());
        out.extend_from_slice(&set.tip_length.to_le_bytes());

        let (width, height) = set.template_size();
        out.extend_from_slice(&(set.frames.len() as u32).to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        for frame in &set.frames {
            for value in frame.as_raw() {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| TrackerError::Storage("reference store is truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| TrackerError::Storage("reference store is truncated".to_string()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

/// Parse the store layout.
pub fn decode(bytes: &[u8]) -> Result<Vec<(ConfigKey, ReferenceSet)>> {
    let mut reader = Reader { bytes, pos: 0 };
    if reader.take(4)? != MAGIC {
        return Err(TrackerError::Storage("not a reference store".to_string()));
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(TrackerError::Storage(format!(
            "unsupported reference store version {}",
            version
        )));
    }

    let count = reader.u32()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = reader.u32()? as usize;
        let key = std::str::from_utf8(reader.take(key_len)?)
            .map_err(|e| TrackerError::Storage(format!("invalid configuration key: {}", e)))?;
        let key = ConfigKey::new(key);

        let z_step = reader.f64()?;
        let center_index = reader.u32()? as usize;
        let center_pos = Vector2::new(reader.f64()?, reader.f64()?);
        let pixel_size = Vector2::new(reader.f64()?, reader.f64()?);
        let tip_length = reader.f64()?;

        let frame_count = reader.u32()?;
        let width = reader.u32()?;
        let height = reader.u32()?;
        let pixels = width as usize * height as usize;
        let mut frames = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            let mut data = Vec::with_capacity(pixels);
            for _ in 0..pixels {
                data.push(reader.f32()?);
            }
            let frame = FrameImage::from_raw(width, height, data)
                .ok_or_else(|| TrackerError::Storage("invalid frame dimensions".to_string()))?;
            frames.push(frame);
        }

        let set = ReferenceSet::new(frames, z_step, center_index, center_pos, pixel_size, tip_length)?;
        entries.push((key, set));
    }

    Ok(entries)
}

/// Write reference sets to `path`, creating parent directories.
pub fn save<'a>(
    path: impl AsRef<Path>,
    entries: impl IntoIterator<Item = (&'a ConfigKey, &'a ReferenceSet)>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encode(entries))?;
    Ok(())
}

/// Read reference sets from `path`. A missing file is an empty store.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<(ConfigKey, ReferenceSet)>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    decode(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn sample_set() -> ReferenceSet {
        let frames = (0..3)
            .map(|i| FrameImage::from_fn(5, 4, |x, y| Luma([(x * 10 + y) as f32 - i as f32 * 0.5])))
            .collect();
        ReferenceSet::new(
            frames,
            1e-6,
            1,
            Vector2::new(3.25, 1.5),
            Vector2::new(0.5e-6, 0.5e-6),
            30e-6,
        )
        .unwrap()
    }

    #[test]
    fn test_store_preserves_fields() {
        let key = ConfigKey::new("cam/40x/gfp");
        let set = sample_set();
        let decoded = decode(&encode([(&key, &set)])).unwrap();

        assert_eq!(decoded.len(), 1);
        let (k, d) = &decoded[0];
        assert_eq!(k, &key);
        assert_eq!(d.frames.len(), 3);
        assert_eq!(d.center_index, 1);
        assert_eq!(d.center_pos, set.center_pos);
        assert_eq!(d.pixel_size, set.pixel_size);
        assert_eq!(d.tip_length, set.tip_length);
        assert_eq!(d.frames[2].as_raw(), set.frames[2].as_raw());
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(std::iter::empty());
        assert_eq!(&bytes[0..4], b"PTRF");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 1);
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn test_rejects_garbage_and_truncation() {
        assert!(matches!(decode(b"nope"), Err(TrackerError::Storage(_))));

        let key = ConfigKey::new("k");
        let set = sample_set();
        let bytes = encode([(&key, &set)]);
        let result = decode(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(TrackerError::Storage(_))));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = load(dir.path().join("ref_frames.bin")).unwrap();
        assert!(entries.is_empty());
    }
}

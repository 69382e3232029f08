use std::fs::File;
use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::HashType;

/// 64-bit difference hash: each bit tells whether a pixel is brighter than its
/// right neighbour on a 9x8 grayscale thumbnail.
pub fn dhash(image: &DynamicImage) -> u64 {
    let thumb = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = thumb.get_pixel(x, y)[0];
            let right = thumb.get_pixel(x + 1, y)[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    hash
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of downloaded content: perceptual for images, SHA-256 otherwise.
///
/// Blocking; run it off the async workers.
pub fn content_hash(path: &Path, mime_type: &str) -> Result<(HashType, String)> {
    if mime_type.starts_with("image/") {
        let bytes = std::fs::read(path)?;
        match image::load_from_memory(&bytes) {
            Ok(image) => return Ok((HashType::DHash, format!("{:016x}", dhash(&image)))),
            Err(e) => {
                tracing::debug!(mime_type, "Image not decodable, hashing bytes: {}", e);
            }
        }
    }
    Ok((HashType::Sha256, sha256_file(path)?))
}

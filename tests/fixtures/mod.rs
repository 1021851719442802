//! Synthetic NIfTI-1 volumes for exercising the pipeline without real scans.
//!
//! Every volume is a 4x4x1 grid of uint8 voxels with 1 mm spacing, written
//! in the same wire layout the model container produces (gzip-compressed
//! single-file NIfTI-1).

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

pub const CASE_DIMS: [usize; 3] = [4, 4, 1];

/// Arbitrary intensities standing in for the diffusion image.
pub const DWI_VOXELS: [u8; 16] = [7, 9, 12, 3, 5, 14, 8, 2, 1, 6, 11, 4, 0, 10, 13, 15];

/// Arbitrary intensities standing in for the ADC map.
pub const ADC_VOXELS: [u8; 16] = [2, 4, 6, 8, 1, 3, 5, 7, 9, 11, 13, 15, 0, 2, 4, 6];

/// Mask the fake adapter ships as its prediction: voxels 1, 2, 5, 6.
pub const PREDICTION_VOXELS: [u8; 16] = [0, 1, 1, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Ground truth overlapping the prediction in 2 of 4 voxels.
/// dice = 2 * 2 / (4 + 4) = 0.5
pub const TRUTH_VOXELS: [u8; 16] = [0, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0];

/// Lesion volume of the prediction at 1 mm isotropic spacing, in ml.
pub const PREDICTION_VOLUME_ML: f64 = 4.0 / 1000.0;

/// Dice of PREDICTION_VOXELS against TRUTH_VOXELS.
pub const EXPECTED_DICE: f64 = 0.5;

/// Assemble an uncompressed single-file NIfTI-1 byte stream (uint8 data).
pub fn nifti_bytes(dims: [usize; 3], pixdim: [f32; 3], voxels: &[u8]) -> Vec<u8> {
    assert_eq!(dims[0] * dims[1] * dims[2], voxels.len());
    let mut header = vec![0u8; 352];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());
    header[40..42].copy_from_slice(&3i16.to_le_bytes());
    for (i, d) in dims.iter().enumerate() {
        let off = 42 + 2 * i;
        header[off..off + 2].copy_from_slice(&(*d as i16).to_le_bytes());
    }
    header[70..72].copy_from_slice(&2i16.to_le_bytes()); // uint8
    header[72..74].copy_from_slice(&8i16.to_le_bytes());
    for (i, p) in pixdim.iter().enumerate() {
        let off = 80 + 4 * i;
        header[off..off + 4].copy_from_slice(&p.to_le_bytes());
    }
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[344..348].copy_from_slice(b"n+1\0");
    header.extend_from_slice(voxels);
    header
}

/// Write a gzip-compressed 4x4x1 volume with 1 mm spacing.
pub fn write_nifti_gz(path: &Path, voxels: &[u8]) {
    let bytes = nifti_bytes(CASE_DIMS, [1.0, 1.0, 1.0], voxels);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes).expect("gzip nifti");
    let gz = encoder.finish().expect("finish gzip");
    std::fs::write(path, gz).expect("write nifti fixture");
}

/// Write bytes that are not a NIfTI volume at all.
pub fn write_corrupt_volume(path: &Path) {
    std::fs::write(path, b"this is not a nifti volume").expect("write corrupt fixture");
}

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

const HEADER_SIZE: usize = 348;
const BINARY_THRESHOLD: f32 = 0.5;

/// A decoded NIfTI-1 volume: spatial dims, voxel spacing and scaled voxels.
#[derive(Debug, Clone)]
pub struct NiftiVolume {
    pub dims: [usize; 3],
    pub pixdim: [f32; 3],
    pub data: Vec<f32>,
}

impl NiftiVolume {
    /// Physical volume of one voxel in cubic millimetres.
    pub fn voxel_volume_mm3(&self) -> f64 {
        self.pixdim.iter().map(|p| p.abs() as f64).product()
    }
}

/// Read a `.nii` or `.nii.gz` volume from disk.
pub async fn load_volume(path: &Path) -> Result<NiftiVolume, QualityError> {
    let bytes = tokio::fs::read(path).await?;
    parse_volume(&bytes)
}

/// Decode a NIfTI-1 byte stream, gzip-compressed or raw, either endianness,
/// with `scl_slope`/`scl_inter` applied to the common scalar datatypes.
pub fn parse_volume(bytes: &[u8]) -> Result<NiftiVolume, QualityError> {
    let raw;
    let bytes = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut decoded)?;
        raw = decoded;
        &raw[..]
    } else {
        bytes
    };

    if bytes.len() < HEADER_SIZE {
        return Err(QualityError::Truncated);
    }

    // sizeof_hdr doubles as the endianness check.
    let sizeof_hdr = i32::from_le_bytes(header_bytes::<4>(bytes, 0)?);
    let swap = match sizeof_hdr {
        348 => false,
        _ if sizeof_hdr.swap_bytes() == 348 => true,
        _ => return Err(QualityError::InvalidHeader("bad sizeof_hdr")),
    };

    let magic = &bytes[344..348];
    if &magic[..3] != b"n+1" && &magic[..3] != b"ni1" {
        return Err(QualityError::InvalidHeader("bad magic"));
    }

    let ndim = read_i16(bytes, 40, swap)?;
    if !(1..=7).contains(&ndim) {
        return Err(QualityError::InvalidHeader("bad dim[0]"));
    }
    let mut dims = [1usize; 3];
    for (i, dim) in dims.iter_mut().enumerate() {
        if i < ndim as usize {
            let d = read_i16(bytes, 40 + 2 * (i + 1), swap)?;
            if d < 1 {
                return Err(QualityError::InvalidHeader("non-positive dim"));
            }
            *dim = d as usize;
        }
    }

    let datatype = read_i16(bytes, 70, swap)?;
    let dtype = Dtype::from_code(datatype).ok_or(QualityError::UnsupportedDatatype(datatype))?;

    let mut pixdim = [1.0f32; 3];
    for (i, pd) in pixdim.iter_mut().enumerate() {
        let p = read_f32(bytes, 76 + 4 * (i + 1), swap)?;
        if p != 0.0 && p.is_finite() {
            *pd = p;
        }
    }

    let vox_offset = read_f32(bytes, 108, swap)?;
    if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 {
        return Err(QualityError::InvalidHeader("bad vox_offset"));
    }
    let offset = vox_offset as usize;

    let scl_slope = read_f32(bytes, 112, swap)?;
    let scl_inter = read_f32(bytes, 116, swap)?;
    let (slope, inter) = if scl_slope == 0.0 || !scl_slope.is_finite() {
        (1.0, 0.0)
    } else {
        (scl_slope, if scl_inter.is_finite() { scl_inter } else { 0.0 })
    };

    let count = dims[0] * dims[1] * dims[2];
    let elem = dtype.size();
    let end = offset
        .checked_add(count.checked_mul(elem).ok_or(QualityError::Truncated)?)
        .ok_or(QualityError::Truncated)?;
    if bytes.len() < end {
        return Err(QualityError::Truncated);
    }

    let mut data = Vec::with_capacity(count);
    for i in 0..count {
        let o = offset + i * elem;
        let value = dtype.decode(&bytes[o..o + elem], swap);
        data.push(value * slope + inter);
    }

    Ok(NiftiVolume { dims, pixdim, data })
}

/// Dice overlap of two binarized volumes. Two empty masks agree perfectly.
pub fn dice_score(prediction: &NiftiVolume, ground_truth: &NiftiVolume) -> Result<f64, QualityError> {
    if prediction.dims != ground_truth.dims {
        return Err(QualityError::ShapeMismatch {
            prediction: prediction.dims,
            ground_truth: ground_truth.dims,
        });
    }
    let mut pred_count = 0u64;
    let mut truth_count = 0u64;
    let mut intersection = 0u64;
    for (p, t) in prediction.data.iter().zip(ground_truth.data.iter()) {
        let p = *p > BINARY_THRESHOLD;
        let t = *t > BINARY_THRESHOLD;
        pred_count += u64::from(p);
        truth_count += u64::from(t);
        intersection += u64::from(p && t);
    }
    if pred_count + truth_count == 0 {
        return Ok(1.0);
    }
    Ok(2.0 * intersection as f64 / (pred_count + truth_count) as f64)
}

/// Lesion volume in millilitres: voxels above threshold times voxel size.
pub fn lesion_volume_ml(volume: &NiftiVolume) -> f64 {
    let voxels = volume
        .data
        .iter()
        .filter(|v| **v > BINARY_THRESHOLD)
        .count();
    voxels as f64 * volume.voxel_volume_mm3() / 1000.0
}

#[derive(Debug, Clone, Copy)]
enum Dtype {
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Dtype {
    fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Dtype::U8),
            4 => Some(Dtype::I16),
            8 => Some(Dtype::I32),
            16 => Some(Dtype::F32),
            64 => Some(Dtype::F64),
            256 => Some(Dtype::I8),
            512 => Some(Dtype::U16),
            768 => Some(Dtype::U32),
            _ => None,
        }
    }

    fn size(&self) -> usize {
        match self {
            Dtype::U8 | Dtype::I8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::F64 => 8,
        }
    }

    fn decode(&self, raw: &[u8], swap: bool) -> f32 {
        macro_rules! bytes_of {
            ($n:expr) => {{
                let mut arr = [0u8; $n];
                arr.copy_from_slice(raw);
                arr
            }};
        }
        match self {
            Dtype::U8 => raw[0] as f32,
            Dtype::I8 => raw[0] as i8 as f32,
            Dtype::I16 => {
                let arr = bytes_of!(2);
                (if swap { i16::from_be_bytes(arr) } else { i16::from_le_bytes(arr) }) as f32
            }
            Dtype::U16 => {
                let arr = bytes_of!(2);
                (if swap { u16::from_be_bytes(arr) } else { u16::from_le_bytes(arr) }) as f32
            }
            Dtype::I32 => {
                let arr = bytes_of!(4);
                (if swap { i32::from_be_bytes(arr) } else { i32::from_le_bytes(arr) }) as f32
            }
            Dtype::U32 => {
                let arr = bytes_of!(4);
                (if swap { u32::from_be_bytes(arr) } else { u32::from_le_bytes(arr) }) as f32
            }
            Dtype::F32 => {
                let arr = bytes_of!(4);
                if swap {
                    f32::from_be_bytes(arr)
                } else {
                    f32::from_le_bytes(arr)
                }
            }
            Dtype::F64 => {
                let arr = bytes_of!(8);
                (if swap { f64::from_be_bytes(arr) } else { f64::from_le_bytes(arr) }) as f32
            }
        }
    }
}

fn header_bytes<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], QualityError> {
    let slice = bytes
        .get(offset..offset + N)
        .ok_or(QualityError::Truncated)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(slice);
    Ok(arr)
}

fn read_i16(bytes: &[u8], offset: usize, swap: bool) -> Result<i16, QualityError> {
    let arr = header_bytes::<2>(bytes, offset)?;
    Ok(if swap {
        i16::from_be_bytes(arr)
    } else {
        i16::from_le_bytes(arr)
    })
}

fn read_f32(bytes: &[u8], offset: usize, swap: bool) -> Result<f32, QualityError> {
    let arr = header_bytes::<4>(bytes, offset)?;
    Ok(if swap {
        f32::from_be_bytes(arr)
    } else {
        f32::from_le_bytes(arr)
    })
}

#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error("metric io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid NIfTI-1 header: {0}")]
    InvalidHeader(&'static str),

    #[error("unsupported NIfTI datatype code: {0}")]
    UnsupportedDatatype(i16),

    #[error("volume data shorter than header promises")]
    Truncated,

    #[error("volume shapes differ: {prediction:?} vs {ground_truth:?}")]
    ShapeMismatch {
        prediction: [usize; 3],
        ground_truth: [usize; 3],
    },
}

//! NIfTI file I/O for volume series, masks and despiked output
//!
//! Reading goes through the `nifti` crate (gzip is auto-detected); writing
//! produces float32 NIfTI-1 single files, optionally gzip compressed.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};
use ndarray::{Array, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::despike::Classification;
use crate::error::{QcError, Result};
use crate::volume::{Mask, VolumeSeries};

/// File-name prefix of despiked output volumes
pub const DESPIKE_PREFIX: &str = "d";

/// Spatial/temporal header information carried from input to output
#[derive(Clone, Debug, PartialEq)]
pub struct NiftiGeometry {
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
    /// Repetition time in seconds (pixdim[4]); 1.0 when the header has none
    pub repetition_time: f64,
}

impl NiftiGeometry {
    /// Unit voxels, identity affine
    pub fn identity() -> Self {
        Self {
            voxel_size: (1.0, 1.0, 1.0),
            affine: [
                1.0, 0.0, 0.0, 0.0,
                0.0, 1.0, 0.0, 0.0,
                0.0, 0.0, 1.0, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
            repetition_time: 1.0,
        }
    }
}

/// NIfTI data loaded from bytes
pub struct NiftiData {
    /// Volume data as f64 (first volume of 4D files)
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    pub geometry: NiftiGeometry,
    /// Data scaling slope
    pub scl_slope: f64,
    /// Data scaling intercept
    pub scl_inter: f64,
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn parse_object(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
            .map_err(|e| {
                let mut decompressed = Vec::new();
                let mut decoder = GzDecoder::new(Cursor::new(bytes));
                let info = if std::io::Read::read_to_end(&mut decoder, &mut decompressed).is_ok() {
                    get_header_info(&decompressed)
                } else {
                    "Could not decompress".to_string()
                };
                QcError::Io(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
            })
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| QcError::Io(format!("Failed to read NIfTI: {} ({})", e, get_header_info(bytes))))
    }
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

fn get_geometry(header: &NiftiHeader) -> NiftiGeometry {
    let pixdim = header.pixdim;
    let tr = pixdim[4] as f64;
    NiftiGeometry {
        voxel_size: (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64),
        affine: get_affine(header),
        repetition_time: if tr > 0.0 { tr } else { 1.0 },
    }
}

/// Convert the object to an f64 array with three or four axes
fn into_array(obj: InMemNiftiObject) -> Result<Array<f64, IxDyn>> {
    let array: Array<f64, IxDyn> = obj.into_volume()
        .into_ndarray()
        .map_err(|e| QcError::Io(format!("Failed to convert to ndarray: {}", e)))?;
    if array.ndim() < 3 || array.ndim() > 4 {
        return Err(QcError::shape("NIfTI volume", "3 or 4 axes", array.ndim()));
    }
    Ok(array)
}

/// Copy volume `t` of a 3D/4D array in Fortran order (x fastest)
fn push_volume(array: &Array<f64, IxDyn>, t: usize, out: &mut Vec<f64>) {
    let shape = array.shape();
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let v = if shape.len() == 3 { array[[i, j, k]] } else { array[[i, j, k, t]] };
                out.push(v);
            }
        }
    }
}

/// Load a NIfTI file from bytes
///
/// Supports both .nii and .nii.gz files (gzip is auto-detected). For 4D
/// files only the first volume is returned.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj = parse_object(bytes)?;
    let header = obj.header();
    let geometry = get_geometry(header);
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;

    let array = into_array(obj)?;
    let shape = array.shape();
    // Use the actual array shape (nifti-rs may reorder)
    let dims = (shape[0], shape[1], shape[2]);

    let mut data = Vec::with_capacity(dims.0 * dims.1 * dims.2);
    push_volume(&array, 0, &mut data);

    Ok(NiftiData { data, dims, geometry, scl_slope, scl_inter })
}

/// Load a 3D or 4D NIfTI file from bytes as a volume series
pub fn load_nifti_series(bytes: &[u8]) -> Result<(VolumeSeries, NiftiGeometry)> {
    let obj = parse_object(bytes)?;
    let geometry = get_geometry(obj.header());

    let array = into_array(obj)?;
    let shape = array.shape().to_vec();
    let dims = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    let mut data = Vec::with_capacity(dims.0 * dims.1 * dims.2 * nt);
    for t in 0..nt {
        push_volume(&array, t, &mut data);
    }

    Ok((VolumeSeries::new(data, dims, nt)?, geometry))
}

/// Build a float32 NIfTI-1 single-file header (348 bytes)
fn build_header(
    dims: (usize, usize, usize),
    nt: usize,
    geometry: &NiftiGeometry,
) -> Result<[u8; 348]> {
    let (nx, ny, nz) = dims;
    for (axis, &n) in [nx, ny, nz, nt].iter().enumerate() {
        if n > i16::MAX as usize {
            return Err(QcError::shape(
                &format!("NIfTI header axis {}", axis),
                format!("at most {}", i16::MAX),
                n,
            ));
        }
    }
    let (vsx, vsy, vsz) = geometry.voxel_size;
    let affine = &geometry.affine;

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nt.max(1) as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [
        1.0, vsx as f32, vsy as f32, vsz as f32,
        geometry.repetition_time as f32, 1.0, 1.0, 1.0,
    ];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm + seconds
    header[123] = 2 | 8;

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for i in 0..4 {
            let offset = 280 + row * 16 + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    Ok(header)
}

fn encode(header: &[u8; 348], data: &[f64]) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(header)
        .map_err(|e| QcError::Io(format!("Write header failed: {}", e)))?;
    // Extension flag: no extensions
    buffer.write_all(&[0u8; 4])
        .map_err(|e| QcError::Io(format!("Write extension failed: {}", e)))?;
    for &val in data {
        buffer.write_all(&(val as f32).to_le_bytes())
            .map_err(|e| QcError::Io(format!("Write data failed: {}", e)))?;
    }
    Ok(buffer)
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)
        .map_err(|e| QcError::Io(format!("Gzip compression failed: {}", e)))?;
    encoder.finish()
        .map_err(|e| QcError::Io(format!("Gzip finish failed: {}", e)))
}

/// Save a 3D volume as uncompressed NIfTI bytes
pub fn save_nifti(
    data: &[f64],
    dims: (usize, usize, usize),
    geometry: &NiftiGeometry,
) -> Result<Vec<u8>> {
    let expected = dims.0 * dims.1 * dims.2;
    if data.len() != expected {
        return Err(QcError::shape("NIfTI volume data", expected, data.len()));
    }
    encode(&build_header(dims, 1, geometry)?, data)
}

/// Save a 3D volume as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    dims: (usize, usize, usize),
    geometry: &NiftiGeometry,
) -> Result<Vec<u8>> {
    gzip(&save_nifti(data, dims, geometry)?)
}

/// Save a volume series as uncompressed 4D NIfTI bytes
pub fn save_nifti_series(series: &VolumeSeries, geometry: &NiftiGeometry) -> Result<Vec<u8>> {
    encode(&build_header(series.dims(), series.n_timepoints(), geometry)?, series.as_slice())
}

fn wants_gzip(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".nii.gz")
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| QcError::Io(format!("Failed to write file '{}': {}", path.display(), e)))
}

/// Read a NIfTI file from a filesystem path
pub fn read_nifti_file(path: &Path) -> Result<NiftiData> {
    let bytes = std::fs::read(path)
        .map_err(|e| QcError::Io(format!("Failed to read file '{}': {}", path.display(), e)))?;
    load_nifti(&bytes)
}

/// Read a 3D/4D NIfTI file as a volume series
pub fn read_nifti_series_file(path: &Path) -> Result<(VolumeSeries, NiftiGeometry)> {
    let bytes = std::fs::read(path)
        .map_err(|e| QcError::Io(format!("Failed to read file '{}': {}", path.display(), e)))?;
    let (series, geometry) = load_nifti_series(&bytes)?;
    info!(
        "Loaded '{}': {:?} x {} volumes",
        path.display(), series.dims(), series.n_timepoints()
    );
    Ok((series, geometry))
}

/// Read one 3D file per timepoint into a series
///
/// All files must share the first file's dimensions; the geometry of the
/// first file is returned.
pub fn read_volume_series_files(paths: &[PathBuf]) -> Result<(VolumeSeries, NiftiGeometry)> {
    let first = paths.first()
        .ok_or_else(|| QcError::Data("no input volumes given".to_string()))?;
    let first = read_nifti_file(first)?;
    let dims = first.dims;
    let geometry = first.geometry;

    let mut volumes = Vec::with_capacity(paths.len());
    volumes.push(first.data);
    for path in &paths[1..] {
        let nii = read_nifti_file(path)?;
        if nii.dims != dims {
            return Err(QcError::shape(
                &format!("volume '{}'", path.display()),
                format!("{:?}", dims),
                format!("{:?}", nii.dims),
            ));
        }
        volumes.push(nii.data);
    }

    debug!("Read {} volumes of {:?}", volumes.len(), dims);
    Ok((VolumeSeries::from_volumes(&volumes, dims)?, geometry))
}

/// Save a 3D volume to a file; `.nii.gz` paths are gzip compressed
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    dims: (usize, usize, usize),
    geometry: &NiftiGeometry,
) -> Result<()> {
    let bytes = if wants_gzip(path) {
        save_nifti_gz(data, dims, geometry)?
    } else {
        save_nifti(data, dims, geometry)?
    };
    write_file(path, &bytes)
}

/// Save a volume series as one 4D file; `.nii.gz` paths are gzip compressed
pub fn save_nifti_series_to_file(
    path: &Path,
    series: &VolumeSeries,
    geometry: &NiftiGeometry,
) -> Result<()> {
    let bytes = save_nifti_series(series, geometry)?;
    let bytes = if wants_gzip(path) { gzip(&bytes)? } else { bytes };
    write_file(path, &bytes)
}

/// Save a binary mask as a 0/1 float volume
pub fn save_mask_to_file(path: &Path, mask: &Mask, geometry: &NiftiGeometry) -> Result<()> {
    let data: Vec<f64> = mask.as_slice().iter().map(|&m| m as f64).collect();
    save_nifti_to_file(path, &data, mask.dims(), geometry)
}

/// Save a voxel-timepoint classification as a 0/1 float 4D series
pub fn save_classification_to_file(
    path: &Path,
    classification: &Classification,
    geometry: &NiftiGeometry,
) -> Result<()> {
    let data: Vec<f64> = classification.as_slice().iter().map(|&c| c as f64).collect();
    let series = VolumeSeries::new(data, classification.dims(), classification.n_timepoints())?;
    save_nifti_series_to_file(path, &series, geometry)
}

/// Split a NIfTI file name into (stem, extension), e.g. ("bold", ".nii.gz")
fn split_nifti_name(source: &Path) -> (String, &'static str) {
    let name = source.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Some(stem) = name.strip_suffix(".nii.gz") {
        (stem.to_string(), ".nii.gz")
    } else if let Some(stem) = name.strip_suffix(".nii") {
        (stem.to_string(), ".nii")
    } else {
        (name, ".nii")
    }
}

/// `source` with `prefix` put in front of its file name, in the same directory
pub fn prefixed_output_path(source: &Path, prefix: &str) -> PathBuf {
    let name = source.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    source.with_file_name(format!("{}{}", prefix, name))
}

/// Output path of despiked volume `t` for a series read from `source`
///
/// `bold.nii.gz` becomes `<out_dir>/dbold_0007.nii.gz` for t = 7.
pub fn despiked_volume_path(out_dir: &Path, source: &Path, t: usize) -> PathBuf {
    let (stem, ext) = split_nifti_name(source);
    out_dir.join(format!("{}{}_{:04}{}", DESPIKE_PREFIX, stem, t, ext))
}

/// Write one despiked 3D file per timepoint into `out_dir`
///
/// Returns the written paths in time order.
pub fn write_despiked_volumes(
    out_dir: &Path,
    source: &Path,
    series: &VolumeSeries,
    geometry: &NiftiGeometry,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| QcError::Io(format!("Failed to create '{}': {}", out_dir.display(), e)))?;

    let mut written = Vec::with_capacity(series.n_timepoints());
    for (t, vol) in series.volumes().enumerate() {
        let path = despiked_volume_path(out_dir, source, t);
        save_nifti_to_file(&path, vol, series.dims(), geometry)?;
        written.push(path);
    }
    info!("Wrote {} despiked volumes to '{}'", written.len(), out_dir.display());
    Ok(written)
}

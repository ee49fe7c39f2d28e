//! NIfTI-1 reading and writing for [`Volume`]s.
//!
//! Grid placement is taken from the sform when present, otherwise from
//! the qform quaternion; files are always written with an sform so the
//! ANTs tools see the same geometry we hold.

use std::path::Path;

use ndarray::{Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use neuroprep_pipeline::{Geometry, Volume};

use crate::error::AntsError;

/// NIFTI_XFORM_SCANNER_ANAT.
const XFORM_SCANNER_ANAT: i16 = 1;

/// Read a `.nii` or `.nii.gz` file as a single 3D volume.
///
/// A 4D file with one time point is accepted.
///
/// # Errors
///
/// Returns [`AntsError::Nifti`] if decoding fails, or
/// [`AntsError::UnsupportedShape`] for anything but one 3D volume.
pub fn read_volume(path: &Path) -> Result<Volume, AntsError> {
    let nifti_err = |source| AntsError::Nifti {
        path: path.to_path_buf(),
        source,
    };
    let object = ReaderOptions::new().read_file(path).map_err(nifti_err)?;
    let geometry = geometry_from_header(object.header());
    let array = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(nifti_err)?;

    let shape = array.shape().to_vec();
    let unsupported = || AntsError::UnsupportedShape {
        path: path.to_path_buf(),
        shape: shape.clone(),
    };
    let array = match shape.as_slice() {
        [_, _, _] => array,
        [_, _, _, 1] => array.index_axis_move(Axis(3), 0),
        _ => return Err(unsupported()),
    };
    let data = array.into_dimensionality::<Ix3>().map_err(|_| unsupported())?;
    tracing::debug!(path = %path.display(), shape = ?data.shape(), "read NIfTI");
    Ok(Volume::new(data, geometry))
}

/// Write a volume as float32 NIfTI. A `.gz` suffix compresses.
///
/// # Errors
///
/// Returns [`AntsError::Nifti`] if encoding or writing fails.
pub fn write_volume(volume: &Volume, path: &Path) -> Result<(), AntsError> {
    WriterOptions::new(path)
        .reference_header(&header_for(volume.geometry()))
        .write_nifti(volume.data())
        .map_err(|source| AntsError::Nifti {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::debug!(path = %path.display(), shape = ?volume.shape(), "wrote NIfTI");
    Ok(())
}

/// Voxel-to-world placement described by a header.
#[must_use]
pub fn geometry_from_header(header: &NiftiHeader) -> Geometry {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut geometry = Geometry::default();
        for j in 0..3 {
            let norm = rows
                .iter()
                .map(|row| f64::from(row[j]).powi(2))
                .sum::<f64>()
                .sqrt();
            let spacing = if norm > 0.0 { norm } else { 1.0 };
            geometry.spacing[j] = spacing;
            for (i, row) in rows.iter().enumerate() {
                geometry.direction[i][j] = f64::from(row[j]) / spacing;
            }
        }
        for (i, row) in rows.iter().enumerate() {
            geometry.origin[i] = f64::from(row[3]);
        }
        return geometry;
    }

    let mut spacing = [1.0; 3];
    for (axis, s) in spacing.iter_mut().enumerate() {
        let p = f64::from(header.pixdim[axis + 1]).abs();
        if p > 0.0 {
            *s = p;
        }
    }
    let origin = [
        f64::from(header.quatern_x),
        f64::from(header.quatern_y),
        f64::from(header.quatern_z),
    ];
    let direction = if header.qform_code > 0 {
        quaternion_rotation(header)
    } else {
        Geometry::default().direction
    };
    Geometry {
        spacing,
        origin,
        direction,
    }
}

/// Rotation matrix encoded by the qform quaternion, with the `qfac` sign
/// applied to the third column.
fn quaternion_rotation(header: &NiftiHeader) -> [[f64; 3]; 3] {
    let b = f64::from(header.quatern_b);
    let c = f64::from(header.quatern_c);
    let d = f64::from(header.quatern_d);
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            qfac * 2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            qfac * 2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            qfac * (a * a + d * d - b * b - c * c),
        ],
    ]
}

/// Header carrying `geometry` as an sform. Shape and data type are filled
/// in by the writer.
#[allow(clippy::cast_possible_truncation)]
fn header_for(geometry: &Geometry) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    header.pixdim[0] = 1.0;
    for axis in 0..3 {
        header.pixdim[axis + 1] = geometry.spacing[axis] as f32;
    }
    let row = |i: usize| -> [f32; 4] {
        let d = geometry.direction[i];
        let s = geometry.spacing;
        [
            (d[0] * s[0]) as f32,
            (d[1] * s[1]) as f32,
            (d[2] * s[2]) as f32,
            geometry.origin[i] as f32,
        ]
    };
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header.sform_code = XFORM_SCANNER_ANAT;
    header.qform_code = 0;
    header.quatern_x = geometry.origin[0] as f32;
    header.quatern_y = geometry.origin[1] as f32;
    header.quatern_z = geometry.origin[2] as f32;
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::Array3;

    use super::*;

    #[test]
    fn written_volume_reads_back_with_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let data = Array3::from_shape_fn((4, 3, 2), |(x, y, z)| (x * 100 + y * 10 + z) as f32);
        let geometry = Geometry {
            spacing: [2.0, 1.5, 3.0],
            origin: [-90.0, -126.0, -72.0],
            ..Geometry::default()
        };
        let volume = Volume::new(data, geometry);

        write_volume(&volume, &path).unwrap();
        let back = read_volume(&path).unwrap();

        assert_eq!(back.data(), volume.data());
        assert_eq!(back.geometry().spacing, [2.0, 1.5, 3.0]);
        assert_eq!(back.geometry().origin, [-90.0, -126.0, -72.0]);
        assert_eq!(back.geometry().direction, Geometry::default().direction);
    }

    #[test]
    fn qform_only_header_uses_pixdim_and_offset() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.pixdim = [1.0, 0.5, 0.5, 2.0, 0.0, 0.0, 0.0, 0.0];
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 0.0;
        header.quatern_x = 10.0;
        header.quatern_y = 20.0;
        header.quatern_z = 30.0;
        let geometry = geometry_from_header(&header);
        assert_eq!(geometry.spacing, [0.5, 0.5, 2.0]);
        assert_eq!(geometry.origin, [10.0, 20.0, 30.0]);
        assert_eq!(geometry.direction, Geometry::default().direction);
    }

    #[test]
    fn negative_qfac_flips_third_axis() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.pixdim[0] = -1.0;
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 0.0;
        let geometry = geometry_from_header(&header);
        assert_eq!(geometry.direction[2], [0.0, 0.0, -1.0]);
    }

    #[test]
    fn missing_file_is_nifti_error() {
        let err = read_volume(Path::new("/no/such/image.nii.gz")).unwrap_err();
        assert!(matches!(err, AntsError::Nifti { .. }));
    }
}

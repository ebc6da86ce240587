//! Minimal NumPy `.npy` reader/writer for depth maps.
//!
//! Covers exactly what the vicon depth exporter emits: version 1.x files,
//! little-endian `<f4` or `<f8`, C order, 2-D shape. Anything else is
//! rejected with [`DatasetError::Npy`].

use crate::dataset::DatasetError;
use nalgebra::DMatrix;
use std::fs;
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8] = b"\x93NUMPY";

fn npy_error(path: &Path, reason: impl Into<String>) -> DatasetError {
    DatasetError::Npy {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Extracts the value of `key` from the literal-dict header, e.g.
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (480, 752), }`.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("'{key}':");
    let start = header.find(&marker)? + marker.len();
    let rest = header[start..].trim_start();
    if let Some(stripped) = rest.strip_prefix('\'') {
        stripped.split('\'').next()
    } else if let Some(stripped) = rest.strip_prefix('(') {
        stripped.split(')').next()
    } else {
        rest.split([',', '}']).next().map(str::trim)
    }
}

/// Reads a 2-D float `.npy` file into an H×W matrix.
pub fn read_f32_matrix(path: &Path) -> Result<DMatrix<f32>, DatasetError> {
    let bytes = fs::read(path).map_err(|e| npy_error(path, e.to_string()))?;

    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(npy_error(path, "not a .npy file"));
    }
    let major = bytes[6];
    if major != 1 {
        return Err(npy_error(path, format!("unsupported version {major}")));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = 10 + header_len;
    if bytes.len() < data_start {
        return Err(npy_error(path, "truncated header"));
    }
    let header = std::str::from_utf8(&bytes[10..data_start])
        .map_err(|_| npy_error(path, "header is not valid UTF-8"))?;

    let descr = header_value(header, "descr")
        .ok_or_else(|| npy_error(path, "missing descr"))?;
    let fortran = header_value(header, "fortran_order")
        .ok_or_else(|| npy_error(path, "missing fortran_order"))?;
    if fortran.trim() != "False" {
        return Err(npy_error(path, "Fortran order is not supported"));
    }
    let shape = header_value(header, "shape")
        .ok_or_else(|| npy_error(path, "missing shape"))?;
    let dims: Vec<usize> = shape
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|_| npy_error(path, format!("bad shape ({shape})")))?;
    if dims.len() != 2 {
        return Err(npy_error(
            path,
            format!("expected a 2-D depth map, got {} dims", dims.len()),
        ));
    }
    let (rows, cols) = (dims[0], dims[1]);
    let data = &bytes[data_start..];

    let values: Vec<f32> = match descr {
        "<f4" => {
            if data.len() < rows * cols * 4 {
                return Err(npy_error(path, "truncated data"));
            }
            data.chunks_exact(4)
                .take(rows * cols)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
        "<f8" => {
            if data.len() < rows * cols * 8 {
                return Err(npy_error(path, "truncated data"));
            }
            data.chunks_exact(8)
                .take(rows * cols)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect()
        }
        other => {
            return Err(npy_error(path, format!("unsupported dtype {other}")));
        }
    };

    // C order means row-major.
    Ok(DMatrix::from_row_iterator(rows, cols, values))
}

/// Writes a matrix as a `<f4`, C-order, version 1.0 `.npy` file.
pub fn write_f32_matrix(path: &Path, matrix: &DMatrix<f32>) -> Result<(), DatasetError> {
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        matrix.nrows(),
        matrix.ncols()
    );
    // Total header size (including the 10 magic/length bytes) padded to a
    // multiple of 64 and newline-terminated, as NumPy expects.
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut file = fs::File::create(path).map_err(|e| npy_error(path, e.to_string()))?;
    file.write_all(MAGIC)
        .and_then(|_| file.write_all(&[1, 0]))
        .and_then(|_| file.write_all(&(header.len() as u16).to_le_bytes()))
        .and_then(|_| file.write_all(header.as_bytes()))
        .map_err(|e| npy_error(path, e.to_string()))?;

    for r in 0..matrix.nrows() {
        for c in 0..matrix.ncols() {
            file.write_all(&matrix[(r, c)].to_le_bytes())
                .map_err(|e| npy_error(path, e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.npy");

        let depth = DMatrix::from_row_slice(2, 3, &[0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);
        write_f32_matrix(&path, &depth).unwrap();

        let loaded = read_f32_matrix(&path).unwrap();
        assert_eq!(loaded.shape(), (2, 3));
        for r in 0..2 {
            for c in 0..3 {
                assert_relative_eq!(loaded[(r, c)], depth[(r, c)]);
            }
        }
    }

    #[test]
    fn test_rejects_non_npy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.npy");
        fs::write(&path, b"definitely not numpy").unwrap();
        assert!(matches!(
            read_f32_matrix(&path),
            Err(DatasetError::Npy { .. })
        ));
    }

    #[test]
    fn test_rejects_unsupported_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ints.npy");
        let header = "{'descr': '<i8', 'fortran_order': False, 'shape': (1, 1), }\n";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&42i64.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_f32_matrix(&path),
            Err(DatasetError::Npy { reason, .. }) if reason.contains("dtype")
        ));
    }
}

//! Binary persistence for distance grids.
//!
//! Layout (little-endian):
//!
//! | Offset | Type     | Field                         |
//! |--------|----------|-------------------------------|
//! | 0      | u32 × 3  | Nx, Ny, Nz                    |
//! | 12     | f64 × 3  | origin x, y, z                |
//! | 36     | f64      | resolution                    |
//! | 44     | f64      | max distance                  |
//! | 52     | f32 × N  | cell distances, x-fastest     |
//!
//! Interpolation coefficients are not stored; they are rebuilt on load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use super::{DistanceGrid, GridGeometry};
use crate::error::GridError;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 3 * 4 + 5 * 8;

impl DistanceGrid {
    /// Serialize into any writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), GridError> {
        let g = self.geometry();
        for dim in g.dims {
            writer.write_all(&dim.to_le_bytes())?;
        }
        for value in [
            g.origin[0],
            g.origin[1],
            g.origin[2],
            g.resolution,
            g.max_distance,
        ] {
            writer.write_all(&value.to_le_bytes())?;
        }

        let mut body = Vec::with_capacity(self.len() * 4);
        for value in self.cells() {
            body.extend_from_slice(&value.to_le_bytes());
        }
        writer.write_all(&body)?;
        Ok(())
    }

    /// Deserialize from any reader. The reader must end right after the body.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, GridError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        if data.len() < HEADER_LEN {
            return Err(GridError::Truncated {
                expected: HEADER_LEN,
                found: data.len(),
            });
        }

        let dims = [
            read_u32(&data, 0),
            read_u32(&data, 4),
            read_u32(&data, 8),
        ];
        let geometry = GridGeometry {
            dims,
            origin: [read_f64(&data, 12), read_f64(&data, 20), read_f64(&data, 28)],
            resolution: read_f64(&data, 36),
            max_distance: read_f64(&data, 44),
        };
        geometry.validate()?;

        let body_len = geometry
            .cell_count()
            .checked_mul(4)
            .ok_or_else(|| GridError::InvalidGeometry(format!("{dims:?} overflows")))?;
        let expected = HEADER_LEN + body_len;
        if data.len() < expected {
            return Err(GridError::Truncated {
                expected,
                found: data.len(),
            });
        }
        if data.len() > expected {
            return Err(GridError::SizeMismatch(data.len() - expected));
        }

        let cells: Vec<f32> = data[HEADER_LEN..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Self::from_cells(geometry, cells)
    }

    /// Write the grid to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GridError> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        debug!("Saved distance grid to {}", path.display());
        Ok(())
    }

    /// Read a grid from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GridError> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let grid = Self::read_from(&mut reader)?;
        debug!(
            "Loaded distance grid {:?} from {}",
            grid.dims(),
            path.display()
        );
        Ok(grid)
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_f64(data: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridConfig;

    fn small_grid() -> DistanceGrid {
        let geometry = GridGeometry {
            origin: [-1.5, 0.25, 3.0],
            resolution: 0.25,
            dims: [3, 2, 2],
            max_distance: 0.75,
        };
        let cells = (0..12).map(|i| i as f32 * 0.0625).collect();
        DistanceGrid::from_cells(geometry, cells).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let grid = small_grid();
        let mut bytes = Vec::new();
        grid.write_to(&mut bytes).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 12 * 4);
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..20], &(-1.5f64).to_le_bytes());
        assert_eq!(&bytes[36..44], &0.25f64.to_le_bytes());
        assert_eq!(&bytes[44..52], &0.75f64.to_le_bytes());
        // First two cells, x-fastest.
        assert_eq!(&bytes[52..56], &0.0f32.to_le_bytes());
        assert_eq!(&bytes[56..60], &0.0625f32.to_le_bytes());
    }

    #[test]
    fn test_file_roundtrip_is_bit_exact() {
        let points: Vec<[f32; 3]> = (0..50)
            .map(|i| [(i as f32 * 0.37).sin(), (i as f32 * 0.11).cos(), i as f32 * 0.02])
            .collect();
        let config = GridConfig {
            resolution: 0.1,
            max_distance: 0.4,
            margin: 0.2,
        };
        let grid = DistanceGrid::from_points(&points, &config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.grid");
        grid.save(&path).unwrap();
        let loaded = DistanceGrid::load(&path).unwrap();

        assert_eq!(loaded.geometry(), grid.geometry());
        let original_bits: Vec<u32> = grid.cells().iter().map(|v| v.to_bits()).collect();
        let loaded_bits: Vec<u32> = loaded.cells().iter().map(|v| v.to_bits()).collect();
        assert_eq!(original_bits, loaded_bits);
    }

    #[test]
    fn test_truncated_body() {
        let mut bytes = Vec::new();
        small_grid().write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);

        let result = DistanceGrid::read_from(&mut bytes.as_slice());
        assert!(matches!(
            result,
            Err(GridError::Truncated { expected, found }) if expected == HEADER_LEN + 48 && found == HEADER_LEN + 45
        ));
    }

    #[test]
    fn test_truncated_header_and_trailing_bytes() {
        let short = [0u8; 20];
        assert!(matches!(
            DistanceGrid::read_from(&mut short.as_slice()),
            Err(GridError::Truncated { found: 20, .. })
        ));

        let mut bytes = Vec::new();
        small_grid().write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&[1, 2]);
        assert!(matches!(
            DistanceGrid::read_from(&mut bytes.as_slice()),
            Err(GridError::SizeMismatch(2))
        ));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let mut bytes = Vec::new();
        small_grid().write_to(&mut bytes).unwrap();
        bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            DistanceGrid::read_from(&mut bytes.as_slice()),
            Err(GridError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = DistanceGrid::load(dir.path().join("absent.grid"));
        assert!(matches!(result, Err(GridError::Io(_))));
    }
}

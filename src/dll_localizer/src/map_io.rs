//! Map loading at startup.
//!
//! The distance grid is expensive to build, so it is cached next to the map:
//! the first run voxelizes the map cloud and writes the grid, later runs load
//! the grid directly.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dll_core::{build_aligner, AlignMethod, Aligner, DistanceGrid, GridConfig, TrilinearField};
use tracing::{info, warn};

use crate::error::NodeError;
use crate::params::DllParams;
use crate::pointcloud::{decode_packed_xyz, PointField, FLOAT32};

const LOGGER_NAME: &str = "dll_localizer.map_io";

/// Read a cloud from `.pcd` (ASCII or binary) or whitespace-separated XYZ text.
///
/// Non-finite points are skipped.
pub fn load_map_cloud(path: impl AsRef<Path>) -> Result<Vec<[f32; 3]>> {
    let path = path.as_ref();
    let text = fs::read(path).with_context(|| format!("cannot read cloud {}", path.display()))?;

    let is_pcd = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pcd"));
    let points = if is_pcd {
        parse_pcd(&text).with_context(|| format!("invalid PCD file {}", path.display()))?
    } else {
        let text = std::str::from_utf8(&text)
            .with_context(|| format!("cloud {} is not UTF-8 text", path.display()))?;
        parse_xyz(text).with_context(|| format!("invalid XYZ file {}", path.display()))?
    };

    info!(
        target: LOGGER_NAME,
        "Loaded {} points from {}",
        points.len(),
        path.display()
    );
    Ok(points)
}

/// One `x y z` triple per line; `#` starts a comment, extra columns are
/// ignored.
pub fn parse_xyz(text: &str) -> Result<Vec<[f32; 3]>> {
    let mut points = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut values = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::parse::<f32>);
        let mut next = || -> Result<f32> {
            values
                .next()
                .ok_or_else(|| anyhow!("line {}: expected three values", number + 1))?
                .with_context(|| format!("line {}: bad number", number + 1))
        };
        let point = [next()?, next()?, next()?];
        if point.iter().all(|v| v.is_finite()) {
            points.push(point);
        }
    }
    Ok(points)
}

/// PCD with `x`, `y`, `z` among its fields, `DATA ascii` or `DATA binary`.
pub fn parse_pcd(bytes: &[u8]) -> Result<Vec<[f32; 3]>> {
    let mut fields: Vec<String> = Vec::new();
    let mut sizes: Vec<u32> = Vec::new();
    let mut types: Vec<String> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    let mut width = 0u32;
    let mut height = 1u32;
    let mut num_points = None;
    let mut body = None;

    let mut offset = 0;
    for line in bytes.split(|b| *b == b'\n') {
        let line_len = line.len() + 1;
        let text = std::str::from_utf8(line).context("header is not UTF-8")?.trim();
        offset += line_len;
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let mut tokens = text.split_whitespace();
        let key = tokens.next().unwrap_or_default().to_ascii_uppercase();
        match key.as_str() {
            "FIELDS" => fields = tokens.map(str::to_string).collect(),
            "SIZE" => sizes = parse_list(tokens).context("bad SIZE line")?,
            "TYPE" => types = tokens.map(str::to_ascii_uppercase).collect(),
            "COUNT" => counts = parse_list(tokens).context("bad COUNT line")?,
            "WIDTH" => width = parse_one(tokens).context("bad WIDTH line")?,
            "HEIGHT" => height = parse_one(tokens).context("bad HEIGHT line")?,
            "POINTS" => num_points = Some(parse_one::<u32>(tokens).context("bad POINTS line")?),
            "DATA" => {
                body = Some((
                    tokens.next().unwrap_or_default().to_string(),
                    offset.min(bytes.len()),
                ));
                break;
            }
            _ => {}
        }
    }

    let (format, body_start) = body.ok_or_else(|| anyhow!("missing DATA line"))?;
    if counts.is_empty() {
        counts = vec![1; fields.len()];
    }
    if counts.len() != fields.len() {
        bail!("FIELDS and COUNT disagree");
    }

    match format.as_str() {
        "ascii" => parse_pcd_ascii(&bytes[body_start..], &fields, &counts),
        "binary" => {
            if sizes.len() != fields.len() || types.len() != fields.len() {
                bail!("binary PCD needs SIZE and TYPE for every field");
            }
            let mut packed = Vec::with_capacity(fields.len());
            let mut point_step = 0u32;
            for (((name, size), kind), count) in fields.iter().zip(&sizes).zip(&types).zip(&counts) {
                let datatype = pcd_datatype(kind, *size)
                    .ok_or_else(|| anyhow!("field '{name}' has unsupported type {kind}{size}"))?;
                packed.push(PointField {
                    name: name.clone(),
                    offset: point_step,
                    datatype,
                    count: *count as u32,
                });
                point_step += size * *count as u32;
            }
            let (width, height) = match num_points {
                Some(n) if n != width * height => (n, 1),
                _ => (width, height),
            };
            let points = decode_packed_xyz(&packed, point_step, &bytes[body_start..], width, height)?;
            Ok(points)
        }
        other => bail!("DATA {other} is not supported, only ascii and binary"),
    }
}

fn parse_pcd_ascii(body: &[u8], fields: &[String], counts: &[usize]) -> Result<Vec<[f32; 3]>> {
    // Column of each field's first element.
    let mut columns = Vec::with_capacity(fields.len());
    let mut column = 0;
    for count in counts {
        columns.push(column);
        column += count;
    }
    let column_of = |name: &str| -> Result<usize> {
        fields
            .iter()
            .position(|f| f == name)
            .map(|i| columns[i])
            .ok_or_else(|| anyhow!("missing '{name}' field"))
    };
    let (cx, cy, cz) = (column_of("x")?, column_of("y")?, column_of("z")?);

    let body = std::str::from_utf8(body).context("body is not UTF-8")?;
    let mut points = Vec::new();
    for (number, line) in body.lines().enumerate() {
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.is_empty() {
            continue;
        }
        let read = |c: usize| -> Result<f32> {
            values
                .get(c)
                .ok_or_else(|| anyhow!("data row {}: too few columns", number + 1))?
                .parse::<f32>()
                .with_context(|| format!("data row {}: bad number", number + 1))
        };
        let point = [read(cx)?, read(cy)?, read(cz)?];
        if point.iter().all(|v| v.is_finite()) {
            points.push(point);
        }
    }
    Ok(points)
}

/// Packed-record datatype code of a PCD `TYPE`/`SIZE` pair.
fn pcd_datatype(kind: &str, size: u32) -> Option<u8> {
    match (kind, size) {
        ("I", 1) => Some(1),
        ("U", 1) => Some(2),
        ("I", 2) => Some(3),
        ("U", 2) => Some(4),
        ("I", 4) => Some(5),
        ("U", 4) => Some(6),
        ("F", 4) => Some(FLOAT32),
        ("F", 8) => Some(8),
        _ => None,
    }
}

fn parse_list<'a, T: std::str::FromStr>(tokens: impl Iterator<Item = &'a str>) -> Result<Vec<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    tokens.map(|t| Ok(t.parse::<T>()?)).collect()
}

fn parse_one<'a, T: std::str::FromStr>(mut tokens: impl Iterator<Item = &'a str>) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(tokens.next().ok_or_else(|| anyhow!("missing value"))?.parse::<T>()?)
}

/// Load the grid from `grid_path`, or build it from `map_path` and cache it.
///
/// Returns the map cloud as well when it had to be read.
pub fn load_or_build_grid(
    grid_path: Option<&Path>,
    map_path: Option<&Path>,
    config: &GridConfig,
) -> Result<(DistanceGrid, Option<Vec<[f32; 3]>>)> {
    if let Some(grid_path) = grid_path.filter(|p| p.exists()) {
        let grid = DistanceGrid::load(grid_path).map_err(|source| NodeError::GridLoadFailed {
            path: grid_path.to_path_buf(),
            source,
        })?;
        if (grid.resolution() - config.resolution).abs() > 1e-9 {
            warn!(
                target: LOGGER_NAME,
                "Cached grid {} has resolution {}, configured {}; using the cache",
                grid_path.display(),
                grid.resolution(),
                config.resolution
            );
        }
        info!(
            target: LOGGER_NAME,
            "Loaded grid {:?} from {}",
            grid.dims(),
            grid_path.display()
        );
        return Ok((grid, None));
    }

    let map_path = map_path.ok_or_else(|| anyhow!("no grid cache and no map_path configured"))?;
    let cloud = load_map_cloud(map_path)?;
    let grid = DistanceGrid::from_points(&cloud, config).map_err(|source| {
        NodeError::GridLoadFailed {
            path: map_path.to_path_buf(),
            source,
        }
    })?;
    info!(
        target: LOGGER_NAME,
        "Built grid {:?} at {} m from {}",
        grid.dims(),
        grid.resolution(),
        map_path.display()
    );

    if let Some(grid_path) = grid_path {
        match grid.save(grid_path) {
            Ok(()) => info!(target: LOGGER_NAME, "Cached grid at {}", grid_path.display()),
            Err(err) => warn!(
                target: LOGGER_NAME,
                "Could not cache grid at {}: {err}",
                grid_path.display()
            ),
        }
    }
    Ok((grid, Some(cloud)))
}

/// Grid, field and aligner for `params`, ready to hand to the node.
pub fn load_aligner(params: &DllParams) -> Result<Box<dyn Aligner>> {
    let grid_path: Option<PathBuf> = params.resolved_grid_path();
    let map_path = (!params.map_path.is_empty()).then(|| PathBuf::from(&params.map_path));

    let (grid, mut cloud) =
        load_or_build_grid(grid_path.as_deref(), map_path.as_deref(), &params.grid)?;

    let needs_cloud = matches!(params.align_method, AlignMethod::Ndt | AlignMethod::Icp);
    if needs_cloud && cloud.is_none() {
        let map_path = map_path.as_deref().ok_or_else(|| {
            anyhow!("align_method {} needs map_path", params.align_method.id())
        })?;
        cloud = Some(load_map_cloud(map_path)?);
    }

    let field = Arc::new(TrilinearField::new(grid));
    let aligner = build_aligner(
        params.align_method,
        field,
        cloud.as_deref(),
        &params.aligner_config(),
    )
    .map_err(NodeError::from)?;
    Ok(aligner)
}

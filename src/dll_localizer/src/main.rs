use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dll_core::{DistanceGrid, GridConfig};
use dll_localizer::{
    load_aligner, load_map_cloud, write_tum_pose, DllNode, DllParams, NodeEvent, NodeRuntime,
    ReplaySequence, SystemClock, TfBuffer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const NODE_NAME: &str = "dll_localizer";

/// 3D LiDAR localization against a prebuilt map.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Voxelize a map cloud into a distance grid file.
    BuildGrid {
        /// Map cloud, `.pcd` (ASCII) or XYZ text.
        #[arg(long)]
        map: PathBuf,
        /// Output grid path.
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = GridConfig::default().resolution)]
        resolution: f64,
        #[arg(long, default_value_t = GridConfig::default().max_distance)]
        max_distance: f64,
        #[arg(long, default_value_t = GridConfig::default().margin)]
        margin: f64,
    },
    /// Localize a recorded sequence until it ends or is interrupted.
    Run {
        /// Sequence manifest (YAML).
        #[arg(long)]
        sequence: PathBuf,
        /// YAML parameter file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Playback speed relative to the recorded stamps.
        #[arg(long, default_value_t = 1.0)]
        rate: f64,
        /// Write the estimated base poses here (TUM format).
        #[arg(long)]
        trajectory: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dll_localizer=info,dll_core=info")),
        )
        .init();

    match Args::parse().command {
        Command::BuildGrid {
            map,
            out,
            resolution,
            max_distance,
            margin,
        } => build_grid(
            map,
            out,
            GridConfig {
                resolution,
                max_distance,
                margin,
            },
        ),
        Command::Run {
            sequence,
            config,
            rate,
            trajectory,
        } => run(sequence, config, rate, trajectory),
    }
}

fn build_grid(map: PathBuf, out: PathBuf, config: GridConfig) -> Result<()> {
    config.validate().context("invalid grid settings")?;
    let points = load_map_cloud(&map)?;
    let grid = DistanceGrid::from_points(&points, &config)
        .with_context(|| format!("cannot build grid from {}", map.display()))?;
    grid.save(&out)
        .with_context(|| format!("cannot write grid {}", out.display()))?;
    info!(
        target: NODE_NAME,
        "Wrote {:?} grid ({} cells) to {}",
        grid.dims(),
        grid.len(),
        out.display()
    );
    Ok(())
}

fn run(
    sequence_path: PathBuf,
    config: Option<PathBuf>,
    rate: f64,
    trajectory: Option<PathBuf>,
) -> Result<()> {
    if !(rate > 0.0) {
        bail!("--rate must be positive, got {rate}");
    }
    let params = match &config {
        Some(path) => DllParams::load(path)
            .with_context(|| format!("cannot load parameters from {}", path.display()))?,
        None => DllParams::default(),
    };
    let sequence = ReplaySequence::load(&sequence_path)?;
    let mut trajectory = match &trajectory {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        )),
        None => None,
    };

    let aligner = load_aligner(&params).context("cannot prepare the map")?;
    let tf = Arc::new(TfBuffer::new());
    tf.set_transform(
        &params.base_frame_id,
        &sequence.sensor_frame,
        sequence.sensor_transform(),
        0,
        true,
    );
    let odom_frame = params.odom_frame_id.clone();
    let base_frame = params.base_frame_id.clone();
    let global_frame = params.global_frame_id.clone();
    let stream = params.in_cloud.clone();
    let tick = params.tick_period();
    let first = &sequence.frames[0];
    tf.set_transform(&odom_frame, &base_frame, first.odom_transform(), first.stamp_ns(), false);

    let node = DllNode::new(params, aligner, tf.clone(), tf.clone())?;
    let runtime = NodeRuntime::spawn(node, Arc::new(SystemClock))
        .context("cannot start the localizer thread")?;
    let shutdown = runtime.shutdown_flag();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))?;

    let sender = runtime.sender();
    if let Some(msg) = sequence.initial_pose_msg(&global_frame) {
        sender.send(NodeEvent::InitialPose(msg))?;
    }

    info!(
        target: NODE_NAME,
        "Replaying {} clouds from {} on {}",
        sequence.frames.len(),
        sequence_path.display(),
        stream
    );
    let shutdown = runtime.shutdown_flag();
    let started = Instant::now();
    for frame in &sequence.frames {
        if shutdown.load(Ordering::SeqCst) {
            warn!(target: NODE_NAME, "Interrupted at stamp {:.3}", frame.stamp);
            break;
        }
        let due = Duration::from_secs_f64((frame.stamp - first.stamp) / rate);
        if let Some(wait) = due.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }

        let cloud = sequence.load_cloud(frame)?;
        let odom = frame.odom_transform();
        tf.set_transform(&odom_frame, &base_frame, odom, frame.stamp_ns(), false);
        sender
            .send(NodeEvent::Cloud(cloud))
            .context("localizer thread stopped")?;

        if let Some(out) = trajectory.as_mut() {
            write_tum_pose(out, frame.stamp_ns(), &(runtime.correction().get() * odom))?;
        }
    }

    // Give the last cloud a tick to be handled.
    thread::sleep(tick * 2);
    let correction = runtime.correction().get();
    runtime.shutdown();
    if let Some(mut out) = trajectory {
        out.flush()?;
    }
    info!(
        target: NODE_NAME,
        "Replay finished, final correction {:?}",
        correction.translation.vector
    );
    Ok(())
}

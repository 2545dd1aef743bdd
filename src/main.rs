//! Command-line driver for a simulated diffractometer.
//!
//! Usage:
//!   rust_diffractometer move-to-beam --x 400 --y 300
//!   rust_diffractometer manual --click 380,290 --click 390,280 --click 385,295
//!   rust_diffractometer automatic --loop-only
//!   rust_diffractometer move --motor phi=90 --motor sampx=0.2
//!
//! Set `RUST_LOG=debug` to override the configured log level.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rust_diffractometer::centring::{CentringRequest, CentringState};
use rust_diffractometer::config::DiffractometerConfig;
use rust_diffractometer::hardware::mock::{
    MockBeamInfo, MockCamera, MockLoopFinder, MockMotor,
};
use rust_diffractometer::hardware::Motor;
use rust_diffractometer::resolver::{PixelPoint, BEAM_X, BEAM_Y};
use rust_diffractometer::{Diffractometer, DiffractometerBuilder, MotorPositionMap};

/// Simulated sample camera size.
const FRAME: (u32, u32) = (768, 576);
/// Scale used when the configuration does not set one.
const DEFAULT_PIXELS_PER_MM: f64 = 500.0;

/// Drive the centring engine against simulated hardware
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); defaults and environment only when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Centre a pixel without user interaction
    MoveToBeam {
        /// Pixel x (default: beam position)
        #[arg(long, requires = "y")]
        x: Option<f64>,
        /// Pixel y (default: beam position)
        #[arg(long, requires = "x")]
        y: Option<f64>,
        /// Rotation angle for the result
        #[arg(long)]
        omega: Option<f64>,
    },
    /// Manual centring fed with scripted clicks
    Manual {
        /// Click position as x,y; repeat once per required point
        #[arg(long = "click", value_parser = parse_point)]
        clicks: Vec<PixelPoint>,
    },
    /// Automatic centring with a simulated loop finder
    Automatic {
        /// Restrict the search to the loop outline
        #[arg(long)]
        loop_only: bool,
    },
    /// Move motors to absolute positions
    Move {
        /// Target as name=value; repeatable
        #[arg(long = "motor", value_parser = parse_target, required = true)]
        targets: Vec<(String, f64)>,
    },
}

fn parse_point(s: &str) -> std::result::Result<PixelPoint, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got '{}'", s))?;
    let x = x.trim().parse().map_err(|e| format!("bad x '{}': {}", x, e))?;
    let y = y.trim().parse().map_err(|e| format!("bad y '{}': {}", y, e))?;
    Ok(PixelPoint::new(x, y))
}

fn parse_target(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value but got '{}'", s))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value for '{}': {}", name, e))?;
    Ok((name.trim().to_string(), value))
}

async fn simulated_diffractometer(config: DiffractometerConfig) -> Result<Diffractometer> {
    let motors: Vec<Arc<dyn Motor>> = config
        .used_motors
        .iter()
        .filter(|name| name.as_str() != BEAM_X && name.as_str() != BEAM_Y)
        .map(|name| Arc::new(MockMotor::with_speed(name.as_str(), 90.0)) as Arc<dyn Motor>)
        .collect();
    let centre = PixelPoint::new(f64::from(FRAME.0) / 2.0, f64::from(FRAME.1) / 2.0);
    let finder = MockLoopFinder::new([
        None,
        Some(PixelPoint::new(centre.x + 12.0, centre.y - 4.0)),
        Some(PixelPoint::new(centre.x + 8.0, centre.y + 2.0)),
        Some(PixelPoint::new(centre.x + 10.0, centre.y - 1.0)),
    ])
    .with_delay(Duration::from_millis(50));
    let needs_scale = config.pixels_per_mm.is_none();

    let diffractometer = DiffractometerBuilder::new(config)
        .with_motors(motors)
        .with_camera(Arc::new(MockCamera::new(FRAME.0, FRAME.1)))
        .with_beam_info(Arc::new(MockBeamInfo::new(centre)))
        .with_loop_finder(Arc::new(finder))
        .build()
        .await?;
    if needs_scale {
        diffractometer
            .set_pixels_per_mm(DEFAULT_PIXELS_PER_MM, DEFAULT_PIXELS_PER_MM)
            .await?;
    }
    Ok(diffractometer)
}

async fn run_manual(diffractometer: &Diffractometer, clicks: Vec<PixelPoint>) -> Result<()> {
    let required = diffractometer.config().clicks_required;
    if clicks.len() < required {
        bail!("manual centring needs {} clicks, got {}", required, clicks.len());
    }

    let session = {
        let diffractometer = diffractometer.clone();
        tokio::spawn(async move {
            diffractometer
                .start_centring(CentringRequest::Manual, None, true)
                .await
        })
    };

    for click in clicks.into_iter().take(required) {
        while diffractometer.centring_state().await? != CentringState::AwaitingUserInput {
            if session.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        diffractometer.image_clicked(click.x, click.y).await?;
    }

    let status = session.await.context("centring task failed")??;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DiffractometerConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DiffractometerConfig::from_env()?,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let diffractometer = simulated_diffractometer(config).await?;

    let mut events = diffractometer.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("event: {}", json),
                Err(err) => log::warn!("Could not serialise event: {}", err),
            }
        }
    });

    match args.command {
        Command::MoveToBeam { x, y, omega } => {
            let point = x.zip(y).map(|(x, y)| PixelPoint::new(x, y));
            let status = diffractometer
                .start_centring(CentringRequest::MoveToBeam { point, omega }, None, true)
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Manual { clicks } => run_manual(&diffractometer, clicks).await?,
        Command::Automatic { loop_only } => {
            let status = diffractometer
                .start_centring(CentringRequest::Automatic { loop_only }, None, true)
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Move { targets } => {
            let positions: MotorPositionMap = targets.into_iter().collect();
            diffractometer.move_motors(&positions).await?;
        }
    }

    println!(
        "positions: {}",
        serde_json::to_string(&diffractometer.positions().await?)?
    );
    diffractometer.shutdown().await?;
    drop(diffractometer);
    printer.abort();
    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use yologuard_core::{
    ArcFaceEmbedder, Detector, Embedder, Frame, PersonMetadata, ProcessingDevice, ScrfdDetector,
};
use yologuard_hw::{Camera, CameraSettings};

#[zbus::proxy(
    interface = "org.yologuard.Guard1",
    default_service = "org.yologuard.Guard1",
    default_path = "/org/yologuard/Guard1"
)]
trait Guard {
    async fn status(&self) -> zbus::Result<String>;
    async fn latest(&self) -> zbus::Result<String>;
    async fn enroll(&self, request_json: &str) -> zbus::Result<u64>;
    async fn remove(&self, id: u64) -> zbus::Result<u64>;
    async fn list_persons(&self) -> zbus::Result<String>;
    async fn search(&self, query: &str) -> zbus::Result<String>;
    async fn recent_events(&self, limit: u32) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn set_threshold(&self, threshold: f64) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "yologuard", about = "YoloGuard access-control CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EnrollArgs {
    /// Student / staff code
    #[arg(long)]
    id: u64,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    faculty: String,
    #[arg(long, default_value = "")]
    program: String,
    #[arg(long, default_value = "")]
    role: String,
    #[arg(long, default_value = "")]
    access_type: String,
    #[arg(long, default_value = "")]
    campus: String,
    #[arg(long, default_value = "")]
    extension: String,
    #[arg(long, default_value = "")]
    semester: String,
    /// Directory with det_10g.onnx and w600k_r50.onnx
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long, default_value = "auto")]
    device: ProcessingDevice,
    /// Face photos, one face each
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from face photos
    Enroll(EnrollArgs),
    /// List enrolled persons
    List,
    /// Search enrolled persons by name or id
    Search { query: String },
    /// Remove an enrolled person
    Remove {
        /// Person id to remove
        id: u64,
    },
    /// Show daemon status
    Status,
    /// Show the latest annotated frame
    Latest,
    /// Show recent access events
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Access counts for today and per person
    Stats,
    /// Change the acceptance threshold of the running daemon
    Threshold { value: f64 },
    /// Run camera diagnostics
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

async fn connect(session: bool) -> Result<GuardProxy<'static>> {
    let conn = match session {
        true => zbus::Connection::session().await,
        false => zbus::Connection::system().await,
    }
    .context("cannot connect to D-Bus")?;
    GuardProxy::new(&conn)
        .await
        .context("yologuardd is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Detect the most confident face in each image and embed it.
fn embeddings_from_images(args: &EnrollArgs) -> Result<Vec<Vec<f32>>> {
    let model_dir = args
        .model_dir
        .clone()
        .unwrap_or_else(yologuard_core::default_model_dir);
    let mut detector = ScrfdDetector::load(
        &model_dir.join(yologuard_core::SCRFD_MODEL_FILE),
        args.device,
    )?;
    let mut embedder = ArcFaceEmbedder::load(
        &model_dir.join(yologuard_core::ARCFACE_MODEL_FILE),
        args.device,
        yologuard_core::PipelineConfig::default().min_face_size,
    )?;

    let mut out = Vec::with_capacity(args.images.len());
    for (i, path) in args.images.iter().enumerate() {
        let frame = load_gray(path, i as u64)?;
        let detections = detector.detect(&frame)?;
        tracing::debug!(path = %path.display(), faces = detections.len(), "detected faces");
        let Some(best) = detections
            .iter()
            .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence))
        else {
            eprintln!("  {}: no face found, skipped", path.display());
            continue;
        };
        let Some(crop) = frame.crop(&best.bbox) else {
            eprintln!("  {}: face outside image, skipped", path.display());
            continue;
        };
        let embedding = embedder
            .embed(&crop)
            .with_context(|| format!("embedding {}", path.display()))?;
        println!(
            "  {}: face {:.0}x{:.0} (confidence {:.2})",
            path.display(),
            best.bbox.width,
            best.bbox.height,
            best.bbox.confidence
        );
        out.push(embedding.values);
    }

    if out.is_empty() {
        bail!("no usable face in any image");
    }
    Ok(out)
}

fn load_gray(path: &Path, sequence: u64) -> Result<Frame> {
    let img = image::open(path)
        .with_context(|| format!("cannot read {}", path.display()))?
        .to_luma8();
    let (width, height) = img.dimensions();
    Ok(Frame::new(img.into_raw(), width, height, sequence))
}

fn camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Capture devices:");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("  (none)");
    }
    for d in &devices {
        println!("  {}  {} [{}] {}", d.path, d.name, d.driver, d.bus);
    }

    let settings = CameraSettings {
        device: device.to_string(),
        open_attempts: 1,
        ..CameraSettings::default()
    };
    let camera = Camera::open(&settings)?;
    println!(
        "\nOpened {}: {}x{} {:?}",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );
    let mut stream = camera.into_stream()?;

    let mut captured = 0;
    let started = std::time::Instant::now();
    while captured < frames && started.elapsed() < Duration::from_secs(10) {
        let raw = match stream.next_gray() {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) if e.is_frame_local() => {
                println!("  skipped: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let frame = Frame::new(raw.data, raw.width, raw.height, captured as u64);
        println!(
            "  frame {:>3}: {}x{} brightness {:>6.1}{}",
            captured,
            frame.width,
            frame.height,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        captured += 1;
    }
    if captured == 0 {
        bail!("no frames received from {device}");
    }
    let elapsed = started.elapsed().as_secs_f32();
    println!("\n{captured} frames in {elapsed:.2}s ({:.1} fps)", captured as f32 / elapsed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll(args) => {
            println!("Enrolling {} ({}) from {} image(s)", args.name, args.id, args.images.len());
            let embeddings = embeddings_from_images(&args)?;
            let metadata = PersonMetadata {
                faculty: args.faculty,
                program: args.program,
                role: args.role,
                access_type: args.access_type,
                campus: args.campus,
                extension: args.extension,
                semester: args.semester,
            };
            let request = serde_json::json!({
                "id": args.id,
                "name": args.name,
                "metadata": metadata,
                "embeddings": embeddings,
            });
            let proxy = connect(cli.session).await?;
            let version = proxy.enroll(&request.to_string()).await?;
            println!("Enrolled with {} embedding(s), gallery version {version}", embeddings.len());
        }
        Commands::List => {
            let proxy = connect(cli.session).await?;
            let persons: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.list_persons().await?)?;
            if persons.is_empty() {
                println!("No persons enrolled");
            }
            for p in &persons {
                println!(
                    "{:>10}  {:<30} {:<20} {} embedding(s)",
                    p["id"],
                    p["name"].as_str().unwrap_or_default(),
                    p["metadata"]["role"].as_str().unwrap_or_default(),
                    p["embeddings"]
                );
            }
        }
        Commands::Search { query } => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.search(&query).await?)?;
        }
        Commands::Remove { id } => {
            let proxy = connect(cli.session).await?;
            let version = proxy.remove(id).await?;
            println!("Removed {id}, gallery version {version}");
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Latest => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.latest().await?)?;
        }
        Commands::Events { limit } => {
            let proxy = connect(cli.session).await?;
            let events: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.recent_events(limit).await?)?;
            for e in &events {
                println!(
                    "{}  {:<30} {:>5.1}%  {}",
                    e["timestamp"].as_str().unwrap_or_default(),
                    e["person_name"].as_str().unwrap_or("unknown"),
                    e["confidence_pct"].as_f64().unwrap_or_default(),
                    e["site"].as_str().unwrap_or_default()
                );
            }
        }
        Commands::Stats => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.stats().await?)?;
        }
        Commands::Threshold { value } => {
            let proxy = connect(cli.session).await?;
            proxy.set_threshold(value).await?;
            println!("Acceptance threshold set to {value}");
        }
        Commands::Test { device, frames } => {
            println!("Running camera diagnostics...");
            camera_test(&device, frames)?;
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use yologuard_core::{
    AccessLogger, ArcFaceEmbedder, ConfigHandle, Detector, GalleryStore, IdentityGallery,
    Pipeline, PersonGatedDetector, ScrfdDetector, YoloPersonDetector,
};
use yologuard_hw::CameraSource;
use yologuard_store::{EmbeddingCipher, SqliteStore};

mod config;
mod dbus_interface;

use config::{BusKind, Config};
use dbus_interface::{GuardService, BUS_NAME, OBJECT_PATH};

fn build_detector(config: &Config) -> Result<Box<dyn Detector>> {
    let faces = ScrfdDetector::load(&config.face_model_path(), config.device)
        .context("failed to load face detector")?;
    if !config.person_gate {
        return Ok(Box::new(faces));
    }
    let persons = YoloPersonDetector::load(&config.person_model_path(), config.device)
        .context("failed to load person detector")?;
    tracing::info!(
        min_person_size = config.min_person_size,
        "person-gated detection enabled"
    );
    Ok(Box::new(PersonGatedDetector::new(
        persons,
        faces,
        config.min_person_size,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!(config = %config_path.display(), "yologuardd starting");

    let mut store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    if let Some(key) = &config.encryption_key {
        store = store.with_cipher(EmbeddingCipher::from_passphrase(key));
        tracing::info!("embedding encryption enabled");
    }
    let store = Arc::new(store);

    let gallery = Arc::new(
        IdentityGallery::load(
            config.embedding_dimension,
            Arc::clone(&store) as Arc<dyn GalleryStore>,
        )
        .context("failed to load gallery")?,
    );
    tracing::info!(persons = gallery.len(), "gallery loaded");

    let detector = build_detector(&config)?;
    let embedder = ArcFaceEmbedder::load(
        &config.embedding_model_path(),
        config.device,
        config.pipeline.min_face_size,
    )
    .context("failed to load embedding model")?;

    let source = CameraSource::open(&config.camera)
        .with_context(|| format!("failed to open camera {}", config.camera.device))?;

    let pipeline_config =
        ConfigHandle::new(config.pipeline.clone()).context("invalid pipeline configuration")?;
    let pipeline = Pipeline::new(
        Box::new(source),
        detector,
        Box::new(embedder),
        Arc::clone(&gallery),
        Arc::clone(&store) as Arc<dyn AccessLogger>,
        pipeline_config.clone(),
    )?;
    let handle = pipeline.spawn()?;

    let service = GuardService::new(
        Arc::clone(&gallery),
        Arc::clone(&store),
        pipeline_config,
        handle.subscribe(),
        config.camera.device.clone(),
    );
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "yologuardd ready");

    let mut snapshots = handle.subscribe();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("yologuardd shutting down");
        }
        // Sender side lives on the worker; a closed channel means it exited.
        _ = async { while snapshots.changed().await.is_ok() {} } => {
            tracing::error!("pipeline worker exited");
        }
    }

    let stats = handle.stop()?;
    tracing::info!(
        frames = stats.frames_processed,
        events = stats.events_emitted,
        dropped_events = stats.events_dropped,
        "pipeline stopped"
    );
    Ok(())
}

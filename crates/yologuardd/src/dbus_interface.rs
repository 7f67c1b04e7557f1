use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use yologuard_core::{
    ConfigHandle, Embedding, FrameSnapshot, GalleryError, IdentityGallery, Person, PersonId,
    PersonMetadata, PipelineConfig, ARCFACE_MODEL_VERSION,
};
use yologuard_store::SqliteStore;
use zbus::interface;

pub const BUS_NAME: &str = "org.yologuard.Guard1";
pub const OBJECT_PATH: &str = "/org/yologuard/Guard1";

/// Body of an `Enroll` call.
#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub metadata: PersonMetadata,
    pub embeddings: Vec<Vec<f32>>,
}

/// One row of `ListPersons` / `Search`.
#[derive(Debug, Serialize)]
struct PersonSummary<'a> {
    #[serde(flatten)]
    person: &'a Person,
    embeddings: usize,
}

/// D-Bus interface for the YoloGuard daemon.
///
/// Bus name: org.yologuard.Guard1
/// Object path: /org/yologuard/Guard1
pub struct GuardService {
    gallery: Arc<IdentityGallery>,
    store: Arc<SqliteStore>,
    config: ConfigHandle,
    snapshots: watch::Receiver<Arc<FrameSnapshot>>,
    camera_device: String,
    started: Instant,
}

impl GuardService {
    pub fn new(
        gallery: Arc<IdentityGallery>,
        store: Arc<SqliteStore>,
        config: ConfigHandle,
        snapshots: watch::Receiver<Arc<FrameSnapshot>>,
        camera_device: String,
    ) -> Self {
        Self {
            gallery,
            store,
            config,
            snapshots,
            camera_device,
            started: Instant::now(),
        }
    }
}

fn gallery_error(e: GalleryError) -> zbus::fdo::Error {
    match e {
        GalleryError::Validation(reason) => zbus::fdo::Error::InvalidArgs(reason),
        GalleryError::NotFound(id) => zbus::fdo::Error::InvalidArgs(format!("no person {id}")),
        GalleryError::Store(e) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json(value: &impl Serialize) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Enrolled vectors come from the same ArcFace model the pipeline runs.
fn tagged_embeddings(vectors: Vec<Vec<f32>>) -> Vec<Embedding> {
    vectors
        .into_iter()
        .map(|values| Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
        .collect()
}

/// Run store and gallery writes off the async executor.
async fn blocking<T, F>(f: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> zbus::fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(failed)?
}

#[interface(name = "org.yologuard.Guard1")]
impl GuardService {
    /// Daemon, camera, gallery and pipeline counters as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let latest = Arc::clone(&self.snapshots.borrow());
        let gallery = self.gallery.snapshot();
        let config = self.config.load();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "camera": self.camera_device,
            "site": config.site,
            "metric": config.metric.to_string(),
            "threshold": config.acceptance_threshold,
            "gallery": {
                "version": gallery.version(),
                "persons": gallery.len(),
                "embeddings": gallery.total_embeddings(),
            },
            "last_frame": latest.processed_at,
            "stats": latest.stats,
        })
        .to_string())
    }

    /// Most recent annotated frame result.
    async fn latest(&self) -> zbus::fdo::Result<String> {
        let latest = Arc::clone(&self.snapshots.borrow());
        to_json(&*latest)
    }

    /// Add a person with precomputed embeddings.
    async fn enroll(&self, request_json: &str) -> zbus::fdo::Result<u64> {
        let request: EnrollRequest = serde_json::from_str(request_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad enroll request: {e}")))?;
        let mut person = Person::new(PersonId(request.id), request.name);
        person.metadata = request.metadata;
        let embeddings = tagged_embeddings(request.embeddings);

        let id = person.id;
        let count = embeddings.len();
        let gallery = Arc::clone(&self.gallery);
        blocking(move || gallery.enroll(person, embeddings).map_err(gallery_error)).await?;
        tracing::info!(person = %id, embeddings = count, "person enrolled over D-Bus");
        Ok(self.gallery.snapshot().version())
    }

    /// Replace a person's details, keeping their embeddings.
    async fn update_person(&self, person_json: &str) -> zbus::fdo::Result<u64> {
        let person: Person = serde_json::from_str(person_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad person: {e}")))?;
        let gallery = Arc::clone(&self.gallery);
        blocking(move || gallery.update_details(person).map_err(gallery_error)).await?;
        Ok(self.gallery.snapshot().version())
    }

    async fn remove(&self, id: u64) -> zbus::fdo::Result<u64> {
        tracing::info!(person = id, "remove requested");
        let gallery = Arc::clone(&self.gallery);
        blocking(move || gallery.remove(PersonId(id)).map_err(gallery_error)).await?;
        Ok(self.gallery.snapshot().version())
    }

    async fn list_persons(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.gallery.snapshot();
        let rows: Vec<_> = snapshot
            .persons()
            .map(|p| PersonSummary {
                person: &p.person,
                embeddings: p.embeddings.len(),
            })
            .collect();
        to_json(&rows)
    }

    /// Case-insensitive name match or exact id.
    async fn search(&self, query: &str) -> zbus::fdo::Result<String> {
        let snapshot = self.gallery.snapshot();
        to_json(&snapshot.search(query))
    }

    async fn recent_events(&self, limit: u32) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let events = blocking(move || store.recent_events(limit as usize).map_err(failed)).await?;
        to_json(&events)
    }

    /// Today's access count and per-person totals.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let (today, per_person) = blocking(move || {
            Ok((
                store.events_today().map_err(failed)?,
                store.counts_by_person().map_err(failed)?,
            ))
        })
        .await?;
        Ok(serde_json::json!({
            "today": today,
            "per_person": per_person,
        })
        .to_string())
    }

    /// Swap in a new acceptance threshold. Applied from the next cycle.
    async fn set_threshold(&self, threshold: f64) -> zbus::fdo::Result<()> {
        let next = PipelineConfig {
            acceptance_threshold: threshold as f32,
            ..(*self.config.load()).clone()
        };
        self.config
            .replace(next)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        tracing::info!(threshold, "acceptance threshold changed");
        Ok(())
    }
}

//! Identity gallery: enrolled persons and their embeddings.
//!
//! Readers take an immutable [`GallerySnapshot`]; every mutation is written to
//! the backing store first, then published as a new snapshot with a single
//! atomic pointer swap. An in-flight match never sees a half-applied edit.

use crate::types::{Embedding, EnrolledPerson, Person, PersonId};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("corrupt record for person {id}: {reason}")]
    Corrupt { id: PersonId, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("invalid enrollment: {0}")]
    Validation(String),
    #[error("person {0} not found")]
    NotFound(PersonId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable persistence for the gallery.
///
/// `save_person` inserts or replaces a person with all its embeddings. Calls
/// must be durable before returning `Ok`.
pub trait GalleryStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<EnrolledPerson>, StoreError>;
    fn save_person(&self, entry: &EnrolledPerson) -> Result<(), StoreError>;
    /// Returns `false` when the person did not exist.
    fn delete_person(&self, id: PersonId) -> Result<bool, StoreError>;
}

/// Immutable view of the gallery at one version.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    version: u64,
    dimension: usize,
    persons: BTreeMap<PersonId, Arc<EnrolledPerson>>,
}

impl GallerySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn get(&self, id: PersonId) -> Option<&EnrolledPerson> {
        self.persons.get(&id).map(Arc::as_ref)
    }

    /// Persons in ascending id order.
    pub fn persons(&self) -> impl Iterator<Item = &EnrolledPerson> + '_ {
        self.persons.values().map(Arc::as_ref)
    }

    /// Every (person, embedding) pair, ordered by person id then enrollment
    /// order. Restartable: call again for a fresh pass over the same version.
    pub fn all_embeddings(&self) -> impl Iterator<Item = (PersonId, &Embedding)> + Clone + '_ {
        self.persons
            .iter()
            .flat_map(|(id, entry)| entry.embeddings.iter().map(move |e| (*id, e)))
    }

    pub fn embedding_count(&self, id: PersonId) -> usize {
        self.persons.get(&id).map_or(0, |p| p.embeddings.len())
    }

    /// Embeddings across every person.
    pub fn total_embeddings(&self) -> usize {
        self.persons.values().map(|p| p.embeddings.len()).sum()
    }

    /// Case-insensitive substring search over names, plus exact id match.
    pub fn search(&self, query: &str) -> Vec<&Person> {
        let needle = query.trim().to_lowercase();
        self.persons()
            .map(|p| &p.person)
            .filter(|p| {
                needle.is_empty()
                    || p.name.to_lowercase().contains(&needle)
                    || p.id.to_string() == needle
            })
            .collect()
    }

    fn with(&self, f: impl FnOnce(&mut BTreeMap<PersonId, Arc<EnrolledPerson>>)) -> Self {
        let mut persons = self.persons.clone();
        f(&mut persons);
        Self {
            version: self.version + 1,
            dimension: self.dimension,
            persons,
        }
    }
}

pub struct IdentityGallery {
    current: ArcSwap<GallerySnapshot>,
    store: Arc<dyn GalleryStore>,
    /// Serializes writers; readers never take it.
    writer: Mutex<()>,
}

impl IdentityGallery {
    /// Empty gallery with a fixed embedding dimension.
    pub fn new(dimension: usize, store: Arc<dyn GalleryStore>) -> Self {
        Self {
            current: ArcSwap::from_pointee(GallerySnapshot {
                version: 0,
                dimension,
                persons: BTreeMap::new(),
            }),
            store,
            writer: Mutex::new(()),
        }
    }

    /// Build the gallery from everything the store holds.
    ///
    /// Records that violate the gallery's invariants are skipped with a
    /// warning rather than failing startup.
    pub fn load(dimension: usize, store: Arc<dyn GalleryStore>) -> Result<Self, GalleryError> {
        let entries = store.load_all()?;
        let total = entries.len();
        let mut persons = BTreeMap::new();

        for entry in entries {
            if let Err(reason) = validate(&entry.person, &entry.embeddings, dimension) {
                tracing::warn!(person = %entry.person.id, %reason, "skipping invalid gallery record");
                continue;
            }
            persons.insert(entry.person.id, Arc::new(entry));
        }

        tracing::info!(
            persons = persons.len(),
            skipped = total - persons.len(),
            dimension,
            "gallery loaded"
        );

        Ok(Self {
            current: ArcSwap::from_pointee(GallerySnapshot {
                version: 1,
                dimension,
                persons,
            }),
            store,
            writer: Mutex::new(()),
        })
    }

    /// Current consistent view. Cheap; holds no lock.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        self.current.load_full()
    }

    pub fn dimension(&self) -> usize {
        self.current.load().dimension
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Store a new person with its enrollment embeddings.
    pub fn enroll(&self, person: Person, embeddings: Vec<Embedding>) -> Result<(), GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full();

        validate(&person, &embeddings, current.dimension).map_err(GalleryError::Validation)?;
        if current.persons.contains_key(&person.id) {
            return Err(GalleryError::Validation(format!(
                "person {} is already enrolled",
                person.id
            )));
        }

        let entry = Arc::new(EnrolledPerson { person, embeddings });
        self.store.save_person(&entry)?;

        let id = entry.person.id;
        let count = entry.embeddings.len();
        let next = current.with(|persons| {
            persons.insert(id, entry);
        });
        let version = next.version;
        self.current.store(Arc::new(next));

        tracing::info!(person = %id, embeddings = count, version, "person enrolled");
        Ok(())
    }

    /// Replace a person's details, keeping its embeddings.
    pub fn update_details(&self, person: Person) -> Result<(), GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full();

        let existing = current
            .persons
            .get(&person.id)
            .ok_or(GalleryError::NotFound(person.id))?;
        if person.name.trim().is_empty() {
            return Err(GalleryError::Validation("name must not be empty".into()));
        }

        let entry = Arc::new(EnrolledPerson {
            person,
            embeddings: existing.embeddings.clone(),
        });
        self.store.save_person(&entry)?;

        let id = entry.person.id;
        let next = current.with(|persons| {
            persons.insert(id, entry);
        });
        self.current.store(Arc::new(next));

        tracing::info!(person = %id, "person details updated");
        Ok(())
    }

    /// Delete a person and all its embeddings.
    pub fn remove(&self, id: PersonId) -> Result<(), GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full();

        if !current.persons.contains_key(&id) {
            return Err(GalleryError::NotFound(id));
        }
        if !self.store.delete_person(id)? {
            tracing::warn!(person = %id, "person missing from store during removal");
        }

        let next = current.with(|persons| {
            persons.remove(&id);
        });
        self.current.store(Arc::new(next));

        tracing::info!(person = %id, "person removed");
        Ok(())
    }
}

fn validate(person: &Person, embeddings: &[Embedding], dimension: usize) -> Result<(), String> {
    if person.name.trim().is_empty() {
        return Err("name must not be empty".into());
    }
    if embeddings.is_empty() {
        return Err("at least one embedding is required".into());
    }
    if let Some((i, e)) = embeddings
        .iter()
        .enumerate()
        .find(|(_, e)| e.dimension() != dimension)
    {
        return Err(format!(
            "embedding {i} has dimension {}, gallery expects {dimension}",
            e.dimension()
        ));
    }
    if embeddings
        .iter()
        .any(|e| e.values.iter().any(|v| !v.is_finite()))
    {
        return Err("embedding contains non-finite values".into());
    }
    Ok(())
}

/// Gallery store that keeps nothing, for galleries built in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralStore;

impl GalleryStore for EphemeralStore {
    fn load_all(&self) -> Result<Vec<EnrolledPerson>, StoreError> {
        Ok(Vec::new())
    }

    fn save_person(&self, _entry: &EnrolledPerson) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_person(&self, _id: PersonId) -> Result<bool, StoreError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn gallery(dim: usize) -> IdentityGallery {
        IdentityGallery::new(dim, Arc::new(EphemeralStore))
    }

    /// Store that fails every write once armed.
    #[derive(Default)]
    struct FlakyStore {
        fail: AtomicBool,
    }

    impl GalleryStore for FlakyStore {
        fn load_all(&self) -> Result<Vec<EnrolledPerson>, StoreError> {
            Ok(vec![
                EnrolledPerson {
                    person: Person::new(PersonId(1), "Ana"),
                    embeddings: vec![emb(&[1.0, 0.0])],
                },
                EnrolledPerson {
                    person: Person::new(PersonId(2), "Wrong dim"),
                    embeddings: vec![emb(&[1.0, 0.0, 0.0])],
                },
            ])
        }

        fn save_person(&self, _entry: &EnrolledPerson) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Backend("disk full".into()))
            } else {
                Ok(())
            }
        }

        fn delete_person(&self, _id: PersonId) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    #[test]
    fn test_enroll_and_iterate() {
        let g = gallery(2);
        g.enroll(Person::new(PersonId(7), "Bea"), vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0])])
            .unwrap();
        g.enroll(Person::new(PersonId(3), "Ana"), vec![emb(&[0.5, 0.5])])
            .unwrap();

        let snap = g.snapshot();
        let ids: Vec<PersonId> = snap.all_embeddings().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![PersonId(3), PersonId(7), PersonId(7)]);

        // restartable
        let iter = snap.all_embeddings();
        assert_eq!(iter.clone().count(), 3);
        assert_eq!(iter.count(), 3);
        assert_eq!(snap.embedding_count(PersonId(7)), 2);
        assert_eq!(snap.embedding_count(PersonId(99)), 0);
        assert_eq!(snap.total_embeddings(), 3);
    }

    #[test]
    fn test_enroll_rejects_empty_embeddings() {
        let g = gallery(2);
        let err = g.enroll(Person::new(PersonId(1), "Ana"), vec![]).unwrap_err();
        assert!(matches!(err, GalleryError::Validation(_)));
        assert!(g.is_empty());
    }

    #[test]
    fn test_enroll_rejects_dimension_mismatch() {
        let g = gallery(2);
        let err = g
            .enroll(
                Person::new(PersonId(1), "Ana"),
                vec![emb(&[1.0, 0.0]), emb(&[1.0, 0.0, 0.0])],
            )
            .unwrap_err();
        assert!(matches!(err, GalleryError::Validation(msg) if msg.contains("embedding 1")));
    }

    #[test]
    fn test_enroll_rejects_duplicate_id() {
        let g = gallery(2);
        g.enroll(Person::new(PersonId(1), "Ana"), vec![emb(&[1.0, 0.0])])
            .unwrap();
        let err = g
            .enroll(Person::new(PersonId(1), "Other"), vec![emb(&[0.0, 1.0])])
            .unwrap_err();
        assert!(matches!(err, GalleryError::Validation(_)));
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let g = gallery(2);
        assert_eq!(g.remove(PersonId(9)), Err(GalleryError::NotFound(PersonId(9))));
    }

    #[test]
    fn test_snapshot_isolated_from_later_mutation() {
        let g = gallery(2);
        g.enroll(Person::new(PersonId(1), "Ana"), vec![emb(&[1.0, 0.0])])
            .unwrap();
        let before = g.snapshot();
        g.remove(PersonId(1)).unwrap();

        assert_eq!(before.len(), 1);
        assert!(g.snapshot().is_empty());
        assert!(g.snapshot().version() > before.version());
    }

    #[test]
    fn test_store_failure_leaves_gallery_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let g = IdentityGallery::new(2, store.clone());
        store.fail.store(true, Ordering::SeqCst);

        let err = g
            .enroll(Person::new(PersonId(1), "Ana"), vec![emb(&[1.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, GalleryError::Store(_)));
        assert!(g.is_empty());
        assert_eq!(g.snapshot().version(), 0);
    }

    #[test]
    fn test_load_skips_invalid_records() {
        let g = IdentityGallery::load(2, Arc::new(FlakyStore::default())).unwrap();
        assert_eq!(g.len(), 1);
        assert!(g.snapshot().get(PersonId(1)).is_some());
    }

    #[test]
    fn test_update_details_keeps_embeddings() {
        let g = gallery(2);
        g.enroll(Person::new(PersonId(1), "Ana"), vec![emb(&[1.0, 0.0])])
            .unwrap();
        let mut edited = Person::new(PersonId(1), "Ana María");
        edited.metadata.role = "Docente".into();
        g.update_details(edited).unwrap();

        let snap = g.snapshot();
        let entry = snap.get(PersonId(1)).unwrap();
        assert_eq!(entry.person.name, "Ana María");
        assert_eq!(entry.embeddings.len(), 1);
    }

    #[test]
    fn test_search() {
        let g = gallery(2);
        g.enroll(Person::new(PersonId(10), "Laura Gómez"), vec![emb(&[1.0, 0.0])])
            .unwrap();
        g.enroll(Person::new(PersonId(11), "Pedro Ruiz"), vec![emb(&[0.0, 1.0])])
            .unwrap();
        let snap = g.snapshot();
        assert_eq!(snap.search("laura").len(), 1);
        assert_eq!(snap.search("11")[0].name, "Pedro Ruiz");
        assert_eq!(snap.search("").len(), 2);
    }

    #[test]
    fn test_concurrent_readers_see_whole_persons() {
        let g = Arc::new(gallery(2));
        let writer = {
            let g = Arc::clone(&g);
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    g.enroll(
                        Person::new(PersonId(i), format!("p{i}")),
                        vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0]), emb(&[0.5, 0.5])],
                    )
                    .unwrap();
                }
            })
        };
        for _ in 0..200 {
            let snap = g.snapshot();
            for person in snap.persons() {
                assert_eq!(person.embeddings.len(), 3);
            }
        }
        writer.join().unwrap();
        assert_eq!(g.len(), 200);
    }
}

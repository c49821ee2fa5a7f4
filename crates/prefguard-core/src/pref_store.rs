//! Preference stores.
//!
//! `JsonPrefStore` keeps one profile's preferences in a JSON file. Loading
//! happens on the io runtime's blocking pool; the attached filter and the
//! observers run once the read resolves, in the task that awaited it. Every
//! write passes through the filter before it is persisted.

use crate::error::PrefStoreError;
use crate::storage::write_atomically;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Read-only access to preference values by dotted path.
pub trait PrefStore {
    fn get_value(&self, key: &str) -> Option<Value>;
}

/// Intercepts a persistent store's load and write events.
pub trait PrefFilter: Send {
    /// Called once when a store takes ownership of the filter.
    fn on_attach(&mut self) {}

    /// Runs over freshly loaded preferences. Returns `true` if it modified
    /// them and they need to be written back.
    fn filter_on_load(&mut self, prefs: &mut PrefMap) -> bool;

    /// Runs after `key` changed in `prefs`, before the write completes.
    fn filter_update(&mut self, key: &str, prefs: &PrefMap);
}

pub trait PrefStoreObserver: Send + Sync {
    fn on_pref_value_changed(&self, key: &str);
    fn on_initialization_completed(&self, succeeded: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded { succeeded: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefReadError {
    None,
    /// No file yet; the store starts empty.
    NoFile,
    /// The file was not valid JSON and was moved aside; the store starts
    /// empty and writable.
    JsonParse,
    /// Valid JSON, but not an object. Left in place.
    JsonType,
    AccessDenied,
    FileOther,
}

impl PrefReadError {
    pub fn is_success(self) -> bool {
        matches!(self, PrefReadError::None | PrefReadError::NoFile)
    }

    /// Errors after which writing would clobber a file that may still hold
    /// the user's preferences.
    pub fn makes_read_only(self) -> bool {
        matches!(
            self,
            PrefReadError::JsonType | PrefReadError::AccessDenied | PrefReadError::FileOther
        )
    }
}

/// A JSON object addressed by dotted paths (`"browser.show_home_button"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefMap(Map<String, Value>);

impl PrefMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.0.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Sets `path`, creating intermediate objects and replacing any
    /// non-object value found along the way.
    pub fn set(&mut self, path: &str, value: Value) {
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path),
        };
        let mut current = &mut self.0;
        for part in parents.into_iter().flat_map(|p| p.split('.')) {
            let slot = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just made an object"),
            };
        }
        current.insert(leaf.to_string(), value);
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path),
        };
        let mut current = &mut self.0;
        for part in parents.into_iter().flat_map(|p| p.split('.')) {
            current = current.get_mut(part)?.as_object_mut()?;
        }
        current.remove(leaf)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl PrefStore for PrefMap {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

/// Read-only view over preferences held in memory.
#[derive(Debug, Clone, Copy)]
pub struct DictionaryPrefStore<'a> {
    values: &'a PrefMap,
}

impl<'a> DictionaryPrefStore<'a> {
    pub fn new(values: &'a PrefMap) -> Self {
        Self { values }
    }
}

impl PrefStore for DictionaryPrefStore<'_> {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

struct StoreState {
    prefs: PrefMap,
    load_state: LoadState,
    read_error: Option<PrefReadError>,
    read_only: bool,
    filter: Option<Box<dyn PrefFilter>>,
}

impl StoreState {
    fn check_writable(&self, path: &Path) -> Result<(), PrefStoreError> {
        if self.read_only {
            return Err(PrefStoreError::ReadOnly {
                path: path.to_path_buf(),
            });
        }
        match self.load_state {
            LoadState::Loaded { .. } => Ok(()),
            LoadState::Unloaded | LoadState::Loading => Err(PrefStoreError::NotLoaded {
                path: path.to_path_buf(),
            }),
        }
    }
}

pub struct JsonPrefStore {
    path: PathBuf,
    io: Handle,
    state: Mutex<StoreState>,
    observers: Mutex<Vec<Arc<dyn PrefStoreObserver>>>,
}

impl std::fmt::Debug for JsonPrefStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JsonPrefStore")
            .field("path", &self.path)
            .field("load_state", &state.load_state)
            .field("filtered", &state.filter.is_some())
            .finish()
    }
}

impl JsonPrefStore {
    pub fn new(
        path: impl Into<PathBuf>,
        io: Handle,
        filter: Option<Box<dyn PrefFilter>>,
    ) -> Arc<Self> {
        let mut filter = filter;
        if let Some(filter) = filter.as_mut() {
            filter.on_attach();
        }
        Arc::new(Self {
            path: path.into(),
            io,
            state: Mutex::new(StoreState {
                prefs: PrefMap::new(),
                load_state: LoadState::Unloaded,
                read_error: None,
                read_only: false,
                filter,
            }),
            observers: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_state(&self) -> LoadState {
        self.state.lock().load_state
    }

    pub fn read_error(&self) -> Option<PrefReadError> {
        self.state.lock().read_error
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    pub fn is_initialization_complete(&self) -> bool {
        matches!(self.load_state(), LoadState::Loaded { .. })
    }

    pub fn snapshot(&self) -> PrefMap {
        self.state.lock().prefs.clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn PrefStoreObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn PrefStoreObserver>) {
        self.observers
            .lock()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Sets `key` and persists the store. Only once the file is written is
    /// the value visible and re-digested by the filter. Fails before the
    /// first load completes and after a read that left the store read-only.
    pub fn set_value(&self, key: &str, value: Value) -> Result<(), PrefStoreError> {
        {
            let mut guard = self.state.lock();
            guard.check_writable(&self.path)?;
            if guard.prefs.get(key) == Some(&value) {
                return Ok(());
            }
            let mut next = guard.prefs.clone();
            next.set(key, value);
            self.commit(&mut guard, key, next)?;
        }
        self.notify_value_changed(key);
        Ok(())
    }

    pub fn remove_value(&self, key: &str) -> Result<(), PrefStoreError> {
        {
            let mut guard = self.state.lock();
            guard.check_writable(&self.path)?;
            let mut next = guard.prefs.clone();
            if next.remove(key).is_none() {
                return Ok(());
            }
            self.commit(&mut guard, key, next)?;
        }
        self.notify_value_changed(key);
        Ok(())
    }

    fn commit(&self, state: &mut StoreState, key: &str, next: PrefMap) -> Result<(), PrefStoreError> {
        write_prefs_file(&self.path, &next)?;
        state.prefs = next;
        if let Some(filter) = state.filter.as_mut() {
            filter.filter_update(key, &state.prefs);
        }
        Ok(())
    }

    /// Loads the file on the io runtime and hands the result to the filter
    /// and observers. Resolves with the read outcome.
    pub async fn read_prefs(&self) -> PrefReadError {
        self.state.lock().load_state = LoadState::Loading;
        let path = self.path.clone();
        let (read_error, prefs) = match self
            .io
            .spawn_blocking(move || read_prefs_file(&path))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "preference read task failed");
                (PrefReadError::FileOther, None)
            }
        };
        self.on_file_read(read_error, prefs);
        read_error
    }

    fn on_file_read(&self, read_error: PrefReadError, loaded: Option<PrefMap>) {
        let succeeded = read_error.is_success();
        {
            let mut guard = self.state.lock();
            let StoreState {
                prefs,
                filter,
                load_state,
                read_error: stored_error,
                read_only,
            } = &mut *guard;
            *prefs = loaded.unwrap_or_default();
            *stored_error = Some(read_error);
            *read_only = read_error.makes_read_only();
            if succeeded {
                if let Some(filter) = filter.as_mut() {
                    if filter.filter_on_load(prefs) {
                        if let Err(err) = write_prefs_file(&self.path, prefs) {
                            error!(error = %err, "cannot persist filtered preferences");
                        }
                    }
                }
            }
            *load_state = LoadState::Loaded { succeeded };
        }
        info!(
            path = %self.path.display(),
            result = ?read_error,
            "preferences loaded"
        );
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_initialization_completed(succeeded);
        }
    }

    fn notify_value_changed(&self, key: &str) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_pref_value_changed(key);
        }
    }
}

impl PrefStore for JsonPrefStore {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.state.lock().prefs.get(key).cloned()
    }
}

fn read_prefs_file(path: &Path) -> (PrefReadError, Option<PrefMap>) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no preferences file yet");
            return (PrefReadError::NoFile, None);
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), "preferences file not readable");
            return (PrefReadError::AccessDenied, None);
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read preferences");
            return (PrefReadError::FileOther, None);
        }
    };
    let value = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let bad = path.with_extension("bad");
            warn!(
                path = %path.display(),
                moved_to = %bad.display(),
                error = %err,
                "preferences file is not valid JSON"
            );
            if let Err(e) = fs::rename(path, &bad) {
                warn!(error = %e, "cannot move unreadable preferences aside");
            }
            return (PrefReadError::JsonParse, None);
        }
    };
    match PrefMap::from_value(value) {
        Some(prefs) => (PrefReadError::None, Some(prefs)),
        None => {
            warn!(path = %path.display(), "preferences file is not a JSON object, store is read-only");
            (PrefReadError::JsonType, None)
        }
    }
}

pub(crate) fn write_prefs_file(path: &Path, prefs: &PrefMap) -> Result<(), PrefStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PrefStoreError::DirectoryCreation {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_vec_pretty(prefs).map_err(|e| PrefStoreError::Serialization {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomically(path, &json).map_err(|source| PrefStoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn dotted_paths() {
        let mut p = PrefMap::new();
        p.set("browser.show_home_button", json!(true));
        p.set("homepage", json!("http://a"));
        assert_eq!(p.get("browser.show_home_button"), Some(&json!(true)));
        assert_eq!(p.get("browser"), Some(&json!({"show_home_button": true})));
        assert_eq!(p.get("browser.missing"), None);
        assert_eq!(p.get("homepage.deeper"), None);

        // a scalar in the way is replaced by an object
        p.set("homepage.deeper", json!(1));
        assert_eq!(p.get("homepage.deeper"), Some(&json!(1)));

        assert_eq!(p.remove("browser.show_home_button"), Some(json!(true)));
        assert_eq!(p.remove("browser.show_home_button"), None);
        assert_eq!(p.remove("nope.nested"), None);
    }

    #[test]
    fn dictionary_store_reads_values() {
        let mut p = PrefMap::new();
        p.set("sync_enabled", json!(true));
        let store = DictionaryPrefStore::new(&p);
        assert_eq!(store.get_value("sync_enabled"), Some(json!(true)));
        assert_eq!(store.get_value("other"), None);
    }

    #[derive(Default)]
    struct CountingObserver {
        changed: AtomicUsize,
        completed: AtomicUsize,
    }

    impl PrefStoreObserver for CountingObserver {
        fn on_pref_value_changed(&self, _key: &str) {
            self.changed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_initialization_completed(&self, succeeded: bool) {
            assert!(succeeded);
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonPrefStore::new(dir.path().join("Preferences"), Handle::current(), None);
        assert_eq!(store.load_state(), LoadState::Unloaded);
        let result = store.read_prefs().await;
        assert_eq!(result, PrefReadError::NoFile);
        assert!(result.is_success());
        assert_eq!(store.load_state(), LoadState::Loaded { succeeded: true });
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn writes_persist_and_notify() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile").join("Preferences");
        let store = JsonPrefStore::new(&path, Handle::current(), None);
        let observer = Arc::new(CountingObserver::default());
        store.add_observer(observer.clone());
        store.read_prefs().await;

        store.set_value("homepage", json!("http://a")).unwrap();
        store.set_value("homepage", json!("http://a")).unwrap();
        assert_eq!(observer.changed.load(Ordering::SeqCst), 1);
        assert_eq!(observer.completed.load(Ordering::SeqCst), 1);

        let reopened = JsonPrefStore::new(&path, Handle::current(), None);
        assert_eq!(reopened.read_prefs().await, PrefReadError::None);
        assert_eq!(reopened.get_value("homepage"), Some(json!("http://a")));

        reopened.remove_value("homepage").unwrap();
        assert_eq!(reopened.get_value("homepage"), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Preferences");
        fs::write(&path, b"{ not json").unwrap();
        let store = JsonPrefStore::new(&path, Handle::current(), None);
        assert_eq!(store.read_prefs().await, PrefReadError::JsonParse);
        assert_eq!(store.load_state(), LoadState::Loaded { succeeded: false });
        assert!(!path.exists());
        assert!(dir.path().join("Preferences.bad").exists());

        // the original is preserved aside, so starting over is allowed
        assert!(!store.is_read_only());
        store.set_value("homepage", json!("http://a")).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn non_object_file_is_kept_and_read_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Preferences");
        fs::write(&path, b"[1, 2, 3]").unwrap();
        let store = JsonPrefStore::new(&path, Handle::current(), None);
        assert_eq!(store.read_prefs().await, PrefReadError::JsonType);
        assert!(store.is_read_only());
        assert!(!dir.path().join("Preferences.bad").exists());

        assert!(matches!(
            store.set_value("homepage", json!("http://a")),
            Err(PrefStoreError::ReadOnly { .. })
        ));
        assert!(matches!(
            store.remove_value("homepage"),
            Err(PrefStoreError::ReadOnly { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), b"[1, 2, 3]");
    }

    #[tokio::test]
    async fn unreadable_file_is_read_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Preferences");
        fs::create_dir(&path).unwrap();
        let store = JsonPrefStore::new(&path, Handle::current(), None);
        assert_eq!(store.read_prefs().await, PrefReadError::FileOther);
        assert!(store.is_read_only());
        assert!(matches!(
            store.set_value("homepage", json!("http://a")),
            Err(PrefStoreError::ReadOnly { .. })
        ));
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn writes_before_load_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Preferences");
        let original = br#"{"homepage":"http://a","other":{"setting":42}}"#;
        fs::write(&path, original).unwrap();
        let store = JsonPrefStore::new(&path, Handle::current(), None);

        assert!(matches!(
            store.set_value("sync_enabled", json!(true)),
            Err(PrefStoreError::NotLoaded { .. })
        ));
        assert!(matches!(
            store.remove_value("homepage"),
            Err(PrefStoreError::NotLoaded { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), original);

        store.read_prefs().await;
        store.set_value("sync_enabled", json!(true)).unwrap();
        let on_disk: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["other"]["setting"], json!(42));
        assert_eq!(on_disk["sync_enabled"], json!(true));
    }

    #[derive(Clone, Default)]
    struct UpdateLog(Arc<Mutex<Vec<String>>>);

    impl PrefFilter for UpdateLog {
        fn filter_on_load(&mut self, _prefs: &mut PrefMap) -> bool {
            false
        }

        fn filter_update(&mut self, key: &str, _prefs: &PrefMap) {
            self.0.lock().push(key.to_string());
        }
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Preferences");
        let log = UpdateLog::default();
        let store = JsonPrefStore::new(&path, Handle::current(), Some(Box::new(log.clone())));
        store.read_prefs().await;
        store.set_value("homepage", json!("http://a")).unwrap();

        // a non-empty directory cannot be replaced by the atomic rename
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), b"").unwrap();

        assert!(store.set_value("homepage", json!("http://b")).is_err());
        assert_eq!(store.get_value("homepage"), Some(json!("http://a")));
        assert!(store.remove_value("homepage").is_err());
        assert_eq!(store.get_value("homepage"), Some(json!("http://a")));
        assert_eq!(*log.0.lock(), vec!["homepage".to_string()]);
    }

    #[tokio::test]
    async fn removed_observer_is_not_called() {
        let dir = tempdir().unwrap();
        let store = JsonPrefStore::new(dir.path().join("Preferences"), Handle::current(), None);
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn PrefStoreObserver> = observer.clone();
        store.add_observer(as_dyn.clone());
        store.remove_observer(&as_dyn);
        store.read_prefs().await;
        assert_eq!(observer.completed.load(Ordering::SeqCst), 0);
    }
}

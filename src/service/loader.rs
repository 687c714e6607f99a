//! Turning artifacts into services
//!
//! Two strategies share the [`ServiceLoader`] seam:
//!
//! * [`DylibLoader`] opens native shared objects exporting the C ABI below.
//! * [`StaticLoader`] maps an artifact's file stem to a service compiled into the
//!   binary. The artifact only acts as an on/off switch.
//!
//! ```text
//! const char*  moody_service_name(void);
//! const char*  moody_service_version(void);
//! const char** moody_service_topics(void);            // NULL-terminated
//! int          moody_service_init(void);              // 0 on success
//! int          moody_service_actuate(const char* topic, const char* state);
//! ```

use super::{MoodyService, ServiceError};
use libloading::{Library, Symbol};
use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File extension of loadable artifacts
pub const PLUGIN_EXTENSION: &str = "so";

const MAX_TOPICS: usize = 256;

pub trait ServiceLoader: Send + Sync {
    /// Instantiates the service behind `path`
    ///
    /// May block; callers run it on a blocking thread.
    fn load(&self, path: &Path) -> Result<Arc<dyn MoodyService>, ServiceError>;
}

type ServiceFactory = Box<dyn Fn() -> Arc<dyn MoodyService> + Send + Sync>;

/// Built-in services selected by artifact file stem
#[derive(Default)]
pub struct StaticLoader {
    factories: HashMap<String, ServiceFactory>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for artifacts named `<stem>.<ext>`
    pub fn register<F>(&mut self, stem: &str, factory: F)
    where
        F: Fn() -> Arc<dyn MoodyService> + Send + Sync + 'static,
    {
        self.factories.insert(stem.to_string(), Box::new(factory));
    }

    pub fn with<F>(mut self, stem: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn MoodyService> + Send + Sync + 'static,
    {
        self.register(stem, factory);
        self
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticLoader")
            .field("services", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceLoader for StaticLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn MoodyService>, ServiceError> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        let factory = self.factories.get(stem).ok_or_else(|| ServiceError::PluginLoad {
            path: path.to_path_buf(),
            reason: format!("no built-in service named '{}'", stem),
        })?;
        debug!("Instantiating built-in service '{}'", stem);
        Ok(factory())
    }
}

/// Loader for native shared objects
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

type StringFn = unsafe extern "C" fn() -> *const c_char;
type TopicsFn = unsafe extern "C" fn() -> *const *const c_char;
type InitFn = unsafe extern "C" fn() -> c_int;
type ActuateFn = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;

/// A service backed by an open shared object
struct DylibService {
    name: String,
    version: String,
    topics: Vec<String>,
    init: InitFn,
    actuate: ActuateFn,
    // Keeps `init` and `actuate` valid.
    _library: Library,
}

impl MoodyService for DylibService {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn topics(&self) -> Vec<String> {
        self.topics.clone()
    }

    fn init(&self) -> Result<(), ServiceError> {
        match unsafe { (self.init)() } {
            0 => Ok(()),
            code => Err(ServiceError::Init {
                name: self.name.clone(),
                reason: format!("initializer returned {}", code),
            }),
        }
    }

    fn actuate(&self, topic: &str, state: &str) -> Result<(), ServiceError> {
        let topic = CString::new(topic).map_err(|e| ServiceError::Actuate(e.to_string()))?;
        let state = CString::new(state).map_err(|e| ServiceError::Actuate(e.to_string()))?;
        match unsafe { (self.actuate)(topic.as_ptr(), state.as_ptr()) } {
            0 => Ok(()),
            code => Err(ServiceError::Actuate(format!(
                "{} returned {}",
                self.name, code
            ))),
        }
    }
}

fn symbol<'lib, T>(
    library: &'lib Library,
    path: &Path,
    export: &'static str,
) -> Result<Symbol<'lib, T>, ServiceError> {
    unsafe { library.get::<T>(export.as_bytes()) }.map_err(|_| ServiceError::MissingExport {
        path: path.to_path_buf(),
        export,
    })
}

fn read_cstr(ptr: *const c_char, path: &Path, export: &'static str) -> Result<String, ServiceError> {
    let invalid = || ServiceError::InvalidExport {
        path: path.to_path_buf(),
        export,
    };
    if ptr.is_null() {
        return Err(invalid());
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(str::to_string)
        .map_err(|_| invalid())
}

fn read_topics(list: *const *const c_char, path: &Path) -> Result<Vec<String>, ServiceError> {
    const EXPORT: &str = "moody_service_topics";
    if list.is_null() {
        return Err(ServiceError::InvalidExport {
            path: path.to_path_buf(),
            export: EXPORT,
        });
    }

    let mut topics = Vec::new();
    for index in 0..=MAX_TOPICS {
        let entry = unsafe { *list.add(index) };
        if entry.is_null() {
            return Ok(topics);
        }
        topics.push(read_cstr(entry, path, EXPORT)?);
    }
    Err(ServiceError::InvalidExport {
        path: path.to_path_buf(),
        export: EXPORT,
    })
}

impl ServiceLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn MoodyService>, ServiceError> {
        info!("Loading service library {}", path.display());
        let path_buf: PathBuf = path.to_path_buf();

        let library = unsafe { Library::new(&path_buf) }.map_err(|e| ServiceError::PluginLoad {
            path: path_buf.clone(),
            reason: e.to_string(),
        })?;

        let name_fn = symbol::<StringFn>(&library, path, "moody_service_name")?;
        let version_fn = symbol::<StringFn>(&library, path, "moody_service_version")?;
        let topics_fn = symbol::<TopicsFn>(&library, path, "moody_service_topics")?;
        let init: InitFn = *symbol::<InitFn>(&library, path, "moody_service_init")?;
        let actuate: ActuateFn = *symbol::<ActuateFn>(&library, path, "moody_service_actuate")?;

        let name = read_cstr(unsafe { name_fn() }, path, "moody_service_name")?;
        let version = read_cstr(unsafe { version_fn() }, path, "moody_service_version")?;
        let topics = read_topics(unsafe { topics_fn() }, path)?;
        drop((name_fn, version_fn, topics_fn));

        debug!(
            "Library {} provides {} v{} on {:?}",
            path.display(),
            name,
            version,
            topics
        );
        Ok(Arc::new(DylibService {
            name,
            version,
            topics,
            init,
            actuate,
            _library: library,
        }))
    }
}

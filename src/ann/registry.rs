//! Process-wide ANN algorithm registry.
//!
//! A name→factory map shared by every store in the process. Registration is
//! append-only: registering a name twice is an error, so built-in names can
//! never be shadowed. Lookup after population is a read-lock acquisition on
//! an already-initialized map.

use crate::ann::{flat::FlatFactory, hnsw::HnswFactory, ivf::{IvfFlatFactory, IvfPqFactory}};
use crate::ann::{AnnFactory, AnnIndex, BuildParams};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn AnnFactory>>>> = OnceLock::new();

/// Initialize the registry with the built-in algorithms on first access.
fn registry() -> &'static RwLock<HashMap<String, Arc<dyn AnnFactory>>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn AnnFactory>> = HashMap::new();
        let builtins: [Arc<dyn AnnFactory>; 4] = [
            Arc::new(FlatFactory),
            Arc::new(IvfFlatFactory),
            Arc::new(IvfPqFactory),
            Arc::new(HnswFactory),
        ];
        for factory in builtins {
            map.insert(factory.name().to_string(), factory);
        }
        RwLock::new(map)
    })
}

/// Register an external algorithm factory.
///
/// Registration is append-only; re-registering an existing name (including
/// any built-in) returns `InvalidConfig`.
pub fn register(factory: Arc<dyn AnnFactory>) -> Result<()> {
    let mut map = registry().write();
    let name = factory.name().to_string();
    if map.contains_key(&name) {
        return Err(Error::InvalidConfig(format!(
            "ANN algorithm '{name}' is already registered"
        )));
    }
    map.insert(name, factory);
    Ok(())
}

/// Look up a factory by name.
pub fn get(name: &str) -> Option<Arc<dyn AnnFactory>> {
    registry().read().get(name).cloned()
}

/// Whether an algorithm name is registered.
pub fn is_available(name: &str) -> bool {
    registry().read().contains_key(name)
}

/// Names of all registered algorithms, sorted.
pub fn list() -> Vec<String> {
    let mut names: Vec<String> = registry().read().keys().cloned().collect();
    names.sort();
    names
}

/// Create an index instance for a registered algorithm.
pub fn create(name: &str, params: &BuildParams) -> Result<Box<dyn AnnIndex>> {
    let factory = get(name)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown ANN algorithm '{name}'")))?;
    factory.create(params)
}

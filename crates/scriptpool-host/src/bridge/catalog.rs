//! Process-wide catalog of host types
//!
//! Member tables are built once per type and shared by every engine. The
//! catalog doubles as the type loader for `adapt_to`: a type name resolves to
//! a registered table. It is created on first use and torn down when the last
//! pool using it shuts down. Types registered ahead of time with [`register`]
//! come back in every catalog created after that.

use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::table::{HostObject, MemberTable};

struct Slot {
    catalog: Option<Arc<TypeCatalog>>,
    /// Live leases; the catalog is dropped when this returns to zero
    users: usize,
}

impl Slot {
    fn catalog(&mut self) -> Arc<TypeCatalog> {
        Arc::clone(self.catalog.get_or_insert_with(fresh_catalog))
    }
}

static CATALOG: RwLock<Slot> = const_rwlock(Slot {
    catalog: None,
    users: 0,
});

type Registration = fn(&TypeCatalog);

/// Types registered through [`register`], replayed into each new catalog
static REGISTERED: Mutex<Vec<(TypeId, Registration)>> = const_mutex(Vec::new());

#[derive(Debug, Default)]
pub struct TypeCatalog {
    tables: RwLock<HashMap<TypeId, Arc<MemberTable>>>,
    by_name: RwLock<HashMap<&'static str, Arc<MemberTable>>>,
    generation: AtomicU64,
}

impl TypeCatalog {
    /// Table for `T`, building and registering it on first request
    pub fn table_for<T: HostObject>(&self) -> Arc<MemberTable> {
        if let Some(table) = self.tables.read().get(&TypeId::of::<T>()) {
            return Arc::clone(table);
        }

        let mut tables = self.tables.write();
        // Another thread may have built it while we waited
        if let Some(table) = tables.get(&TypeId::of::<T>()) {
            return Arc::clone(table);
        }

        let table = Arc::new(MemberTable::build::<T>());
        tables.insert(TypeId::of::<T>(), Arc::clone(&table));

        let mut by_name = self.by_name.write();
        if let Some(previous) = by_name.insert(T::TYPE_NAME, Arc::clone(&table)) {
            tracing::warn!(
                target: "scripting",
                "Host type name {} registered twice; adapt_to now resolves to the newer type",
                previous.type_name()
            );
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            target: "scripting",
            "Registered host type {} ({} member name(s))",
            T::TYPE_NAME,
            table.member_names().count()
        );
        table
    }

    /// Register `T` ahead of time so `adapt_to` can find it by name
    pub fn register<T: HostObject>(&self) {
        self.table_for::<T>();
    }

    /// Type loader: the table registered under `type_name`
    pub fn lookup(&self, type_name: &str) -> Option<Arc<MemberTable>> {
        self.by_name.read().get(type_name).cloned()
    }

    /// Every member name of every registered type
    pub fn member_names(&self) -> BTreeSet<String> {
        self.tables
            .read()
            .values()
            .flat_map(|table| table.member_names().map(str::to_string))
            .collect()
    }

    /// Bumped whenever a type is added
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

/// The catalog, created on first use
pub fn global() -> Arc<TypeCatalog> {
    if let Some(catalog) = CATALOG.read().catalog.as_ref() {
        return Arc::clone(catalog);
    }
    CATALOG.write().catalog()
}

fn fresh_catalog() -> Arc<TypeCatalog> {
    tracing::debug!(target: "scripting", "Creating host type catalog");
    let catalog = TypeCatalog::default();
    for (_, registration) in REGISTERED.lock().iter() {
        registration(&catalog);
    }
    Arc::new(catalog)
}

/// Register `T` in the global catalog and in every catalog created later
pub fn register<T: HostObject>() {
    {
        let mut registered = REGISTERED.lock();
        if !registered.iter().any(|(id, _)| *id == TypeId::of::<T>()) {
            registered.push((TypeId::of::<T>(), TypeCatalog::register::<T>));
        }
    }
    global().register::<T>();
}

/// Keeps the catalog alive; the last lease to drop tears it down
#[derive(Debug)]
pub struct CatalogLease {
    catalog: Arc<TypeCatalog>,
}

impl CatalogLease {
    pub fn catalog(&self) -> &Arc<TypeCatalog> {
        &self.catalog
    }
}

impl Drop for CatalogLease {
    fn drop(&mut self) {
        let mut slot = CATALOG.write();
        slot.users = slot.users.saturating_sub(1);
        if slot.users == 0 && slot.catalog.take().is_some() {
            tracing::debug!(target: "scripting", "Host type catalog torn down");
        }
    }
}

/// Taken by each pool as it starts
pub fn acquire() -> CatalogLease {
    let mut slot = CATALOG.write();
    slot.users += 1;
    CatalogLease {
        catalog: slot.catalog(),
    }
}

//! Dimension kinds: cached, snowflaked and slowly-changing. Ported from
//! `pyetlmr.offdimtables` (`CachedDimension`, `SlowlyChangingDimension`,
//! the reference-graph shape used to build a snowflake).
//!
//! The three kinds form a closed variant set (Design Notes), modeled
//! here as the [`Dimension`] enum, dispatched by a [`DimensionRegistry`]
//! that owns every dimension and refers to them by opaque
//! [`DimensionHandle`] rather than shared pointer, so a snowflake's
//! child edges can never form a reference cycle.

use crate::error::{EtlError, Result};
use crate::row::{NameMapping, Row, Value};
use crate::store::ShelvedStore;

/// A function that allocates the next surrogate key for a named
/// dimension, used by [`KeySource::External`].
pub type KeyAllocator<'a> = dyn FnMut(&str) -> Result<i64> + 'a;

/// Where a dimension's next surrogate key comes from.
///
/// `ShelveLocal` calls the dimension's own `ShelvedStore::next_id`
/// directly rather than through a closure: an external closure that
/// captured `dim.store_mut()` ahead of time would alias the `&mut self`
/// that `insert`/`ensure` themselves need, which the source's
/// single-threaded Python has no equivalent borrow-checker objection to.
/// `External` covers the big-dimension range reservation and the
/// central key-server round-trip, neither of which touch the
/// dimension's own store.
pub enum KeySource<'a> {
    ShelveLocal,
    External(&'a mut KeyAllocator<'a>),
}

/// Opaque reference to a dimension held by a [`DimensionRegistry`].
/// Deliberately not `Rc`/`Arc`: the registry is the sole owner, and
/// snowflake edges are plain indices, so no cycle of shared pointers can
/// form even though the underlying reference graph may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DimensionHandle(pub(crate) usize);

/// A cached (plain lookup) dimension. Ported from
/// `offdimtables.CachedDimension`.
pub struct CachedDimension {
    pub name: String,
    pub key: String,
    pub attributes: Vec<String>,
    pub lookupatts: Vec<String>,
    pub default_id: Option<i64>,
    store: ShelvedStore,
}

impl CachedDimension {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        attributes: Vec<String>,
        lookupatts: Vec<String>,
        default_id: Option<i64>,
        store: ShelvedStore,
    ) -> Result<Self> {
        let name = name.into();
        let key = key.into();
        if attributes.contains(&key) {
            return Err(EtlError::Configuration(format!(
                "dimension {name}: key attribute {key} must not appear in attributes"
            )));
        }
        if lookupatts.is_empty() {
            return Err(EtlError::Configuration(format!(
                "dimension {name}: lookupatts must be non-empty"
            )));
        }
        if !lookupatts.iter().all(|a| attributes.contains(a)) {
            return Err(EtlError::Configuration(format!(
                "dimension {name}: lookupatts must be a subset of attributes"
            )));
        }
        Ok(CachedDimension { name, key, attributes, lookupatts, default_id, store })
    }

    fn lookup_raw(&mut self, row: &Row, mapping: &NameMapping) -> Result<Option<i64>> {
        let tuple = row.lookup_tuple(&self.lookupatts, mapping);
        let versions = self.store.get(&tuple)?;
        Ok(versions.and_then(|v| v.first().and_then(|r| r.get(&self.key)).and_then(Value::as_i64)))
    }

    /// Looks a row up by its business key; returns `default_id` on miss.
    pub fn lookup(&mut self, row: &Row, mapping: &NameMapping) -> Result<Option<i64>> {
        Ok(self.lookup_raw(row, mapping)?.or(self.default_id))
    }

    /// Inserts `row`, allocating a surrogate key if it doesn't carry one.
    /// Overwrites any prior row stored under the same business key.
    pub fn insert(&mut self, row: &mut Row, mapping: &NameMapping, source: &mut KeySource<'_>) -> Result<i64> {
        let tuple = row.lookup_tuple(&self.lookupatts, mapping);
        let key_val = match row.get(&self.key).and_then(Value::as_i64) {
            Some(k) => k,
            None => {
                let k = match source {
                    KeySource::ShelveLocal => self.store.next_id(1)?,
                    KeySource::External(alloc) => alloc(&self.name)?,
                };
                row.set(self.key.clone(), k);
                k
            }
        };
        self.store.put(&tuple, vec![row.clone()])?;
        Ok(key_val)
    }

    /// Lookup-or-insert.
    pub fn ensure(&mut self, row: &mut Row, mapping: &NameMapping, source: &mut KeySource<'_>) -> Result<i64> {
        if let Some(k) = self.lookup_raw(row, mapping)? {
            return Ok(k);
        }
        self.insert(row, mapping, source)
    }

    pub fn store(&self) -> &ShelvedStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ShelvedStore {
        &mut self.store
    }

    /// Declaration fields without the store, used by the Offline
    /// Big-Dim strategy to open an independent per-task instance of a
    /// dimension that is already registered process-wide (see
    /// `offdimtables.open_shelveddb(taskid=...)`).
    pub fn declaration(&self) -> (String, String, Vec<String>, Vec<String>, Option<i64>) {
        (self.name.clone(), self.key.clone(), self.attributes.clone(), self.lookupatts.clone(), self.default_id)
    }
}

/// A Type-1 or Type-2 slowly changing dimension. Ported from
/// `offdimtables.SlowlyChangingDimension`.
pub struct ScdDimension {
    pub name: String,
    pub key: String,
    pub attributes: Vec<String>,
    pub lookupatts: Vec<String>,
    pub default_id: Option<i64>,
    pub versionatt: String,
    pub fromatt: String,
    pub toatt: String,
    /// Source attribute carrying the version-effective date. `None`
    /// means "use today's date", mirroring the source's default
    /// `fromfinder = etlmr.today`.
    pub srcdateatt: Option<String>,
    /// Non-empty selects the Type-1 path; empty selects Type-2.
    pub type1atts: Vec<String>,
    store: ShelvedStore,
}

impl ScdDimension {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        attributes: Vec<String>,
        lookupatts: Vec<String>,
        default_id: Option<i64>,
        versionatt: impl Into<String>,
        fromatt: impl Into<String>,
        toatt: impl Into<String>,
        srcdateatt: Option<String>,
        type1atts: Vec<String>,
        store: ShelvedStore,
    ) -> Result<Self> {
        let name = name.into();
        let key = key.into();
        let versionatt = versionatt.into();
        let fromatt = fromatt.into();
        let toatt = toatt.into();
        for (label, att) in [("versionatt", &versionatt), ("fromatt", &fromatt), ("toatt", &toatt)] {
            if !attributes.contains(att) {
                return Err(EtlError::Configuration(format!(
                    "dimension {name}: {label} ({att}) must be declared in attributes"
                )));
            }
        }
        if lookupatts.is_empty() {
            return Err(EtlError::Configuration(format!("dimension {name}: lookupatts must be non-empty")));
        }
        Ok(ScdDimension {
            name,
            key,
            attributes,
            lookupatts,
            default_id,
            versionatt,
            fromatt,
            toatt,
            srcdateatt,
            type1atts,
            store,
        })
    }

    fn is_type1(&self) -> bool {
        !self.type1atts.is_empty()
    }

    fn effective_date(&self, row: &Row, mapping: &NameMapping) -> chrono::NaiveDate {
        self.srcdateatt
            .as_ref()
            .and_then(|att| row.get_mapped(att, mapping))
            .and_then(Value::as_date)
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    fn versions(&mut self, row: &Row, mapping: &NameMapping) -> Result<Vec<Row>> {
        let tuple = row.lookup_tuple(&self.lookupatts, mapping);
        Ok(self.store.get(&tuple)?.unwrap_or_default())
    }

    fn put_versions(&mut self, row: &Row, mapping: &NameMapping, versions: Vec<Row>) -> Result<()> {
        let tuple = row.lookup_tuple(&self.lookupatts, mapping);
        self.store.put(&tuple, versions)
    }

    fn lookup_raw(&mut self, row: &Row, mapping: &NameMapping) -> Result<Option<i64>> {
        let versions = self.versions(row, mapping)?;
        if self.is_type1() {
            return Ok(versions.first().and_then(|r| r.get(&self.key)).and_then(Value::as_i64));
        }
        let src_date = self.effective_date(row, mapping);
        for version in versions.iter().rev() {
            let from = version.get(&self.fromatt).and_then(Value::as_date);
            let to = version
                .get(&self.toatt)
                .and_then(Value::as_date)
                .unwrap_or_else(|| chrono::NaiveDate::from_ymd_opt(9999, 12, 31).unwrap());
            if let Some(from) = from {
                if from <= src_date && src_date < to {
                    return Ok(version.get(&self.key).and_then(Value::as_i64));
                }
            }
        }
        Ok(None)
    }

    pub fn lookup(&mut self, row: &Row, mapping: &NameMapping) -> Result<Option<i64>> {
        Ok(self.lookup_raw(row, mapping)?.or(self.default_id))
    }

    fn non_control_differs(&self, a: &Row, b: &Row) -> bool {
        self.attributes
            .iter()
            .filter(|att| {
                *att != &self.versionatt && *att != &self.fromatt && *att != &self.toatt
            })
            .any(|att| a.get(att) != b.get(att))
    }

    pub fn ensure(&mut self, row: &mut Row, mapping: &NameMapping, source: &mut KeySource<'_>) -> Result<i64> {
        if self.is_type1() {
            return self.type1_ensure(row, mapping, source);
        }
        self.type2_ensure(row, mapping, source)
    }

    fn next_key(&mut self, source: &mut KeySource<'_>) -> Result<i64> {
        match source {
            KeySource::ShelveLocal => self.store.next_id(1),
            KeySource::External(alloc) => alloc(&self.name),
        }
    }

    fn type1_ensure(&mut self, row: &mut Row, mapping: &NameMapping, source: &mut KeySource<'_>) -> Result<i64> {
        let mut versions = self.versions(row, mapping)?;
        if let Some(existing) = versions.first_mut() {
            let differs = self
                .type1atts
                .iter()
                .any(|att| existing.get(att) != row.get_mapped(att, mapping));
            let key = existing.get(&self.key).and_then(Value::as_i64).ok_or_else(|| {
                EtlError::Configuration(format!("dimension {}: stored row missing key", self.name))
            })?;
            if differs {
                for att in &self.type1atts {
                    if let Some(v) = row.get_mapped(att, mapping) {
                        existing.set(att.clone(), v.clone());
                    }
                }
                let versions = versions;
                self.put_versions(row, mapping, versions)?;
            }
            return Ok(key);
        }
        drop(versions);
        let key = self.next_key(source)?;
        row.set(self.key.clone(), key);
        self.put_versions(row, mapping, vec![row.clone()])?;
        Ok(key)
    }

    fn type2_ensure(&mut self, row: &mut Row, mapping: &NameMapping, source: &mut KeySource<'_>) -> Result<i64> {
        let mut versions = self.versions(row, mapping)?;
        let src_date = self.effective_date(row, mapping);

        if versions.is_empty() {
            let key = self.next_key(source)?;
            row.set(self.key.clone(), key);
            row.set(self.versionatt.clone(), 1i64);
            row.set(self.fromatt.clone(), Value::Date(src_date));
            row.set(self.toatt.clone(), Value::Null);
            self.put_versions(row, mapping, vec![row.clone()])?;
            return Ok(key);
        }

        let last_idx = versions.len() - 1;
        let last_from = versions[last_idx].get(&self.fromatt).and_then(Value::as_date);
        let should_version = last_from.map(|from| src_date > from).unwrap_or(true)
            && self.non_control_differs(&versions[last_idx], row);

        if !should_version {
            let key = versions[last_idx].get(&self.key).and_then(Value::as_i64).ok_or_else(|| {
                EtlError::Configuration(format!("dimension {}: stored row missing key", self.name))
            })?;
            return Ok(key);
        }

        versions[last_idx].set(self.toatt.clone(), Value::Date(src_date));
        let prior_version = versions[last_idx].get(&self.versionatt).and_then(Value::as_i64).unwrap_or(0);

        let key = self.next_key(source)?;
        row.set(self.key.clone(), key);
        row.set(self.versionatt.clone(), prior_version + 1);
        row.set(self.fromatt.clone(), Value::Date(src_date));
        row.set(self.toatt.clone(), Value::Null);
        versions.push(row.clone());
        self.put_versions(row, mapping, versions)?;
        Ok(key)
    }

    pub fn store(&self) -> &ShelvedStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ShelvedStore {
        &mut self.store
    }
}

/// A dimension defined by its place in a snowflake: ensuring it first
/// ensures every child, substituting each child's returned key into the
/// named foreign-key attribute on the row, then ensures `parent` itself.
/// Ported from the recursive walk in `odotetlmr.dim_reduce_func`.
pub struct SnowflakedDimension {
    pub name: String,
    pub parent: DimensionHandle,
    /// (child dimension, foreign-key attribute set on the row with the
    /// child's resolved surrogate key).
    pub children: Vec<(DimensionHandle, String)>,
}

/// The closed variant set of dimension kinds.
pub enum Dimension {
    Cached(CachedDimension),
    Scd(ScdDimension),
    Snowflaked(SnowflakedDimension),
}

impl Dimension {
    pub fn name(&self) -> &str {
        match self {
            Dimension::Cached(d) => &d.name,
            Dimension::Scd(d) => &d.name,
            Dimension::Snowflaked(d) => &d.name,
        }
    }
}

/// Owns every dimension in a job and resolves snowflake edges by index,
/// never by shared pointer.
#[derive(Default)]
pub struct DimensionRegistry {
    dims: Vec<Dimension>,
}

impl DimensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dim: Dimension) -> DimensionHandle {
        self.dims.push(dim);
        DimensionHandle(self.dims.len() - 1)
    }

    pub fn handle_by_name(&self, name: &str) -> Option<DimensionHandle> {
        self.dims.iter().position(|d| d.name() == name).map(DimensionHandle)
    }

    pub fn get(&self, handle: DimensionHandle) -> &Dimension {
        &self.dims[handle.0]
    }

    pub fn get_mut(&mut self, handle: DimensionHandle) -> &mut Dimension {
        &mut self.dims[handle.0]
    }

    /// The row attribute that carries this dimension's resolved
    /// surrogate key. For a snowflaked dimension this is its parent's
    /// key attribute, resolved recursively.
    pub fn key_attr(&self, handle: DimensionHandle) -> &str {
        match &self.dims[handle.0] {
            Dimension::Cached(d) => &d.key,
            Dimension::Scd(d) => &d.key,
            Dimension::Snowflaked(sf) => self.key_attr(sf.parent),
        }
    }

    /// Resolves a row's surrogate key for `handle`, recursing through
    /// snowflake children first.
    pub fn lookup(&mut self, handle: DimensionHandle, row: &Row, mapping: &NameMapping) -> Result<Option<i64>> {
        match &mut self.dims[handle.0] {
            Dimension::Cached(d) => d.lookup(row, mapping),
            Dimension::Scd(d) => d.lookup(row, mapping),
            Dimension::Snowflaked(_) => {
                let (parent, children) = match &self.dims[handle.0] {
                    Dimension::Snowflaked(sf) => (sf.parent, sf.children.clone()),
                    _ => unreachable!(),
                };
                let mut row = row.clone();
                for (child, fk) in children {
                    match self.lookup(child, &row, mapping)? {
                        Some(k) => row.set(fk, k),
                        None => return Ok(None),
                    }
                }
                self.lookup(parent, &row, mapping)
            }
        }
    }

    /// Lookup-or-insert for `handle`, recursing through snowflake
    /// children first and writing their resolved keys back into `row`.
    pub fn ensure(
        &mut self,
        handle: DimensionHandle,
        row: &mut Row,
        mapping: &NameMapping,
        source: &mut KeySource<'_>,
    ) -> Result<i64> {
        let snowflake = match &self.dims[handle.0] {
            Dimension::Snowflaked(sf) => Some((sf.parent, sf.children.clone())),
            _ => None,
        };
        if let Some((parent, children)) = snowflake {
            for (child, fk) in children {
                let child_key = self.ensure(child, row, mapping, source)?;
                row.set(fk, child_key);
            }
            return self.ensure(parent, row, mapping, source);
        }
        match &mut self.dims[handle.0] {
            Dimension::Cached(d) => d.ensure(row, mapping, source),
            Dimension::Scd(d) => d.ensure(row, mapping, source),
            Dimension::Snowflaked(_) => unreachable!(),
        }
    }

    /// Lookup-or-insert for `handle`, but snowflake children are only
    /// looked up, never ensured, mirroring `odotetlmr.dim_reduce_func`'s
    /// `refdim.lookup(...)` calls. A miss leaves the child's foreign-key
    /// attribute unset (`Value::Null`), same fallback `lookup` already
    /// uses when a fact row references a dimension that doesn't exist.
    pub fn ensure_with_looked_up_children(
        &mut self,
        handle: DimensionHandle,
        row: &mut Row,
        mapping: &NameMapping,
        source: &mut KeySource<'_>,
    ) -> Result<i64> {
        let snowflake = match &self.dims[handle.0] {
            Dimension::Snowflaked(sf) => Some((sf.parent, sf.children.clone())),
            _ => None,
        };
        if let Some((parent, children)) = snowflake {
            for (child, fk) in children {
                match self.lookup(child, row, mapping)? {
                    Some(k) => row.set(fk, k),
                    None => row.set(fk, Value::Null),
                }
            }
            return self.ensure_with_looked_up_children(parent, row, mapping, source);
        }
        match &mut self.dims[handle.0] {
            Dimension::Cached(d) => d.ensure(row, mapping, source),
            Dimension::Scd(d) => d.ensure(row, mapping, source),
            Dimension::Snowflaked(_) => unreachable!(),
        }
    }

    /// Flushes every dimension's shelve. Called once at the end of a
    /// dimension-load process before it exits, mirroring the source
    /// closing every open shelve in `dimensions.py`'s `closeeverything`.
    pub fn sync_all(&mut self) -> Result<()> {
        for dim in &mut self.dims {
            match dim {
                Dimension::Cached(d) => d.store_mut().sync()?,
                Dimension::Scd(d) => d.store_mut().sync()?,
                Dimension::Snowflaked(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> ShelvedStore {
        let dir = tempfile::tempdir().unwrap();
        ShelvedStore::open(dir.into_path().join("d"), 100, false).unwrap()
    }

    #[test]
    fn cached_dimension_ensure_is_idempotent() {
        let store = open_store();
        let mut dim = CachedDimension::new(
            "serverdim",
            "serverid",
            vec!["server".into()],
            vec!["server".into()],
            None,
            store,
        )
        .unwrap();
        let mapping = NameMapping::new();
        let mut source = KeySource::ShelveLocal;
        let mut row = Row::new();
        row.set("server", "nginx");
        let k1 = dim.ensure(&mut row, &mapping, &mut source).unwrap();
        let mut row2 = Row::new();
        row2.set("server", "nginx");
        let k2 = dim.ensure(&mut row2, &mapping, &mut source).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn scd_type2_versions_on_change() {
        let store = open_store();
        let mut dim = ScdDimension::new(
            "pagedim",
            "pageid",
            vec!["url".into(), "size".into(), "version".into(), "validfrom".into(), "validto".into()],
            vec!["url".into()],
            None,
            "version",
            "validfrom",
            "validto",
            None,
            vec![],
            store,
        )
        .unwrap();
        let mapping = NameMapping::new();
        let mut source = KeySource::ShelveLocal;
        let mut row = Row::new();
        row.set("url", "http://example.org");
        row.set("size", 100i64);
        let k1 = dim.ensure(&mut row, &mapping, &mut source).unwrap();

        let mut row2 = Row::new();
        row2.set("url", "http://example.org");
        row2.set("size", 200i64);
        let k2 = dim.ensure(&mut row2, &mapping, &mut source).unwrap();
        assert_ne!(k1, k2);

        let versions = dim.versions(&row2, &mapping).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn scd_type1_ensure_overwrites_only_type1atts() {
        let store = open_store();
        let mut dim = ScdDimension::new(
            "serverdim",
            "serverid",
            vec!["server".into(), "ip".into(), "note".into(), "version".into(), "validfrom".into(), "validto".into()],
            vec!["server".into()],
            None,
            "version",
            "validfrom",
            "validto",
            None,
            vec!["ip".into()],
            store,
        )
        .unwrap();
        let mapping = NameMapping::new();
        let mut source = KeySource::ShelveLocal;

        let mut row = Row::new();
        row.set("server", "web1");
        row.set("ip", "10.0.0.1");
        row.set("note", "first seen");
        let k1 = dim.ensure(&mut row, &mapping, &mut source).unwrap();

        let mut row2 = Row::new();
        row2.set("server", "web1");
        row2.set("ip", "10.0.0.2");
        row2.set("note", "should not overwrite");
        let k2 = dim.ensure(&mut row2, &mapping, &mut source).unwrap();
        assert_eq!(k1, k2, "type-1 dimension never version-stamps");

        let versions = dim.versions(&row2, &mapping).unwrap();
        assert_eq!(versions.len(), 1);
        let stored = &versions[0];
        assert_eq!(stored.get("ip"), Some(&Value::from("10.0.0.2")));
        assert_eq!(stored.get("note"), Some(&Value::from("first seen")));
    }

    #[test]
    fn ensure_with_looked_up_children_does_not_insert_missing_child() {
        let mut registry = DimensionRegistry::new();
        let city =
            CachedDimension::new("citydim", "cityid", vec!["city".into()], vec!["city".into()], None, open_store())
                .unwrap();
        let city_handle = registry.register(Dimension::Cached(city));

        let cust = CachedDimension::new(
            "custdim",
            "custid",
            vec!["name".into(), "cityid".into()],
            vec!["name".into()],
            None,
            open_store(),
        )
        .unwrap();
        let cust_handle = registry.register(Dimension::Cached(cust));

        let sf_handle = registry.register(Dimension::Snowflaked(SnowflakedDimension {
            name: "custdim_sf".into(),
            parent: cust_handle,
            children: vec![(city_handle, "cityid".into())],
        }));

        let mapping = NameMapping::new();
        let mut source = KeySource::ShelveLocal;
        let mut row = Row::new();
        row.set("name", "alice");
        row.set("city", "oslo");

        registry.ensure_with_looked_up_children(sf_handle, &mut row, &mapping, &mut source).unwrap();
        assert_eq!(row.get("cityid"), Some(&Value::Null));

        let mut city_row = Row::new();
        city_row.set("city", "oslo");
        let looked_up = registry.lookup(city_handle, &city_row, &mapping).unwrap();
        assert_eq!(looked_up, None, "child dimension must not be inserted by a lookup-only ensure");
    }
}

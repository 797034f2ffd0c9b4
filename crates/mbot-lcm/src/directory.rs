//! [`TypeDirectory`] and [`TypeResolver`].
//!
//! The directory is an explicit, statically registered list of namespaces,
//! each holding record schemas in declaration order.  Every entry carries
//! its precomputed fingerprint, so decoding and encoding need no runtime
//! introspection.
//!
//! The resolver narrows the directory down to the namespaces a deployment
//! asked for and answers two questions:
//!
//! * *Which schema has this name?* ([`TypeResolver::resolve_by_name`])
//! * *Which schema decodes these bytes?* ([`TypeResolver::discover`]) – an
//!   ordered linear scan, namespace list order first and declaration order
//!   within a namespace, returning the first successful trial decode.
//!
//! Trial decoding is best-effort: a payload that happens to carry another
//! type's fingerprint is misclassified.

use std::collections::HashMap;
use std::sync::Arc;

use mbot_types::{BridgeError, Value};
use tracing::{debug, warn};

use crate::builtin::{self, BUILTIN_NAMESPACE};
use crate::codec;
use crate::marshal;
use crate::record::LcmRecord;
use crate::schema::TypeSchema;

/// A named group of record schemas.
#[derive(Debug, Clone)]
pub struct Namespace {
    name: String,
    types: Vec<TypeSchema>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
        }
    }

    /// Register a schema (builder-style).  Declaration order is kept.
    pub fn with_type(mut self, schema: TypeSchema) -> Self {
        self.types.push(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One registered record type.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub namespace: String,
    pub schema: Arc<TypeSchema>,
    pub fingerprint: u64,
}

impl TypeEntry {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// `namespace.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.schema.name)
    }
}

/// Statically registered type directory.
#[derive(Debug, Clone)]
pub struct TypeDirectory {
    /// Namespace names in registration order.
    namespaces: Vec<String>,
    /// Entries grouped by namespace, in registration then declaration order.
    entries: Vec<TypeEntry>,
    /// `(namespace, type name)` → index into `entries`.
    index: HashMap<(String, String), usize>,
}

impl TypeDirectory {
    /// Build a directory from `namespaces`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for duplicate names, invalid schemas,
    /// or struct references that resolve to nothing.
    pub fn new(namespaces: Vec<Namespace>) -> Result<Self, BridgeError> {
        let mut dir = Self {
            namespaces: Vec::new(),
            entries: Vec::new(),
            index: HashMap::new(),
        };
        for ns in namespaces {
            if dir.has_namespace(&ns.name) {
                return Err(BridgeError::Config(format!("duplicate namespace {}", ns.name)));
            }
            for schema in ns.types {
                schema.validate().map_err(BridgeError::Config)?;
                let key = (ns.name.clone(), schema.name.clone());
                if dir.index.contains_key(&key) {
                    return Err(BridgeError::Config(format!(
                        "duplicate type {}.{}",
                        ns.name, schema.name
                    )));
                }
                dir.index.insert(key, dir.entries.len());
                dir.entries.push(TypeEntry {
                    namespace: ns.name.clone(),
                    schema: Arc::new(schema),
                    fingerprint: 0,
                });
            }
            dir.namespaces.push(ns.name);
        }

        let mut fingerprints = Vec::with_capacity(dir.entries.len());
        for idx in 0..dir.entries.len() {
            fingerprints.push(dir.fingerprint_of(idx, &mut Vec::new())?);
        }
        for (entry, fp) in dir.entries.iter_mut().zip(fingerprints) {
            entry.fingerprint = fp;
        }
        Ok(dir)
    }

    /// Directory holding only the built-in `mbot_lcm_msgs` namespace.
    pub fn builtin() -> Result<Self, BridgeError> {
        Self::new(vec![builtin::namespace()])
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|n| n == name)
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Look up `name` relative to namespace `ns`.  A `pkg.type` name is
    /// looked up in `pkg` instead.
    pub fn lookup(&self, ns: &str, name: &str) -> Option<&TypeEntry> {
        let (ns, name) = name.split_once('.').unwrap_or((ns, name));
        self.index
            .get(&(ns.to_string(), name.to_string()))
            .map(|&idx| &self.entries[idx])
    }

    /// Entries of the given namespaces, in list order then declaration order.
    pub fn entries_in<'a, 'm>(&'a self, modules: &'m [String]) -> impl Iterator<Item = &'a TypeEntry> + 'm
    where
        'a: 'm,
    {
        modules
            .iter()
            .flat_map(move |m| self.entries.iter().filter(move |e| e.namespace == *m))
    }

    /// Trial-decode `bytes` against every type in `modules`, returning the
    /// first type that decodes cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnresolvedType`] when nothing decodes.
    pub fn discover(&self, bytes: &[u8], modules: &[String]) -> Result<&TypeEntry, BridgeError> {
        self.entries_in(modules)
            .find(|entry| codec::decode(self, entry, bytes).is_ok())
            .ok_or(BridgeError::UnresolvedType { len: bytes.len() })
    }

    fn fingerprint_of(&self, idx: usize, parents: &mut Vec<usize>) -> Result<u64, BridgeError> {
        if parents.contains(&idx) {
            return Ok(0);
        }
        let entry = &self.entries[idx];
        parents.push(idx);
        let mut nested = Vec::new();
        for name in entry.schema.struct_refs() {
            let (ns, ty) = name.split_once('.').unwrap_or((entry.namespace.as_str(), name));
            let child = *self.index.get(&(ns.to_string(), ty.to_string())).ok_or_else(|| {
                BridgeError::Config(format!(
                    "{} references unknown type {name}",
                    entry.qualified_name()
                ))
            })?;
            nested.push(self.fingerprint_of(child, parents)?);
        }
        parents.pop();
        Ok(codec::fold_fingerprint(codec::base_hash(&entry.schema), nested))
    }
}

/// Name resolution and type discovery over the namespaces a deployment
/// enabled.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    directory: Arc<TypeDirectory>,
    modules: Vec<String>,
}

impl TypeResolver {
    /// Enable `requested` namespaces of `directory`.
    ///
    /// Unknown namespaces are skipped with a warning.  When none of the
    /// requested namespaces exist the resolver falls back to the built-in
    /// namespace (or, failing that, to every registered namespace).
    pub fn new(directory: Arc<TypeDirectory>, requested: &[String]) -> Self {
        let mut modules: Vec<String> = Vec::new();
        for name in requested {
            if !directory.has_namespace(name) {
                warn!(namespace = %name, "message type namespace is not available, skipping");
            } else if !modules.contains(name) {
                modules.push(name.clone());
            }
        }
        if modules.is_empty() {
            modules = if directory.has_namespace(BUILTIN_NAMESPACE) {
                vec![BUILTIN_NAMESPACE.to_string()]
            } else {
                directory.namespaces().to_vec()
            };
            warn!(fallback = ?modules, "no configured type namespace available, using fallback");
        }
        debug!(modules = ?modules, "type resolver ready");
        Self { directory, modules }
    }

    /// Resolver over the built-in namespace only.
    pub fn builtin() -> Result<Self, BridgeError> {
        Ok(Self::new(
            Arc::new(TypeDirectory::builtin()?),
            &[BUILTIN_NAMESPACE.to_string()],
        ))
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn directory(&self) -> &TypeDirectory {
        &self.directory
    }

    /// Resolve a type name: `pkg.type` within an enabled namespace, or a
    /// bare name searched in namespace order.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnknownType`] when no enabled namespace has it.
    pub fn resolve_by_name(&self, name: &str) -> Result<&TypeEntry, BridgeError> {
        let found = match name.split_once('.') {
            Some((ns, _)) if self.modules.iter().any(|m| m == ns) => self.directory.lookup(ns, name),
            Some(_) => None,
            None => self
                .modules
                .iter()
                .find_map(|m| self.directory.lookup(m, name)),
        };
        found.ok_or_else(|| BridgeError::UnknownType(name.to_string()))
    }

    /// Find the type of `bytes` by trial decoding.
    pub fn discover(&self, bytes: &[u8]) -> Result<&TypeEntry, BridgeError> {
        self.directory.discover(bytes, &self.modules)
    }

    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<LcmRecord, BridgeError> {
        let entry = self.resolve_by_name(type_name)?;
        codec::decode(&self.directory, entry, bytes)
    }

    pub fn encode(&self, type_name: &str, record: &LcmRecord) -> Result<Vec<u8>, BridgeError> {
        let entry = self.resolve_by_name(type_name)?;
        codec::encode(&self.directory, entry, record)
    }

    /// Decode `bytes` straight to a structured value.
    pub fn decode_value(&self, type_name: &str, bytes: &[u8]) -> Result<Value, BridgeError> {
        self.decode(type_name, bytes).map(|record| marshal::to_structured(&record))
    }

}

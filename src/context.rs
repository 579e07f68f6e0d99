//! Entities that can be placed in the dependency graph: modules, the imports they declare and
//! the functions they import.
//!
//! Every entity has a string identity. Equality, ordering and hashing are all derived from it,
//! so two instances describing the same thing can be folded together with `merge`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use crate::common::lower;

pub trait Context {
    /// Canonical identity
    fn identity(&self) -> &str;

    /// Fold another instance with the same identity into this one
    fn merge(&mut self, other: Self)
    where
        Self: Sized;
}

macro_rules! identity_relations {
    ($t:ty) => {
        impl PartialEq for $t {
            fn eq(&self, other: &Self) -> bool {
                self.identity() == other.identity()
            }
        }

        impl Eq for $t {}

        impl PartialOrd for $t {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $t {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.identity().cmp(other.identity())
            }
        }

        impl Hash for $t {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.identity().hash(state)
            }
        }
    };
}

/// Symbol imported by name from a library
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    /// name of the owning import; never keeps it alive
    import: Weak<str>,
}

impl Function {
    pub fn new(name: &str, import: &Rc<str>) -> Self {
        Self {
            name: name.to_owned(),
            import: Rc::downgrade(import),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the import this function belongs to, if that import still exists
    pub fn import_name(&self) -> Option<Rc<str>> {
        self.import.upgrade()
    }

    /// `Import!Function`, or just the function name if the import is gone
    pub fn qualified_name(&self) -> String {
        match self.import.upgrade() {
            Some(import) => format!("{}!{}", import, self.name),
            None => self.name.clone(),
        }
    }
}

impl Context for Function {
    fn identity(&self) -> &str {
        &self.name
    }

    fn merge(&mut self, _other: Self) {}
}

identity_relations!(Function);

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// Library named in the import table (or delay-load table) of a module
#[derive(Debug, Clone)]
pub struct Import {
    /// logical name, after API set resolution, lowercase
    name: Rc<str>,
    /// name as it literally appears in the binary
    alias: String,
    functions: BTreeSet<Function>,
    unresolved: bool,
}

impl Import {
    pub fn new(name: &str, alias: &str) -> Self {
        Self {
            name: Rc::from(lower(name)),
            alias: alias.to_owned(),
            functions: BTreeSet::new(),
            unresolved: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn add_function(&mut self, name: &str) {
        self.functions.insert(Function::new(name, &self.name));
    }

    /// True when the module this import refers to could not be walked
    pub fn is_unresolved(&self) -> bool {
        self.unresolved
    }

    pub fn set_unresolved(&mut self, unresolved: bool) {
        self.unresolved = unresolved;
    }
}

impl Context for Import {
    fn identity(&self) -> &str {
        &self.name
    }

    fn merge(&mut self, other: Self) {
        for f in other.functions {
            // rebind to ourselves, `other` is about to go away
            self.functions.insert(Function::new(&f.name, &self.name));
        }
        self.unresolved |= other.unresolved;
    }
}

identity_relations!(Import);

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A binary image (executable or library) and the imports it declares
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    path: Option<PathBuf>,
    imports: BTreeMap<String, Import>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: lower(name),
            path: None,
            imports: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.path = Some(path.into());
    }

    /// Imports sorted by name
    pub fn imports(&self) -> impl Iterator<Item = &Import> {
        self.imports.values()
    }

    pub fn import(&self, name: &str) -> Option<&Import> {
        self.imports.get(&lower(name))
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    /// Total number of named functions imported from all libraries
    pub fn function_count(&self) -> usize {
        self.imports.values().map(Import::function_count).sum()
    }

    /// Add an import, merging it with the one of the same name if already present
    pub fn add_import(&mut self, import: Import) {
        match self.imports.get_mut(import.identity()) {
            Some(existing) => existing.merge(import),
            None => {
                self.imports.insert(import.identity().to_owned(), import);
            }
        }
    }

    /// Replace the whole import set
    pub fn set_imports<I: IntoIterator<Item = Import>>(&mut self, imports: I) {
        self.imports.clear();
        for i in imports {
            self.add_import(i);
        }
    }

    /// Flag an import as unresolved; returns false if the module has no such import
    pub fn mark_unresolved(&mut self, name: &str) -> bool {
        match self.imports.get_mut(&lower(name)) {
            Some(import) => {
                import.set_unresolved(true);
                true
            }
            None => false,
        }
    }
}

impl Context for Module {
    fn identity(&self) -> &str {
        &self.name
    }

    fn merge(&mut self, other: Self) {
        if self.path.is_none() {
            self.path = other.path;
        }
        for import in other.imports.into_values() {
            self.add_import(import);
        }
    }
}

identity_relations!(Module);

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

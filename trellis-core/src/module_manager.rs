//! Module graph walker.
//!
//! [`ModuleManager`] normalizes every module reachable from the root exactly
//! once and keeps the identity → metadata map. The map can be changed after
//! bootstrap with [`ModuleManager::add_import`] and
//! [`ModuleManager::remove_import`]; the first change after a commit takes a
//! snapshot that [`ModuleManager::rollback`] restores.

use crate::metadata::NormalizedMeta;
use crate::module::{ModuleId, ModuleKey, ModuleRef};
use crate::normalizer::{ModuleNormalizer, unresolved_export};
use crate::provider::Scope;
use crate::token::Token;
use crate::{Error, Result};
use indexmap::IndexMap;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Clone)]
struct Snapshot {
    map: IndexMap<ModuleKey, NormalizedMeta>,
    map_id: HashMap<String, ModuleKey>,
}

/// A module currently being scanned
#[derive(Clone, Copy)]
struct Frame {
    key: ModuleKey,
    type_id: TypeId,
    name: &'static str,
}

impl Frame {
    fn of(module: &ModuleRef) -> Self {
        Self {
            key: module.key(),
            type_id: module.module_type().type_id(),
            name: module.name(),
        }
    }
}

#[derive(Default)]
pub struct ModuleManager {
    normalizer: ModuleNormalizer,
    map: IndexMap<ModuleKey, NormalizedMeta>,
    map_id: HashMap<String, ModuleKey>,
    root: Option<ModuleKey>,
    snapshot: Option<Snapshot>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_normalizer(normalizer: ModuleNormalizer) -> Self {
        Self {
            normalizer,
            ..Self::default()
        }
    }

    /// Scan the whole graph below `root`, replacing any previous state
    pub fn scan_root_module(&mut self, root: impl Into<ModuleRef>) -> Result<&NormalizedMeta> {
        let root = root.into();
        self.map.clear();
        self.map_id.clear();
        self.snapshot = None;
        self.root = None;

        self.scan_inner(root.clone(), None, &mut Vec::new(), false)?;
        let key = root.key();
        let meta = self.get(key)?;
        if !meta.is_root() {
            return Err(Error::Configuration(format!(
                "{} is used as the root module but is declared as a feature module",
                meta.name
            )));
        }
        self.root = Some(key);
        self.verify_exports()?;

        info!(root = %root, modules = self.map.len(), "Scanned module graph");
        self.get(key)
    }

    /// Scan a module and its imports into the map without making it the root
    pub fn scan_module(&mut self, module: impl Into<ModuleRef>) -> Result<ModuleKey> {
        let module = module.into();
        self.scan_inner(module.clone(), None, &mut Vec::new(), false)?;
        self.verify_exports()?;
        Ok(module.key())
    }

    fn scan_inner(
        &mut self,
        module: ModuleRef,
        importer: Option<&str>,
        path: &mut Vec<Frame>,
        forward: bool,
    ) -> Result<()> {
        let frame = Frame::of(&module);
        if let Some(pos) = path
            .iter()
            .position(|f| f.key == frame.key || f.type_id == frame.type_id)
        {
            if forward {
                return Ok(());
            }
            let chain: Vec<&str> = path[pos..]
                .iter()
                .map(|f| f.name)
                .chain([frame.name])
                .collect();
            return Err(Error::CircularDependency(format!(
                "Detected circular imports: {}. Use a forward reference to import one of them lazily.",
                chain.join(" -> ")
            )));
        }
        if self.map.contains_key(&frame.key) {
            return Ok(());
        }

        let meta = self.normalizer.normalize(&module).map_err(|err| match importer {
            Some(importer) => err.context(format!("Scanning imports of {}", importer)),
            None => err,
        })?;

        if let Some(id) = &meta.id {
            match self.map_id.get(id) {
                Some(existing) if *existing != frame.key => {
                    return Err(Error::Configuration(format!(
                        "Module with ID \"{}\" already exists, {} cannot reuse it",
                        id, meta.name
                    )));
                }
                _ => {
                    self.map_id.insert(id.clone(), frame.key);
                }
            }
        }

        let imports: Vec<(ModuleRef, bool)> = meta
            .imports()
            .map(|m| {
                let forward = meta.is_forward_import(m.key());
                (m, forward)
            })
            .collect();
        let name = meta.name.clone();
        debug!(module = %name, imports = imports.len(), "Scanning module");
        self.map.insert(frame.key, meta);

        path.push(frame);
        for (imported, forward) in imports {
            self.scan_inner(imported, Some(&name), path, forward)?;
        }
        path.pop();
        Ok(())
    }

    /// Check tokens that a module exports on behalf of re-exported modules
    fn verify_exports(&self) -> Result<()> {
        for meta in self.map.values() {
            for token in &meta.reexported_tokens {
                let mut seen = HashSet::new();
                if !self.reexports_token(meta, token, &mut seen) {
                    return Err(unresolved_export(token, &meta.name));
                }
            }
        }
        Ok(())
    }

    fn reexports_token(&self, meta: &NormalizedMeta, token: &Token, seen: &mut HashSet<ModuleKey>) -> bool {
        for module in meta.reexports() {
            if !seen.insert(module.key()) {
                continue;
            }
            let Some(sub) = self.map.get(&module.key()) else {
                continue;
            };
            let direct = Scope::EXPORTABLE
                .iter()
                .any(|scope| sub.exported_at(*scope).any(|p| &p.token == token))
                || sub.exported_extensions().any(|e| &e.group == token);
            if direct || self.reexports_token(sub, token, seen) {
                return true;
            }
        }
        false
    }

    pub fn root_key(&self) -> Option<ModuleKey> {
        self.root
    }

    pub fn root_metadata(&self) -> Option<&NormalizedMeta> {
        self.root.and_then(|key| self.map.get(&key))
    }

    pub fn key_of(&self, id: &ModuleId) -> Option<ModuleKey> {
        match id {
            ModuleId::Root => self.root,
            ModuleId::Id(id) => self.map_id.get(id).copied(),
            ModuleId::Ref(module) => Some(module.key()).filter(|key| self.map.contains_key(key)),
        }
    }

    pub fn get_metadata(&self, id: impl Into<ModuleId>) -> Option<&NormalizedMeta> {
        self.key_of(&id.into()).and_then(|key| self.map.get(&key))
    }

    pub(crate) fn get(&self, key: ModuleKey) -> Result<&NormalizedMeta> {
        self.map.get(&key).ok_or_else(|| {
            Error::Configuration(format!("Module {:?} is not part of the module graph", key))
        })
    }

    /// Metadata in scan order
    pub fn modules(&self) -> impl Iterator<Item = &NormalizedMeta> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Import `module` into `target`.
    ///
    /// Returns `false` if `target` already imports it. A failed scan of the
    /// new module rolls back every uncommitted change.
    pub fn add_import(&mut self, module: impl Into<ModuleRef>, target: impl Into<ModuleId>) -> Result<bool> {
        let module = module.into();
        let target = target.into();
        let target_key = self.key_of(&target).ok_or_else(|| {
            Error::Configuration(format!(
                "Failed adding {} to imports: target module with ID \"{}\" not found",
                module, target
            ))
        })?;

        let target_meta = self.get(target_key)?;
        if target_meta.imports_key(module.key()) {
            debug!(module = %module, target = %target_meta.name, "Module is already imported");
            return Ok(false);
        }
        let target_name = target_meta.name.clone();

        self.start_transaction();
        if let Some(meta) = self.map.get_mut(&target_key) {
            meta.add_import(module.clone());
        }

        let mut path = self.path_to(target_key);
        let scanned = self
            .scan_inner(module.clone(), Some(&target_name), &mut path, false)
            .and_then(|_| self.check_new_edge(target_key, module.key()))
            .and_then(|_| self.verify_exports());
        if let Err(err) = scanned {
            self.rollback();
            return Err(err);
        }

        info!(module = %module, target = %target_name, "Added import");
        Ok(true)
    }

    /// Remove `module` from the imports of `target` and drop every module
    /// that is no longer reachable from the root
    pub fn remove_import(&mut self, module: impl Into<ModuleId>, target: impl Into<ModuleId>) -> Result<bool> {
        let module = module.into();
        let target = target.into();
        let Some(module_key) = self.key_of(&module) else {
            debug!(module = %module, "Module to remove is not part of the graph");
            return Ok(false);
        };
        let target_key = self.key_of(&target).ok_or_else(|| {
            Error::Configuration(format!(
                "Failed removing {} from imports: target module with ID \"{}\" not found",
                module, target
            ))
        })?;
        if !self.get(target_key)?.imports_key(module_key) {
            return Ok(false);
        }

        self.start_transaction();
        if let Some(meta) = self.map.get_mut(&target_key) {
            meta.remove_import(module_key);
        }
        self.drop_unreachable();

        info!(module = %module, target = %target, "Removed import");
        Ok(true)
    }

    /// Keep the current graph and forget the snapshot
    pub fn commit(&mut self) {
        if self.snapshot.take().is_some() {
            debug!("Committed module graph changes");
        }
    }

    /// Restore the graph as it was before the first uncommitted change
    pub fn rollback(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.map = snapshot.map;
            self.map_id = snapshot.map_id;
            info!(modules = self.map.len(), "Rolled back module graph changes");
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        self.snapshot.is_some()
    }

    fn start_transaction(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(Snapshot {
                map: self.map.clone(),
                map_id: self.map_id.clone(),
            });
        }
    }

    /// Fail if `module` already leads back to `target` through plain imports
    fn check_new_edge(&self, target: ModuleKey, module: ModuleKey) -> Result<()> {
        fn walk(
            manager: &ModuleManager,
            key: ModuleKey,
            target: ModuleKey,
            chain: &mut Vec<String>,
            seen: &mut HashSet<ModuleKey>,
        ) -> bool {
            let Some(meta) = manager.map.get(&key) else {
                return false;
            };
            chain.push(meta.name.clone());
            if key == target {
                return true;
            }
            for imported in meta.imports().filter(|m| !meta.is_forward_import(m.key())) {
                if seen.insert(imported.key()) && walk(manager, imported.key(), target, chain, seen) {
                    return true;
                }
            }
            chain.pop();
            false
        }

        let mut chain = Vec::new();
        let mut seen = HashSet::from([module]);
        if !walk(self, module, target, &mut chain, &mut seen) {
            return Ok(());
        }
        if let Some(meta) = self.map.get(&target) {
            chain.insert(0, meta.name.clone());
        }
        Err(Error::CircularDependency(format!(
            "Detected circular imports: {}. Use a forward reference to import one of them lazily.",
            chain.join(" -> ")
        )))
    }

    /// Import chain from the root down to `target`, used for cycle detection
    fn path_to(&self, target: ModuleKey) -> Vec<Frame> {
        fn walk(
            manager: &ModuleManager,
            key: ModuleKey,
            target: ModuleKey,
            path: &mut Vec<Frame>,
            seen: &mut HashSet<ModuleKey>,
        ) -> bool {
            let Some(meta) = manager.map.get(&key) else {
                return false;
            };
            path.push(Frame::of(&meta.module));
            if key == target {
                return true;
            }
            for imported in meta.imports() {
                if seen.insert(imported.key()) && walk(manager, imported.key(), target, path, seen) {
                    return true;
                }
            }
            path.pop();
            false
        }

        let mut path = Vec::new();
        let start = self.root.unwrap_or(target);
        let mut seen = HashSet::from([start]);
        if !walk(self, start, target, &mut path, &mut seen) {
            path.clear();
            if let Some(meta) = self.map.get(&target) {
                path.push(Frame::of(&meta.module));
            }
        }
        path
    }

    fn drop_unreachable(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        let mut reachable = HashSet::from([root]);
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            let Some(meta) = self.map.get(&key) else {
                continue;
            };
            for module in meta.imports().chain(meta.reexports()) {
                if reachable.insert(module.key()) {
                    stack.push(module.key());
                }
            }
        }

        let before = self.map.len();
        self.map.retain(|key, _| reachable.contains(key));
        self.map_id.retain(|_, key| reachable.contains(key));
        if before != self.map.len() {
            debug!(removed = before - self.map.len(), "Dropped unreachable modules");
        }
    }
}

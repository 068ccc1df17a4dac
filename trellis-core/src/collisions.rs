//! Provider collision detection

use crate::module::ModuleKey;
use crate::module_factory::ProviderEntry;
use crate::provider::Provider;
use crate::token::Token;
use crate::Error;
use indexmap::IndexMap;
use std::collections::HashMap;

/// One token reaching a scope through non-identical definitions
#[derive(Debug, Clone, PartialEq)]
pub struct Collision {
    pub token: Token,
    pub sources: Vec<String>,
}

/// Group ordinary (non-multi) entries by token, keeping first-seen order
fn group_by_token(entries: &[ProviderEntry]) -> IndexMap<&Token, Vec<&ProviderEntry>> {
    let mut groups: IndexMap<&Token, Vec<&ProviderEntry>> = IndexMap::new();
    for entry in entries.iter().filter(|e| !e.provider.multi) {
        groups.entry(&entry.provider.token).or_default().push(entry);
    }
    groups
}

fn push_source(sources: &mut Vec<String>, entry: &ProviderEntry) {
    if let Some(source) = &entry.source
        && !sources.iter().any(|s| s.as_str() == &*source.name)
    {
        sources.push(source.name.to_string());
    }
}

/// Tokens that arrive more than once with definitions that are not identical.
///
/// Tokens for which `settled` returns true are skipped: the importer
/// declares them itself or names the winning module explicitly.
pub fn find_collisions(entries: &[ProviderEntry], settled: impl Fn(&Token) -> bool) -> Vec<Collision> {
    let mut collisions = Vec::new();
    for (token, group) in group_by_token(entries) {
        if group.len() < 2 || settled(token) {
            continue;
        }
        let first = &group[0].provider;
        if group.iter().all(|e| e.provider.is_identical(first)) {
            continue;
        }
        let mut sources = Vec::new();
        for entry in &group {
            push_source(&mut sources, entry);
        }
        collisions.push(Collision {
            token: token.clone(),
            sources,
        });
    }
    collisions
}

/// The imported entries that survive into a scope.
///
/// Multi entries are always kept. Ordinary entries are dropped when the
/// importer shadows the token, filtered to the chosen module when a
/// collision was settled explicitly, and otherwise kept once.
pub fn select_winners(
    entries: &[ProviderEntry],
    resolved: &HashMap<Token, ModuleKey>,
    shadowed: impl Fn(&Token) -> bool,
) -> Vec<ProviderEntry> {
    let mut winners: Vec<ProviderEntry> = Vec::new();
    for entry in entries {
        let token = &entry.provider.token;
        if entry.provider.multi {
            winners.push(entry.clone());
            continue;
        }
        if shadowed(token) {
            continue;
        }
        if let Some(chosen) = resolved.get(token)
            && entry.source.as_ref().map(|s| s.key) != Some(*chosen)
        {
            continue;
        }
        if winners.iter().any(|w| !w.provider.multi && &w.provider.token == token) {
            continue;
        }
        winners.push(entry.clone());
    }
    winners
}

/// Keep the last ordinary provider per token and every multi provider,
/// in their original order
pub fn last_providers(providers: Vec<Provider>) -> Vec<Provider> {
    let mut result: Vec<Provider> = Vec::with_capacity(providers.len());
    for provider in providers {
        if !provider.multi {
            result.retain(|p| p.multi || p.token != provider.token);
        }
        result.push(provider);
    }
    result
}

/// Append `entry` unless the same registration from the same module is present
pub(crate) fn push_unique(list: &mut Vec<ProviderEntry>, entry: ProviderEntry) {
    let duplicate = list
        .iter()
        .any(|e| e.source_key() == entry.source_key() && e.provider == entry.provider);
    if !duplicate {
        list.push(entry);
    }
}

pub fn collision_error(module: &str, collisions: Vec<Collision>) -> Error {
    let mut tokens = Vec::new();
    let mut sources: Vec<String> = Vec::new();
    for collision in collisions {
        let name = collision.token.to_string();
        if !tokens.contains(&name) {
            tokens.push(name);
        }
        for source in collision.sources {
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
    }
    Error::ProviderCollision {
        module: module.to_string(),
        tokens,
        sources,
    }
}

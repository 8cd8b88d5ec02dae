//! The frozen set of entity types one entity manager works with.
//!
//! Building the registry does the whole-graph analysis once:
//!
//! - **Flush order**: types are ranked by their required many-to-one and
//!   polymorphic references, so a referenced row is inserted before the rows
//!   that point at it. A cycle of required references is rejected with its path.
//! - **Reactive reverse index**: every reactive field and rule declares a load
//!   hint. The hint is inverted into "when field F of type T changes, walk
//!   these inverse relations to find the owners to recalculate".
//! - **Reactive cycles**: a reactive field that depends on itself, directly or
//!   through other reactive fields, is rejected.

use crate::hint::LoadHint;
use crate::metadata::{EntityBuilder, EntityMetadata, FieldId, FieldKind};
use sqlgraph_core::{Error, MetadataErrorKind, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// What a reactive registration recalculates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactiveKind {
    /// A persisted reactive field on the owner.
    Field(FieldId),
    /// Index into the owner's `reactive_rules`.
    Rule(usize),
}

/// One hop of a reverse walk: from an entity of type `entity`, follow `field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalkStep {
    pub entity: &'static str,
    pub field: FieldId,
}

/// A reactive registration reachable from one changed source field.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ReactiveTarget {
    pub owner: &'static str,
    pub kind: ReactiveKind,
    /// Steps from the changed entity back to the owner; empty when the
    /// changed entity is the owner.
    pub path: Vec<WalkStep>,
}

pub struct MetadataRegistry {
    entities: BTreeMap<&'static str, Arc<EntityMetadata>>,
    by_tag: HashMap<&'static str, &'static str>,
    reactive: HashMap<(&'static str, FieldId), Vec<Arc<ReactiveTarget>>>,
}

impl MetadataRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityMetadata>> {
        self.entities.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<EntityMetadata>> {
        self.get(name)
            .ok_or_else(|| Error::Custom(format!("unknown entity type '{name}'")))
    }

    pub fn by_tag(&self, tag: &str) -> Option<&Arc<EntityMetadata>> {
        self.by_tag.get(tag).and_then(|name| self.entities.get(name))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }

    /// Reactive registrations to enqueue when `field` of `entity` changes.
    pub fn reactive_targets(&self, entity: &str, field: FieldId) -> &[Arc<ReactiveTarget>] {
        self.entities
            .get_key_value(entity)
            .and_then(|(name, _)| self.reactive.get(&(*name, field)))
            .map_or(&[], Vec::as_slice)
    }

    /// Every source field of `entity` that feeds some reactive registration.
    pub fn reactive_sources(&self, entity: &str) -> Vec<FieldId> {
        let mut fields: Vec<FieldId> = self
            .reactive
            .keys()
            .filter(|(name, _)| *name == entity)
            .map(|(_, field)| *field)
            .collect();
        fields.sort();
        fields
    }
}

impl std::fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRegistry")
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .field("reactive_sources", &self.reactive.len())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entities: Vec<EntityBuilder>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn entity(mut self, entity: EntityBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn build(self) -> Result<Arc<MetadataRegistry>> {
        let mut seen = HashSet::new();
        let mut tags = HashSet::new();
        for entity in &self.entities {
            if !seen.insert(entity.name) || !tags.insert(entity.tag) {
                return Err(Error::metadata(
                    MetadataErrorKind::DuplicateEntity,
                    format!("entity '{}' (tag '{}') is declared twice", entity.name, entity.tag),
                    vec![entity.name.to_string()],
                ));
            }
        }
        check_targets(&self.entities)?;

        let dependencies = required_dependencies(&self.entities);
        check_cycles(&dependencies)?;
        let mut order = HashMap::new();
        for entity in &self.entities {
            flush_depth(entity.name, &dependencies, &mut order);
        }

        let mut entities = BTreeMap::new();
        let mut by_tag = HashMap::new();
        for builder in self.entities {
            let depth = order.get(builder.name).copied().unwrap_or(0);
            let meta = builder.finish(depth)?;
            by_tag.insert(meta.tag, meta.name);
            entities.insert(meta.name, Arc::new(meta));
        }

        let reactive = reverse_index(&entities)?;
        let registry = MetadataRegistry {
            entities,
            by_tag,
            reactive,
        };
        check_reactive_cycles(&registry)?;

        tracing::debug!(
            entities = registry.entities.len(),
            reactive_sources = registry.reactive.len(),
            "Built metadata registry"
        );
        Ok(Arc::new(registry))
    }
}

fn check_targets(entities: &[EntityBuilder]) -> Result<()> {
    let by_name: HashMap<&str, &EntityBuilder> = entities.iter().map(|e| (e.name, e)).collect();
    for entity in entities {
        for field in &entity.fields {
            for (other, other_field) in field.targets() {
                let Some(target) = by_name.get(other) else {
                    return Err(Error::metadata(
                        MetadataErrorKind::UnknownTarget,
                        format!("{}.{} points at unknown entity '{}'", entity.name, field.name, other),
                        vec![entity.name.to_string(), other.to_string()],
                    ));
                };
                if target.field_id(other_field).is_none() {
                    return Err(Error::metadata(
                        MetadataErrorKind::UnknownTarget,
                        format!(
                            "{}.{} names inverse {}.{} which does not exist",
                            entity.name, field.name, other, other_field
                        ),
                        vec![entity.name.to_string(), other.to_string()],
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Edges `type -> referenced type` for required references only; optional
/// references may point either way and are resolved by pre-assigned ids.
fn required_dependencies(
    entities: &[EntityBuilder],
) -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut deps: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
    for entity in entities {
        let list = deps.entry(entity.name).or_default();
        for field in &entity.fields {
            match &field.kind {
                FieldKind::ManyToOne {
                    other,
                    required: true,
                    ..
                } if *other != entity.name => list.push(*other),
                FieldKind::Polymorphic {
                    components,
                    required: true,
                } => list.extend(
                    components
                        .iter()
                        .map(|c| c.other)
                        .filter(|o| *o != entity.name),
                ),
                _ => {}
            }
        }
        list.sort_unstable();
        list.dedup();
    }
    deps
}

fn check_cycles(deps: &BTreeMap<&'static str, Vec<&'static str>>) -> Result<()> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();

    for &entity in deps.keys() {
        if !visited.contains(&entity)
            && detect_cycle_dfs(entity, deps, &mut visited, &mut rec_stack, &mut cycle_path)
        {
            return Err(Error::metadata(
                MetadataErrorKind::ForeignKeyCycle,
                "required foreign keys form a cycle",
                cycle_path.iter().map(|s| (*s).to_string()).collect(),
            ));
        }
    }
    Ok(())
}

fn detect_cycle_dfs<N>(
    node: N,
    edges: &BTreeMap<N, Vec<N>>,
    visited: &mut HashSet<N>,
    rec_stack: &mut HashSet<N>,
    path: &mut Vec<N>,
) -> bool
where
    N: Copy + Eq + Ord + std::hash::Hash,
{
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(next) = edges.get(&node) {
        for dep in next {
            // Only nodes we know about
            if !edges.contains_key(dep) {
                continue;
            }
            if !visited.contains(dep) {
                if detect_cycle_dfs(*dep, edges, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep) {
                path.push(*dep);
                return true;
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

/// 0 for types with no required references, else one more than the deepest
/// type they reference.
fn flush_depth(
    name: &'static str,
    deps: &BTreeMap<&'static str, Vec<&'static str>>,
    memo: &mut HashMap<&'static str, usize>,
) -> usize {
    if let Some(depth) = memo.get(name) {
        return *depth;
    }
    let depth = deps
        .get(name)
        .into_iter()
        .flatten()
        .map(|dep| flush_depth(*dep, deps, memo) + 1)
        .max()
        .unwrap_or(0);
    memo.insert(name, depth);
    depth
}

type Sources = Vec<(&'static str, FieldId, Vec<WalkStep>)>;

fn reverse_index(
    entities: &BTreeMap<&'static str, Arc<EntityMetadata>>,
) -> Result<HashMap<(&'static str, FieldId), Vec<Arc<ReactiveTarget>>>> {
    let mut index: HashMap<(&'static str, FieldId), Vec<Arc<ReactiveTarget>>> = HashMap::new();
    for meta in entities.values() {
        let registrations = meta
            .reactive_fields
            .iter()
            .map(|r| (ReactiveKind::Field(r.field), &r.hint))
            .chain(
                meta.reactive_rules
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (ReactiveKind::Rule(i), &r.hint)),
            );
        for (kind, hint) in registrations {
            let mut sources = Sources::new();
            let mut trail = vec![meta.name.to_string()];
            index_hint(entities, meta.name, hint, &[], &mut sources, &mut trail)?;
            for (entity, field, path) in sources {
                let target = ReactiveTarget {
                    owner: meta.name,
                    kind,
                    path,
                };
                let list = index.entry((entity, field)).or_default();
                if !list.iter().any(|t| **t == target) {
                    list.push(Arc::new(target));
                }
            }
        }
    }
    Ok(index)
}

fn index_hint(
    entities: &BTreeMap<&'static str, Arc<EntityMetadata>>,
    at: &'static str,
    hint: &LoadHint,
    steps_back: &[WalkStep],
    out: &mut Sources,
    trail: &mut Vec<String>,
) -> Result<()> {
    let meta = &entities[at];
    for (name, child) in hint.children() {
        trail.push(name.to_string());
        let Some(field) = meta.field_id(name).map(|id| meta.field(id)) else {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidHint,
                format!("{at} has no field '{name}'"),
                trail.clone(),
            ));
        };
        out.push((at, field.id, steps_back.to_vec()));

        if !field.kind.is_relation() && !child.is_empty() {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidHint,
                format!("{at}.{name} is not a relation"),
                trail.clone(),
            ));
        }
        for (other, other_field) in field.targets() {
            let other_meta = &entities[other];
            let Some(inverse) = other_meta.field_id(other_field) else {
                continue;
            };
            let mut next = Vec::with_capacity(steps_back.len() + 1);
            next.push(WalkStep {
                entity: other,
                field: inverse,
            });
            next.extend_from_slice(steps_back);

            // Membership changes are written on the far side's reference.
            if field.kind.is_collection_like() {
                out.push((other, inverse, next.clone()));
            }
            if !child.is_empty() {
                index_hint(entities, other, child, &next, out, trail)?;
            }
        }
        trail.pop();
    }
    Ok(())
}

fn check_reactive_cycles(registry: &MetadataRegistry) -> Result<()> {
    // Node: (type, reactive field). Edge: field -> reactive field it reads.
    let mut edges: BTreeMap<(&'static str, FieldId), Vec<(&'static str, FieldId)>> =
        BTreeMap::new();
    for meta in registry.entities.values() {
        for reactive in &meta.reactive_fields {
            edges.entry((meta.name, reactive.field)).or_default();
        }
    }
    for ((source_type, source_field), targets) in &registry.reactive {
        let source = (*source_type, *source_field);
        if !edges.contains_key(&source) {
            continue;
        }
        for target in targets {
            if let ReactiveKind::Field(field) = target.kind {
                edges
                    .entry((target.owner, field))
                    .or_default()
                    .push(source);
            }
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();
    let nodes: Vec<_> = edges.keys().copied().collect();
    for node in nodes {
        if !visited.contains(&node)
            && detect_cycle_dfs(node, &edges, &mut visited, &mut rec_stack, &mut path)
        {
            let names = path
                .iter()
                .map(|(entity, field)| {
                    let name = registry.entities[entity].field(*field).name;
                    format!("{entity}.{name}")
                })
                .collect();
            return Err(Error::metadata(
                MetadataErrorKind::ReactiveCycle,
                "reactive fields depend on themselves",
                names,
            ));
        }
    }
    Ok(())
}

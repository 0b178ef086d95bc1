//! Graph traversal types and algorithms
//!
//! The engine is written once against [`GraphStore::get_neighbor_edges`] and
//! serves every backend that does not override `traverse`/`find_paths`.
//! Each call owns all of its state, so a caller may drop the future between
//! hops without affecting later traversals.

use crate::entity::Entity;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::relation::{Direction, Relation};
use crate::tenant::TenantContext;
use crate::validation::{validate_traversal_depth, RECOMMENDED_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Traversal options builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalOptions {
    /// Starting entity id
    pub start: String,

    /// Target entity id (for path finding, None for general traversal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Maximum number of hops
    #[serde(default = "default_depth")]
    pub max_depth: u32,

    /// Direction in which relations are followed
    #[serde(default)]
    pub direction: Direction,

    /// Follow only these relation types (empty = all types)
    #[serde(default)]
    pub relation_types: Vec<String>,

    /// Enter only entities of these types (empty = all types)
    #[serde(default)]
    pub entity_types: Vec<String>,

    /// Stop once this many paths were produced (None = every path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_paths: Option<usize>,
}

fn default_depth() -> u32 {
    RECOMMENDED_MAX_DEPTH
}

impl TraversalOptions {
    /// Create traversal options starting from an entity
    pub fn new(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            target: None,
            max_depth: default_depth(),
            direction: Direction::Outgoing,
            relation_types: Vec::new(),
            entity_types: Vec::new(),
            max_paths: None,
        }
    }

    /// Set target for path finding
    pub fn find_path_to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn filter_relation_types(mut self, types: Vec<String>) -> Self {
        self.relation_types = types;
        self
    }

    pub fn filter_entity_types(mut self, types: Vec<String>) -> Self {
        self.entity_types = types;
        self
    }

    /// Cap the number of returned paths; traversals are unbounded otherwise
    pub fn with_max_paths(mut self, max_paths: usize) -> Self {
        self.max_paths = Some(max_paths);
        self
    }
}

/// An acyclic path: entities joined by the relations traversed between them.
///
/// `relations[i]` connects `entities[i]` and `entities[i + 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl Path {
    /// A zero-length path holding only the start entity
    pub fn start_at(entity: Entity) -> Self {
        Self {
            entities: vec![entity],
            relations: Vec::new(),
        }
    }

    /// Number of relations traversed
    pub fn length(&self) -> usize {
        self.relations.len()
    }

    pub fn start(&self) -> Option<&Entity> {
        self.entities.first()
    }

    pub fn end(&self) -> Option<&Entity> {
        self.entities.last()
    }

    pub fn entity_ids(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.iter().any(|e| e.id == entity_id)
    }

    fn extended(&self, relation: Relation, entity: Entity) -> Self {
        let mut next = self.clone();
        next.relations.push(relation);
        next.entities.push(entity);
        next
    }
}

/// Traversal statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraversalStats {
    pub neighbor_lookups: usize,
    pub edges_examined: usize,
    pub max_depth_reached: u32,
    pub paths_found: usize,
}

/// A partial path in the BFS frontier with its own visited set
struct Branch {
    tail: String,
    path: Path,
    visited: HashSet<String>,
}

/// Generic bounded-depth breadth-first traversal engine
pub struct TraversalEngine;

impl TraversalEngine {
    /// Run a traversal or path search.
    ///
    /// Without a target, every path of length `1..=max_depth` from the start
    /// is returned. With a target, only paths ending at the target are
    /// returned; a branch that reaches the target is not expanded further,
    /// other branches keep searching up to `max_depth`. Paths come back in
    /// discovery order, which is ascending length.
    pub async fn execute<S>(
        store: &S,
        options: &TraversalOptions,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Path>>
    where
        S: GraphStore + ?Sized,
    {
        validate_traversal_depth(options.max_depth)?;

        tracing::debug!(
            start = %options.start,
            target = ?options.target,
            depth = options.max_depth,
            direction = ?options.direction,
            "Executing traversal"
        );

        let Some(start) = store.get_entity(&options.start, ctx).await? else {
            return Ok(Vec::new());
        };

        let (paths, stats) = Self::bfs(store, start, options, ctx).await?;

        tracing::debug!(
            "Traversal from {} found {} paths ({} neighbor lookups, {} edges, depth {})",
            options.start,
            stats.paths_found,
            stats.neighbor_lookups,
            stats.edges_examined,
            stats.max_depth_reached
        );

        Ok(paths)
    }

    async fn bfs<S>(
        store: &S,
        start: Entity,
        options: &TraversalOptions,
        ctx: Option<&TenantContext>,
    ) -> Result<(Vec<Path>, TraversalStats)>
    where
        S: GraphStore + ?Sized,
    {
        let mut stats = TraversalStats::default();
        let mut results = Vec::new();
        // Neighbor edges per entity, cached for the lifetime of this call only
        let mut adjacency: HashMap<String, Vec<(Relation, Entity)>> = HashMap::new();

        let mut frontier = vec![Branch {
            tail: start.id.clone(),
            visited: HashSet::from([start.id.clone()]),
            path: Path::start_at(start),
        }];

        for depth in 1..=options.max_depth {
            if frontier.is_empty() || options.max_paths == Some(0) {
                break;
            }
            let mut next = Vec::new();

            for branch in frontier {
                let tail = &branch.tail;
                if !adjacency.contains_key(tail) {
                    stats.neighbor_lookups += 1;
                    let edges = store
                        .get_neighbor_edges(tail, options.direction, &options.relation_types, ctx)
                        .await?;
                    adjacency.insert(tail.clone(), edges);
                }

                for (relation, neighbor) in adjacency.get(tail).into_iter().flatten() {
                    stats.edges_examined += 1;

                    if branch.visited.contains(&neighbor.id) {
                        continue;
                    }
                    if !options.entity_types.is_empty()
                        && !options.entity_types.contains(&neighbor.entity_type)
                    {
                        continue;
                    }

                    let path = branch.path.extended(relation.clone(), neighbor.clone());
                    stats.max_depth_reached = depth;

                    match &options.target {
                        Some(target) if &neighbor.id == target => results.push(path),
                        Some(_) => next.push(Self::grow(&branch, &neighbor.id, path)),
                        None => {
                            results.push(path.clone());
                            next.push(Self::grow(&branch, &neighbor.id, path));
                        }
                    }

                    if options.max_paths.is_some_and(|max| results.len() >= max) {
                        stats.paths_found = results.len();
                        return Ok((results, stats));
                    }
                }
            }

            frontier = next;
        }

        stats.paths_found = results.len();
        Ok((results, stats))
    }

    fn grow(branch: &Branch, tail: &str, path: Path) -> Branch {
        let mut visited = branch.visited.clone();
        visited.insert(tail.to_string());
        Branch {
            tail: tail.to_string(),
            path,
            visited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_support::FixtureStore;
    use crate::validation::{ValidationError, MAX_TRAVERSAL_DEPTH};

    // A --> B --> C --> D
    //       |     |
    //       v     v
    //       E --> F
    async fn create_test_graph() -> FixtureStore {
        FixtureStore::with_graph(
            &["A", "B", "C", "D", "E", "F"],
            &[
                ("A", "B", "connects"),
                ("B", "C", "connects"),
                ("C", "D", "connects"),
                ("B", "E", "connects"),
                ("C", "F", "connects"),
                ("E", "F", "connects"),
            ],
        )
        .await
    }

    fn ids(paths: &[Path]) -> Vec<Vec<&str>> {
        paths.iter().map(Path::entity_ids).collect()
    }

    #[tokio::test]
    async fn test_traverse_depth_limit() {
        let store = create_test_graph().await;
        let options = TraversalOptions::new("A").with_max_depth(2);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();

        // A->B, then A->B->C and A->B->E
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].entity_ids(), vec!["A", "B"]);
        assert!(paths.iter().all(|p| p.length() <= 2));
        assert!(paths.windows(2).all(|w| w[0].length() <= w[1].length()));
    }

    #[tokio::test]
    async fn test_find_paths_returns_all_routes() {
        let store = create_test_graph().await;
        let options = TraversalOptions::new("A").find_path_to("F").with_max_depth(4);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();

        assert_eq!(
            ids(&paths),
            vec![vec!["A", "B", "C", "F"], vec!["A", "B", "E", "F"]]
        );
        assert!(paths.iter().all(|p| p.end().map(|e| e.id.as_str()) == Some("F")));
    }

    #[tokio::test]
    async fn test_find_paths_respects_depth() {
        let store = create_test_graph().await;
        let options = TraversalOptions::new("A").find_path_to("D").with_max_depth(2);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_terminates_without_repeats() {
        let store = FixtureStore::with_graph(
            &["A", "B", "C"],
            &[("A", "B", "next"), ("B", "C", "next"), ("C", "A", "next")],
        )
        .await;
        let options = TraversalOptions::new("A").with_max_depth(5);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();

        assert_eq!(ids(&paths), vec![vec!["A", "B"], vec!["A", "B", "C"]]);
        for path in &paths {
            let unique: HashSet<&str> = path.entity_ids().into_iter().collect();
            assert_eq!(unique.len(), path.entities.len());
        }
    }

    #[tokio::test]
    async fn test_direction_filtering() {
        let store = create_test_graph().await;

        let incoming = TraversalOptions::new("B")
            .with_direction(Direction::Incoming)
            .with_max_depth(1);
        let paths = TraversalEngine::execute(&store, &incoming, None).await.unwrap();
        assert_eq!(ids(&paths), vec![vec!["B", "A"]]);

        let both = TraversalOptions::new("B")
            .with_direction(Direction::Both)
            .with_max_depth(1);
        let paths = TraversalEngine::execute(&store, &both, None).await.unwrap();
        assert_eq!(paths.len(), 3);
    }

    #[tokio::test]
    async fn test_relation_type_filter() {
        let store = FixtureStore::with_graph(
            &["A", "B", "C"],
            &[("A", "B", "works_at"), ("B", "C", "knows")],
        )
        .await;

        let options = TraversalOptions::new("A")
            .with_max_depth(2)
            .filter_relation_types(vec!["works_at".to_string()]);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();

        assert_eq!(ids(&paths), vec![vec!["A", "B"]]);
    }

    #[tokio::test]
    async fn test_missing_start_yields_nothing() {
        let store = create_test_graph().await;
        let options = TraversalOptions::new("Z");
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_max_paths_cap() {
        let store = create_test_graph().await;
        let options = TraversalOptions::new("A").with_max_depth(4).with_max_paths(2);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();
        assert_eq!(paths.len(), 2);

        let options = TraversalOptions::new("A").with_max_depth(4).with_max_paths(0);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_wide_fan_out_is_not_truncated() {
        let leaves: Vec<String> = (0..1500).map(|i| format!("leaf{i:04}")).collect();
        let mut nodes: Vec<&str> = vec!["hub"];
        nodes.extend(leaves.iter().map(String::as_str));
        let edges: Vec<(&str, &str, &str)> =
            leaves.iter().map(|leaf| ("hub", leaf.as_str(), "E")).collect();
        let store = FixtureStore::with_graph(&nodes, &edges).await;

        let options = TraversalOptions::new("hub").with_max_depth(1);
        assert_eq!(options.max_paths, None);
        let paths = TraversalEngine::execute(&store, &options, None).await.unwrap();
        assert_eq!(paths.len(), 1500);
    }

    #[test]
    fn test_empty_path_has_no_endpoints() {
        let path = Path {
            entities: Vec::new(),
            relations: Vec::new(),
        };
        assert!(path.start().is_none());
        assert!(path.end().is_none());
        assert_eq!(path.length(), 0);

        let single = Path::start_at(Entity::new("A", "Node"));
        assert_eq!(single.start().map(|e| e.id.as_str()), Some("A"));
        assert_eq!(single.end().map(|e| e.id.as_str()), Some("A"));
    }

    #[test]
    fn test_options_deserialize_without_cap() {
        let options: TraversalOptions = serde_json::from_str(r#"{"start":"A"}"#).unwrap();
        assert_eq!(options.max_paths, None);
        assert_eq!(options.max_depth, RECOMMENDED_MAX_DEPTH);
    }

    #[tokio::test]
    async fn test_depth_above_limit_is_rejected() {
        let store = create_test_graph().await;
        let options = TraversalOptions::new("A").with_max_depth(MAX_TRAVERSAL_DEPTH + 1);
        let err = TraversalEngine::execute(&store, &options, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::TraversalDepthTooLarge { .. })
        ));
    }
}

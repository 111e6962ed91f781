//! Graph description parsing and dependency-ordered sorting.
//!
//! A description is one node declaration per line:
//!
//! ```text
//! <type> <name> [key=value ...] [-> dep1,dep2,...]
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. `type` selects the
//! registered node factory; `name` must be unique within the description;
//! `key=value` pairs become string-valued construction properties; the
//! optional `-> dep1,dep2` clause declares that this node must be added
//! after `dep1` and `dep2`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{GraphError, Result};

/// One parsed node declaration, with its construction properties and its
/// declared dependencies (by name, not yet resolved to an index).
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Registered factory type name.
    pub node_type: String,
    /// Name, unique within the description.
    pub name: String,
    /// Scope (session id) this node will belong to; not part of the
    /// description text, supplied by the composer.
    pub scope: String,
    /// Construction properties parsed from `key=value` tokens.
    pub props: HashMap<String, String>,
    /// Names this node depends on (must be added first).
    pub deps: Vec<String>,
}

/// A parsed, dependency-ordered graph description.
#[derive(Debug, Clone)]
pub struct GraphTopology {
    /// Nodes in an order such that every dependency precedes its dependents.
    pub nodes: Vec<NodeInfo>,
}

impl GraphTopology {
    /// Parse and topologically sort a graph description for `scope`.
    pub fn parse(scope: &str, description: &str) -> Result<Self> {
        let mut infos = Vec::new();
        let mut bad_lines = Vec::new();
        let mut seen_names = HashSet::new();

        for (lineno, raw) in description.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(scope, line) {
                Ok(info) => {
                    if !seen_names.insert(info.name.clone()) {
                        bad_lines.push(format!("{}: duplicate node name '{}'", lineno + 1, info.name));
                        continue;
                    }
                    infos.push(info);
                }
                Err(e) => bad_lines.push(format!("{}: {}", lineno + 1, e)),
            }
        }

        if !bad_lines.is_empty() {
            return Err(GraphError::ParseFailed {
                count: bad_lines.len(),
                text: bad_lines.join("\n"),
            });
        }

        let sorted = topo_sort(infos)?;
        Ok(Self { nodes: sorted })
    }
}

fn parse_line(scope: &str, line: &str) -> std::result::Result<NodeInfo, String> {
    let (head, deps_part) = match line.split_once("->") {
        Some((h, d)) => (h.trim(), Some(d.trim())),
        None => (line, None),
    };

    let mut tokens = head.split_whitespace();
    let node_type = tokens
        .next()
        .ok_or_else(|| "missing node type".to_string())?
        .to_string();
    let name = tokens
        .next()
        .ok_or_else(|| "missing node name".to_string())?
        .to_string();

    let mut props = HashMap::new();
    for tok in tokens {
        let (k, v) = tok
            .split_once('=')
            .ok_or_else(|| format!("malformed property token '{tok}', expected key=value"))?;
        if k.is_empty() {
            return Err(format!("malformed property token '{tok}', empty key"));
        }
        props.insert(k.to_string(), v.to_string());
    }

    let deps = match deps_part {
        Some(d) if !d.is_empty() => d
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    Ok(NodeInfo {
        node_type,
        name,
        scope: scope.to_string(),
        props,
        deps,
    })
}

/// Kahn's algorithm: repeatedly remove nodes with no unresolved
/// dependencies, preserving declaration order among ties so output is
/// deterministic for a given input.
fn topo_sort(infos: Vec<NodeInfo>) -> Result<Vec<NodeInfo>> {
    let index_of: HashMap<&str, usize> = infos
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();

    for info in &infos {
        for dep in &info.deps {
            if !index_of.contains_key(dep.as_str()) {
                return Err(GraphError::UnknownDependency(dep.clone()));
            }
        }
    }

    let mut indegree = vec![0usize; infos.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); infos.len()];
    for (i, info) in infos.iter().enumerate() {
        indegree[i] = info.deps.len();
        for dep in &info.deps {
            dependents[index_of[dep.as_str()]].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..infos.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(infos.len());
    let mut visited = 0usize;

    while let Some(i) = queue.pop_front() {
        order.push(i);
        visited += 1;
        for &dep_of in &dependents[i] {
            indegree[dep_of] -= 1;
            if indegree[dep_of] == 0 {
                queue.push_back(dep_of);
            }
        }
    }

    if visited != infos.len() {
        let stuck: Vec<String> = (0..infos.len())
            .filter(|&i| indegree[i] != 0)
            .map(|i| infos[i].name.clone())
            .collect();
        return Err(GraphError::CyclicGraph(stuck));
    }

    let mut infos: Vec<Option<NodeInfo>> = infos.into_iter().map(Some).collect();
    Ok(order.into_iter().map(|i| infos[i].take().unwrap()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_chain() {
        let desc = "producer a\ntransform b key=val -> a\nsink c -> b";
        let topo = GraphTopology::parse("s1", desc).unwrap();
        let names: Vec<_> = topo.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(topo.nodes[1].props.get("key").map(String::as_str), Some("val"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let desc = "sink c -> missing";
        let err = GraphTopology::parse("s1", desc).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency(_)));
    }

    #[test]
    fn rejects_cycle() {
        let desc = "a a -> b\nb b -> a";
        let err = GraphTopology::parse("s1", desc).unwrap_err();
        assert!(matches!(err, GraphError::CyclicGraph(_)));
    }

    #[test]
    fn aggregates_bad_lines() {
        let desc = "onlytype\nanother name badtoken\nproducer ok";
        let err = GraphTopology::parse("s1", desc).unwrap_err();
        match err {
            GraphError::ParseFailed { count, .. } => assert_eq!(count, 2),
            other => panic!("expected ParseFailed, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let desc = "producer a\nsink a";
        let err = GraphTopology::parse("s1", desc).unwrap_err();
        assert!(matches!(err, GraphError::ParseFailed { .. }));
    }
}

//! Dataflow topology: computations wired together by named streams.
//!
//! The graph has two kinds of vertices, computations and streams, with edges
//! stream→computation for inputs and computation→stream for outputs. It must
//! be a DAG; `build` rejects cycles.

use crate::logflow::computation::Computation;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Creates a fresh computation instance. One factory serves every concurrent
/// runner of a computation, so it must be callable repeatedly.
pub type ComputationFactory = Arc<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

/// Topology validation errors, all fatal at build time.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("computation '{computation}' declares no input or output stream")]
    EmptyBindings { computation: String },

    #[error("computation '{name}' is declared twice")]
    DuplicateComputation { name: String },

    #[error("invalid binding '{binding}' on computation '{computation}', expected 'iN:stream' or 'oN:stream'")]
    InvalidBinding {
        computation: String,
        binding: String,
    },

    #[error("topology contains a cycle through: {path}")]
    Cycle { path: String },
}

/// Name and stream bindings of one computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadata {
    pub name: String,
    pub input_streams: Vec<String>,
    pub output_streams: Vec<String>,
}

impl ComputationMetadata {
    /// Parse port bindings of the form `"i1:streamName"` / `"o1:streamName"`.
    pub fn from_bindings(
        name: impl Into<String>,
        bindings: &[&str],
    ) -> Result<Self, TopologyError> {
        let name = name.into();
        let mut input_streams = Vec::new();
        let mut output_streams = Vec::new();
        for binding in bindings {
            let (port, stream) = match binding.split_once(':') {
                Some((port, stream)) if !port.is_empty() && !stream.is_empty() => (port, stream),
                _ => {
                    return Err(TopologyError::InvalidBinding {
                        computation: name,
                        binding: binding.to_string(),
                    });
                }
            };
            match port.as_bytes()[0] {
                b'i' => input_streams.push(stream.to_string()),
                b'o' => output_streams.push(stream.to_string()),
                _ => {
                    return Err(TopologyError::InvalidBinding {
                        computation: name,
                        binding: binding.to_string(),
                    });
                }
            }
        }
        if input_streams.is_empty() && output_streams.is_empty() {
            return Err(TopologyError::EmptyBindings { computation: name });
        }
        Ok(Self {
            name,
            input_streams,
            output_streams,
        })
    }
}

/// Fluent builder; validation happens in [`TopologyBuilder::build`].
#[derive(Default)]
pub struct TopologyBuilder {
    entries: Vec<(String, ComputationFactory, Vec<String>)>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computation with its port bindings (`"i1:s1"`, `"o1:s2"`).
    pub fn add_computation<F>(mut self, name: impl Into<String>, factory: F, bindings: &[&str]) -> Self
    where
        F: Fn() -> Box<dyn Computation> + Send + Sync + 'static,
    {
        self.entries.push((
            name.into(),
            Arc::new(factory),
            bindings.iter().map(|b| b.to_string()).collect(),
        ));
        self
    }

    /// Validate bindings and acyclicity and produce the immutable topology.
    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut metadata = Vec::with_capacity(self.entries.len());
        let mut factories = HashMap::new();
        for (name, factory, bindings) in self.entries {
            if factories.contains_key(&name) {
                return Err(TopologyError::DuplicateComputation { name });
            }
            let refs: Vec<&str> = bindings.iter().map(|b| b.as_str()).collect();
            metadata.push(ComputationMetadata::from_bindings(name.clone(), &refs)?);
            factories.insert(name, factory);
        }
        let topology = Topology {
            metadata,
            factories,
        };
        topology.check_acyclic()?;
        Ok(topology)
    }
}

/// Immutable, validated dataflow graph.
pub struct Topology {
    metadata: Vec<ComputationMetadata>,
    factories: HashMap<String, ComputationFactory>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    /// Metadata of every computation, in registration order.
    pub fn computations(&self) -> &[ComputationMetadata] {
        &self.metadata
    }

    pub fn metadata(&self, name: &str) -> Option<&ComputationMetadata> {
        self.metadata.iter().find(|m| m.name == name)
    }

    pub fn factory(&self, name: &str) -> Option<ComputationFactory> {
        self.factories.get(name).cloned()
    }

    /// All stream names appearing in any binding, sorted.
    pub fn streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .metadata
            .iter()
            .flat_map(|m| m.input_streams.iter().chain(m.output_streams.iter()))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        streams.sort();
        streams
    }

    /// A source reads no stream; it injects records on its own schedule.
    pub fn is_source(&self, name: &str) -> bool {
        self.metadata(name)
            .map(|m| m.input_streams.is_empty())
            .unwrap_or(false)
    }

    /// A sink produces no stream.
    pub fn is_sink(&self, name: &str) -> bool {
        self.metadata(name)
            .map(|m| m.output_streams.is_empty())
            .unwrap_or(false)
    }

    /// Streams not produced by any computation (external inputs).
    pub fn roots(&self) -> Vec<String> {
        let produced: HashSet<&String> = self
            .metadata
            .iter()
            .flat_map(|m| m.output_streams.iter())
            .collect();
        let mut roots: Vec<String> = self
            .streams()
            .into_iter()
            .filter(|s| !produced.contains(s))
            .collect();
        roots.sort();
        roots
    }

    /// Computations upstream of `name`, transitively, sorted.
    pub fn ancestors(&self, name: &str) -> Vec<String> {
        self.reachable(name, true)
    }

    /// Computations downstream of `name`, transitively, sorted.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        self.reachable(name, false)
    }

    fn reachable(&self, name: &str, upstream: bool) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for neighbor in self.neighbors(&current, upstream) {
                if seen.insert(neighbor.clone()) {
                    stack.push(neighbor);
                }
            }
        }
        seen.remove(name);
        let mut result: Vec<String> = seen.into_iter().collect();
        result.sort();
        result
    }

    /// Direct computation neighbors through shared streams.
    fn neighbors(&self, name: &str, upstream: bool) -> Vec<String> {
        let m = match self.metadata(name) {
            Some(m) => m,
            None => return Vec::new(),
        };
        let streams: HashSet<&String> = if upstream {
            m.input_streams.iter().collect()
        } else {
            m.output_streams.iter().collect()
        };
        self.metadata
            .iter()
            .filter(|other| {
                let other_side = if upstream {
                    &other.output_streams
                } else {
                    &other.input_streams
                };
                other_side.iter().any(|s| streams.contains(s))
            })
            .map(|other| other.name.clone())
            .collect()
    }

    /// Iterative three-color DFS over the bipartite graph.
    fn check_acyclic(&self) -> Result<(), TopologyError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        // vertex key: computations as-is, streams prefixed to keep the
        // namespaces apart
        let stream_key = |s: &str| format!("stream/{}", s);
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for m in &self.metadata {
            let out: Vec<String> = m.output_streams.iter().map(|s| stream_key(s)).collect();
            adjacency.insert(m.name.clone(), out);
            for input in &m.input_streams {
                adjacency
                    .entry(stream_key(input))
                    .or_default()
                    .push(m.name.clone());
            }
            for output in &m.output_streams {
                adjacency.entry(stream_key(output)).or_default();
            }
        }
        let mut colors: HashMap<String, Color> =
            adjacency.keys().map(|k| (k.clone(), Color::White)).collect();
        let mut starts: Vec<&String> = adjacency.keys().collect();
        starts.sort();
        for start in starts {
            if colors[start] != Color::White {
                continue;
            }
            // stack of (vertex, next-child index) simulating recursion
            let mut stack: Vec<(String, usize)> = vec![(start.clone(), 0)];
            colors.insert(start.clone(), Color::Gray);
            while let Some((vertex, child)) = stack.last().cloned() {
                let children = &adjacency[&vertex];
                if child >= children.len() {
                    colors.insert(vertex, Color::Black);
                    stack.pop();
                    continue;
                }
                if let Some(last) = stack.last_mut() {
                    last.1 += 1;
                }
                let next = &children[child];
                match colors[next] {
                    Color::Gray => {
                        let mut path: Vec<String> = stack
                            .iter()
                            .map(|(v, _)| v.trim_start_matches("stream/").to_string())
                            .collect();
                        path.push(next.trim_start_matches("stream/").to_string());
                        return Err(TopologyError::Cycle {
                            path: path.join(" -> "),
                        });
                    }
                    Color::White => {
                        colors.insert(next.clone(), Color::Gray);
                        stack.push((next.clone(), 0));
                    }
                    Color::Black => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logflow::computation::context::ComputationContext;
    use crate::logflow::computation::record::Record;
    use crate::logflow::computation::{Computation, ComputationFailure};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Computation for Noop {
        async fn process_record(
            &mut self,
            _ctx: &mut ComputationContext,
            _input_stream: &str,
            _record: Record,
        ) -> Result<(), ComputationFailure> {
            Ok(())
        }
    }

    fn noop() -> Box<dyn Computation> {
        Box::new(Noop)
    }

    #[test]
    fn test_metadata_from_bindings() {
        let m = ComputationMetadata::from_bindings("c1", &["i1:s1", "i2:s2", "o1:out"]).unwrap();
        assert_eq!(vec!["s1", "s2"], m.input_streams);
        assert_eq!(vec!["out"], m.output_streams);
        assert!(ComputationMetadata::from_bindings("c1", &["x1:s1"]).is_err());
        assert!(ComputationMetadata::from_bindings("c1", &["i1"]).is_err());
        assert!(matches!(
            ComputationMetadata::from_bindings("c1", &[]),
            Err(TopologyError::EmptyBindings { .. })
        ));
    }

    #[test]
    fn test_build_pipeline() {
        let topology = Topology::builder()
            .add_computation("generator", noop, &["o1:s1"])
            .add_computation("counter", noop, &["i1:s1", "o1:s2"])
            .add_computation("collector", noop, &["i1:s2"])
            .build()
            .unwrap();
        assert_eq!(vec!["s1", "s2"], topology.streams());
        assert!(topology.is_source("generator"));
        assert!(!topology.is_source("counter"));
        assert!(topology.is_sink("collector"));
        assert_eq!(vec!["generator"], topology.ancestors("counter"));
        assert_eq!(
            vec!["collector", "counter"],
            topology.descendants("generator")
        );
        assert!(topology.roots().is_empty());
        assert!(topology.factory("counter").is_some());
        assert!(topology.factory("missing").is_none());
    }

    #[test]
    fn test_roots_are_streams_nobody_produces() {
        let topology = Topology::builder()
            .add_computation("counter", noop, &["i1:input", "o1:out"])
            .build()
            .unwrap();
        assert_eq!(vec!["input"], topology.roots());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = Topology::builder()
            .add_computation("a", noop, &["i1:s1", "o1:s2"])
            .add_computation("b", noop, &["i1:s2", "o1:s1"])
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::Cycle { .. }));
    }

    #[test]
    fn test_self_loop_is_rejected() {
        let err = Topology::builder()
            .add_computation("echo", noop, &["i1:s1", "o1:s1"])
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::Cycle { .. }));
    }

    #[test]
    fn test_duplicate_computation_is_rejected() {
        let err = Topology::builder()
            .add_computation("a", noop, &["o1:s1"])
            .add_computation("a", noop, &["i1:s1"])
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::DuplicateComputation { .. }));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let topology = Topology::builder()
            .add_computation("src", noop, &["o1:s1"])
            .add_computation("left", noop, &["i1:s1", "o1:s2"])
            .add_computation("right", noop, &["i1:s1", "o1:s3"])
            .add_computation("join", noop, &["i1:s2", "i2:s3"])
            .build();
        assert!(topology.is_ok());
    }
}

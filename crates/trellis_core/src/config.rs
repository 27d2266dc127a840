//! Kernel and resource configuration resolution.
//!
//! A key is looked up in a fixed order and the first source holding it wins:
//!
//! 1. per-node attributes (JSON text)
//! 2. binary attributes (postcard)
//! 3. integer attributes
//! 4. the node-level config block
//! 5. the secondary (graph-level) config block
//! 6. built-in keys (`$node_name`, `$kernel_name`, `$graph_id`,
//!    `$instance_id`, `$query_id`)
//!
//! Built-in keys only exist for a node. Asking for one from a detached
//! context is an error, not a missing value.

use crate::error::{CoreError, CoreResult};
use crate::graph_def::NodeDef;
use crate::id::{GraphId, SessionId};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Built-in key: node name
pub const KEY_NODE_NAME: &str = "$node_name";
/// Built-in key: kernel name
pub const KEY_KERNEL_NAME: &str = "$kernel_name";
/// Built-in key: graph id
pub const KEY_GRAPH_ID: &str = "$graph_id";
/// Built-in key: session instance id
pub const KEY_INSTANCE_ID: &str = "$instance_id";
/// Built-in key: session query id
pub const KEY_QUERY_ID: &str = "$query_id";

const BUILTIN_KEYS: [&str; 5] = [
    KEY_NODE_NAME,
    KEY_KERNEL_NAME,
    KEY_GRAPH_ID,
    KEY_INSTANCE_ID,
    KEY_QUERY_ID,
];

/// Values backing the built-in keys of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinKeys {
    /// Node name
    pub node_name: String,
    /// Kernel name
    pub kernel_name: String,
    /// Graph the node belongs to
    pub graph_id: GraphId,
    /// Session of the graph
    pub session: SessionId,
}

impl BuiltinKeys {
    fn value(&self, key: &str) -> Option<Value> {
        match key {
            KEY_NODE_NAME => Some(Value::from(self.node_name.clone())),
            KEY_KERNEL_NAME => Some(Value::from(self.kernel_name.clone())),
            KEY_GRAPH_ID => Some(Value::from(self.graph_id.to_string())),
            KEY_INSTANCE_ID => Some(Value::from(self.session.instance_id)),
            KEY_QUERY_ID => Some(Value::from(self.session.query_id)),
            _ => None,
        }
    }
}

/// Configuration view handed to `Kernel::config`
#[derive(Debug, Clone, Default)]
pub struct ConfigContext<'a> {
    node: Option<&'a NodeDef>,
    node_config: Map<String, Value>,
    graph_config: Map<String, Value>,
    builtins: Option<BuiltinKeys>,
}

impl<'a> ConfigContext<'a> {
    /// Create the context for one node of a graph
    ///
    /// # Errors
    ///
    /// Returns error if either config block is not a JSON object
    pub fn for_node(
        node: &'a NodeDef,
        graph_config: Option<&str>,
        builtins: BuiltinKeys,
    ) -> CoreResult<Self> {
        Ok(Self {
            node: Some(node),
            node_config: parse_block("config", node.config.as_deref())?,
            graph_config: parse_block("graph config", graph_config)?,
            builtins: Some(builtins),
        })
    }

    /// Create a context with only a config block and no node
    ///
    /// # Errors
    ///
    /// Returns error if the block is not a JSON object
    pub fn detached(config: Option<&str>) -> CoreResult<Self> {
        Ok(Self {
            node: None,
            node_config: Map::new(),
            graph_config: parse_block("config", config)?,
            builtins: None,
        })
    }

    /// Whether this context belongs to a node
    #[must_use]
    pub fn has_node(&self) -> bool {
        self.node.is_some()
    }

    /// Resolve `key` through the precedence chain
    ///
    /// # Errors
    ///
    /// Returns error if the value does not decode as `T`, or if a built-in
    /// key is requested outside a node context
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        let invalid = |reason: String| CoreError::InvalidConfig {
            key: key.to_string(),
            reason,
        };

        if let Some(node) = self.node {
            if let Some(text) = node.attrs.get(key) {
                return serde_json::from_str(text)
                    .map(Some)
                    .map_err(|e| invalid(e.to_string()));
            }
            if let Some(bytes) = node.binary_attrs.get(key) {
                return postcard::from_bytes(bytes)
                    .map(Some)
                    .map_err(|e| invalid(e.to_string()));
            }
            if let Some(value) = node.int_attrs.get(key) {
                return serde_json::from_value(Value::from(*value))
                    .map(Some)
                    .map_err(|e| invalid(e.to_string()));
            }
        }

        let block_value = self
            .node_config
            .get(key)
            .or_else(|| self.graph_config.get(key));
        if let Some(value) = block_value {
            return serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| invalid(e.to_string()));
        }

        if BUILTIN_KEYS.contains(&key) {
            let builtins = self
                .builtins
                .as_ref()
                .ok_or_else(|| CoreError::BuiltinOutsideNode {
                    key: key.to_string(),
                })?;
            if let Some(value) = builtins.value(key) {
                return serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| invalid(e.to_string()));
            }
        }

        Ok(None)
    }

    /// Resolve a key that must be present
    ///
    /// # Errors
    ///
    /// Returns `MissingConfig` if no source holds the key
    pub fn required<T: DeserializeOwned>(&self, key: &str) -> CoreResult<T> {
        self.get(key)?.ok_or_else(|| CoreError::MissingConfig {
            key: key.to_string(),
        })
    }

    /// Resolve a key, falling back to `default`
    ///
    /// # Errors
    ///
    /// Returns error if a present value does not decode as `T`
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> CoreResult<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }
}

fn parse_block(what: &str, text: Option<&str>) -> CoreResult<Map<String, Value>> {
    match text {
        None => Ok(Map::new()),
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(CoreError::InvalidConfig {
                key: what.to_string(),
                reason: format!("expected a JSON object, got {}", other),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builtins() -> BuiltinKeys {
        BuiltinKeys {
            node_name: "scan".to_string(),
            kernel_name: "source".to_string(),
            graph_id: GraphId::from_bytes([1; 16]),
            session: SessionId::new(3, 4),
        }
    }

    #[test]
    fn test_precedence_order() {
        let node = NodeDef::new("scan", "source")
            .with_attr("k", json!("attr"))
            .with_binary_attr("k", &"binary".to_string())
            .unwrap()
            .with_int_attr("k", 1)
            .with_config(json!({"k": "node", "only_node": 5}));
        let graph = json!({"k": "graph", "only_graph": true}).to_string();
        let ctx = ConfigContext::for_node(&node, Some(&graph), builtins()).unwrap();

        assert_eq!(ctx.required::<String>("k").unwrap(), "attr");
        assert_eq!(ctx.required::<i64>("only_node").unwrap(), 5);
        assert!(ctx.required::<bool>("only_graph").unwrap());
    }

    #[test]
    fn test_binary_before_int() {
        let node = NodeDef::new("n", "k")
            .with_binary_attr("limit", &7u32)
            .unwrap()
            .with_int_attr("limit", 9);
        let ctx = ConfigContext::for_node(&node, None, builtins()).unwrap();
        assert_eq!(ctx.required::<u32>("limit").unwrap(), 7);
    }

    #[test]
    fn test_int_before_config_block() {
        let node = NodeDef::new("n", "k")
            .with_int_attr("limit", 9)
            .with_config(json!({"limit": 1}));
        let ctx = ConfigContext::for_node(&node, None, builtins()).unwrap();
        assert_eq!(ctx.required::<i64>("limit").unwrap(), 9);
    }

    #[test]
    fn test_missing_required() {
        let node = NodeDef::new("n", "k");
        let ctx = ConfigContext::for_node(&node, None, builtins()).unwrap();
        assert_eq!(
            ctx.required::<i64>("limit"),
            Err(CoreError::MissingConfig {
                key: "limit".to_string()
            })
        );
        assert_eq!(ctx.get_or("limit", 10i64).unwrap(), 10);
    }

    #[test]
    fn test_wrong_type_is_error() {
        let node = NodeDef::new("n", "k").with_attr("limit", json!("ten"));
        let ctx = ConfigContext::for_node(&node, None, builtins()).unwrap();
        assert!(matches!(
            ctx.get::<i64>("limit"),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_builtin_keys() {
        let node = NodeDef::new("scan", "source");
        let ctx = ConfigContext::for_node(&node, None, builtins()).unwrap();
        assert_eq!(ctx.required::<String>(KEY_NODE_NAME).unwrap(), "scan");
        assert_eq!(ctx.required::<String>(KEY_KERNEL_NAME).unwrap(), "source");
        assert_eq!(ctx.required::<u64>(KEY_QUERY_ID).unwrap(), 4);
    }

    #[test]
    fn test_builtin_outside_node_is_error() {
        let ctx = ConfigContext::detached(Some(r#"{"size": 3}"#)).unwrap();
        assert_eq!(ctx.required::<u32>("size").unwrap(), 3);
        assert_eq!(
            ctx.get::<String>(KEY_NODE_NAME),
            Err(CoreError::BuiltinOutsideNode {
                key: KEY_NODE_NAME.to_string()
            })
        );
    }

    #[test]
    fn test_attr_shadows_builtin() {
        let node = NodeDef::new("scan", "source").with_attr(KEY_NODE_NAME, json!("alias"));
        let ctx = ConfigContext::for_node(&node, None, builtins()).unwrap();
        assert_eq!(ctx.required::<String>(KEY_NODE_NAME).unwrap(), "alias");
    }

    #[test]
    fn test_non_object_block_rejected() {
        let node = NodeDef::new("n", "k").with_config(json!([1, 2]));
        assert!(ConfigContext::for_node(&node, None, builtins()).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_int_attr_beats_config_blocks(
            int in proptest::prelude::any::<i64>(),
            node_value in proptest::prelude::any::<i64>(),
            graph_value in proptest::prelude::any::<i64>(),
        ) {
            let node = NodeDef::new("n", "k")
                .with_int_attr("limit", int)
                .with_config(json!({ "limit": node_value }));
            let graph = json!({ "limit": graph_value }).to_string();
            let ctx = ConfigContext::for_node(&node, Some(&graph), builtins()).unwrap();
            proptest::prop_assert_eq!(ctx.required::<i64>("limit").unwrap(), int);
        }
    }
}

//! Target node tokens and their expansion into concrete node lists.

use crate::script::ScriptRecord;

/// The controller itself
pub const BUILT_IN: &str = "(built-in)";
/// The controller followed by every agent
pub const ALL: &str = "(all)";
/// Every agent, controller excluded
pub const ALL_AGENTS: &str = "(all agents)";

/// Map deprecated spellings onto the canonical reserved tokens.
///
/// Matching is case-insensitive; anything that is not a reserved token is returned
/// unchanged so concrete node names keep their case.
pub fn normalize_node_name(token: &str) -> String {
    let trimmed = token.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "(built-in)" | "(master)" | "(controller)" => BUILT_IN.to_string(),
        "(all)" => ALL.to_string(),
        "(all agents)" | "(all slaves)" => ALL_AGENTS.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Provides the names of the agent nodes currently known to the controller.
#[cfg_attr(test, mockall::automock)]
pub trait NodeDirectory: Send + Sync {
    /// Known agents; never contains the controller.
    fn list_known_nodes(&self) -> Vec<String>;
}

/// Fixed list of node names
#[derive(Debug, Clone, Default)]
pub struct StaticNodeDirectory {
    nodes: Vec<String>,
}

impl StaticNodeDirectory {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn list_known_nodes(&self) -> Vec<String> {
        self.nodes.clone()
    }
}

pub struct NodeResolver;

impl NodeResolver {
    /// Expand a target token into concrete node ids.
    ///
    /// The controller, when part of the result, always comes first; the rest follow the
    /// order of `known_nodes` without duplicates.
    pub fn resolve(target: &str, known_nodes: &[String]) -> Vec<String> {
        let token = normalize_node_name(target);
        let agents = || {
            let mut out: Vec<String> = Vec::with_capacity(known_nodes.len());
            for node in known_nodes {
                if normalize_node_name(node) != BUILT_IN && !out.contains(node) {
                    out.push(node.clone());
                }
            }
            out
        };

        match token.as_str() {
            BUILT_IN => vec![BUILT_IN.to_string()],
            ALL => {
                let mut nodes = vec![BUILT_IN.to_string()];
                nodes.extend(agents());
                nodes
            }
            ALL_AGENTS => agents(),
            _ => vec![token],
        }
    }

    /// Targets a caller may pick for `record`.
    pub fn target_choices(record: &ScriptRecord, known_nodes: &[String]) -> Vec<String> {
        if record.only_controller_node {
            return vec![BUILT_IN.to_string()];
        }
        let mut choices = vec![BUILT_IN.to_string(), ALL.to_string(), ALL_AGENTS.to_string()];
        for node in known_nodes {
            if !choices.contains(node) {
                choices.push(node.clone());
            }
        }
        choices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_aliases_normalize() {
        assert_eq!(normalize_node_name("(master)"), BUILT_IN);
        assert_eq!(normalize_node_name("(Controller)"), BUILT_IN);
        assert_eq!(normalize_node_name("(ALL SLAVES)"), ALL_AGENTS);
        assert_eq!(normalize_node_name("(All)"), ALL);
        assert_eq!(normalize_node_name("AgentX"), "AgentX");
    }

    #[test]
    fn test_resolve_reserved_tokens() {
        assert_eq!(NodeResolver::resolve(ALL, &known()), vec![BUILT_IN, "a", "b"]);
        assert_eq!(NodeResolver::resolve(ALL_AGENTS, &known()), vec!["a", "b"]);
        assert_eq!(NodeResolver::resolve(BUILT_IN, &known()), vec![BUILT_IN]);
        assert_eq!(NodeResolver::resolve("(master)", &known()), vec![BUILT_IN]);
        assert_eq!(NodeResolver::resolve("(controller)", &[]), vec![BUILT_IN]);
    }

    #[test]
    fn test_resolve_concrete_node_is_verbatim() {
        assert_eq!(NodeResolver::resolve("agentX", &known()), vec!["agentX"]);
        assert_eq!(NodeResolver::resolve("all", &known()), vec!["all"]);
    }

    #[test]
    fn test_resolve_without_duplicates() {
        let nodes = vec![
            "a".to_string(),
            "(built-in)".to_string(),
            "a".to_string(),
            "b".to_string(),
        ];
        assert_eq!(NodeResolver::resolve(ALL, &nodes), vec![BUILT_IN, "a", "b"]);
        assert_eq!(NodeResolver::resolve(ALL_AGENTS, &nodes), vec!["a", "b"]);
        assert!(NodeResolver::resolve(ALL_AGENTS, &[]).is_empty());
    }

    #[test]
    fn test_target_choices() {
        let record = ScriptRecord::new("x.js");
        assert_eq!(
            NodeResolver::target_choices(&record, &known()),
            vec![BUILT_IN, ALL, ALL_AGENTS, "a", "b"]
        );
        let pinned = ScriptRecord::new("y.js").controller_only(true);
        assert_eq!(NodeResolver::target_choices(&pinned, &known()), vec![BUILT_IN]);
    }

    #[test]
    fn test_static_directory() {
        let dir = StaticNodeDirectory::new(["n1", "n2"]);
        assert_eq!(dir.list_known_nodes(), vec!["n1", "n2"]);
    }
}

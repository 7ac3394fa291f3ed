//! Context tree introspection
//!
//! Rendering reads only what nodes already know: addresses that were never
//! resolved and accounts that were never fetched show as `<unresolved>`.
//! Nothing here triggers a remote call or fails.

use crate::context::{AddressState, Context};
use serde::Serialize;
use std::fmt::Write as _;

const INDENT: &str = "  ";

/// Snapshot of one node for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDescription {
    pub label: String,
    pub kind: Option<String>,
    /// Address as currently known, `<unresolved>` if never resolved
    pub address: String,
    pub properties: Vec<(String, String)>,
}

impl NodeDescription {
    fn render(&self, name: &str) -> String {
        let mut line = if name == self.label {
            name.to_string()
        } else {
            format!("{} ({})", name, self.label)
        };
        let _ = write!(line, " [{}]", self.address);
        if !self.properties.is_empty() {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            let _ = write!(line, " {}", props.join(" "));
        }
        line
    }
}

pub fn describe(node: &dyn Context) -> NodeDescription {
    let core = node.core();
    NodeDescription {
        label: core.label().to_string(),
        kind: core.kind().map(str::to_string),
        address: core.peek_address().to_string(),
        properties: node.properties(),
    }
}

/// Whether the node's address has been determined
pub fn is_resolved(node: &dyn Context) -> bool {
    matches!(node.core().peek_address(), AddressState::Resolved(_))
}

/// Indented rendering of the tree below `root`, children in declaration order
pub fn to_tree_string(root: &dyn Context) -> String {
    let mut out = String::new();
    render_node(&mut out, root, root.core().label(), 0);
    out
}

fn render_node(out: &mut String, node: &dyn Context, name: &str, depth: usize) {
    let _ = writeln!(out, "{}{}", INDENT.repeat(depth), describe(node).render(name));
    for child in node.children() {
        render_node(out, child.node.as_ref(), &child.name, depth + 1);
    }
}

/// Descriptions of every node, depth first, paired with their paths
pub fn describe_all(root: &dyn Context) -> Vec<(String, NodeDescription)> {
    let mut all = Vec::new();
    collect(&mut all, root, root.core().label().to_string());
    all
}

fn collect(all: &mut Vec<(String, NodeDescription)>, node: &dyn Context, path: String) {
    all.push((path.clone(), describe(node)));
    for child in node.children() {
        collect(all, child.node.as_ref(), format!("{}/{}", path, child.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AccountContext, ContextEnv, ContextNode, Decoder, NodeSpec};
    use crate::error::ContextError;
    use crate::memory::InMemoryLedger;
    use solana_sdk::pubkey::Pubkey;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tree_tolerates_unresolved_nodes() {
        let ledger = Arc::new(InMemoryLedger::new());
        let env = ContextEnv::new(ledger.clone()).shared();
        let config = Pubkey::new_unique();
        ledger.set_data(config, Pubkey::new_unique(), vec![3]);
        let authority = Pubkey::new_unique();

        let root = ContextNode::new(
            NodeSpec::root(env, "program")
                .child("config", move |seed| {
                    AccountContext::new(
                        seed.spec("config").address(config),
                        Decoder::new(|data: &[u8]| Ok(data[0])),
                    )
                })
                .child("rewards", |seed| {
                    AccountContext::new(
                        seed.spec("rewards")
                            .kind("feature")
                            .derive_address(|_| async { Ok::<_, ContextError>(None) }),
                        Decoder::new(|data: &[u8]| Ok(data[0])),
                    )
                })
                .child("authority", move |seed| {
                    ContextNode::new(
                        seed.spec("authority")
                            .derive_address(move |_| async move { Ok::<_, ContextError>(Some(authority)) }),
                    )
                }),
        );

        let before = to_tree_string(root.as_ref());
        assert_eq!(before.lines().count(), 4);
        assert_eq!(before.lines().nth(3).unwrap(), "  authority [<unresolved>]");
        assert!(before.lines().nth(1).unwrap().contains("account=<unresolved>"));
        assert!(before.lines().nth(2).unwrap().contains("[<unresolved>]"));

        root.clone().resolve_account_tree(false).await.unwrap();
        let after = to_tree_string(root.as_ref());
        let lines: Vec<&str> = after.lines().collect();
        assert_eq!(lines[0], "program [<none>]");
        assert!(lines[1].starts_with("  config ["));
        assert!(lines[1].contains(&config.to_string()));
        assert!(lines[1].contains("data_len=1"));
        assert!(lines[2].contains("rewards [<none>]"));
        assert_eq!(lines[3], format!("  authority [{}]", authority));
        assert_eq!(ledger.total_fetches(), 1);

        let all = describe_all(root.as_ref());
        assert_eq!(all[2].0, "program/rewards");
        assert_eq!(all[2].1.kind.as_deref(), Some("feature"));
        assert!(!is_resolved(root.child("rewards").unwrap().as_ref()));
    }
}

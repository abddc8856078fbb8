//! Static argument graph shown by the Context Builder screen. The screen is deprecated and
//! the graph is fixed data.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Scripture,
    Claim,
    Theologian,
    Counterclaim,
}

impl NodeKind {
    pub fn legend(self) -> &'static str {
        match self {
            Self::Scripture => "Scripture Reference",
            Self::Claim => "Theological Claim",
            Self::Theologian => "Theologian Insight",
            Self::Counterclaim => "Objection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: &'static str,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub label: &'static str,
    pub description: &'static str,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphConnection {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextGraph {
    pub nodes: Vec<GraphNode>,
    pub connections: Vec<GraphConnection>,
}

impl ContextGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Nodes connected to `id` in either direction.
    pub fn neighbors(&self, id: &str) -> Vec<&GraphNode> {
        self.connections
            .iter()
            .filter_map(|connection| match (connection.from == id, connection.to == id) {
                (true, _) => Some(connection.to),
                (_, true) => Some(connection.from),
                _ => None,
            })
            .filter_map(|neighbor| self.node(neighbor))
            .collect()
    }
}

pub fn law_and_grace_graph() -> ContextGraph {
    let node = |id, kind, label, description, x, y| GraphNode {
        id,
        kind,
        label,
        description,
        x,
        y,
    };
    ContextGraph {
        nodes: vec![
            node(
                "scripture-1",
                NodeKind::Scripture,
                "Matthew 5:17-18",
                "Jesus came to fulfill the Law, not abolish it",
                20,
                20,
            ),
            node(
                "scripture-2",
                NodeKind::Scripture,
                "Romans 10:4",
                "Christ is the end of the law for righteousness",
                20,
                200,
            ),
            node(
                "claim-1",
                NodeKind::Claim,
                "Law & Grace",
                "Grace fulfills the Law, it does not erase it",
                300,
                110,
            ),
            node(
                "theologian-1",
                NodeKind::Theologian,
                "Augustine",
                "The New Testament is concealed in the Old",
                580,
                50,
            ),
            node(
                "counterclaim-1",
                NodeKind::Counterclaim,
                "Objection",
                "Christians cherry-pick Old Testament laws",
                580,
                170,
            ),
        ],
        connections: vec![
            GraphConnection { from: "scripture-1", to: "claim-1" },
            GraphConnection { from: "scripture-2", to: "claim-1" },
            GraphConnection { from: "claim-1", to: "theologian-1" },
            GraphConnection { from: "claim-1", to: "counterclaim-1" },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::{law_and_grace_graph, NodeKind};

    #[test]
    fn every_connection_points_at_known_nodes() {
        let graph = law_and_grace_graph();
        for connection in &graph.connections {
            assert!(graph.node(connection.from).is_some());
            assert!(graph.node(connection.to).is_some());
        }
    }

    #[test]
    fn claim_is_the_hub() {
        let graph = law_and_grace_graph();
        let neighbors = graph.neighbors("claim-1");
        assert_eq!(neighbors.len(), 4);
        let scripture = graph.neighbors("scripture-2");
        assert_eq!(scripture.len(), 1);
        assert_eq!(scripture[0].kind, NodeKind::Claim);
        assert!(graph.neighbors("missing").is_empty());
    }
}

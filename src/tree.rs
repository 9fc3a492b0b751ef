//! Hierarchical view over an archive's flat entry list.
//!
//! Nodes live in one arena and refer to their children by index.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node {
    name: String,
    children: Vec<NodeId>,
    entry: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EntryTree {
    nodes: Vec<Node>,
}

impl EntryTree {
    pub const ROOT: NodeId = NodeId(0);

    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                children: Vec::new(),
                entry: None,
            }],
        }
    }

    /// Builds the tree from entry names in archive order. The index of each
    /// name becomes the entry reference of its terminal node.
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tree = Self::new();
        for (index, name) in names.into_iter().enumerate() {
            tree.insert(name, index);
        }
        tree
    }

    fn insert(&mut self, entry_name: &str, entry: usize) {
        let segments: Vec<&str> = entry_name
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let Some((last, dirs)) = segments.split_last() else {
            return;
        };

        let mut base = Self::ROOT;
        let mut matched = 0usize;
        for segment in &segments {
            match self.child(base, segment) {
                Some(found) => {
                    base = found;
                    matched += 1;
                }
                None => break,
            }
        }
        if matched == segments.len() {
            return;
        }

        for segment in &dirs[matched..] {
            base = self.push_node(base, segment, None);
        }
        self.push_node(base, last, Some(entry));
    }

    fn push_node(&mut self, parent: NodeId, name: &str, entry: Option<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            children: Vec::new(),
            entry,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child.0].name.trim_end_matches('/') == name)
    }

    /// Descends from the root along `path`; `None` if any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut node = Self::ROOT;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            node = self.child(node, segment)?;
        }
        Some(node)
    }

    pub fn name(&self, node: NodeId) -> &str {
        self.nodes[node.0].name.as_str()
    }

    pub fn entry(&self, node: NodeId) -> Option<usize> {
        self.nodes[node.0].entry
    }

    pub fn is_directory(&self, node: NodeId) -> bool {
        !self.nodes[node.0].children.is_empty()
    }

    /// Children that denote something: a directory or an archive entry.
    pub fn children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[node.0]
            .children
            .iter()
            .copied()
            .filter(|child| {
                let child = &self.nodes[child.0];
                child.entry.is_some() || !child.children.is_empty()
            })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for EntryTree {
    fn default() -> Self {
        Self::new()
    }
}

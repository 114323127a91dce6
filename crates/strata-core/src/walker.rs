//! The shared path walker.
//!
//! Every filesystem exposes its directory tree through [`NodeOps`]; the
//! walker resolves a slash-separated path against it, matching components
//! case-sensitively unless the entry (or the configuration) says
//! otherwise and following symlinks up to a configurable depth. Symlink
//! targets starting with `/` restart at the filesystem root; relative
//! targets resolve against the directory containing the link.

use std::collections::VecDeque;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    Regular,
    Directory,
    Symlink,
    Unknown,
}

/// One directory entry as seen by the walker.
pub struct WalkEntry<N> {
    pub name: String,
    pub kind: FileKind,
    pub node: N,
    /// Matching against this entry ignores case (FAT, WIM, ...).
    pub case_insensitive: bool,
}

pub trait NodeOps {
    type Node: Clone;

    /// Lists a directory node. May yield `.` and `..`; the walker treats
    /// them like any other name, so filesystems without dot entries
    /// simply do not support relative traversal through them.
    fn read_dir_node(&mut self, dir: &Self::Node) -> Result<Vec<WalkEntry<Self::Node>>>;

    /// Reads the target of a symlink node.
    fn read_link(&mut self, node: &Self::Node) -> Result<String> {
        let _ = node;
        Err(Error::unsupported("symbolic links"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkConfig {
    /// Fold case even for entries that are nominally case-sensitive.
    pub case_fold: bool,
    pub max_symlink_depth: u32,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            case_fold: false,
            max_symlink_depth: 8,
        }
    }
}

fn name_matches(entry: &str, component: &str, fold: bool) -> bool {
    if fold {
        entry.eq_ignore_ascii_case(component)
    } else {
        entry == component
    }
}

fn push_components(queue: &mut VecDeque<String>, path: &str) {
    for comp in path.split('/').rev() {
        if !comp.is_empty() && comp != "." {
            queue.push_front(comp.to_string());
        }
    }
}

/// Resolves `path` starting at `root` and checks the result against
/// `want` (`FileKind::Unknown` accepts anything).
pub fn find_file<O: NodeOps>(
    ops: &mut O,
    root: &O::Node,
    path: &str,
    want: FileKind,
    cfg: &WalkConfig,
) -> Result<O::Node> {
    let mut queue = VecDeque::new();
    push_components(&mut queue, path);

    let mut current = root.clone();
    let mut current_kind = FileKind::Directory;
    let mut link_depth = 0u32;

    while let Some(component) = queue.pop_front() {
        if current_kind != FileKind::Directory {
            return Err(Error::NotADirectory(component));
        }
        let entries = ops.read_dir_node(&current)?;
        let found = entries.into_iter().find(|e| {
            name_matches(&e.name, &component, e.case_insensitive || cfg.case_fold)
        });
        let Some(entry) = found else {
            return Err(Error::NotFound(component));
        };

        if entry.kind == FileKind::Symlink {
            link_depth += 1;
            if link_depth > cfg.max_symlink_depth {
                return Err(Error::TooManyLinks);
            }
            let target = ops.read_link(&entry.node)?;
            log::trace!(target: "walker", "symlink {} -> {}", component, target);
            if target.starts_with('/') {
                current = root.clone();
            }
            // `current` stays the containing directory for relative
            // targets.
            push_components(&mut queue, &target);
            continue;
        }

        current = entry.node;
        current_kind = entry.kind;
    }

    match want {
        FileKind::Directory if current_kind != FileKind::Directory => {
            Err(Error::NotADirectory(path.to_string()))
        }
        FileKind::Regular if current_kind == FileKind::Directory => {
            Err(Error::NotAFile(path.to_string()))
        }
        _ => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// name -> (kind, children | link target)
    #[derive(Clone)]
    enum TreeNode {
        Dir(BTreeMap<String, TreeNode>),
        File,
        Link(String),
    }

    struct Tree {
        root: TreeNode,
    }

    #[derive(Debug, Clone)]
    struct NodeRef(Vec<String>);

    impl Tree {
        fn lookup(&self, path: &[String]) -> &TreeNode {
            let mut node = &self.root;
            for comp in path {
                let TreeNode::Dir(children) = node else {
                    panic!("walk through non-dir")
                };
                node = &children[comp];
            }
            node
        }
    }

    impl NodeOps for Tree {
        type Node = NodeRef;

        fn read_dir_node(&mut self, dir: &NodeRef) -> Result<Vec<WalkEntry<NodeRef>>> {
            let TreeNode::Dir(children) = self.lookup(&dir.0) else {
                return Err(Error::bad_fs("not a dir"));
            };
            Ok(children
                .iter()
                .map(|(name, node)| {
                    let mut path = dir.0.clone();
                    path.push(name.clone());
                    WalkEntry {
                        name: name.clone(),
                        kind: match node {
                            TreeNode::Dir(_) => FileKind::Directory,
                            TreeNode::File => FileKind::Regular,
                            TreeNode::Link(_) => FileKind::Symlink,
                        },
                        node: NodeRef(path),
                        case_insensitive: false,
                    }
                })
                .collect())
        }

        fn read_link(&mut self, node: &NodeRef) -> Result<String> {
            match self.lookup(&node.0) {
                TreeNode::Link(target) => Ok(target.clone()),
                _ => Err(Error::bad_fs("not a link")),
            }
        }
    }

    fn dir(entries: Vec<(&str, TreeNode)>) -> TreeNode {
        TreeNode::Dir(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn sample() -> Tree {
        Tree {
            root: dir(vec![
                (
                    "a",
                    dir(vec![
                        ("file.txt", TreeNode::File),
                        ("rel", TreeNode::Link("file.txt".into())),
                        ("abs", TreeNode::Link("/b/other".into())),
                    ]),
                ),
                (
                    "b",
                    dir(vec![
                        ("other", TreeNode::File),
                        ("loop", TreeNode::Link("loop".into())),
                    ]),
                ),
            ]),
        }
    }

    #[test]
    fn double_slashes_collapse() {
        let mut tree = sample();
        let cfg = WalkConfig::default();
        let root = NodeRef(vec![]);
        let a = find_file(&mut tree, &root, "/a//file.txt", FileKind::Regular, &cfg).unwrap();
        let b = find_file(&mut tree, &root, "a/file.txt", FileKind::Regular, &cfg).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn symlinks_resolve_relative_and_absolute() {
        let mut tree = sample();
        let cfg = WalkConfig::default();
        let root = NodeRef(vec![]);
        let rel = find_file(&mut tree, &root, "a/rel", FileKind::Regular, &cfg).unwrap();
        assert_eq!(rel.0, vec!["a", "file.txt"]);
        let abs = find_file(&mut tree, &root, "a/abs", FileKind::Regular, &cfg).unwrap();
        assert_eq!(abs.0, vec!["b", "other"]);
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let mut tree = sample();
        let cfg = WalkConfig::default();
        let root = NodeRef(vec![]);
        let err = find_file(&mut tree, &root, "b/loop", FileKind::Regular, &cfg).unwrap_err();
        assert!(matches!(err, Error::TooManyLinks));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let mut tree = sample();
        let cfg = WalkConfig::default();
        let root = NodeRef(vec![]);
        assert!(matches!(
            find_file(&mut tree, &root, "a", FileKind::Regular, &cfg),
            Err(Error::NotAFile(_))
        ));
        assert!(matches!(
            find_file(&mut tree, &root, "a/file.txt", FileKind::Directory, &cfg),
            Err(Error::NotADirectory(_))
        ));
        assert!(matches!(
            find_file(&mut tree, &root, "a/file.txt/x", FileKind::Regular, &cfg),
            Err(Error::NotADirectory(_))
        ));
    }
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use ntuple_error::{NtupleResult, ntuple_bail};

use crate::attribute::AttrValue;
use crate::container::Container;
use crate::dataset::{Dataset, DatasetSpec};
use crate::footer::{DatasetNode, GroupNode, Node};

/// What a group member is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Dataset,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Group => write!(f, "group"),
            NodeKind::Dataset => write!(f, "dataset"),
        }
    }
}

/// A named container of groups and datasets.
#[derive(Debug, Clone)]
pub struct Group {
    container: Container,
    path: Vec<String>,
}

impl Group {
    pub(crate) fn new(container: Container, path: Vec<String>) -> Self {
        Self { container, path }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Absolute path of the group, `/` for the root.
    pub fn path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    /// The last path component, or `/` for the root.
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("/")
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Whether the group still exists in an open container.
    pub fn is_valid(&self) -> bool {
        self.container
            .read(|state| state.footer.root.group(&self.path).map(|_| ()))
            .is_ok()
    }

    /// Path of a direct member of this group.
    pub fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.path())
        }
    }

    fn child(&self, name: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        path
    }

    pub fn contains(&self, name: &str) -> NtupleResult<bool> {
        self.container.read(|state| {
            Ok(state
                .footer
                .root
                .group(&self.path)?
                .children
                .contains_key(name))
        })
    }

    /// Direct members in name order.
    pub fn members(&self) -> NtupleResult<Vec<(String, NodeKind)>> {
        self.container.read(|state| {
            Ok(state
                .footer
                .root
                .group(&self.path)?
                .children
                .iter()
                .map(|(name, node)| {
                    let kind = match node {
                        Node::Group(_) => NodeKind::Group,
                        Node::Dataset(_) => NodeKind::Dataset,
                    };
                    (name.clone(), kind)
                })
                .collect())
        })
    }

    pub fn create_group(&self, name: &str) -> NtupleResult<Group> {
        validate_name(name)?;
        self.container.write(|state| {
            let group = state.footer.root.group_mut(&self.path)?;
            if group.children.contains_key(name) {
                ntuple_bail!(BackingStore: "{} already exists", self.child_path(name));
            }
            group
                .children
                .insert(name.to_string(), Node::Group(GroupNode::default()));
            Ok(())
        })?;
        log::trace!("created group {}", self.child_path(name));
        Ok(Group::new(self.container.clone(), self.child(name)))
    }

    pub fn open_group(&self, name: &str) -> NtupleResult<Group> {
        let path = self.child(name);
        self.container
            .read(|state| state.footer.root.group(&path).map(|_| ()))?;
        Ok(Group::new(self.container.clone(), path))
    }

    /// Open the group `name`, creating it if it does not exist.
    pub fn require_group(&self, name: &str) -> NtupleResult<Group> {
        if self.contains(name)? {
            self.open_group(name)
        } else {
            self.create_group(name)
        }
    }

    /// Remove a member and everything below it. Existing handles to it become invalid.
    pub fn unlink(&self, name: &str) -> NtupleResult<()> {
        self.container.write(|state| {
            let group = state.footer.root.group_mut(&self.path)?;
            if group.children.remove(name).is_none() {
                ntuple_bail!(BackingStore: "cannot unlink {}: no such member", self.child_path(name));
            }
            Ok(())
        })?;
        log::debug!("unlinked {}", self.child_path(name));
        Ok(())
    }

    /// Create an empty (zero-row) dataset.
    pub fn create_dataset(&self, name: &str, spec: &DatasetSpec) -> NtupleResult<Dataset> {
        validate_name(name)?;
        spec.validate()?;
        self.container.write(|state| {
            let group = state.footer.root.group_mut(&self.path)?;
            if group.children.contains_key(name) {
                ntuple_bail!(BackingStore: "{} already exists", self.child_path(name));
            }
            group.children.insert(
                name.to_string(),
                Node::Dataset(DatasetNode {
                    element: spec.element,
                    byte_order: spec.byte_order,
                    extents: spec.extents.clone(),
                    rows: 0,
                    chunk_rows: spec.chunk_rows,
                    filters: spec.filters.clone(),
                    chunks: Vec::new(),
                    attributes: BTreeMap::new(),
                }),
            );
            Ok(())
        })?;
        log::trace!("created dataset {} as {}", self.child_path(name), spec);
        Ok(Dataset::new(self.container.clone(), self.child(name)))
    }

    pub fn open_dataset(&self, name: &str) -> NtupleResult<Dataset> {
        let path = self.child(name);
        self.container
            .read(|state| state.footer.root.dataset(&path).map(|_| ()))?;
        Ok(Dataset::new(self.container.clone(), path))
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<AttrValue>) -> NtupleResult<()> {
        let value = value.into();
        self.container.write(|state| {
            state
                .footer
                .root
                .group_mut(&self.path)?
                .attributes
                .insert(name.to_string(), value);
            Ok(())
        })
    }

    pub fn attribute(&self, name: &str) -> NtupleResult<Option<AttrValue>> {
        self.container.read(|state| {
            Ok(state
                .footer
                .root
                .group(&self.path)?
                .attributes
                .get(name)
                .cloned())
        })
    }

    pub fn attributes(&self) -> NtupleResult<BTreeMap<String, AttrValue>> {
        self.container
            .read(|state| Ok(state.footer.root.group(&self.path)?.attributes.clone()))
    }
}

pub(crate) fn validate_name(name: &str) -> NtupleResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        ntuple_bail!("invalid member name {:?}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::container::CreateMode;
    use crate::dtype::ElementType;

    fn scratch() -> (tempfile::TempDir, Container) {
        let dir = tempfile::tempdir().unwrap();
        let container =
            Container::create(dir.path().join("groups.ntpl"), CreateMode::Exclusive).unwrap();
        (dir, container)
    }

    #[test]
    fn members_are_listed_in_name_order() {
        let (_dir, container) = scratch();
        let root = container.root();
        root.create_group("zeta").unwrap();
        root.create_dataset("alpha", &DatasetSpec::new(ElementType::I32, &[]))
            .unwrap();
        root.create_group("mu").unwrap();
        assert_eq!(
            root.members().unwrap(),
            vec![
                ("alpha".to_string(), NodeKind::Dataset),
                ("mu".to_string(), NodeKind::Group),
                ("zeta".to_string(), NodeKind::Group),
            ]
        );
    }

    #[test]
    fn nested_paths() {
        let (_dir, container) = scratch();
        let jets = container
            .root()
            .create_group("events")
            .unwrap()
            .create_group("jets")
            .unwrap();
        assert_eq!(jets.path(), "/events/jets");
        assert_eq!(jets.name(), "jets");
        assert_eq!(jets.child_path("pt"), "/events/jets/pt");
        assert_eq!(container.root().path(), "/");
    }

    #[test]
    fn require_group_creates_once() {
        let (_dir, container) = scratch();
        let root = container.root();
        let first = root.require_group("events").unwrap();
        first.set_attribute("run", 7i64).unwrap();
        let second = root.require_group("events").unwrap();
        assert_eq!(second.attribute("run").unwrap(), Some(AttrValue::Int(7)));
        assert!(root.create_group("events").is_err());
    }

    #[test]
    fn unlink_invalidates_handles() {
        let (_dir, container) = scratch();
        let events = container.root().create_group("events").unwrap();
        assert!(events.is_valid());
        container.root().unlink("events").unwrap();
        assert!(!events.is_valid());
        assert!(container.root().unlink("events").is_err());
    }

    #[test]
    fn kinds_are_checked_on_open() {
        let (_dir, container) = scratch();
        let root = container.root();
        root.create_group("events").unwrap();
        root.create_dataset("x", &DatasetSpec::new(ElementType::F64, &[]))
            .unwrap();
        assert!(root.open_dataset("events").is_err());
        assert!(root.open_group("x").is_err());
        assert!(root.open_group("missing").is_err());
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("..")]
    #[case("a/b")]
    fn invalid_names(#[case] name: &str) {
        let (_dir, container) = scratch();
        assert!(container.root().create_group(name).is_err());
    }
}

//! The lifecycle state tree. Records always sit in a leaf; interior nodes
//! exist so handlers and hooks can be shared by a whole subtree.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleState {
    Root,
    Empty,
    Loading,
    Loaded,
    LoadedSaved,
    Updated,
    UpdatedUncommitted,
    UpdatedInflight,
    UpdatedInvalid,
    UpdatedError,
    Created,
    CreatedUncommitted,
    CreatedInflight,
    CreatedInvalid,
    CreatedError,
    Deleted,
    DeletedUncommitted,
    DeletedInflight,
    DeletedInvalid,
    DeletedError,
    DeletedSaved,
    Error,
}

/// Which dirty subtree a leaf belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyKind {
    Updated,
    Created,
    Deleted,
}

impl LifecycleState {
    pub fn parent(self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Root => None,
            Empty | Loading | Loaded | Error => Some(Root),
            LoadedSaved | Updated | Created | Deleted => Some(Loaded),
            UpdatedUncommitted | UpdatedInflight | UpdatedInvalid | UpdatedError => Some(Updated),
            CreatedUncommitted | CreatedInflight | CreatedInvalid | CreatedError => Some(Created),
            DeletedUncommitted | DeletedInflight | DeletedInvalid | DeletedError
            | DeletedSaved => Some(Deleted),
        }
    }

    /// The child entered when an interior node is targeted.
    pub fn initial_child(self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Root => Some(Empty),
            Loaded => Some(LoadedSaved),
            Updated => Some(UpdatedUncommitted),
            Created => Some(CreatedUncommitted),
            Deleted => Some(DeletedUncommitted),
            _ => None,
        }
    }

    pub fn is_leaf(self) -> bool {
        self.initial_child().is_none()
    }

    /// Path from the root down to and including `self`.
    pub fn lineage(self) -> Vec<LifecycleState> {
        let mut path = vec![self];
        let mut cursor = self;
        while let Some(parent) = cursor.parent() {
            path.push(parent);
            cursor = parent;
        }
        path.reverse();
        path
    }

    pub fn ancestors(self) -> impl Iterator<Item = LifecycleState> {
        std::iter::successors(Some(self), |s| s.parent())
    }

    pub fn is_descendant_of(self, other: LifecycleState) -> bool {
        self.ancestors().any(|s| s == other)
    }

    pub fn name(self) -> &'static str {
        use LifecycleState::*;
        match self {
            Root => "root",
            Empty => "root.empty",
            Loading => "root.loading",
            Loaded => "root.loaded",
            LoadedSaved => "root.loaded.saved",
            Updated => "root.loaded.updated",
            UpdatedUncommitted => "root.loaded.updated.uncommitted",
            UpdatedInflight => "root.loaded.updated.inflight",
            UpdatedInvalid => "root.loaded.updated.invalid",
            UpdatedError => "root.loaded.updated.error",
            Created => "root.loaded.created",
            CreatedUncommitted => "root.loaded.created.uncommitted",
            CreatedInflight => "root.loaded.created.inflight",
            CreatedInvalid => "root.loaded.created.invalid",
            CreatedError => "root.loaded.created.error",
            Deleted => "root.loaded.deleted",
            DeletedUncommitted => "root.loaded.deleted.uncommitted",
            DeletedInflight => "root.loaded.deleted.inflight",
            DeletedInvalid => "root.loaded.deleted.invalid",
            DeletedError => "root.loaded.deleted.error",
            DeletedSaved => "root.loaded.deleted.saved",
            Error => "root.error",
        }
    }

    pub fn dirty_kind(self) -> Option<DirtyKind> {
        if self.is_descendant_of(LifecycleState::Updated) {
            Some(DirtyKind::Updated)
        } else if self.is_descendant_of(LifecycleState::Created) {
            Some(DirtyKind::Created)
        } else if self.is_descendant_of(LifecycleState::Deleted) {
            Some(DirtyKind::Deleted)
        } else {
            None
        }
    }

    pub fn is_empty(self) -> bool {
        self == LifecycleState::Empty
    }

    pub fn is_loading(self) -> bool {
        self == LifecycleState::Loading
    }

    pub fn is_loaded(self) -> bool {
        self.is_descendant_of(LifecycleState::Loaded)
    }

    pub fn is_dirty(self) -> bool {
        use LifecycleState::*;
        self.dirty_kind().is_some() && self != DeletedSaved
    }

    pub fn is_saving(self) -> bool {
        use LifecycleState::*;
        matches!(self, UpdatedInflight | CreatedInflight | DeletedInflight)
    }

    pub fn is_deleted(self) -> bool {
        self.is_descendant_of(LifecycleState::Deleted)
    }

    pub fn is_new(self) -> bool {
        self.is_descendant_of(LifecycleState::Created)
    }

    pub fn is_valid(self) -> bool {
        use LifecycleState::*;
        !matches!(self, UpdatedInvalid | CreatedInvalid | DeletedInvalid)
    }

    pub fn is_error(self) -> bool {
        use LifecycleState::*;
        matches!(self, UpdatedError | CreatedError | DeletedError | Error)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

//! Mutation catalog model.
//!
//! Analyzers produce [`MutationGroup`]s of [`MutationTemplate`]s against one scan of the
//! project. A template is never applied directly: it is instantiated against a replica's own
//! [`ReplicaArtifacts`], which yields a [`Mutation`] bound to that replica only.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactError, Constant, ReplicaArtifacts, Slot, SlotTarget};

/// Stable identifier of a method or field within one build of an assembly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId {
    /// Assembly name.
    pub assembly: String,
    /// Entity handle inside the assembly.
    pub handle: u32,
}

impl MemberId {
    /// Build a member id.
    pub fn new(assembly: impl Into<String>, handle: u32) -> Self {
        Self {
            assembly: assembly.into(),
            handle,
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#010x}", self.assembly, self.handle)
    }
}

/// Correlation id shared by every mutation of one input group. Assigned from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// The fixed set of mutation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    /// Swap one instruction opcode for another, e.g. `add` for `sub`.
    OpCode {
        /// Instruction offset.
        offset: u32,
        /// Opcode before mutation.
        original: String,
        /// Opcode after mutation.
        replacement: String,
    },
    /// Replace the constant value of a field.
    Constant {
        /// Value before mutation.
        original: Constant,
        /// Value after mutation.
        replacement: Constant,
    },
    /// Replace a literal loaded into a local variable.
    Variable {
        /// Instruction offset of the load.
        offset: u32,
        /// Value before mutation.
        original: Constant,
        /// Value after mutation.
        replacement: Constant,
    },
    /// Replace the initial contents of an array.
    Array {
        /// Instruction offset of the array initializer.
        offset: u32,
        /// Elements before mutation.
        original: Vec<Constant>,
        /// Elements after mutation.
        replacement: Vec<Constant>,
    },
}

impl MutationKind {
    /// Slot offset this mutation edits. Field constants live at offset `0`.
    pub fn offset(&self) -> u32 {
        match self {
            Self::OpCode { offset, .. }
            | Self::Variable { offset, .. }
            | Self::Array { offset, .. } => *offset,
            Self::Constant { .. } => 0,
        }
    }

    /// Slot value before mutation.
    pub fn original_slot(&self) -> Slot {
        match self {
            Self::OpCode { original, .. } => Slot::OpCode(original.clone()),
            Self::Constant { original, .. } | Self::Variable { original, .. } => {
                Slot::Constant(original.clone())
            }
            Self::Array { original, .. } => Slot::Elements(original.clone()),
        }
    }

    /// Slot value after mutation.
    pub fn replacement_slot(&self) -> Slot {
        match self {
            Self::OpCode { replacement, .. } => Slot::OpCode(replacement.clone()),
            Self::Constant { replacement, .. } | Self::Variable { replacement, .. } => {
                Slot::Constant(replacement.clone())
            }
            Self::Array { replacement, .. } => Slot::Elements(replacement.clone()),
        }
    }

    /// Opcode substitution id such as `add_sub`, used to exclude one substitution everywhere.
    /// Only opcode mutations have one.
    pub fn substitution_id(&self) -> Option<String> {
        match self {
            Self::OpCode {
                original,
                replacement,
                ..
            } => Some(format!("{original}_{replacement}").to_ascii_lowercase()),
            Self::Constant { .. } | Self::Variable { .. } | Self::Array { .. } => None,
        }
    }

    /// Short kind label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OpCode { .. } => "opcode",
            Self::Constant { .. } => "constant",
            Self::Variable { .. } => "variable",
            Self::Array { .. } => "array",
        }
    }

    /// Human-readable description of the edit.
    pub fn describe(&self) -> String {
        match self {
            Self::OpCode {
                offset,
                original,
                replacement,
            } => format!("opcode at IL_{offset:04x} changed from {original} to {replacement}"),
            Self::Constant {
                original,
                replacement,
            } => format!("constant changed from {original} to {replacement}"),
            Self::Variable {
                offset,
                original,
                replacement,
            } => format!("literal at IL_{offset:04x} changed from {original} to {replacement}"),
            Self::Array {
                offset,
                original,
                replacement,
            } => format!(
                "array at IL_{offset:04x} changed from [{}] to [{}]",
                join_constants(original),
                join_constants(replacement)
            ),
        }
    }
}

fn join_constants(values: &[Constant]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Replica-independent description of one mutation, as found by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationTemplate {
    /// Analyzer that found the mutation.
    pub analyzer_name: String,
    /// Analyzer description.
    #[serde(default)]
    pub analyzer_description: String,
    /// Owning assembly name.
    pub assembly: String,
    /// Owning type name.
    pub type_name: String,
    /// Enclosing method name, if any.
    #[serde(default)]
    pub method: Option<String>,
    /// Field name, for field and field-in-method mutations.
    #[serde(default)]
    pub field: Option<String>,
    /// Name of the member owning the mutated slot.
    pub member_name: String,
    /// Owning member id in the scanned build.
    pub member: MemberId,
    /// Enclosing method id used for the coverage lookup. `None` for bare field mutations.
    #[serde(default)]
    pub enclosing_method: Option<MemberId>,
    /// The edit.
    pub kind: MutationKind,
}

impl MutationTemplate {
    /// Report line: owner plus the edit description.
    pub fn report(&self) -> String {
        format!(
            "{}::{}: {}",
            self.type_name,
            self.member_name,
            self.kind.describe()
        )
    }

    /// Derive an equivalent mutation bound to `artifacts`' replica.
    ///
    /// The member is looked up by name so the replica's own handle is used, and the target
    /// slot must still hold the original value.
    pub fn instantiate(
        self: &Arc<Self>,
        artifacts: &ReplicaArtifacts,
    ) -> Result<Mutation, ArtifactError> {
        let member =
            artifacts.resolve_member(&self.assembly, &self.type_name, &self.member_name)?;
        let offset = self.kind.offset();
        let current = artifacts.slot(&self.assembly, &self.type_name, &self.member_name, offset)?;
        if *current != self.kind.original_slot() {
            return Err(ArtifactError::StaleSlot { member, offset });
        }

        Ok(Mutation {
            template: Arc::clone(self),
            replica: artifacts.replica(),
            member,
        })
    }

    /// Identity of the slot this mutation edits.
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            assembly: self.assembly.clone(),
            type_name: self.type_name.clone(),
            member_name: self.member_name.clone(),
            offset: self.kind.offset(),
        }
    }

    fn target(&self) -> SlotTarget<'_> {
        SlotTarget {
            assembly: &self.assembly,
            type_name: &self.type_name,
            member_name: &self.member_name,
            offset: self.kind.offset(),
        }
    }
}

/// Owned identity of one editable slot: assembly, type, member and offset.
///
/// Two mutations with the same key edit the same value, so at most one of them can be
/// applied to a replica at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Assembly name.
    pub assembly: String,
    /// Owning type name.
    pub type_name: String,
    /// Owning member name.
    pub member_name: String,
    /// Slot offset within the member.
    pub offset: u32,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}@{}",
            self.assembly, self.type_name, self.member_name, self.offset
        )
    }
}

/// Mutations found together by one analyzer pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationGroup {
    /// Analyzer name.
    pub analyzer: String,
    /// Mutations in discovery order.
    pub mutations: Vec<MutationTemplate>,
}

/// A mutation bound to exactly one replica's artifacts.
#[derive(Debug, Clone)]
pub struct Mutation {
    template: Arc<MutationTemplate>,
    replica: usize,
    member: MemberId,
}

impl Mutation {
    /// Template this mutation was derived from.
    pub fn template(&self) -> &Arc<MutationTemplate> {
        &self.template
    }

    /// Owning member id in the bound replica.
    pub fn member(&self) -> &MemberId {
        &self.member
    }

    /// Replica index this mutation is bound to.
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Write the replacement value.
    pub fn apply(&self, artifacts: &mut ReplicaArtifacts) -> Result<(), ArtifactError> {
        artifacts.write_slot(
            self.replica,
            self.template.target(),
            self.template.kind.replacement_slot(),
        )
    }

    /// Restore the original value.
    pub fn revert(&self, artifacts: &mut ReplicaArtifacts) -> Result<(), ArtifactError> {
        artifacts.write_slot(
            self.replica,
            self.template.target(),
            self.template.kind.original_slot(),
        )
    }

    /// Report line.
    pub fn describe(&self) -> String {
        self.template.report()
    }
}

//! Compiled representation of a replica's assemblies.
//!
//! Bytecode parsing and patching belong to an external collaborator. This module models the
//! surface that collaborator hands to the scheduler: an assembly image made of types, members
//! and mutable slots, loaded from and flushed back to one replica's files.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::MemberId;

/// Literal value stored in a constant, variable or array slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constant {
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// Boolean literal.
    Bool(bool),
    /// String literal.
    Str(String),
    /// Null reference.
    Null,
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::Null => f.write_str("null"),
        }
    }
}

/// One mutable location inside a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Slot {
    /// An instruction opcode.
    OpCode(String),
    /// A literal operand or field constant.
    Constant(Constant),
    /// Initial contents of an array.
    Elements(Vec<Constant>),
}

/// A method or field inside a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberImage {
    /// Entity handle of the member in this build.
    pub handle: u32,
    /// Mutable slots keyed by instruction offset (`0` for field constants).
    #[serde(default)]
    pub slots: BTreeMap<u32, Slot>,
}

/// Members of one type, keyed by member name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeImage {
    /// Members keyed by name.
    #[serde(default)]
    pub members: BTreeMap<String, MemberImage>,
}

/// Editable image of one compiled assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyImage {
    /// Assembly name, the first half of every [`MemberId`] inside it.
    pub name: String,
    /// Types keyed by full type name.
    #[serde(default)]
    pub types: BTreeMap<String, TypeImage>,
}

impl AssemblyImage {
    /// Create an empty image.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: BTreeMap::new(),
        }
    }

    /// Add or replace a member, returning `self` for chaining.
    pub fn with_member(
        mut self,
        type_name: impl Into<String>,
        member_name: impl Into<String>,
        member: MemberImage,
    ) -> Self {
        self.types
            .entry(type_name.into())
            .or_default()
            .members
            .insert(member_name.into(), member);
        self
    }

    fn member(&self, type_name: &str, member_name: &str) -> Option<&MemberImage> {
        self.types.get(type_name)?.members.get(member_name)
    }

    fn member_mut(&mut self, type_name: &str, member_name: &str) -> Option<&mut MemberImage> {
        self.types.get_mut(type_name)?.members.get_mut(member_name)
    }
}

/// Artifact access errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Reading or writing an image file failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Image file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// An image file is not a valid assembly image.
    #[error("invalid assembly image {path}: {source}")]
    Json {
        /// Image file path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// No loaded image carries this assembly name.
    #[error("unknown assembly `{0}`")]
    UnknownAssembly(String),
    /// The assembly has no member with this name in this type.
    #[error("unknown member `{type_name}::{member_name}` in assembly `{assembly}`")]
    UnknownMember {
        /// Assembly name.
        assembly: String,
        /// Type name.
        type_name: String,
        /// Member name.
        member_name: String,
    },
    /// The member has no slot at this offset.
    #[error("member {member} has no slot at offset {offset}")]
    MissingSlot {
        /// Member id in this replica.
        member: MemberId,
        /// Slot offset.
        offset: u32,
    },
    /// The slot no longer holds the value the mutation was derived from.
    #[error("slot {offset} of member {member} does not hold the expected original value")]
    StaleSlot {
        /// Member id in this replica.
        member: MemberId,
        /// Slot offset.
        offset: u32,
    },
    /// A mutation derived for one replica was applied to another.
    #[error("mutation bound to replica {bound} applied to replica {target}")]
    ForeignReplica {
        /// Replica the mutation was derived against.
        bound: usize,
        /// Replica it was applied to.
        target: usize,
    },
}

#[derive(Debug, Clone)]
struct LoadedAssembly {
    path: PathBuf,
    image: AssemblyImage,
    modified: bool,
}

/// All assembly images of one replica, loaded in memory.
#[derive(Debug, Clone)]
pub struct ReplicaArtifacts {
    replica: usize,
    assemblies: BTreeMap<String, LoadedAssembly>,
}

impl ReplicaArtifacts {
    /// Empty artifact set owned by `replica`.
    pub fn new(replica: usize) -> Self {
        Self {
            replica,
            assemblies: BTreeMap::new(),
        }
    }

    /// Register an image that is flushed to `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, image: AssemblyImage) {
        self.assemblies.insert(
            image.name.clone(),
            LoadedAssembly {
                path: path.into(),
                image,
                modified: false,
            },
        );
    }

    /// Load every image file of a replica.
    pub async fn load(replica: usize, paths: &[PathBuf]) -> Result<Self, ArtifactError> {
        let mut artifacts = Self::new(replica);
        for path in paths {
            let raw = tokio::fs::read(path).await.map_err(|source| ArtifactError::Io {
                path: path.clone(),
                source,
            })?;
            let image = parse_image(path, &raw)?;
            artifacts.insert(path.clone(), image);
        }
        Ok(artifacts)
    }

    /// Index of the replica these artifacts belong to.
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Loaded image by assembly name.
    pub fn image(&self, assembly: &str) -> Option<&AssemblyImage> {
        self.assemblies.get(assembly).map(|loaded| &loaded.image)
    }

    /// Resolve a member by name to its id in this replica's build.
    pub fn resolve_member(
        &self,
        assembly: &str,
        type_name: &str,
        member_name: &str,
    ) -> Result<MemberId, ArtifactError> {
        let image = self
            .image(assembly)
            .ok_or_else(|| ArtifactError::UnknownAssembly(assembly.to_string()))?;
        let member = image
            .member(type_name, member_name)
            .ok_or_else(|| unknown_member(assembly, type_name, member_name))?;
        Ok(MemberId::new(assembly, member.handle))
    }

    /// Current value of a slot.
    pub fn slot(
        &self,
        assembly: &str,
        type_name: &str,
        member_name: &str,
        offset: u32,
    ) -> Result<&Slot, ArtifactError> {
        let image = self
            .image(assembly)
            .ok_or_else(|| ArtifactError::UnknownAssembly(assembly.to_string()))?;
        let member = image
            .member(type_name, member_name)
            .ok_or_else(|| unknown_member(assembly, type_name, member_name))?;
        member
            .slots
            .get(&offset)
            .ok_or_else(|| ArtifactError::MissingSlot {
                member: MemberId::new(assembly, member.handle),
                offset,
            })
    }

    pub(crate) fn write_slot(
        &mut self,
        bound_replica: usize,
        target: SlotTarget<'_>,
        value: Slot,
    ) -> Result<(), ArtifactError> {
        if bound_replica != self.replica {
            return Err(ArtifactError::ForeignReplica {
                bound: bound_replica,
                target: self.replica,
            });
        }

        let loaded = self
            .assemblies
            .get_mut(target.assembly)
            .ok_or_else(|| ArtifactError::UnknownAssembly(target.assembly.to_string()))?;
        let member = loaded
            .image
            .member_mut(target.type_name, target.member_name)
            .ok_or_else(|| unknown_member(target.assembly, target.type_name, target.member_name))?;
        let handle = member.handle;
        let slot = member
            .slots
            .get_mut(&target.offset)
            .ok_or_else(|| ArtifactError::MissingSlot {
                member: MemberId::new(target.assembly, handle),
                offset: target.offset,
            })?;
        *slot = value;
        loaded.modified = true;
        Ok(())
    }

    /// Whether any image changed since the last flush.
    pub fn is_modified(&self) -> bool {
        self.assemblies.values().any(|loaded| loaded.modified)
    }

    /// Write modified images back to their files. Returns the number of files written.
    pub async fn flush(&mut self) -> Result<usize, ArtifactError> {
        let mut written = 0;
        for loaded in self.assemblies.values_mut().filter(|loaded| loaded.modified) {
            let raw = serde_json::to_vec_pretty(&loaded.image).map_err(|source| {
                ArtifactError::Json {
                    path: loaded.path.clone(),
                    source,
                }
            })?;
            tokio::fs::write(&loaded.path, raw)
                .await
                .map_err(|source| ArtifactError::Io {
                    path: loaded.path.clone(),
                    source,
                })?;
            loaded.modified = false;
            written += 1;
        }
        Ok(written)
    }
}

/// Address of one slot by names.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotTarget<'a> {
    pub assembly: &'a str,
    pub type_name: &'a str,
    pub member_name: &'a str,
    pub offset: u32,
}

/// Parse raw image bytes read from `path`.
pub fn parse_image(path: &Path, raw: &[u8]) -> Result<AssemblyImage, ArtifactError> {
    serde_json::from_slice(raw).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn unknown_member(assembly: &str, type_name: &str, member_name: &str) -> ArtifactError {
    ArtifactError::UnknownMember {
        assembly: assembly.to_string(),
        type_name: type_name.to_string(),
        member_name: member_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample_image() -> AssemblyImage {
        AssemblyImage::new("Calc").with_member(
            "Calc.Math",
            "Add",
            MemberImage {
                handle: 0x0600_0001,
                slots: BTreeMap::from([(4, Slot::OpCode("add".to_string()))]),
            },
        )
    }

    #[test]
    fn resolve_member_uses_replica_handle() {
        let mut artifacts = ReplicaArtifacts::new(3);
        artifacts.insert("calc.image.json", sample_image());

        let member = artifacts
            .resolve_member("Calc", "Calc.Math", "Add")
            .expect("member should resolve");
        assert_eq!(member, MemberId::new("Calc", 0x0600_0001));

        assert!(matches!(
            artifacts.resolve_member("Calc", "Calc.Math", "Sub"),
            Err(ArtifactError::UnknownMember { .. })
        ));
        assert!(matches!(
            artifacts.resolve_member("Other", "Calc.Math", "Add"),
            Err(ArtifactError::UnknownAssembly(_))
        ));
    }

    #[test]
    fn write_slot_rejects_foreign_replica() {
        let mut artifacts = ReplicaArtifacts::new(1);
        artifacts.insert("calc.image.json", sample_image());
        let target = SlotTarget {
            assembly: "Calc",
            type_name: "Calc.Math",
            member_name: "Add",
            offset: 4,
        };

        let err = artifacts
            .write_slot(2, target, Slot::OpCode("sub".to_string()))
            .expect_err("foreign replica should be rejected");
        assert!(matches!(
            err,
            ArtifactError::ForeignReplica {
                bound: 2,
                target: 1
            }
        ));
        assert!(!artifacts.is_modified());
    }

    #[tokio::test]
    async fn flush_writes_only_modified_images() {
        let tmp = tempdir().expect("tempdir should be created");
        let calc_path = tmp.path().join("calc.image.json");
        let util_path = tmp.path().join("util.image.json");
        std::fs::write(
            &calc_path,
            serde_json::to_vec(&sample_image()).expect("image should serialize"),
        )
        .expect("calc image should write");
        std::fs::write(
            &util_path,
            serde_json::to_vec(&AssemblyImage::new("Util")).expect("image should serialize"),
        )
        .expect("util image should write");
        let util_before = std::fs::read(&util_path).expect("util image should read");

        let mut artifacts = ReplicaArtifacts::load(0, &[calc_path.clone(), util_path.clone()])
            .await
            .expect("artifacts should load");
        artifacts
            .write_slot(
                0,
                SlotTarget {
                    assembly: "Calc",
                    type_name: "Calc.Math",
                    member_name: "Add",
                    offset: 4,
                },
                Slot::OpCode("sub".to_string()),
            )
            .expect("slot should be writable");

        let written = artifacts.flush().await.expect("flush should work");
        assert_eq!(written, 1);
        assert!(!artifacts.is_modified());

        let reloaded = ReplicaArtifacts::load(0, &[calc_path])
            .await
            .expect("flushed image should reload");
        assert_eq!(
            reloaded
                .slot("Calc", "Calc.Math", "Add", 4)
                .expect("slot should exist"),
            &Slot::OpCode("sub".to_string())
        );
        assert_eq!(
            std::fs::read(&util_path).expect("util image should read"),
            util_before
        );
    }

    #[test]
    fn invalid_image_reports_path() {
        let err = parse_image(Path::new("broken.image.json"), b"{not json")
            .expect_err("invalid json should fail");
        assert!(err.to_string().contains("broken.image.json"));
    }
}

//! Fixture project shared by the end-to-end tests: one assembly image and a libtest-style
//! shell script whose results depend on which mutation is currently written to the image.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use mutation_rounds::artifact::{AssemblyImage, Constant, MemberImage, Slot};
use mutation_rounds::catalog::{MemberId, MutationGroup, MutationKind, MutationTemplate};
use mutation_rounds::coverage::{CoverageMap, encode_stream};

pub const IMAGE: &str = "calc.image.json";
pub const TESTS: &str = "run-tests";

// `add_works` fails once `kill_me` is in the image, `timer_works` hangs once `hang_me` is.
// Test names arrive sorted, so `timer_works` is always reported last.
const SCRIPT: &str = r#"#!/bin/sh
for t in "$@"; do
  case "$t" in
    --*) ;;
    add_works)
      if grep -q kill_me calc.image.json; then
        echo "test add_works ... FAILED"
      else
        echo "test add_works ... ok"
      fi
      ;;
    timer_works)
      if grep -q hang_me calc.image.json; then
        exec sleep 30
      fi
      echo "test timer_works ... ok"
      ;;
    *) echo "test $t ... ok" ;;
  esac
done
"#;

fn member(handle: u32, opcode: &str) -> MemberImage {
    MemberImage {
        handle,
        slots: BTreeMap::from([(2, Slot::OpCode(opcode.to_string()))]),
    }
}

/// Write the built project into `dir`.
pub fn write_project(dir: &Path) {
    fs::create_dir_all(dir).expect("project dir should be created");
    let image = AssemblyImage::new("Calc")
        .with_member("Calc.Math", "Add", member(1, "add"))
        .with_member("Calc.Math", "Sub", member(2, "sub"))
        .with_member("Calc.Math", "Timer", member(3, "loop"))
        .with_member(
            "Calc.Math",
            "Limit",
            MemberImage {
                handle: 4,
                slots: BTreeMap::from([(0, Slot::Constant(Constant::Int(10)))]),
            },
        );
    fs::write(
        dir.join(IMAGE),
        serde_json::to_vec_pretty(&image).expect("image should serialize"),
    )
    .expect("image should write");

    let script = dir.join(TESTS);
    fs::write(&script, SCRIPT).expect("test script should write");
    fs::set_permissions(&script, PermissionsExt::from_mode(0o755))
        .expect("test script should be executable");
    fs::create_dir_all(dir.join(".git")).expect("vcs dir should be created");
}

/// Per-test coverage of the fixture project.
pub fn coverage() -> CoverageMap {
    [
        ("add_works".to_string(), MemberId::new("Calc", 1)),
        ("sub_works".to_string(), MemberId::new("Calc", 2)),
        ("timer_works".to_string(), MemberId::new("Calc", 3)),
    ]
    .into_iter()
    .collect()
}

pub fn write_coverage(path: &Path) {
    fs::write(path, encode_stream(&coverage())).expect("coverage should write");
}

fn opcode(member: &str, handle: u32, from: &str, to: &str) -> MutationTemplate {
    MutationTemplate {
        analyzer_name: "arithmetic".to_string(),
        analyzer_description: "swaps arithmetic opcodes".to_string(),
        assembly: "Calc".to_string(),
        type_name: "Calc.Math".to_string(),
        method: Some(member.to_string()),
        field: None,
        member_name: member.to_string(),
        member: MemberId::new("Calc", handle),
        enclosing_method: Some(MemberId::new("Calc", handle)),
        kind: MutationKind::OpCode {
            offset: 2,
            original: from.to_string(),
            replacement: to.to_string(),
        },
    }
}

/// Ordinals: 0 killed, 1 survives, 2 hangs, 3 shares the hanging group, 4 has no coverage.
pub fn catalog() -> Vec<MutationGroup> {
    vec![
        MutationGroup {
            analyzer: "arithmetic".to_string(),
            mutations: vec![opcode("Add", 1, "add", "kill_me")],
        },
        MutationGroup {
            analyzer: "arithmetic".to_string(),
            mutations: vec![opcode("Sub", 2, "sub", "mul")],
        },
        MutationGroup {
            analyzer: "loops".to_string(),
            mutations: vec![
                opcode("Timer", 3, "loop", "hang_me"),
                opcode("Timer", 3, "loop", "noop"),
            ],
        },
        MutationGroup {
            analyzer: "constant".to_string(),
            mutations: vec![MutationTemplate {
                analyzer_name: "constant".to_string(),
                analyzer_description: String::new(),
                assembly: "Calc".to_string(),
                type_name: "Calc.Math".to_string(),
                method: None,
                field: Some("Limit".to_string()),
                member_name: "Limit".to_string(),
                member: MemberId::new("Calc", 4),
                enclosing_method: None,
                kind: MutationKind::Constant {
                    original: Constant::Int(10),
                    replacement: Constant::Int(0),
                },
            }],
        },
    ]
}

pub fn write_catalog(path: &Path) {
    fs::write(
        path,
        serde_json::to_vec_pretty(&catalog()).expect("catalog should serialize"),
    )
    .expect("catalog should write");
}

//! Join the coverage map with the mutation catalog.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::catalog::{GroupId, MutationGroup, MutationTemplate};
use crate::coverage::{CoverageIndex, CoverageMap, TestName};

/// A mutation paired with the tests executing its enclosing method.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundMutation {
    /// Position of the mutation in catalog order, unique per binding.
    pub ordinal: usize,
    /// The mutation.
    pub template: Arc<MutationTemplate>,
    /// Tests covering the enclosing method. Empty means no coverage.
    pub tests: BTreeSet<TestName>,
    /// Id of the input group the mutation came from.
    pub group_id: GroupId,
}

impl BoundMutation {
    /// True if at least one test covers the mutation.
    pub fn is_covered(&self) -> bool {
        !self.tests.is_empty()
    }
}

/// Bind every mutation of `catalog` to its covering tests.
///
/// The inverted index is built once; each mutation is then a single lookup.
pub fn bind(coverage: &CoverageMap, catalog: &[MutationGroup]) -> Vec<BoundMutation> {
    let index = coverage.invert();
    bind_with_index(&index, catalog).collect()
}

/// Bind against a prebuilt index, lazily and in catalog order.
///
/// Group ids are assigned per input group starting at 1, so an empty group still consumes
/// an id. Mutations without an enclosing method, or whose method no test executes, are
/// emitted with an empty test set.
pub fn bind_with_index<'a>(
    index: &'a CoverageIndex,
    catalog: &'a [MutationGroup],
) -> impl Iterator<Item = BoundMutation> + 'a {
    catalog
        .iter()
        .enumerate()
        .flat_map(|(group_index, group)| {
            let group_id = GroupId(group_index as u32 + 1);
            group
                .mutations
                .iter()
                .map(move |template| (group_id, template))
        })
        .enumerate()
        .map(move |(ordinal, (group_id, template))| {
            let tests = template
                .enclosing_method
                .as_ref()
                .and_then(|member| index.tests_for(member))
                .cloned()
                .unwrap_or_default();
            BoundMutation {
                ordinal,
                template: Arc::new(template.clone()),
                tests,
                group_id,
            }
        })
}

/// Bound mutations split by coverage.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    /// Mutations with at least one covering test, in catalog order.
    pub covered: Vec<BoundMutation>,
    /// Mutations no test covers. Reported as no-coverage, never scheduled.
    pub uncovered: Vec<BoundMutation>,
    /// Mutations the user excluded. Reported as excluded, never scheduled.
    pub excluded: Vec<BoundMutation>,
}

impl Binding {
    /// Split bound mutations, keeping catalog order on both sides.
    pub fn partition(bound: impl IntoIterator<Item = BoundMutation>) -> Self {
        let (covered, uncovered) = bound.into_iter().partition(BoundMutation::is_covered);
        Self {
            covered,
            uncovered,
            excluded: Vec::new(),
        }
    }

    /// Move every mutation matching `is_excluded` out of the covered and uncovered sets.
    pub fn exclude(self, is_excluded: impl Fn(&MutationTemplate) -> bool) -> Self {
        let Self {
            covered,
            uncovered,
            mut excluded,
        } = self;
        let (dropped, covered): (Vec<_>, Vec<_>) = covered
            .into_iter()
            .partition(|mutation| is_excluded(mutation.template.as_ref()));
        excluded.extend(dropped);
        let (dropped, uncovered): (Vec<_>, Vec<_>) = uncovered
            .into_iter()
            .partition(|mutation| is_excluded(mutation.template.as_ref()));
        excluded.extend(dropped);
        excluded.sort_by_key(|mutation| mutation.ordinal);

        Self {
            covered,
            uncovered,
            excluded,
        }
    }

    /// Total number of mutations.
    pub fn len(&self) -> usize {
        self.covered.len() + self.uncovered.len() + self.excluded.len()
    }

    /// True if the catalog was empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

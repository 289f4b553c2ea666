use cloudbench_core::prelude::AtomicAction;

/// Atomic actions with the same name at the same level, merged into one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedAtomicAction {
    pub name: String,
    pub duration: f64,
    pub count: usize,
    pub failed: bool,
    pub children: Vec<MergedAtomicAction>,
}

/// Merge duplicate atomic actions, keeping the order in which names first appear.
///
/// Children are merged down to `max_depth` levels below the top level. Deeper actions still count
/// towards their ancestor's duration but are not broken out.
pub fn merge_atomic_actions(actions: &[AtomicAction], max_depth: usize) -> Vec<MergedAtomicAction> {
    let mut merged = Vec::new();
    merge_into(&mut merged, actions, 0, max_depth);
    merged
}

fn merge_into(
    merged: &mut Vec<MergedAtomicAction>,
    actions: &[AtomicAction],
    depth: usize,
    max_depth: usize,
) {
    for action in actions {
        let position = match merged.iter().position(|m| m.name == action.name) {
            Some(position) => position,
            None => {
                merged.push(MergedAtomicAction {
                    name: action.name.clone(),
                    duration: 0.0,
                    count: 0,
                    failed: false,
                    children: Vec::new(),
                });
                merged.len() - 1
            }
        };

        let entry = &mut merged[position];
        entry.duration += action.duration();
        entry.count += 1;
        entry.failed |= action.failed;

        if !action.children.is_empty() && depth < max_depth {
            merge_into(&mut entry.children, &action.children, depth + 1, max_depth);
        }
    }
}

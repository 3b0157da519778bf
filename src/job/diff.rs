use std::collections::BTreeMap;

use crate::tasks::Snapshot;


/// Lists every node whose state or message differs between two snapshots.
///
/// Children are matched by name and visited in name order. A node missing
/// from `old` is reported as `(new)`, one missing from `new` as `(deleted)`.
pub fn diff(old: Option<&Snapshot>, new: Option<&Snapshot>) -> Vec<String> {
    let mut lines = vec![];
    let Some(name) = new.or(old).map(|snapshot| snapshot.name.clone()) else {
        return lines;
    };

    walk(&mut vec![name], old, new, &mut lines);
    lines
}

fn walk(
    path: &mut Vec<String>,
    old: Option<&Snapshot>,
    new: Option<&Snapshot>,
    lines: &mut Vec<String>,
) {
    let (old_state, old_message) = match old {
        Some(snapshot) => (snapshot.state.as_str(), snapshot.message.as_str()),
        None => ("(new)", ""),
    };
    let (new_state, new_message) = match new {
        Some(snapshot) => (snapshot.state.as_str(), snapshot.message.as_str()),
        None => ("(deleted)", ""),
    };

    if old_state != new_state || old_message != new_message {
        lines.push(format!(
            "[{}]: {} ({}) -> {} ({})",
            path.join("/"),
            old_state,
            old_message,
            new_state,
            new_message,
        ));
    }

    let mut children: BTreeMap<&str, (Option<&Snapshot>, Option<&Snapshot>)> = BTreeMap::new();
    for child in old.into_iter().flat_map(|snapshot| snapshot.children.iter()) {
        children.entry(&child.name).or_default().0 = Some(child);
    }
    for child in new.into_iter().flat_map(|snapshot| snapshot.children.iter()) {
        children.entry(&child.name).or_default().1 = Some(child);
    }

    for (name, (old, new)) in children {
        path.push(name.to_string());
        walk(path, old, new, lines);
        path.pop();
    }
}

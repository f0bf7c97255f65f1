use std::collections::{BTreeMap, BTreeSet};

use crate::warning::WarningRecord;

/// Guesses classes that moved to another package between two runs.
///
/// A class that vanished from the old run is paired with a class that first
/// appears in the new run when both share the same simple name and neither
/// side offers another candidate with that name.
pub(crate) fn infer_moved_classes(
    old: &[WarningRecord],
    new: &[WarningRecord],
    old_classes: &BTreeSet<String>,
    new_classes: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    let old_all = known_classes(old, old_classes);
    let new_all = known_classes(new, new_classes);

    let vanished = by_simple_name(old_all.difference(&new_all));
    let appeared = by_simple_name(new_all.difference(&old_all));

    let mut moves = BTreeMap::new();
    for (simple_name, from) in vanished {
        let [from] = from.as_slice() else {
            continue;
        };
        let Some([to]) = appeared.get(simple_name).map(Vec::as_slice) else {
            continue;
        };
        moves.insert((*from).to_string(), (*to).to_string());
    }
    moves
}

fn known_classes<'a>(
    records: &'a [WarningRecord],
    classes: &'a BTreeSet<String>,
) -> BTreeSet<&'a str> {
    classes
        .iter()
        .map(String::as_str)
        .chain(records.iter().map(WarningRecord::class_name))
        .collect()
}

fn by_simple_name<'a>(classes: impl Iterator<Item = &'a &'a str>) -> BTreeMap<&'a str, Vec<&'a str>> {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for class_name in classes {
        grouped
            .entry(simple_name(class_name))
            .or_default()
            .push(class_name);
    }
    grouped
}

fn simple_name(class_name: &str) -> &str {
    class_name
        .rsplit_once(['.', '/'])
        .map(|(_, simple)| simple)
        .unwrap_or(class_name)
}

//! Path reconstruction over a flat parent-pointer item list.

use std::collections::HashMap;

use crate::types::DriveItem;

/// A non-folder item with its reconstructed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPath<'a> {
    pub item: &'a DriveItem,
    /// Titles from the anchor (exclusive) down to the item, joined by `/`.
    pub path: String,
    /// Parent id at which the upward walk stopped: `stop_at`, or a parent
    /// absent from the item set. `None` when the walk reached an item
    /// without parents.
    pub anchor: Option<String>,
}

/// Reconstruct the path of every non-folder item by walking parent
/// references upward through an id index built once over `items`.
///
/// The walk stops at a parent equal to `stop_at`, at a parent missing from
/// `items`, or at an item with no parent. Depth is bounded by the number of
/// items, so reference cycles terminate.
pub fn reconstruct_paths<'a>(items: &'a [DriveItem], stop_at: Option<&str>) -> Vec<ItemPath<'a>> {
    let index: HashMap<&str, &DriveItem> = items.iter().map(|item| (item.id.as_str(), item)).collect();

    items
        .iter()
        .filter(|item| !item.is_folder())
        .map(|item| {
            let mut titles = vec![item.title.as_str()];
            let mut current = item;
            let mut anchor = None;

            for _ in 0..items.len() {
                let Some(parent_id) = current.parent_id() else {
                    break;
                };
                if Some(parent_id) == stop_at {
                    anchor = Some(parent_id.to_string());
                    break;
                }
                match index.get(parent_id) {
                    Some(&parent) => {
                        titles.push(parent.title.as_str());
                        current = parent;
                    }
                    None => {
                        anchor = Some(parent_id.to_string());
                        break;
                    }
                }
            }

            titles.reverse();
            ItemPath {
                item,
                path: titles.join("/"),
                anchor,
            }
        })
        .collect()
}

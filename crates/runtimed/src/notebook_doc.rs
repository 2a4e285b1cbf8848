//! Automerge-backed notebook document for cross-window sync.
//!
//! The daemon holds the canonical copy in a "room" and is the only writer.
//! Each connected notebook window holds a read-only replica that syncs via
//! the Automerge sync protocol and materializes it into `CellSnapshot`s
//! after every inbound change.
//!
//! ## Document schema
//!
//! ```text
//! ROOT/
//!   notebook_id: Str
//!   cells/                        ← List of Map
//!     [i]/
//!       id: Str                   ← cell UUID
//!       cell_type: Str            ← "code" | "markdown" | "raw"
//!       source: Text              ← Automerge Text CRDT
//!       execution_count: Str      ← JSON-encoded i64 or "null"
//!       outputs/                  ← List of Str
//!         [j]: Str                ← output JSON or manifest hash
//!       running: Bool             ← set while the daemon executes the cell
//! ```

use automerge::{AutoCommit, ObjId, ObjType, ReadDoc};
use serde::{Deserialize, Serialize};

/// Snapshot of a single cell's state, suitable for serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellSnapshot {
    pub id: String,
    /// "code", "markdown", or "raw"
    pub cell_type: String,
    pub source: String,
    /// JSON-encoded execution count: a number string like "5" or "null"
    pub execution_count: String,
    /// Output JSON strings or 64-hex manifest hashes.
    pub outputs: Vec<String>,
    #[serde(default)]
    pub running: bool,
}

/// Read a scalar string from any Automerge object by key.
fn read_str<O: AsRef<ObjId>, P: Into<automerge::Prop>>(
    doc: &AutoCommit,
    obj: O,
    prop: P,
) -> Option<String> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
}

fn read_bool<O: AsRef<ObjId>>(doc: &AutoCommit, obj: O, key: &str) -> Option<bool> {
    doc.get(obj, key)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Boolean(b) => Some(*b),
                _ => None,
            },
            _ => None,
        })
}

fn child_id(doc: &AutoCommit, parent: &ObjId, key: &str, expected: ObjType) -> Option<ObjId> {
    match doc.get(parent, key).ok().flatten() {
        Some((automerge::Value::Object(obj_type), id)) if obj_type == expected => Some(id),
        _ => None,
    }
}

/// Read cells from a raw AutoCommit document (used by the sync client).
pub fn get_cells_from_doc(doc: &AutoCommit) -> Vec<CellSnapshot> {
    let Some(cells_id) = child_id(doc, &automerge::ROOT, "cells", ObjType::List) else {
        return vec![];
    };

    let len = doc.length(&cells_id);
    (0..len)
        .filter_map(|i| {
            let cell_obj = match doc.get(&cells_id, i).ok().flatten() {
                Some((automerge::Value::Object(ObjType::Map), id)) => id,
                _ => return None,
            };

            let id = read_str(doc, &cell_obj, "id")?;
            let cell_type = read_str(doc, &cell_obj, "cell_type").unwrap_or_default();
            let execution_count =
                read_str(doc, &cell_obj, "execution_count").unwrap_or_else(|| "null".to_string());

            let source = child_id(doc, &cell_obj, "source", ObjType::Text)
                .and_then(|text_id| doc.text(&text_id).ok())
                .unwrap_or_default();

            let outputs = match child_id(doc, &cell_obj, "outputs", ObjType::List) {
                Some(list_id) => {
                    let len = doc.length(&list_id);
                    (0..len)
                        .filter_map(|j| read_str(doc, &list_id, j))
                        .collect()
                }
                None => vec![],
            };

            let running = read_bool(doc, &cell_obj, "running").unwrap_or(false);

            Some(CellSnapshot {
                id,
                cell_type,
                source,
                execution_count,
                outputs,
                running,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use automerge::transaction::Transactable;

    use super::*;

    /// Lay out a doc the way the room does.
    fn room_doc(cells: &[(&str, &str, &str, Vec<&str>)]) -> AutoCommit {
        let mut doc = AutoCommit::new();
        let list = doc.put_object(automerge::ROOT, "cells", ObjType::List).unwrap();
        for (i, (id, cell_type, count, outputs)) in cells.iter().enumerate() {
            let cell = doc.insert_object(&list, i, ObjType::Map).unwrap();
            doc.put(&cell, "id", *id).unwrap();
            doc.put(&cell, "cell_type", *cell_type).unwrap();
            let source = doc.put_object(&cell, "source", ObjType::Text).unwrap();
            doc.splice_text(&source, 0, 0, &format!("# {}", id)).unwrap();
            doc.put(&cell, "execution_count", *count).unwrap();
            let output_list = doc.put_object(&cell, "outputs", ObjType::List).unwrap();
            for (j, output) in outputs.iter().enumerate() {
                doc.insert(&output_list, j, *output).unwrap();
            }
        }
        doc
    }

    #[test]
    fn test_empty_doc_has_no_cells() {
        assert!(get_cells_from_doc(&AutoCommit::new()).is_empty());
    }

    #[test]
    fn test_cells_read_in_order() {
        let hash = "ab".repeat(32);
        let doc = room_doc(&[
            ("c1", "code", "3", vec![r#"{"output_type":"stream"}"#, hash.as_str()]),
            ("c2", "markdown", "null", vec![]),
        ]);

        let cells = get_cells_from_doc(&doc);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].id, "c1");
        assert_eq!(cells[0].source, "# c1");
        assert_eq!(cells[0].execution_count, "3");
        assert_eq!(cells[0].outputs[1], hash);
        assert!(!cells[0].running);
        assert_eq!(cells[1].cell_type, "markdown");
        assert!(cells[1].outputs.is_empty());
    }

    #[test]
    fn test_running_flag_and_missing_fields() {
        let mut doc = room_doc(&[("c1", "code", "null", vec![])]);
        let list = child_id(&doc, &automerge::ROOT, "cells", ObjType::List).unwrap();
        let cell = doc.get(&list, 0).unwrap().unwrap().1;
        doc.put(&cell, "running", true).unwrap();
        doc.delete(&cell, "execution_count").unwrap();

        // A map without an id isn't a cell.
        doc.insert_object(&list, 1, ObjType::Map).unwrap();

        let cells = get_cells_from_doc(&doc);
        assert_eq!(cells.len(), 1);
        assert!(cells[0].running);
        assert_eq!(cells[0].execution_count, "null");
    }
}

//! Room-side notebook document. Windows never write the doc, so the
//! writer lives with the tests that stand in for the daemon.

use automerge::sync::{self, SyncDoc};
use automerge::transaction::Transactable;
use automerge::{AutoCommit, AutomergeError, ObjId, ObjType, ReadDoc};
use runtimed::notebook_doc::get_cells_from_doc;

pub struct RoomDoc {
    doc: AutoCommit,
    cells: ObjId,
}

impl RoomDoc {
    pub fn new(notebook_id: &str) -> Self {
        let mut doc = AutoCommit::new();
        doc.put(automerge::ROOT, "notebook_id", notebook_id).unwrap();
        let cells = doc
            .put_object(automerge::ROOT, "cells", ObjType::List)
            .unwrap();
        Self { doc, cells }
    }

    /// Append a cell with `source` and an unset execution count.
    pub fn push_cell(&mut self, cell_id: &str, cell_type: &str, source: &str) {
        let index = self.doc.length(&self.cells);
        let cell = self
            .doc
            .insert_object(&self.cells, index, ObjType::Map)
            .unwrap();
        self.doc.put(&cell, "id", cell_id).unwrap();
        self.doc.put(&cell, "cell_type", cell_type).unwrap();
        let text = self.doc.put_object(&cell, "source", ObjType::Text).unwrap();
        self.doc.splice_text(&text, 0, 0, source).unwrap();
        self.doc.put(&cell, "execution_count", "null").unwrap();
        self.doc.put_object(&cell, "outputs", ObjType::List).unwrap();
        self.doc.put(&cell, "running", false).unwrap();
    }

    pub fn append_output(&mut self, cell_id: &str, output: &str) {
        let cell = self.cell(cell_id);
        let outputs = match self.doc.get(&cell, "outputs").unwrap() {
            Some((automerge::Value::Object(ObjType::List), id)) => id,
            _ => panic!("cell {} has no outputs list", cell_id),
        };
        let len = self.doc.length(&outputs);
        self.doc.insert(&outputs, len, output).unwrap();
    }

    pub fn set_execution_count(&mut self, cell_id: &str, count: &str) {
        let cell = self.cell(cell_id);
        self.doc.put(&cell, "execution_count", count).unwrap();
    }

    pub fn set_running(&mut self, cell_id: &str, running: bool) {
        let cell = self.cell(cell_id);
        self.doc.put(&cell, "running", running).unwrap();
    }

    pub fn generate_sync_message(&mut self, peer: &mut sync::State) -> Option<sync::Message> {
        self.doc.sync().generate_sync_message(peer)
    }

    pub fn receive_sync_message(
        &mut self,
        peer: &mut sync::State,
        message: sync::Message,
    ) -> Result<(), AutomergeError> {
        self.doc.sync().receive_sync_message(peer, message)
    }

    fn cell(&self, cell_id: &str) -> ObjId {
        let index = get_cells_from_doc(&self.doc)
            .iter()
            .position(|c| c.id == cell_id)
            .unwrap_or_else(|| panic!("no cell {}", cell_id));
        self.doc.get(&self.cells, index).unwrap().unwrap().1
    }
}

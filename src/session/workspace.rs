//! Open buffers of a session
//!
//! Buffers keep their opening order and have unique names. A buffer may be
//! open before its text is loaded; such a pending buffer has no document and
//! is left out of compilation.
//!
//! The aggregate revision never goes down: closing a buffer moves its
//! revision into a retired counter, so the sum over open buffers plus the
//! retired part keeps growing with every content change.

use std::collections::BTreeMap;

use thiserror::Error;

use super::notify::UnsavedChangesChoice;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    #[error("buffer '{0}' is already open")]
    DuplicateBuffer(String),

    #[error("buffer '{0}' is not open")]
    UnknownBuffer(String),
}

/// Loaded text and its edit counter. A fresh document is at revision 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    text: String,
    revision: u64,
}

impl Document {
    fn new(text: String) -> Self {
        Self { text, revision: 1 }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    name: String,
    document: Option<Document>,
    stored_text: String,
}

impl Buffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn text(&self) -> Option<&str> {
        self.document.as_ref().map(Document::text)
    }

    /// Zero while no document is attached.
    pub fn revision(&self) -> u64 {
        self.document.as_ref().map_or(0, Document::revision)
    }

    /// Bump the revision only when the text actually changes.
    fn replace_text(&mut self, text: String) -> u64 {
        match &mut self.document {
            Some(doc) => {
                if doc.text != text {
                    doc.text = text;
                    doc.revision += 1;
                }
                doc.revision
            }
            None => {
                self.document = Some(Document::new(text));
                1
            }
        }
    }

    /// True when the text differs from what was last saved.
    pub fn is_modified(&self) -> bool {
        self.document
            .as_ref()
            .is_some_and(|doc| doc.text != self.stored_text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// The buffer has unsaved changes; call `resolve_close` with a choice.
    NeedsDecision,
    Kept,
}

#[derive(Debug, Clone, Default)]
pub struct Workspace {
    buffers: Vec<Buffer>,
    main: Option<String>,
    retired: u64,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a buffer with loaded text. The text counts as saved.
    pub fn open(&mut self, name: &str, text: impl Into<String>) -> Result<(), WorkspaceError> {
        let text = text.into();
        self.insert(Buffer {
            name: name.to_string(),
            stored_text: text.clone(),
            document: Some(Document::new(text)),
        })
    }

    /// Open a buffer whose text is not loaded yet.
    pub fn open_pending(&mut self, name: &str) -> Result<(), WorkspaceError> {
        self.insert(Buffer {
            name: name.to_string(),
            document: None,
            stored_text: String::new(),
        })
    }

    /// Load text into a pending buffer, or replace the loaded text as saved text.
    ///
    /// Replacing different text counts as an edit. Returns the document revision.
    pub fn attach(&mut self, name: &str, text: impl Into<String>) -> Result<u64, WorkspaceError> {
        let buffer = self.buffer_mut(name)?;
        let text = text.into();
        buffer.stored_text = text.clone();
        Ok(buffer.replace_text(text))
    }

    /// Replace the text of a buffer. Returns the new document revision.
    pub fn edit(&mut self, name: &str, text: impl Into<String>) -> Result<u64, WorkspaceError> {
        Ok(self.buffer_mut(name)?.replace_text(text.into()))
    }

    /// Close a buffer unless it holds unsaved changes.
    pub fn close(&mut self, name: &str) -> Result<CloseOutcome, WorkspaceError> {
        if self.buffer(name).ok_or_else(|| unknown(name))?.is_modified() {
            return Ok(CloseOutcome::NeedsDecision);
        }
        self.remove(name);
        Ok(CloseOutcome::Closed)
    }

    pub fn resolve_close(
        &mut self,
        name: &str,
        choice: UnsavedChangesChoice,
    ) -> Result<CloseOutcome, WorkspaceError> {
        let buffer = self.buffer_mut(name)?;
        match choice {
            UnsavedChangesChoice::Save => {
                if let Some(doc) = &buffer.document {
                    buffer.stored_text = doc.text.clone();
                }
                self.remove(name);
                Ok(CloseOutcome::Closed)
            }
            UnsavedChangesChoice::Discard => {
                self.remove(name);
                Ok(CloseOutcome::Closed)
            }
            UnsavedChangesChoice::Cancel => Ok(CloseOutcome::Kept),
        }
    }

    /// Mark the buffer as saved.
    pub fn save(&mut self, name: &str) -> Result<(), WorkspaceError> {
        let buffer = self.buffer_mut(name)?;
        if let Some(doc) = &buffer.document {
            buffer.stored_text = doc.text.clone();
        }
        Ok(())
    }

    pub fn set_main(&mut self, name: &str) -> Result<(), WorkspaceError> {
        self.buffer(name).ok_or_else(|| unknown(name))?;
        self.main = Some(name.to_string());
        Ok(())
    }

    pub fn clear_main(&mut self) {
        self.main = None;
    }

    pub fn main(&self) -> Option<&str> {
        self.main.as_deref()
    }

    pub fn main_buffer(&self) -> Option<&Buffer> {
        self.main.as_deref().and_then(|name| self.buffer(name))
    }

    pub fn buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.name == name)
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Sum of all document revisions plus those of closed buffers.
    /// Any edit, attach or close raises it.
    pub fn revision(&self) -> u64 {
        self.retired + self.buffers.iter().map(Buffer::revision).sum::<u64>()
    }

    /// Text of every buffer with a loaded document, keyed by name.
    pub fn sources(&self) -> BTreeMap<String, String> {
        self.buffers
            .iter()
            .filter_map(|b| b.text().map(|text| (b.name.clone(), text.to_string())))
            .collect()
    }

    fn insert(&mut self, buffer: Buffer) -> Result<(), WorkspaceError> {
        if self.buffer(&buffer.name).is_some() {
            return Err(WorkspaceError::DuplicateBuffer(buffer.name));
        }
        self.buffers.push(buffer);
        Ok(())
    }

    fn remove(&mut self, name: &str) {
        if let Some(index) = self.buffers.iter().position(|b| b.name == name) {
            let buffer = self.buffers.remove(index);
            self.retired += buffer.revision() + 1;
        }
        if self.main.as_deref() == Some(name) {
            self.main = None;
        }
    }

    fn buffer_mut(&mut self, name: &str) -> Result<&mut Buffer, WorkspaceError> {
        self.buffers
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| unknown(name))
    }
}

fn unknown(name: &str) -> WorkspaceError {
    WorkspaceError::UnknownBuffer(name.to_string())
}
